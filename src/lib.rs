pub mod cleanup;
pub mod config;
pub mod core;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod log;
pub mod medium;
pub mod orchestration;
pub mod util;
pub mod worker;

pub use error::{Error, FailureKind, Result};
