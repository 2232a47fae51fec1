//! Core domain records shared by every layer.
//!
//! Task and request identifiers, plus the descriptor/artifact pair that makes
//! up one handshake with an external worker.

pub mod ids;
pub mod records;

pub use ids::{RequestId, TaskId};
pub use records::{ArtifactStatus, ResultArtifact, TaskDescriptor};
pub(crate) use records::{after, until};
