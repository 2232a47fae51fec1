//! Orchestrator-side dispatch: the handshake coordinator, the fallback
//! dispatcher layered on it, and the provider policy they consult.

pub mod coordinator;
pub mod dispatcher;
pub mod events;
pub mod policy;

pub use coordinator::{Coordinator, DispatchSettings, Phase};
pub use dispatcher::{DispatchRequest, FallbackDispatcher};
pub use events::DispatchEvent;
pub use policy::{CapabilityPolicy, PolicyTable, Provider, ProviderChain, ProviderPolicy};
