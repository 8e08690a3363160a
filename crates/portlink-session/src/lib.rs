//! Endpoint session management for addressed messaging.
//!
//! Provides:
//! - `EndpointSessionManager` - Connect, send, disconnect and reconnect one endpoint
//! - `ReconnectPolicy` and the pure connection state machine
//! - `Supervisor` - Coarse polling backstop above the backoff

pub mod manager;
pub mod reconnect;
pub mod supervisor;

pub use manager::{EndpointSessionManager, ManagerBuilder, ManagerError};
pub use reconnect::{ConnectionStatus, ReconnectPolicy};
pub use supervisor::{Supervisor, SupervisorConfig};
