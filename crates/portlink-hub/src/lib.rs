//! Hub router for addressed endpoint messaging.
//!
//! Provides:
//! - `HubRouter` - Directory of live sessions and envelope forwarding
//! - `HubHandle` - Accept sessions, send as the hub, inspect the directory
//! - `RouteObserver` - Optional hook for dropped envelopes

pub mod router;

pub use router::{DropReason, HubConfig, HubHandle, HubRouter, RouteObserver, RouterError};
