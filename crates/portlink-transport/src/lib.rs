//! Transports that carry sessions between endpoints and the hub.
//!
//! Provides:
//! - In-process transport bound to a hub handle
//! - WebSocket accept side (feature: websocket)

pub mod memory;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::MemoryTransport;
#[cfg(feature = "websocket")]
pub use websocket::{ConnectParams, create_ws_router};
