//! Core abstractions for addressed endpoint messaging.
//!
//! This crate provides the fundamental building blocks:
//! - `Address` - Logical endpoint names
//! - `Envelope` - Routed message shape and codec
//! - `Session` - One physical link, consumed as an event subscription
//! - `Transport`, `Clock` and `MessageHandler` traits

pub mod address;
pub mod clock;
pub mod envelope;
pub mod session;
pub mod traits;

pub use address::{Address, AddressError};
pub use clock::{Clock, SystemClock};
pub use envelope::{
    CodecError, Envelope, MessageKind, OutgoingMessage, PanelNotice, PeerIdResponse, PeerInfo,
    WindowFocus,
};
pub use session::{
    CloseReason, Session, SessionError, SessionEvent, SessionEvents, SessionId, SessionState,
};
pub use traits::{HandlerError, MessageHandler, NoopHandler, Transport, invoke_handler};
