//! Core traits for transports and message handlers.

use std::panic::{AssertUnwindSafe, catch_unwind};

use async_trait::async_trait;
use thiserror::Error;

use crate::{Address, Envelope, Session, SessionError};

/// Trait for transports that open sessions to the hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new session named after `address`.
    ///
    /// The returned session is established. Failures surface as
    /// [`SessionError::TransportUnavailable`].
    async fn open(&self, address: Address) -> Result<Session, SessionError>;
}

/// Application handler error.
#[derive(Debug, Error)]
#[error("Handler error: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a handler error from any displayable value.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Trait for application message handlers.
///
/// Runs on the event-processing path, so implementations must return
/// quickly and never block.
pub trait MessageHandler: Send + Sync {
    /// Handle one envelope addressed to the owning endpoint.
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

/// Handler that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl MessageHandler for NoopHandler {
    fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Invoke a handler, logging errors and panics instead of propagating them.
///
/// Returns true if the handler succeeded.
pub fn invoke_handler(handler: &dyn MessageHandler, envelope: &Envelope) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(envelope))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(
                target_addr = %envelope.target,
                kind = %envelope.kind,
                "Error in message handler: {e}"
            );
            false
        }
        Err(_) => {
            tracing::error!(
                target_addr = %envelope.target,
                kind = %envelope.kind,
                "Message handler panicked"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{MessageKind, OutgoingMessage};

    fn ping() -> Envelope {
        OutgoingMessage::bare(MessageKind::Ping).into_envelope(Address::Peer(1), Address::Hub, 0)
    }

    #[test]
    fn test_closure_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler = move |_: &Envelope| -> Result<(), HandlerError> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        assert!(invoke_handler(&handler, &ping()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_error_contained() {
        let handler =
            |_: &Envelope| -> Result<(), HandlerError> { Err(HandlerError::new("boom")) };
        assert!(!invoke_handler(&handler, &ping()));
    }

    #[test]
    fn test_handler_panic_contained() {
        let handler = |_: &Envelope| -> Result<(), HandlerError> { panic!("boom") };
        assert!(!invoke_handler(&handler, &ping()));
    }
}
