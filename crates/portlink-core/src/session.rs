//! One physical connection between two endpoints.
//!
//! A [`Session`] is one half of a link created by [`Session::pair`]. Each half
//! can send raw envelopes to the other and exposes a single consumable
//! [`SessionEvents`] subscription that yields inbound messages followed by
//! exactly one terminal [`SessionEvent::Closed`].
//!
//! Sessions are never resurrected: once closed, a new pair is created.

use std::sync::Arc;

use tokio::sync::{
    mpsc::{self, error::TryRecvError},
    watch,
};
use uuid::Uuid;

use crate::Address;

/// Session identifier, shared by both halves of a link.
pub type SessionId = Uuid;

/// Session error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("Session not connected")]
    NotConnected,
    #[error("Transport closed")]
    TransportClosed,
}

/// Lifecycle of a single session instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    /// Terminal.
    Disconnected,
}

/// Why a session closed, as seen from the observing half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// This half closed it.
    Local,
    /// The other half closed it.
    Remote,
    /// The underlying transport failed.
    TransportLost(String),
    /// The host tore the endpoint's context down for good.
    ContextInvalidated,
}

impl CloseReason {
    /// Whether the close was not requested by the observing half.
    #[must_use]
    pub const fn is_unsolicited(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

/// Event observed on a session subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A raw envelope arrived.
    Message(String),
    /// The session closed. Emitted once, last.
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Near,
    Far,
}

#[derive(Debug, Clone)]
struct Closure {
    by: Side,
    reason: CloseReason,
}

#[derive(Debug, Clone, Default)]
struct LinkState {
    established: bool,
    closure: Option<Closure>,
}

fn observed_reason(side: Side, closure: &Closure) -> CloseReason {
    match (&closure.reason, closure.by == side) {
        (CloseReason::Local, false) => CloseReason::Remote,
        (reason, _) => reason.clone(),
    }
}

/// One half of a session link.
///
/// Dropping a half closes the link.
pub struct Session {
    id: SessionId,
    address: Address,
    side: Side,
    link: Arc<watch::Sender<LinkState>>,
    outbound: mpsc::UnboundedSender<String>,
    events: Option<SessionEvents>,
}

impl Session {
    /// Create both halves of a new link named after `address`.
    ///
    /// The link starts out connecting; the transport calls
    /// [`Session::establish`] once the open succeeded.
    #[must_use]
    pub fn pair(address: Address) -> (Self, Self) {
        let id = Uuid::new_v4();
        let (link, _) = watch::channel(LinkState::default());
        let link = Arc::new(link);
        let (near_tx, far_rx) = mpsc::unbounded_channel();
        let (far_tx, near_rx) = mpsc::unbounded_channel();

        let half = |side, outbound, inbound| Self {
            id,
            address,
            side,
            link: Arc::clone(&link),
            outbound,
            events: Some(SessionEvents {
                side,
                inbound,
                inbound_open: true,
                link: link.subscribe(),
                done: false,
            }),
        };

        (
            half(Side::Near, near_tx, near_rx),
            half(Side::Far, far_tx, far_rx),
        )
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Address the session was opened under.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        let link = self.link.borrow();
        if link.closure.is_some() {
            SessionState::Disconnected
        } else if link.established {
            SessionState::Connected
        } else {
            SessionState::Connecting
        }
    }

    /// Whether the session can carry messages.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Mark the link connected. Returns false if it already closed.
    pub fn establish(&self) -> bool {
        self.link.send_if_modified(|link| {
            if link.closure.is_some() || link.established {
                return false;
            }
            link.established = true;
            true
        });
        self.is_connected()
    }

    /// Send a raw envelope to the other half.
    ///
    /// # Errors
    /// Returns `NotConnected` before the link is established and
    /// `TransportClosed` once it has closed.
    pub fn send(&self, raw: String) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Connecting => Err(SessionError::NotConnected),
            SessionState::Disconnected => Err(SessionError::TransportClosed),
            SessionState::Connected => self
                .outbound
                .send(raw)
                .map_err(|_| SessionError::TransportClosed),
        }
    }

    /// Close the link. Returns false if it was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        let by = self.side;
        self.link.send_if_modified(|link| {
            if link.closure.is_some() {
                return false;
            }
            link.closure = Some(Closure { by, reason });
            true
        })
    }

    /// Take the event subscription. Only the first call returns `Some`.
    pub fn take_events(&mut self) -> Option<SessionEvents> {
        self.events.take()
    }

    /// Wait until the link closes.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.link.subscribe();
        let side = self.side;
        let reason = match rx.wait_for(|link| link.closure.is_some()).await {
            Ok(link) => link.closure.as_ref().map(|c| observed_reason(side, c)),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| CloseReason::TransportLost("link dropped".to_string()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close(CloseReason::Local);
    }
}

/// Consumable event subscription of one session half.
pub struct SessionEvents {
    side: Side,
    inbound: mpsc::UnboundedReceiver<String>,
    inbound_open: bool,
    link: watch::Receiver<LinkState>,
    done: bool,
}

impl SessionEvents {
    /// Next event, or `None` after the `Closed` event was delivered.
    ///
    /// Messages queued before the close are delivered before it.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        if self.done {
            return None;
        }
        loop {
            if self.inbound_open {
                match self.inbound.try_recv() {
                    Ok(raw) => return Some(SessionEvent::Message(raw)),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => self.inbound_open = false,
                }
            }

            let closure = self.link.borrow_and_update().closure.clone();
            if let Some(closure) = closure {
                self.done = true;
                return Some(SessionEvent::Closed(observed_reason(self.side, &closure)));
            }

            tokio::select! {
                msg = self.inbound.recv(), if self.inbound_open => match msg {
                    Some(raw) => return Some(SessionEvent::Message(raw)),
                    None => self.inbound_open = false,
                },
                changed = self.link.changed() => {
                    if changed.is_err() {
                        self.done = true;
                        return Some(SessionEvent::Closed(CloseReason::TransportLost(
                            "link dropped".to_string(),
                        )));
                    }
                }
            }
        }
    }

    /// Adapt the subscription into a stream.
    pub fn into_stream(self) -> futures::stream::BoxStream<'static, SessionEvent> {
        Box::pin(futures::stream::unfold(self, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        }))
    }
}
