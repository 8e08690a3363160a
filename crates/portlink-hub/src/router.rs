//! Hub router.
//!
//! Accepts sessions from any endpoint, keeps the directory of live sessions
//! keyed by address and forwards raw envelopes to their targets. All
//! directory mutations happen on the router's single event loop.

use std::{collections::HashMap, sync::Arc};

use portlink_core::{
    Address, Clock, CloseReason, Envelope, MessageHandler, NoopHandler, OutgoingMessage, Session,
    SessionEvent, SessionId, SystemClock, invoke_handler,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

/// Router error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("Router stopped")]
    Stopped,
}

/// Hub configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// The hub's own address.
    pub address: Address,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            address: Address::Hub,
        }
    }
}

/// Why an envelope was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No session is registered for the target.
    UnknownTarget,
    /// Source or target is `undefined`.
    UnassignedAddress,
    /// Source differs from the address the session registered under.
    SourceMismatch,
    /// Not a well-formed envelope.
    Malformed,
}

/// Optional hook notified of dropped envelopes.
///
/// Drops are silent towards senders either way; this only makes them
/// observable to the hub's owner.
pub trait RouteObserver: Send + Sync {
    /// Called for every dropped envelope.
    fn on_drop(&self, reason: DropReason, raw: &str);
}

enum Control {
    Accept(Session),
    Send {
        target: Address,
        message: OutgoingMessage,
    },
    Directory(oneshot::Sender<Vec<Address>>),
    Shutdown,
}

enum SessionNotice {
    Message {
        session_id: SessionId,
        address: Address,
        raw: String,
    },
    Closed {
        session_id: SessionId,
        address: Address,
        reason: CloseReason,
    },
}

struct Registration {
    session: Session,
    reader: JoinHandle<()>,
}

/// Handle to a running router.
#[derive(Clone)]
pub struct HubHandle {
    address: Address,
    control: mpsc::UnboundedSender<Control>,
}

impl HubHandle {
    /// The hub's own address.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Hand an inbound session to the router.
    ///
    /// # Errors
    /// Returns error if the router stopped.
    pub fn accept(&self, session: Session) -> Result<(), RouterError> {
        self.control
            .send(Control::Accept(session))
            .map_err(|_| RouterError::Stopped)
    }

    /// Send a message from the hub itself.
    ///
    /// Delivery is best-effort: an absent target drops the message.
    ///
    /// # Errors
    /// Returns error if the router stopped.
    pub fn send(&self, target: Address, message: OutgoingMessage) -> Result<(), RouterError> {
        self.control
            .send(Control::Send { target, message })
            .map_err(|_| RouterError::Stopped)
    }

    /// Addresses with a registered session, sorted.
    ///
    /// # Errors
    /// Returns error if the router stopped.
    pub async fn directory(&self) -> Result<Vec<Address>, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Directory(tx))
            .map_err(|_| RouterError::Stopped)?;
        rx.await.map_err(|_| RouterError::Stopped)
    }

    /// Stop the router. Registered sessions are closed.
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }
}

/// The hub's router. Create with [`HubRouter::new`], then [`run`](Self::run)
/// or [`spawn`](Self::spawn) it.
pub struct HubRouter {
    config: HubConfig,
    handler: Arc<dyn MessageHandler>,
    observer: Option<Arc<dyn RouteObserver>>,
    clock: Arc<dyn Clock>,
    directory: HashMap<Address, Registration>,
    /// Replaced sessions stay open until their own transport closes them.
    superseded: HashMap<SessionId, Registration>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    notice_rx: mpsc::UnboundedReceiver<SessionNotice>,
    last_timestamp: u64,
}

impl HubRouter {
    /// Create a router. Envelopes for the hub are ignored until a handler
    /// is attached with [`with_handler`](Self::with_handler).
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let router = Self {
            config,
            handler: Arc::new(NoopHandler),
            observer: None,
            clock: Arc::new(SystemClock),
            directory: HashMap::new(),
            superseded: HashMap::new(),
            control_rx,
            notice_tx,
            notice_rx,
            last_timestamp: 0,
        };
        let handle = HubHandle {
            address: config.address,
            control: control_tx,
        };
        (router, handle)
    }

    /// Handler for envelopes addressed to the hub.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Attach a drop observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RouteObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Clock used to stamp hub-originated envelopes.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run the router on a new task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process events until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(address = %self.config.address, "Hub router started");
        loop {
            // Control first: a queued registration must apply before any
            // notice that arrived after it.
            tokio::select! {
                biased;
                control = self.control_rx.recv() => match control {
                    Some(Control::Accept(session)) => self.register(session),
                    Some(Control::Send { target, message }) => self.send_local(target, message),
                    Some(Control::Directory(reply)) => {
                        let mut addresses: Vec<Address> = self.directory.keys().copied().collect();
                        addresses.sort();
                        let _ = reply.send(addresses);
                    }
                    Some(Control::Shutdown) | None => break,
                },
                Some(notice) = self.notice_rx.recv() => match notice {
                    SessionNotice::Message { session_id, address, raw } => {
                        self.route(session_id, address, &raw);
                    }
                    SessionNotice::Closed { session_id, address, reason } => {
                        self.unregister(session_id, address, &reason);
                    }
                },
            }
        }

        for registration in self.directory.values().chain(self.superseded.values()) {
            registration.session.close(CloseReason::Local);
            registration.reader.abort();
        }
        tracing::info!(address = %self.config.address, "Hub router stopped");
    }

    fn register(&mut self, mut session: Session) {
        let address = session.address();
        let session_id = session.id();
        if !address.is_routable() || address == self.config.address {
            tracing::warn!(%address, %session_id, "Rejecting session with unusable address");
            session.close(CloseReason::Local);
            return;
        }
        let Some(mut events) = session.take_events() else {
            tracing::warn!(%address, %session_id, "Rejecting session without event subscription");
            return;
        };

        let notices = self.notice_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let notice = match event {
                    SessionEvent::Message(raw) => SessionNotice::Message {
                        session_id,
                        address,
                        raw,
                    },
                    SessionEvent::Closed(reason) => SessionNotice::Closed {
                        session_id,
                        address,
                        reason,
                    },
                };
                if notices.send(notice).is_err() {
                    break;
                }
            }
        });

        let registration = Registration { session, reader };
        if let Some(old) = self.directory.insert(address, registration) {
            tracing::info!(
                %address,
                old = %old.session.id(),
                new = %session_id,
                "Session replaced"
            );
            self.superseded.insert(old.session.id(), old);
        } else {
            tracing::info!(%address, %session_id, "Session registered");
        }
    }

    fn unregister(&mut self, session_id: SessionId, address: Address, reason: &CloseReason) {
        if self.superseded.remove(&session_id).is_some() {
            tracing::debug!(%address, %session_id, "Superseded session closed");
            return;
        }
        if self
            .directory
            .get(&address)
            .is_some_and(|r| r.session.id() == session_id)
        {
            self.directory.remove(&address);
            tracing::info!(%address, %session_id, ?reason, "Session unregistered");
        }
    }

    fn route(&self, session_id: SessionId, address: Address, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%address, %session_id, "Malformed envelope: {e}");
                self.dropped(DropReason::Malformed, raw);
                return;
            }
        };

        if !envelope.source.is_routable() || !envelope.target.is_routable() {
            self.dropped(DropReason::UnassignedAddress, raw);
            return;
        }
        if envelope.source != address {
            tracing::warn!(
                %address,
                claimed = %envelope.source,
                "Envelope source does not match session address"
            );
            self.dropped(DropReason::SourceMismatch, raw);
            return;
        }

        if envelope.target == self.config.address {
            tracing::debug!(from = %envelope.source, kind = %envelope.kind, "Delivering to hub");
            invoke_handler(self.handler.as_ref(), &envelope);
        } else {
            self.forward(&envelope, raw.to_string());
        }
    }

    fn send_local(&mut self, target: Address, message: OutgoingMessage) {
        if !target.is_routable() {
            tracing::warn!(%target, "Hub cannot send to an unassigned address");
            return;
        }
        let timestamp = self.clock.now_millis().max(self.last_timestamp);
        self.last_timestamp = timestamp;
        let envelope = message.into_envelope(self.config.address, target, timestamp);

        if target == self.config.address {
            invoke_handler(self.handler.as_ref(), &envelope);
            return;
        }
        match envelope.encode() {
            Ok(raw) => self.forward(&envelope, raw),
            Err(e) => tracing::error!(%target, "Failed to encode hub message: {e}"),
        }
    }

    fn forward(&self, envelope: &Envelope, raw: String) {
        let Some(registration) = self.directory.get(&envelope.target) else {
            tracing::trace!(
                target_addr = %envelope.target,
                kind = %envelope.kind,
                "No session for target"
            );
            self.dropped(DropReason::UnknownTarget, &raw);
            return;
        };
        match registration.session.send(raw) {
            Ok(()) => tracing::trace!(
                from = %envelope.source,
                target_addr = %envelope.target,
                kind = %envelope.kind,
                "Forwarded"
            ),
            // The close notice will unregister it.
            Err(e) => tracing::debug!(target_addr = %envelope.target, "Forward failed: {e}"),
        }
    }

    fn dropped(&self, reason: DropReason, raw: &str) {
        if let Some(observer) = &self.observer {
            observer.on_drop(reason, raw);
        }
    }
}
