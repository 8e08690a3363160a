//! Endpoint session manager.
//!
//! Owns the current [`Session`] of one logical endpoint, stamps outgoing
//! envelopes, filters inbound ones by address and reconnects with bounded
//! exponential backoff after unsolicited closes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use portlink_core::{
    Address, Clock, CloseReason, CodecError, Envelope, MessageHandler, NoopHandler,
    OutgoingMessage, Session, SessionError, SessionEvent, SessionEvents, SessionId, SystemClock,
    Transport, invoke_handler,
};
use tokio::task::JoinHandle;

use crate::reconnect::{
    ConnectionEvent, ConnectionState, ConnectionStatus, Effect, ReconnectPolicy,
};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] SessionError),
    #[error("No active connection")]
    NotConnected,
    #[error("Send failed: {0}")]
    SendFailed(#[source] SessionError),
    #[error("Max reconnection attempts reached ({attempts})")]
    MaxReconnectAttemptsExceeded { attempts: u32 },
    /// `connect` was called while the own address is still `undefined`;
    /// no transport open is attempted.
    #[error("Address not assigned")]
    Unassigned,
    #[error("Invalid target: {0}")]
    InvalidTarget(Address),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Superseded by a newer connect or disconnect")]
    Superseded,
}

struct ActiveSession {
    session: Session,
    pump: JoinHandle<()>,
}

struct ManagerState {
    address: Address,
    conn: ConnectionState,
    current: Option<ActiveSession>,
    /// Bumped by every explicit connect and disconnect; pending automatic
    /// reconnects from an older epoch are void.
    epoch: u64,
    last_timestamp: u64,
    exhausted: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    clock: Arc<dyn Clock>,
    policy: ReconnectPolicy,
    state: Mutex<ManagerState>,
}

/// Builder for [`EndpointSessionManager`].
pub struct ManagerBuilder {
    address: Address,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    clock: Arc<dyn Clock>,
    policy: Option<ReconnectPolicy>,
}

impl ManagerBuilder {
    /// Handler for envelopes addressed to this endpoint.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Override the role-derived reconnect policy.
    #[must_use]
    pub const fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Clock used for timestamps and backoff waits.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the manager. It starts disconnected.
    #[must_use]
    pub fn build(self) -> EndpointSessionManager {
        let policy = self
            .policy
            .unwrap_or_else(|| ReconnectPolicy::for_address(&self.address));
        EndpointSessionManager {
            inner: Arc::new(Inner {
                transport: self.transport,
                handler: self.handler,
                clock: self.clock,
                policy,
                state: Mutex::new(ManagerState {
                    address: self.address,
                    conn: ConnectionState::default(),
                    current: None,
                    epoch: 0,
                    last_timestamp: 0,
                    exhausted: false,
                }),
            }),
        }
    }
}

/// Per-endpoint wrapper around the current session.
///
/// Cheap to clone; clones share state. `connect` must not race with itself:
/// callers serialize explicit connects and supervisory polling.
#[derive(Clone)]
pub struct EndpointSessionManager {
    inner: Arc<Inner>,
}

impl EndpointSessionManager {
    /// Start building a manager for `address` on top of `transport`.
    #[must_use]
    pub fn builder(address: Address, transport: Arc<dyn Transport>) -> ManagerBuilder {
        ManagerBuilder {
            address,
            transport,
            handler: Arc::new(NoopHandler),
            clock: Arc::new(SystemClock),
            policy: None,
        }
    }

    /// Manager with default handler, clock and policy.
    #[must_use]
    pub fn new(address: Address, transport: Arc<dyn Transport>) -> Self {
        Self::builder(address, transport).build()
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This endpoint's own address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.lock().address
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.lock().conn.status
    }

    /// Automatic attempts made since the last successful connect.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().conn.reconnect_attempts
    }

    /// Whether automatic reconnection gave up; cleared by the next `connect`.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted
    }

    /// Active reconnect policy.
    #[must_use]
    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Tear down any existing session and open a new one.
    ///
    /// # Errors
    /// Returns `ConnectionFailed` if the transport cannot open a session,
    /// leaving the manager disconnected.
    pub async fn connect(&self) -> Result<(), ManagerError> {
        let (epoch, address) = {
            let mut state = self.lock();
            state.epoch += 1;
            Self::teardown(&mut state);
            (state.epoch, state.address)
        };
        self.open(epoch, address, false).await
    }

    /// Adopt a new own address, then connect under it.
    ///
    /// # Errors
    /// Same as [`connect`](Self::connect).
    pub async fn connect_as(&self, address: Address) -> Result<(), ManagerError> {
        {
            let mut state = self.lock();
            if state.address != address {
                tracing::info!(from = %state.address, to = %address, "Rebinding endpoint address");
                state.address = address;
            }
        }
        self.connect().await
    }

    /// Close the current session without triggering reconnection.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        let had_session = Self::teardown(&mut state);
        self.apply(&mut state, ConnectionEvent::Disconnected);
        if had_session {
            tracing::info!(address = %state.address, "Disconnected");
        }
    }

    /// Stamp and send a message to `target`.
    ///
    /// # Errors
    /// Returns `NotConnected` unless connected, and `SendFailed` if the
    /// session rejects the envelope; the latter is handled like an
    /// unsolicited close.
    ///
    /// # Panics
    /// Must be called within a Tokio runtime: a failed send may schedule a
    /// reconnect with `tokio::spawn`.
    pub fn send(&self, target: Address, message: OutgoingMessage) -> Result<(), ManagerError> {
        if !target.is_routable() {
            return Err(ManagerError::InvalidTarget(target));
        }

        let (session_id, result) = {
            let mut state = self.lock();
            if state.conn.status != ConnectionStatus::Connected {
                return Err(ManagerError::NotConnected);
            }
            let timestamp = self.inner.clock.now_millis().max(state.last_timestamp);
            state.last_timestamp = timestamp;
            let source = state.address;
            let Some(active) = state.current.as_ref() else {
                return Err(ManagerError::NotConnected);
            };

            let kind = message.kind.clone();
            let raw = message.into_envelope(source, target, timestamp).encode()?;
            let result = active.session.send(raw);
            if result.is_ok() {
                tracing::debug!(address = %source, target_addr = %target, %kind, "Message sent");
            }
            (active.session.id(), result)
        };

        result.map_err(|e| {
            tracing::error!("Message sending failed: {e}");
            self.on_lost(session_id, &CloseReason::TransportLost(e.to_string()));
            ManagerError::SendFailed(e)
        })
    }

    async fn open(
        &self,
        epoch: u64,
        address: Address,
        automatic: bool,
    ) -> Result<(), ManagerError> {
        {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Err(ManagerError::Superseded);
            }
            state.exhausted = false;
            self.apply(&mut state, ConnectionEvent::ConnectStarted);
        }

        if !address.is_routable() {
            let mut state = self.lock();
            self.apply(&mut state, ConnectionEvent::ConnectFailed { automatic: false });
            return Err(ManagerError::Unassigned);
        }

        match self.inner.transport.open(address).await {
            Ok(mut session) => {
                let mut state = self.lock();
                if state.epoch != epoch {
                    drop(state);
                    session.close(CloseReason::Local);
                    tracing::debug!(%address, "Discarding session opened after teardown");
                    return Err(ManagerError::Superseded);
                }

                let pump = session.take_events().map_or_else(
                    || tokio::spawn(async {}),
                    |events| {
                        tokio::spawn(pump(Arc::downgrade(&self.inner), session.id(), events))
                    },
                );
                tracing::info!(%address, session_id = %session.id(), "Connected successfully");
                state.current = Some(ActiveSession { session, pump });
                self.apply(&mut state, ConnectionEvent::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::error!(%address, "Connection error: {e}");
                let mut state = self.lock();
                if state.epoch != epoch {
                    return Err(ManagerError::Superseded);
                }
                self.apply(&mut state, ConnectionEvent::ConnectFailed { automatic });
                Err(ManagerError::ConnectionFailed(e))
            }
        }
    }

    async fn reconnect(&self, epoch: u64) {
        let address = {
            let state = self.lock();
            if state.epoch != epoch {
                tracing::debug!(address = %state.address, "Pending reconnect suppressed");
                return;
            }
            state.address
        };
        if let Err(e) = self.open(epoch, address, true).await {
            tracing::debug!(%address, "Reconnect attempt did not connect: {e}");
        }
    }

    /// Close and forget the current session. Returns true if there was one.
    fn teardown(state: &mut ManagerState) -> bool {
        state.current.take().is_some_and(|active| {
            active.session.close(CloseReason::Local);
            active.pump.abort();
            true
        })
    }

    /// Run one state machine transition and carry out its effect.
    fn apply(&self, state: &mut ManagerState, event: ConnectionEvent) {
        let (next, effect) = state.conn.transition(event, &self.inner.policy);
        state.conn = next;
        match effect {
            Some(Effect::ScheduleReconnect { attempt, delay }) => {
                tracing::debug!(
                    address = %state.address,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Attempting reconnection"
                );
                let manager = self.clone();
                let epoch = state.epoch;
                tokio::spawn(async move {
                    manager.inner.clock.sleep(delay).await;
                    manager.reconnect(epoch).await;
                });
            }
            Some(Effect::GiveUp { attempts }) => {
                state.exhausted = true;
                let err = ManagerError::MaxReconnectAttemptsExceeded { attempts };
                tracing::error!(address = %state.address, "{err}");
            }
            None => {}
        }
    }

    fn on_lost(&self, session_id: SessionId, reason: &CloseReason) {
        let mut state = self.lock();
        if state.current.as_ref().map(|a| a.session.id()) != Some(session_id) {
            return;
        }
        // The pump is either running this or already done.
        if let Some(active) = state.current.take() {
            active.session.close(CloseReason::Local);
        }

        let invalidated = *reason == CloseReason::ContextInvalidated;
        if invalidated {
            tracing::warn!(address = %state.address, "Endpoint context invalidated");
        } else {
            tracing::info!(address = %state.address, ?reason, "Session closed");
        }
        self.apply(&mut state, ConnectionEvent::Lost { invalidated });
    }

    fn on_message(&self, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping malformed envelope: {e}");
                return;
            }
        };

        let address = self.address();
        if envelope.target != address {
            tracing::trace!(
                %address,
                target_addr = %envelope.target,
                "Not the recipient, dropping"
            );
            return;
        }

        tracing::debug!(
            %address,
            from = %envelope.source,
            kind = %envelope.kind,
            "Message received"
        );
        invoke_handler(self.inner.handler.as_ref(), &envelope);
    }
}

async fn pump(inner: Weak<Inner>, session_id: SessionId, mut events: SessionEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = EndpointSessionManager { inner };
        match event {
            SessionEvent::Message(raw) => manager.on_message(&raw),
            SessionEvent::Closed(reason) => {
                if reason.is_unsolicited() {
                    manager.on_lost(session_id, &reason);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use portlink_core::{HandlerError, MessageKind, SessionState};
    use tokio::sync::{Notify, Semaphore, mpsc};
    use tokio_test::assert_ok;

    use super::*;

    /// Transport whose far halves are handed to the test.
    struct TestTransport {
        far_tx: mpsc::UnboundedSender<Session>,
        available: AtomicBool,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Transport for TestTransport {
        async fn open(&self, address: Address) -> Result<Session, SessionError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if !self.available.load(Ordering::SeqCst) {
                return Err(SessionError::TransportUnavailable("down".to_string()));
            }
            let (near, far) = Session::pair(address);
            near.establish();
            let _ = self.far_tx.send(far);
            Ok(near)
        }
    }

    /// Transport that holds every open until the test releases it.
    struct GatedTransport {
        entered: Notify,
        release: Semaphore,
        far_tx: mpsc::UnboundedSender<Session>,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn open(&self, address: Address) -> Result<Session, SessionError> {
            self.entered.notify_one();
            self.release.acquire().await.unwrap().forget();
            let (near, far) = Session::pair(address);
            near.establish();
            let _ = self.far_tx.send(far);
            Ok(near)
        }
    }

    /// Clock that records waits and optionally blocks them on a gate.
    #[derive(Default)]
    struct TestClock {
        now: AtomicU64,
        sleeps: Mutex<Vec<Duration>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl TestClock {
        fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            match &self.gate {
                Some(gate) => gate.acquire().await.unwrap().forget(),
                None => tokio::task::yield_now().await,
            }
        }
    }

    struct Harness {
        manager: EndpointSessionManager,
        transport: Arc<TestTransport>,
        clock: Arc<TestClock>,
        far_rx: mpsc::UnboundedReceiver<Session>,
        received: Arc<Mutex<Vec<Envelope>>>,
    }

    fn harness_with(
        address: Address,
        clock: TestClock,
        policy: Option<ReconnectPolicy>,
    ) -> Harness {
        let (far_tx, far_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(TestTransport {
            far_tx,
            available: AtomicBool::new(true),
            opens: AtomicUsize::new(0),
        });
        let clock = Arc::new(clock);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handler = move |envelope: &Envelope| {
            sink.lock().unwrap().push(envelope.clone());
            if envelope.kind == "EXPLODE" {
                return Err(HandlerError::new("exploded"));
            }
            Ok(())
        };
        let mut builder = EndpointSessionManager::builder(address, transport.clone())
            .handler(Arc::new(handler))
            .clock(clock.clone());
        if let Some(policy) = policy {
            builder = builder.policy(policy);
        }
        Harness {
            manager: builder.build(),
            transport,
            clock,
            far_rx,
            received,
        }
    }

    fn harness(address: Address) -> Harness {
        harness_with(address, TestClock::default(), None)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    fn deliver(far: &Session, kind: &str, source: Address, target: Address) {
        let raw = OutgoingMessage::raw(kind, serde_json::Value::Null)
            .into_envelope(source, target, 1)
            .encode()
            .unwrap();
        far.send(raw).unwrap();
    }

    #[tokio::test]
    async fn test_connect_success() {
        let mut h = harness(Address::Peer(1));
        assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
        assert_ok!(h.manager.connect().await);
        assert_eq!(h.manager.status(), ConnectionStatus::Connected);
        assert_eq!(h.manager.reconnect_attempts(), 0);
        let far = h.far_rx.recv().await.unwrap();
        assert_eq!(far.address(), Address::Peer(1));
    }

    #[tokio::test]
    async fn test_explicit_connect_failure_does_not_retry() {
        let h = harness(Address::Peer(1));
        h.transport.available.store(false, Ordering::SeqCst);
        let err = h.manager.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::ConnectionFailed(SessionError::TransportUnavailable(_))
        ));
        assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
        tokio::task::yield_now().await;
        assert!(h.clock.sleeps().is_empty());
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unassigned_cannot_connect() {
        let h = harness(Address::Unassigned);
        assert!(matches!(h.manager.connect().await, Err(ManagerError::Unassigned)));
        assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let h = harness(Address::Peer(1));
        let err = h
            .manager
            .send(Address::Hub, OutgoingMessage::bare(MessageKind::Ping))
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotConnected));
    }

    #[tokio::test]
    async fn test_send_stamps_envelope() {
        let mut h = harness(Address::Peer(1));
        assert_ok!(h.manager.connect().await);
        let mut far = h.far_rx.recv().await.unwrap();
        let mut events = far.take_events().unwrap();

        h.clock.now.store(500, Ordering::SeqCst);
        h.manager
            .send(Address::Peer(2), OutgoingMessage::bare(MessageKind::Ping))
            .unwrap();
        // Wall clock stepping backwards must not reorder timestamps.
        h.clock.now.store(400, Ordering::SeqCst);
        h.manager
            .send(Address::Panel, OutgoingMessage::raw("CUSTOM", serde_json::json!({"a": 1})))
            .unwrap();

        let mut envelopes = Vec::new();
        for _ in 0..2 {
            let Some(SessionEvent::Message(raw)) = events.recv().await else {
                panic!("expected message");
            };
            envelopes.push(Envelope::decode(&raw).unwrap());
        }
        assert_eq!(envelopes[0].source, Address::Peer(1));
        assert_eq!(envelopes[0].target, Address::Peer(2));
        assert_eq!(envelopes[0].kind, "PING");
        assert_eq!(envelopes[0].timestamp, 500);
        assert_eq!(envelopes[1].target, Address::Panel);
        assert_eq!(envelopes[1].payload["a"], 1);
        assert_eq!(envelopes[1].timestamp, 500);
    }

    #[tokio::test]
    async fn test_send_to_unassigned_rejected() {
        let h = harness(Address::Peer(1));
        assert_ok!(h.manager.connect().await);
        let err = h
            .manager
            .send(Address::Unassigned, OutgoingMessage::bare(MessageKind::Ping))
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidTarget(Address::Unassigned)));
    }

    #[tokio::test]
    async fn test_inbound_filtered_by_target() {
        let mut h = harness(Address::Panel);
        assert_ok!(h.manager.connect().await);
        let far = h.far_rx.recv().await.unwrap();

        deliver(&far, "PING", Address::Hub, Address::Peer(4));
        deliver(&far, "EXPLODE", Address::Hub, Address::Panel);
        far.send("garbage".to_string()).unwrap();
        deliver(&far, "PING", Address::Hub, Address::Panel);

        let received = Arc::clone(&h.received);
        eventually(|| received.lock().unwrap().len() == 2).await;
        let received = h.received.lock().unwrap().clone();
        assert_eq!(received[0].kind, "EXPLODE");
        assert_eq!(received[1].kind, "PING");
        assert!(received.iter().all(|e| e.target == Address::Panel));
        // Handler failure leaves the connection alone.
        assert_eq!(h.manager.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_unsolicited_close_reconnects() {
        let mut h = harness(Address::Peer(1));
        assert_ok!(h.manager.connect().await);
        let far = h.far_rx.recv().await.unwrap();
        far.close(CloseReason::Local);

        let second = h.far_rx.recv().await.unwrap();
        let manager = h.manager.clone();
        eventually(|| manager.status() == ConnectionStatus::Connected).await;
        assert!(second.is_connected());
        assert_eq!(h.clock.sleeps(), vec![Duration::from_millis(100)]);
        assert_eq!(h.manager.reconnect_attempts(), 0);
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_reconnects_stop_at_cap() {
        let mut h = harness(Address::Peer(1));
        assert_ok!(h.manager.connect().await);
        let far = h.far_rx.recv().await.unwrap();
        h.transport.available.store(false, Ordering::SeqCst);
        far.close(CloseReason::TransportLost("reset".to_string()));

        let manager = h.manager.clone();
        eventually(|| manager.is_exhausted()).await;
        assert_eq!(
            h.clock.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(h.manager.reconnect_attempts(), 3);
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 4);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 4);

        // An explicit connect resumes.
        h.transport.available.store(true, Ordering::SeqCst);
        assert_ok!(h.manager.connect().await);
        assert!(!h.manager.is_exhausted());
        assert_eq!(h.manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_backoff_wins() {
        let gate = Arc::new(Semaphore::new(0));
        let clock = TestClock {
            gate: Some(Arc::clone(&gate)),
            ..TestClock::default()
        };
        let mut h = harness_with(Address::Peer(1), clock, None);
        assert_ok!(h.manager.connect().await);
        let far = h.far_rx.recv().await.unwrap();
        far.close(CloseReason::Local);

        let clock = Arc::clone(&h.clock);
        eventually(|| clock.sleeps().len() == 1).await;
        h.manager.disconnect();
        gate.add_permits(1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_while_opening_discards_session() {
        let (far_tx, mut far_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(GatedTransport {
            entered: Notify::new(),
            release: Semaphore::new(0),
            far_tx,
        });
        let manager = EndpointSessionManager::new(Address::Peer(4), transport.clone());

        let connecting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        transport.entered.notified().await;
        assert_eq!(manager.status(), ConnectionStatus::Connecting);

        manager.disconnect();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        transport.release.add_permits(1);

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(ManagerError::Superseded)));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.reconnect_attempts(), 0);

        let far = far_rx.recv().await.unwrap();
        assert_eq!(far.state(), SessionState::Disconnected);
        assert!(matches!(
            manager.send(Address::Hub, OutgoingMessage::bare(MessageKind::Ping)),
            Err(ManagerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_explicit_disconnect_does_not_reconnect() {
        let mut h = harness(Address::Peer(1));
        assert_ok!(h.manager.connect().await);
        let mut far = h.far_rx.recv().await.unwrap();
        let mut events = far.take_events().unwrap();

        h.manager.disconnect();
        assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(events.recv().await, Some(SessionEvent::Closed(CloseReason::Remote)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.clock.sleeps().is_empty());
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_replaces_existing_session() {
        let mut h = harness(Address::Peer(1));
        assert_ok!(h.manager.connect().await);
        let first = h.far_rx.recv().await.unwrap();
        assert_ok!(h.manager.connect().await);
        let second = h.far_rx.recv().await.unwrap();

        assert_eq!(first.closed().await, CloseReason::Remote);
        assert!(second.is_connected());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.clock.sleeps().is_empty());
        assert_eq!(h.manager.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_non_participating_policy_skips_reconnect() {
        let mut h = harness(Address::Hub);
        assert!(!h.manager.policy().participates_in_reconnection);
        assert_ok!(h.manager.connect().await);
        let far = h.far_rx.recv().await.unwrap();
        far.close(CloseReason::Local);

        let manager = h.manager.clone();
        eventually(|| manager.status() == ConnectionStatus::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.clock.sleeps().is_empty());
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_context_invalidated_skips_reconnect() {
        let mut h = harness(Address::Peer(1));
        assert_ok!(h.manager.connect().await);
        let far = h.far_rx.recv().await.unwrap();
        far.close(CloseReason::ContextInvalidated);

        let manager = h.manager.clone();
        eventually(|| manager.status() == ConnectionStatus::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_triggers_reconnect() {
        let mut h = harness(Address::Peer(1));
        assert_ok!(h.manager.connect().await);
        let far = h.far_rx.recv().await.unwrap();
        drop(far);

        let err = h
            .manager
            .send(Address::Hub, OutgoingMessage::bare(MessageKind::Ping))
            .unwrap_err();
        assert!(matches!(err, ManagerError::SendFailed(SessionError::TransportClosed)));

        let _second = h.far_rx.recv().await.unwrap();
        let manager = h.manager.clone();
        eventually(|| manager.status() == ConnectionStatus::Connected).await;
        assert_eq!(h.clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[tokio::test]
    async fn test_connect_as_rebinds_address() {
        let mut h = harness(Address::Peer(0));
        assert_ok!(h.manager.connect().await);
        let provisional = h.far_rx.recv().await.unwrap();

        h.manager.connect_as(Address::Peer(17)).await.unwrap();
        let permanent = h.far_rx.recv().await.unwrap();
        assert_eq!(h.manager.address(), Address::Peer(17));
        assert_eq!(permanent.address(), Address::Peer(17));
        assert_eq!(provisional.closed().await, CloseReason::Remote);
    }
}
