//! In-process transport to a hub running in the same process.

use async_trait::async_trait;
use portlink_core::{Address, Session, SessionError, Transport};
use portlink_hub::HubHandle;

/// Opens sessions straight into a [`HubHandle`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: HubHandle,
}

impl MemoryTransport {
    /// Create a transport bound to `hub`.
    #[must_use]
    pub const fn new(hub: HubHandle) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, address: Address) -> Result<Session, SessionError> {
        let (session, hub_side) = Session::pair(address);
        session.establish();
        self.hub
            .accept(hub_side)
            .map_err(|e| SessionError::TransportUnavailable(e.to_string()))?;
        tracing::debug!(%address, session_id = %session.id(), "Opened in-process session");
        Ok(session)
    }
}
