//! Hub server with an in-process panel and WebSocket peers.
//!
//! Run with: cargo run -p hub-server-demo
//!
//! Peers connect to `ws://localhost:3000/ws?address=peer-N` and exchange
//! JSON envelopes. `GET /directory` lists registered addresses.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use portlink_core::{
    Address, Envelope, HandlerError, MessageHandler, MessageKind, OutgoingMessage, PanelNotice,
    PeerIdResponse, PeerInfo, WindowFocus,
};
use portlink_hub::{HubConfig, HubHandle, HubRouter};
use portlink_session::{EndpointSessionManager, Supervisor, SupervisorConfig};
use portlink_transport::{MemoryTransport, create_ws_router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Hub-side handler: answers id requests and tells the panel about activations.
struct HubResponder {
    hub: HubHandle,
}

impl HubResponder {
    fn reply_peer_id(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let peer_id = envelope
            .source
            .peer_id()
            .ok_or_else(|| HandlerError::new(format!("{} has no peer id", envelope.source)))?;
        let reply =
            OutgoingMessage::new(MessageKind::GetPeerIdResponse, PeerIdResponse { peer_id })
                .map_err(HandlerError::new)?;
        self.hub
            .send(envelope.source, reply)
            .map_err(HandlerError::new)
    }

    fn announce_activation(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let info: PeerInfo = envelope.payload_as().map_err(HandlerError::new)?;
        let message =
            OutgoingMessage::new(MessageKind::PeerActivated, info).map_err(HandlerError::new)?;
        self.hub
            .send(Address::Panel, message)
            .map_err(HandlerError::new)
    }

    fn note_focus(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let focus: WindowFocus = envelope.payload_as().map_err(HandlerError::new)?;
        let notice = PanelNotice {
            message: format!("{} focused window {}", envelope.source, focus.window_id),
        };
        let message =
            OutgoingMessage::new(MessageKind::PanelNotice, notice).map_err(HandlerError::new)?;
        self.hub
            .send(Address::Panel, message)
            .map_err(HandlerError::new)
    }
}

impl MessageHandler for HubResponder {
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match envelope.message_kind() {
            Some(MessageKind::GetPeerId) => self.reply_peer_id(envelope),
            Some(MessageKind::PeerActivated) => self.announce_activation(envelope),
            Some(MessageKind::WindowFocused) => self.note_focus(envelope),
            _ => {
                tracing::debug!(
                    kind = %envelope.kind,
                    source = %envelope.source,
                    "Ignoring hub message"
                );
                Ok(())
            }
        }
    }
}

fn panel_handler(envelope: &Envelope) -> Result<(), HandlerError> {
    match envelope.message_kind() {
        Some(MessageKind::PeerActivated) => {
            let info: PeerInfo = envelope.payload_as().map_err(HandlerError::new)?;
            tracing::info!(
                peer_id = info.peer_id,
                window_id = info.window_id,
                url = %info.url,
                "Peer activated"
            );
        }
        Some(MessageKind::PanelNotice) => {
            let notice: PanelNotice = envelope.payload_as().map_err(HandlerError::new)?;
            tracing::info!(source = %envelope.source, "Panel notice: {}", notice.message);
        }
        _ => tracing::info!(
            kind = %envelope.kind,
            source = %envelope.source,
            "Panel received message"
        ),
    }
    Ok(())
}

async fn directory_handler(State(hub): State<HubHandle>) -> Result<Json<Vec<Address>>, StatusCode> {
    hub.directory()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let bind = std::env::var("PORTLINK_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid PORTLINK_BIND address: {bind}"))?;

    let (router, hub) = HubRouter::new(HubConfig::default());
    let router_task = router
        .with_handler(Arc::new(HubResponder { hub: hub.clone() }))
        .spawn();

    // The panel lives in-process next to the hub.
    let panel = EndpointSessionManager::builder(
        Address::Panel,
        Arc::new(MemoryTransport::new(hub.clone())),
    )
    .handler(Arc::new(panel_handler))
    .build();
    let supervisor = Supervisor::spawn(panel.clone(), SupervisorConfig::default());

    let app = Router::new()
        .route("/directory", get(directory_handler))
        .with_state(hub.clone())
        .merge(create_ws_router(hub.clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Hub listening on ws://{addr}/ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("server error")?;

    supervisor.stop().await;
    panel.disconnect();
    hub.shutdown();
    router_task.await.context("router task failed")?;
    Ok(())
}
