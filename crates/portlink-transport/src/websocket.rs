//! WebSocket accept side for endpoints outside the hub's process.
//!
//! Each upgraded socket becomes one session registered under the address
//! given in the `address` query parameter. Text frames carry encoded
//! envelopes unchanged in both directions.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use portlink_core::{Address, CloseReason, Session, SessionEvent};
use portlink_hub::HubHandle;
use serde::Deserialize;

/// Query parameters of the upgrade request.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    pub address: String,
}

/// Address a socket may register under.
fn parse_endpoint_address(raw: &str) -> Option<Address> {
    raw.parse::<Address>()
        .ok()
        .filter(|address| address.is_routable() && !address.is_hub())
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(hub): State<HubHandle>,
) -> Response {
    let Some(address) = parse_endpoint_address(&params.address) else {
        tracing::warn!(address = %params.address, "Rejected socket with invalid address");
        return (StatusCode::BAD_REQUEST, "invalid address").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, address, hub))
}

async fn handle_socket(socket: WebSocket, address: Address, hub: HubHandle) {
    let (mut local, hub_side) = Session::pair(address);
    local.establish();
    if let Err(e) = hub.accept(hub_side) {
        tracing::warn!(%address, "Hub refused socket session: {e}");
        return;
    }
    let Some(events) = local.take_events() else {
        return;
    };
    let session_id = local.id();
    tracing::info!(%address, %session_id, "Socket session opened");

    let (mut sender, mut receiver) = socket.split();

    // Hub -> socket
    let send_task = tokio::spawn(async move {
        let mut events = events.into_stream();
        while let Some(event) = events.next().await {
            match event {
                SessionEvent::Message(raw) => {
                    if sender.send(Message::Text(raw.into())).await.is_err() {
                        break;
                    }
                }
                SessionEvent::Closed(reason) => {
                    tracing::debug!(%address, ?reason, "Hub closed socket session");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Socket -> hub
    let mut reason = CloseReason::Local;
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(%address, "WebSocket error: {e}");
                reason = CloseReason::TransportLost(e.to_string());
                break;
            }
        };
        if let Err(e) = local.send(text) {
            tracing::debug!(%address, "Socket session no longer open: {e}");
            break;
        }
    }

    local.close(reason);
    send_task.abort();
    tracing::info!(%address, %session_id, "Socket session closed");
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(hub_handle));
/// ```
#[must_use]
pub fn create_ws_router(hub: HubHandle) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(hub)
}
