//! Envelope wire shape, message catalogue and codec.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::Address;

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The routed unit of communication.
///
/// `kind` is kept as the raw wire tag so that envelopes carrying a type this
/// build does not know still decode and route; see [`Envelope::message_kind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload; `null` when the message carries none.
    #[serde(default)]
    pub payload: Value,
    /// Sending endpoint, stamped by its session manager.
    pub source: Address,
    /// Addressed endpoint.
    pub target: Address,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: u64,
}

impl Envelope {
    /// Encode to the JSON wire form.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form.
    ///
    /// # Errors
    /// Returns error if `raw` is not a well-formed envelope.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Known message kind, or `None` for a tag this build does not recognise.
    #[must_use]
    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::from_tag(&self.kind)
    }

    /// Deserialize the payload into a typed value.
    ///
    /// # Errors
    /// Returns error if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A message before the sending manager stamps source, target and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Message type tag.
    pub kind: String,
    /// Opaque payload.
    pub payload: Value,
}

impl OutgoingMessage {
    /// Message of a known kind with a typed payload.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn new(kind: MessageKind, payload: impl Serialize) -> Result<Self, CodecError> {
        Ok(Self {
            kind: kind.as_str().to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Message of a known kind without payload.
    #[must_use]
    pub fn bare(kind: MessageKind) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload: Value::Null,
        }
    }

    /// Message with an arbitrary tag and payload.
    #[must_use]
    pub fn raw(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Stamp the envelope fields.
    #[must_use]
    pub fn into_envelope(self, source: Address, target: Address, timestamp: u64) -> Envelope {
        Envelope {
            kind: self.kind,
            payload: self.payload,
            source,
            target,
            timestamp,
        }
    }
}

/// Closed catalogue of message kinds shared by every endpoint (version 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Peer asks the hub for its numeric id. No payload.
    GetPeerId,
    /// Hub answers with [`PeerIdResponse`].
    GetPeerIdResponse,
    /// A peer became the active one; carries [`PeerInfo`].
    PeerActivated,
    /// A host window gained focus; carries [`WindowFocus`].
    WindowFocused,
    /// Free-form notice for the panel; carries [`PanelNotice`].
    PanelNotice,
    /// Liveness probe. No payload.
    Ping,
}

impl MessageKind {
    /// Catalogue version.
    pub const VERSION: u32 = 1;

    /// Every known kind.
    pub const ALL: [Self; 6] = [
        Self::GetPeerId,
        Self::GetPeerIdResponse,
        Self::PeerActivated,
        Self::WindowFocused,
        Self::PanelNotice,
        Self::Ping,
    ];

    /// Wire tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetPeerId => "GET_PEER_ID",
            Self::GetPeerIdResponse => "GET_PEER_ID_RESPONSE",
            Self::PeerActivated => "PEER_ACTIVATED",
            Self::WindowFocused => "WINDOW_FOCUSED",
            Self::PanelNotice => "PANEL_NOTICE",
            Self::Ping => "PING",
        }
    }

    /// Look up a wire tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

/// Payload of [`MessageKind::GetPeerIdResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdResponse {
    pub peer_id: u64,
}

/// Payload of [`MessageKind::PeerActivated`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: u64,
    pub window_id: u64,
    pub url: String,
}

/// Payload of [`MessageKind::WindowFocused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowFocus {
    pub window_id: u64,
}

/// Payload of [`MessageKind::PanelNotice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelNotice {
    pub message: String,
}
