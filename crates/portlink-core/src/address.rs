//! Logical endpoint addresses.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const HUB: &str = "hub";
const PANEL: &str = "panel";
const UNASSIGNED: &str = "undefined";
const PEER_PREFIX: &str = "peer-";

/// Address of one logical endpoint.
///
/// The textual grammar is `hub`, `panel`, `peer-<id>` or `undefined`.
/// `undefined` is a placeholder for an endpoint that has not learned its
/// real address yet; nothing is ever routed to or accepted from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    /// The coordinating hub.
    Hub,
    /// The single shared UI panel.
    Panel,
    /// A dynamically named peer, one per host-tab equivalent.
    Peer(u64),
    /// Not yet assigned.
    Unassigned,
}

impl Address {
    /// Whether envelopes may be routed to or accepted from this address.
    #[must_use]
    pub const fn is_routable(&self) -> bool {
        !matches!(self, Self::Unassigned)
    }

    /// Whether this address names the hub role.
    #[must_use]
    pub const fn is_hub(&self) -> bool {
        matches!(self, Self::Hub)
    }

    /// Numeric id of a peer address.
    #[must_use]
    pub const fn peer_id(&self) -> Option<u64> {
        match self {
            Self::Peer(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub => f.write_str(HUB),
            Self::Panel => f.write_str(PANEL),
            Self::Peer(id) => write!(f, "{PEER_PREFIX}{id}"),
            Self::Unassigned => f.write_str(UNASSIGNED),
        }
    }
}

/// Address parse error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid address: {0:?}")]
pub struct AddressError(pub String);

/// Decimal digits with no leading zero, so every id has exactly one text form.
fn is_canonical_id(digits: &str) -> bool {
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            HUB => Ok(Self::Hub),
            PANEL => Ok(Self::Panel),
            UNASSIGNED => Ok(Self::Unassigned),
            other => other
                .strip_prefix(PEER_PREFIX)
                .filter(|digits| is_canonical_id(digits))
                .and_then(|digits| digits.parse().ok())
                .map(Self::Peer)
                .ok_or_else(|| AddressError(other.to_string())),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
