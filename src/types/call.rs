use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a call as assigned by the server. Outgoing calls carry a
/// negative temporary id until the request is acknowledged.
pub type CallId = i64;

/// Identifier of the remote party.
pub type UserId = i64;

/// Reason reported when a call is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    Missed,
    Disconnect,
    Hangup,
    Busy,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Missed => "missed",
            Self::Disconnect => "disconnect",
            Self::Hangup => "hangup",
            Self::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// Protocol capabilities advertised by each side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallProtocol {
    pub udp_p2p: bool,
    pub udp_reflector: bool,
    pub min_layer: u32,
    pub max_layer: u32,
    pub library_versions: Vec<String>,
}

impl Default for CallProtocol {
    fn default() -> Self {
        Self {
            udp_p2p: true,
            udp_reflector: true,
            min_layer: 92,
            max_layer: 92,
            library_versions: vec!["4.0.0".to_string()],
        }
    }
}

impl CallProtocol {
    /// Two protocols are compatible when their layer ranges overlap and they
    /// share at least one library version.
    pub fn is_compatible_with(&self, other: &CallProtocol) -> bool {
        let layers_overlap =
            self.min_layer <= other.max_layer && other.min_layer <= self.max_layer;
        layers_overlap
            && self
                .library_versions
                .iter()
                .any(|v| other.library_versions.contains(v))
    }
}

/// A relay or reflector offered by the server for an established call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneConnection {
    pub ip: String,
    pub port: u16,
    pub turn: bool,
    pub stun: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Parameters for generating a DH share, fetched from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhConfig {
    /// Opaque group identifier passed through to key computation.
    pub p: Vec<u8>,
    pub g: u32,
    /// Server-provided randomness mixed into the local secret.
    pub random: Vec<u8>,
    pub version: i32,
}

/// Reference to a call used by every RPC after the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallPeer {
    pub id: CallId,
    pub access_hash: i64,
}

/// Fields shared by every call variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHeader {
    pub id: CallId,
    pub access_hash: i64,
    pub date: DateTime<Utc>,
    pub admin_id: UserId,
    pub participant_id: UserId,
    pub protocol: CallProtocol,
    pub video: bool,
}

/// Server view of a call, mirrored locally as it advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhoneCall {
    /// Outgoing call waiting for the other side.
    Waiting(CallHeader),
    /// Incoming call, carries the caller's `g_a` commitment.
    Requested {
        #[serde(flatten)]
        header: CallHeader,
        g_a_hash: Vec<u8>,
    },
    /// The callee accepted, carries its DH share.
    Accepted {
        #[serde(flatten)]
        header: CallHeader,
        g_b: Vec<u8>,
    },
    /// Both sides hold the key, ICE servers are known.
    Established {
        #[serde(flatten)]
        header: CallHeader,
        g_a_or_b: Vec<u8>,
        key_fingerprint: i64,
        connections: Vec<PhoneConnection>,
        p2p_allowed: bool,
    },
    Discarded {
        id: CallId,
        reason: Option<DiscardReason>,
        video: bool,
    },
}

impl PhoneCall {
    pub fn id(&self) -> CallId {
        match self {
            Self::Waiting(header)
            | Self::Requested { header, .. }
            | Self::Accepted { header, .. }
            | Self::Established { header, .. } => header.id,
            Self::Discarded { id, .. } => *id,
        }
    }

    pub fn header(&self) -> Option<&CallHeader> {
        match self {
            Self::Waiting(header)
            | Self::Requested { header, .. }
            | Self::Accepted { header, .. }
            | Self::Established { header, .. } => Some(header),
            Self::Discarded { .. } => None,
        }
    }

    pub fn peer(&self) -> Option<CallPeer> {
        self.header().map(|h| CallPeer {
            id: h.id,
            access_hash: h.access_hash,
        })
    }

    pub fn is_video(&self) -> bool {
        match self {
            Self::Discarded { video, .. } => *video,
            _ => self.header().is_some_and(|h| h.video),
        }
    }
}

/// Inbound traffic from the messaging transport.
#[derive(Debug, Clone)]
pub enum CallUpdate {
    PhoneCall(PhoneCall),
    SignalingData { call_id: CallId, data: Vec<u8> },
}
