use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{LocalTrack, RemoteTrack, TrackKind};
use crate::calls::error::CallError;
use crate::calls::sdp::{Direction, IceCandidate};
use crate::calls::state::IceConnectionState;
use crate::types::call::PhoneCall;

/// Index of a transceiver within its peer connection.
pub type TransceiverId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptionInit {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescriptionInit {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInfo {
    pub id: TransceiverId,
    pub mid: Option<String>,
    pub kind: TrackKind,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelInit {
    pub label: String,
    pub negotiated: bool,
    pub id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Peer connection configuration built from the servers of an established call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub ice_candidate_pool_size: u8,
}

impl RtcConfiguration {
    /// Returns `None` until the call is established and carries connections.
    pub fn from_phone_call(call: &PhoneCall, p2p_allowed: bool) -> Option<Self> {
        let PhoneCall::Established {
            connections,
            p2p_allowed: call_p2p_allowed,
            ..
        } = call
        else {
            return None;
        };
        if connections.is_empty() {
            return None;
        }

        let mut ice_servers = Vec::new();
        for conn in connections {
            if conn.stun {
                ice_servers.push(IceServer {
                    urls: vec![format!("stun:{}:{}", conn.ip, conn.port)],
                    username: None,
                    credential: None,
                });
            }
            if conn.turn {
                ice_servers.push(IceServer {
                    urls: vec![format!("turn:{}:{}", conn.ip, conn.port)],
                    username: conn.username.clone(),
                    credential: conn.password.clone(),
                });
            }
        }

        let ice_transport_policy = if p2p_allowed && *call_p2p_allowed {
            IceTransportPolicy::All
        } else {
            IceTransportPolicy::Relay
        };
        Some(Self {
            ice_servers,
            ice_transport_policy,
            ice_candidate_pool_size: 0,
        })
    }
}

/// Callbacks of the peer connection, delivered in order on one channel.
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    IceConnectionStateChange(IceConnectionState),
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    DataChannelOpen,
    DataChannelMessage(String),
}

/// The WebRTC peer connection the engine drives.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescriptionInit, CallError>;

    async fn create_answer(&self) -> Result<SessionDescriptionInit, CallError>;

    async fn set_local_description(&self, desc: SessionDescriptionInit) -> Result<(), CallError>;

    async fn set_remote_description(&self, desc: SessionDescriptionInit) -> Result<(), CallError>;

    fn local_description(&self) -> Option<SessionDescriptionInit>;

    fn remote_description(&self) -> Option<SessionDescriptionInit>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: Direction,
    ) -> Result<TransceiverId, CallError>;

    fn transceivers(&self) -> Vec<TransceiverInfo>;

    fn set_transceiver_direction(&self, id: TransceiverId, direction: Direction);

    async fn replace_track(
        &self,
        id: TransceiverId,
        track: Option<LocalTrack>,
    ) -> Result<(), CallError>;

    async fn create_data_channel(&self, init: DataChannelInit) -> Result<(), CallError>;

    async fn send_data(&self, text: String) -> Result<(), CallError>;

    fn ice_connection_state(&self) -> IceConnectionState;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, CallError>;
}
