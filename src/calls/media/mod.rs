//! Media-side collaborators of a call.
//!
//! The engine never captures or renders media itself. It drives an external
//! peer connection through [`PeerConnection`], receives already-acquired
//! tracks from [`MediaDevices`], and keeps the local tracks of a call in a
//! [`StreamManager`].
//!
//! # Architecture
//!
//! - [`PeerConnection`] & [`PeerConnectionFactory`]: WebRTC peer connection seam
//! - [`PeerConnectionEvent`]: callbacks forwarded over an mpsc channel
//! - [`StreamManager`]: local tracks and which entries they are published on
//! - [`MediaState`]: muted / video / screencast flags synced over the data channel

mod media_state;
mod peer;
mod stream;

pub use media_state::{DataChannelPayload, MediaState, VideoState};
pub use peer::{
    DataChannelInit, IceServer, IceTransportPolicy, PeerConnection, PeerConnectionEvent,
    PeerConnectionFactory, RtcConfiguration, SdpType, SessionDescriptionInit, TransceiverId,
    TransceiverInfo,
};
pub use stream::StreamManager;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a local track comes from. Camera and screen tracks are both video
/// but are published on different entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Screen => TrackKind::Video,
        }
    }
}

/// Handle to an already-acquired local track.
///
/// Clones share the enabled and ended flags with the media engine that
/// produced the track.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    enabled: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            source,
            enabled: Arc::new(AtomicBool::new(true)),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// Track received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub mid: Option<String>,
}

/// Source of local media. Acquisition itself happens outside the engine.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, audio: bool, video: bool) -> Result<Vec<LocalTrack>, CallError>;

    async fn get_display_media(&self) -> Result<Vec<LocalTrack>, CallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_clones_share_state() {
        let track = LocalTrack::new("mic", TrackSource::Microphone);
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        track.stop();
        assert!(clone.is_ended());
        assert_eq!(track.kind(), TrackKind::Audio);
        assert_eq!(TrackSource::Screen.kind(), TrackKind::Video);
    }
}
