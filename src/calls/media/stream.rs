use log::debug;
use parking_lot::Mutex;

use super::{LocalTrack, TrackSource};
use crate::calls::description::MediaKind;

struct StreamInner {
    tracks: Vec<LocalTrack>,
    types: Vec<MediaKind>,
    locked: bool,
    can_create_conference_entry: bool,
}

/// Local tracks of one call and the entry kinds they are published on.
///
/// A locked manager does not publish anything. The callee stays locked until
/// it has answered the caller's offer, so its first answer only mirrors
/// what the caller announced.
pub struct StreamManager {
    inner: Mutex<StreamInner>,
    acquire: tokio::sync::Mutex<()>,
}

impl StreamManager {
    pub fn new(is_outgoing: bool) -> Self {
        Self {
            inner: Mutex::new(StreamInner {
                tracks: Vec::new(),
                types: vec![MediaKind::Audio, MediaKind::Video, MediaKind::Screencast],
                locked: !is_outgoing,
                can_create_conference_entry: is_outgoing,
            }),
            acquire: tokio::sync::Mutex::new(()),
        }
    }

    /// Serializes device acquisition so concurrent requests do not acquire
    /// the same source twice.
    pub async fn acquire_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.acquire.lock().await
    }

    pub fn types(&self) -> Vec<MediaKind> {
        self.inner.lock().types.clone()
    }

    pub fn set_types(&self, types: Vec<MediaKind>) {
        self.inner.lock().types = types;
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    pub fn unlock(&self) {
        self.inner.lock().locked = false;
    }

    pub fn can_create_conference_entry(&self) -> bool {
        self.inner.lock().can_create_conference_entry
    }

    /// Adds a track, replacing any previous track of the same source.
    pub fn add_track(&self, track: LocalTrack) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.tracks.iter().position(|t| t.source() == track.source()) {
            let old = inner.tracks.remove(pos);
            if old.id() != track.id() {
                old.stop();
            }
        }
        debug!("Added local {:?} track {}", track.source(), track.id());
        inner.tracks.push(track);
    }

    /// Stops and removes the track of a source, returning it.
    pub fn remove_track(&self, source: TrackSource) -> Option<LocalTrack> {
        let mut inner = self.inner.lock();
        let pos = inner.tracks.iter().position(|t| t.source() == source)?;
        let track = inner.tracks.remove(pos);
        track.stop();
        Some(track)
    }

    pub fn track(&self, source: TrackSource) -> Option<LocalTrack> {
        self.inner
            .lock()
            .tracks
            .iter()
            .find(|t| t.source() == source)
            .cloned()
    }

    /// Track published on entries of `kind`.
    pub fn track_for(&self, kind: MediaKind) -> Option<LocalTrack> {
        let source = match kind {
            MediaKind::Audio => TrackSource::Microphone,
            MediaKind::Video => TrackSource::Camera,
            MediaKind::Screencast => TrackSource::Screen,
            MediaKind::Application => return None,
        };
        self.track(source)
    }

    pub fn has_video(&self) -> bool {
        self.inner
            .lock()
            .tracks
            .iter()
            .any(|t| t.source() != TrackSource::Microphone)
    }

    /// Stops every track.
    pub fn stop(&self) {
        let tracks = std::mem::take(&mut self.inner.lock().tracks);
        for track in tracks {
            track.stop();
        }
    }
}
