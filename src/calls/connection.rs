//! Ownership of one peer connection and its offer/answer state.

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::description::ConferenceDescription;
use super::error::CallError;
use super::media::{DataChannelInit, PeerConnection, SessionDescriptionInit, StreamManager};
use super::sdp::{Direction, SessionDescription};
use super::signaling::InitialSetup;
use crate::types::call::CallId;

/// One peer connection plus the conference description mirroring it.
///
/// Every description change on the peer connection goes through
/// [`ConnectionInstance::lock_negotiation`], so `set_local_description` and
/// `set_remote_description` never overlap.
pub struct ConnectionInstance {
    call_id: CallId,
    connection: Arc<dyn PeerConnection>,
    description: Mutex<ConferenceDescription>,
    negotiation: tokio::sync::Mutex<()>,
    offer_sent: AtomicBool,
    offer_received: AtomicBool,
    has_data_channel: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionInstance {
    pub fn new(call_id: CallId, connection: Arc<dyn PeerConnection>) -> Self {
        let session_id = rand::random::<u32>().to_string();
        Self {
            call_id,
            connection,
            description: Mutex::new(ConferenceDescription::new(session_id)),
            negotiation: tokio::sync::Mutex::new(()),
            offer_sent: AtomicBool::new(false),
            offer_received: AtomicBool::new(false),
            has_data_channel: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn with_description<R>(&self, f: impl FnOnce(&mut ConferenceDescription) -> R) -> R {
        f(&mut self.description.lock())
    }

    pub async fn lock_negotiation(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.negotiation.lock().await
    }

    /// Clears and returns the "offer sent" flag. A setup received while it is
    /// set is the answer to our offer.
    pub fn take_offer_sent(&self) -> bool {
        self.offer_sent.swap(false, Ordering::SeqCst)
    }

    pub fn set_offer_received(&self, received: bool) {
        self.offer_received.store(received, Ordering::SeqCst);
    }

    pub fn take_offer_received(&self) -> bool {
        self.offer_received.swap(false, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Answers a pending remote offer or creates a new offer, applies it
    /// locally and returns the setup to send.
    pub async fn negotiate(&self) -> Result<Option<InitialSetup>, CallError> {
        let _guard = self.lock_negotiation().await;
        if self.is_closed() {
            return Ok(None);
        }

        if self.take_offer_received() {
            let answer = self.connection.create_answer().await?;
            self.connection.set_local_description(answer).await?;
            debug!("Answered pending offer for call {}", self.call_id);
        } else {
            let offer = self.connection.create_offer().await?;
            self.connection.set_local_description(offer).await?;
            self.offer_sent.store(true, Ordering::SeqCst);
            debug!("Created offer for call {}", self.call_id);
        }

        self.local_setup().map(Some)
    }

    /// Setup extracted from the current local description.
    pub fn local_setup(&self) -> Result<InitialSetup, CallError> {
        let local = self
            .connection
            .local_description()
            .ok_or(CallError::Negotiation("no local description".into()))?;
        let sdp = SessionDescription::parse(&local.sdp)?;
        let description = self.description.lock();
        Ok(InitialSetup::from_sdp(&sdp, |mid| {
            description.entry_by_mid(mid).map(|e| e.kind)
        })?)
    }

    pub async fn set_local_description(&self, desc: SessionDescriptionInit) -> Result<(), CallError> {
        self.connection.set_local_description(desc).await
    }

    pub async fn set_remote_description(&self, desc: SessionDescriptionInit) -> Result<(), CallError> {
        debug!("Setting remote {} for call {}", desc.sdp_type, self.call_id);
        self.connection.set_remote_description(desc).await
    }

    /// Publishes the local tracks on their entries, creating entries and
    /// transceivers where the manager allows it. No-op while locked.
    pub async fn append_stream_to_conference(&self, streams: &StreamManager) -> Result<(), CallError> {
        if streams.is_locked() {
            debug!("Stream manager locked for call {}, not publishing", self.call_id);
            return Ok(());
        }

        for kind in streams.types() {
            let Some(track_kind) = kind.track_kind() else {
                continue;
            };

            let slot = self.with_description(|d| {
                let existing = d
                    .find_entry(|e| e.direction == Direction::SendRecv && e.kind == kind)
                    .map(|e| (e.mid.clone(), e.transceiver));
                match existing {
                    Some(found) => Some(found),
                    None if streams.can_create_conference_entry() => Some((d.create_entry(kind), None)),
                    None => None,
                }
            });
            let Some((mid, transceiver)) = slot else {
                continue;
            };

            let transceiver = match transceiver {
                Some(id) => id,
                None => {
                    let id = self
                        .connection
                        .add_transceiver(track_kind, Direction::SendRecv)
                        .await?;
                    self.with_description(|d| {
                        if let Some(entry) = d.entry_by_mid_mut(&mid) {
                            entry.transceiver = Some(id);
                        }
                    });
                    id
                }
            };

            self.connection
                .replace_track(transceiver, streams.track_for(kind))
                .await?;
        }
        Ok(())
    }

    /// Opens the negotiated data channel (id 0) once.
    pub async fn create_data_channel(&self, label: &str) -> Result<(), CallError> {
        if self.has_data_channel.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connection
            .create_data_channel(DataChannelInit {
                label: label.to_string(),
                negotiated: true,
                id: 0,
            })
            .await
    }

    pub async fn send_data_channel_data<T: Serialize>(&self, data: &T) -> Result<(), CallError> {
        if !self.has_data_channel.load(Ordering::SeqCst) || self.is_closed() {
            return Err(CallError::NotConnected);
        }
        let text = serde_json::to_string(data)?;
        self.connection.send_data(text).await
    }

    /// Closes the peer connection and stops the local tracks. Runs once.
    pub async fn close_connection_and_stream(&self, streams: &StreamManager) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing peer connection for call {}", self.call_id);
        self.connection.close().await;
        streams.stop();
    }
}

impl Drop for ConnectionInstance {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("Connection for call {} dropped without closing", self.call_id);
        }
    }
}
