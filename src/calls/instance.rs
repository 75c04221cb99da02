//! One P2P call: lifecycle, key exchange and signaling.
//!
//! A [`CallInstance`] walks REQUESTING → PENDING → EXCHANGING_KEYS →
//! CONNECTING → CONNECTED, and can be forced to CLOSED from any state. It
//! drives the DH handshake through [`CallTransport`] and [`CallCrypto`], then
//! hands negotiation to its [`ConnectionInstance`]. Signaling blobs from the
//! peer are decrypted and applied strictly in arrival order.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::connection::ConnectionInstance;
use super::description::{GenerateSdpOptions, MediaKind};
use super::dh::{CallCrypto, ComputedKey, DiffieHellmanInfo, emoji_fingerprint};
use super::encryption::P2PEncryptor;
use super::error::CallError;
use super::events::{CallEvent, EventListeners};
use super::media::{
    DataChannelPayload, LocalTrack, MediaDevices, MediaState, PeerConnectionEvent,
    PeerConnectionFactory, RtcConfiguration, SessionDescriptionInit, StreamManager, TrackSource,
    VideoState,
};
use super::sdp::{Direction, IceCandidate};
use super::signaling::{CallSignalingData, Candidates, InitialSetup};
use super::sound::CallSoundPlayer;
use super::state::{CallState, derive_state, sort_index};
use super::transport::CallTransport;
use crate::config::CallConfig;
use crate::types::call::{CallId, CallPeer, DiscardReason, PhoneCall, UserId};

/// Application hook consulted before accepting an incoming call.
#[async_trait]
pub trait AcceptCallOverride: Send + Sync {
    async fn can_accept(&self, call: &CallInstance) -> bool;
}

/// External collaborators shared by every call.
#[derive(Clone)]
pub struct CallServices {
    pub transport: Arc<dyn CallTransport>,
    pub crypto: Arc<dyn CallCrypto>,
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub sounds: Arc<dyn CallSoundPlayer>,
    pub accept_override: Option<Arc<dyn AcceptCallOverride>>,
}

#[derive(Default)]
struct CallInner {
    id: Option<CallId>,
    call: Option<PhoneCall>,
    override_state: Option<CallState>,
    last_state: Option<CallState>,
    dh: DiffieHellmanInfo,
    encryption_key: Option<Arc<[u8]>>,
    key_fingerprint: Option<i64>,
    emoji_fingerprint: Option<[&'static str; 4]>,
    connected_at: Option<Instant>,
    discard_reason: Option<DiscardReason>,
    was_trying_to_join: bool,
}

pub struct CallInstance {
    weak_self: Weak<CallInstance>,
    services: CallServices,
    config: Arc<CallConfig>,
    interlocutor_user_id: UserId,
    is_outgoing: bool,
    created_at_ms: u64,

    inner: Mutex<CallInner>,
    connection: Mutex<Option<Arc<ConnectionInstance>>>,
    encryptor: Mutex<Option<P2PEncryptor>>,
    send_order: tokio::sync::Mutex<()>,
    decryptor: Mutex<Option<P2PEncryptor>>,
    decrypt_queue: Mutex<Vec<Vec<u8>>>,
    draining: tokio::sync::Mutex<()>,
    candidates: Mutex<Vec<IceCandidate>>,
    streams: StreamManager,
    listeners: EventListeners<CallEvent>,

    hang_up_started: AtomicBool,
    joining: AtomicBool,
    data_channel_open: AtomicBool,
    timer_generation: AtomicU64,
    hang_up_timer: Mutex<Option<(u64, JoinHandle<()>)>>,

    input_media_state: watch::Sender<MediaState>,
    output_media_state: Mutex<Option<MediaState>>,
    media_sender: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CallInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInstance")
            .field("id", &self.id())
            .field("interlocutor_user_id", &self.interlocutor_user_id)
            .field("is_outgoing", &self.is_outgoing)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl CallInstance {
    pub fn new(
        services: CallServices,
        config: Arc<CallConfig>,
        interlocutor_user_id: UserId,
        is_outgoing: bool,
    ) -> Arc<Self> {
        let created_at_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            services,
            config,
            interlocutor_user_id,
            is_outgoing,
            created_at_ms,
            inner: Mutex::new(CallInner::default()),
            connection: Mutex::new(None),
            encryptor: Mutex::new(None),
            send_order: tokio::sync::Mutex::new(()),
            decryptor: Mutex::new(None),
            decrypt_queue: Mutex::new(Vec::new()),
            draining: tokio::sync::Mutex::new(()),
            candidates: Mutex::new(Vec::new()),
            streams: StreamManager::new(is_outgoing),
            listeners: EventListeners::default(),
            hang_up_started: AtomicBool::new(false),
            joining: AtomicBool::new(false),
            data_channel_open: AtomicBool::new(false),
            timer_generation: AtomicU64::new(0),
            hang_up_timer: Mutex::new(None),
            input_media_state: watch::channel(MediaState::default()).0,
            output_media_state: Mutex::new(None),
            media_sender: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Option<CallId> {
        self.inner.lock().id
    }

    pub fn interlocutor_user_id(&self) -> UserId {
        self.interlocutor_user_id
    }

    pub fn is_outgoing(&self) -> bool {
        self.is_outgoing
    }

    pub fn phone_call(&self) -> Option<PhoneCall> {
        self.inner.lock().call.clone()
    }

    pub fn connection(&self) -> Option<Arc<ConnectionInstance>> {
        self.connection.lock().clone()
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn has_encryption_key(&self) -> bool {
        self.inner.lock().encryption_key.is_some()
    }

    pub fn key_fingerprint(&self) -> Option<i64> {
        self.inner.lock().key_fingerprint
    }

    /// Emoji both parties compare to rule out a man in the middle.
    pub fn emoji_fingerprint(&self) -> Option<[&'static str; 4]> {
        self.inner.lock().emoji_fingerprint
    }

    pub fn discard_reason(&self) -> Option<DiscardReason> {
        self.inner.lock().discard_reason
    }

    pub fn was_trying_to_join(&self) -> bool {
        self.inner.lock().was_trying_to_join
    }

    pub fn has_connected(&self) -> bool {
        self.inner.lock().connected_at.is_some()
    }

    /// Seconds since the call first connected.
    pub fn duration(&self) -> u32 {
        self.inner
            .lock()
            .connected_at
            .map(|t| t.elapsed().as_secs() as u32)
            .unwrap_or(0)
    }

    pub fn connection_state(&self) -> CallState {
        let override_state = self.inner.lock().override_state;
        let ice_state = self
            .connection
            .lock()
            .as_ref()
            .map(|c| c.connection().ice_connection_state());
        derive_state(override_state, ice_state)
    }

    pub fn is_closing(&self) -> bool {
        self.connection_state().is_closing()
    }

    pub fn sort_index(&self) -> u64 {
        let state = self.connection_state();
        sort_index(
            state,
            state == CallState::Pending && self.is_outgoing,
            self.created_at_ms,
        )
    }

    pub fn add_event_listener(&self, listener: impl Fn(&CallEvent) + Send + Sync + 'static) {
        self.listeners.add(listener);
    }

    pub(crate) fn dh_info(&self) -> DiffieHellmanInfo {
        self.inner.lock().dh.clone()
    }

    fn peer(&self) -> Result<CallPeer, CallError> {
        self.inner
            .lock()
            .call
            .as_ref()
            .and_then(PhoneCall::peer)
            .filter(|peer| peer.id > 0)
            .ok_or(CallError::MissingAttribute("server call id"))
    }

    /// Assigns the id of an outgoing call before the server has acked it.
    pub(crate) fn set_temporary_id(&self, id: CallId) {
        let prev = self.inner.lock().id.replace(id);
        self.listeners.dispatch(&CallEvent::Id { id, prev });
    }

    /// Records the latest server view of the call.
    pub fn set_phone_call(&self, call: PhoneCall) {
        let id = call.id();
        let prev = {
            let mut inner = self.inner.lock();
            inner.call = Some(call);
            let prev = inner.id;
            inner.id = Some(id);
            prev
        };
        if prev != Some(id) {
            self.listeners.dispatch(&CallEvent::Id { id, prev });
        }
    }

    /// Forces the visible state, or returns to the ICE-derived state with `None`.
    pub fn override_connection_state(&self, state: Option<CallState>) {
        self.inner.lock().override_state = state;
        self.notify_state();
    }

    fn notify_state(&self) {
        let state = self.connection_state();
        {
            let mut inner = self.inner.lock();
            if inner.last_state == Some(state) {
                return;
            }
            inner.last_state = Some(state);
            match state {
                CallState::ExchangingKeys => inner.was_trying_to_join = true,
                CallState::Connected if inner.connected_at.is_none() => {
                    inner.connected_at = Some(Instant::now());
                }
                _ => {}
            }
        }

        info!("Call {:?} is now {}", self.id(), state);
        self.on_state_changed(state);
        self.listeners.dispatch(&CallEvent::State(state));
    }

    fn on_state_changed(&self, state: CallState) {
        let timeout = self.config.hang_up_timeout;
        match state {
            CallState::ExchangingKeys => self.set_hang_up_timeout(timeout, DiscardReason::Disconnect),
            CallState::Connecting if self.has_connected() => {
                self.set_hang_up_timeout(timeout, DiscardReason::Disconnect)
            }
            CallState::Connected => self.clear_hang_up_timeout(),
            CallState::Closed => self.cleanup(),
            _ => {}
        }
    }

    fn cleanup(&self) {
        self.clear_hang_up_timeout();
        if let Some(sender) = self.media_sender.lock().take() {
            sender.abort();
        }
        self.candidates.lock().clear();
        self.decrypt_queue.lock().clear();
        self.inner.lock().dh.clear_secrets();
        self.streams.stop();
    }

    /// Arms (or re-arms) the hang-up timer.
    pub fn set_hang_up_timeout(&self, timeout: Duration, reason: DiscardReason) {
        let generation = self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = self.weak_self.clone();
        // Held until the handle is stored; the task checks the slot first.
        let mut slot = self.hang_up_timer.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(call) = weak.upgrade() else {
                return;
            };
            {
                // Detach from the slot so hang-up does not abort this task.
                let mut slot = call.hang_up_timer.lock();
                match slot.as_ref() {
                    Some((current, _)) if *current == generation => {
                        slot.take();
                    }
                    _ => return,
                }
            }
            warn!("Call {:?} timed out, hanging up with {}", call.id(), reason);
            call.hang_up(reason, false).await;
        });

        if let Some((_, old)) = slot.replace((generation, handle)) {
            old.abort();
        }
    }

    pub fn clear_hang_up_timeout(&self) {
        if let Some((_, handle)) = self.hang_up_timer.lock().take() {
            handle.abort();
        }
    }

    pub fn has_hang_up_timeout(&self) -> bool {
        self.hang_up_timer.lock().is_some()
    }

    /// Logs `err`, flags incompatibility when relevant and ends the call.
    pub(crate) async fn terminate_with_error(&self, err: CallError) {
        error!("Call {:?} failed: {}", self.id(), err);
        if err.is_incompatibility() {
            self.listeners
                .dispatch(&CallEvent::Incompatible(self.interlocutor_user_id));
        }
        self.hang_up(err.hang_up_reason(), false).await;
    }

    /// Sends the call request for an outgoing call.
    pub(crate) async fn request_call(&self, video: bool) -> Result<(), CallError> {
        self.override_connection_state(Some(CallState::Requesting));
        if let Err(e) = self.request_input_source(true, video, false).await {
            warn!("Failed to acquire local media for call {:?}: {}", self.id(), e);
        }

        let dh_config = self.services.transport.get_dh_config().await?;
        let share = self.services.crypto.generate_dh(&dh_config).await?;
        let g_a_hash = share.public_hash.clone();
        self.inner.lock().dh = DiffieHellmanInfo::initiator(dh_config.p, share);

        let call = self
            .services
            .transport
            .request_call(self.interlocutor_user_id, &g_a_hash, &self.config.protocol, video)
            .await?;
        if self.is_closing() {
            // Hung up while the request was in flight: the server call exists now.
            self.set_phone_call(call);
            let peer = self.peer()?;
            let reason = self.discard_reason().unwrap_or(DiscardReason::Hangup);
            info!("Discarding call {} that was hung up while requested", peer.id);
            return self
                .services
                .transport
                .discard_call(peer, 0, reason, video)
                .await;
        }

        self.override_connection_state(Some(CallState::Pending));
        self.set_phone_call(call);
        self.set_hang_up_timeout(self.config.hang_up_timeout, DiscardReason::Hangup);
        Ok(())
    }

    /// Accepts an incoming call. Any failure hangs up.
    pub async fn accept_call(&self) {
        if let Err(e) = self.try_accept_call().await {
            error!("Failed to accept call {:?}: {}", self.id(), e);
            self.hang_up(DiscardReason::Hangup, false).await;
        }
    }

    async fn try_accept_call(&self) -> Result<(), CallError> {
        if self.is_closing() {
            return Ok(());
        }
        if let Some(hook) = &self.services.accept_override
            && !hook.can_accept(self).await
        {
            info!("Accepting call {:?} was vetoed", self.id());
            return Ok(());
        }
        if self.is_closing() {
            return Ok(());
        }

        self.override_connection_state(Some(CallState::ExchangingKeys));

        let (g_a_hash, video) = match self.phone_call() {
            Some(PhoneCall::Requested { header, g_a_hash }) => (g_a_hash, header.video),
            _ => return Err(CallError::InvalidState("accepting a call that was not requested".into())),
        };
        if let Err(e) = self.request_input_source(true, video, false).await {
            warn!("Failed to acquire local media for call {:?}: {}", self.id(), e);
        }

        let dh_config = self.services.transport.get_dh_config().await?;
        let share = self.services.crypto.generate_dh(&dh_config).await?;
        let g_b = share.public.clone();
        self.inner.lock().dh = DiffieHellmanInfo::acceptor(dh_config.p, share, g_a_hash);

        let accepted = self
            .services
            .transport
            .accept_call(self.peer()?, &g_b, &self.config.protocol)
            .await?;
        self.set_phone_call(accepted);
        Ok(())
    }

    /// Completes the key exchange on the outgoing side once the peer accepted.
    pub async fn confirm_call(&self) {
        if let Err(e) = self.try_confirm_call().await {
            self.terminate_with_error(e).await;
        }
    }

    async fn try_confirm_call(&self) -> Result<(), CallError> {
        if self.is_closing() {
            return Ok(());
        }
        self.override_connection_state(Some(CallState::ExchangingKeys));

        let Some(PhoneCall::Accepted { g_b, .. }) = self.phone_call() else {
            return Err(CallError::InvalidState("confirming a call that was not accepted".into()));
        };
        let dh = self.dh_info();
        let a = dh.a.ok_or(CallError::MissingAttribute("dh secret"))?;
        let g_a = dh.g_a.ok_or(CallError::MissingAttribute("g_a"))?;

        let computed = self.services.crypto.compute_key(&g_b, &a, &dh.p).await?;
        let established = self
            .services
            .transport
            .confirm_call(self.peer()?, &g_a, computed.fingerprint, &self.config.protocol)
            .await?;
        if self.is_closing() {
            return Ok(());
        }

        self.set_encryption_key(computed, &g_a)?;
        self.set_phone_call(established);
        self.join_call().await;
        Ok(())
    }

    /// Stores the derived key. The key can be set only once.
    pub(crate) fn set_encryption_key(&self, computed: ComputedKey, g_a: &[u8]) -> Result<(), CallError> {
        let mut inner = self.inner.lock();
        if inner.encryption_key.is_some() {
            return Err(CallError::InvalidState("encryption key already set".into()));
        }
        inner.emoji_fingerprint = Some(emoji_fingerprint(&computed.key, g_a));
        inner.key_fingerprint = Some(computed.fingerprint);
        inner.encryption_key = Some(computed.key.into());
        inner.dh.clear_secrets();
        Ok(())
    }

    /// Creates the peer connection and starts negotiating.
    pub async fn join_call(&self) {
        if let Err(e) = self.try_join_call().await {
            self.terminate_with_error(e).await;
        }
    }

    async fn try_join_call(&self) -> Result<(), CallError> {
        if self.is_closing() {
            return Ok(());
        }
        self.override_connection_state(None);

        let (call, key) = {
            let inner = self.inner.lock();
            (inner.call.clone(), inner.encryption_key.clone())
        };
        let Some(rtc_config) = call
            .as_ref()
            .and_then(|c| RtcConfiguration::from_phone_call(c, self.config.p2p_allowed))
        else {
            warn!("No ICE servers for call {:?} yet, not joining", self.id());
            return Ok(());
        };
        let key = key.ok_or(CallError::InvalidState("joining without a key".into()))?;
        if self.joining.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer_connection = self
            .services
            .peer_factory
            .create_peer_connection(&rtc_config, events_tx)
            .await?;
        let connection = Arc::new(ConnectionInstance::new(
            self.id().unwrap_or_default(),
            peer_connection,
        ));
        *self.connection.lock() = Some(connection.clone());
        self.spawn_peer_event_loop(events_rx);

        *self.encryptor.lock() = Some(P2PEncryptor::new(self.is_outgoing, &key)?);
        *self.decryptor.lock() = Some(P2PEncryptor::new(!self.is_outgoing, &key)?);
        info!("Joined call {:?}", self.id());

        if self.is_outgoing {
            connection.append_stream_to_conference(&self.streams).await?;
        }
        connection
            .create_data_channel(&self.config.data_channel_label)
            .await?;
        self.spawn_media_state_sender();
        self.notify_state();

        self.process_decrypt_queue().await;
        Ok(())
    }

    fn spawn_peer_event_loop(&self, mut events: mpsc::UnboundedReceiver<PeerConnectionEvent>) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(call) = weak.upgrade() else {
                    break;
                };
                if call.connection_state() == CallState::Closed {
                    break;
                }
                call.handle_peer_event(event).await;
            }
        });
    }

    async fn handle_peer_event(&self, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::IceConnectionStateChange(state) => {
                debug!("ICE state of call {:?}: {:?}", self.id(), state);
                self.notify_state();
            }
            PeerConnectionEvent::NegotiationNeeded => self.on_negotiation_needed().await,
            PeerConnectionEvent::IceCandidate(candidate) => self.send_ice_candidate(candidate).await,
            PeerConnectionEvent::Track(track) => self.listeners.dispatch(&CallEvent::Track(track)),
            PeerConnectionEvent::DataChannelOpen => {
                self.data_channel_open.store(true, Ordering::SeqCst);
                let state = *self.input_media_state.borrow();
                self.send_media_state(state).await;
            }
            PeerConnectionEvent::DataChannelMessage(text) => self.apply_data_channel_data(&text),
        }
    }

    async fn on_negotiation_needed(&self) {
        let Some(connection) = self.connection() else {
            return;
        };
        // The callee only ever answers.
        if !self.is_outgoing && connection.connection().remote_description().is_none() {
            debug!("Call {:?} waits for the caller's offer", self.id());
            return;
        }

        match connection.negotiate().await {
            Ok(Some(setup)) => {
                if let Err(e) = self
                    .send_call_signaling_data(&CallSignalingData::InitialSetup(setup))
                    .await
                {
                    self.terminate_with_error(e).await;
                }
            }
            Ok(None) => {}
            Err(e) => self.terminate_with_error(e).await,
        }
    }

    async fn send_ice_candidate(&self, candidate: IceCandidate) {
        let Some(wire) = candidate.to_wire() else {
            return;
        };
        let data = CallSignalingData::Candidates(Candidates {
            candidates: vec![wire],
        });
        if let Err(e) = self.send_call_signaling_data(&data).await {
            warn!("Failed to send ICE candidate for call {:?}: {}", self.id(), e);
        }
    }

    /// Serializes, encrypts and sends one signaling message.
    pub async fn send_call_signaling_data(&self, data: &CallSignalingData) -> Result<(), CallError> {
        let bytes = data.to_bytes()?;
        // Packets must reach the transport in counter order.
        let _order = self.send_order.lock().await;
        let packet = {
            let mut encryptor = self.encryptor.lock();
            encryptor
                .as_mut()
                .ok_or(CallError::NotConnected)?
                .encrypt_raw_packet(&bytes)?
        };
        let peer = self.peer()?;
        debug!("Sending {} signaling bytes for call {}", packet.bytes.len(), peer.id);
        self.services
            .transport
            .send_signaling_data(peer, packet.bytes)
            .await
    }

    /// Queues an encrypted blob from the peer and drains the queue.
    pub async fn on_update_phone_call_signaling_data(&self, data: Vec<u8>) {
        self.decrypt_queue.lock().push(data);
        self.process_decrypt_queue().await;
    }

    /// Drains the decrypt queue in arrival order.
    ///
    /// Only one task drains at a time. Items pushed while a drain is running
    /// are picked up by that drain, either in its current loop or in the
    /// re-check after it releases the guard.
    async fn process_decrypt_queue(&self) {
        loop {
            let Ok(guard) = self.draining.try_lock() else {
                return;
            };
            loop {
                if self.decryptor.lock().is_none() {
                    debug!("Call {:?} has no decryptor yet, keeping queue", self.id());
                    return;
                }
                let batch = std::mem::take(&mut *self.decrypt_queue.lock());
                if batch.is_empty() {
                    break;
                }
                for item in batch {
                    self.process_signaling_item(item).await;
                }
            }
            drop(guard);

            if self.decrypt_queue.lock().is_empty() {
                return;
            }
        }
    }

    async fn process_signaling_item(&self, item: Vec<u8>) {
        let plain = self
            .decryptor
            .lock()
            .as_mut()
            .and_then(|d| d.decrypt_raw_packet(&item));
        let Some(plain) = plain else {
            warn!("Dropping undecryptable signaling data for call {:?}", self.id());
            return;
        };

        let result = match CallSignalingData::from_slice(&plain) {
            Ok(data) => self.apply_call_signaling_data(data).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.terminate_with_error(e).await;
        }
    }

    /// Applies one decrypted signaling message. No-op on a closing call.
    pub async fn apply_call_signaling_data(&self, data: CallSignalingData) -> Result<(), CallError> {
        if self.is_closing() {
            return Ok(());
        }
        match data {
            CallSignalingData::InitialSetup(setup) => self.apply_initial_setup(setup).await,
            CallSignalingData::Candidates(Candidates { candidates }) => {
                let parsed = candidates
                    .iter()
                    .map(IceCandidate::from_wire)
                    .collect::<Result<Vec<_>, _>>()?;
                self.candidates.lock().extend(parsed);
                self.try_to_release_candidates().await;
                Ok(())
            }
        }
    }

    async fn apply_initial_setup(&self, mut setup: InitialSetup) -> Result<(), CallError> {
        let connection = self.connection().ok_or(CallError::NotConnected)?;
        if !self.is_outgoing {
            filter_video_to_vp8(&mut setup)?;
        }

        let _guard = connection.lock_negotiation().await;
        if self.is_closing() || connection.is_closed() {
            return Ok(());
        }

        connection.with_description(|d| d.apply_remote_setup(&setup))?;

        let is_answer = connection.take_offer_sent();
        let sdp = connection.with_description(|d| {
            d.generate_sdp(&GenerateSdpOptions {
                bundle: d.mids(),
                is_answer,
            })
        })?;
        let remote = if is_answer {
            SessionDescriptionInit::answer(sdp)
        } else {
            SessionDescriptionInit::offer(sdp)
        };
        connection.set_remote_description(remote).await?;
        if !is_answer {
            connection.set_offer_received(true);
        }

        self.try_to_release_candidates().await;

        if !is_answer {
            self.answer_with_local_media(&connection).await?;
        }
        Ok(())
    }

    /// Answers a remote offer so that the answer also carries our own media.
    ///
    /// The first answer only mirrors the offer, leaving every transceiver
    /// recv-only. Those transceivers are then bound to their entries and
    /// flipped to send-recv, the offer is re-applied and answered again, and
    /// only then is local publishing unlocked.
    async fn answer_with_local_media(&self, connection: &ConnectionInstance) -> Result<(), CallError> {
        let pc = connection.connection().clone();
        connection.append_stream_to_conference(&self.streams).await?;

        let answer = pc.create_answer().await?;
        connection.set_local_description(answer).await?;
        connection.take_offer_received();

        let recv_only: Vec<_> = pc
            .transceivers()
            .into_iter()
            .filter(|t| t.direction == Direction::RecvOnly)
            .collect();
        connection.with_description(|d| {
            for transceiver in &recv_only {
                if let Some(mid) = &transceiver.mid
                    && let Some(entry) = d.entry_by_mid_mut(mid)
                {
                    entry.transceiver = Some(transceiver.id);
                }
            }
        });
        for transceiver in &recv_only {
            pc.set_transceiver_direction(transceiver.id, Direction::SendRecv);
        }

        let offer = connection.with_description(|d| {
            d.generate_sdp(&GenerateSdpOptions {
                bundle: d.mids(),
                is_answer: false,
            })
        })?;
        connection
            .set_remote_description(SessionDescriptionInit::offer(offer))
            .await?;
        let answer = pc.create_answer().await?;
        connection.set_local_description(answer).await?;

        let setup = connection.local_setup()?;
        self.send_call_signaling_data(&CallSignalingData::InitialSetup(setup))
            .await?;

        self.streams.unlock();
        connection.append_stream_to_conference(&self.streams).await
    }

    /// Applies queued candidates once a remote description exists.
    async fn try_to_release_candidates(&self) {
        let Some(connection) = self.connection() else {
            return;
        };
        let pc = connection.connection();
        if pc.remote_description().is_none() {
            debug!(
                "Postponing {} candidates for call {:?}",
                self.candidates.lock().len(),
                self.id()
            );
            return;
        }

        let pending = std::mem::take(&mut *self.candidates.lock());
        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("Failed to add ICE candidate for call {:?}: {}", self.id(), e);
            }
        }
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.lock().len()
    }

    /// Ends the call. Only the first call has any effect.
    pub async fn hang_up(&self, reason: DiscardReason, discarded_by_other_party: bool) {
        if self.is_closing() || self.hang_up_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Hanging up call {:?} with {} (by peer: {})",
            self.id(),
            reason,
            discarded_by_other_party
        );

        let has_video = self.input_media_state.borrow().has_video()
            || self.output_media_state.lock().is_some_and(|s| s.has_video());
        let duration = self.duration();

        self.inner.lock().discard_reason = Some(reason);
        self.override_connection_state(Some(CallState::Closed));

        match self.connection() {
            Some(connection) => connection.close_connection_and_stream(&self.streams).await,
            None => self.streams.stop(),
        }

        if discarded_by_other_party {
            return;
        }
        let Ok(peer) = self.peer() else {
            debug!("Call {:?} never got a server id, nothing to discard", self.id());
            return;
        };
        if let Err(e) = self
            .services
            .transport
            .discard_call(peer, duration, reason, has_video)
            .await
        {
            error!("Failed to discard call {}: {}", peer.id, e);
        }
    }

    pub fn input_media_state(&self) -> MediaState {
        *self.input_media_state.borrow()
    }

    pub fn output_media_state(&self) -> Option<MediaState> {
        *self.output_media_state.lock()
    }

    /// Mutates the local media state; the change is pushed to the peer
    /// asynchronously, coalesced with other changes.
    pub fn update_input_media_state(&self, f: impl FnOnce(&mut MediaState)) {
        self.input_media_state.send_modify(f);
    }

    fn set_output_media_state(&self, state: MediaState) {
        *self.output_media_state.lock() = Some(state);
        self.listeners.dispatch(&CallEvent::MediaState(state));
    }

    fn spawn_media_state_sender(&self) {
        let mut changes = self.input_media_state.subscribe();
        let weak = self.weak_self.clone();
        let debounce = self.config.media_state_debounce;
        let handle = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                if debounce.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(debounce).await;
                }
                let state = *changes.borrow_and_update();
                let Some(call) = weak.upgrade() else {
                    break;
                };
                call.send_media_state(state).await;
            }
        });
        if let Some(old) = self.media_sender.lock().replace(handle) {
            old.abort();
        }
    }

    async fn send_media_state(&self, state: MediaState) {
        if !self.data_channel_open.load(Ordering::SeqCst) {
            return;
        }
        let Some(connection) = self.connection() else {
            return;
        };
        if let Err(e) = connection
            .send_data_channel_data(&DataChannelPayload::MediaState(state))
            .await
        {
            debug!("Could not send media state for call {:?}: {}", self.id(), e);
        }
    }

    fn apply_data_channel_data(&self, text: &str) {
        match serde_json::from_str::<DataChannelPayload>(text) {
            Ok(DataChannelPayload::MediaState(state)) => {
                debug!("Peer media state for call {:?}: {:?}", self.id(), state);
                self.set_output_media_state(state);
            }
            Err(e) => error!("Unknown data channel data for call {:?}: {}", self.id(), e),
        }
    }

    /// Acquires the requested sources that are not already present.
    pub async fn request_input_source(&self, audio: bool, video: bool, muted: bool) -> Result<(), CallError> {
        let _guard = self.streams.acquire_guard().await;
        let audio = audio && self.streams.track(TrackSource::Microphone).is_none();
        let video = video && self.streams.track(TrackSource::Camera).is_none();
        if !audio && !video {
            return Ok(());
        }

        let tracks = self.services.devices.get_user_media(audio, video).await?;
        for track in &tracks {
            if track.source() == TrackSource::Microphone {
                track.set_enabled(!muted);
            }
        }
        self.on_input_tracks(tracks).await;
        Ok(())
    }

    async fn on_input_tracks(&self, tracks: Vec<LocalTrack>) {
        let mut has_audio = false;
        for track in tracks {
            match track.source() {
                TrackSource::Microphone => has_audio = true,
                TrackSource::Camera => {
                    self.update_input_media_state(|s| s.video_state = VideoState::Active)
                }
                TrackSource::Screen => {
                    self.update_input_media_state(|s| s.screencast_state = VideoState::Active)
                }
            }
            self.streams.add_track(track);
        }
        if has_audio {
            self.on_muted_change();
        }
        self.republish().await;
    }

    async fn republish(&self) {
        if let Some(connection) = self.connection()
            && let Err(e) = connection.append_stream_to_conference(&self.streams).await
        {
            warn!("Failed to publish local media for call {:?}: {}", self.id(), e);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.streams
            .track(TrackSource::Microphone)
            .is_none_or(|t| !t.is_enabled())
    }

    /// Sets the microphone state, or flips it with `None`.
    pub fn set_muted(&self, muted: Option<bool>) {
        let Some(track) = self.streams.track(TrackSource::Microphone) else {
            return;
        };
        let enabled = match muted {
            Some(muted) => !muted,
            None => !track.is_enabled(),
        };
        track.set_enabled(enabled);
        self.on_muted_change();
    }

    fn on_muted_change(&self) {
        let muted = self.is_muted();
        self.update_input_media_state(|s| s.muted = muted);
        self.listeners.dispatch(&CallEvent::Muted(muted));
    }

    pub async fn toggle_muted(&self) {
        if let Err(e) = self.request_input_source(true, false, true).await {
            warn!("Failed to acquire microphone for call {:?}: {}", self.id(), e);
        }
        self.set_muted(None);
    }

    pub fn is_sharing_video(&self) -> bool {
        self.streams.track(TrackSource::Camera).is_some()
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.streams.track(TrackSource::Screen).is_some()
    }

    pub async fn toggle_video_sharing(&self) {
        if self.is_sharing_screen() {
            self.stop_video_sharing().await;
        }
        if self.is_sharing_video() {
            self.stop_video_sharing().await;
        } else {
            self.streams.set_types(vec![MediaKind::Audio, MediaKind::Video]);
            if let Err(e) = self.request_input_source(false, true, false).await {
                error!("Failed to start video for call {:?}: {}", self.id(), e);
            }
        }
    }

    pub async fn toggle_screen_sharing(&self) {
        if self.is_sharing_video() {
            self.stop_video_sharing().await;
        }
        if self.is_sharing_screen() {
            self.stop_video_sharing().await;
        } else {
            self.streams.set_types(vec![MediaKind::Audio, MediaKind::Screencast]);
            if let Err(e) = self.request_screen().await {
                error!("Failed to start screen sharing for call {:?}: {}", self.id(), e);
            }
        }
    }

    async fn request_screen(&self) -> Result<(), CallError> {
        let _guard = self.streams.acquire_guard().await;
        let tracks = self.services.devices.get_display_media().await?;
        self.on_input_tracks(tracks).await;
        Ok(())
    }

    /// Stops camera and screen sharing alike.
    pub async fn stop_video_sharing(&self) {
        self.update_input_media_state(|s| {
            s.video_state = VideoState::Inactive;
            s.screencast_state = VideoState::Inactive;
        });
        let camera = self.streams.remove_track(TrackSource::Camera);
        let screen = self.streams.remove_track(TrackSource::Screen);
        if camera.is_some() || screen.is_some() {
            self.republish().await;
        }
    }
}

/// Keeps only VP8 and its RTX companion in the video blocks of a setup.
///
/// Applied on the accepting side only, to match what the initiating clients
/// can decode. A video block without VP8 means the peer is incompatible.
pub fn filter_video_to_vp8(setup: &mut InitialSetup) -> Result<(), CallError> {
    for content in [&mut setup.video, &mut setup.screencast].into_iter().flatten() {
        let vp8 = content
            .payload_types
            .iter()
            .find(|pt| pt.name.eq_ignore_ascii_case("VP8"))
            .cloned()
            .ok_or_else(|| CallError::Incompatible("video offered without VP8".into()))?;
        let vp8_id = vp8.id.to_string();
        let rtx = content
            .payload_types
            .iter()
            .find(|pt| pt.parameters.get("apt") == Some(&vp8_id))
            .cloned();
        content.payload_types = std::iter::once(vp8).chain(rtx).collect();
    }
    Ok(())
}

impl Drop for CallInstance {
    fn drop(&mut self) {
        if let Some((_, timer)) = self.hang_up_timer.get_mut().take() {
            timer.abort();
        }
        if let Some(sender) = self.media_sender.get_mut().take() {
            sender.abort();
        }
    }
}
