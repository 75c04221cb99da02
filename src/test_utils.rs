//! In-memory stand-ins for the host collaborators.
//!
//! [`FakePeerConnection`] speaks just enough SDP to negotiate with another
//! fake; [`LoopbackServer`] plays the messaging server for two (or more)
//! controllers; [`RecordingSoundPlayer`] and [`FakeMediaDevices`] record
//! what the engine asked for.

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use crate::calls::media::{
    DataChannelInit, LocalTrack, MediaDevices, PeerConnection, PeerConnectionEvent,
    PeerConnectionFactory, RemoteTrack, RtcConfiguration, SdpType, SessionDescriptionInit,
    TrackKind, TrackSource, TransceiverId, TransceiverInfo,
};
use crate::calls::sdp::{CandidateInfo, Direction, IceCandidate, SCTP_PORT, SdpBuilder, SessionDescription};
use crate::calls::{
    CallError, CallServices, CallSound, CallSoundPlayer, CallTransport, CallsController,
    DtlsFingerprint, FeedbackType, IceConnectionState, PayloadType, RtpExtension, X25519CallCrypto,
};
use crate::config::CallConfig;
use crate::types::call::{
    CallHeader, CallId, CallPeer, CallProtocol, CallUpdate, DhConfig, DiscardReason, PhoneCall,
    PhoneConnection, UserId,
};

static NEXT_PEER: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone)]
struct FakeTransceiver {
    id: TransceiverId,
    mid: Option<String>,
    kind: TrackKind,
    direction: Direction,
    track: Option<LocalTrack>,
    ssrc: u32,
}

struct FakeState {
    transceivers: Vec<FakeTransceiver>,
    data_channel: Option<DataChannelInit>,
    data_mid: Option<String>,
    local: Option<SessionDescriptionInit>,
    remote: Option<SessionDescriptionInit>,
    remote_candidates: Vec<IceCandidate>,
    announced_tracks: HashSet<String>,
    sent: Vec<String>,
    ice_state: IceConnectionState,
    negotiation_pending: bool,
    gathered: bool,
    closed: bool,
}

/// Peer connection that negotiates in memory.
///
/// Mids are assigned in creation order when an offer is created, the data
/// channel taking the next free one. Applying a remote offer creates
/// recv-only transceivers for unknown mids. ICE "connects" once both
/// descriptions are set and a remote candidate has been added.
pub struct FakePeerConnection {
    index: u32,
    ufrag: String,
    pwd: String,
    fingerprint: String,
    config: RtcConfiguration,
    events: mpsc::UnboundedSender<PeerConnectionEvent>,
    state: Mutex<FakeState>,
    linked: Mutex<Weak<FakePeerConnection>>,
}

impl FakePeerConnection {
    pub fn new(config: RtcConfiguration, events: mpsc::UnboundedSender<PeerConnectionEvent>) -> Self {
        let index = NEXT_PEER.fetch_add(1, Ordering::SeqCst);
        Self {
            index,
            ufrag: format!("uf{:04}", index),
            pwd: format!("fakepassword{:012}", index),
            fingerprint: format!("{:02X}:AA:BB:CC:DD", index % 256),
            config,
            events,
            state: Mutex::new(FakeState {
                transceivers: Vec::new(),
                data_channel: None,
                data_mid: None,
                local: None,
                remote: None,
                remote_candidates: Vec::new(),
                announced_tracks: HashSet::new(),
                sent: Vec::new(),
                ice_state: IceConnectionState::New,
                negotiation_pending: false,
                gathered: false,
                closed: false,
            }),
            linked: Mutex::new(Weak::new()),
        }
    }

    pub fn ufrag(&self) -> &str {
        &self.ufrag
    }

    pub fn config(&self) -> &RtcConfiguration {
        &self.config
    }

    /// Data channel messages sent so far.
    pub fn sent_data(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Track currently attached to a transceiver.
    pub fn track_of(&self, id: TransceiverId) -> Option<LocalTrack> {
        self.state
            .lock()
            .transceivers
            .iter()
            .find(|t| t.id == id)
            .and_then(|t| t.track.clone())
    }

    /// Forces an ICE state change, as a network event would.
    pub fn set_ice_connection_state(&self, state: IceConnectionState) {
        self.state.lock().ice_state = state;
        self.emit(PeerConnectionEvent::IceConnectionStateChange(state));
    }

    fn link(&self, other: &Arc<FakePeerConnection>) {
        *self.linked.lock() = Arc::downgrade(other);
    }

    fn emit(&self, event: PeerConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn request_negotiation(&self, state: &mut FakeState) {
        if state.negotiation_pending || state.closed {
            return;
        }
        state.negotiation_pending = true;
        self.emit(PeerConnectionEvent::NegotiationNeeded);
    }

    fn assign_mids(state: &mut FakeState) {
        let mut next = state
            .transceivers
            .iter()
            .filter_map(|t| t.mid.as_deref())
            .chain(state.data_mid.as_deref())
            .filter_map(|mid| mid.parse::<u32>().ok())
            .map(|mid| mid + 1)
            .max()
            .unwrap_or(0);
        for transceiver in state.transceivers.iter_mut().filter(|t| t.mid.is_none()) {
            transceiver.mid = Some(next.to_string());
            next += 1;
        }
        if state.data_channel.is_some() && state.data_mid.is_none() {
            state.data_mid = Some(next.to_string());
        }
    }

    fn transport(&self, setup: &str) -> Vec<DtlsFingerprint> {
        vec![DtlsFingerprint {
            hash: "sha-256".into(),
            setup: setup.into(),
            fingerprint: self.fingerprint.clone(),
        }]
    }

    fn write_media(
        &self,
        builder: &mut SdpBuilder,
        transceiver: &FakeTransceiver,
        direction: Direction,
        codecs: (Vec<RtpExtension>, Vec<PayloadType>),
        setup: &str,
    ) {
        let kind = track_kind_str(transceiver.kind);
        let mid = transceiver.mid.clone().unwrap_or_default();
        let ids: Vec<String> = codecs.1.iter().map(|pt| pt.id.to_string()).collect();
        builder
            .add_media_section(kind, &ids, &mid, direction)
            .add_transport(&self.ufrag, &self.pwd, &self.transport(setup))
            .add_codecs(&codecs.0, &codecs.1);
        if direction.is_sending() {
            builder.add_ssrc(kind, transceiver.ssrc, &[]);
        }
    }

    fn write_application(&self, builder: &mut SdpBuilder, mid: &str, setup: &str) {
        builder
            .add_media_section("application", &[SCTP_PORT.to_string()], mid, Direction::SendRecv)
            .add_transport(&self.ufrag, &self.pwd, &self.transport(setup))
            .add_sctp_map();
    }

    fn build_offer(&self, state: &FakeState) -> String {
        let mut mids: Vec<String> = state.transceivers.iter().filter_map(|t| t.mid.clone()).collect();
        mids.extend(state.data_mid.clone());

        let mut builder = SdpBuilder::new();
        builder.add_header(&self.index.to_string(), &mids);
        for transceiver in &state.transceivers {
            self.write_media(
                &mut builder,
                transceiver,
                transceiver.direction,
                default_codecs(transceiver.kind),
                "actpass",
            );
        }
        if let Some(mid) = &state.data_mid {
            self.write_application(&mut builder, mid, "actpass");
        }
        builder.finalize()
    }

    fn build_answer(&self, state: &FakeState, remote: &SessionDescription) -> String {
        let mids: Vec<String> = remote
            .media
            .iter()
            .filter_map(|m| m.mid().map(str::to_string))
            .collect();

        let mut builder = SdpBuilder::new();
        builder.add_header(&self.index.to_string(), &mids);
        for section in &remote.media {
            let Some(mid) = section.mid() else {
                continue;
            };
            if section.media == "application" {
                self.write_application(&mut builder, mid, "active");
                continue;
            }
            let transceiver = state
                .transceivers
                .iter()
                .find(|t| t.mid.as_deref() == Some(mid));
            let Some(transceiver) = transceiver.filter(|_| section.port != 0) else {
                builder
                    .add(format!("m={} 0 UDP/TLS/RTP/SAVPF 0", section.media))
                    .add("c=IN IP4 0.0.0.0")
                    .add("a=inactive")
                    .add(format!("a=mid:{}", mid));
                continue;
            };
            let direction = answer_direction(transceiver.direction, section.direction());
            self.write_media(
                &mut builder,
                transceiver,
                direction,
                (section.rtp_extensions(), section.payload_types()),
                "active",
            );
        }
        builder.finalize()
    }

    fn check_connected(&self, state: &mut FakeState) {
        if state.closed
            || state.ice_state == IceConnectionState::Connected
            || state.local.is_none()
            || state.remote.is_none()
            || state.remote_candidates.is_empty()
        {
            return;
        }
        state.ice_state = IceConnectionState::Connected;
        self.emit(PeerConnectionEvent::IceConnectionStateChange(IceConnectionState::Connected));
        if state.data_channel.is_some() {
            self.emit(PeerConnectionEvent::DataChannelOpen);
        }
    }
}

fn track_kind_str(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

fn answer_direction(local: Direction, remote: Direction) -> Direction {
    let send = local.is_sending() && matches!(remote, Direction::SendRecv | Direction::RecvOnly);
    let recv = matches!(local, Direction::SendRecv | Direction::RecvOnly) && remote.is_sending();
    match (send, recv) {
        (true, true) => Direction::SendRecv,
        (true, false) => Direction::SendOnly,
        (false, true) => Direction::RecvOnly,
        (false, false) => Direction::Inactive,
    }
}

fn payload(id: u8, name: &str, clockrate: u32, channels: u32, params: &[(&str, &str)], feedback: &[(&str, &str)]) -> PayloadType {
    PayloadType {
        id,
        name: name.into(),
        clockrate,
        channels,
        feedback_types: feedback
            .iter()
            .map(|(kind, subtype)| FeedbackType {
                kind: (*kind).into(),
                subtype: (*subtype).into(),
            })
            .collect(),
        parameters: params
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Codec table a browser would offer for a transceiver of `kind`.
pub fn default_codecs(kind: TrackKind) -> (Vec<RtpExtension>, Vec<PayloadType>) {
    match kind {
        TrackKind::Audio => (
            vec![RtpExtension {
                id: 1,
                uri: "urn:ietf:params:rtp-hdrext:ssrc-audio-level".into(),
            }],
            vec![payload(
                111,
                "opus",
                48000,
                2,
                &[("minptime", "10"), ("useinbandfec", "1")],
                &[("transport-cc", "")],
            )],
        ),
        TrackKind::Video => {
            let feedback = [("goog-remb", ""), ("transport-cc", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")];
            (
                vec![RtpExtension {
                    id: 2,
                    uri: "urn:ietf:params:rtp-hdrext:toffset".into(),
                }],
                vec![
                    payload(96, "VP8", 90000, 0, &[], &feedback),
                    payload(97, "rtx", 90000, 0, &[("apt", "96")], &[]),
                    payload(
                        98,
                        "H264",
                        90000,
                        0,
                        &[("packetization-mode", "1"), ("profile-level-id", "42e01f")],
                        &feedback,
                    ),
                    payload(99, "rtx", 90000, 0, &[("apt", "98")], &[]),
                ],
            )
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescriptionInit, CallError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::Negotiation("peer connection closed".into()));
        }
        state.negotiation_pending = false;
        Self::assign_mids(&mut state);
        Ok(SessionDescriptionInit::offer(self.build_offer(&state)))
    }

    async fn create_answer(&self) -> Result<SessionDescriptionInit, CallError> {
        let mut state = self.state.lock();
        let remote = state
            .remote
            .clone()
            .filter(|r| r.sdp_type == SdpType::Offer)
            .ok_or_else(|| CallError::Negotiation("no remote offer to answer".into()))?;
        let remote = SessionDescription::parse(&remote.sdp)?;
        state.negotiation_pending = false;
        Ok(SessionDescriptionInit::answer(self.build_answer(&state, &remote)))
    }

    async fn set_local_description(&self, desc: SessionDescriptionInit) -> Result<(), CallError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::Negotiation("peer connection closed".into()));
        }
        SessionDescription::parse(&desc.sdp)?;
        state.local = Some(desc);

        if !state.gathered {
            state.gathered = true;
            let candidate = format!(
                "candidate:{} 1 udp 2122260223 192.0.2.{} {} typ host generation 0",
                self.index,
                self.index % 250 + 1,
                40000 + self.index
            );
            self.emit(PeerConnectionEvent::IceCandidate(
                IceCandidate::new(candidate)
                    .with_sdp_mid("0")
                    .with_sdp_m_line_index(0)
                    .with_username_fragment(self.ufrag.clone()),
            ));
        }
        self.check_connected(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescriptionInit) -> Result<(), CallError> {
        let parsed = SessionDescription::parse(&desc.sdp)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::Negotiation("peer connection closed".into()));
        }

        for section in &parsed.media {
            let Some(mid) = section.mid() else {
                continue;
            };
            if section.media == "application" {
                if state.data_mid.is_none() {
                    state.data_mid = Some(mid.to_string());
                }
                continue;
            }

            let known = state.transceivers.iter().any(|t| t.mid.as_deref() == Some(mid));
            if !known && desc.sdp_type == SdpType::Offer {
                let kind = if section.media == "audio" {
                    TrackKind::Audio
                } else {
                    TrackKind::Video
                };
                let id = state.transceivers.len();
                state.transceivers.push(FakeTransceiver {
                    id,
                    mid: Some(mid.to_string()),
                    kind,
                    direction: Direction::RecvOnly,
                    track: None,
                    ssrc: self.index * 1000 + id as u32 + 1,
                });
            }

            if let Some(ssrc) = section.ssrcs().first()
                && state.announced_tracks.insert(mid.to_string())
            {
                let kind = if section.media == "audio" {
                    TrackKind::Audio
                } else {
                    TrackKind::Video
                };
                self.emit(PeerConnectionEvent::Track(RemoteTrack {
                    id: format!("remote-{}", ssrc),
                    kind,
                    mid: Some(mid.to_string()),
                }));
            }
        }

        state.remote = Some(desc);
        self.check_connected(&mut state);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescriptionInit> {
        self.state.lock().local.clone()
    }

    fn remote_description(&self) -> Option<SessionDescriptionInit> {
        self.state.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        candidate.candidate.parse::<CandidateInfo>()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(CallError::Negotiation("candidate before remote description".into()));
        }
        state.remote_candidates.push(candidate);
        self.check_connected(&mut state);
        Ok(())
    }

    async fn add_transceiver(&self, kind: TrackKind, direction: Direction) -> Result<TransceiverId, CallError> {
        let mut state = self.state.lock();
        let id = state.transceivers.len();
        state.transceivers.push(FakeTransceiver {
            id,
            mid: None,
            kind,
            direction,
            track: None,
            ssrc: self.index * 1000 + id as u32 + 1,
        });
        self.request_negotiation(&mut state);
        Ok(id)
    }

    fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.state
            .lock()
            .transceivers
            .iter()
            .map(|t| TransceiverInfo {
                id: t.id,
                mid: t.mid.clone(),
                kind: t.kind,
                direction: t.direction,
            })
            .collect()
    }

    fn set_transceiver_direction(&self, id: TransceiverId, direction: Direction) {
        if let Some(t) = self.state.lock().transceivers.iter_mut().find(|t| t.id == id) {
            t.direction = direction;
        }
    }

    async fn replace_track(&self, id: TransceiverId, track: Option<LocalTrack>) -> Result<(), CallError> {
        let mut state = self.state.lock();
        let transceiver = state
            .transceivers
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| CallError::Media(format!("no transceiver {}", id)))?;
        transceiver.track = track;
        Ok(())
    }

    async fn create_data_channel(&self, init: DataChannelInit) -> Result<(), CallError> {
        let mut state = self.state.lock();
        if state.data_channel.is_none() {
            state.data_channel = Some(init);
            self.request_negotiation(&mut state);
        }
        Ok(())
    }

    async fn send_data(&self, text: String) -> Result<(), CallError> {
        {
            let mut state = self.state.lock();
            if state.closed || state.ice_state != IceConnectionState::Connected {
                return Err(CallError::NotConnected);
            }
            state.sent.push(text.clone());
        }
        let linked = self.linked.lock().upgrade();
        if let Some(peer) = linked {
            peer.emit(PeerConnectionEvent::DataChannelMessage(text));
        }
        Ok(())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice_state
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.ice_state = IceConnectionState::Closed;
    }
}

/// Creates [`FakePeerConnection`]s and links them pairwise, so data sent on
/// one pops out of the other.
#[derive(Default)]
pub struct FakePeerConnectionFactory {
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    fail: AtomicBool,
}

impl FakePeerConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connections(&self) -> Vec<Arc<FakePeerConnection>> {
        self.created.lock().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerConnectionFactory {
    async fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::Media("peer connection unavailable".into()));
        }
        let pc = Arc::new(FakePeerConnection::new(config.clone(), events));
        let mut created = self.created.lock();
        if created.len() % 2 == 1
            && let Some(other) = created.last()
        {
            pc.link(other);
            other.link(&pc);
        }
        created.push(pc.clone());
        Ok(pc)
    }
}

/// Hands out fresh tracks and counts the requests.
#[derive(Default)]
pub struct FakeMediaDevices {
    requests: AtomicUsize,
    fail: AtomicBool,
}

impl FakeMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(&self, audio: bool, video: bool) -> Result<Vec<LocalTrack>, CallError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::Media("permission denied".into()));
        }
        let mut tracks = Vec::new();
        if audio {
            tracks.push(LocalTrack::new(format!("mic-{}", n), TrackSource::Microphone));
        }
        if video {
            tracks.push(LocalTrack::new(format!("cam-{}", n), TrackSource::Camera));
        }
        Ok(tracks)
    }

    async fn get_display_media(&self) -> Result<Vec<LocalTrack>, CallError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::Media("permission denied".into()));
        }
        Ok(vec![LocalTrack::new(format!("screen-{}", n), TrackSource::Screen)])
    }
}

/// What a [`RecordingSoundPlayer`] was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCommand {
    Play(CallSound, bool),
    Stop,
}

#[derive(Default)]
pub struct RecordingSoundPlayer {
    commands: Mutex<Vec<SoundCommand>>,
    current: Mutex<Option<CallSound>>,
}

impl RecordingSoundPlayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<SoundCommand> {
        self.commands.lock().clone()
    }

    pub fn played(&self) -> Vec<CallSound> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                SoundCommand::Play(sound, _) => Some(sound),
                SoundCommand::Stop => None,
            })
            .collect()
    }
}

impl CallSoundPlayer for RecordingSoundPlayer {
    fn play(&self, sound: CallSound, looped: bool) {
        *self.current.lock() = Some(sound);
        self.commands.lock().push(SoundCommand::Play(sound, looped));
    }

    fn play_if_different(&self, sound: CallSound) {
        if *self.current.lock() != Some(sound) {
            self.play(sound, false);
        }
    }

    fn stop(&self) {
        *self.current.lock() = None;
        self.commands.lock().push(SoundCommand::Stop);
    }
}

#[derive(Debug, Clone)]
struct ServerCall {
    header: CallHeader,
}

/// A discard reported to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardRecord {
    pub call_id: CallId,
    pub by: UserId,
    pub reason: DiscardReason,
    pub duration_secs: u32,
}

/// In-memory messaging server. Each registered user gets its updates in
/// order from a dedicated delivery task.
pub struct LoopbackServer {
    calls: Mutex<HashMap<CallId, ServerCall>>,
    endpoints: Mutex<HashMap<UserId, mpsc::UnboundedSender<CallUpdate>>>,
    discards: Mutex<Vec<DiscardRecord>>,
    signaling: Mutex<Vec<(UserId, CallId, Vec<u8>)>>,
    next_id: AtomicI64,
    pub dh_config: DhConfig,
    pub connections: Vec<PhoneConnection>,
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            discards: Mutex::new(Vec::new()),
            signaling: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
            dh_config: DhConfig {
                p: b"callcore-test-group".to_vec(),
                g: 3,
                random: (0u8..32).collect(),
                version: 1,
            },
            connections: vec![PhoneConnection {
                ip: "198.51.100.7".into(),
                port: 3478,
                turn: true,
                stun: true,
                username: Some("user".into()),
                password: Some("secret".into()),
            }],
        }
    }
}

impl LoopbackServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport_for(self: &Arc<Self>, user_id: UserId) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            server: self.clone(),
            user_id,
        })
    }

    /// Routes updates for `user_id` into `controller`, one at a time.
    pub fn register(&self, user_id: UserId, controller: &Arc<CallsController>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<CallUpdate>();
        let controller = Arc::downgrade(controller);
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.handle_update(update).await;
            }
        });
        self.endpoints.lock().insert(user_id, tx);
    }

    /// Pushes an update to a user as if the server sent it.
    pub fn deliver(&self, user_id: UserId, update: CallUpdate) {
        match self.endpoints.lock().get(&user_id) {
            Some(tx) => {
                let _ = tx.send(update);
            }
            None => debug!("No endpoint for user {}, dropping update", user_id),
        }
    }

    pub fn discards(&self) -> Vec<DiscardRecord> {
        self.discards.lock().clone()
    }

    /// Encrypted signaling blobs sent by `user_id`, in order.
    pub fn signaling_from(&self, user_id: UserId) -> Vec<Vec<u8>> {
        self.signaling
            .lock()
            .iter()
            .filter(|(from, _, _)| *from == user_id)
            .map(|(_, _, data)| data.clone())
            .collect()
    }

    fn call(&self, id: CallId) -> Result<ServerCall, CallError> {
        self.calls
            .lock()
            .get(&id)
            .cloned()
            .ok_or(CallError::NotFound(id))
    }

    fn other_party(call: &ServerCall, user_id: UserId) -> UserId {
        if call.header.admin_id == user_id {
            call.header.participant_id
        } else {
            call.header.admin_id
        }
    }
}

/// One user's view of the [`LoopbackServer`].
pub struct LoopbackTransport {
    server: Arc<LoopbackServer>,
    user_id: UserId,
}

#[async_trait]
impl CallTransport for LoopbackTransport {
    async fn get_dh_config(&self) -> Result<DhConfig, CallError> {
        Ok(self.server.dh_config.clone())
    }

    async fn request_call(
        &self,
        user_id: UserId,
        g_a_hash: &[u8],
        protocol: &CallProtocol,
        video: bool,
    ) -> Result<PhoneCall, CallError> {
        let id = self.server.next_id.fetch_add(1, Ordering::SeqCst);
        let header = CallHeader {
            id,
            access_hash: id * 7,
            date: Utc::now(),
            admin_id: self.user_id,
            participant_id: user_id,
            protocol: protocol.clone(),
            video,
        };
        self.server.calls.lock().insert(
            id,
            ServerCall {
                header: header.clone(),
            },
        );
        self.server.deliver(
            user_id,
            CallUpdate::PhoneCall(PhoneCall::Requested {
                header: header.clone(),
                g_a_hash: g_a_hash.to_vec(),
            }),
        );
        Ok(PhoneCall::Waiting(header))
    }

    async fn accept_call(
        &self,
        peer: CallPeer,
        g_b: &[u8],
        _protocol: &CallProtocol,
    ) -> Result<PhoneCall, CallError> {
        let call = self.server.call(peer.id)?;
        self.server.deliver(
            call.header.admin_id,
            CallUpdate::PhoneCall(PhoneCall::Accepted {
                header: call.header.clone(),
                g_b: g_b.to_vec(),
            }),
        );
        Ok(PhoneCall::Waiting(call.header))
    }

    async fn confirm_call(
        &self,
        peer: CallPeer,
        g_a: &[u8],
        key_fingerprint: i64,
        _protocol: &CallProtocol,
    ) -> Result<PhoneCall, CallError> {
        let call = self.server.call(peer.id)?;
        let established = PhoneCall::Established {
            header: call.header.clone(),
            g_a_or_b: g_a.to_vec(),
            key_fingerprint,
            connections: self.server.connections.clone(),
            p2p_allowed: true,
        };
        self.server.deliver(
            call.header.participant_id,
            CallUpdate::PhoneCall(established.clone()),
        );
        Ok(established)
    }

    async fn discard_call(
        &self,
        peer: CallPeer,
        duration_secs: u32,
        reason: DiscardReason,
        video: bool,
    ) -> Result<(), CallError> {
        let call = self.server.call(peer.id)?;
        self.server.discards.lock().push(DiscardRecord {
            call_id: peer.id,
            by: self.user_id,
            reason,
            duration_secs,
        });
        self.server.deliver(
            LoopbackServer::other_party(&call, self.user_id),
            CallUpdate::PhoneCall(PhoneCall::Discarded {
                id: peer.id,
                reason: Some(reason),
                video,
            }),
        );
        Ok(())
    }

    async fn send_signaling_data(&self, peer: CallPeer, data: Vec<u8>) -> Result<(), CallError> {
        let call = self.server.call(peer.id)?;
        self.server
            .signaling
            .lock()
            .push((self.user_id, peer.id, data.clone()));
        self.server.deliver(
            LoopbackServer::other_party(&call, self.user_id),
            CallUpdate::SignalingData {
                call_id: peer.id,
                data,
            },
        );
        Ok(())
    }
}

/// One user of a test: its controller and the fakes behind it.
pub struct TestParty {
    pub user_id: UserId,
    pub controller: Arc<CallsController>,
    pub peers: Arc<FakePeerConnectionFactory>,
    pub devices: Arc<FakeMediaDevices>,
    pub sounds: Arc<RecordingSoundPlayer>,
}

impl TestParty {
    /// Builds a controller for `user_id` and registers it on `server`.
    pub fn new(
        server: &Arc<LoopbackServer>,
        user_id: UserId,
        peers: Arc<FakePeerConnectionFactory>,
        config: CallConfig,
    ) -> Self {
        let devices = FakeMediaDevices::new();
        let sounds = RecordingSoundPlayer::new();
        let services = CallServices {
            transport: server.transport_for(user_id),
            crypto: Arc::new(X25519CallCrypto),
            peer_factory: peers.clone(),
            devices: devices.clone(),
            sounds: sounds.clone(),
            accept_override: None,
        };
        let controller = CallsController::new(config, services);
        server.register(user_id, &controller);
        Self {
            user_id,
            controller,
            peers,
            devices,
            sounds,
        }
    }
}

/// Polls `condition` until it holds or about two seconds of wall time pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}
