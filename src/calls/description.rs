//! Negotiated media entries of a P2P call and remote SDP synthesis.
//!
//! The peer only ever sends an [`InitialSetup`], never raw SDP. Each side
//! therefore keeps its own view of the session: one [`ConferenceEntry`] per
//! m-line of its peer connection, with the local (send) and remote (recv)
//! sources bound to it. From that view the remote description is rebuilt
//! locally with [`ConferenceDescription::generate_sdp`].

use log::debug;
use std::fmt;

use super::error::CallError;
use super::media::{TrackKind, TransceiverId};
use super::sdp::{Direction, SCTP_PORT, SdpBuilder, SdpError};
use super::signaling::{DtlsFingerprint, InitialSetup, MediaContent, PayloadType, RtpExtension, SsrcGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Screencast,
    Application,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screencast => "screencast",
            Self::Application => "application",
        }
    }

    /// Kind of track carried by this entry, `None` for the data channel.
    pub fn track_kind(self) -> Option<TrackKind> {
        match self {
            Self::Audio => Some(TrackKind::Audio),
            Self::Video | Self::Screencast => Some(TrackKind::Video),
            Self::Application => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceGroup {
    pub semantics: String,
    pub sources: Vec<u32>,
}

/// SSRC binding of one entry leg. Video may use groups (simulcast, FID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    Single(u32),
    Groups(Vec<SourceGroup>),
}

impl EntrySource {
    /// Source announced by a wire codec block. Groups win over the bare ssrc.
    pub fn from_content(content: &MediaContent) -> Option<Self> {
        let groups: Vec<SourceGroup> = content
            .ssrc_groups
            .iter()
            .map(|g| SourceGroup {
                semantics: g.semantics.clone(),
                sources: g.ssrcs.iter().filter_map(|s| s.parse().ok()).collect(),
            })
            .filter(|g| !g.sources.is_empty())
            .collect();
        if !groups.is_empty() {
            return Some(Self::Groups(groups));
        }
        content.ssrc.parse().ok().map(Self::Single)
    }

    pub fn primary(&self) -> Option<u32> {
        match self {
            Self::Single(ssrc) => Some(*ssrc),
            Self::Groups(groups) => groups.first().and_then(|g| g.sources.first().copied()),
        }
    }

    pub fn contains(&self, ssrc: u32) -> bool {
        match self {
            Self::Single(s) => *s == ssrc,
            Self::Groups(groups) => groups.iter().any(|g| g.sources.contains(&ssrc)),
        }
    }

    fn ssrc_groups(&self) -> Vec<SsrcGroup> {
        match self {
            Self::Single(_) => Vec::new(),
            Self::Groups(groups) => groups
                .iter()
                .map(|g| SsrcGroup {
                    semantics: g.semantics.clone(),
                    ssrcs: g.sources.iter().map(u32::to_string).collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLeg {
    Send,
    Recv,
}

/// One negotiated m-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConferenceEntry {
    pub mid: String,
    pub kind: MediaKind,
    pub direction: Direction,
    pub transceiver: Option<TransceiverId>,
    pub send_source: Option<EntrySource>,
    pub recv_source: Option<EntrySource>,
}

impl ConferenceEntry {
    fn new(mid: String, kind: MediaKind) -> Self {
        Self {
            mid,
            kind,
            direction: Direction::SendRecv,
            transceiver: None,
            send_source: None,
            recv_source: None,
        }
    }

    pub fn has_source(&self, ssrc: u32) -> bool {
        [&self.send_source, &self.recv_source]
            .into_iter()
            .flatten()
            .any(|s| s.contains(ssrc))
    }

    fn leg(&self, leg: SourceLeg) -> &Option<EntrySource> {
        match leg {
            SourceLeg::Send => &self.send_source,
            SourceLeg::Recv => &self.recv_source,
        }
    }
}

/// Codec parameters the peer announced for one media kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecInfo {
    pub payload_types: Vec<PayloadType>,
    pub rtp_extensions: Vec<RtpExtension>,
}

impl From<&MediaContent> for CodecInfo {
    fn from(content: &MediaContent) -> Self {
        Self {
            payload_types: content.payload_types.clone(),
            rtp_extensions: content.rtp_extensions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTransport {
    pub ufrag: String,
    pub pwd: String,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateSdpOptions {
    pub bundle: Vec<String>,
    pub is_answer: bool,
}

#[derive(Debug, Clone)]
pub struct ConferenceDescription {
    session_id: String,
    next_mid: u32,
    entries: Vec<ConferenceEntry>,
    transport: Option<RemoteTransport>,
    audio: Option<CodecInfo>,
    video: Option<CodecInfo>,
    screencast: Option<CodecInfo>,
}

impl ConferenceDescription {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            next_mid: 0,
            entries: Vec::new(),
            transport: None,
            audio: None,
            video: None,
            screencast: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn entries(&self) -> &[ConferenceEntry] {
        &self.entries
    }

    pub fn mids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.mid.clone()).collect()
    }

    /// Appends an entry with the next sequential mid and returns that mid.
    pub fn create_entry(&mut self, kind: MediaKind) -> String {
        let mid = self.next_mid.to_string();
        self.next_mid += 1;
        debug!("Created {} entry with mid {}", kind, mid);
        self.entries.push(ConferenceEntry::new(mid.clone(), kind));
        mid
    }

    pub fn entry_by_mid(&self, mid: &str) -> Option<&ConferenceEntry> {
        self.entries.iter().find(|e| e.mid == mid)
    }

    pub fn entry_by_mid_mut(&mut self, mid: &str) -> Option<&mut ConferenceEntry> {
        self.entries.iter_mut().find(|e| e.mid == mid)
    }

    pub fn entry_by_source(&self, ssrc: u32) -> Option<&ConferenceEntry> {
        self.entries.iter().find(|e| e.has_source(ssrc))
    }

    pub fn find_entry(&self, pred: impl Fn(&ConferenceEntry) -> bool) -> Option<&ConferenceEntry> {
        self.entries.iter().find(|e| pred(e))
    }

    /// Returns the first send-recv entry of `kind` whose send (`for_send`) or
    /// receive leg is still unbound, creating one if every entry is taken.
    pub fn find_free_send_recv_entry(&mut self, kind: MediaKind, for_send: bool) -> String {
        let leg = if for_send { SourceLeg::Send } else { SourceLeg::Recv };
        let free = self.entries.iter().find(|e| {
            e.kind == kind && e.direction == Direction::SendRecv && e.leg(leg).is_none()
        });
        match free {
            Some(entry) => entry.mid.clone(),
            None => self.create_entry(kind),
        }
    }

    pub fn set_entry_source(
        &mut self,
        mid: &str,
        source: EntrySource,
        leg: SourceLeg,
    ) -> Result<(), CallError> {
        let entry = self
            .entry_by_mid_mut(mid)
            .ok_or_else(|| CallError::InvalidState(format!("no entry with mid {}", mid)))?;
        match leg {
            SourceLeg::Send => entry.send_source = Some(source),
            SourceLeg::Recv => entry.recv_source = Some(source),
        }
        Ok(())
    }

    /// The single send-recv data channel entry, created on first use.
    pub fn ensure_data_channel_entry(&mut self) -> String {
        if let Some(entry) = self.entries.iter().find(|e| e.kind == MediaKind::Application) {
            return entry.mid.clone();
        }
        self.create_entry(MediaKind::Application)
    }

    /// Stores the peer's transport credentials and codec blocks.
    pub fn set_remote_data(&mut self, setup: &InitialSetup) {
        self.transport = Some(RemoteTransport {
            ufrag: setup.ufrag.clone(),
            pwd: setup.pwd.clone(),
            fingerprints: setup.fingerprints.clone(),
        });
        if let Some(audio) = &setup.audio {
            self.audio = Some(audio.into());
        }
        if let Some(video) = &setup.video {
            self.video = Some(video.into());
        }
        if let Some(screencast) = &setup.screencast {
            self.screencast = Some(screencast.into());
        }
    }

    /// Applies a remote setup: stores its transport and codecs, binds every
    /// newly announced source to a free entry of its kind and makes sure the
    /// data channel entry exists.
    pub fn apply_remote_setup(&mut self, setup: &InitialSetup) -> Result<(), CallError> {
        self.set_remote_data(setup);
        let announced = [
            (MediaKind::Audio, &setup.audio),
            (MediaKind::Video, &setup.video),
            (MediaKind::Screencast, &setup.screencast),
        ];
        for (kind, content) in announced {
            let Some(source) = content.as_ref().and_then(EntrySource::from_content) else {
                continue;
            };
            let Some(primary) = source.primary() else {
                continue;
            };
            if self.entry_by_source(primary).is_some() {
                continue;
            }
            let mid = self.find_free_send_recv_entry(kind, false);
            self.set_entry_source(&mid, source, SourceLeg::Recv)?;
        }
        self.ensure_data_channel_entry();
        Ok(())
    }

    pub fn codec(&self, kind: MediaKind) -> Option<&CodecInfo> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Screencast => self.screencast.as_ref().or(self.video.as_ref()),
            MediaKind::Application => None,
        }
    }

    /// Builds the remote description from the stored peer data.
    ///
    /// Output is deterministic for a given description. Each entry writes the
    /// peer's source (recv leg) when present. Media entries for which the
    /// peer announced no codecs are written as rejected m-lines.
    pub fn generate_sdp(&self, options: &GenerateSdpOptions) -> Result<String, CallError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(SdpError::Missing("remote transport"))?;

        let mut builder = SdpBuilder::new();
        builder.add_header(&self.session_id, &options.bundle);

        for entry in self
            .entries
            .iter()
            .filter(|e| options.bundle.contains(&e.mid))
        {
            let kind = entry.kind.as_str();

            if entry.kind == MediaKind::Application {
                builder
                    .add_media_section(kind, &[SCTP_PORT.to_string()], &entry.mid, entry.direction)
                    .add_transport(&transport.ufrag, &transport.pwd, &transport.fingerprints)
                    .add_sctp_map();
                continue;
            }

            let Some(codec) = self.codec(entry.kind) else {
                builder
                    .add(format!(
                        "m={} 0 UDP/TLS/RTP/SAVPF 0",
                        super::sdp::media_line_type(kind)
                    ))
                    .add("c=IN IP4 0.0.0.0")
                    .add("a=inactive")
                    .add(format!("a=mid:{}", entry.mid));
                continue;
            };

            let direction = match entry.direction {
                Direction::SendOnly | Direction::RecvOnly if options.is_answer => {
                    entry.direction.reverse()
                }
                other => other,
            };
            let ids: Vec<String> = codec.payload_types.iter().map(|pt| pt.id.to_string()).collect();

            builder
                .add_media_section(kind, &ids, &entry.mid, direction)
                .add_transport(&transport.ufrag, &transport.pwd, &transport.fingerprints)
                .add_codecs(&codec.rtp_extensions, &codec.payload_types);

            let source = entry.recv_source.as_ref().or(entry.send_source.as_ref());
            if direction.is_sending()
                && let Some(source) = source
                && let Some(primary) = source.primary()
            {
                builder.add_ssrc(super::sdp::media_line_type(kind), primary, &source.ssrc_groups());
            }
        }

        Ok(builder.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::sdp::SessionDescription;
    use crate::calls::signaling::{DtlsFingerprint, FeedbackType};
    use std::collections::BTreeMap;

    fn setup() -> InitialSetup {
        let opus = PayloadType {
            id: 111,
            name: "opus".into(),
            clockrate: 48000,
            channels: 2,
            feedback_types: vec![FeedbackType {
                kind: "transport-cc".into(),
                subtype: String::new(),
            }],
            parameters: BTreeMap::from([
                ("minptime".to_string(), "10".to_string()),
                ("useinbandfec".to_string(), "1".to_string()),
            ]),
        };
        InitialSetup {
            fingerprints: vec![DtlsFingerprint {
                hash: "sha-256".into(),
                setup: "actpass".into(),
                fingerprint: "AA:BB:CC".into(),
            }],
            ufrag: "remoteUfrag".into(),
            pwd: "remotePasswordValue".into(),
            audio: Some(MediaContent {
                ssrc: "4242".into(),
                ssrc_groups: vec![],
                payload_types: vec![opus],
                rtp_extensions: vec![RtpExtension {
                    id: 1,
                    uri: "urn:ietf:params:rtp-hdrext:ssrc-audio-level".into(),
                }],
            }),
            video: None,
            screencast: None,
        }
    }

    #[test]
    fn test_mids_are_sequential_and_never_reused() {
        let mut d = ConferenceDescription::new("1");
        assert_eq!(d.create_entry(MediaKind::Audio), "0");
        assert_eq!(d.create_entry(MediaKind::Video), "1");
        assert_eq!(d.ensure_data_channel_entry(), "2");
        assert_eq!(d.ensure_data_channel_entry(), "2");
        assert_eq!(d.mids(), vec!["0", "1", "2"]);
    }

    #[test]
    fn test_find_free_send_recv_entry() {
        let mut d = ConferenceDescription::new("1");
        let audio = d.create_entry(MediaKind::Audio);

        let recv = d.find_free_send_recv_entry(MediaKind::Audio, false);
        assert_eq!(recv, audio);
        d.set_entry_source(&recv, EntrySource::Single(7), SourceLeg::Recv)
            .unwrap();

        // Send leg of the same entry is still free.
        assert_eq!(d.find_free_send_recv_entry(MediaKind::Audio, true), audio);
        // Receive leg is taken, so a new entry is created.
        assert_eq!(d.find_free_send_recv_entry(MediaKind::Audio, false), "1");
        assert_eq!(d.entry_by_source(7).unwrap().mid, audio);
    }

    #[test]
    fn test_grouped_source() {
        let content = MediaContent {
            ssrc: "10".into(),
            ssrc_groups: vec![SsrcGroup {
                semantics: "FID".into(),
                ssrcs: vec!["10".into(), "11".into()],
            }],
            payload_types: vec![],
            rtp_extensions: vec![],
        };
        let source = EntrySource::from_content(&content).unwrap();
        assert_eq!(source.primary(), Some(10));
        assert!(source.contains(11));
        assert!(!source.contains(12));
    }

    #[test]
    fn test_generate_requires_transport() {
        let mut d = ConferenceDescription::new("1");
        d.create_entry(MediaKind::Audio);
        assert!(d.generate_sdp(&GenerateSdpOptions::default()).is_err());
    }

    /// Generated SDP parses back to the same credentials and codec table.
    #[test]
    fn test_generate_sdp_round_trip() {
        let setup = setup();
        let mut d = ConferenceDescription::new("777");
        d.set_remote_data(&setup);
        let mid = d.find_free_send_recv_entry(MediaKind::Audio, false);
        d.set_entry_source(&mid, EntrySource::Single(4242), SourceLeg::Recv)
            .unwrap();
        d.ensure_data_channel_entry();

        let sdp = d
            .generate_sdp(&GenerateSdpOptions {
                bundle: d.mids(),
                is_answer: false,
            })
            .unwrap();
        let parsed = SessionDescription::parse(&sdp).unwrap();

        assert_eq!(parsed.session_id, "777");
        assert_eq!(parsed.ice_ufrag(), Some("remoteUfrag"));
        assert_eq!(parsed.ice_pwd(), Some("remotePasswordValue"));
        assert_eq!(parsed.fingerprints(), setup.fingerprints);
        assert_eq!(parsed.media.len(), 2);
        assert_eq!(
            parsed.media[0].payload_types(),
            setup.audio.as_ref().unwrap().payload_types
        );
        assert_eq!(parsed.media[0].ssrcs(), vec![4242]);
        assert_eq!(parsed.media[1].media, "application");
        assert!(sdp.contains("a=sctpmap:5000 webrtc-datachannel 256"));
        assert!(sdp.contains("a=fmtp:111 minptime=10;useinbandfec=1"));
    }

    #[test]
    fn test_apply_remote_setup_binds_new_sources_once() {
        let mut d = ConferenceDescription::new("1");
        let audio = d.create_entry(MediaKind::Audio);

        d.apply_remote_setup(&setup()).unwrap();
        assert_eq!(d.entry_by_source(4242).unwrap().mid, audio);
        assert_eq!(d.mids(), vec!["0", "1"]);
        assert_eq!(d.entries()[1].kind, MediaKind::Application);

        // Re-applying the same setup must not allocate more entries.
        d.apply_remote_setup(&setup()).unwrap();
        assert_eq!(d.mids(), vec!["0", "1"]);
        assert!(d.codec(MediaKind::Audio).is_some());
    }

    #[test]
    fn test_generate_is_deterministic() {
        let mut d = ConferenceDescription::new("1");
        d.set_remote_data(&setup());
        d.create_entry(MediaKind::Audio);
        let options = GenerateSdpOptions {
            bundle: d.mids(),
            is_answer: true,
        };
        assert_eq!(d.generate_sdp(&options).unwrap(), d.generate_sdp(&options).unwrap());
    }

    #[test]
    fn test_entry_without_codec_is_rejected() {
        let mut d = ConferenceDescription::new("1");
        d.set_remote_data(&setup());
        d.create_entry(MediaKind::Audio);
        d.create_entry(MediaKind::Video);
        let sdp = d
            .generate_sdp(&GenerateSdpOptions {
                bundle: d.mids(),
                is_answer: true,
            })
            .unwrap();
        assert!(sdp.contains("m=video 0 UDP/TLS/RTP/SAVPF 0\r\nc=IN IP4 0.0.0.0\r\na=inactive\r\na=mid:1"));
    }

    #[test]
    fn test_answer_flips_one_way_directions() {
        let mut d = ConferenceDescription::new("1");
        d.set_remote_data(&setup());
        let mid = d.create_entry(MediaKind::Audio);
        d.entry_by_mid_mut(&mid).unwrap().direction = Direction::RecvOnly;
        d.set_entry_source(&mid, EntrySource::Single(5), SourceLeg::Recv)
            .unwrap();

        let answer = d
            .generate_sdp(&GenerateSdpOptions {
                bundle: d.mids(),
                is_answer: true,
            })
            .unwrap();
        assert!(answer.contains("a=sendonly"));
        assert!(answer.contains("a=ssrc:5 cname:stream5"));

        let offer = d
            .generate_sdp(&GenerateSdpOptions {
                bundle: d.mids(),
                is_answer: false,
            })
            .unwrap();
        assert!(offer.contains("a=recvonly"));
        assert!(!offer.contains("a=ssrc:5"));
    }
}
