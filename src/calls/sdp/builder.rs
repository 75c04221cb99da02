use crate::calls::signaling::{DtlsFingerprint, PayloadType, RtpExtension, SsrcGroup};

use super::Direction;

/// Port written on every active m-line; the real one comes from ICE.
pub const MEDIA_PORT: u16 = 9;

/// SCTP port of the data channel.
pub const SCTP_PORT: u16 = 5000;

/// SDP media type for a conference entry kind. Screencast travels as video.
pub fn media_line_type(kind: &str) -> &str {
    if kind == "screencast" { "video" } else { kind }
}

fn connection_type(kind: &str) -> &'static str {
    if kind == "application" {
        "DTLS/SCTP"
    } else {
        "UDP/TLS/RTP/SAVPF"
    }
}

/// Line-oriented SDP writer.
#[derive(Debug, Default)]
pub struct SdpBuilder {
    lines: Vec<String>,
}

impl SdpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push(line.into());
        self
    }

    pub fn add_header(&mut self, session_id: &str, bundle: &[String]) -> &mut Self {
        self.add("v=0")
            .add(format!("o=- {} 2 IN IP4 0.0.0.0", session_id))
            .add("s=-")
            .add("t=0 0")
            .add("a=extmap-allow-mixed")
            .add(format!("a=group:BUNDLE {}", bundle.join(" ")))
            .add("a=ice-options:trickle")
            .add("a=msid-semantic:WMS *")
    }

    pub fn add_transport(
        &mut self,
        ufrag: &str,
        pwd: &str,
        fingerprints: &[DtlsFingerprint],
    ) -> &mut Self {
        self.add(format!("a=ice-ufrag:{}", ufrag))
            .add(format!("a=ice-pwd:{}", pwd))
            .add("a=ice-options:trickle");
        for fp in fingerprints {
            self.add(format!("a=fingerprint:{} {}", fp.hash, fp.fingerprint))
                .add(format!("a=setup:{}", fp.setup));
        }
        self
    }

    /// `m=` line followed by the connection, rtcp, mid and direction lines.
    pub fn add_media_section(
        &mut self,
        kind: &str,
        payload_ids: &[String],
        mid: &str,
        direction: Direction,
    ) -> &mut Self {
        self.add(format!(
            "m={} {} {} {}",
            media_line_type(kind),
            MEDIA_PORT,
            connection_type(kind),
            payload_ids.join(" ")
        ))
        .add("c=IN IP4 0.0.0.0")
        .add(format!("a=rtcp:{} IN IP4 0.0.0.0", MEDIA_PORT))
        .add("a=rtcp-mux")
        .add(format!("a=mid:{}", mid))
        .add(format!("a={}", direction))
    }

    pub fn add_codecs(&mut self, extensions: &[RtpExtension], payload_types: &[PayloadType]) -> &mut Self {
        for ext in extensions {
            self.add(format!("a=extmap:{} {}", ext.id, ext.uri));
        }
        for pt in payload_types {
            let channels = if pt.channels > 1 {
                format!("/{}", pt.channels)
            } else {
                String::new()
            };
            self.add(format!("a=rtpmap:{} {}/{}{}", pt.id, pt.name, pt.clockrate, channels));

            if !pt.parameters.is_empty() {
                let params: Vec<String> = pt
                    .parameters
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                self.add(format!("a=fmtp:{} {}", pt.id, params.join(";")));
            }

            for fb in &pt.feedback_types {
                if fb.subtype.is_empty() {
                    self.add(format!("a=rtcp-fb:{} {}", pt.id, fb.kind));
                } else {
                    self.add(format!("a=rtcp-fb:{} {} {}", pt.id, fb.kind, fb.subtype));
                }
            }
        }
        self
    }

    pub fn add_sctp_map(&mut self) -> &mut Self {
        self.add(format!("a=sctpmap:{} webrtc-datachannel 256", SCTP_PORT))
    }

    /// `msid`, `ssrc-group` and per-ssrc lines of one sending source.
    pub fn add_ssrc(&mut self, kind: &str, primary: u32, groups: &[SsrcGroup]) -> &mut Self {
        let stream = format!("stream{}", primary);
        let track = format!("{}{}", kind, primary);
        self.add(format!("a=msid:{} {}", stream, track));

        let mut sources: Vec<String> = Vec::new();
        for group in groups.iter().filter(|g| !g.ssrcs.is_empty()) {
            self.add(format!("a=ssrc-group:{} {}", group.semantics, group.ssrcs.join(" ")));
            for ssrc in &group.ssrcs {
                if !sources.contains(ssrc) {
                    sources.push(ssrc.clone());
                }
            }
        }
        if sources.is_empty() {
            sources.push(primary.to_string());
        }

        for ssrc in sources {
            self.add(format!("a=ssrc:{} cname:{}", ssrc, stream))
                .add(format!("a=ssrc:{} msid:{} {}", ssrc, stream, track))
                .add(format!("a=ssrc:{} mslabel:{}", ssrc, stream))
                .add(format!("a=ssrc:{} label:{}", ssrc, track));
        }
        self
    }

    pub fn finalize(&self) -> String {
        let mut out = self.lines.join("\r\n");
        out.push_str("\r\n");
        out
    }
}
