use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::SdpError;
use crate::calls::signaling::{
    DtlsFingerprint, FeedbackType, MediaContent, PayloadType, RtpExtension, SsrcGroup,
};

/// Single `a=` line, split at the first colon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAttribute {
    pub key: String,
    pub value: Option<String>,
}

impl SdpAttribute {
    fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((key, value)) => Self {
                key: key.to_string(),
                value: Some(value.to_string()),
            },
            None => Self {
                key: raw.to_string(),
                value: None,
            },
        }
    }
}

/// Media direction attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    /// The same direction seen from the other end.
    pub fn reverse(self) -> Self {
        match self {
            Self::SendOnly => Self::RecvOnly,
            Self::RecvOnly => Self::SendOnly,
            other => other,
        }
    }

    pub fn is_sending(self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

impl FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sendrecv" => Ok(Self::SendRecv),
            "sendonly" => Ok(Self::SendOnly),
            "recvonly" => Ok(Self::RecvOnly),
            "inactive" => Ok(Self::Inactive),
            _ => Err(()),
        }
    }
}

/// One `m=` section with its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub attributes: Vec<SdpAttribute>,
}

/// Parsed SDP: session-level attributes plus media sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_id: String,
    pub attributes: Vec<SdpAttribute>,
    pub media: Vec<MediaSection>,
}

impl SessionDescription {
    pub fn parse(sdp: &str) -> Result<Self, SdpError> {
        let mut session_id = String::new();
        let mut attributes = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        for (idx, raw) in sdp.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let line_no = idx + 1;
            let (kind, value) = line.split_once('=').ok_or(SdpError::MalformedLine {
                line: line_no,
                reason: "expected <type>=<value>",
            })?;

            match kind {
                "o" => {
                    session_id = value.split_whitespace().nth(1).unwrap_or_default().to_string();
                }
                "m" => media.push(parse_media_line(value, line_no)?),
                "a" => {
                    let attr = SdpAttribute::parse(value);
                    match media.last_mut() {
                        Some(section) => section.attributes.push(attr),
                        None => attributes.push(attr),
                    }
                }
                _ => {}
            }
        }

        if media.is_empty() {
            return Err(SdpError::NoMedia);
        }
        Ok(Self {
            session_id,
            attributes,
            media,
        })
    }

    fn session_attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .and_then(|a| a.value.as_deref())
    }

    /// ICE username fragment of the first section carrying one.
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.media
            .iter()
            .find_map(|m| m.attribute("ice-ufrag"))
            .or_else(|| self.session_attribute("ice-ufrag"))
    }

    pub fn ice_pwd(&self) -> Option<&str> {
        self.media
            .iter()
            .find_map(|m| m.attribute("ice-pwd"))
            .or_else(|| self.session_attribute("ice-pwd"))
    }

    /// DTLS fingerprints with their setup role, media level first.
    pub fn fingerprints(&self) -> Vec<DtlsFingerprint> {
        let section = self
            .media
            .iter()
            .find(|m| m.attribute("fingerprint").is_some());
        let (fingerprints, setup) = match section {
            Some(section) => (
                section.attribute_values("fingerprint").collect::<Vec<_>>(),
                section.attribute("setup"),
            ),
            None => (
                self.attributes
                    .iter()
                    .filter(|a| a.key == "fingerprint")
                    .filter_map(|a| a.value.as_deref())
                    .collect(),
                self.session_attribute("setup"),
            ),
        };

        fingerprints
            .into_iter()
            .filter_map(|raw| raw.split_once(' '))
            .map(|(hash, fingerprint)| DtlsFingerprint {
                hash: hash.to_string(),
                setup: setup.unwrap_or("actpass").to_string(),
                fingerprint: fingerprint.trim().to_string(),
            })
            .collect()
    }
}

fn parse_media_line(value: &str, line: usize) -> Result<MediaSection, SdpError> {
    let mut parts = value.split_whitespace();
    let media = parts.next().ok_or(SdpError::MalformedLine {
        line,
        reason: "missing media type",
    })?;
    let port = parts
        .next()
        .and_then(|p| p.split('/').next())
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or(SdpError::MalformedLine {
            line,
            reason: "missing or invalid port",
        })?;
    let protocol = parts.next().ok_or(SdpError::MalformedLine {
        line,
        reason: "missing protocol",
    })?;

    Ok(MediaSection {
        media: media.to_string(),
        port,
        protocol: protocol.to_string(),
        formats: parts.map(str::to_string).collect(),
        attributes: Vec::new(),
    })
}

impl MediaSection {
    pub fn attribute<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        self.attribute_values(key).next()
    }

    pub fn attribute_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.attributes
            .iter()
            .filter(move |a| a.key == key)
            .filter_map(|a| a.value.as_deref())
    }

    pub fn has_flag(&self, key: &str) -> bool {
        self.attributes.iter().any(|a| a.key == key)
    }

    pub fn mid(&self) -> Option<&str> {
        self.attribute("mid")
    }

    pub fn direction(&self) -> Direction {
        self.attributes
            .iter()
            .find_map(|a| a.key.parse::<Direction>().ok())
            .unwrap_or_default()
    }

    /// Builds the payload-type table.
    ///
    /// `rtpmap`, `rtcp-fb` and `fmtp` are independent attribute families keyed
    /// by payload id, so they are merged in three passes. Entries come out in
    /// `m=` line order; ids without an `rtpmap` are dropped.
    pub fn payload_types(&self) -> Vec<PayloadType> {
        let mut table: HashMap<u8, PayloadType> = HashMap::new();

        for raw in self.attribute_values("rtpmap") {
            let Some((id, encoding)) = raw.split_once(' ') else {
                continue;
            };
            let Ok(id) = id.parse::<u8>() else {
                continue;
            };
            let mut parts = encoding.trim().split('/');
            let name = parts.next().unwrap_or_default().to_string();
            let clockrate = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
            let channels = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
            table.insert(
                id,
                PayloadType {
                    id,
                    name,
                    clockrate,
                    channels,
                    feedback_types: Vec::new(),
                    parameters: Default::default(),
                },
            );
        }

        for raw in self.attribute_values("rtcp-fb") {
            let mut parts = raw.split_whitespace();
            let (Some(id), Some(kind)) = (parts.next(), parts.next()) else {
                continue;
            };
            let feedback = FeedbackType {
                kind: kind.to_string(),
                subtype: parts.next().unwrap_or_default().to_string(),
            };
            if id == "*" {
                for pt in table.values_mut() {
                    pt.feedback_types.push(feedback.clone());
                }
            } else if let Ok(id) = id.parse::<u8>()
                && let Some(pt) = table.get_mut(&id)
            {
                pt.feedback_types.push(feedback);
            }
        }

        for raw in self.attribute_values("fmtp") {
            let Some((id, params)) = raw.split_once(' ') else {
                continue;
            };
            let Some(pt) = id.parse::<u8>().ok().and_then(|id| table.get_mut(&id)) else {
                continue;
            };
            for pair in params.split(';') {
                if let Some((key, value)) = pair.trim().split_once('=') {
                    pt.parameters.insert(key.to_string(), value.to_string());
                }
            }
        }

        self.formats
            .iter()
            .filter_map(|f| f.parse::<u8>().ok())
            .filter_map(|id| table.remove(&id))
            .collect()
    }

    pub fn rtp_extensions(&self) -> Vec<RtpExtension> {
        self.attribute_values("extmap")
            .filter_map(|raw| {
                let mut parts = raw.split_whitespace();
                // "1/sendonly" carries a direction suffix
                let id = parts.next()?.split('/').next()?.parse().ok()?;
                let uri = parts.next()?.to_string();
                Some(RtpExtension { id, uri })
            })
            .collect()
    }

    /// SSRCs in order of first appearance.
    pub fn ssrcs(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for raw in self.attribute_values("ssrc") {
            if let Some(ssrc) = raw.split_whitespace().next().and_then(|s| s.parse().ok())
                && !out.contains(&ssrc)
            {
                out.push(ssrc);
            }
        }
        out
    }

    pub fn ssrc_groups(&self) -> Vec<SsrcGroup> {
        self.attribute_values("ssrc-group")
            .filter_map(|raw| {
                let mut parts = raw.split_whitespace();
                let semantics = parts.next()?.to_string();
                let ssrcs: Vec<String> = parts.map(str::to_string).collect();
                (!ssrcs.is_empty()).then_some(SsrcGroup { semantics, ssrcs })
            })
            .collect()
    }

    /// Wire codec block for this section, or `None` if it sends nothing.
    pub fn media_content(&self) -> Option<MediaContent> {
        let ssrc_groups = self.ssrc_groups();
        let primary = ssrc_groups
            .first()
            .and_then(|g| g.ssrcs.first().cloned())
            .or_else(|| self.ssrcs().first().map(u32::to_string))?;

        Some(MediaContent {
            ssrc: primary,
            ssrc_groups,
            payload_types: self.payload_types(),
            rtp_extensions: self.rtp_extensions(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO_SECTION: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 98\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:Ufr4\r\n\
a=ice-pwd:passwordpasswordpassword\r\n\
a=fingerprint:sha-256 AB:CD:EF\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=extmap:2/sendonly urn:ietf:params:rtp-hdrext:toffset\r\n\
a=sendrecv\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtcp-fb:96 nack pli\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:98 H264/90000\r\n\
a=fmtp:98 level-asymmetry-allowed=1;packetization-mode=1\r\n\
a=rtcp-fb:* transport-cc\r\n\
a=ssrc-group:FID 100 101\r\n\
a=ssrc:100 cname:abc\r\n\
a=ssrc:101 cname:abc\r\n";

    #[test]
    fn test_parse_sections() {
        let sdp = SessionDescription::parse(VIDEO_SECTION).unwrap();
        assert_eq!(sdp.session_id, "4611731400430051336");
        assert_eq!(sdp.media.len(), 1);
        let video = &sdp.media[0];
        assert_eq!(video.media, "video");
        assert_eq!(video.formats, vec!["96", "97", "98"]);
        assert_eq!(video.mid(), Some("0"));
        assert_eq!(video.direction(), Direction::SendRecv);
        assert_eq!(sdp.ice_ufrag(), Some("Ufr4"));
        assert_eq!(sdp.fingerprints()[0].fingerprint, "AB:CD:EF");
        assert_eq!(sdp.fingerprints()[0].setup, "actpass");
    }

    #[test]
    fn test_attribute_lookup_with_runtime_key() {
        let sdp = SessionDescription::parse(VIDEO_SECTION).unwrap();
        let video = &sdp.media[0];
        let keys: Vec<String> = ["setup", "ice-ufrag", "missing"].iter().map(|k| k.to_string()).collect();
        let values: Vec<Option<&str>> = keys.iter().map(|k| video.attribute(k)).collect();
        assert_eq!(values, vec![Some("actpass"), Some("Ufr4"), None]);
        assert_eq!(video.attribute_values("rtpmap").count(), 3);
    }

    /// rtpmap, rtcp-fb and fmtp end up on the same payload type.
    #[test]
    fn test_payload_type_merge() {
        let sdp = SessionDescription::parse(VIDEO_SECTION).unwrap();
        let pts = sdp.media[0].payload_types();
        assert_eq!(pts.len(), 3);

        let vp8 = &pts[0];
        assert_eq!(vp8.name, "VP8");
        assert_eq!(vp8.clockrate, 90000);
        assert_eq!(vp8.feedback_types.len(), 3);
        assert_eq!(vp8.feedback_types[1].subtype, "pli");

        assert_eq!(pts[1].parameters["apt"], "96");
        assert_eq!(pts[2].parameters["packetization-mode"], "1");
        assert_eq!(pts[2].parameters.len(), 2);
    }

    #[test]
    fn test_ssrc_groups_and_extensions() {
        let sdp = SessionDescription::parse(VIDEO_SECTION).unwrap();
        let content = sdp.media[0].media_content().unwrap();
        assert_eq!(content.ssrc, "100");
        assert_eq!(content.ssrc_groups[0].semantics, "FID");
        assert_eq!(content.ssrc_groups[0].ssrcs, vec!["100", "101"]);
        assert_eq!(content.rtp_extensions[0].id, 2);
        assert_eq!(sdp.media[0].ssrcs(), vec![100, 101]);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            SessionDescription::parse("v=0\r\ngarbage\r\n"),
            Err(SdpError::MalformedLine { line: 2, .. })
        ));
        assert_eq!(SessionDescription::parse("v=0\r\n"), Err(SdpError::NoMedia));
        assert!(SessionDescription::parse("v=0\r\nm=audio x RTP 0\r\n").is_err());
    }

    #[test]
    fn test_direction_reverse() {
        assert_eq!(Direction::SendOnly.reverse(), Direction::RecvOnly);
        assert_eq!(Direction::SendRecv.reverse(), Direction::SendRecv);
        assert!(!Direction::RecvOnly.is_sending());
    }
}
