use super::{SdpError, SessionDescription};
use crate::calls::description::MediaKind;
use crate::calls::signaling::InitialSetup;

impl InitialSetup {
    /// Extracts the wire setup from a local description.
    ///
    /// `kind_of_mid` tells screencast sections apart from camera video; any
    /// video mid it does not know is treated as camera video. Sections without
    /// an SSRC announce nothing and are skipped.
    pub fn from_sdp(
        sdp: &SessionDescription,
        kind_of_mid: impl Fn(&str) -> Option<MediaKind>,
    ) -> Result<Self, SdpError> {
        let ufrag = sdp.ice_ufrag().ok_or(SdpError::Missing("ice-ufrag"))?;
        let pwd = sdp.ice_pwd().ok_or(SdpError::Missing("ice-pwd"))?;
        let fingerprints = sdp.fingerprints();
        if fingerprints.is_empty() {
            return Err(SdpError::Missing("fingerprint"));
        }

        let mut setup = InitialSetup {
            fingerprints,
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
            audio: None,
            video: None,
            screencast: None,
        };

        for section in &sdp.media {
            let kind = match section.media.as_str() {
                "audio" => MediaKind::Audio,
                "video" => section
                    .mid()
                    .and_then(&kind_of_mid)
                    .filter(|k| *k == MediaKind::Screencast)
                    .unwrap_or(MediaKind::Video),
                _ => continue,
            };
            let slot = match kind {
                MediaKind::Audio => &mut setup.audio,
                MediaKind::Video => &mut setup.video,
                MediaKind::Screencast => &mut setup.screencast,
                MediaKind::Application => continue,
            };
            if slot.is_none() {
                *slot = section.media_content();
            }
        }

        Ok(setup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_OFFER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1 2 3\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=ice-ufrag:uf\r\n\
a=ice-pwd:pw\r\n\
a=fingerprint:sha-256 11:22\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=ssrc:1 cname:x\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:1\r\n\
a=sendrecv\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=ssrc:2 cname:x\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:2\r\n\
a=sendrecv\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=ssrc:3 cname:x\r\n\
m=application 9 DTLS/SCTP 5000\r\n\
a=mid:3\r\n";

    #[test]
    fn test_screencast_resolved_by_mid() {
        let sdp = SessionDescription::parse(LOCAL_OFFER).unwrap();
        let setup = InitialSetup::from_sdp(&sdp, |mid| {
            (mid == "2").then_some(MediaKind::Screencast)
        })
        .unwrap();

        assert_eq!(setup.ufrag, "uf");
        assert_eq!(setup.audio.as_ref().unwrap().ssrc, "1");
        assert_eq!(setup.audio.as_ref().unwrap().payload_types[0].channels, 2);
        assert_eq!(setup.video.as_ref().unwrap().ssrc, "2");
        assert_eq!(setup.screencast.as_ref().unwrap().ssrc, "3");
    }

    #[test]
    fn test_unknown_video_mid_is_camera() {
        let sdp = SessionDescription::parse(LOCAL_OFFER).unwrap();
        let setup = InitialSetup::from_sdp(&sdp, |_| None).unwrap();
        assert_eq!(setup.video.as_ref().unwrap().ssrc, "2");
        assert!(setup.screencast.is_none());
    }

    #[test]
    fn test_missing_credentials() {
        let sdp = SessionDescription::parse("v=0\r\nm=audio 9 RTP 0\r\na=mid:0\r\n").unwrap();
        assert_eq!(
            InitialSetup::from_sdp(&sdp, |_| None).unwrap_err(),
            SdpError::Missing("ice-ufrag")
        );
    }
}
