//! Encrypted signaling payloads exchanged between the two call parties.
//!
//! The JSON shapes follow the tgcalls conventions so the fields line up with
//! what other clients send: a `@type` discriminator, camelCase keys and SSRCs
//! as decimal strings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::CallError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum CallSignalingData {
    InitialSetup(InitialSetup),
    Candidates(Candidates),
}

impl CallSignalingData {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CallError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a decrypted payload. Unknown `@type`s and malformed JSON are
    /// both protocol errors.
    pub fn from_slice(data: &[u8]) -> Result<Self, CallError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Transport credentials plus the codec blocks of every media kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSetup {
    pub fingerprints: Vec<DtlsFingerprint>,
    pub ufrag: String,
    pub pwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screencast: Option<MediaContent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub hash: String,
    pub setup: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaContent {
    pub ssrc: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssrc_groups: Vec<SsrcGroup>,
    #[serde(default)]
    pub payload_types: Vec<PayloadType>,
    #[serde(default)]
    pub rtp_extensions: Vec<RtpExtension>,
}

impl MediaContent {
    /// Every SSRC announced by this block, primary first.
    pub fn ssrcs(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for raw in std::iter::once(&self.ssrc)
            .chain(self.ssrc_groups.iter().flat_map(|g| g.ssrcs.iter()))
        {
            if let Ok(ssrc) = raw.parse::<u32>()
                && !out.contains(&ssrc)
            {
                out.push(ssrc);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrcGroup {
    pub semantics: String,
    pub ssrcs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadType {
    pub id: u8,
    pub name: String,
    pub clockrate: u32,
    #[serde(default)]
    pub channels: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback_types: Vec<FeedbackType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackType {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subtype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpExtension {
    pub id: u16,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidates {
    pub candidates: Vec<WireCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCandidate {
    #[serde(rename = "sdpString")]
    pub sdp_string: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETUP_JSON: &str = r#"{
        "@type": "InitialSetup",
        "fingerprints": [{"hash": "sha-256", "setup": "actpass", "fingerprint": "AA:BB"}],
        "ufrag": "uf",
        "pwd": "pw",
        "audio": {
            "ssrc": "1111",
            "payloadTypes": [
                {"id": 111, "name": "opus", "clockrate": 48000, "channels": 2,
                 "feedbackTypes": [{"type": "transport-cc"}],
                 "parameters": {"minptime": "10", "useinbandfec": "1"}}
            ],
            "rtpExtensions": [{"id": 1, "uri": "urn:ietf:params:rtp-hdrext:ssrc-audio-level"}]
        },
        "video": {
            "ssrc": "2222",
            "ssrcGroups": [{"semantics": "FID", "ssrcs": ["2222", "3333"]}],
            "payloadTypes": [],
            "rtpExtensions": []
        }
    }"#;

    #[test]
    fn test_parse_initial_setup() {
        let data = CallSignalingData::from_slice(SETUP_JSON.as_bytes()).unwrap();
        let CallSignalingData::InitialSetup(setup) = data else {
            panic!("expected InitialSetup");
        };
        let audio = setup.audio.as_ref().unwrap();
        assert_eq!(audio.payload_types[0].feedback_types[0].kind, "transport-cc");
        assert_eq!(audio.payload_types[0].feedback_types[0].subtype, "");
        assert_eq!(audio.payload_types[0].parameters["useinbandfec"], "1");
        assert_eq!(setup.video.as_ref().unwrap().ssrcs(), vec![2222, 3333]);
        assert!(setup.screencast.is_none());
    }

    #[test]
    fn test_candidates_wire_shape() {
        let data = CallSignalingData::Candidates(Candidates {
            candidates: vec![WireCandidate {
                sdp_string: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            }],
        });
        let json: serde_json::Value = serde_json::from_slice(&data.to_bytes().unwrap()).unwrap();
        assert_eq!(json["@type"], "Candidates");
        assert_eq!(
            json["candidates"][0]["sdpString"],
            "candidate:1 1 udp 1 10.0.0.1 5000 typ host"
        );
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = CallSignalingData::from_slice(br#"{"@type":"Bogus"}"#).unwrap_err();
        assert!(matches!(err, CallError::Protocol(_)));
        assert!(CallSignalingData::from_slice(b"not json").is_err());
    }
}
