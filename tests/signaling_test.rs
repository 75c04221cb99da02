// Integration test: signaling payloads applied to a call outside the full
// loopback flow, plus the SDP <-> setup conversion of a local offer.

use std::collections::BTreeMap;
use std::sync::Arc;

use callcore::calls::media::{PeerConnection, PeerConnectionEvent, RtcConfiguration, TrackKind};
use callcore::calls::sdp::{Direction, SessionDescription};
use callcore::calls::{
    CallServices, CallSignalingData, Candidates, InitialSetup, MediaContent, MediaKind, PayloadType,
    WireCandidate, X25519CallCrypto, filter_video_to_vp8,
};
use callcore::test_utils::{
    FakeMediaDevices, FakePeerConnection, FakePeerConnectionFactory, LoopbackServer, RecordingSoundPlayer,
    default_codecs,
};
use callcore::{CallConfig, CallError, CallInstance, CallState};
use tokio::sync::mpsc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn incoming_call() -> Arc<CallInstance> {
    let server = LoopbackServer::new();
    let services = CallServices {
        transport: server.transport_for(7),
        crypto: Arc::new(X25519CallCrypto),
        peer_factory: FakePeerConnectionFactory::new(),
        devices: FakeMediaDevices::new(),
        sounds: RecordingSoundPlayer::new(),
        accept_override: None,
    };
    CallInstance::new(services, Arc::new(CallConfig::default()), 8, false)
}

fn candidates(lines: &[&str]) -> CallSignalingData {
    CallSignalingData::Candidates(Candidates {
        candidates: lines
            .iter()
            .map(|line| WireCandidate {
                sdp_string: line.to_string(),
            })
            .collect(),
    })
}

#[tokio::test]
async fn test_candidates_wait_for_remote_description() {
    init_logging();
    let call = incoming_call();

    call.apply_call_signaling_data(candidates(&[
        "candidate:1 1 udp 2122260223 192.0.2.10 40001 typ host generation 0",
        "candidate:2 1 udp 1686052607 203.0.113.5 51000 typ srflx raddr 192.0.2.10 rport 40001 generation 0",
    ]))
    .await
    .unwrap();
    assert_eq!(call.pending_candidates(), 2);

    call.apply_call_signaling_data(candidates(&[
        "candidate:3 1 udp 41885439 198.51.100.7 3478 typ relay raddr 203.0.113.5 rport 51000 generation 0",
    ]))
    .await
    .unwrap();
    assert_eq!(call.pending_candidates(), 3);
}

#[tokio::test]
async fn test_malformed_candidate_is_an_error() {
    init_logging();
    let call = incoming_call();
    let err = call
        .apply_call_signaling_data(candidates(&["not a candidate"]))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Sdp(_)));
    assert!(err.is_incompatibility());
    assert_eq!(call.pending_candidates(), 0);
}

#[tokio::test]
async fn test_setup_without_connection_is_rejected() {
    init_logging();
    let call = incoming_call();
    let setup = InitialSetup {
        fingerprints: vec![],
        ufrag: "u".into(),
        pwd: "p".into(),
        audio: None,
        video: None,
        screencast: None,
    };
    let err = call
        .apply_call_signaling_data(CallSignalingData::InitialSetup(setup))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotConnected));
}

#[tokio::test]
async fn test_closed_call_ignores_signaling() {
    init_logging();
    let call = incoming_call();
    call.hang_up(callcore::types::call::DiscardReason::Hangup, false)
        .await;
    assert_eq!(call.connection_state(), CallState::Closed);

    call.apply_call_signaling_data(candidates(&["garbage"]))
        .await
        .unwrap();
    assert_eq!(call.pending_candidates(), 0);
}

fn video_content(payload_types: Vec<PayloadType>) -> MediaContent {
    MediaContent {
        ssrc: "1234".into(),
        ssrc_groups: vec![],
        payload_types,
        rtp_extensions: vec![],
    }
}

fn codec(id: u8, name: &str, apt: Option<u8>) -> PayloadType {
    PayloadType {
        id,
        name: name.into(),
        clockrate: 90000,
        channels: 0,
        feedback_types: vec![],
        parameters: apt
            .map(|apt| BTreeMap::from([("apt".to_string(), apt.to_string())]))
            .unwrap_or_default(),
    }
}

#[test]
fn test_vp8_filter_keeps_vp8_and_its_rtx() {
    let mut setup = InitialSetup {
        fingerprints: vec![],
        ufrag: "u".into(),
        pwd: "p".into(),
        audio: None,
        video: Some(video_content(vec![
            codec(98, "H264", None),
            codec(99, "rtx", Some(98)),
            codec(100, "VP8", None),
            codec(101, "rtx", Some(100)),
            codec(102, "VP9", None),
        ])),
        screencast: Some(video_content(vec![codec(100, "vp8", None)])),
    };

    filter_video_to_vp8(&mut setup).unwrap();
    let video: Vec<u8> = setup.video.unwrap().payload_types.iter().map(|pt| pt.id).collect();
    assert_eq!(video, vec![100, 101]);
    let screencast: Vec<u8> = setup.screencast.unwrap().payload_types.iter().map(|pt| pt.id).collect();
    assert_eq!(screencast, vec![100]);
}

#[test]
fn test_vp8_filter_rejects_video_without_vp8() {
    let mut setup = InitialSetup {
        fingerprints: vec![],
        ufrag: "u".into(),
        pwd: "p".into(),
        audio: None,
        video: Some(video_content(vec![codec(98, "H264", None)])),
        screencast: None,
    };
    let err = filter_video_to_vp8(&mut setup).unwrap_err();
    assert!(matches!(err, CallError::Incompatible(_)));
}

#[tokio::test]
async fn test_local_offer_round_trips_through_setup() {
    init_logging();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = RtcConfiguration {
        ice_servers: vec![],
        ice_transport_policy: Default::default(),
        ice_candidate_pool_size: 0,
    };
    let pc = FakePeerConnection::new(config, tx);
    pc.add_transceiver(TrackKind::Audio, Direction::SendRecv).await.unwrap();
    pc.add_transceiver(TrackKind::Video, Direction::SendRecv).await.unwrap();
    assert!(matches!(rx.try_recv(), Ok(PeerConnectionEvent::NegotiationNeeded)));
    assert!(rx.try_recv().is_err(), "negotiation requests coalesce");

    let offer = pc.create_offer().await.unwrap();
    let sdp = SessionDescription::parse(&offer.sdp).unwrap();
    let setup = InitialSetup::from_sdp(&sdp, |mid| match mid {
        "0" => Some(MediaKind::Audio),
        "1" => Some(MediaKind::Video),
        _ => None,
    })
    .unwrap();

    assert_eq!(setup.ufrag, pc.ufrag());
    let audio = setup.audio.as_ref().unwrap();
    assert_eq!(audio.payload_types, default_codecs(TrackKind::Audio).1);
    assert_eq!(audio.rtp_extensions, default_codecs(TrackKind::Audio).0);
    let video = setup.video.as_ref().unwrap();
    assert_eq!(video.payload_types, default_codecs(TrackKind::Video).1);
    assert!(setup.screencast.is_none());

    let wire = CallSignalingData::InitialSetup(setup.clone()).to_bytes().unwrap();
    match CallSignalingData::from_slice(&wire).unwrap() {
        CallSignalingData::InitialSetup(parsed) => assert_eq!(parsed, setup),
        other => panic!("unexpected payload {:?}", other),
    }
}
