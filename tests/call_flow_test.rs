// Integration test: two controllers call each other through the loopback
// server and in-memory peer connections, from request to hang-up.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use callcore::calls::{CallEvent, CallState, CallSound};
use callcore::test_utils::{FakePeerConnectionFactory, LoopbackServer, SoundCommand, TestParty, wait_until};
use callcore::types::call::{CallUpdate, DiscardReason};
use callcore::{CallConfig, CallInstance};

const ALICE: i64 = 100;
const BOB: i64 = 200;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn parties() -> (Arc<LoopbackServer>, TestParty, TestParty) {
    let server = LoopbackServer::new();
    let peers = FakePeerConnectionFactory::new();
    let alice = TestParty::new(&server, ALICE, peers.clone(), CallConfig::default());
    let bob = TestParty::new(&server, BOB, peers, CallConfig::default());
    (server, alice, bob)
}

/// Alice calls Bob, Bob accepts, and both sides reach CONNECTED.
async fn connect(alice: &TestParty, bob: &TestParty, video: bool) -> (Arc<CallInstance>, Arc<CallInstance>) {
    let outgoing = alice
        .controller
        .start_call(bob.user_id, video)
        .await
        .expect("start_call should succeed");
    let call_id = outgoing.id().expect("outgoing call has an id");
    assert!(call_id > 0, "server id replaces the temporary id");

    assert!(wait_until(|| bob.controller.call_by_id(call_id).is_some()).await);
    let incoming = bob.controller.call_by_id(call_id).unwrap();
    assert_eq!(incoming.connection_state(), CallState::Pending);

    bob.controller.accept_call(call_id).await.unwrap();
    let connected = wait_until(|| {
        outgoing.connection_state() == CallState::Connected
            && incoming.connection_state() == CallState::Connected
    })
    .await;
    assert!(
        connected,
        "both sides should connect, got {:?} / {:?}",
        outgoing.connection_state(),
        incoming.connection_state()
    );
    (outgoing, incoming)
}

#[tokio::test]
async fn test_call_connects_with_matching_key() {
    init_logging();
    let (_server, alice, bob) = parties();
    let mut alice_states = alice.controller.events().call_state.subscribe();
    let mut bob_states = bob.controller.events().call_state.subscribe();

    let (outgoing, incoming) = connect(&alice, &bob, false).await;

    assert!(outgoing.has_encryption_key());
    assert!(incoming.has_encryption_key());
    assert_eq!(outgoing.key_fingerprint(), incoming.key_fingerprint());
    assert!(outgoing.emoji_fingerprint().is_some());
    assert_eq!(outgoing.emoji_fingerprint(), incoming.emoji_fingerprint());
    assert!(outgoing.has_connected());
    assert!(!outgoing.has_hang_up_timeout(), "CONNECTED clears the watchdog");
    assert_eq!(outgoing.pending_candidates(), 0);
    assert_eq!(incoming.pending_candidates(), 0);

    for states in [&mut alice_states, &mut bob_states] {
        let mut seen = Vec::new();
        while let Ok(change) = states.try_recv() {
            seen.push(change.state);
        }
        let keys = seen.iter().position(|s| *s == CallState::ExchangingKeys);
        let connected = seen.iter().position(|s| *s == CallState::Connected);
        assert!(
            matches!((keys, connected), (Some(k), Some(c)) if k < c),
            "CONNECTED must follow EXCHANGING_KEYS: {:?}",
            seen
        );
    }

    // The peer's media state arrives over the data channel.
    assert!(wait_until(|| outgoing.output_media_state().is_some() && incoming.output_media_state().is_some()).await);
    assert_eq!(incoming.output_media_state().map(|s| s.muted), Some(false));
}

#[tokio::test]
async fn test_remote_tracks_are_announced() {
    init_logging();
    let (_server, alice, bob) = parties();

    let outgoing = alice.controller.start_call(BOB, false).await.unwrap();
    let tracks = Arc::new(AtomicUsize::new(0));
    let counter = tracks.clone();
    outgoing.add_event_listener(move |event| {
        if let CallEvent::Track(_) = event {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let call_id = outgoing.id().unwrap();
    assert!(wait_until(|| bob.controller.call_by_id(call_id).is_some()).await);
    bob.controller.accept_call(call_id).await.unwrap();

    assert!(wait_until(|| tracks.load(Ordering::SeqCst) > 0).await);
}

#[tokio::test]
async fn test_accepting_side_keeps_only_vp8() {
    init_logging();
    let (_server, alice, bob) = parties();
    let (outgoing, incoming) = connect(&alice, &bob, true).await;

    let offer = outgoing
        .connection()
        .and_then(|c| c.connection().local_description())
        .expect("caller has a local offer");
    assert!(offer.sdp.contains("H264"), "the caller offers every codec");

    let answer = incoming
        .connection()
        .and_then(|c| c.connection().local_description())
        .expect("callee has a local answer");
    assert!(answer.sdp.contains("VP8/90000"));
    assert!(!answer.sdp.contains("H264"));
    assert!(answer.sdp.contains("apt=96"));
    assert!(!answer.sdp.contains("apt=98"));

    assert!(incoming.is_sharing_video());
    assert!(wait_until(|| outgoing.output_media_state().is_some_and(|s| s.has_video())).await);
}

#[tokio::test]
async fn test_double_mute_toggle_sends_one_update() {
    init_logging();
    let (_server, alice, bob) = parties();
    let (outgoing, incoming) = connect(&alice, &bob, false).await;
    assert!(wait_until(|| incoming.output_media_state().is_some()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    incoming.add_event_listener(move |event| {
        if let CallEvent::MediaState(_) = event {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert!(!outgoing.is_muted());
    outgoing.toggle_muted().await;
    assert!(outgoing.is_muted());
    outgoing.toggle_muted().await;
    assert!(!outgoing.is_muted());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(incoming.output_media_state().map(|s| s.muted), Some(false));
}

#[tokio::test]
async fn test_hang_up_is_idempotent() {
    init_logging();
    let (server, alice, bob) = parties();
    let (outgoing, incoming) = connect(&alice, &bob, false).await;
    let call_id = outgoing.id().unwrap();

    tokio::join!(
        outgoing.hang_up(DiscardReason::Hangup, false),
        outgoing.hang_up(DiscardReason::Disconnect, false),
    );
    outgoing.hang_up(DiscardReason::Hangup, false).await;

    assert_eq!(outgoing.connection_state(), CallState::Closed);
    assert!(wait_until(|| incoming.connection_state() == CallState::Closed).await);

    let discards = server.discards();
    assert_eq!(discards.len(), 1, "only the first hang-up reports: {:?}", discards);
    assert_eq!(discards[0].call_id, call_id);
    assert_eq!(discards[0].by, ALICE);
    assert_eq!(outgoing.discard_reason(), Some(discards[0].reason));
    assert_eq!(incoming.discard_reason(), Some(discards[0].reason));

    assert!(alice.controller.call_by_id(call_id).is_none());
    assert!(wait_until(|| bob.controller.calls().is_empty()).await);
    assert!(
        alice.sounds.commands().contains(&SoundCommand::Play(CallSound::End, false)),
        "{:?}",
        alice.sounds.commands()
    );
}

#[tokio::test]
async fn test_tampered_and_replayed_blobs_are_dropped() {
    init_logging();
    let (server, alice, bob) = parties();
    let (outgoing, incoming) = connect(&alice, &bob, false).await;
    let call_id = outgoing.id().unwrap();

    let sent = server.signaling_from(ALICE);
    let last = sent.last().cloned().expect("alice sent signaling data");

    let mut tampered = last.clone();
    let idx = tampered.len() - 1;
    tampered[idx] ^= 0xff;
    server.deliver(BOB, CallUpdate::SignalingData { call_id, data: tampered });
    server.deliver(BOB, CallUpdate::SignalingData { call_id, data: last });
    server.deliver(BOB, CallUpdate::SignalingData { call_id, data: vec![0u8; 4] });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(incoming.connection_state(), CallState::Connected);
    assert!(server.discards().is_empty());
}

#[tokio::test]
async fn test_screen_sharing_replaces_camera() {
    init_logging();
    let (_server, alice, bob) = parties();
    let (outgoing, incoming) = connect(&alice, &bob, true).await;
    assert!(outgoing.is_sharing_video());

    outgoing.toggle_screen_sharing().await;
    assert!(outgoing.is_sharing_screen());
    assert!(!outgoing.is_sharing_video());
    assert!(
        wait_until(|| {
            incoming
                .output_media_state()
                .is_some_and(|s| s.screencast_state == callcore::calls::media::VideoState::Active)
        })
        .await
    );

    outgoing.toggle_screen_sharing().await;
    assert!(!outgoing.is_sharing_screen());
    assert!(!outgoing.input_media_state().has_video());
}
