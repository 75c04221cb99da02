// Integration test: hang-up timers under a paused clock.

use std::time::Duration;

use callcore::CallConfig;
use callcore::calls::CallState;
use callcore::test_utils::{FakePeerConnectionFactory, LoopbackServer, TestParty, wait_until};
use callcore::types::call::DiscardReason;

const ALICE: i64 = 1;
const BOB: i64 = 2;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(timeout: Duration) -> CallConfig {
    CallConfig {
        hang_up_timeout: timeout,
        ..CallConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_incoming_call_is_missed() {
    init_logging();
    let server = LoopbackServer::new();
    let peers = FakePeerConnectionFactory::new();
    // The caller waits longer, so the callee's timer is the one that fires.
    let alice = TestParty::new(&server, ALICE, peers.clone(), config(Duration::from_secs(120)));
    let bob = TestParty::new(&server, BOB, peers, config(Duration::from_secs(45)));

    let outgoing = alice.controller.start_call(BOB, false).await.unwrap();
    let call_id = outgoing.id().unwrap();
    assert!(wait_until(|| bob.controller.call_by_id(call_id).is_some()).await);
    let incoming = bob.controller.call_by_id(call_id).unwrap();
    assert!(incoming.has_hang_up_timeout());

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(incoming.connection_state(), CallState::Pending);
    assert!(server.discards().is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    let discards = server.discards();
    assert_eq!(discards.len(), 1);
    assert_eq!(discards[0].by, BOB);
    assert_eq!(discards[0].reason, DiscardReason::Missed);
    assert_eq!(incoming.connection_state(), CallState::Closed);

    assert!(wait_until(|| outgoing.connection_state() == CallState::Closed).await);
    assert_eq!(outgoing.discard_reason(), Some(DiscardReason::Missed));
    assert!(alice.controller.current_call().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_outgoing_call_hangs_up() {
    init_logging();
    let server = LoopbackServer::new();
    let peers = FakePeerConnectionFactory::new();
    let alice = TestParty::new(&server, ALICE, peers.clone(), config(Duration::from_secs(30)));
    let bob = TestParty::new(&server, BOB, peers, config(Duration::from_secs(300)));

    let outgoing = alice.controller.start_call(BOB, false).await.unwrap();
    assert_eq!(outgoing.connection_state(), CallState::Pending);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let discards = server.discards();
    assert_eq!(discards.len(), 1);
    assert_eq!(discards[0].by, ALICE);
    assert_eq!(discards[0].reason, DiscardReason::Hangup);
    assert!(wait_until(|| bob.controller.calls().is_empty()).await);
}

#[tokio::test(start_paused = true)]
async fn test_rearming_replaces_the_previous_timer() {
    init_logging();
    let server = LoopbackServer::new();
    let peers = FakePeerConnectionFactory::new();
    let alice = TestParty::new(&server, ALICE, peers.clone(), config(Duration::from_secs(600)));
    let _bob = TestParty::new(&server, BOB, peers, config(Duration::from_secs(600)));

    let outgoing = alice.controller.start_call(BOB, false).await.unwrap();
    outgoing.set_hang_up_timeout(Duration::from_secs(5), DiscardReason::Disconnect);
    outgoing.set_hang_up_timeout(Duration::from_secs(20), DiscardReason::Hangup);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(outgoing.connection_state(), CallState::Pending);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(outgoing.connection_state(), CallState::Closed);
    assert_eq!(outgoing.discard_reason(), Some(DiscardReason::Hangup));

    outgoing.clear_hang_up_timeout();
    assert!(!outgoing.has_hang_up_timeout());
}

#[tokio::test(start_paused = true)]
async fn test_key_exchange_watchdog_disconnects() {
    init_logging();
    let server = LoopbackServer::new();
    let peers = FakePeerConnectionFactory::new();
    let alice = TestParty::new(&server, ALICE, peers.clone(), config(Duration::from_secs(600)));
    let bob = TestParty::new(&server, BOB, peers, CallConfig::default());

    let outgoing = alice.controller.start_call(BOB, false).await.unwrap();
    let call_id = outgoing.id().unwrap();
    assert!(wait_until(|| bob.controller.call_by_id(call_id).is_some()).await);
    let incoming = bob.controller.call_by_id(call_id).unwrap();

    // Stalled in the key exchange: the watchdog takes over the missed timer.
    incoming.override_connection_state(Some(CallState::ExchangingKeys));
    assert!(incoming.has_hang_up_timeout());

    tokio::time::sleep(Duration::from_secs(44)).await;
    assert_eq!(incoming.connection_state(), CallState::ExchangingKeys);
    assert!(server.discards().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(incoming.connection_state(), CallState::Closed);
    assert_eq!(incoming.discard_reason(), Some(DiscardReason::Disconnect));
    let discards = server.discards();
    assert_eq!(discards.len(), 1);
    assert_eq!(discards[0].by, BOB);
    assert_eq!(discards[0].reason, DiscardReason::Disconnect);
}
