//! Reconnect ladder scenarios on paused time

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;

use common::*;
use webrelay::reconnect::{ReconnectConfig, ReconnectPhase, ReconnectionController};
use webrelay::session::InitParams;
use webrelay::state::{ConnectionBuildupState, GlobalConnectionState, TaskConnectionState};
use webrelay::transport::TransportEvent;

/// Connected WebRTC session with a controller watching it
async fn connected_webrtc() -> (Harness, ReconnectionController) {
    let harness = Harness::new();
    let controller =
        ReconnectionController::attach(harness.session.clone(), ReconnectConfig::default());

    harness.session.init(InitParams::default()).unwrap();
    let startup = harness.session.start();
    let transport = harness.factory.last();
    handshake_webrtc(&transport).await;
    answer_initial_requests(&transport).await;
    startup.await.unwrap();
    assert_eq!(harness.session.state().global_state(), GlobalConnectionState::Ok);

    (harness, controller)
}

#[tokio::test(start_paused = true)]
async fn test_soft_reconnect_recovers_within_phase_one() {
    let (harness, controller) = connected_webrtc().await;
    let first = harness.factory.last();
    let original_keys = harness.session.key_pair().unwrap();

    first.emit(TransportEvent::TaskState(TaskConnectionState::Disconnected));
    settle().await;

    // Soft stop, then a new attempt with the same keys
    assert!(first.channel().is_closed());
    assert_eq!(harness.factory.count(), 2);
    let second = harness.factory.last();
    assert_eq!(second.params.key_pair, original_keys);
    assert_eq!(second.params.trusted_peer_key, Some(PEER_KEY));
    assert_eq!(second.connects.load(Ordering::SeqCst), 1);
    assert_eq!(controller.phase(), ReconnectPhase::Phase1);
    assert!(controller.is_timer_armed());

    // Loaded data survives a soft reconnect
    assert!(!harness.session.data().conversations.is_empty());

    second.emit(TransportEvent::NewResponder);
    settle().await;
    assert_eq!(
        harness.session.state().buildup_state(),
        ConnectionBuildupState::PeerHandshake
    );
    assert!(!controller.is_timer_armed());
    assert_eq!(controller.phase(), ReconnectPhase::Idle);

    // Well past both deadlines: no phase 2, no redirect
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.factory.count(), 2);
    assert_eq!(controller.attempts(), 1);
    assert!(harness.frontend.navigations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_redirects_once_with_old_keys() {
    let (harness, controller) = connected_webrtc().await;
    let original_keys = harness.session.key_pair().unwrap();

    harness
        .factory
        .last()
        .emit(TransportEvent::TaskState(TaskConnectionState::Disconnected));
    settle().await;
    assert_eq!(controller.phase(), ReconnectPhase::Phase1);

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(controller.phase(), ReconnectPhase::Phase2);
    assert_eq!(harness.factory.count(), 3);
    assert_eq!(harness.factory.last().params.key_pair, original_keys);
    assert!(harness.frontend.navigations().is_empty());

    let resets = Arc::new(AtomicUsize::new(0));
    let counted = resets.clone();
    harness.session.state().on_reset(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_secs(41)).await;
    assert_eq!(controller.phase(), ReconnectPhase::Failed);
    assert_eq!(resets.load(Ordering::SeqCst), 1);

    let navigations = harness.frontend.navigations();
    assert_eq!(navigations.len(), 1);
    let welcome = navigations[0].clone().expect("old keys carried forward");
    assert_eq!(welcome.key_pair, original_keys);
    assert_eq!(welcome.peer_trusted_key, Some(PEER_KEY));

    assert_eq!(harness.session.state().buildup_state(), ConnectionBuildupState::New);
    assert_eq!(harness.session.state().global_state(), GlobalConnectionState::Error);
    assert!(!controller.is_timer_armed());

    // Terminal: nothing else happens afterwards
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert_eq!(harness.frontend.navigations().len(), 1);
    assert_eq!(harness.factory.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_webrtc_connection_waits() {
    let (harness, controller) = connected_webrtc().await;
    harness.session.data().typing.set("ECHOECHO", Value::from(true));

    harness
        .factory
        .last()
        .emit(TransportEvent::TaskState(TaskConnectionState::Reconnecting));
    settle().await;

    assert_eq!(harness.session.state().global_state(), GlobalConnectionState::Warning);
    assert!(harness.session.data().typing.is_empty());
    assert_eq!(controller.phase(), ReconnectPhase::Idle);
    assert_eq!(harness.factory.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_relayed_session_restarts_after_delay() {
    let harness = Harness::new();
    let controller =
        ReconnectionController::attach(harness.session.clone(), ReconnectConfig::default());

    harness.session.init(InitParams::default()).unwrap();
    let startup = harness.session.start();
    let first = harness.factory.last();
    handshake_relayed(&first).await;
    answer_initial_requests(&first).await;
    startup.await.unwrap();
    harness.session.data().typing.set("ECHOECHO", Value::from(true));

    first.emit(TransportEvent::PeerDisconnected);
    settle().await;

    assert!(harness.session.data().typing.is_empty());
    assert_eq!(controller.phase(), ReconnectPhase::Phase1);
    assert!(first.relayed.is_closed());
    // Still inside the restart delay
    assert_eq!(harness.factory.count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(harness.factory.count(), 2);
    let second = harness.factory.last();
    assert_eq!(second.connects.load(Ordering::SeqCst), 1);

    handshake_relayed(&second).await;
    answer_initial_requests(&second).await;
    assert_eq!(controller.phase(), ReconnectPhase::Idle);
    assert_eq!(harness.session.state().global_state(), GlobalConnectionState::Ok);
    assert!(harness.frontend.navigations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deliberate_stop_does_not_trigger_reconnect() {
    let (harness, controller) = connected_webrtc().await;

    harness
        .session
        .stop(webrelay::session::StopOptions::default())
        .await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(controller.phase(), ReconnectPhase::Idle);
    assert_eq!(harness.factory.count(), 1);
    assert!(harness.frontend.navigations().is_empty());
}
