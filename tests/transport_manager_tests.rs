//! TransportManager against scripted transports
//!
//! Covers preferred/fallback selection, compound failure, one-shot failover
//! and session.update replay.

mod mock_transport;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mock_transport::{ConnectPlan, MockCredentials, MockFactory, test_credential, wait_until};
use parli_realtime::core::realtime::{ClientEvent, RealtimeVoice, ServerEvent, SessionConfig};
use parli_realtime::core::transport::{
    FailoverCredential, ManagerEvent, ManagerOptions, TransportError, TransportManager,
    TransportState, TransportType,
};

const WAIT: Duration = Duration::from_secs(2);

fn manager(factory: &Arc<MockFactory>, credentials: &Arc<MockCredentials>) -> TransportManager {
    TransportManager::new(
        factory.clone(),
        credentials.clone(),
        ManagerOptions {
            label: "test".to_string(),
            close_timeout: Duration::from_millis(200),
            failover_credential: FailoverCredential::Issue,
        },
    )
}

fn translation_config() -> SessionConfig {
    SessionConfig::translation("Translate English to Spanish", RealtimeVoice::Alloy, None)
}

#[tokio::test]
async fn test_connects_preferred_peer_transport() {
    let factory = MockFactory::healthy();
    let credentials = MockCredentials::new();
    let manager = manager(&factory, &credentials);

    let kind = manager.connect(&test_credential("t1"), false).await.unwrap();

    assert_eq!(kind, TransportType::Peer);
    assert_eq!(manager.state(), TransportState::Connected);
    assert_eq!(manager.active_transport(), TransportType::Peer);
    assert!(!manager.failed_over());
    assert_eq!(factory.created_count(TransportType::Stream), 0);

    let peer = factory.last(TransportType::Peer).unwrap();
    assert_eq!(peer.tokens.lock().as_slice(), ["t1".to_string()]);
}

#[tokio::test]
async fn test_prefer_stream_connects_stream_first() {
    let factory = MockFactory::healthy();
    let manager = manager(&factory, &MockCredentials::new());

    let kind = manager.connect(&test_credential("t1"), true).await.unwrap();

    assert_eq!(kind, TransportType::Stream);
    assert_eq!(factory.created_count(TransportType::Peer), 0);
}

#[tokio::test]
async fn test_falls_back_when_preferred_fails() {
    let factory = MockFactory::healthy();
    factory.set_plan(TransportType::Peer, ConnectPlan::Fail("ice failed".to_string()));
    let manager = manager(&factory, &MockCredentials::new());

    let kind = manager.connect(&test_credential("t1"), false).await.unwrap();

    assert_eq!(kind, TransportType::Stream);
    assert_eq!(manager.active_transport(), TransportType::Stream);
    // The failed peer transport was released
    let peer = factory.last(TransportType::Peer).unwrap();
    assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_compound_failure_when_both_fail() {
    let factory = MockFactory::healthy();
    factory.set_plan(TransportType::Peer, ConnectPlan::Fail("ice failed".to_string()));
    factory.set_plan(TransportType::Stream, ConnectPlan::Fail("handshake 401".to_string()));
    let manager = manager(&factory, &MockCredentials::new());

    let err = manager.connect(&test_credential("t1"), false).await.unwrap_err();

    match &err {
        TransportError::CompoundFailure {
            primary, fallback, ..
        } => {
            assert_eq!(*primary, TransportType::Peer);
            assert_eq!(*fallback, TransportType::Stream);
        }
        other => panic!("expected compound failure, got {other:?}"),
    }
    let text = err.to_string();
    assert!(text.contains("ice failed"));
    assert!(text.contains("handshake 401"));

    assert_eq!(manager.state(), TransportState::Failed);
    let status = manager.status();
    assert!(status.error.unwrap().contains("Both transports failed"));
}

#[tokio::test]
async fn test_operations_without_transport_are_not_connected() {
    let manager = manager(&MockFactory::healthy(), &MockCredentials::new());

    assert!(matches!(
        manager.send_message(ClientEvent::InputAudioBufferClear).await,
        Err(TransportError::NotConnected)
    ));
    assert!(matches!(
        manager.send_audio(bytes::Bytes::from_static(&[0, 0])).await,
        Err(TransportError::NotConnected)
    ));
    assert!(matches!(
        manager.commit_turn().await,
        Err(TransportError::NotConnected)
    ));
    assert!(matches!(
        manager.start_capture().await,
        Err(TransportError::NotConnected)
    ));
    assert!(matches!(
        manager.stop_capture().await,
        Err(TransportError::NotConnected)
    ));
}

#[tokio::test]
async fn test_session_config_sent_after_connect() {
    let factory = MockFactory::healthy();
    let manager = manager(&factory, &MockCredentials::new());
    manager.set_session_config(translation_config()).await.unwrap();

    manager.connect(&test_credential("t1"), false).await.unwrap();

    let peer = factory.last(TransportType::Peer).unwrap();
    assert_eq!(peer.sent_types(), vec!["session.update"]);
    match &peer.sent.lock()[0] {
        ClientEvent::SessionUpdate { session } => {
            assert_eq!(session, &translation_config());
            assert!(session.turn_detection.is_none());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_peer_loss_fails_over_to_stream_once() {
    let factory = MockFactory::healthy();
    let credentials = MockCredentials::new();
    let manager = manager(&factory, &credentials);
    manager.set_session_config(translation_config()).await.unwrap();
    manager.connect(&test_credential("t1"), false).await.unwrap();

    let peer = factory.last(TransportType::Peer).unwrap();
    peer.lose(TransportState::Failed);
    peer.lose(TransportState::Error);
    let (first, second) = tokio::join!(manager.fail_over(), manager.fail_over());
    assert!(first.is_ok());
    assert!(second.is_ok());

    assert!(wait_until(WAIT, || manager.failed_over()).await);
    assert_eq!(manager.active_transport(), TransportType::Stream);
    assert_eq!(manager.state(), TransportState::Connected);

    // Exactly one stream connect, with a freshly issued credential
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(factory.created_count(TransportType::Stream), 1);
    assert_eq!(credentials.issued.load(Ordering::SeqCst), 1);
    let stream = factory.last(TransportType::Stream).unwrap();
    assert_eq!(stream.tokens.lock().as_slice(), ["issued-1".to_string()]);

    // Old transport closed, session config replayed on the new one
    assert!(peer.closes.load(Ordering::SeqCst) >= 1);
    assert_eq!(stream.count_sent("session.update"), 1);
}

#[tokio::test]
async fn test_failover_uses_refresh_when_configured() {
    let factory = MockFactory::healthy();
    let credentials = MockCredentials::new();
    let manager = TransportManager::new(
        factory.clone(),
        credentials.clone(),
        ManagerOptions {
            failover_credential: FailoverCredential::Refresh,
            ..ManagerOptions::default()
        },
    );
    manager.connect(&test_credential("t1"), false).await.unwrap();

    factory.last(TransportType::Peer).unwrap().lose(TransportState::Disconnected);

    assert!(wait_until(WAIT, || manager.failed_over()).await);
    assert_eq!(credentials.refreshed.load(Ordering::SeqCst), 1);
    assert_eq!(credentials.issued.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failover_failure_is_terminal() {
    let factory = MockFactory::healthy();
    let credentials = MockCredentials::new();
    let manager = manager(&factory, &credentials);
    manager.connect(&test_credential("t1"), false).await.unwrap();

    factory.set_plan(TransportType::Stream, ConnectPlan::Fail("refused".to_string()));
    factory.last(TransportType::Peer).unwrap().lose(TransportState::Failed);

    assert!(wait_until(WAIT, || manager.state() == TransportState::Failed).await);
    assert!(!manager.failed_over());
    assert_eq!(manager.active_transport(), TransportType::None);
}

#[tokio::test]
async fn test_stream_loss_is_terminal() {
    let factory = MockFactory::healthy();
    let manager = manager(&factory, &MockCredentials::new());
    manager.connect(&test_credential("t1"), true).await.unwrap();

    let stream = factory.last(TransportType::Stream).unwrap();
    stream.lose(TransportState::Error);

    assert!(wait_until(WAIT, || manager.state() == TransportState::Failed).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // No automatic recovery of any kind
    assert_eq!(factory.total_created(), 1);
}

#[tokio::test]
async fn test_events_forwarded_in_order() {
    let factory = MockFactory::healthy();
    let manager = manager(&factory, &MockCredentials::new());
    let mut rx = manager.subscribe();
    manager.connect(&test_credential("t1"), false).await.unwrap();

    let peer = factory.last(TransportType::Peer).unwrap();
    peer.inject_audio(320);
    peer.inject_response_done();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        match tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            ManagerEvent::Message(ServerEvent::SessionCreated { .. }) => seen.push("created"),
            ManagerEvent::Audio(chunk) => {
                assert_eq!(chunk.data.len(), 320);
                seen.push("audio");
            }
            ManagerEvent::Message(ServerEvent::ResponseDone { .. }) => seen.push("done"),
            _ => {}
        }
    }
    assert_eq!(seen, vec!["created", "audio", "done"]);
}

#[tokio::test]
async fn test_status_stream_reports_failover() {
    let factory = MockFactory::healthy();
    let manager = manager(&factory, &MockCredentials::new());
    manager.connect(&test_credential("t1"), false).await.unwrap();
    let mut rx = manager.subscribe();

    factory.last(TransportType::Peer).unwrap().lose(TransportState::Failed);

    let status = loop {
        if let ManagerEvent::Status(status) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
            && status.state == TransportState::Connected
        {
            break status;
        }
    };
    assert_eq!(status.transport, TransportType::Stream);
    assert!(status.failed_over);
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_switch_transport_unsupported() {
    let manager = manager(&MockFactory::healthy(), &MockCredentials::new());
    let err = manager.switch_transport(TransportType::Stream).await.unwrap_err();
    assert!(matches!(err, TransportError::Unsupported(_)));
    assert!(err.to_string().contains("not yet supported"));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let factory = MockFactory::healthy();
    let manager = manager(&factory, &MockCredentials::new());
    manager.connect(&test_credential("t1"), false).await.unwrap();

    manager.close().await.unwrap();
    manager.close().await.unwrap();

    assert_eq!(manager.state(), TransportState::Disconnected);
    assert_eq!(manager.active_transport(), TransportType::None);
    let peer = factory.last(TransportType::Peer).unwrap();
    assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
    // Closing does not trigger failover
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(factory.created_count(TransportType::Stream), 0);
}
