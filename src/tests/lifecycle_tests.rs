use super::*;
use crate::error::ReceiverError;
use crate::event::ReceiverEvent;
use crate::frames::{FrameResponse, WireFrame};
use crate::{READY_STATE_NONE, READY_STATE_OPEN};
use std::time::Duration;

#[tokio::test]
async fn remote_close_probes_and_reconnects_once() {
    let mut h = connect_harness().await;
    h.handle.close_remote(1011, "server restart").await;
    // Probe succeeds, so a second socket is opened.
    let replacement = tokio::time::timeout(Duration::from_secs(5), h.sockets.recv())
        .await
        .expect("reconnect in time")
        .expect("connector alive");
    drop(replacement);
    assert_eq!(h.receiver.ready_state().await, READY_STATE_OPEN);
    h.receiver.close().await;
}

#[tokio::test]
async fn failed_probe_emits_error_and_stops() {
    let mut h = connect_harness().await;
    h.api.set_reachable(false).await;
    h.handle.close_remote(1011, "server gone").await;
    match next_event(&mut h.events).await {
        ReceiverEvent::Error(ReceiverError::Http(_)) => {}
        other => panic!("unexpected event {other:?}"),
    }
    // No replacement socket shows up.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), h.sockets.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn caller_close_is_quiet() {
    let mut h = connect_harness().await;
    h.receiver.close().await;
    let (code, reason) = h.handle.local_close().expect("closed");
    assert_eq!(code, 3000);
    assert_eq!(reason, "called close");
    // No probe-driven reconnect for a caller-initiated close.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), h.sockets.recv())
            .await
            .is_err()
    );
    assert_eq!(h.receiver.ready_state().await, READY_STATE_NONE);
}

#[tokio::test]
async fn ready_state_reports_sentinel_before_connect() {
    let (connector, _sockets) = crate::transport::MemoryConnector::new();
    let receiver = crate::Receiver::new(
        base_config(),
        connector,
        crate::http::MemoryRelayApi::new(),
        crate::session::MemorySessionStore::new([1u8; 32]),
        crate::groups::MemoryGroupStore::new(),
        crate::contacts::MemoryContactStore::new(),
    );
    assert_eq!(receiver.ready_state().await, READY_STATE_NONE);
}

#[tokio::test]
async fn unmatched_response_is_harmless_end_to_end() {
    let mut h = connect_harness().await;
    h.handle
        .inject_frame(&WireFrame::response(FrameResponse {
            id: 42,
            status: 200,
            message: "OK".to_string(),
            body: Vec::new(),
        }))
        .await;
    match next_event(&mut h.events).await {
        ReceiverEvent::Error(ReceiverError::UnmatchedResponse(42)) => {}
        other => panic!("unexpected event {other:?}"),
    }
    // The connection keeps working afterwards.
    let response = deliver(&mut h.handle, &h.key, 50, &receipt_envelope(PEER, 1, 9)).await;
    assert_eq!(response.status, 200);
    assert!(h.handle.local_close().is_none());
}
