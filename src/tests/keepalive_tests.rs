use super::*;
use crate::frames::{FrameResponse, WireFrame};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn silence_triggers_ping_then_close_3001() {
    let mut h = connect_harness().await;
    // Fifty seconds of silence: exactly one keepalive probe goes out.
    let frame = h.handle.next_sent().await.expect("ping");
    let request = frame.request.expect("request side");
    assert_eq!(request.verb, "GET");
    assert_eq!(request.path, "/v1/keepalive");
    // Nobody answers; one more second and the socket is forced closed.
    let mut closed = None;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        closed = h.handle.local_close();
        if closed.is_some() {
            break;
        }
    }
    let (code, reason) = closed.expect("socket closed");
    assert_eq!(code, 3001);
    assert_eq!(reason, "No response to keepalive request");
}

#[tokio::test(start_paused = true)]
async fn acked_ping_keeps_the_connection() {
    let mut h = connect_harness().await;
    for _ in 0..2 {
        let frame = h.handle.next_sent().await.expect("ping");
        let request = frame.request.expect("request side");
        assert_eq!(request.path, "/v1/keepalive");
        h.handle
            .inject_frame(&WireFrame::response(FrameResponse {
                id: request.id,
                status: 200,
                message: "OK".to_string(),
                body: Vec::new(),
            }))
            .await;
    }
    assert!(h.handle.local_close().is_none());
    assert_eq!(h.receiver.ready_state().await, crate::READY_STATE_OPEN);
}

#[tokio::test(start_paused = true)]
async fn inbound_traffic_resets_the_ping_timer() {
    let mut h = connect_harness().await;
    // Keep the socket chatty at 30 s intervals; 80 s of wall time pass
    // without a single probe.
    for n in 0..2u64 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let response = deliver(&mut h.handle, &h.key, 100 + n, &receipt_envelope(PEER, 1, n)).await;
        assert_eq!(response.status, 200);
    }
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(h.handle.try_next_sent().is_none());
    assert!(h.handle.local_close().is_none());
}
