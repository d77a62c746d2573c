pub mod keepalive_tests;
pub mod lifecycle_tests;

use crate::config::{Credentials, ReceiverConfig};
use crate::contacts::MemoryContactStore;
use crate::content::{Content, DataMessage};
use crate::decrypt::pad;
use crate::envelope::{seal_envelope, Envelope, EnvelopeKind, SignalingKey};
use crate::event::{EventReceiver, ReceiverEvent};
use crate::frames::{FrameRequest, FrameResponse, WireFrame};
use crate::groups::MemoryGroupStore;
use crate::http::MemoryRelayApi;
use crate::session::MemorySessionStore;
use crate::transport::{MemoryConnector, MemorySocketHandle};
use crate::Receiver;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const SELF_NUMBER: &str = "+15550000001";
pub const SELF_DEVICE: u32 = 1;
pub const PEER: &str = "+15551234567";

const SIGNALING_SEED: [u8; 32] = [7u8; 32];
const SESSION_SEED: [u8; 32] = [3u8; 32];

pub struct Harness {
    pub receiver: Receiver,
    pub handle: MemorySocketHandle,
    pub sockets: mpsc::UnboundedReceiver<MemorySocketHandle>,
    /// The far side of every session; shares chain state with `sessions`.
    pub peer_sessions: Arc<MemorySessionStore>,
    pub sessions: Arc<MemorySessionStore>,
    pub groups: Arc<MemoryGroupStore>,
    pub contacts: Arc<MemoryContactStore>,
    pub api: Arc<MemoryRelayApi>,
    pub events: EventReceiver,
    pub key: SignalingKey,
}

pub fn base_config() -> ReceiverConfig {
    ReceiverConfig {
        ws_url: "wss://relay.test/v1/websocket/".to_string(),
        api_base_url: "https://relay.test".to_string(),
        attachment_base_url: "https://cdn.test".to_string(),
        number: SELF_NUMBER.to_string(),
        device_id: SELF_DEVICE,
        signaling_key: SIGNALING_SEED,
        credentials: Credentials {
            username: SELF_NUMBER.to_string(),
            password: "hunter2".to_string(),
        },
        keepalive_path: "/v1/keepalive".to_string(),
        keepalive_disconnect: true,
    }
}

pub async fn connect_harness() -> Harness {
    let (connector, mut sockets) = MemoryConnector::new();
    let api = MemoryRelayApi::new();
    let sessions = MemorySessionStore::new(SESSION_SEED);
    let peer_sessions = MemorySessionStore::new(SESSION_SEED);
    let groups = MemoryGroupStore::new();
    let contacts = MemoryContactStore::new();
    let receiver = Receiver::new(
        base_config(),
        connector,
        api.clone(),
        sessions.clone(),
        groups.clone(),
        contacts.clone(),
    );
    let events = receiver.subscribe();
    receiver.connect().await.expect("connect");
    let handle = sockets.recv().await.expect("socket");
    Harness {
        receiver,
        handle,
        sockets,
        peer_sessions,
        sessions,
        groups,
        contacts,
        api,
        events,
        key: SignalingKey::new(SIGNALING_SEED),
    }
}

pub fn content_envelope(source: &str, device: u32, timestamp: u64, ciphertext: Vec<u8>) -> Envelope {
    Envelope {
        kind: EnvelopeKind::Ciphertext,
        source: source.to_string(),
        source_device: device,
        timestamp,
        legacy_body: None,
        content: Some(ciphertext),
    }
}

pub fn legacy_envelope(source: &str, device: u32, timestamp: u64, ciphertext: Vec<u8>) -> Envelope {
    Envelope {
        kind: EnvelopeKind::Ciphertext,
        source: source.to_string(),
        source_device: device,
        timestamp,
        legacy_body: Some(ciphertext),
        content: None,
    }
}

pub fn receipt_envelope(source: &str, device: u32, timestamp: u64) -> Envelope {
    Envelope {
        kind: EnvelopeKind::Receipt,
        source: source.to_string(),
        source_device: device,
        timestamp,
        legacy_body: None,
        content: None,
    }
}

pub fn data_plaintext(message: &DataMessage) -> Vec<u8> {
    pad(&serde_json::to_vec(message).expect("serialize"), 0)
}

pub fn content_plaintext(content: &Content) -> Vec<u8> {
    pad(&serde_json::to_vec(content).expect("serialize"), 0)
}

/// Push one `PUT /messages` request at the client and return the response
/// frame it acked with.
pub async fn deliver(
    handle: &mut MemorySocketHandle,
    key: &SignalingKey,
    id: u64,
    envelope: &Envelope,
) -> FrameResponse {
    inject_envelope(handle, key, id, envelope).await;
    let frame = handle.next_sent().await.expect("ack frame");
    frame.response.expect("response side")
}

pub async fn inject_envelope(
    handle: &MemorySocketHandle,
    key: &SignalingKey,
    id: u64,
    envelope: &Envelope,
) {
    let mut nonce = [0u8; 24];
    nonce[..8].copy_from_slice(&id.to_be_bytes());
    let body = seal_envelope(key, nonce, envelope).expect("seal");
    handle
        .inject_frame(&WireFrame::request(FrameRequest {
            id,
            verb: "PUT".to_string(),
            path: "/messages".to_string(),
            body,
        }))
        .await;
}

pub async fn next_event(events: &mut EventReceiver) -> ReceiverEvent {
    events.recv().await.expect("event stream open")
}
