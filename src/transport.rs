use crate::error::ReceiverError;
use crate::event::{EventBus, ReceiverEvent};
use crate::frames::{decode_frame, encode_frame, FrameKind, FrameRequest, FrameResponse, WireFrame};
use async_trait::async_trait;
use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

/// Caller-initiated close; the receiver does not probe after seeing it.
pub const CLOSE_CODE_LOCAL: u16 = 3000;
/// Keepalive gave up on the connection.
pub const CLOSE_CODE_KEEPALIVE: u16 = 3001;

/// What the socket reader surfaces: whole frames, then exactly one close.
#[derive(Debug)]
pub enum SocketEvent {
    Frame(Vec<u8>),
    Closed { code: u16, reason: String },
}

/// Write half of an established socket. The read half is the
/// [`SocketEvent`] stream handed over at connect time.
#[async_trait]
pub trait SocketLink: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), ReceiverError>;
    async fn close(&self, code: u16, reason: &str) -> Result<(), ReceiverError>;
}

pub struct SocketHalves {
    pub link: Arc<dyn SocketLink>,
    pub events: mpsc::Receiver<SocketEvent>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SocketHalves, ReceiverError>;
}

/// An inbound request plus the one-shot responder the handler must consume.
pub struct InboundRequest {
    pub request: FrameRequest,
    pub responder: Responder,
}

/// Answers exactly one request. Consuming `self` makes a second response to
/// the same id unrepresentable.
pub struct Responder {
    id: u64,
    link: Arc<dyn SocketLink>,
}

impl Responder {
    pub async fn respond(self, status: u16, message: &str) -> Result<(), ReceiverError> {
        let frame = WireFrame::response(FrameResponse {
            id: self.id,
            status,
            message: message.to_string(),
            body: Vec::new(),
        });
        self.link.send(encode_frame(&frame)?).await
    }
}

type PendingSlot = oneshot::Sender<Result<FrameResponse, ReceiverError>>;

/// Request/response multiplex over one socket. Outgoing requests are keyed
/// by a random 64-bit id; inbound requests are handed over in arrival order.
pub struct FrameTransport {
    link: Arc<dyn SocketLink>,
    pending: Mutex<HashMap<u64, PendingSlot>>,
    closed: AtomicBool,
    last_activity: StdMutex<Instant>,
    events: EventBus,
}

impl FrameTransport {
    /// Wire a transport onto established socket halves. Inbound requests are
    /// delivered on `requests`; the close notice (remote or local) arrives
    /// exactly once on `closes`.
    pub fn start(
        halves: SocketHalves,
        requests: mpsc::Sender<InboundRequest>,
        closes: mpsc::Sender<(u16, String)>,
        events: EventBus,
    ) -> Arc<Self> {
        let transport = Arc::new(Self {
            link: halves.link,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            last_activity: StdMutex::new(Instant::now()),
            events,
        });
        let reader = transport.clone();
        let mut events = halves.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SocketEvent::Frame(bytes) => {
                        reader.touch();
                        reader.route_frame(&bytes, &requests).await;
                    }
                    SocketEvent::Closed { code, reason } => {
                        reader.settle_closed(code, &reason).await;
                        let _ = closes.send((code, reason)).await;
                        return;
                    }
                }
            }
            // Stream ended without a close frame; report it as abnormal.
            let reason = "socket stream ended".to_string();
            reader.settle_closed(1006, &reason).await;
            let _ = closes.send((1006, reason)).await;
        });
        transport
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_activity.lock() {
            *guard = Instant::now();
        }
    }

    /// Instant of the last inbound frame of any kind.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|_| Instant::now())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn route_frame(&self, bytes: &[u8], requests: &mpsc::Sender<InboundRequest>) {
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(_) => {
                warn!("dropping undecodable frame ({} bytes)", bytes.len());
                return;
            }
        };
        match frame.kind {
            FrameKind::Request => match frame.request {
                Some(request) => {
                    debug!("inbound request {} {}", request.verb, request.path);
                    let responder = Responder {
                        id: request.id,
                        link: self.link.clone(),
                    };
                    let _ = requests.send(InboundRequest { request, responder }).await;
                }
                None => warn!("request frame without request payload"),
            },
            FrameKind::Response => match frame.response {
                Some(response) => self.settle_response(response).await,
                None => warn!("response frame without response payload"),
            },
            FrameKind::Unknown => warn!("ignoring frame of unknown kind"),
        }
    }

    async fn settle_response(&self, response: FrameResponse) {
        let slot = self.pending.lock().await.remove(&response.id);
        let Some(slot) = slot else {
            warn!("response for unknown request id {}", response.id);
            self.events
                .publish(ReceiverEvent::Error(ReceiverError::UnmatchedResponse(
                    response.id,
                )));
            return;
        };
        let outcome = if response.is_success() {
            Ok(response)
        } else {
            Err(ReceiverError::RequestFailed {
                status: response.status,
                message: response.message,
            })
        };
        let _ = slot.send(outcome);
    }

    async fn settle_closed(&self, code: u16, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<PendingSlot> = {
            let mut guard = self.pending.lock().await;
            guard.drain().map(|(_, slot)| slot).collect()
        };
        for slot in pending {
            let _ = slot.send(Err(ReceiverError::ConnectionClosed {
                code,
                reason: reason.to_string(),
            }));
        }
    }

    /// Issue a request and wait for its response. Fails without touching the
    /// wire when the transport is already closed.
    pub async fn send_request(
        &self,
        verb: &str,
        path: &str,
        body: Vec<u8>,
    ) -> Result<FrameResponse, ReceiverError> {
        if self.is_closed() {
            return Err(ReceiverError::ConnectionClosed {
                code: CLOSE_CODE_LOCAL,
                reason: "transport closed".to_string(),
            });
        }
        let id = OsRng.next_u64();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            let prev = pending.insert(id, tx);
            assert!(prev.is_none(), "request id collision");
        }
        let frame = WireFrame::request(FrameRequest {
            id,
            verb: verb.to_string(),
            path: path.to_string(),
            body,
        });
        let encoded = encode_frame(&frame)?;
        if let Err(e) = self.link.send(encoded).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        // A close that raced the insert has already drained the table; make
        // sure this slot cannot outlive it.
        if self.is_closed() && self.pending.lock().await.remove(&id).is_some() {
            return Err(ReceiverError::ConnectionClosed {
                code: CLOSE_CODE_LOCAL,
                reason: "transport closed".to_string(),
            });
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ReceiverError::ConnectionClosed {
                code: 1006,
                reason: "request abandoned".to_string(),
            }),
        }
    }

    /// Close the socket. Pending requests fail when the close notice comes
    /// back through the reader; if the link is already gone they are failed
    /// here instead.
    pub async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.link.close(code, reason).await.is_err() {
            self.settle_closed(code, reason).await;
        }
    }
}

/// In-process socket pair. The test side injects inbound frames and observes
/// everything the transport writes, the way the relay would.
pub struct MemorySocket {
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    events_tx: mpsc::Sender<SocketEvent>,
    closed: StdMutex<Option<(u16, String)>>,
}

#[async_trait]
impl SocketLink for MemorySocket {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), ReceiverError> {
        self.outbound_tx
            .send(bytes)
            .map_err(|_| ReceiverError::Transport("socket gone".to_string()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), ReceiverError> {
        if let Ok(mut guard) = self.closed.lock() {
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some((code, reason.to_string()));
        }
        let _ = self
            .events_tx
            .send(SocketEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }
}

/// Relay-side handle to a [`MemorySocket`].
pub struct MemorySocketHandle {
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    events_tx: mpsc::Sender<SocketEvent>,
    link: Arc<MemorySocket>,
}

impl MemorySocketHandle {
    /// Deliver raw bytes to the client as one socket message.
    pub async fn inject(&self, bytes: Vec<u8>) {
        let _ = self.events_tx.send(SocketEvent::Frame(bytes)).await;
    }

    pub async fn inject_frame(&self, frame: &WireFrame) {
        if let Ok(bytes) = encode_frame(frame) {
            self.inject(bytes).await;
        }
    }

    /// Close from the relay side.
    pub async fn close_remote(&self, code: u16, reason: &str) {
        let _ = self
            .events_tx
            .send(SocketEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Next frame the client wrote, decoded.
    pub async fn next_sent(&mut self) -> Option<WireFrame> {
        let bytes = self.outbound.recv().await?;
        decode_frame(&bytes).ok()
    }

    pub fn try_next_sent(&mut self) -> Option<WireFrame> {
        let bytes = self.outbound.try_recv().ok()?;
        decode_frame(&bytes).ok()
    }

    /// Close code recorded when the client closed, if it has.
    pub fn local_close(&self) -> Option<(u16, String)> {
        self.link.closed.lock().ok().and_then(|guard| guard.clone())
    }
}

pub fn memory_socket_pair() -> (SocketHalves, MemorySocketHandle) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(64);
    let link = Arc::new(MemorySocket {
        outbound_tx,
        events_tx: events_tx.clone(),
        closed: StdMutex::new(None),
    });
    let halves = SocketHalves {
        link: link.clone(),
        events: events_rx,
    };
    let handle = MemorySocketHandle {
        outbound: outbound_rx,
        events_tx,
        link,
    };
    (halves, handle)
}

/// Connector that hands out in-memory sockets and pushes the relay-side
/// handle of each connection to the test.
pub struct MemoryConnector {
    handles: mpsc::UnboundedSender<MemorySocketHandle>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemorySocketHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { handles: tx }), rx)
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<SocketHalves, ReceiverError> {
        let (halves, handle) = memory_socket_pair();
        self.handles
            .send(handle)
            .map_err(|_| ReceiverError::Transport("connector dropped".to_string()))?;
        Ok(halves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_transport(
        halves: SocketHalves,
    ) -> (
        Arc<FrameTransport>,
        mpsc::Receiver<InboundRequest>,
        mpsc::Receiver<(u16, String)>,
    ) {
        let (req_tx, req_rx) = mpsc::channel(16);
        let (close_tx, close_rx) = mpsc::channel(1);
        let transport = FrameTransport::start(halves, req_tx, close_tx, EventBus::new(16));
        (transport, req_rx, close_rx)
    }

    #[tokio::test]
    async fn request_response_correlation() {
        let (halves, mut handle) = memory_socket_pair();
        let (transport, _req_rx, _close_rx) = spawn_transport(halves);
        let pending = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("GET", "/v1/keepalive", Vec::new()).await }
        });
        let sent = handle.next_sent().await.expect("request frame");
        let request = sent.request.expect("request side");
        assert_eq!(request.verb, "GET");
        handle
            .inject_frame(&WireFrame::response(FrameResponse {
                id: request.id,
                status: 200,
                message: "OK".to_string(),
                body: Vec::new(),
            }))
            .await;
        let response = pending.await.unwrap().expect("response");
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn non_2xx_fails_the_caller() {
        let (halves, mut handle) = memory_socket_pair();
        let (transport, _req_rx, _close_rx) = spawn_transport(halves);
        let pending = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("PUT", "/v1/x", Vec::new()).await }
        });
        let request = handle.next_sent().await.unwrap().request.unwrap();
        handle
            .inject_frame(&WireFrame::response(FrameResponse {
                id: request.id,
                status: 409,
                message: "conflict".to_string(),
                body: Vec::new(),
            }))
            .await;
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            ReceiverError::RequestFailed {
                status: 409,
                message: "conflict".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unmatched_response_does_not_close() {
        let (halves, mut handle) = memory_socket_pair();
        let (transport, _req_rx, mut close_rx) = spawn_transport(halves);
        handle
            .inject_frame(&WireFrame::response(FrameResponse {
                id: 42,
                status: 200,
                message: "OK".to_string(),
                body: Vec::new(),
            }))
            .await;
        // Transport stays usable afterwards.
        let pending = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("GET", "/", Vec::new()).await }
        });
        let request = handle.next_sent().await.unwrap().request.unwrap();
        handle
            .inject_frame(&WireFrame::response(FrameResponse {
                id: request.id,
                status: 200,
                message: "OK".to_string(),
                body: Vec::new(),
            }))
            .await;
        assert!(pending.await.unwrap().is_ok());
        assert!(close_rx.try_recv().is_err());
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn remote_close_fails_pending_requests() {
        let (halves, mut handle) = memory_socket_pair();
        let (transport, _req_rx, mut close_rx) = spawn_transport(halves);
        let pending = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("GET", "/", Vec::new()).await }
        });
        let _ = handle.next_sent().await;
        handle.close_remote(1001, "going away").await;
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            ReceiverError::ConnectionClosed {
                code: 1001,
                reason: "going away".to_string()
            }
        );
        assert_eq!(close_rx.recv().await, Some((1001, "going away".to_string())));
        // Sends after close fail synchronously.
        let err = transport.send_request("GET", "/", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ReceiverError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn inbound_request_reaches_handler_and_responder_answers() {
        let (halves, mut handle) = memory_socket_pair();
        let (_transport, mut req_rx, _close_rx) = spawn_transport(halves);
        handle
            .inject_frame(&WireFrame::request(FrameRequest {
                id: 7,
                verb: "PUT".to_string(),
                path: "/messages".to_string(),
                body: vec![1, 2],
            }))
            .await;
        let inbound = req_rx.recv().await.expect("request");
        assert_eq!(inbound.request.path, "/messages");
        inbound.responder.respond(200, "OK").await.expect("respond");
        let frame = handle.next_sent().await.expect("response frame");
        let response = frame.response.expect("response side");
        assert_eq!(response.id, 7);
        assert_eq!(response.status, 200);
    }
}
