pub mod attachments;
pub mod config;
pub mod contacts;
pub mod content;
pub mod decrypt;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod event;
pub mod frames;
pub mod groups;
pub mod http;
pub mod keepalive;
pub mod queue;
pub mod session;
pub mod transport;
pub mod ws;

use config::ReceiverConfig;
use contacts::ContactStore;
use decrypt::ReplayRegistry;
use dispatch::Dispatcher;
use envelope::{open_envelope, Address, SignalingKey};
use error::ReceiverError;
use event::{EventBus, EventReceiver, ReceiverEvent};
use groups::GroupStore;
use http::RelayApi;
use keepalive::KeepAliveConfig;
use log::debug;
use queue::SerialQueue;
use session::SessionStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use transport::{
    FrameTransport, InboundRequest, SocketConnector, CLOSE_CODE_LOCAL,
};

/// No socket at all; the numeric ready states of the underlying stream
/// start at 0.
pub const READY_STATE_NONE: i32 = -1;
pub const READY_STATE_OPEN: i32 = 1;
pub const READY_STATE_CLOSED: i32 = 3;

struct Connection {
    transport: Arc<FrameTransport>,
    keepalive: JoinHandle<()>,
}

/// The receive half of the messaging client: one socket to the relay, a
/// keepalive on top of it, the serial envelope queue behind it, and a typed
/// event stream out the side.
#[derive(Clone)]
pub struct Receiver {
    config: ReceiverConfig,
    connector: Arc<dyn SocketConnector>,
    api: Arc<dyn RelayApi>,
    contacts: Arc<dyn ContactStore>,
    dispatcher: Dispatcher,
    replays: ReplayRegistry,
    events: EventBus,
    signaling_key: SignalingKey,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Receiver {
    pub fn new(
        config: ReceiverConfig,
        connector: Arc<dyn SocketConnector>,
        api: Arc<dyn RelayApi>,
        sessions: Arc<dyn SessionStore>,
        groups: Arc<dyn GroupStore>,
        contacts: Arc<dyn ContactStore>,
    ) -> Self {
        let events = EventBus::new(256);
        let replays = ReplayRegistry::new();
        let dispatcher = Dispatcher::new(
            config.number.clone(),
            config.device_id,
            sessions,
            groups,
            contacts.clone(),
            api.clone(),
            replays.clone(),
            events.clone(),
        );
        let signaling_key = SignalingKey::new(config.signaling_key);
        Self {
            config,
            connector,
            api,
            contacts,
            dispatcher,
            replays,
            events,
            signaling_key,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Open (or reopen) the socket to the relay and start the receive
    /// pipeline. Any previous socket is closed first.
    pub fn connect(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ReceiverError>> + Send + '_>>
    {
        Box::pin(async move {
            self.teardown("reconnecting").await;
            let halves = self.connector.connect(&self.config.ws_url).await?;
            let (request_tx, request_rx) = mpsc::channel(64);
            let (close_tx, mut close_rx) = mpsc::channel(1);
            let transport =
                FrameTransport::start(halves, request_tx, close_tx, self.events.clone());
            let keepalive = keepalive::spawn(
                transport.clone(),
                KeepAliveConfig {
                    path: self.config.keepalive_path.clone(),
                    disconnect: self.config.keepalive_disconnect,
                },
            );
            let (queue, _queue_worker) = SerialQueue::spawn();
            tokio::spawn(pump_requests(
                request_rx,
                queue,
                self.signaling_key.clone(),
                self.contacts.clone(),
                self.dispatcher.clone(),
                self.events.clone(),
            ));
            *self.conn.lock().await = Some(Connection {
                transport,
                keepalive,
            });
            // The close notice buffers in the channel, so the monitor can start
            // after the connection is published.
            let monitor = self.clone();
            tokio::spawn(async move {
                if let Some((code, reason)) = close_rx.recv().await {
                    monitor.handle_close(code, reason).await;
                }
            });
            Ok(())
        })
    }

    /// Close the socket for good; the close code tells the monitor not to
    /// probe or reconnect.
    pub async fn close(&self) {
        self.teardown("called close").await;
    }

    async fn teardown(&self, reason: &str) {
        let previous = self.conn.lock().await.take();
        if let Some(previous) = previous {
            previous.keepalive.abort();
            previous.transport.close(CLOSE_CODE_LOCAL, reason).await;
        }
    }

    async fn handle_close(&self, code: u16, reason: String) {
        if let Some(conn) = self.conn.lock().await.as_ref() {
            conn.keepalive.abort();
        }
        if code == CLOSE_CODE_LOCAL {
            debug!("socket closed by caller: {reason}");
            return;
        }
        debug!("socket closed ({code}): {reason}; probing relay");
        match self.api.check_reachable(&self.config.number).await {
            Ok(()) => {
                if let Err(e) = self.connect().await {
                    self.events.publish(ReceiverEvent::Error(e));
                }
            }
            Err(e) => {
                self.events.publish(ReceiverEvent::Error(e));
            }
        }
    }

    /// The underlying stream's ready state, or −1 when there is no socket.
    pub async fn ready_state(&self) -> i32 {
        match self.conn.lock().await.as_ref() {
            None => READY_STATE_NONE,
            Some(conn) if conn.transport.is_closed() => READY_STATE_CLOSED,
            Some(_) => READY_STATE_OPEN,
        }
    }

    /// Replay a message parked behind an `IncomingIdentityKey` fault. Call
    /// after updating the identity store; on success the message flows
    /// through the normal pipeline and events.
    pub async fn try_message_again(
        &self,
        address: &Address,
        ciphertext: &[u8],
    ) -> Result<(), ReceiverError> {
        let envelope = self
            .replays
            .take(address, ciphertext)
            .await
            .ok_or_else(|| {
                ReceiverError::MalformedPayload("no replayable message for address".to_string())
            })?;
        self.dispatcher.handle_envelope(envelope).await
    }
}

/// Drain inbound requests for the lifetime of one socket. Envelope unwrap
/// (and its ack) runs on its own task per request so a slow envelope never
/// delays the ack of the next one; post-decrypt handling is chained onto the
/// serial queue in arrival order.
async fn pump_requests(
    mut requests: mpsc::Receiver<InboundRequest>,
    queue: SerialQueue,
    signaling_key: SignalingKey,
    contacts: Arc<dyn ContactStore>,
    dispatcher: Dispatcher,
    events: EventBus,
) {
    while let Some(InboundRequest { request, responder }) = requests.recv().await {
        if request.verb != "PUT" || request.path != "/messages" {
            let _ = responder.respond(404, "Not found").await;
            continue;
        }
        let (done_tx, done_rx) = oneshot::channel();
        {
            let signaling_key = signaling_key.clone();
            let events = events.clone();
            tokio::spawn(async move {
                match open_envelope(&signaling_key, &request.body) {
                    Ok(envelope) => {
                        let _ = responder.respond(200, "OK").await;
                        let _ = done_tx.send(Some(envelope));
                    }
                    Err(e) => {
                        let _ = responder
                            .respond(500, "Bad encrypted websocket message")
                            .await;
                        events.publish(ReceiverEvent::Error(e));
                        let _ = done_tx.send(None);
                    }
                }
            });
        }
        let contacts = contacts.clone();
        let dispatcher = dispatcher.clone();
        let events = events.clone();
        queue.enqueue(async move {
            let Ok(Some(envelope)) = done_rx.await else {
                return;
            };
            if contacts.is_blocked(&envelope.source).await {
                debug!("dropping envelope from blocked sender {}", envelope.source);
                return;
            }
            if let Err(e) = dispatcher.handle_envelope(envelope).await {
                events.publish(ReceiverEvent::Error(e));
            }
        });
    }
}

#[cfg(test)]
mod tests;
