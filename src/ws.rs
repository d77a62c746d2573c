use crate::error::ReceiverError;
use crate::transport::{SocketConnector, SocketEvent, SocketHalves, SocketLink};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// WebSocket-backed socket link. One binary message carries one frame.
pub struct WsConnector;

struct WsLink {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl SocketLink for WsLink {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), ReceiverError> {
        self.tx
            .send(Message::Binary(bytes))
            .await
            .map_err(|_| ReceiverError::Transport("writer gone".to_string()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), ReceiverError> {
        self.tx
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            })))
            .await
            .map_err(|_| ReceiverError::Transport("writer gone".to_string()))
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SocketHalves, ReceiverError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| ReceiverError::Transport(e.to_string()))?;
        debug!("websocket open: {url}");
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(item) = source.next().await {
                match item {
                    Ok(Message::Binary(bytes)) => {
                        if event_tx.send(SocketEvent::Frame(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = event_tx.send(SocketEvent::Closed { code, reason }).await;
                        return;
                    }
                    // Pings are answered by the protocol layer; text frames
                    // have no meaning on this socket.
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx
                            .send(SocketEvent::Closed {
                                code: 1006,
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = event_tx
                .send(SocketEvent::Closed {
                    code: 1006,
                    reason: "stream ended".to_string(),
                })
                .await;
        });

        Ok(SocketHalves {
            link: Arc::new(WsLink { tx: out_tx }),
            events: event_rx,
        })
    }
}
