use crate::error::ReceiverError;
use crate::transport::{FrameTransport, CLOSE_CODE_KEEPALIVE};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const PING_INTERVAL: Duration = Duration::from_secs(50);
pub const ACK_TIMEOUT: Duration = Duration::from_secs(1);

const TIMEOUT_REASON: &str = "No response to keepalive request";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub path: String,
    pub disconnect: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            disconnect: true,
        }
    }
}

/// Probe the connection after 50 s of inbound silence. With `disconnect`
/// set, a probe that is not acknowledged within 1 s forces the transport
/// closed with code 3001.
pub fn spawn(transport: Arc<FrameTransport>, config: KeepAliveConfig) -> JoinHandle<()> {
    tokio::spawn(run(transport, config))
}

async fn run(transport: Arc<FrameTransport>, config: KeepAliveConfig) {
    // Rearm point for pings that never got an answer while disconnect is off.
    let mut floor = transport.last_activity();
    loop {
        if transport.is_closed() {
            return;
        }
        let deadline = transport.last_activity().max(floor) + PING_INTERVAL;
        if Instant::now() < deadline {
            tokio::time::sleep_until(deadline).await;
            continue;
        }
        floor = Instant::now();
        debug!("keepalive ping {}", config.path);
        if config.disconnect {
            let probe = transport.send_request("GET", &config.path, Vec::new());
            match tokio::time::timeout(ACK_TIMEOUT, probe).await {
                Ok(Ok(_)) => {}
                Ok(Err(ReceiverError::ConnectionClosed { .. })) => return,
                Ok(Err(e)) => {
                    warn!("keepalive rejected: {e}");
                    transport.close(CLOSE_CODE_KEEPALIVE, TIMEOUT_REASON).await;
                    return;
                }
                Err(_) => {
                    transport.close(CLOSE_CODE_KEEPALIVE, TIMEOUT_REASON).await;
                    return;
                }
            }
        } else {
            let transport = transport.clone();
            let path = config.path.clone();
            tokio::spawn(async move {
                let _ = transport.send_request("GET", &path, Vec::new()).await;
            });
        }
    }
}
