use crate::config::Credentials;
use crate::error::ReceiverError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The relay's plain HTTP surface: one reachability probe and the
/// attachment store. Both authenticate with the receiver's credentials.
#[async_trait]
pub trait RelayApi: Send + Sync {
    /// `GET /v1/devices/<number>`; succeeds when the relay answers 2xx.
    async fn check_reachable(&self, number: &str) -> Result<(), ReceiverError>;

    /// `GET /attachments/<id>`; returns the still-encrypted blob.
    async fn fetch_attachment(&self, id: u64) -> Result<Vec<u8>, ReceiverError>;
}

pub struct HttpRelayApi {
    api_base: String,
    attachment_base: String,
    credentials: Credentials,
    http: reqwest::Client,
}

impl HttpRelayApi {
    pub fn new(
        api_base: &str,
        attachment_base: &str,
        credentials: Credentials,
    ) -> Result<Self, ReceiverError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReceiverError::Http(e.to_string()))?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            attachment_base: attachment_base.trim_end_matches('/').to_string(),
            credentials,
            http,
        })
    }

    async fn get(&self, url: String) -> Result<reqwest::Response, ReceiverError> {
        let resp = self
            .http
            .get(url)
            .basic_auth(
                &self.credentials.username,
                Some(&self.credentials.password),
            )
            .send()
            .await
            .map_err(|e| ReceiverError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ReceiverError::Http(format!(
                "status {}",
                resp.status().as_u16()
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl RelayApi for HttpRelayApi {
    async fn check_reachable(&self, number: &str) -> Result<(), ReceiverError> {
        let url = format!("{}/v1/devices/{}", self.api_base, number);
        self.get(url).await.map(|_| ())
    }

    async fn fetch_attachment(&self, id: u64) -> Result<Vec<u8>, ReceiverError> {
        let url = format!("{}/attachments/{}", self.attachment_base, id);
        let resp = self.get(url).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ReceiverError::Http(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// In-memory relay API double.
pub struct MemoryRelayApi {
    reachable: Mutex<bool>,
    blobs: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemoryRelayApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reachable: Mutex::new(true),
            blobs: Mutex::new(HashMap::new()),
        })
    }

    pub async fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock().await = reachable;
    }

    pub async fn put_attachment(&self, id: u64, blob: Vec<u8>) {
        self.blobs.lock().await.insert(id, blob);
    }
}

#[async_trait]
impl RelayApi for MemoryRelayApi {
    async fn check_reachable(&self, _number: &str) -> Result<(), ReceiverError> {
        if *self.reachable.lock().await {
            Ok(())
        } else {
            Err(ReceiverError::Http("status 503".to_string()))
        }
    }

    async fn fetch_attachment(&self, id: u64) -> Result<Vec<u8>, ReceiverError> {
        self.blobs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ReceiverError::Http("status 404".to_string()))
    }
}
