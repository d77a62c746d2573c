use crate::error::ReceiverError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One record of a multi-device contact sync blob.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactRecord {
    pub number: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn is_blocked(&self, number: &str) -> bool;
    async fn replace_blocked(&self, numbers: Vec<String>);
}

#[derive(Clone, Default)]
pub struct MemoryContactStore {
    blocked: Arc<Mutex<HashSet<String>>>,
}

impl MemoryContactStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn block(&self, number: &str) {
        self.blocked.lock().await.insert(number.to_string());
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn is_blocked(&self, number: &str) -> bool {
        self.blocked.lock().await.contains(number)
    }

    async fn replace_blocked(&self, numbers: Vec<String>) {
        let mut guard = self.blocked.lock().await;
        guard.clear();
        guard.extend(numbers);
    }
}

/// Read the records of a decrypted sync blob: each record is a u32
/// big-endian length followed by that many payload bytes.
pub fn read_records<T: DeserializeOwned>(blob: &[u8]) -> Result<Vec<T>, ReceiverError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < blob.len() {
        if blob.len() - offset < 4 {
            return Err(ReceiverError::MalformedPayload(
                "truncated record length".to_string(),
            ));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&blob[offset..offset + 4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        offset += 4;
        if blob.len() - offset < len {
            return Err(ReceiverError::MalformedPayload(
                "truncated record body".to_string(),
            ));
        }
        let record = serde_json::from_slice(&blob[offset..offset + len])
            .map_err(|e| ReceiverError::MalformedPayload(e.to_string()))?;
        records.push(record);
        offset += len;
    }
    Ok(records)
}

/// Write records in the sync blob framing; the inverse of [`read_records`].
pub fn write_records<T: Serialize>(records: &[T]) -> Result<Vec<u8>, ReceiverError> {
    let mut blob = Vec::new();
    for record in records {
        let bytes =
            serde_json::to_vec(record).map_err(|e| ReceiverError::MalformedPayload(e.to_string()))?;
        blob.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        blob.extend_from_slice(&bytes);
    }
    Ok(blob)
}
