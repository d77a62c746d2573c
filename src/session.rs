use crate::envelope::Address;
use async_trait::async_trait;
use blake3::Hasher;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown identity key")]
    UnknownIdentityKey { identity_key: Vec<u8> },
    #[error("ciphertext rejected for {0}")]
    Ciphertext(String),
    #[error("session {0}")]
    Failure(String),
}

/// The ratcheting end-to-end layer. The receiver only ever decrypts and
/// tears down; establishing sessions belongs to the send path.
///
/// Implementations serialize operations per address: a decrypt for address A
/// never runs concurrently with a close for A.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn decrypt_whisper(
        &self,
        address: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError>;

    async fn decrypt_prekey(
        &self,
        address: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError>;

    async fn close_session(&self, address: &Address) -> Result<(), SessionError>;

    /// Every device id with stored session state for `number`.
    async fn device_ids(&self, number: &str) -> Vec<u32>;
}

#[derive(Clone, Debug)]
struct Chain {
    seal_count: u64,
    open_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PrekeyPayload {
    identity_key: Vec<u8>,
    body: Vec<u8>,
}

/// Deterministic chain-key session layer. Two stores built from the same
/// seed interoperate, which is what the in-process tests need; a production
/// deployment slots a double-ratchet implementation behind [`SessionStore`]
/// instead.
pub struct MemorySessionStore {
    seed: [u8; 32],
    chains: Mutex<HashMap<String, Chain>>,
    identities: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new(seed: [u8; 32]) -> Arc<Self> {
        Arc::new(Self {
            seed,
            chains: Mutex::new(HashMap::new()),
            identities: Mutex::new(HashMap::new()),
        })
    }

    /// Record the trusted identity key for a number. Overwrites any previous
    /// trust decision.
    pub async fn set_identity(&self, number: &str, identity_key: Vec<u8>) {
        self.identities
            .lock()
            .await
            .insert(number.to_string(), identity_key);
    }

    pub async fn identity(&self, number: &str) -> Option<Vec<u8>> {
        self.identities.lock().await.get(number).cloned()
    }

    fn message_key(&self, address: &Address, counter: u64) -> [u8; 32] {
        let mut hasher = Hasher::new();
        hasher.update(b"vesper:session:v1");
        hasher.update(&self.seed);
        hasher.update(address.number.as_bytes());
        hasher.update(&address.device_id.to_be_bytes());
        hasher.update(&counter.to_be_bytes());
        *hasher.finalize().as_bytes()
    }

    fn apply(
        key: [u8; 32],
        counter: u64,
        input: &[u8],
        seal: bool,
    ) -> Result<Vec<u8>, SessionError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| SessionError::Failure("key".to_string()))?;
        let mut nonce = [0u8; 24];
        nonce[..8].copy_from_slice(&counter.to_be_bytes());
        if seal {
            cipher
                .encrypt(XNonce::from_slice(&nonce), input)
                .map_err(|_| SessionError::Failure("seal".to_string()))
        } else {
            cipher
                .decrypt(XNonce::from_slice(&nonce), input)
                .map_err(|_| SessionError::Ciphertext("aead".to_string()))
        }
    }

    /// Encrypt `plaintext` for `address`, advancing the outbound chain. The
    /// counterpart store opens it with [`SessionStore::decrypt_whisper`].
    pub async fn seal_whisper(&self, address: &Address, plaintext: &[u8]) -> Vec<u8> {
        let counter = {
            let mut chains = self.chains.lock().await;
            let chain = chains.entry(address.to_string()).or_insert(Chain {
                seal_count: 0,
                open_count: 0,
            });
            chain.seal_count += 1;
            chain.seal_count
        };
        let key = self.message_key(address, counter);
        Self::apply(key, counter, plaintext, true).unwrap_or_default()
    }

    /// Encrypt a session-initiating message carrying `identity_key`.
    pub async fn seal_prekey(
        &self,
        address: &Address,
        identity_key: Vec<u8>,
        plaintext: &[u8],
    ) -> Vec<u8> {
        let body = self.seal_whisper(address, plaintext).await;
        serde_json::to_vec(&PrekeyPayload { identity_key, body }).unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn decrypt_whisper(
        &self,
        address: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let counter = {
            let mut chains = self.chains.lock().await;
            let chain = chains.entry(address.to_string()).or_insert(Chain {
                seal_count: 0,
                open_count: 0,
            });
            chain.open_count += 1;
            chain.open_count
        };
        let key = self.message_key(address, counter);
        let out = Self::apply(key, counter, ciphertext, false);
        if out.is_err() {
            // Rejected ciphertext does not consume a chain step.
            let mut chains = self.chains.lock().await;
            if let Some(chain) = chains.get_mut(&address.to_string()) {
                chain.open_count -= 1;
            }
        }
        out
    }

    async fn decrypt_prekey(
        &self,
        address: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let payload: PrekeyPayload = serde_json::from_slice(ciphertext)
            .map_err(|_| SessionError::Ciphertext("prekey".to_string()))?;
        let trusted = self.identity(&address.number).await;
        match trusted {
            Some(known) if known != payload.identity_key => {
                return Err(SessionError::UnknownIdentityKey {
                    identity_key: payload.identity_key,
                });
            }
            Some(_) => {}
            None => {
                self.set_identity(&address.number, payload.identity_key.clone())
                    .await;
            }
        }
        self.decrypt_whisper(address, &payload.body).await
    }

    async fn close_session(&self, address: &Address) -> Result<(), SessionError> {
        self.chains.lock().await.remove(&address.to_string());
        Ok(())
    }

    async fn device_ids(&self, number: &str) -> Vec<u32> {
        let prefix = format!("{}.", number);
        let chains = self.chains.lock().await;
        let mut ids: Vec<u32> = chains
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }
}
