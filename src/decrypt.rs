use crate::envelope::{Address, Envelope, EnvelopeKind};
use crate::error::ReceiverError;
use crate::session::{SessionError, SessionStore};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const PAD_SENTINEL: u8 = 0x80;

/// Strip transport padding: `plaintext || 0x80 || 0x00*`.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, ReceiverError> {
    let mut end = padded.len();
    while end > 0 && padded[end - 1] == 0x00 {
        end -= 1;
    }
    if end == 0 || padded[end - 1] != PAD_SENTINEL {
        return Err(ReceiverError::InvalidPadding);
    }
    debug!("unpadded {} bytes to {}", padded.len(), end - 1);
    Ok(padded[..end - 1].to_vec())
}

/// Sender-side padding; the inverse of [`unpad`].
pub fn pad(plaintext: &[u8], zeros: usize) -> Vec<u8> {
    let mut padded = Vec::with_capacity(plaintext.len() + 1 + zeros);
    padded.extend_from_slice(plaintext);
    padded.push(PAD_SENTINEL);
    padded.extend(std::iter::repeat(0x00).take(zeros));
    padded
}

/// Runs the ratchet layer for one envelope and classifies what comes back.
#[derive(Clone)]
pub struct Decryptor {
    sessions: Arc<dyn SessionStore>,
}

impl Decryptor {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }

    /// Open a CIPHERTEXT or PREKEY_BUNDLE envelope and return the unpadded
    /// plaintext. RECEIPT envelopes never reach this point.
    pub async fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, ReceiverError> {
        let address = envelope.address();
        let ciphertext = envelope
            .ciphertext()
            .ok_or_else(|| ReceiverError::MalformedPayload("envelope without body".to_string()))?;
        let padded = match envelope.kind {
            EnvelopeKind::Ciphertext => {
                self.sessions.decrypt_whisper(&address, ciphertext).await?
            }
            EnvelopeKind::PrekeyBundle => self
                .sessions
                .decrypt_prekey(&address, ciphertext)
                .await
                .map_err(|e| match e {
                    SessionError::UnknownIdentityKey { identity_key } => {
                        ReceiverError::IncomingIdentityKey {
                            address: address.clone(),
                            ciphertext: ciphertext.to_vec(),
                            identity_key,
                        }
                    }
                    other => other.into(),
                })?,
            EnvelopeKind::Receipt | EnvelopeKind::Unknown => {
                return Err(ReceiverError::UnknownMessageType)
            }
        };
        unpad(&padded)
    }
}

/// Envelopes parked behind an identity-key fault, waiting for the consumer
/// to re-trust the sender and replay them.
#[derive(Clone, Default)]
pub struct ReplayRegistry {
    parked: Arc<Mutex<HashMap<String, Envelope>>>,
}

impl ReplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn park(&self, envelope: Envelope) {
        self.parked
            .lock()
            .await
            .insert(envelope.address().to_string(), envelope);
    }

    /// Reclaim the parked envelope for `address`, but only when the caller
    /// hands back the ciphertext it was parked with.
    pub async fn take(&self, address: &Address, ciphertext: &[u8]) -> Option<Envelope> {
        let key = address.to_string();
        let mut guard = self.parked.lock().await;
        let matches = guard
            .get(&key)
            .and_then(|env| env.ciphertext())
            .map(|ct| ct == ciphertext)
            .unwrap_or(false);
        if matches {
            guard.remove(&key)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;

    #[test]
    fn unpad_inverts_pad() {
        for zeros in [0usize, 1, 7, 64] {
            let padded = pad(b"hello", zeros);
            assert_eq!(unpad(&padded).unwrap(), b"hello");
        }
        assert_eq!(unpad(&pad(b"", 3)).unwrap(), b"");
    }

    #[test]
    fn unpad_rejects_missing_sentinel() {
        assert_eq!(unpad(b"hello").unwrap_err(), ReceiverError::InvalidPadding);
        assert_eq!(unpad(&[0x00, 0x00]).unwrap_err(), ReceiverError::InvalidPadding);
        assert_eq!(unpad(&[]).unwrap_err(), ReceiverError::InvalidPadding);
    }

    #[tokio::test]
    async fn prekey_identity_fault_is_replayable() {
        let sender = MemorySessionStore::new([1u8; 32]);
        let receiver = MemorySessionStore::new([1u8; 32]);
        receiver.set_identity("+15550001111", vec![0x01]).await;
        let address = Address::new("+15550001111", 1);
        let ciphertext = sender
            .seal_prekey(&address, vec![0x02], &pad(b"hi", 0))
            .await;
        let envelope = Envelope {
            kind: EnvelopeKind::PrekeyBundle,
            source: "+15550001111".to_string(),
            source_device: 1,
            timestamp: 1,
            legacy_body: None,
            content: Some(ciphertext.clone()),
        };
        let decryptor = Decryptor::new(receiver.clone());
        let err = decryptor.open(&envelope).await.unwrap_err();
        match &err {
            ReceiverError::IncomingIdentityKey {
                address: at,
                ciphertext: ct,
                identity_key,
            } => {
                assert_eq!(at, &address);
                assert_eq!(ct, &ciphertext);
                assert_eq!(identity_key, &vec![0x02]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_replayable());
        receiver.set_identity("+15550001111", vec![0x02]).await;
        assert_eq!(decryptor.open(&envelope).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn registry_only_releases_matching_ciphertext() {
        let registry = ReplayRegistry::new();
        let address = Address::new("+15550001111", 1);
        let envelope = Envelope {
            kind: EnvelopeKind::PrekeyBundle,
            source: "+15550001111".to_string(),
            source_device: 1,
            timestamp: 1,
            legacy_body: None,
            content: Some(vec![1, 2, 3]),
        };
        registry.park(envelope).await;
        assert!(registry.take(&address, &[9, 9]).await.is_none());
        assert!(registry.take(&address, &[1, 2, 3]).await.is_some());
        // Second take finds nothing.
        assert!(registry.take(&address, &[1, 2, 3]).await.is_none());
    }
}
