use crate::error::ReceiverError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt::{Display, Formatter};

const CONTEXT: &[u8] = b"vesper:envelope:v1";
pub const ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum EnvelopeKind {
    Unknown,
    Ciphertext,
    PrekeyBundle,
    Receipt,
}

impl From<u32> for EnvelopeKind {
    fn from(code: u32) -> Self {
        match code {
            1 => EnvelopeKind::Ciphertext,
            3 => EnvelopeKind::PrekeyBundle,
            5 => EnvelopeKind::Receipt,
            _ => EnvelopeKind::Unknown,
        }
    }
}

impl From<EnvelopeKind> for u32 {
    fn from(kind: EnvelopeKind) -> u32 {
        match kind {
            EnvelopeKind::Unknown => 0,
            EnvelopeKind::Ciphertext => 1,
            EnvelopeKind::PrekeyBundle => 3,
            EnvelopeKind::Receipt => 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub source: String,
    pub source_device: u32,
    pub timestamp: u64,
    #[serde(default)]
    pub legacy_body: Option<Vec<u8>>,
    #[serde(default)]
    pub content: Option<Vec<u8>>,
}

impl Envelope {
    pub fn address(&self) -> Address {
        Address {
            number: self.source.clone(),
            device_id: self.source_device,
        }
    }

    /// The ciphertext the session layer has to open; `content` wins when both
    /// are present.
    pub fn ciphertext(&self) -> Option<&[u8]> {
        self.content
            .as_deref()
            .or(self.legacy_body.as_deref())
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub number: String,
    pub device_id: u32,
}

impl Address {
    pub fn new(number: impl Into<String>, device_id: u32) -> Self {
        Self {
            number: number.into(),
            device_id,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.number, self.device_id)
    }
}

#[derive(Clone)]
pub struct SignalingKey([u8; 32]);

impl SignalingKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn aead_key(&self) -> Result<[u8; 32], ReceiverError> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.0);
        let mut out = [0u8; 32];
        hkdf.expand(CONTEXT, &mut out)
            .map_err(|_| ReceiverError::BadEncryptedEnvelope)?;
        Ok(out)
    }
}

/// Unwrap one relay-delivered blob: `version || nonce || ciphertext`, AEAD
/// bound to the version byte. Returns the parsed envelope.
pub fn open_envelope(key: &SignalingKey, blob: &[u8]) -> Result<Envelope, ReceiverError> {
    if blob.len() < 1 + NONCE_LEN {
        return Err(ReceiverError::BadEncryptedEnvelope);
    }
    let version = blob[0];
    if version != ENVELOPE_VERSION {
        return Err(ReceiverError::BadEncryptedEnvelope);
    }
    let nonce = &blob[1..1 + NONCE_LEN];
    let ciphertext = &blob[1 + NONCE_LEN..];
    let cipher = XChaCha20Poly1305::new_from_slice(&key.aead_key()?)
        .map_err(|_| ReceiverError::BadEncryptedEnvelope)?;
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &[version],
            },
        )
        .map_err(|_| ReceiverError::BadEncryptedEnvelope)?;
    serde_json::from_slice(&plaintext).map_err(|_| ReceiverError::BadEncryptedEnvelope)
}

/// Wrap an envelope the way the relay does. The send half lives server-side;
/// this exists for the in-memory relay used by the tests.
pub fn seal_envelope(
    key: &SignalingKey,
    nonce: [u8; 24],
    envelope: &Envelope,
) -> Result<Vec<u8>, ReceiverError> {
    let plaintext = serde_json::to_vec(envelope)
        .map_err(|e| ReceiverError::MalformedPayload(e.to_string()))?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key.aead_key()?)
        .map_err(|_| ReceiverError::BadEncryptedEnvelope)?;
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_slice(),
                aad: &[ENVELOPE_VERSION],
            },
        )
        .map_err(|_| ReceiverError::BadEncryptedEnvelope)?;
    let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    blob.push(ENVELOPE_VERSION);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}
