use crate::content::AttachmentPointer;
use crate::error::ReceiverError;
use crate::http::RelayApi;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use futures_util::future::join_all;
use hkdf::Hkdf;
use sha2::Sha256;

const CONTEXT: &[u8] = b"vesper:attachment:v1";
const NONCE_LEN: usize = 24;

fn aead_key(pointer_key: &[u8]) -> Result<[u8; 32], ReceiverError> {
    let hkdf = Hkdf::<Sha256>::new(None, pointer_key);
    let mut out = [0u8; 32];
    hkdf.expand(CONTEXT, &mut out)
        .map_err(|_| ReceiverError::MalformedPayload("attachment key".to_string()))?;
    Ok(out)
}

/// Decrypt a fetched attachment blob: `nonce || ciphertext` under the
/// pointer's key.
pub fn open_attachment(pointer_key: &[u8], blob: &[u8]) -> Result<Vec<u8>, ReceiverError> {
    if blob.len() < NONCE_LEN {
        return Err(ReceiverError::MalformedPayload(
            "attachment too short".to_string(),
        ));
    }
    let cipher = XChaCha20Poly1305::new_from_slice(&aead_key(pointer_key)?)
        .map_err(|_| ReceiverError::MalformedPayload("attachment key".to_string()))?;
    cipher
        .decrypt(XNonce::from_slice(&blob[..NONCE_LEN]), &blob[NONCE_LEN..])
        .map_err(|_| ReceiverError::MalformedPayload("attachment ciphertext".to_string()))
}

/// Encrypt an attachment the way the sender does; used by the in-memory
/// relay double.
pub fn seal_attachment(pointer_key: &[u8], nonce: [u8; 24], data: &[u8]) -> Result<Vec<u8>, ReceiverError> {
    let cipher = XChaCha20Poly1305::new_from_slice(&aead_key(pointer_key)?)
        .map_err(|_| ReceiverError::MalformedPayload("attachment key".to_string()))?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), data)
        .map_err(|_| ReceiverError::MalformedPayload("attachment seal".to_string()))?;
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub async fn fetch_and_open(
    api: &dyn RelayApi,
    pointer: &AttachmentPointer,
) -> Result<Vec<u8>, ReceiverError> {
    let blob = api.fetch_attachment(pointer.id).await?;
    open_attachment(&pointer.key, &blob)
}

/// Fetch and decrypt every pointer concurrently, filling `data` in place.
/// The first failure wins but only after every fetch has settled.
pub async fn resolve_all(
    api: &dyn RelayApi,
    pointers: &mut [AttachmentPointer],
) -> Result<(), ReceiverError> {
    let fetches = pointers
        .iter()
        .map(|pointer| fetch_and_open(api, pointer))
        .collect::<Vec<_>>();
    let settled = join_all(fetches).await;
    let mut first_error = None;
    for (pointer, outcome) in pointers.iter_mut().zip(settled) {
        match outcome {
            Ok(data) => pointer.data = Some(data),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
