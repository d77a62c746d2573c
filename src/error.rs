use crate::envelope::Address;
use crate::session::SessionError;
use thiserror::Error;

/// Every fault the receive pipeline can surface. Nothing here is fatal: a
/// fault either turns into a 500 on the wire (before the ack is issued) or
/// into an `error` event (after).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReceiverError {
    #[error("connection closed ({code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },
    #[error("response for unknown request id {0}")]
    UnmatchedResponse(u64),
    #[error("request failed ({status}): {message}")]
    RequestFailed { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("unknown message type")]
    UnknownMessageType,
    #[error("bad encrypted envelope")]
    BadEncryptedEnvelope,
    #[error("invalid padding")]
    InvalidPadding,
    /// The session layer saw an identity key it does not trust. Replayable:
    /// the consumer may update the identity store and hand `ciphertext` back
    /// through `Receiver::try_message_again`.
    #[error("untrusted identity key from {address}")]
    IncomingIdentityKey {
        address: Address,
        ciphertext: Vec<u8>,
        identity_key: Vec<u8>,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("content with no recognized field")]
    EmptyContent,
    #[error("sync message with no recognized field")]
    EmptySyncMessage,
    #[error("sync message from foreign source {0}")]
    InvalidSyncSource(String),
    #[error("sync message from own device")]
    SelfDeviceSync,
    #[error("unknown message flags {0:#x}")]
    UnknownFlags(u32),
    #[error("unknown group context type")]
    UnknownGroupType,
    #[error("http: {0}")]
    Http(String),
}

impl ReceiverError {
    /// Whether the consumer can retry this fault through the replay facility.
    pub fn is_replayable(&self) -> bool {
        matches!(self, ReceiverError::IncomingIdentityKey { .. })
    }
}
