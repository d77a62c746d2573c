use crate::error::ReceiverError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum FrameKind {
    Unknown,
    Request,
    Response,
}

impl From<u32> for FrameKind {
    fn from(code: u32) -> Self {
        match code {
            1 => FrameKind::Request,
            2 => FrameKind::Response,
            _ => FrameKind::Unknown,
        }
    }
}

impl From<FrameKind> for u32 {
    fn from(kind: FrameKind) -> u32 {
        match kind {
            FrameKind::Unknown => 0,
            FrameKind::Request => 1,
            FrameKind::Response => 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameRequest {
    pub id: u64,
    pub verb: String,
    pub path: String,
    #[serde(default)]
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameResponse {
    pub id: u64,
    pub status: u16,
    pub message: String,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl FrameResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One frame per socket message. `kind` decides which side field is
/// meaningful; anything else is carried but ignored.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireFrame {
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<FrameRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<FrameResponse>,
}

impl WireFrame {
    pub fn request(request: FrameRequest) -> Self {
        Self {
            kind: FrameKind::Request,
            request: Some(request),
            response: None,
        }
    }

    pub fn response(response: FrameResponse) -> Self {
        Self {
            kind: FrameKind::Response,
            request: None,
            response: Some(response),
        }
    }
}

pub fn encode_frame(frame: &WireFrame) -> Result<Vec<u8>, ReceiverError> {
    serde_json::to_vec(frame).map_err(|e| ReceiverError::MalformedPayload(e.to_string()))
}

pub fn decode_frame(bytes: &[u8]) -> Result<WireFrame, ReceiverError> {
    serde_json::from_slice(bytes).map_err(|_| ReceiverError::UnknownMessageType)
}
