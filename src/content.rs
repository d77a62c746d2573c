use crate::error::ReceiverError;
use serde::{Deserialize, Serialize};

pub mod flags {
    pub const END_SESSION: u32 = 0x1;
    pub const EXPIRATION_TIMER_UPDATE: u32 = 0x2;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentPointer {
    pub id: u64,
    pub key: Vec<u8>,
    /// Populated after a successful fetch + decrypt; never on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum GroupKind {
    Unknown,
    Update,
    Deliver,
    Quit,
}

impl From<u32> for GroupKind {
    fn from(code: u32) -> Self {
        match code {
            1 => GroupKind::Update,
            2 => GroupKind::Deliver,
            3 => GroupKind::Quit,
            _ => GroupKind::Unknown,
        }
    }
}

impl From<GroupKind> for u32 {
    fn from(kind: GroupKind) -> u32 {
        match kind {
            GroupKind::Unknown => 0,
            GroupKind::Update => 1,
            GroupKind::Deliver => 2,
            GroupKind::Quit => 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupContext {
    /// Opaque group primary key.
    pub id: Vec<u8>,
    pub kind: GroupKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<AttachmentPointer>,
    #[serde(default)]
    pub members: Vec<String>,
    /// Filled in by roster reconciliation before the event goes out; never
    /// on the wire.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataMessage {
    #[serde(default)]
    pub flags: Option<u32>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPointer>,
    #[serde(default)]
    pub group: Option<GroupContext>,
    #[serde(default)]
    pub expire_timer: Option<u32>,
}

impl DataMessage {
    pub fn flag_set(&self, flag: u32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SentTranscript {
    #[serde(default)]
    pub destination: Option<String>,
    pub timestamp: u64,
    pub message: DataMessage,
    #[serde(default)]
    pub expiration_start_timestamp: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadMark {
    pub sender: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedList {
    #[serde(default)]
    pub numbers: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRequest {
    #[serde(default)]
    pub request_type: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncMessage {
    #[serde(default)]
    pub sent: Option<SentTranscript>,
    #[serde(default)]
    pub contacts: Option<AttachmentPointer>,
    #[serde(default)]
    pub groups: Option<AttachmentPointer>,
    #[serde(default)]
    pub blocked: Option<BlockedList>,
    #[serde(default)]
    pub request: Option<SyncRequest>,
    #[serde(default)]
    pub read: Option<Vec<ReadMark>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Content {
    #[serde(default)]
    pub data_message: Option<DataMessage>,
    #[serde(default)]
    pub sync_message: Option<SyncMessage>,
}

pub fn parse_content(plaintext: &[u8]) -> Result<Content, ReceiverError> {
    serde_json::from_slice(plaintext).map_err(|e| ReceiverError::MalformedPayload(e.to_string()))
}

pub fn parse_data_message(plaintext: &[u8]) -> Result<DataMessage, ReceiverError> {
    serde_json::from_slice(plaintext).map_err(|e| ReceiverError::MalformedPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default() {
        let message = parse_data_message(br#"{"body":"hi"}"#).expect("parse");
        assert_eq!(message.body.as_deref(), Some("hi"));
        assert_eq!(message.flags, None);
        assert!(message.attachments.is_empty());
        assert!(message.group.is_none());
    }

    #[test]
    fn group_kind_codes() {
        assert_eq!(GroupKind::from(2), GroupKind::Deliver);
        assert_eq!(GroupKind::from(42), GroupKind::Unknown);
        assert_eq!(u32::from(GroupKind::Quit), 3);
    }

    #[test]
    fn flag_test_treats_null_as_zero() {
        let message = DataMessage::default();
        assert!(!message.flag_set(flags::END_SESSION));
        let message = DataMessage {
            flags: Some(flags::END_SESSION),
            ..Default::default()
        };
        assert!(message.flag_set(flags::END_SESSION));
    }
}
