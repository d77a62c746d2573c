use crate::contacts::ContactRecord;
use crate::content::{DataMessage, ReadMark};
use crate::error::ReceiverError;
use crate::groups::GroupSyncRecord;
use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub source: String,
    pub source_device: u32,
    pub timestamp: u64,
    pub message: DataMessage,
}

#[derive(Clone, Debug)]
pub struct SentEvent {
    pub destination: Option<String>,
    pub timestamp: u64,
    pub message: DataMessage,
    pub expiration_start_timestamp: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ReceiptEvent {
    pub source: String,
    pub source_device: u32,
    pub timestamp: u64,
}

#[derive(Clone, Debug)]
pub enum ReceiverEvent {
    Message(MessageEvent),
    Sent(SentEvent),
    Receipt(ReceiptEvent),
    Read(ReadMark),
    Contact(ContactRecord),
    ContactSyncDone,
    Group(GroupSyncRecord),
    GroupSyncDone,
    Error(ReceiverError),
}

pub type EventReceiver = broadcast::Receiver<ReceiverEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ReceiverEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ReceiverEvent) {
        let _ = self.tx.send(event);
    }
}
