use crate::attachments;
use crate::contacts::{read_records, ContactRecord, ContactStore};
use crate::content::{
    flags, parse_content, parse_data_message, Content, DataMessage, SyncMessage,
};
use crate::decrypt::{Decryptor, ReplayRegistry};
use crate::envelope::{Address, Envelope, EnvelopeKind};
use crate::error::ReceiverError;
use crate::event::{EventBus, MessageEvent, ReceiptEvent, ReceiverEvent, SentEvent};
use crate::groups::{self, GroupStore, GroupSyncRecord};
use crate::http::RelayApi;
use crate::session::SessionStore;
use log::debug;
use std::sync::Arc;

/// Interprets one decrypted envelope at a time, strictly in queue order.
#[derive(Clone)]
pub struct Dispatcher {
    number: String,
    device_id: u32,
    sessions: Arc<dyn SessionStore>,
    groups: Arc<dyn GroupStore>,
    contacts: Arc<dyn ContactStore>,
    api: Arc<dyn RelayApi>,
    decryptor: Decryptor,
    replays: ReplayRegistry,
    events: EventBus,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number: String,
        device_id: u32,
        sessions: Arc<dyn SessionStore>,
        groups: Arc<dyn GroupStore>,
        contacts: Arc<dyn ContactStore>,
        api: Arc<dyn RelayApi>,
        replays: ReplayRegistry,
        events: EventBus,
    ) -> Self {
        Self {
            number,
            device_id,
            sessions: sessions.clone(),
            groups,
            contacts,
            api,
            decryptor: Decryptor::new(sessions),
            replays,
            events,
        }
    }

    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), ReceiverError> {
        if envelope.kind == EnvelopeKind::Receipt {
            self.events.publish(ReceiverEvent::Receipt(ReceiptEvent {
                source: envelope.source,
                source_device: envelope.source_device,
                timestamp: envelope.timestamp,
            }));
            return Ok(());
        }
        let plaintext = match self.decryptor.open(&envelope).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                if e.is_replayable() {
                    self.replays.park(envelope).await;
                }
                return Err(e);
            }
        };
        if envelope.has_content() {
            let content = parse_content(&plaintext)?;
            self.dispatch_content(&envelope, content).await
        } else {
            let message = parse_data_message(&plaintext)?;
            self.handle_data_message(&envelope, message).await
        }
    }

    async fn dispatch_content(
        &self,
        envelope: &Envelope,
        content: Content,
    ) -> Result<(), ReceiverError> {
        match (content.data_message, content.sync_message) {
            (Some(message), None) => self.handle_data_message(envelope, message).await,
            (None, Some(sync)) => {
                if envelope.source != self.number {
                    return Err(ReceiverError::InvalidSyncSource(envelope.source.clone()));
                }
                if envelope.source_device == self.device_id {
                    return Err(ReceiverError::SelfDeviceSync);
                }
                self.handle_sync_message(sync).await
            }
            _ => Err(ReceiverError::EmptyContent),
        }
    }

    async fn handle_data_message(
        &self,
        envelope: &Envelope,
        mut message: DataMessage,
    ) -> Result<(), ReceiverError> {
        if message.flag_set(flags::END_SESSION) {
            self.end_session(&envelope.source).await?;
        }
        self.process_decrypted(&mut message, &envelope.source).await?;
        self.events.publish(ReceiverEvent::Message(MessageEvent {
            source: envelope.source.clone(),
            source_device: envelope.source_device,
            timestamp: envelope.timestamp,
            message,
        }));
        Ok(())
    }

    /// Tear down every stored session for `number`. Safe to run twice.
    async fn end_session(&self, number: &str) -> Result<(), ReceiverError> {
        for device_id in self.sessions.device_ids(number).await {
            self.sessions
                .close_session(&Address::new(number, device_id))
                .await?;
        }
        Ok(())
    }

    /// Normalize a freshly decrypted message: default the counters, enforce
    /// the disjoint flag classes, reconcile its group context, and pull down
    /// its attachments. Reconciliation and fetches overlap; the call returns
    /// once both have settled.
    async fn process_decrypted(
        &self,
        message: &mut DataMessage,
        source: &str,
    ) -> Result<(), ReceiverError> {
        message.flags = Some(message.flags.unwrap_or(0));
        message.expire_timer = Some(message.expire_timer.unwrap_or(0));
        let set = message.flags.unwrap_or(0);
        if set & flags::END_SESSION != 0 {
            message.body = None;
            message.attachments.clear();
            message.group = None;
            return Ok(());
        }
        if set & flags::EXPIRATION_TIMER_UPDATE != 0 {
            message.body = None;
            message.attachments.clear();
        }
        let unknown = set & !(flags::END_SESSION | flags::EXPIRATION_TIMER_UPDATE);
        if unknown != 0 {
            return Err(ReceiverError::UnknownFlags(unknown));
        }
        let mut pointers = std::mem::take(&mut message.attachments);
        let reconcile = groups::reconcile(self.groups.as_ref(), &self.number, source, message);
        let fetch = attachments::resolve_all(self.api.as_ref(), &mut pointers);
        let (retained, fetched) = tokio::join!(reconcile, fetch);
        let retained = retained?;
        fetched?;
        if retained {
            message.attachments = pointers;
        }
        Ok(())
    }

    async fn handle_sync_message(&self, sync: SyncMessage) -> Result<(), ReceiverError> {
        if let Some(mut sent) = sync.sent {
            self.process_decrypted(&mut sent.message, &self.number)
                .await?;
            self.events.publish(ReceiverEvent::Sent(SentEvent {
                destination: sent.destination,
                timestamp: sent.timestamp,
                message: sent.message,
                expiration_start_timestamp: sent.expiration_start_timestamp,
            }));
            return Ok(());
        }
        if let Some(pointer) = sync.contacts {
            let blob = attachments::fetch_and_open(self.api.as_ref(), &pointer).await?;
            let records: Vec<ContactRecord> = read_records(&blob)?;
            for record in records {
                self.events.publish(ReceiverEvent::Contact(record));
            }
            self.events.publish(ReceiverEvent::ContactSyncDone);
            return Ok(());
        }
        if let Some(pointer) = sync.groups {
            let blob = attachments::fetch_and_open(self.api.as_ref(), &pointer).await?;
            let records: Vec<GroupSyncRecord> = read_records(&blob)?;
            for record in records {
                groups::apply_sync_record(self.groups.as_ref(), &record).await;
                self.events.publish(ReceiverEvent::Group(record));
            }
            self.events.publish(ReceiverEvent::GroupSyncDone);
            return Ok(());
        }
        if let Some(blocked) = sync.blocked {
            self.contacts.replace_blocked(blocked.numbers).await;
            return Ok(());
        }
        if let Some(request) = sync.request {
            debug!("ignoring sync request {:?}", request.request_type);
            return Ok(());
        }
        if let Some(marks) = sync.read {
            for mark in marks {
                self.events.publish(ReceiverEvent::Read(mark));
            }
            return Ok(());
        }
        Err(ReceiverError::EmptySyncMessage)
    }
}
