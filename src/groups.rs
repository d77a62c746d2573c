use crate::content::{DataMessage, GroupKind};
use crate::error::ReceiverError;
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Locally reconciled group roster entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: Vec<u8>,
    pub name: Option<String>,
    pub members: Vec<String>,
}

/// One record of a multi-device group sync blob.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSyncRecord {
    pub id: Vec<u8>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub active: bool,
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn get(&self, id: &[u8]) -> Option<GroupRecord>;
    async fn put(&self, record: GroupRecord);
    async fn remove(&self, id: &[u8]);
}

#[derive(Clone, Default)]
pub struct MemoryGroupStore {
    groups: Arc<Mutex<HashMap<String, GroupRecord>>>,
}

impl MemoryGroupStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn len(&self) -> usize {
        self.groups.lock().await.len()
    }
}

fn roster_key(id: &[u8]) -> String {
    hex::encode(id)
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn get(&self, id: &[u8]) -> Option<GroupRecord> {
        self.groups.lock().await.get(&roster_key(id)).cloned()
    }

    async fn put(&self, record: GroupRecord) {
        self.groups
            .lock()
            .await
            .insert(roster_key(&record.id), record);
    }

    async fn remove(&self, id: &[u8]) {
        self.groups.lock().await.remove(&roster_key(id));
    }
}

fn strip_payload(message: &mut DataMessage) {
    message.body = None;
    message.attachments.clear();
}

/// Reconcile the message's group context against the roster store and shape
/// the outgoing event: membership changes are applied, meta-only updates
/// lose their payload, and deliveries lose their metadata. Returns whether
/// the message kept its body and attachments.
pub async fn reconcile(
    store: &dyn GroupStore,
    self_number: &str,
    source: &str,
    message: &mut DataMessage,
) -> Result<bool, ReceiverError> {
    let Some(kind) = message.group.as_ref().map(|g| g.kind) else {
        return Ok(true);
    };
    let group_id = message
        .group
        .as_ref()
        .map(|g| g.id.clone())
        .unwrap_or_default();
    let stored = store.get(&group_id).await;
    let (known_members, known_name) = match stored {
        Some(record) => {
            if !record.members.iter().any(|m| m == source) {
                // Usually a cross-device race, not an attack; keep going.
                warn!(
                    "sender {} is not a member of group {}",
                    source,
                    roster_key(&group_id)
                );
            }
            (record.members, record.name)
        }
        None => {
            if kind == GroupKind::Update {
                let context = message.group.as_ref().map(|g| (g.name.clone(), g.members.clone()));
                let (name, members) = context.unwrap_or_default();
                store
                    .put(GroupRecord {
                        id: group_id.clone(),
                        name,
                        members,
                    })
                    .await;
            } else {
                warn!("Got message for unknown group {}", roster_key(&group_id));
                store
                    .put(GroupRecord {
                        id: group_id.clone(),
                        name: None,
                        members: vec![source.to_string()],
                    })
                    .await;
            }
            (Vec::new(), None)
        }
    };
    let mut retained = true;
    match kind {
        GroupKind::Update => {
            let (new_members, name, has_avatar) = {
                let group = message.group.as_ref().map(|g| {
                    (g.members.clone(), g.name.clone(), g.avatar.is_some())
                });
                group.unwrap_or_default()
            };
            let added: Vec<String> = new_members
                .iter()
                .filter(|m| !known_members.contains(m))
                .cloned()
                .collect();
            store
                .put(GroupRecord {
                    id: group_id.clone(),
                    name: name.clone().or(known_name),
                    members: new_members,
                })
                .await;
            if let Some(group) = message.group.as_mut() {
                group.added = added.clone();
            }
            if has_avatar || !added.is_empty() || name.is_some() {
                strip_payload(message);
                retained = false;
            }
        }
        GroupKind::Quit => {
            strip_payload(message);
            retained = false;
            if source == self_number {
                store.remove(&group_id).await;
            } else if let Some(mut record) = store.get(&group_id).await {
                record.members.retain(|m| m != source);
                store.put(record).await;
            }
        }
        GroupKind::Deliver => {
            if let Some(group) = message.group.as_mut() {
                group.name = None;
                group.members.clear();
                group.avatar = None;
            }
        }
        GroupKind::Unknown => return Err(ReceiverError::UnknownGroupType),
    }
    Ok(retained)
}

/// Apply one sync record: active groups are created or have their membership
/// replaced; inactive records are left alone.
pub async fn apply_sync_record(store: &dyn GroupStore, record: &GroupSyncRecord) {
    if !record.active {
        return;
    }
    let name = match store.get(&record.id).await {
        Some(existing) => record.name.clone().or(existing.name),
        None => record.name.clone(),
    };
    store
        .put(GroupRecord {
            id: record.id.clone(),
            name,
            members: record.members.clone(),
        })
        .await;
}
