//! Dauerhafter Nachrichten-Speicher (Kollaborateur)
//!
//! Speichert ausschliesslich verschluesselte `MessageFrame`s. Der Klartext
//! existiert nur im `MessageCache`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sealchat_core::{ChannelId, MessageId};
use sealchat_protocol::MessageFrame;

use crate::error::ClientResult;

/// Dauerhafter Speicher fuer verschluesselte Nachrichten
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Speichert einen Frame; vorhandene Ids werden ignoriert
    async fn insert(&self, message: &MessageFrame) -> ClientResult<()>;

    /// Neueste zuerst, `before` exklusiv
    async fn query(
        &self,
        channel_id: ChannelId,
        before: Option<i64>,
        limit: usize,
    ) -> ClientResult<Vec<MessageFrame>>;
}

/// In-Memory-Implementierung fuer Tests und Entwicklung
#[derive(Default)]
pub struct MemoryMessageStore {
    channels: RwLock<HashMap<ChannelId, HashMap<MessageId, MessageFrame>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.channels.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: &MessageFrame) -> ClientResult<()> {
        self.channels
            .write()
            .entry(message.channel_id)
            .or_default()
            .entry(message.id)
            .or_insert_with(|| message.clone());
        Ok(())
    }

    async fn query(
        &self,
        channel_id: ChannelId,
        before: Option<i64>,
        limit: usize,
    ) -> ClientResult<Vec<MessageFrame>> {
        let channels = self.channels.read();
        let Some(nachrichten) = channels.get(&channel_id) else {
            return Ok(Vec::new());
        };

        let mut treffer: Vec<MessageFrame> = nachrichten
            .values()
            .filter(|m| before.map_or(true, |grenze| m.timestamp < grenze))
            .cloned()
            .collect();
        treffer.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        treffer.truncate(limit);
        Ok(treffer)
    }
}
