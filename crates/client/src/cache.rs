//! In-Memory Nachrichten-Cache
//!
//! Schluessel-Wert-Speicher nach `MessageId` mit einem zusaetzlichen Index
//! nach `(timestamp, id)`. Jede Id existiert hoechstens einmal. Abonnenten
//! erhalten neue und geaenderte Eintraege ueber einen Broadcast-Kanal.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use sealchat_core::MessageId;
use tokio::sync::broadcast;

use crate::types::{CachedMessage, DeliveryStatus, MessageContent};

/// Kapazitaet des Broadcast-Kanals; langsame Abonnenten verpassen Eintraege
const EVENT_KAPAZITAET: usize = 256;

/// Ergebnis von `MessageCache::insert`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Id war unbekannt
    Inserted,
    /// Vorhandener Eintrag wurde aufgewertet (bestaetigt oder entschluesselt)
    Updated,
    /// Id bekannt, nichts geaendert
    Duplicate,
}

/// Benachrichtigung fuer Cache-Abonnenten
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Inserted(CachedMessage),
    Updated(CachedMessage),
    Evicted(MessageId),
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<MessageId, CachedMessage>,
    order: BTreeSet<(i64, MessageId)>,
}

/// Dedupliziert und ordnet Nachrichten eines Channels
pub struct MessageCache {
    inner: RwLock<CacheInner>,
    events: broadcast::Sender<CacheEvent>,
}

impl MessageCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_KAPAZITAET);
        Self {
            inner: RwLock::new(CacheInner::default()),
            events,
        }
    }

    /// Fuegt einen Eintrag ein, idempotent nach Id
    ///
    /// Ein vorhandener Eintrag wird nur ersetzt, wenn der neue ihn aufwertet:
    /// `Pending`/`Failed` -> `Confirmed` oder `Unreadable` -> `Decrypted`.
    pub fn insert(&self, entry: CachedMessage) -> InsertOutcome {
        let id = entry.message.id;
        let (outcome, snapshot) = {
            let mut inner = self.inner.write();
            match inner.entries.get(&id) {
                None => {
                    inner.order.insert((entry.timestamp(), id));
                    inner.entries.insert(id, entry.clone());
                    (InsertOutcome::Inserted, Some(entry))
                }
                Some(existing) => match merge(existing, &entry) {
                    Some(merged) => {
                        inner.entries.insert(id, merged.clone());
                        (InsertOutcome::Updated, Some(merged))
                    }
                    None => (InsertOutcome::Duplicate, None),
                },
            }
        };

        match (outcome, snapshot) {
            (InsertOutcome::Inserted, Some(entry)) => self.notify(CacheEvent::Inserted(entry)),
            (InsertOutcome::Updated, Some(entry)) => self.notify(CacheEvent::Updated(entry)),
            _ => tracing::trace!(message_id = %id, "Duplikat verworfen"),
        }
        outcome
    }

    /// Ersetzt einen Eintrag bedingungslos (oder legt ihn an)
    pub fn set(&self, entry: CachedMessage) {
        let id = entry.message.id;
        {
            let mut inner = self.inner.write();
            if let Some(alt) = inner.entries.get(&id) {
                let alter_schluessel = (alt.timestamp(), id);
                inner.order.remove(&alter_schluessel);
            }
            inner.order.insert((entry.timestamp(), id));
            inner.entries.insert(id, entry.clone());
        }
        self.notify(CacheEvent::Updated(entry));
    }

    /// Aendert nur den Zustellstatus; `None` wenn die Id unbekannt ist
    pub fn set_status(&self, id: MessageId, status: DeliveryStatus) -> Option<CachedMessage> {
        let updated = {
            let mut inner = self.inner.write();
            let entry = inner.entries.get_mut(&id)?;
            if entry.status == status {
                return Some(entry.clone());
            }
            entry.status = status;
            entry.clone()
        };
        self.notify(CacheEvent::Updated(updated.clone()));
        Some(updated)
    }

    pub fn get(&self, id: &MessageId) -> Option<CachedMessage> {
        self.inner.read().entries.get(id).cloned()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner.read().entries.contains_key(id)
    }

    /// Entfernt einen Eintrag
    pub fn evict(&self, id: &MessageId) -> Option<CachedMessage> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.entries.remove(id)?;
            inner.order.remove(&(removed.timestamp(), *id));
            removed
        };
        self.notify(CacheEvent::Evicted(*id));
        Some(removed)
    }

    /// Neueste zuerst; `before` ist eine exklusive Obergrenze fuer den Zeitstempel
    pub fn query(&self, before: Option<i64>, limit: usize) -> Vec<CachedMessage> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .rev()
            .filter(|(ts, _)| before.map_or(true, |grenze| *ts < grenze))
            .take(limit)
            .filter_map(|(_, id)| inner.entries.get(id).cloned())
            .collect()
    }

    /// Alle Eintraege, aelteste zuerst
    pub fn ascending(&self) -> Vec<CachedMessage> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|(_, id)| inner.entries.get(id).cloned())
            .collect()
    }

    /// Eintraege mit Platzhalter statt Klartext
    pub fn unreadable(&self) -> Vec<CachedMessage> {
        self.ascending()
            .into_iter()
            .filter(|entry| !entry.content.ist_lesbar())
            .collect()
    }

    /// Aeltester Zeitstempel (Startpunkt fuer weiteres Nachladen)
    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.inner.read().order.iter().next().map(|(ts, _)| *ts)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: CacheEvent) {
        // Ohne Abonnenten schlaegt send fehl, das ist kein Fehler
        let _ = self.events.send(event);
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Aufgewerteter Eintrag oder `None`, wenn `incoming` nichts Neues bringt
fn merge(existing: &CachedMessage, incoming: &CachedMessage) -> Option<CachedMessage> {
    let bestaetigt = existing.status != DeliveryStatus::Confirmed
        && incoming.status == DeliveryStatus::Confirmed;
    let entschluesselt = matches!(existing.content, MessageContent::Unreadable(_))
        && matches!(incoming.content, MessageContent::Decrypted(_));

    if !bestaetigt && !entschluesselt {
        return None;
    }

    let mut merged = existing.clone();
    if bestaetigt {
        merged.status = DeliveryStatus::Confirmed;
    }
    if entschluesselt {
        merged.content = incoming.content.clone();
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageEnvelope;
    use sealchat_core::{ChannelId, UserId};
    use sealchat_protocol::{MessageFrame, MessageType};

    fn eintrag(ts: i64) -> CachedMessage {
        CachedMessage {
            message: MessageFrame {
                id: MessageId::new(),
                channel_id: ChannelId::new(),
                sender_id: UserId::new(),
                ciphertext: String::new(),
                nonce: String::new(),
                message_type: MessageType::Text,
                key_version: 1,
                timestamp: ts,
                ephemeral: None,
                ttl_seconds: None,
            },
            content: MessageContent::Decrypted(MessageEnvelope::text(format!("ts {ts}"))),
            status: DeliveryStatus::Confirmed,
        }
    }

    fn zeitstempel(eintraege: &[CachedMessage]) -> Vec<i64> {
        eintraege.iter().map(CachedMessage::timestamp).collect()
    }

    #[test]
    fn doppelte_id_ergibt_einen_eintrag() {
        let cache = MessageCache::new();
        let msg = eintrag(10);
        assert_eq!(cache.insert(msg.clone()), InsertOutcome::Inserted);
        assert_eq!(cache.insert(msg), InsertOutcome::Duplicate);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn query_neueste_zuerst_mit_exklusiver_grenze() {
        let cache = MessageCache::new();
        for ts in [5, 1, 3, 9, 7] {
            cache.insert(eintrag(ts));
        }
        assert_eq!(zeitstempel(&cache.ascending()), vec![1, 3, 5, 7, 9]);
        assert_eq!(zeitstempel(&cache.query(None, 3)), vec![9, 7, 5]);
        assert_eq!(zeitstempel(&cache.query(Some(7), 10)), vec![5, 3, 1]);
        assert_eq!(zeitstempel(&cache.query(Some(1), 10)), Vec::<i64>::new());
        assert_eq!(cache.oldest_timestamp(), Some(1));
    }

    #[test]
    fn gleicher_zeitstempel_bleibt_getrennt() {
        let cache = MessageCache::new();
        cache.insert(eintrag(4));
        cache.insert(eintrag(4));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.query(None, 10).len(), 2);
    }

    #[test]
    fn echo_bestaetigt_pending() {
        let cache = MessageCache::new();
        let mut msg = eintrag(1);
        msg.status = DeliveryStatus::Pending;
        cache.insert(msg.clone());

        let mut echo = msg.clone();
        echo.status = DeliveryStatus::Confirmed;
        assert_eq!(cache.insert(echo.clone()), InsertOutcome::Updated);
        assert_eq!(cache.get(&msg.message.id).unwrap().status, DeliveryStatus::Confirmed);

        // Zweites Echo aendert nichts mehr
        assert_eq!(cache.insert(echo), InsertOutcome::Duplicate);
    }

    #[test]
    fn entschluesselung_ersetzt_platzhalter() {
        let cache = MessageCache::new();
        let mut msg = eintrag(1);
        let lesbar = msg.content.clone();
        msg.content = MessageContent::Unreadable("kein Schluessel".into());
        cache.insert(msg.clone());
        assert_eq!(cache.unreadable().len(), 1);

        msg.content = lesbar.clone();
        assert_eq!(cache.insert(msg.clone()), InsertOutcome::Updated);
        assert_eq!(cache.get(&msg.message.id).unwrap().content, lesbar);
        assert!(cache.unreadable().is_empty());
    }

    #[test]
    fn lesbarer_eintrag_wird_nicht_verschlechtert() {
        let cache = MessageCache::new();
        let msg = eintrag(1);
        cache.insert(msg.clone());

        let mut kaputt = msg.clone();
        kaputt.content = MessageContent::Unreadable("x".into());
        kaputt.status = DeliveryStatus::Failed;
        assert_eq!(cache.insert(kaputt), InsertOutcome::Duplicate);
        assert_eq!(cache.get(&msg.message.id).unwrap(), msg);
    }

    #[test]
    fn set_und_evict() {
        let cache = MessageCache::new();
        let msg = eintrag(2);
        cache.insert(msg.clone());

        let mut verschoben = msg.clone();
        verschoben.message.timestamp = 20;
        cache.set(verschoben);
        assert_eq!(zeitstempel(&cache.ascending()), vec![20]);

        assert!(cache.evict(&msg.message.id).is_some());
        assert!(cache.is_empty());
        assert!(cache.query(None, 10).is_empty());
        assert!(cache.evict(&msg.message.id).is_none());
    }

    #[test]
    fn set_status_aendert_nur_status() {
        let cache = MessageCache::new();
        let msg = eintrag(3);
        cache.insert(msg.clone());
        let updated = cache.set_status(msg.message.id, DeliveryStatus::Failed).unwrap();
        assert_eq!(updated.status, DeliveryStatus::Failed);
        assert_eq!(updated.content, msg.content);
        assert!(cache.set_status(MessageId::new(), DeliveryStatus::Failed).is_none());
    }

    #[tokio::test]
    async fn abonnenten_erhalten_neue_und_geaenderte() {
        let cache = MessageCache::new();
        let mut rx = cache.subscribe();

        let mut msg = eintrag(1);
        msg.status = DeliveryStatus::Pending;
        cache.insert(msg.clone());
        cache.insert(msg.clone());
        msg.status = DeliveryStatus::Confirmed;
        cache.insert(msg.clone());

        assert!(matches!(rx.recv().await.unwrap(), CacheEvent::Inserted(_)));
        match rx.recv().await.unwrap() {
            CacheEvent::Updated(e) => assert_eq!(e.status, DeliveryStatus::Confirmed),
            andere => panic!("unerwartet: {andere:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
