//! Verbindungs-Pool (eine `ChannelConnection` pro Channel)
//!
//! Gehoert dem Aufrufer; es gibt keinen globalen Zustand. Leerlaufende
//! Verbindungen werden ueber `evict_idle` explizit geschlossen.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sealchat_core::ChannelId;
use sealchat_crypto::{GroupKeyManager, IdentityKeyStore};

use crate::connection::ChannelConnection;

pub struct ConnectionPool {
    connections: DashMap<ChannelId, Arc<ChannelConnection>>,
    idle_threshold: Duration,
}

impl ConnectionPool {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            idle_threshold,
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    /// Legt eine Verbindung ab; eine vorhandene fuer denselben Channel wird getrennt
    pub fn insert(&self, channel_id: ChannelId, connection: Arc<ChannelConnection>) {
        if let Some(alt) = self.connections.insert(channel_id, connection) {
            tracing::debug!(channel = %channel_id, "Vorhandene Verbindung ersetzt");
            alt.disconnect();
        }
    }

    pub fn lookup(&self, channel_id: ChannelId) -> Option<Arc<ChannelConnection>> {
        self.connections
            .get(&channel_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Entfernt und trennt die Verbindung eines Channels
    pub fn evict(&self, channel_id: ChannelId) -> Option<Arc<ChannelConnection>> {
        let (_, connection) = self.connections.remove(&channel_id)?;
        connection.disconnect();
        tracing::debug!(channel = %channel_id, "Verbindung aus dem Pool entfernt");
        Some(connection)
    }

    /// Trennt alle Verbindungen, die laenger als die Schwelle inaktiv sind
    pub fn evict_idle(&self) -> Vec<ChannelId> {
        let inaktiv: Vec<ChannelId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().idle_for() >= self.idle_threshold)
            .map(|entry| *entry.key())
            .collect();

        for channel_id in &inaktiv {
            self.evict(*channel_id);
        }
        if !inaktiv.is_empty() {
            tracing::info!(anzahl = inaktiv.len(), "Inaktive Verbindungen geschlossen");
        }
        inaktiv
    }

    /// Trennt alles und verwirft Gruppen-Schluessel und privaten Schluessel
    /// aus dem Arbeitsspeicher
    pub fn logout(&self, keys: &GroupKeyManager, identity: &IdentityKeyStore) {
        let channels: Vec<ChannelId> = self.connections.iter().map(|e| *e.key()).collect();
        for channel_id in channels {
            self.evict(channel_id);
        }
        keys.wipe_all();
        identity.forget();
        tracing::info!("Abgemeldet, Schluessel-Material verworfen");
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }
}
