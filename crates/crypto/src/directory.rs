//! Schluessel-Verzeichnis (externer Dienst)
//!
//! Das Verzeichnis bildet `UserId -> PublicKey` ab. Der Client veroeffentlicht
//! dort seinen oeffentlichen Schluessel und schlaegt die Schluessel anderer
//! Mitglieder nach, um Gruppen-Schluessel fuer sie einzuwickeln.

use async_trait::async_trait;
use dashmap::DashMap;
use sealchat_core::UserId;

use crate::error::{CryptoError, CryptoResult};
use crate::types::PublicKey;

/// Zugriff auf das externe Identitaets-Verzeichnis
#[async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    /// Oeffentlichen Schluessel eines Benutzers nachschlagen
    async fn lookup_public_key(&self, user_id: UserId) -> CryptoResult<PublicKey>;

    /// Eigenen oeffentlichen Schluessel veroeffentlichen
    async fn publish_public_key(&self, user_id: UserId, key: PublicKey) -> CryptoResult<()>;
}

/// In-Memory-Verzeichnis fuer Tests und lokale Entwicklung
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    keys: DashMap<UserId, PublicKey>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublicKeyDirectory for MemoryDirectory {
    async fn lookup_public_key(&self, user_id: UserId) -> CryptoResult<PublicKey> {
        self.keys
            .get(&user_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| {
                CryptoError::KeyNotFound(format!("oeffentlicher Schluessel fuer {user_id}"))
            })
    }

    async fn publish_public_key(&self, user_id: UserId, key: PublicKey) -> CryptoResult<()> {
        if let Some(alt) = self.keys.insert(user_id, key) {
            if alt != key {
                tracing::info!(user_id = %user_id, "Oeffentlicher Schluessel ersetzt");
            }
        }
        Ok(())
    }
}
