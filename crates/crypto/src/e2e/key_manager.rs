//! Gruppen-Schluessel-Verwaltung (Schluesselbund pro Geraet)
//!
//! Haelt fuer jeden Channel alle jemals ausgewickelten Schluessel-Versionen.
//! Die aktuelle Version ist die hoechste installierte; aeltere Versionen
//! bleiben erhalten, damit alte Nachrichten lesbar bleiben.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use sealchat_core::{ChannelId, UserId};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::e2e::group_key::{
    create_group_key, rotate_group_key, unwrap_key, wrap_key_for_member, RotatedKey,
};
use crate::error::{CryptoError, CryptoResult};
use crate::storage::SecureStorage;
use crate::types::{
    GroupKey, GroupKeyAlgorithm, KeyVersion, PrivateKey, PublicKey, SecretBytes, WrappedKeyRecord,
    KEY_LEN,
};

/// Persistierte Form eines Schluesselbunds
#[derive(Serialize, Deserialize)]
struct GespeicherterRing {
    algorithm: GroupKeyAlgorithm,
    /// Version -> Base64-Schluessel
    keys: BTreeMap<KeyVersion, String>,
}

impl Drop for GespeicherterRing {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        for value in self.keys.values_mut() {
            value.zeroize();
        }
    }
}

/// Verwaltet Gruppen-Schluessel fuer alle Channels eines Geraets
#[derive(Debug, Default)]
pub struct GroupKeyManager {
    rings: DashMap<ChannelId, BTreeMap<KeyVersion, Arc<GroupKey>>>,
    /// Algorithmus fuer neu erzeugte Schluessel
    algorithm: GroupKeyAlgorithm,
}

impl GroupKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_algorithm(algorithm: GroupKeyAlgorithm) -> Self {
        Self {
            rings: DashMap::new(),
            algorithm,
        }
    }

    fn storage_key(channel_id: ChannelId) -> String {
        format!("groupkeys/{channel_id}")
    }

    /// Erstellt den ersten Schluessel (Version 1) fuer einen neuen Channel
    pub fn create_channel(&self, channel_id: ChannelId) -> Arc<GroupKey> {
        let key = Arc::new(create_group_key(channel_id, 1, self.algorithm));
        self.rings
            .entry(channel_id)
            .or_default()
            .insert(1, Arc::clone(&key));
        tracing::info!(channel = %channel_id, "Channel-Schluessel erstellt");
        key
    }

    /// Installiert eine Schluessel-Version
    ///
    /// Eine bereits vorhandene Version wird nicht ersetzt.
    pub fn install(&self, key: GroupKey) -> Arc<GroupKey> {
        let channel_id = key.channel_id;
        let version = key.version;
        let mut ring = self.rings.entry(channel_id).or_default();
        let installed = ring
            .entry(version)
            .or_insert_with(|| Arc::new(key))
            .clone();
        tracing::debug!(channel = %channel_id, key_version = version, "Schluessel installiert");
        installed
    }

    /// Schluessel einer bestimmten Version
    pub fn key(&self, channel_id: ChannelId, version: KeyVersion) -> CryptoResult<Arc<GroupKey>> {
        self.rings
            .get(&channel_id)
            .and_then(|ring| ring.get(&version).cloned())
            .ok_or_else(|| CryptoError::KeinGruppenSchluessel {
                channel_id: channel_id.to_string(),
                version,
            })
    }

    /// Aktueller (hoechster) Schluessel eines Channels
    pub fn current_key(&self, channel_id: ChannelId) -> CryptoResult<Arc<GroupKey>> {
        self.rings
            .get(&channel_id)
            .and_then(|ring| ring.values().next_back().cloned())
            .ok_or_else(|| CryptoError::KeinGruppenSchluessel {
                channel_id: channel_id.to_string(),
                version: 0,
            })
    }

    pub fn current_version(&self, channel_id: ChannelId) -> Option<KeyVersion> {
        self.rings
            .get(&channel_id)
            .and_then(|ring| ring.keys().next_back().copied())
    }

    /// Alle installierten Versionen, aufsteigend
    pub fn versions(&self, channel_id: ChannelId) -> Vec<KeyVersion> {
        self.rings
            .get(&channel_id)
            .map(|ring| ring.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Wickelt den aktuellen Schluessel fuer ein Mitglied ein
    pub fn wrap_for_member(
        &self,
        channel_id: ChannelId,
        member_id: UserId,
        public_key: &PublicKey,
    ) -> CryptoResult<WrappedKeyRecord> {
        let key = self.current_key(channel_id)?;
        let blob = wrap_key_for_member(&key, public_key)?;
        Ok(WrappedKeyRecord::new(channel_id, member_id, key.version, &blob)
            .with_algorithm(key.algorithm))
    }

    /// Wickelt einen empfangenen Datensatz aus und installiert ihn
    ///
    /// Ohne `algorithm` im Datensatz gilt der Algorithmus dieses Schluesselbunds.
    pub fn accept_wrapped(
        &self,
        record: &WrappedKeyRecord,
        own_private: &PrivateKey,
    ) -> CryptoResult<Arc<GroupKey>> {
        let blob = record.blob()?;
        let key = unwrap_key(
            &blob,
            own_private,
            record.scope_id,
            record.key_version,
            record.algorithm.unwrap_or(self.algorithm),
        )?;
        Ok(self.install(key))
    }

    /// Rotiert den Schluessel eines Channels
    ///
    /// Die neue Version wird installiert, die alten bleiben zum Entschluesseln.
    pub fn rotate(
        &self,
        channel_id: ChannelId,
        members: &[(UserId, PublicKey)],
    ) -> CryptoResult<RotatedKey> {
        let current = self.current_key(channel_id)?;
        let rotated = rotate_group_key(&current, members)?;
        self.install(rotated.key.clone());
        Ok(rotated)
    }

    /// Persistiert alle Versionen eines Channels im sicheren Speicher
    pub async fn save_to(
        &self,
        storage: &dyn SecureStorage,
        channel_id: ChannelId,
    ) -> CryptoResult<()> {
        let ring = {
            let Some(ring) = self.rings.get(&channel_id) else {
                return Err(CryptoError::KeinGruppenSchluessel {
                    channel_id: channel_id.to_string(),
                    version: 0,
                });
            };
            let algorithm = ring
                .values()
                .next()
                .map(|k| k.algorithm)
                .unwrap_or(self.algorithm);
            GespeicherterRing {
                algorithm,
                keys: ring
                    .iter()
                    .map(|(version, key)| (*version, BASE64.encode(key.key_bytes.as_bytes())))
                    .collect(),
            }
        };

        let serialized = Zeroizing::new(serde_json::to_vec(&ring)?);
        storage
            .set(&Self::storage_key(channel_id), &serialized)
            .await?;
        tracing::debug!(channel = %channel_id, versions = ring.keys.len(), "Schluesselbund gespeichert");
        Ok(())
    }

    /// Laedt alle gespeicherten Versionen eines Channels
    ///
    /// Gibt die Anzahl wiederhergestellter Versionen zurueck (0 wenn nichts
    /// gespeichert war).
    pub async fn restore_from(
        &self,
        storage: &dyn SecureStorage,
        channel_id: ChannelId,
    ) -> CryptoResult<usize> {
        let Some(raw) = storage.get(&Self::storage_key(channel_id)).await? else {
            return Ok(0);
        };
        let ring: GespeicherterRing = serde_json::from_slice(raw.as_bytes())
            .map_err(|e| CryptoError::Speicher(format!("Beschaedigter Schluesselbund: {e}")))?;

        let mut restored = 0;
        for (version, encoded) in &ring.keys {
            let bytes = SecretBytes::new(BASE64.decode(encoded)?);
            if bytes.len() != KEY_LEN {
                return Err(CryptoError::UngueltigeSchluesselLaenge {
                    erwartet: KEY_LEN,
                    erhalten: bytes.len(),
                });
            }
            self.install(GroupKey {
                channel_id,
                version: *version,
                key_bytes: bytes,
                algorithm: ring.algorithm,
            });
            restored += 1;
        }

        tracing::info!(channel = %channel_id, versions = restored, "Schluesselbund wiederhergestellt");
        Ok(restored)
    }

    /// Entfernt alle Schluessel eines Channels
    pub fn wipe_channel(&self, channel_id: ChannelId) {
        if self.rings.remove(&channel_id).is_some() {
            tracing::info!(channel = %channel_id, "Channel-Schluessel verworfen");
        }
    }

    /// Entfernt alle Schluessel (Logout)
    pub fn wipe_all(&self) {
        let channels = self.rings.len();
        self.rings.clear();
        tracing::info!(channels, "Alle Gruppen-Schluessel verworfen");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
