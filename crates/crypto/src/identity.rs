//! Langzeit-Identitaetsschluessel (X25519)
//!
//! Jedes Geraet erhaelt bei der Registrierung ein X25519-Schluessel-Paar.
//! Der oeffentliche Schluessel wird im Verzeichnis veroeffentlicht, der
//! private Schluessel verbleibt im sicheren Speicher des Geraets.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sealchat_core::UserId;
use zeroize::Zeroize;

use crate::directory::PublicKeyDirectory;
use crate::error::{CryptoError, CryptoResult};
use crate::storage::SecureStorage;
use crate::types::{IdentityKeyPair, PrivateKey, PublicKey, KEY_LEN};

/// Besitzt und persistiert das Identitaets-Schluesselpaar eines Geraets
pub struct IdentityKeyStore {
    user_id: UserId,
    storage: Arc<dyn SecureStorage>,
    directory: Arc<dyn PublicKeyDirectory>,
    /// Nach dem ersten `load` im Speicher gehalten
    cached: RwLock<Option<PrivateKey>>,
}

impl IdentityKeyStore {
    pub fn new(
        user_id: UserId,
        storage: Arc<dyn SecureStorage>,
        directory: Arc<dyn PublicKeyDirectory>,
    ) -> Self {
        Self {
            user_id,
            storage,
            directory,
            cached: RwLock::new(None),
        }
    }

    /// Generiert ein neues X25519-Schluessel-Paar
    pub fn generate() -> IdentityKeyPair {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let private_key = PrivateKey::from_bytes(bytes);
        bytes.zeroize();

        IdentityKeyPair {
            public_key: private_key.public_key(),
            private_key,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    fn storage_key(&self) -> String {
        format!("identity/{}/private", self.user_id)
    }

    /// Persistiert das Schluesselpaar
    ///
    /// Nur der private Schluessel landet im sicheren Speicher, der
    /// oeffentliche wird an das Verzeichnis uebergeben.
    pub async fn persist(&self, key_pair: &IdentityKeyPair) -> CryptoResult<()> {
        let secret = key_pair.private_key.to_secret_bytes();
        self.storage
            .set(&self.storage_key(), secret.as_bytes())
            .await?;
        *self.cached.write() = Some(key_pair.private_key.clone());

        self.directory
            .publish_public_key(self.user_id, key_pair.public_key)
            .await?;

        tracing::info!(user_id = %self.user_id, "Identitaets-Schluessel persistiert");
        Ok(())
    }

    /// Laedt den privaten Schluessel
    ///
    /// Fehler: `KeyNotFound` wenn noch nie ein Schluessel persistiert wurde.
    pub async fn load(&self) -> CryptoResult<PrivateKey> {
        if let Some(key) = self.cached.read().as_ref() {
            return Ok(key.clone());
        }

        let secret = self
            .storage
            .get(&self.storage_key())
            .await?
            .ok_or_else(|| {
                CryptoError::KeyNotFound(format!("Identitaets-Schluessel fuer {}", self.user_id))
            })?;
        let key = PrivateKey::from_slice(secret.as_bytes())?;
        *self.cached.write() = Some(key.clone());
        Ok(key)
    }

    /// Laedt den Schluessel oder erzeugt und persistiert einen neuen
    pub async fn load_or_generate(&self) -> CryptoResult<PrivateKey> {
        match self.load().await {
            Ok(key) => Ok(key),
            Err(CryptoError::KeyNotFound(_)) => {
                tracing::info!(user_id = %self.user_id, "Kein Identitaets-Schluessel vorhanden, erzeuge neuen");
                let pair = Self::generate();
                self.persist(&pair).await?;
                Ok(pair.private_key)
            }
            Err(e) => Err(e),
        }
    }

    /// Oeffentlicher Schluessel (abgeleitet aus dem privaten)
    pub async fn public_key(&self) -> CryptoResult<PublicKey> {
        Ok(self.load().await?.public_key())
    }

    /// Verwirft nur die Kopie im Arbeitsspeicher (Abmeldung)
    ///
    /// Der persistierte Schluessel bleibt erhalten; das naechste `load` liest
    /// ihn erneut aus dem sicheren Speicher.
    pub fn forget(&self) {
        if self.cached.write().take().is_some() {
            tracing::debug!(user_id = %self.user_id, "Identitaets-Schluessel aus dem Speicher verworfen");
        }
    }

    /// Liegt der private Schluessel im Arbeitsspeicher?
    pub fn ist_geladen(&self) -> bool {
        self.cached.read().is_some()
    }

    /// Entfernt den privaten Schluessel aus Speicher und Cache
    pub async fn wipe(&self) -> CryptoResult<()> {
        self.cached.write().take();
        self.storage.remove(&self.storage_key()).await?;
        tracing::info!(user_id = %self.user_id, "Identitaets-Schluessel geloescht");
        Ok(())
    }
}

impl std::fmt::Debug for IdentityKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKeyStore {{ user_id: {} }}", self.user_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
