//! Sicherer Speicher fuer private Schluessel und ausgewickelte Gruppen-Schluessel
//!
//! Das `SecureStorage`-Trait abstrahiert den konkreten Speicher
//! (Keychain, Keystore, Datei). Werte sind rohe Bytes.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::types::SecretBytes;

/// Abstrakter sicherer Schluessel-Speicher
#[async_trait]
pub trait SecureStorage: Send + Sync {
    /// Wert laden (`None` wenn nicht vorhanden)
    async fn get(&self, key: &str) -> CryptoResult<Option<SecretBytes>>;

    /// Wert speichern (ueberschreibt)
    async fn set(&self, key: &str, value: &[u8]) -> CryptoResult<()>;

    /// Wert entfernen (kein Fehler wenn nicht vorhanden)
    async fn remove(&self, key: &str) -> CryptoResult<()>;
}

/// Fluechtiger In-Memory-Speicher (Tests, Gast-Sessions)
#[derive(Debug, Default)]
pub struct MemorySecureStorage {
    entries: DashMap<String, SecretBytes>,
}

impl MemorySecureStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SecureStorage for MemorySecureStorage {
    async fn get(&self, key: &str) -> CryptoResult<Option<SecretBytes>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> CryptoResult<()> {
        self.entries
            .insert(key.to_string(), SecretBytes::new(value.to_vec()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> CryptoResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Datei-basierter Speicher
///
/// Speichert jeden Wert Base64-kodiert unter `base_dir/<key>`. Auf Unix
/// werden die Dateien mit Modus 0600 angelegt.
#[derive(Debug, Clone)]
pub struct DiskSecureStorage {
    base_dir: PathBuf,
}

impl DiskSecureStorage {
    /// Neuer Speicher mit dem angegebenen Basisverzeichnis
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Vollstaendigen Dateipfad berechnen; Schluessel duerfen das
    /// Basisverzeichnis nicht verlassen
    fn full_path(&self, key: &str) -> CryptoResult<PathBuf> {
        let relative = Path::new(key);
        let sauber = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !sauber {
            return Err(CryptoError::Speicher(format!(
                "Ungueltiger Speicher-Schluessel: {key}"
            )));
        }
        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl SecureStorage for DiskSecureStorage {
    async fn get(&self, key: &str) -> CryptoResult<Option<SecretBytes>> {
        let full = self.full_path(key)?;
        let inhalt = match tokio::fs::read_to_string(&full).await {
            Ok(inhalt) => Zeroizing::new(inhalt),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes = BASE64.decode(inhalt.trim()).map_err(|e| {
            CryptoError::Speicher(format!("Beschaedigter Eintrag '{key}': {e}"))
        })?;
        tracing::debug!(path = %full.display(), "Eintrag aus sicherem Speicher gelesen");
        Ok(Some(SecretBytes::new(bytes)))
    }

    async fn set(&self, key: &str, value: &[u8]) -> CryptoResult<()> {
        let full = self.full_path(key)?;

        // Elternverzeichnis anlegen falls noetig
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let inhalt = Zeroizing::new(BASE64.encode(value));
        tokio::fs::write(&full, inhalt.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&full, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tracing::debug!(path = %full.display(), "Eintrag in sicheren Speicher geschrieben");
        Ok(())
    }

    async fn remove(&self, key: &str) -> CryptoResult<()> {
        let full = self.full_path(key)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {
                tracing::debug!(path = %full.display(), "Eintrag entfernt");
                Ok(())
            }
            // Bereits entfernt – kein Fehler
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
