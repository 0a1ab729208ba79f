//! Fehlertypen fuer das Client-Crate

use sealchat_core::SealchatError;
use sealchat_crypto::CryptoError;
use thiserror::Error;

/// Client-Fehlertypen
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Verbindung fehlgeschlagen: {0}")]
    ConnectionError(String),

    #[error("Authentifizierung abgelehnt: {0}")]
    AuthFailure(String),

    #[error("Zeitlimit fuer Verlauf ueberschritten ({received} Nachrichten erhalten)")]
    HistoryTimeout { received: usize },

    #[error("Es laeuft bereits eine Verlaufs-Anfrage")]
    HistoryRequestPending,

    #[error("Senden fehlgeschlagen: {0}")]
    SendFailure(String),

    #[error("Maximale Anzahl Wiederverbindungs-Versuche erreicht ({attempts})")]
    MaxReconnectAttemptsExceeded { attempts: u32 },

    #[error("Nachrichten-Speicher: {0}")]
    Speicher(String),

    #[error("Krypto-Fehler: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protokoll-Fehler: {0}")]
    Protokoll(#[from] SealchatError),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Fehler, bei denen die Wiederverbindung nicht weiter versucht wird
    pub fn ist_endgueltig(&self) -> bool {
        matches!(self, Self::AuthFailure(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
