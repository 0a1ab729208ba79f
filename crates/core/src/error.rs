//! Fehlertypen fuer Sealchat
//!
//! Gemeinsamer Fehler-Enum fuer Protokoll- und Konfigurationsfehler.
//! Krypto- und Client-Crates definieren eigene Fehler und konvertieren
//! via `#[from]`.

use thiserror::Error;

/// Globaler Result-Alias fuer Sealchat
pub type Result<T> = std::result::Result<T, SealchatError>;

/// Querschnittliche Fehler im Sealchat-System
#[derive(Debug, Error)]
pub enum SealchatError {
    // --- Verbindung & Netzwerk ---
    #[error("Verbindung fehlgeschlagen: {0}")]
    Verbindung(String),

    #[error("Zeitlimit ueberschritten: {0}")]
    Zeitlimit(String),

    // --- Protokoll ---
    #[error("Ungueltige Nachricht: {0}")]
    UngueltigeNachricht(String),

    #[error("Protokollversion nicht unterstuetzt: erwartet={erwartet}, erhalten={erhalten}")]
    ProtokollVersion { erwartet: u16, erhalten: u16 },

    #[error("Ungueltiger Endpunkt: {0}")]
    UngueltigerEndpunkt(String),

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("JSON-Fehler: {0}")]
    Json(#[from] serde_json::Error),
}

impl SealchatError {
    /// Gibt true zurueck wenn der Fehler wiederholbar sein koennte
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(self, Self::Zeitlimit(_) | Self::Verbindung(_))
    }
}
