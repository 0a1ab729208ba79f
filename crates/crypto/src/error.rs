//! Fehlertypen fuer das Kryptografie-Subsystem

use thiserror::Error;

/// Fehler im Kryptografie-Subsystem
///
/// Krypto-Fehler sind nie teilweise erfolgreich: wer einen Fehler erhaelt,
/// bekommt auch keinen Klartext.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Schluessel nicht gefunden: {0}")]
    KeyNotFound(String),

    #[error("Kein Gruppen-Schluessel fuer Kanal {channel_id} (Version {version})")]
    KeinGruppenSchluessel { channel_id: String, version: u32 },

    #[error("Einwickeln des Gruppen-Schluessels fehlgeschlagen: {0}")]
    WrapFailure(String),

    #[error("Auswickeln des Gruppen-Schluessels fehlgeschlagen: {0}")]
    UnwrapFailure(String),

    #[error("Authentifizierung des Ciphertexts fehlgeschlagen")]
    AuthenticationFailure,

    #[error("Verschluesselung fehlgeschlagen: {0}")]
    Verschluesselung(String),

    #[error("Ungueltige Schluessel-Laenge: erwartet {erwartet}, erhalten {erhalten}")]
    UngueltigeSchluesselLaenge { erwartet: usize, erhalten: usize },

    #[error("Key Derivation fehlgeschlagen: {0}")]
    KeyDerivation(String),

    #[error("Sicherer Speicher: {0}")]
    Speicher(String),

    #[error("Schluessel-Verzeichnis: {0}")]
    Verzeichnis(String),

    #[error("Serialisierung fehlgeschlagen: {0}")]
    Serialisierung(#[from] serde_json::Error),

    #[error("Base64-Dekodierung fehlgeschlagen: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehlermeldungen_enthalten_kontext() {
        let e = CryptoError::KeinGruppenSchluessel {
            channel_id: "ch-1".into(),
            version: 3,
        };
        assert!(e.to_string().contains("ch-1"));
        assert!(e.to_string().contains("Version 3"));

        let e = CryptoError::UngueltigeSchluesselLaenge {
            erwartet: 32,
            erhalten: 5,
        };
        assert!(e.to_string().contains("erwartet 32"));
    }
}
