//! Client-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Client ohne Konfigurationsdatei
//! lauffaehig ist.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sealchat_core::UserId;
use sealchat_protocol::{EndpointTemplate, ProtocolVariant};

use crate::state::ReconnectPolicy;

/// Vollstaendige Client-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Endpunkte, Zeitlimits, Token
    pub verbindung: VerbindungsEinstellungen,
    /// Backoff fuer Wiederverbindungen
    pub wiederverbindung: WiederverbindungsEinstellungen,
    /// Verlaufs-Synchronisation
    pub history: HistoryEinstellungen,
    /// Verbindungs-Pool
    pub pool: PoolEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
    /// Identitaet und Schluessel-Speicher
    pub identitaet: IdentitaetsEinstellungen,
}

/// Verbindungs-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerbindungsEinstellungen {
    /// Geordnete Endpunkt-Vorlagen, `{channel}` wird ersetzt
    pub endpunkte: Vec<EndpointTemplate>,
    /// Zeitlimit fuer hello/hello_ack pro Endpunkt
    pub handshake_timeout_ms: u64,
    /// Zeitlimit fuer auth_success/auth_failure
    pub auth_timeout_ms: u64,
    /// Optionales Zugangs-Token
    pub token: Option<String>,
    /// Wird im hello-Frame mitgeschickt
    pub client_version: String,
}

impl Default for VerbindungsEinstellungen {
    fn default() -> Self {
        Self {
            endpunkte: vec![
                EndpointTemplate::new("ws://127.0.0.1:9988/ws/{channel}", ProtocolVariant::V2),
                EndpointTemplate::new("ws://127.0.0.1:9988/chat/{channel}", ProtocolVariant::LegacyV1),
                EndpointTemplate::new("ws://127.0.0.1:9988/channel/{channel}", ProtocolVariant::LegacyV0),
            ],
            handshake_timeout_ms: 5_000,
            auth_timeout_ms: 5_000,
            token: None,
            client_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Backoff-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WiederverbindungsEinstellungen {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub max_versuche: u32,
}

impl Default for WiederverbindungsEinstellungen {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            max_versuche: 5,
        }
    }
}

/// Verlaufs-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryEinstellungen {
    /// Standard-Limit pro Anfrage
    pub limit: u32,
    /// Zeitlimit fuer eine vollstaendige Antwort
    pub timeout_ms: u64,
}

impl Default for HistoryEinstellungen {
    fn default() -> Self {
        Self {
            limit: 50,
            timeout_ms: 10_000,
        }
    }
}

/// Pool-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolEinstellungen {
    /// Verbindungen ohne Aktivitaet laenger als dieser Wert werden geschlossen
    pub idle_schwelle_secs: u64,
}

impl Default for PoolEinstellungen {
    fn default() -> Self {
        Self {
            idle_schwelle_secs: 300,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level (trace, debug, info, warn, error)
    pub level: String,
    /// Ausgabeformat: "text" oder "json"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Identitaets-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitaetsEinstellungen {
    /// Feste Benutzer-ID; ohne Angabe wird pro Start eine neue erzeugt
    pub benutzer_id: Option<UserId>,
    /// Verzeichnis fuer den sicheren Schluessel-Speicher
    pub schluessel_verzeichnis: String,
}

impl Default for IdentitaetsEinstellungen {
    fn default() -> Self {
        Self {
            benutzer_id: None,
            schluessel_verzeichnis: "keys".into(),
        }
    }
}

impl ClientConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Laufzeit-Einstellungen fuer eine `ChannelConnection`
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            endpoints: self.verbindung.endpunkte.clone(),
            handshake_timeout: Duration::from_millis(self.verbindung.handshake_timeout_ms),
            auth_timeout: Duration::from_millis(self.verbindung.auth_timeout_ms),
            token: self.verbindung.token.clone(),
            client_version: self.verbindung.client_version.clone(),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(self.wiederverbindung.initial_ms),
                max_delay: Duration::from_millis(self.wiederverbindung.max_ms),
                max_attempts: self.wiederverbindung.max_versuche,
            },
            history_limit: self.history.limit,
            history_timeout: Duration::from_millis(self.history.timeout_ms),
        }
    }

    pub fn idle_schwelle(&self) -> Duration {
        Duration::from_secs(self.pool.idle_schwelle_secs)
    }
}

/// Aufgeloeste Einstellungen einer einzelnen Verbindung
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoints: Vec<EndpointTemplate>,
    pub handshake_timeout: Duration,
    pub auth_timeout: Duration,
    pub token: Option<String>,
    pub client_version: String,
    pub reconnect: ReconnectPolicy,
    pub history_limit: u32,
    pub history_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ClientConfig::default().connection_settings()
    }
}
