//! Ereignisse einer `ChannelConnection` fuer Abonnenten

use sealchat_core::ChannelId;
use sealchat_crypto::KeyVersion;

use crate::state::ConnectionState;
use crate::types::CachedMessage;

/// Wird ueber einen Broadcast-Kanal an alle Abonnenten verteilt
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Zustandswechsel der Verbindung
    StateChanged(ConnectionState),
    /// Neue Nachricht im Cache (live, Verlauf oder lokales Echo)
    MessageReceived(CachedMessage),
    /// Vorhandene Nachricht aktualisiert (bestaetigt, fehlgeschlagen, entschluesselt)
    MessageUpdated(CachedMessage),
    /// Der Channel nutzt eine neue Schluessel-Version
    KeyRotated {
        channel_id: ChannelId,
        key_version: KeyVersion,
    },
    /// Eigener Schluessel einer Version wurde installiert
    KeyInstalled {
        channel_id: ChannelId,
        key_version: KeyVersion,
    },
    /// Fehler-Frame des Servers
    ServerError {
        code: Option<String>,
        message: String,
        fatal: bool,
    },
    /// Wiederverbindung endgueltig aufgegeben
    ReconnectFailed { attempts: u32 },
}
