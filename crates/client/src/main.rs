//! Sealchat Client – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging, verbindet sich mit
//! einem Channel und sendet Zeilen von stdin als Textnachrichten.
//!
//! Aufruf: `sealchat <channel-id>` oder `sealchat --neu` (neuer Channel).

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sealchat_client::{
    ChannelConnection, ChannelEvent, ClientConfig, ConnectionPool, MessageContent,
    MessageEnvelope, SchemeConnector,
};
use sealchat_core::{ChannelId, UserId};
use sealchat_crypto::{DiskSecureStorage, GroupKeyManager, IdentityKeyStore, MemoryDirectory};
use sealchat_observability::{logging_initialisieren, ClientMetrics};
use sealchat_protocol::MessageType;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Konfigurationsdatei-Pfad aus Umgebungsvariable oder Standard
    let config_pfad =
        std::env::var("SEALCHAT_CONFIG").unwrap_or_else(|_| "sealchat.toml".into());

    // Konfiguration laden (Standardwerte falls Datei fehlt)
    let config = ClientConfig::laden(&config_pfad)?;

    logging_initialisieren(&config.logging.level, &config.logging.format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        "Sealchat Client wird initialisiert"
    );

    let (channel_id, neuer_channel) = match std::env::args().nth(1).as_deref() {
        Some("--neu") => (ChannelId::new(), true),
        Some(arg) => (
            arg.parse::<ChannelId>()
                .with_context(|| format!("Ungueltige Channel-ID '{arg}'"))?,
            false,
        ),
        None => bail!("Aufruf: sealchat <channel-id> | sealchat --neu"),
    };

    // Identitaet
    let user_id = config.identitaet.benutzer_id.unwrap_or_else(|| {
        let id = UserId::new();
        tracing::warn!(user_id = %id, "Keine benutzer_id konfiguriert, verwende temporaere Identitaet");
        id
    });
    let storage = Arc::new(DiskSecureStorage::new(
        &config.identitaet.schluessel_verzeichnis,
    ));
    let identity = Arc::new(IdentityKeyStore::new(
        user_id,
        storage.clone(),
        Arc::new(MemoryDirectory::new()),
    ));
    identity.load_or_generate().await?;

    // Gruppen-Schluessel
    let keys = Arc::new(GroupKeyManager::new());
    if neuer_channel {
        keys.create_channel(channel_id);
        tracing::info!(channel = %channel_id, "Neuer Channel angelegt");
    } else {
        let versionen = keys.restore_from(storage.as_ref(), channel_id).await?;
        if versionen == 0 {
            tracing::info!(channel = %channel_id, "Kein lokaler Schluessel, fordere key_info an");
        }
    }

    let metrics = ClientMetrics::neu()?;
    let pool = ConnectionPool::new(config.idle_schwelle());
    let connection = Arc::new(
        ChannelConnection::builder(
            identity.clone(),
            keys.clone(),
            Arc::new(SchemeConnector::new()),
        )
        .settings(config.connection_settings())
        .metrics(metrics.clone())
        .build(),
    );
    pool.insert(channel_id, connection.clone());

    let mut events = connection.subscribe();
    connection.open(channel_id).await?;
    if keys.current_version(channel_id).is_none() {
        connection.request_key_info().await?;
    }

    let mut zeilen = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            zeile = zeilen.next_line() => match zeile? {
                Some(text) if !text.trim().is_empty() => {
                    if let Err(e) = connection.send(MessageEnvelope::text(text), MessageType::Text).await {
                        tracing::warn!(fehler = %e, "Nachricht nicht gesendet");
                    }
                }
                Some(_) => {}
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => ereignis_ausgeben(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(verpasst = n, "Ereignisse verpasst");
                }
                Err(_) => break,
            },
        }
    }

    // Schluessel sichern, dann abmelden
    if keys.current_version(channel_id).is_some() {
        keys.save_to(storage.as_ref(), channel_id).await?;
    }
    pool.logout(&keys, &identity);
    tracing::debug!(metriken = %metrics.exportieren()?, "Client beendet");
    Ok(())
}

fn ereignis_ausgeben(event: &ChannelEvent) {
    match event {
        ChannelEvent::MessageReceived(eintrag) => match &eintrag.content {
            MessageContent::Decrypted(envelope) => {
                tracing::info!(von = %eintrag.message.sender_id, "{}", envelope.text);
            }
            MessageContent::Unreadable(grund) => {
                tracing::info!(von = %eintrag.message.sender_id, grund = %grund, "[nicht lesbar]");
            }
        },
        ChannelEvent::StateChanged(state) => tracing::info!(zustand = %state, "Verbindung"),
        ChannelEvent::ReconnectFailed { attempts } => {
            tracing::error!(attempts, "Wiederverbindung aufgegeben");
        }
        andere => tracing::debug!(event = ?andere, "Ereignis"),
    }
}
