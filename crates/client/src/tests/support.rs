//! Skriptbarer In-Memory-Server und Hilfsfunktionen fuer Verbindungs-Tests

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use sealchat_core::{ChannelId, MessageId, UserId};
use sealchat_crypto::types::NONCE_LEN;
use sealchat_crypto::{
    encode, GroupKeyManager, IdentityKeyStore, MemoryDirectory, MemorySecureStorage, PublicKey,
};
use sealchat_protocol::{
    ChannelFrame, Endpoint, EndpointTemplate, MessageFrame, MessageType, ProtocolVariant,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionSettings;
use crate::connection::ChannelConnection;
use crate::error::{ClientError, ClientResult};
use crate::event::ChannelEvent;
use crate::state::ConnectionState;
use crate::transport::{Connector, InboundFrame, Link};
use crate::types::MessageEnvelope;

// ---------------------------------------------------------------------------
// MockServer
// ---------------------------------------------------------------------------

struct ServerLink {
    to_client: mpsc::Sender<InboundFrame>,
    cancel: CancellationToken,
}

/// Channel-Server im Speicher
///
/// Beantwortet `hello`, `auth` und `get_history` automatisch, protokolliert
/// alle empfangenen Frames und kann Frames aktiv an den Client schicken.
#[derive(Default)]
pub struct MockServer {
    pub connects: AtomicU32,
    pub offline: AtomicBool,
    /// URLs mit diesem Teilstring sind nicht erreichbar
    pub kaputte_urls: Mutex<Vec<String>>,
    /// URLs mit diesem Teilstring beantworten `hello` nie
    pub stumme_urls: Mutex<Vec<String>>,
    pub auth_ablehnung: Mutex<Option<String>>,
    pub history: Mutex<Vec<MessageFrame>>,
    /// `get_history` bleibt unbeantwortet
    pub history_stumm: AtomicBool,
    /// Eigene Nachrichten werden zurueckgeschickt
    pub echo: AtomicBool,
    pub received: Mutex<Vec<ChannelFrame>>,
    pub endpoints: Mutex<Vec<Endpoint>>,
    links: Mutex<Vec<ServerLink>>,
}

impl MockServer {
    pub fn neu() -> Arc<Self> {
        let server = Self::default();
        server.echo.store(true, Ordering::SeqCst);
        Arc::new(server)
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector(Arc::clone(self)))
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Typnamen aller empfangenen Frames in Reihenfolge
    pub fn empfangene_typen(&self) -> Vec<&'static str> {
        self.received.lock().iter().map(ChannelFrame::type_name).collect()
    }

    pub fn empfangen(&self, typ: &str) -> Vec<ChannelFrame> {
        self.received
            .lock()
            .iter()
            .filter(|f| f.type_name() == typ)
            .cloned()
            .collect()
    }

    /// Vom Client gesendete Nachrichten
    pub fn gesendete_nachrichten(&self) -> Vec<MessageFrame> {
        self.received
            .lock()
            .iter()
            .filter_map(|f| match f {
                ChannelFrame::NewMessage(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Schickt einen Frame ueber den zuletzt aufgebauten Link
    pub async fn push(&self, frame: ChannelFrame) {
        self.push_roh(InboundFrame::Frame(frame)).await;
    }

    pub async fn push_roh(&self, frame: InboundFrame) {
        let tx = self
            .links
            .lock()
            .last()
            .map(|link| link.to_client.clone())
            .expect("Kein Link vorhanden");
        tx.send(frame).await.expect("Client hoert nicht mehr zu");
    }

    /// Beendet alle Links wie ein Verbindungsabbruch
    pub fn links_trennen(&self) {
        for link in self.links.lock().drain(..) {
            link.cancel.cancel();
        }
    }

    fn trifft(liste: &Mutex<Vec<String>>, url: &str) -> bool {
        liste.lock().iter().any(|teil| url.contains(teil.as_str()))
    }

    fn antworten(&self, frame: &ChannelFrame, endpoint: &Endpoint) -> Vec<ChannelFrame> {
        match frame {
            ChannelFrame::Hello {
                protocol_version, ..
            } => {
                if Self::trifft(&self.stumme_urls, &endpoint.url) {
                    Vec::new()
                } else {
                    vec![ChannelFrame::HelloAck {
                        protocol_version: Some(*protocol_version),
                    }]
                }
            }
            ChannelFrame::Auth { user_id, .. } => match self.auth_ablehnung.lock().clone() {
                Some(reason) => vec![ChannelFrame::AuthFailure { reason }],
                None => vec![ChannelFrame::AuthSuccess {
                    user_id: Some(*user_id),
                }],
            },
            ChannelFrame::GetHistory {
                channel_id,
                limit,
                before,
            } => {
                if self.history_stumm.load(Ordering::SeqCst) {
                    return Vec::new();
                }
                let messages = self
                    .history
                    .lock()
                    .iter()
                    .filter(|m| before.map_or(true, |grenze| m.timestamp < grenze))
                    .take(*limit as usize)
                    .cloned()
                    .collect();
                vec![ChannelFrame::History {
                    channel_id: *channel_id,
                    messages,
                    complete: true,
                }]
            }
            ChannelFrame::NewMessage(message) if self.echo.load(Ordering::SeqCst) => {
                vec![ChannelFrame::NewMessage(message.clone())]
            }
            _ => Vec::new(),
        }
    }
}

struct MockConnector(Arc<MockServer>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> ClientResult<Link> {
        let server = &self.0;
        server.connects.fetch_add(1, Ordering::SeqCst);
        if server.offline.load(Ordering::SeqCst)
            || MockServer::trifft(&server.kaputte_urls, &endpoint.url)
        {
            return Err(ClientError::ConnectionError(format!(
                "{} nicht erreichbar",
                endpoint.url
            )));
        }

        let (link, peer) = Link::pair();
        let cancel = CancellationToken::new();
        server.links.lock().push(ServerLink {
            to_client: peer.to_client.clone(),
            cancel: cancel.clone(),
        });
        server.endpoints.lock().push(endpoint.clone());
        tokio::spawn(bedienen(
            Arc::clone(server),
            peer.from_client,
            peer.to_client,
            cancel,
            endpoint.clone(),
        ));
        Ok(link)
    }
}

async fn bedienen(
    server: Arc<MockServer>,
    mut from_client: mpsc::Receiver<ChannelFrame>,
    to_client: mpsc::Sender<InboundFrame>,
    cancel: CancellationToken,
    endpoint: Endpoint,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = from_client.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        server.received.lock().push(frame.clone());
        for antwort in server.antworten(&frame, &endpoint) {
            if to_client.send(InboundFrame::Frame(antwort)).await.is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Teilnehmer
// ---------------------------------------------------------------------------

/// Benutzer mit Identitaet und eigenem Schluesselbund
pub struct Teilnehmer {
    pub identity: Arc<IdentityKeyStore>,
    pub keys: Arc<GroupKeyManager>,
    pub public_key: PublicKey,
}

impl Teilnehmer {
    pub async fn neu(directory: &Arc<MemoryDirectory>) -> Self {
        let identity = Arc::new(IdentityKeyStore::new(
            UserId::new(),
            Arc::new(MemorySecureStorage::new()),
            directory.clone(),
        ));
        let pair = IdentityKeyStore::generate();
        identity
            .persist(&pair)
            .await
            .expect("Identitaet speichern fehlgeschlagen");
        Self {
            identity,
            keys: Arc::new(GroupKeyManager::new()),
            public_key: pair.public_key,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id()
    }

    pub fn verbindung(&self, server: &Arc<MockServer>) -> ChannelConnection {
        self.verbindung_mit(server, einstellungen(&[("mock://chat/{channel}", ProtocolVariant::V2)]))
    }

    pub fn verbindung_mit(
        &self,
        server: &Arc<MockServer>,
        settings: ConnectionSettings,
    ) -> ChannelConnection {
        ChannelConnection::builder(self.identity.clone(), self.keys.clone(), server.connector())
            .settings(settings)
            .build()
    }

    /// Verschluesselte Nachricht mit dem aktuellen Schluessel des Channels
    pub fn nachricht(&self, channel_id: ChannelId, timestamp: i64, text: &str) -> MessageFrame {
        let key = self
            .keys
            .current_key(channel_id)
            .expect("Kein Schluessel fuer den Channel");
        let klartext = MessageEnvelope::text(text)
            .to_bytes()
            .expect("Klartext serialisieren");
        let blob = encode(&klartext, &key).expect("Verschluesseln fehlgeschlagen");
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        MessageFrame {
            id: MessageId::new(),
            channel_id,
            sender_id: self.user_id(),
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
            message_type: MessageType::Text,
            key_version: key.version,
            timestamp,
            ephemeral: None,
            ttl_seconds: None,
        }
    }
}

pub fn einstellungen(endpunkte: &[(&str, ProtocolVariant)]) -> ConnectionSettings {
    ConnectionSettings {
        endpoints: endpunkte
            .iter()
            .map(|(url, variant)| EndpointTemplate::new(*url, *variant))
            .collect(),
        ..ConnectionSettings::default()
    }
}

// ---------------------------------------------------------------------------
// Warten
// ---------------------------------------------------------------------------

/// Wartet auf das erste Ereignis, das `pred` erfuellt
pub async fn warten_auf<F>(rx: &mut broadcast::Receiver<ChannelEvent>, mut pred: F) -> ChannelEvent
where
    F: FnMut(&ChannelEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("Ereignis-Kanal: {e}"),
            }
        }
    })
    .await
    .expect("Ereignis nicht eingetroffen")
}

/// Sammelt Zustandswechsel bis einschliesslich `ziel`
pub async fn zustaende_bis(
    rx: &mut broadcast::Receiver<ChannelEvent>,
    ziel: ConnectionState,
) -> Vec<ConnectionState> {
    let mut zustaende = Vec::new();
    warten_auf(rx, |event| match event {
        ChannelEvent::StateChanged(state) => {
            zustaende.push(*state);
            *state == ziel
        }
        _ => false,
    })
    .await;
    zustaende
}

/// Pollt eine Bedingung, bis sie zutrifft
pub async fn warten_bis<F>(mut bedingung: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if bedingung() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Bedingung nicht erfuellt");
}
