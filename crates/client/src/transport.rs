//! Transporte fuer Channel-Verbindungen
//!
//! Ein `Connector` baut zu einem `Endpoint` eine bidirektionale `Link`
//! auf: ausgehend typisierte `ChannelFrame`s, eingehend bereits
//! normalisierte Frames oder Hinweise auf verworfene, ungueltige Frames.
//! Die Uebersetzung in Legacy-Varianten passiert hier, nicht in der
//! Zustandsmaschine.
//!
//! ## Pumpen
//!
//! Jede Verbindung besitzt zwei Tasks:
//! - Schreib-Task: `mpsc::Receiver<ChannelFrame>` -> Adapter -> Socket
//! - Lese-Task: Socket -> Adapter -> `mpsc::Sender<InboundFrame>`
//!
//! Wird der `outbound`-Sender fallengelassen, schliesst der Schreib-Task
//! den Socket. Endet der Lese-Task, sieht der Empfaenger `None`.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use sealchat_protocol::{inbound, outbound, ChannelFrame, Endpoint, FrameCodec, ProtocolVariant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::Framed;

use crate::error::{ClientError, ClientResult};

/// Puffergroesse der Frame-Kanaele pro Richtung
const KANAL_KAPAZITAET: usize = 64;

/// Eingehendes Ereignis einer Verbindung
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Frame(ChannelFrame),
    /// Verworfener Frame mit Grund (Verbindung bleibt bestehen)
    Malformed(String),
}

/// Aufgebaute Transport-Verbindung
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<ChannelFrame>,
    pub inbound: mpsc::Receiver<InboundFrame>,
}

impl Link {
    /// Erzeugt ein Paar aus Link und Gegenstelle (fuer In-Memory-Transporte)
    pub fn pair() -> (Self, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(KANAL_KAPAZITAET);
        let (in_tx, in_rx) = mpsc::channel(KANAL_KAPAZITAET);
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                from_client: out_rx,
                to_client: in_tx,
            },
        )
    }
}

/// Gegenstelle eines `Link`: sieht ausgehende Frames, liefert eingehende
#[derive(Debug)]
pub struct LinkPeer {
    pub from_client: mpsc::Receiver<ChannelFrame>,
    pub to_client: mpsc::Sender<InboundFrame>,
}

/// Baut Transport-Verbindungen zu Endpunkten auf
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> ClientResult<Link>;
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// `tcp://host:port/...` mit laengenpraefixiertem JSON (`FrameCodec`)
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }

    /// `host:port` aus `tcp://host:port/pfad`
    fn adresse(endpoint: &Endpoint) -> ClientResult<String> {
        let rest = endpoint
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| ClientError::ConnectionError(format!("Ungueltige URL: {}", endpoint.url)))?;
        let adresse = rest.split('/').next().unwrap_or_default();
        if adresse.is_empty() {
            return Err(ClientError::ConnectionError(format!(
                "Keine Adresse in {}",
                endpoint.url
            )));
        }
        Ok(adresse.to_string())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> ClientResult<Link> {
        let adresse = Self::adresse(endpoint)?;
        let stream = TcpStream::connect(&adresse)
            .await
            .map_err(|e| ClientError::ConnectionError(format!("{adresse}: {e}")))?;
        let _ = stream.set_nodelay(true);

        let (sink, stream) = Framed::new(stream, FrameCodec::new()).split();
        let (link, peer) = Link::pair();
        schreib_pumpe(sink, peer.from_client, endpoint.variant, |value| value, endpoint.url.clone());
        lese_pumpe(
            stream,
            peer.to_client,
            |item: Result<Result<Value, serde_json::Error>, std::io::Error>| match item {
                Ok(json) => Empfang::Frame(json_zu_frame(json)),
                Err(e) => {
                    tracing::warn!(fehler = %e, "TCP-Lesefehler");
                    Empfang::Ende
                }
            },
            endpoint.url.clone(),
        );

        tracing::debug!(adresse = %adresse, variant = %endpoint.variant, "TCP-Verbindung aufgebaut");
        Ok(link)
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// `ws://` und `wss://` mit JSON-Textnachrichten
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> ClientResult<Link> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(endpoint.url.as_str())
            .await
            .map_err(|e| ClientError::ConnectionError(format!("{}: {e}", endpoint.url)))?;

        let (sink, stream) = ws_stream.split();
        let (link, peer) = Link::pair();
        schreib_pumpe(
            sink,
            peer.from_client,
            endpoint.variant,
            |value: Value| Message::Text(value.to_string()),
            endpoint.url.clone(),
        );
        lese_pumpe(
            stream,
            peer.to_client,
            |item: Result<Message, tokio_tungstenite::tungstenite::Error>| match item {
                Ok(Message::Text(text)) => Empfang::Frame(json_zu_frame(serde_json::from_str(&text))),
                Ok(Message::Binary(bytes)) => {
                    Empfang::Frame(json_zu_frame(serde_json::from_slice(&bytes)))
                }
                Ok(Message::Close(_)) => Empfang::Ende,
                Ok(_) => Empfang::Ignorieren,
                Err(e) => {
                    tracing::warn!(fehler = %e, "WebSocket-Lesefehler");
                    Empfang::Ende
                }
            },
            endpoint.url.clone(),
        );

        tracing::debug!(url = %endpoint.url, variant = %endpoint.variant, "WebSocket verbunden");
        Ok(link)
    }
}

// ---------------------------------------------------------------------------
// Schema-Weiche
// ---------------------------------------------------------------------------

/// Waehlt den Transport anhand des URL-Schemas
#[derive(Debug, Clone, Default)]
pub struct SchemeConnector {
    tcp: TcpConnector,
    ws: WsConnector,
}

impl SchemeConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for SchemeConnector {
    async fn connect(&self, endpoint: &Endpoint) -> ClientResult<Link> {
        match endpoint.scheme().as_str() {
            "tcp" => self.tcp.connect(endpoint).await,
            "ws" | "wss" => self.ws.connect(endpoint).await,
            andere => Err(ClientError::ConnectionError(format!(
                "Nicht unterstuetztes Schema '{andere}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Pumpen
// ---------------------------------------------------------------------------

enum Empfang {
    Frame(InboundFrame),
    Ignorieren,
    Ende,
}

fn json_zu_frame(json: Result<Value, serde_json::Error>) -> InboundFrame {
    match json {
        Ok(value) => match inbound(value) {
            Ok(frame) => InboundFrame::Frame(frame),
            Err(e) => InboundFrame::Malformed(e.to_string()),
        },
        Err(e) => InboundFrame::Malformed(format!("Ungueltiges JSON: {e}")),
    }
}

fn schreib_pumpe<Si, T, F>(
    mut sink: Si,
    mut frames: mpsc::Receiver<ChannelFrame>,
    variant: ProtocolVariant,
    mut verpacken: F,
    endpoint: String,
) where
    Si: Sink<T> + Unpin + Send + 'static,
    Si::Error: std::fmt::Display,
    T: Send + 'static,
    F: FnMut(Value) -> T + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let value = match outbound(&frame, variant) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(typ = frame.type_name(), fehler = %e, "Frame nicht serialisierbar");
                    continue;
                }
            };
            if let Err(e) = sink.send(verpacken(value)).await {
                tracing::warn!(endpoint = %endpoint, fehler = %e, "Senden fehlgeschlagen");
                break;
            }
        }
        let _ = sink.close().await;
        tracing::debug!(endpoint = %endpoint, "Schreib-Task beendet");
    });
}

fn lese_pumpe<St, F>(
    mut stream: St,
    frames: mpsc::Sender<InboundFrame>,
    mut parse: F,
    endpoint: String,
) where
    St: Stream + Unpin + Send + 'static,
    St::Item: Send,
    F: FnMut(St::Item) -> Empfang + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = frames.closed() => break,
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            match parse(item) {
                Empfang::Frame(frame) => {
                    if frames.send(frame).await.is_err() {
                        break;
                    }
                }
                Empfang::Ignorieren => {}
                Empfang::Ende => break,
            }
        }
        tracing::debug!(endpoint = %endpoint, "Lese-Task beendet");
    });
}
