//! Echtzeit-Verbindung zu genau einem Channel
//!
//! ```text
//! Disconnected -connect-> Connecting -hello_ack-> Authenticating
//!   -auth_success-> Syncing -history/Zeitlimit-> Live
//! Live/Syncing -Abbruch/fataler Fehler-> Reconnecting(n, delay) -> Syncing
//! Reconnecting(max) -> Disconnected
//! ```
//!
//! Eingehende Frames werden von einem Lese-Task pro Link verarbeitet.
//! Wiederverbindungen laufen in einem eigenen Task, der an die aktuelle
//! Sitzung gebunden ist. `disconnect()` beendet beides sofort und laesst
//! offene Anfragen mit `ConnectionError` scheitern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::{Mutex, RwLock};
use sealchat_core::{jetzt_ms, ChannelId, MessageId, SealchatError, UserId};
use sealchat_crypto::types::NONCE_LEN;
use sealchat_crypto::{
    decode_parts, encode, GroupKeyManager, IdentityKeyStore, KeyVersion, PublicKey,
    WrappedKeyRecord,
};
use sealchat_observability::ClientMetrics;
use sealchat_protocol::{
    candidates, ChannelFrame, Endpoint, MessageFrame, MessageType, WrappedKeyEntry,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::cache::{InsertOutcome, MessageCache};
use crate::config::ConnectionSettings;
use crate::error::{ClientError, ClientResult};
use crate::event::ChannelEvent;
use crate::state::ConnectionState;
use crate::store::MessageStore;
use crate::transport::{Connector, InboundFrame, Link};
use crate::types::{CachedMessage, DeliveryStatus, MessageContent, MessageEnvelope};

/// Kapazitaet des Ereignis-Kanals
const EVENT_KAPAZITAET: usize = 256;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Baut eine `ChannelConnection` aus ihren Kollaborateuren
pub struct ChannelConnectionBuilder {
    identity: Arc<IdentityKeyStore>,
    keys: Arc<GroupKeyManager>,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    cache: Option<Arc<MessageCache>>,
    store: Option<Arc<dyn MessageStore>>,
    metrics: Option<ClientMetrics>,
}

impl ChannelConnectionBuilder {
    pub fn settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn cache(mut self, cache: Arc<MessageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: ClientMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> ChannelConnection {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_KAPAZITAET);

        ChannelConnection {
            inner: Arc::new(Inner {
                user_id: self.identity.user_id(),
                identity: self.identity,
                keys: self.keys,
                connector: self.connector,
                cache: self.cache.unwrap_or_default(),
                store: self.store,
                metrics: self.metrics,
                settings: self.settings,
                state,
                events,
                channel_id: RwLock::new(None),
                key_version: Mutex::new(None),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                pending_auth: Mutex::new(None),
                pending_history: Mutex::new(None),
                session: Mutex::new(CancellationToken::new()),
                reconnect: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelConnection
// ---------------------------------------------------------------------------

/// Zustandsmaschine fuer eine Echtzeit-Verbindung zu einem Channel
pub struct ChannelConnection {
    inner: Arc<Inner>,
}

impl ChannelConnection {
    pub fn builder(
        identity: Arc<IdentityKeyStore>,
        keys: Arc<GroupKeyManager>,
        connector: Arc<dyn Connector>,
    ) -> ChannelConnectionBuilder {
        ChannelConnectionBuilder {
            identity,
            keys,
            connector,
            settings: ConnectionSettings::default(),
            cache: None,
            store: None,
            metrics: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Beobachtet Zustandswechsel
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    /// Gebundener Channel; bleibt auch nach Fehlschlaegen erhalten
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.inner.channel()
    }

    /// Endpunkt der aktiven Verbindung
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.link.lock().as_ref().map(|link| link.endpoint.clone())
    }

    pub fn cache(&self) -> Arc<MessageCache> {
        Arc::clone(&self.inner.cache)
    }

    /// Schluessel-Version, mit der gesendet wird
    pub fn key_version(&self) -> Option<KeyVersion> {
        self.inner.channel().and_then(|ch| self.inner.aktuelle_version(ch))
    }

    /// Zeit seit dem letzten gesendeten oder empfangenen Frame
    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().elapsed()
    }

    /// Baut die Transport-Verbindung auf (Zustand danach: `Authenticating`)
    ///
    /// Probiert die konfigurierten Endpunkte der Reihe nach; der erste mit
    /// `hello_ack` innerhalb des Handshake-Zeitlimits gewinnt.
    pub async fn connect(&self, channel_id: ChannelId) -> ClientResult<()> {
        let inner = &self.inner;
        inner.neue_session();
        inner.link_schliessen();

        let wechsel = inner.channel() != Some(channel_id);
        *inner.channel_id.write() = Some(channel_id);
        if wechsel {
            // Cache gehoert genau einem Channel
            *inner.key_version.lock() = None;
            inner.cache.clear();
        }

        inner.zustand_setzen(ConnectionState::Connecting);
        match inner.herstellen(channel_id).await {
            Ok(()) => {
                inner.zustand_wechseln(
                    |s| *s == ConnectionState::Connecting,
                    ConnectionState::Authenticating,
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(channel = %channel_id, fehler = %e, "Verbindungsaufbau fehlgeschlagen");
                inner.zustand_setzen(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Meldet sich an und synchronisiert den Verlauf (Zustand danach: `Live`)
    ///
    /// `AuthFailure` trennt die Verbindung und wird nie automatisch wiederholt.
    pub async fn authenticate(&self) -> ClientResult<()> {
        let inner = &self.inner;
        match inner.state() {
            ConnectionState::Authenticating => {}
            ConnectionState::Syncing | ConnectionState::Live => return Ok(()),
            andere => {
                return Err(ClientError::ConnectionError(format!(
                    "Anmeldung im Zustand {andere} nicht moeglich"
                )))
            }
        }

        if let Err(e) = inner.anmelden().await {
            inner.link_schliessen();
            inner.zustand_setzen(ConnectionState::Disconnected);
            return Err(e);
        }

        inner.zustand_wechseln(
            |s| *s == ConnectionState::Authenticating,
            ConnectionState::Syncing,
        );
        inner.synchronisieren().await?;
        inner.zustand_wechseln(|s| *s == ConnectionState::Syncing, ConnectionState::Live);
        Ok(())
    }

    /// `connect` + `authenticate`
    pub async fn open(&self, channel_id: ChannelId) -> ClientResult<()> {
        self.connect(channel_id).await?;
        self.authenticate().await
    }

    /// Fordert Verlauf an; hoechstens eine Anfrage gleichzeitig
    ///
    /// Ergebnisse sind aufsteigend nach Zeitstempel sortiert und bereits im
    /// Cache. Bei Zeitlimit bleiben bis dahin empfangene Teile im Cache.
    pub async fn request_history(
        &self,
        limit: u32,
        before: Option<i64>,
    ) -> ClientResult<Vec<CachedMessage>> {
        let state = self.inner.state();
        if !matches!(state, ConnectionState::Live | ConnectionState::Syncing) {
            return Err(ClientError::ConnectionError(format!(
                "Verlauf im Zustand {state} nicht verfuegbar"
            )));
        }
        self.inner.verlauf_anfordern(limit, before).await
    }

    /// Laedt aeltere Nachrichten vor dem aeltesten Cache-Eintrag nach
    pub async fn request_older(&self, limit: u32) -> ClientResult<Vec<CachedMessage>> {
        let before = self.inner.cache.oldest_timestamp();
        self.request_history(limit, before).await
    }

    /// Verschluesselt und sendet eine Nachricht
    ///
    /// Nur im Zustand `Live`. Die Nachricht landet vor der Server-Bestaetigung
    /// mit Status `Pending` im Cache.
    pub async fn send(
        &self,
        envelope: MessageEnvelope,
        message_type: MessageType,
    ) -> ClientResult<MessageId> {
        let inner = &self.inner;
        let state = inner.state();
        if !state.ist_live() {
            return Err(ClientError::SendFailure(format!(
                "Senden im Zustand {state} nicht moeglich"
            )));
        }
        let channel_id = inner
            .channel()
            .ok_or_else(|| ClientError::SendFailure("Kein Channel gebunden".into()))?;
        let version = inner.aktuelle_version(channel_id).ok_or_else(|| {
            ClientError::SendFailure("Kein Gruppen-Schluessel fuer den Channel".into())
        })?;
        let key = inner
            .keys
            .key(channel_id, version)
            .map_err(|e| ClientError::SendFailure(e.to_string()))?;
        let outbound = inner
            .outbound()
            .ok_or_else(|| ClientError::SendFailure("Keine aktive Verbindung".into()))?;

        let blob = encode(&envelope.to_bytes()?, &key)
            .map_err(|e| ClientError::SendFailure(e.to_string()))?;
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let frame = MessageFrame {
            id: MessageId::new(),
            channel_id,
            sender_id: inner.user_id,
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
            message_type,
            key_version: key.version,
            timestamp: jetzt_ms(),
            ephemeral: None,
            ttl_seconds: None,
        };
        let id = frame.id;

        inner
            .eintrag_uebernehmen(CachedMessage {
                message: frame.clone(),
                content: MessageContent::Decrypted(envelope),
                status: DeliveryStatus::Pending,
            })
            .await;

        if outbound.send(ChannelFrame::NewMessage(frame)).await.is_err() {
            if let Some(eintrag) = inner.cache.set_status(id, DeliveryStatus::Failed) {
                inner.emit(ChannelEvent::MessageUpdated(eintrag));
            }
            return Err(ClientError::SendFailure("Verbindung geschlossen".into()));
        }

        if let Some(metrics) = &inner.metrics {
            metrics.frame_gesendet("new_message");
            metrics.messages_sent_total.inc();
        }
        inner.aktivitaet();
        tracing::debug!(message_id = %id, key_version = key.version, "Nachricht gesendet");
        Ok(id)
    }

    /// Wartet, bis der Server die Nachricht bestaetigt hat
    ///
    /// Prueft den Cache bis zu `retries + 1` mal im Abstand `delay`.
    pub async fn verify_delivery(&self, id: MessageId, retries: u32, delay: Duration) -> bool {
        for versuch in 0..=retries {
            let bestaetigt = self
                .inner
                .cache
                .get(&id)
                .is_some_and(|eintrag| eintrag.status == DeliveryStatus::Confirmed);
            if bestaetigt {
                return true;
            }
            if versuch < retries {
                tokio::time::sleep(delay).await;
            }
        }
        tracing::debug!(message_id = %id, retries, "Zustellung nicht bestaetigt");
        false
    }

    /// Rotiert den Gruppen-Schluessel fuer die verbleibenden Mitglieder
    pub async fn rotate_key(&self, members: &[(UserId, PublicKey)]) -> ClientResult<KeyVersion> {
        let inner = &self.inner;
        let state = inner.state();
        if !state.ist_live() {
            return Err(ClientError::SendFailure(format!(
                "Schluessel-Rotation im Zustand {state} nicht moeglich"
            )));
        }
        let channel_id = inner
            .channel()
            .ok_or_else(|| ClientError::SendFailure("Kein Channel gebunden".into()))?;

        let rotated = inner.keys.rotate(channel_id, members)?;
        let wrapped_keys = rotated
            .records
            .iter()
            .map(|record| WrappedKeyEntry {
                member_id: record.member_id,
                encrypted_group_key: record.encrypted_group_key.clone(),
            })
            .collect();
        inner
            .senden(ChannelFrame::KeyRotation {
                channel_id,
                key_version: rotated.version,
                wrapped_keys,
            })
            .await?;

        inner.version_anheben(rotated.version);
        inner.emit(ChannelEvent::KeyRotated {
            channel_id,
            key_version: rotated.version,
        });
        tracing::info!(
            channel = %channel_id,
            key_version = rotated.version,
            mitglieder = members.len(),
            "Gruppen-Schluessel rotiert"
        );
        Ok(rotated.version)
    }

    /// Fordert den eigenen eingewickelten Schluessel an
    pub async fn request_key_info(&self) -> ClientResult<()> {
        let channel_id = self
            .inner
            .channel()
            .ok_or_else(|| ClientError::ConnectionError("Kein Channel gebunden".into()))?;
        self.inner
            .senden(ChannelFrame::KeyInfo {
                channel_id,
                key_version: None,
                encrypted_group_key: None,
            })
            .await
    }

    /// Trennt sofort, bricht Wiederverbindung und offene Anfragen ab
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.session.lock().cancel();
        inner.reconnect.lock().take();
        inner.link_schliessen();
        inner.zustand_setzen(ConnectionState::Disconnected);
        tracing::info!(channel = ?inner.channel(), "Verbindung getrennt");
    }
}

impl Drop for ChannelConnection {
    fn drop(&mut self) {
        self.inner.session.lock().cancel();
        self.inner.link_schliessen();
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("user_id", &self.inner.user_id)
            .field("channel_id", &self.inner.channel())
            .field("state", &self.inner.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Innerer Zustand
// ---------------------------------------------------------------------------

struct ActiveLink {
    generation: u64,
    outbound: mpsc::Sender<ChannelFrame>,
    endpoint: Endpoint,
    cancel: CancellationToken,
}

struct PendingHistory {
    tx: oneshot::Sender<Vec<CachedMessage>>,
    received: Vec<CachedMessage>,
}

struct Inner {
    user_id: UserId,
    identity: Arc<IdentityKeyStore>,
    keys: Arc<GroupKeyManager>,
    connector: Arc<dyn Connector>,
    cache: Arc<MessageCache>,
    store: Option<Arc<dyn MessageStore>>,
    metrics: Option<ClientMetrics>,
    settings: ConnectionSettings,

    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
    channel_id: RwLock<Option<ChannelId>>,
    /// Vom Server gemeldete Schluessel-Version
    key_version: Mutex<Option<KeyVersion>>,

    link: Mutex<Option<ActiveLink>>,
    generation: AtomicU64,
    pending_auth: Mutex<Option<oneshot::Sender<Result<(), String>>>>,
    pending_history: Mutex<Option<PendingHistory>>,

    /// Wird bei `connect`/`disconnect` ersetzt bzw. abgebrochen
    session: Mutex<CancellationToken>,
    /// Laufende Wiederverbindung (Kind der Sitzung)
    reconnect: Mutex<Option<CancellationToken>>,
    last_activity: Mutex<Instant>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn channel(&self) -> Option<ChannelId> {
        *self.channel_id.read()
    }

    fn outbound(&self) -> Option<mpsc::Sender<ChannelFrame>> {
        self.link.lock().as_ref().map(|link| link.outbound.clone())
    }

    fn aktivitaet(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn emit(&self, event: ChannelEvent) {
        // Ohne Abonnenten schlaegt send fehl, das ist kein Fehler
        let _ = self.events.send(event);
    }

    /// Sendeversion: die hoehere aus Server-Meldung und installiertem Schluessel
    fn aktuelle_version(&self, channel_id: ChannelId) -> Option<KeyVersion> {
        let gemeldet = *self.key_version.lock();
        let installiert = self.keys.current_version(channel_id);
        match (gemeldet, installiert) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn version_anheben(&self, version: KeyVersion) {
        let mut aktuell = self.key_version.lock();
        if aktuell.map_or(true, |alt| alt < version) {
            *aktuell = Some(version);
        }
    }

    // --- Zustand ---

    fn zustand_setzen(&self, neu: ConnectionState) {
        self.zustand_wechseln(|_| true, neu);
    }

    /// Wechselt nur, wenn `erlaubt` fuer den aktuellen Zustand zutrifft
    fn zustand_wechseln(
        &self,
        erlaubt: impl FnOnce(&ConnectionState) -> bool,
        neu: ConnectionState,
    ) -> bool {
        let mut alt = None;
        self.state.send_if_modified(|aktuell| {
            if *aktuell == neu || !erlaubt(aktuell) {
                return false;
            }
            alt = Some(std::mem::replace(aktuell, neu));
            true
        });
        let Some(alt) = alt else {
            return false;
        };

        if let Some(metrics) = &self.metrics {
            if neu.ist_live() && !alt.ist_live() {
                metrics.connections_live.inc();
            } else if alt.ist_live() && !neu.ist_live() {
                metrics.connections_live.dec();
            }
        }
        tracing::debug!(channel = ?self.channel(), von = %alt, nach = %neu, "Zustandswechsel");
        self.emit(ChannelEvent::StateChanged(neu));
        true
    }

    // --- Sitzung & Link ---

    fn neue_session(&self) {
        let alt = std::mem::replace(&mut *self.session.lock(), CancellationToken::new());
        alt.cancel();
        self.reconnect.lock().take();
    }

    /// Schliesst den aktiven Link und laesst offene Anfragen scheitern
    fn link_schliessen(&self) {
        if let Some(link) = self.link.lock().take() {
            link.cancel.cancel();
        }
        self.pending_auth.lock().take();
        self.pending_history.lock().take();
    }

    /// Probiert alle Kandidaten und aktiviert den ersten erfolgreichen Link
    async fn herstellen(self: &Arc<Self>, channel_id: ChannelId) -> ClientResult<()> {
        let kandidaten = candidates(&self.settings.endpoints, channel_id);
        if kandidaten.is_empty() {
            return Err(ClientError::ConnectionError(
                "Keine gueltigen Endpunkte konfiguriert".into(),
            ));
        }

        let mut letzter_fehler = String::new();
        for endpoint in kandidaten {
            match timeout(self.settings.handshake_timeout, self.handshake(&endpoint, channel_id))
                .await
            {
                Ok(Ok(link)) => return self.link_aktivieren(link, endpoint),
                Ok(Err(e)) => {
                    tracing::debug!(url = %endpoint.url, variant = %endpoint.variant, fehler = %e, "Endpunkt fehlgeschlagen");
                    letzter_fehler = format!("{}: {e}", endpoint.url);
                }
                Err(_) => {
                    tracing::debug!(url = %endpoint.url, "Zeitlimit beim Handshake");
                    letzter_fehler = format!("{}: Zeitlimit beim Handshake", endpoint.url);
                }
            }
        }
        Err(ClientError::ConnectionError(format!(
            "Kein Endpunkt erreichbar ({letzter_fehler})"
        )))
    }

    /// Transport aufbauen, `hello` senden, auf `hello_ack` warten
    async fn handshake(&self, endpoint: &Endpoint, channel_id: ChannelId) -> ClientResult<Link> {
        let mut link = self.connector.connect(endpoint).await?;
        let erwartet = endpoint.variant.protocol_version();
        let hello = ChannelFrame::Hello {
            protocol_version: erwartet,
            channel_id,
            client_version: self.settings.client_version.clone(),
        };
        link.outbound
            .send(hello)
            .await
            .map_err(|_| ClientError::ConnectionError("Link vor dem Handshake geschlossen".into()))?;
        if let Some(metrics) = &self.metrics {
            metrics.frame_gesendet("hello");
        }

        loop {
            match link.inbound.recv().await {
                Some(InboundFrame::Frame(ChannelFrame::HelloAck { protocol_version })) => {
                    if let Some(erhalten) = protocol_version.filter(|v| *v != erwartet) {
                        return Err(SealchatError::ProtokollVersion { erwartet, erhalten }.into());
                    }
                    return Ok(link);
                }
                Some(InboundFrame::Frame(ChannelFrame::Error { message, .. })) => {
                    return Err(ClientError::ConnectionError(message));
                }
                Some(andere) => tracing::trace!(frame = ?andere, "Frame vor hello_ack ignoriert"),
                None => {
                    return Err(ClientError::ConnectionError(
                        "Verbindung waehrend des Handshakes geschlossen".into(),
                    ))
                }
            }
        }
    }

    fn link_aktivieren(self: &Arc<Self>, link: Link, endpoint: Endpoint) -> ClientResult<()> {
        let session = self.session.lock().clone();
        if session.is_cancelled() {
            return Err(ClientError::ConnectionError("Verbindungsaufbau abgebrochen".into()));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = session.child_token();
        let Link { outbound, inbound } = link;

        tracing::info!(
            channel = ?self.channel(),
            url = %endpoint.url,
            variant = %endpoint.variant,
            "Verbunden"
        );
        let alt = self.link.lock().replace(ActiveLink {
            generation,
            outbound,
            endpoint,
            cancel: cancel.clone(),
        });
        if let Some(alt) = alt {
            alt.cancel.cancel();
        }
        self.aktivitaet();

        tokio::spawn(lese_schleife(Arc::downgrade(self), inbound, generation, cancel));
        Ok(())
    }

    /// Link ist weg (Abbruch oder fataler Fehler)
    fn link_verloren(self: &Arc<Self>, generation: u64, grund: &str) {
        {
            let mut slot = self.link.lock();
            if slot.as_ref().map(|link| link.generation) != Some(generation) {
                return;
            }
            if let Some(link) = slot.take() {
                link.cancel.cancel();
            }
        }
        self.pending_auth.lock().take();
        self.pending_history.lock().take();

        let state = self.state();
        tracing::warn!(channel = ?self.channel(), grund, zustand = %state, "Verbindung verloren");
        match state {
            ConnectionState::Live | ConnectionState::Syncing => self.wiederverbindung_starten(),
            ConnectionState::Reconnecting { .. } => {}
            _ => self.zustand_setzen(ConnectionState::Disconnected),
        }
    }

    async fn senden(&self, frame: ChannelFrame) -> ClientResult<()> {
        let outbound = self
            .outbound()
            .ok_or_else(|| ClientError::ConnectionError("Keine aktive Verbindung".into()))?;
        let typ = frame.type_name();
        outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::ConnectionError("Verbindung geschlossen".into()))?;
        if let Some(metrics) = &self.metrics {
            metrics.frame_gesendet(typ);
        }
        self.aktivitaet();
        Ok(())
    }

    // --- Anmeldung & Verlauf ---

    async fn anmelden(&self) -> ClientResult<()> {
        let public_key = self.identity.public_key().await?;
        let (tx, rx) = oneshot::channel();
        *self.pending_auth.lock() = Some(tx);

        let auth = ChannelFrame::Auth {
            user_id: self.user_id,
            public_key: public_key.to_base64(),
            token: self.settings.token.clone(),
        };
        if let Err(e) = self.senden(auth).await {
            self.pending_auth.lock().take();
            return Err(e);
        }

        match timeout(self.settings.auth_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::info!(user_id = %self.user_id, channel = ?self.channel(), "Authentifiziert");
                Ok(())
            }
            Ok(Ok(Err(reason))) => {
                tracing::warn!(user_id = %self.user_id, grund = %reason, "Authentifizierung abgelehnt");
                Err(ClientError::AuthFailure(reason))
            }
            Ok(Err(_)) => Err(ClientError::ConnectionError(
                "Verbindung waehrend der Authentifizierung getrennt".into(),
            )),
            Err(_) => {
                self.pending_auth.lock().take();
                Err(ClientError::ConnectionError(
                    "Zeitlimit bei der Authentifizierung".into(),
                ))
            }
        }
    }

    fn auth_abschliessen(&self, ergebnis: Result<(), String>) {
        match self.pending_auth.lock().take() {
            Some(tx) => {
                let _ = tx.send(ergebnis);
            }
            None => tracing::debug!("Auth-Antwort ohne offene Anfrage ignoriert"),
        }
    }

    /// Verlauf nach (Wieder-)Anmeldung; Zeitlimit ist kein Fehler
    async fn synchronisieren(&self) -> ClientResult<()> {
        let start = Instant::now();
        let ergebnis = self.verlauf_anfordern(self.settings.history_limit, None).await;
        if let Some(metrics) = &self.metrics {
            metrics
                .history_sync_seconds
                .observe(start.elapsed().as_secs_f64());
        }

        match ergebnis {
            Ok(nachrichten) => {
                tracing::info!(channel = ?self.channel(), anzahl = nachrichten.len(), "Verlauf synchronisiert");
                Ok(())
            }
            Err(ClientError::HistoryTimeout { received }) => {
                tracing::warn!(channel = ?self.channel(), received, "Verlauf unvollstaendig, fahre fort");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn verlauf_anfordern(
        &self,
        limit: u32,
        before: Option<i64>,
    ) -> ClientResult<Vec<CachedMessage>> {
        let channel_id = self
            .channel()
            .ok_or_else(|| ClientError::ConnectionError("Kein Channel gebunden".into()))?;

        let rx = {
            let mut pending = self.pending_history.lock();
            if pending.is_some() {
                return Err(ClientError::HistoryRequestPending);
            }
            let (tx, rx) = oneshot::channel();
            *pending = Some(PendingHistory {
                tx,
                received: Vec::new(),
            });
            rx
        };

        let anfrage = ChannelFrame::GetHistory {
            channel_id,
            limit,
            before,
        };
        if let Err(e) = self.senden(anfrage).await {
            self.pending_history.lock().take();
            return Err(e);
        }

        match timeout(self.settings.history_timeout, rx).await {
            Ok(Ok(nachrichten)) => Ok(nachrichten),
            Ok(Err(_)) => Err(ClientError::ConnectionError(
                "Verbindung waehrend der Verlaufs-Anfrage getrennt".into(),
            )),
            Err(_) => {
                let received = self
                    .pending_history
                    .lock()
                    .take()
                    .map_or(0, |pending| pending.received.len());
                Err(ClientError::HistoryTimeout { received })
            }
        }
    }

    // --- Eingehende Frames ---

    async fn verarbeiten(self: &Arc<Self>, frame: InboundFrame, generation: u64) {
        self.aktivitaet();
        let frame = match frame {
            InboundFrame::Frame(frame) => frame,
            InboundFrame::Malformed(grund) => {
                tracing::warn!(channel = ?self.channel(), grund = %grund, "Ungueltiger Frame verworfen");
                if let Some(metrics) = &self.metrics {
                    metrics.frames_malformed_total.inc();
                }
                return;
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.frame_empfangen(frame.type_name());
        }

        match frame {
            ChannelFrame::AuthSuccess { .. } => self.auth_abschliessen(Ok(())),
            ChannelFrame::AuthFailure { reason } => self.auth_abschliessen(Err(reason)),
            ChannelFrame::History {
                channel_id,
                messages,
                complete,
            } => self.verlauf_empfangen(channel_id, messages, complete).await,
            ChannelFrame::NewMessage(message) => self.nachricht_empfangen(message).await,
            ChannelFrame::KeyRotated {
                channel_id,
                key_version,
            } => self.schluessel_rotiert(channel_id, key_version).await,
            ChannelFrame::KeyInfo {
                channel_id,
                key_version,
                encrypted_group_key,
            } => {
                self.schluessel_empfangen(channel_id, key_version, encrypted_group_key)
                    .await
            }
            ChannelFrame::Error {
                code,
                message,
                fatal,
            } => {
                tracing::warn!(channel = ?self.channel(), code = ?code, fatal, "Server-Fehler: {message}");
                self.emit(ChannelEvent::ServerError {
                    code,
                    message: message.clone(),
                    fatal,
                });
                if fatal {
                    self.link_verloren(generation, &message);
                }
            }
            ChannelFrame::Ping { timestamp } => {
                if let Err(e) = self.senden(ChannelFrame::Pong { timestamp }).await {
                    tracing::debug!(fehler = %e, "Pong nicht gesendet");
                }
            }
            ChannelFrame::Pong { .. } | ChannelFrame::HelloAck { .. } => {}
            andere => {
                tracing::debug!(typ = andere.type_name(), "Unerwarteter Frame ignoriert");
            }
        }
    }

    async fn verlauf_empfangen(
        &self,
        channel_id: ChannelId,
        mut messages: Vec<MessageFrame>,
        complete: bool,
    ) {
        if self.channel() != Some(channel_id) {
            tracing::warn!(channel = %channel_id, "Verlauf fuer fremden Channel verworfen");
            return;
        }

        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        let mut eintraege = Vec::with_capacity(messages.len());
        for message in messages {
            if message.channel_id != channel_id {
                continue;
            }
            let id = message.id;
            let eintrag = self.eintrag_erstellen(message, DeliveryStatus::Confirmed);
            self.eintrag_uebernehmen(eintrag.clone()).await;
            eintraege.push(self.cache.get(&id).unwrap_or(eintrag));
        }

        let mut pending = self.pending_history.lock();
        match pending.as_mut() {
            Some(offen) => {
                offen.received.extend(eintraege);
                if complete {
                    if let Some(mut fertig) = pending.take() {
                        // Abschnitte kommen in beliebiger Reihenfolge
                        fertig.received.sort_by(|a, b| {
                            a.timestamp()
                                .cmp(&b.timestamp())
                                .then(a.message.id.cmp(&b.message.id))
                        });
                        let _ = fertig.tx.send(fertig.received);
                    }
                }
            }
            None => tracing::debug!(anzahl = eintraege.len(), "Verlauf ohne offene Anfrage uebernommen"),
        }
    }

    async fn nachricht_empfangen(&self, message: MessageFrame) {
        if self.channel() != Some(message.channel_id) {
            tracing::warn!(channel = %message.channel_id, "Nachricht fuer fremden Channel verworfen");
            return;
        }

        if let Some(vorhanden) = self.cache.get(&message.id) {
            let eigenes_echo = message.sender_id == self.user_id
                && vorhanden.status != DeliveryStatus::Confirmed;
            if eigenes_echo {
                if let Some(eintrag) = self.cache.set_status(message.id, DeliveryStatus::Confirmed) {
                    tracing::debug!(message_id = %message.id, "Zustellung bestaetigt");
                    self.emit(ChannelEvent::MessageUpdated(eintrag));
                }
            } else {
                tracing::trace!(message_id = %message.id, "Doppelte Nachricht verworfen");
            }
            return;
        }

        let eintrag = self.eintrag_erstellen(message, DeliveryStatus::Confirmed);
        self.eintrag_uebernehmen(eintrag).await;
    }

    async fn schluessel_rotiert(&self, channel_id: ChannelId, key_version: KeyVersion) {
        if self.channel() != Some(channel_id) {
            return;
        }
        if self
            .aktuelle_version(channel_id)
            .is_some_and(|aktuell| aktuell >= key_version)
        {
            tracing::debug!(channel = %channel_id, key_version, "Schluessel-Version bereits bekannt");
            return;
        }

        self.version_anheben(key_version);
        tracing::info!(channel = %channel_id, key_version, "Neue Schluessel-Version");
        self.emit(ChannelEvent::KeyRotated {
            channel_id,
            key_version,
        });

        // Eigenen eingewickelten Schluessel nachfordern
        if self.keys.key(channel_id, key_version).is_err() {
            let anfrage = ChannelFrame::KeyInfo {
                channel_id,
                key_version: Some(key_version),
                encrypted_group_key: None,
            };
            if let Err(e) = self.senden(anfrage).await {
                tracing::warn!(fehler = %e, "key_info-Anfrage nicht gesendet");
            }
        }
    }

    async fn schluessel_empfangen(
        &self,
        channel_id: ChannelId,
        key_version: Option<KeyVersion>,
        encrypted_group_key: Option<String>,
    ) {
        if self.channel() != Some(channel_id) {
            return;
        }
        let (Some(key_version), Some(encrypted_group_key)) = (key_version, encrypted_group_key)
        else {
            tracing::warn!(channel = %channel_id, "key_info ohne Schluessel erhalten");
            return;
        };

        let record = WrappedKeyRecord {
            scope_id: channel_id,
            member_id: self.user_id,
            encrypted_group_key,
            key_version,
            // key_info traegt keinen Algorithmus
            algorithm: None,
        };
        let private_key = match self.identity.load().await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(fehler = %e, "Identitaets-Schluessel nicht verfuegbar");
                return;
            }
        };

        match self.keys.accept_wrapped(&record, &private_key) {
            Ok(key) => {
                tracing::info!(channel = %channel_id, key_version = key.version, "Gruppen-Schluessel installiert");
                self.version_anheben(key.version);
                self.emit(ChannelEvent::KeyInstalled {
                    channel_id,
                    key_version: key.version,
                });
                self.neu_entschluesseln(key.version).await;
            }
            Err(e) => {
                tracing::warn!(channel = %channel_id, key_version, fehler = %e, "Eingewickelter Schluessel nicht lesbar");
            }
        }
    }

    /// Versucht Platzhalter einer Version nach Schluessel-Empfang erneut
    async fn neu_entschluesseln(&self, key_version: KeyVersion) {
        for eintrag in self.cache.unreadable() {
            if eintrag.message.key_version != key_version {
                continue;
            }
            let content = self.entschluesseln(&eintrag.message);
            if content.ist_lesbar() {
                self.eintrag_uebernehmen(CachedMessage { content, ..eintrag })
                    .await;
            }
        }
    }

    // --- Cache & Entschluesselung ---

    fn eintrag_erstellen(&self, message: MessageFrame, status: DeliveryStatus) -> CachedMessage {
        CachedMessage {
            content: self.entschluesseln(&message),
            message,
            status,
        }
    }

    fn entschluesseln(&self, message: &MessageFrame) -> MessageContent {
        match self.klartext(message) {
            Ok(envelope) => MessageContent::Decrypted(envelope),
            Err(grund) => {
                if let Some(metrics) = &self.metrics {
                    metrics.decode_failures_total.inc();
                }
                tracing::debug!(
                    message_id = %message.id,
                    key_version = message.key_version,
                    grund = %grund,
                    "Nachricht nicht entschluesselbar"
                );
                MessageContent::Unreadable(grund)
            }
        }
    }

    fn klartext(&self, message: &MessageFrame) -> Result<MessageEnvelope, String> {
        let key = self
            .keys
            .key(message.channel_id, message.key_version)
            .map_err(|e| e.to_string())?;
        let nonce = BASE64
            .decode(&message.nonce)
            .map_err(|e| format!("Ungueltige Nonce: {e}"))?;
        let ciphertext = BASE64
            .decode(&message.ciphertext)
            .map_err(|e| format!("Ungueltiger Ciphertext: {e}"))?;
        let bytes = decode_parts(&nonce, &ciphertext, &key).map_err(|e| e.to_string())?;
        MessageEnvelope::from_bytes(&bytes)
    }

    /// Cache einfuegen, Abonnenten benachrichtigen, an den Speicher weiterreichen
    async fn eintrag_uebernehmen(&self, eintrag: CachedMessage) -> InsertOutcome {
        let id = eintrag.message.id;
        let outcome = self.cache.insert(eintrag.clone());
        match outcome {
            InsertOutcome::Inserted => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.insert(&eintrag.message).await {
                        tracing::warn!(message_id = %id, fehler = %e, "Nachricht nicht gespeichert");
                    }
                }
                self.emit(ChannelEvent::MessageReceived(eintrag));
            }
            InsertOutcome::Updated => {
                if let Some(aktuell) = self.cache.get(&id) {
                    self.emit(ChannelEvent::MessageUpdated(aktuell));
                }
            }
            InsertOutcome::Duplicate => {}
        }
        outcome
    }

    // --- Wiederverbindung ---

    fn wiederverbindung_starten(self: &Arc<Self>) {
        let token = {
            let mut slot = self.reconnect.lock();
            if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
                return;
            }
            let token = self.session.lock().child_token();
            *slot = Some(token.clone());
            token
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.wiederverbindungs_schleife(&token).await;
            token.cancel();
        });
    }

    async fn wiederverbindungs_schleife(self: &Arc<Self>, token: &CancellationToken) {
        let Some(channel_id) = self.channel() else {
            self.zustand_setzen(ConnectionState::Disconnected);
            return;
        };
        let policy = self.settings.reconnect.clone();

        for attempt in 1..=policy.max_attempts {
            if token.is_cancelled() {
                return;
            }
            let delay = policy.delay_for(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            self.zustand_setzen(ConnectionState::Reconnecting { attempt, delay_ms });
            tracing::info!(channel = %channel_id, attempt, delay_ms, "Wiederverbindung geplant");

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(metrics) = &self.metrics {
                metrics.reconnect_attempts_total.inc();
            }

            let versuch = async {
                self.herstellen(channel_id).await?;
                self.anmelden().await
            };
            let ergebnis = tokio::select! {
                _ = token.cancelled() => return,
                ergebnis = versuch => ergebnis,
            };

            match ergebnis {
                Ok(()) => {
                    self.zustand_setzen(ConnectionState::Syncing);
                    match self.synchronisieren().await {
                        Ok(()) => {
                            // Slot freigeben, bevor `Live` sichtbar wird
                            token.cancel();
                            if self.zustand_wechseln(
                                |s| *s == ConnectionState::Syncing,
                                ConnectionState::Live,
                            ) {
                                tracing::info!(channel = %channel_id, attempt, "Wiederverbunden");
                                if self.outbound().is_none() {
                                    self.wiederverbindung_starten();
                                }
                            }
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(channel = %channel_id, attempt, fehler = %e, "Synchronisation nach Wiederverbindung fehlgeschlagen");
                            self.link_schliessen();
                        }
                    }
                }
                Err(e) if e.ist_endgueltig() => {
                    tracing::warn!(channel = %channel_id, fehler = %e, "Wiederverbindung abgebrochen");
                    self.link_schliessen();
                    self.zustand_setzen(ConnectionState::Disconnected);
                    return;
                }
                Err(e) => {
                    tracing::debug!(channel = %channel_id, attempt, fehler = %e, "Wiederverbindungs-Versuch fehlgeschlagen");
                    self.link_schliessen();
                }
            }
        }

        if token.is_cancelled() {
            return;
        }
        let fehler = ClientError::MaxReconnectAttemptsExceeded {
            attempts: policy.max_attempts,
        };
        tracing::error!(channel = %channel_id, "{fehler}");
        self.zustand_setzen(ConnectionState::Disconnected);
        self.emit(ChannelEvent::ReconnectFailed {
            attempts: policy.max_attempts,
        });
    }
}

/// Liest Frames eines Links bis zum Abbruch
///
/// Haelt nur eine schwache Referenz, damit ein fallengelassener
/// `ChannelConnection` nicht am Leben bleibt.
async fn lese_schleife(
    inner: Weak<Inner>,
    mut inbound: mpsc::Receiver<InboundFrame>,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = inbound.recv() => frame,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match frame {
            Some(frame) => inner.verarbeiten(frame, generation).await,
            None => {
                inner.link_verloren(generation, "Verbindung vom Server geschlossen");
                return;
            }
        }
    }
}
