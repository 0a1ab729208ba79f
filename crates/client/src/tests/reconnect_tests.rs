//! Unit-Tests fuer Wiederverbindung mit exponentiellem Backoff

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sealchat_core::ChannelId;
use sealchat_crypto::MemoryDirectory;
use sealchat_observability::ClientMetrics;
use sealchat_protocol::{ChannelFrame, ProtocolVariant};

use super::support::{einstellungen, warten_auf, zustaende_bis, MockServer, Teilnehmer};
use crate::connection::ChannelConnection;
use crate::event::ChannelEvent;
use crate::state::ConnectionState;

async fn live(server: &Arc<MockServer>, teilnehmer: &Teilnehmer) -> ChannelConnection {
    let connection = teilnehmer.verbindung(server);
    connection
        .open(ChannelId::new())
        .await
        .expect("open fehlgeschlagen");
    connection
}

fn verzoegerungen(zustaende: &[ConnectionState]) -> Vec<(u32, u64)> {
    zustaende
        .iter()
        .filter_map(|s| match s {
            ConnectionState::Reconnecting { attempt, delay_ms } => Some((*attempt, *delay_ms)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_backoff_folge_bis_disconnected() {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Teilnehmer::neu(&directory).await;
    let server = MockServer::neu();
    let metrics = ClientMetrics::neu().expect("Metriken anlegen fehlgeschlagen");
    let connection = ChannelConnection::builder(
        alice.identity.clone(),
        alice.keys.clone(),
        server.connector(),
    )
    .settings(einstellungen(&[("mock://chat/{channel}", ProtocolVariant::V2)]))
    .metrics(metrics.clone())
    .build();
    connection
        .open(ChannelId::new())
        .await
        .expect("open fehlgeschlagen");
    let mut events = connection.subscribe();

    server.offline.store(true, Ordering::SeqCst);
    let start = tokio::time::Instant::now();
    server.links_trennen();

    let zustaende = zustaende_bis(&mut events, ConnectionState::Disconnected).await;
    assert_eq!(
        verzoegerungen(&zustaende),
        vec![(1, 1_000), (2, 2_000), (3, 4_000), (4, 8_000), (5, 16_000)]
    );
    let event = warten_auf(&mut events, |e| matches!(e, ChannelEvent::ReconnectFailed { .. })).await;
    assert!(matches!(event, ChannelEvent::ReconnectFailed { attempts: 5 }));

    assert!(start.elapsed() >= Duration::from_millis(31_000));
    assert_eq!(server.connects(), 1 + 5);
    assert_eq!(metrics.reconnect_attempts_total.get(), 5);
    assert_eq!(metrics.connections_live.get(), 0);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_wiederverbindung_synchronisiert_und_wird_live() {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Teilnehmer::neu(&directory).await;
    let server = MockServer::neu();
    let connection = live(&server, &alice).await;
    let mut events = connection.subscribe();

    server.links_trennen();

    let zustaende = zustaende_bis(&mut events, ConnectionState::Live).await;
    assert_eq!(
        zustaende,
        vec![
            ConnectionState::Reconnecting {
                attempt: 1,
                delay_ms: 1_000
            },
            ConnectionState::Syncing,
            ConnectionState::Live,
        ]
    );
    assert_eq!(server.connects(), 2);
    assert_eq!(server.empfangen("get_history").len(), 2);
    assert_eq!(server.empfangen("auth").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_erneuter_abbruch_nach_wiederverbindung() {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Teilnehmer::neu(&directory).await;
    let server = MockServer::neu();
    let connection = live(&server, &alice).await;
    let mut events = connection.subscribe();

    server.links_trennen();
    zustaende_bis(&mut events, ConnectionState::Live).await;
    assert_eq!(server.connects(), 2);

    // Der zweite Abbruch startet wieder bei Versuch 1
    server.links_trennen();
    let zustaende = zustaende_bis(&mut events, ConnectionState::Live).await;
    assert_eq!(verzoegerungen(&zustaende), vec![(1, 1_000)]);
    assert_eq!(server.connects(), 3);
    assert_eq!(connection.state(), ConnectionState::Live);
}

#[tokio::test(start_paused = true)]
async fn test_wiederverbindung_nach_zwei_fehlversuchen() {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Teilnehmer::neu(&directory).await;
    let server = MockServer::neu();
    let connection = live(&server, &alice).await;
    let mut events = connection.subscribe();

    server.offline.store(true, Ordering::SeqCst);
    server.links_trennen();

    // Nach dem zweiten Fehlversuch wieder erreichbar
    let server_clone = server.clone();
    warten_auf(&mut events, move |e| {
        let dritter = matches!(
            e,
            ChannelEvent::StateChanged(ConnectionState::Reconnecting { attempt: 3, .. })
        );
        if dritter {
            server_clone.offline.store(false, Ordering::SeqCst);
        }
        dritter
    })
    .await;

    zustaende_bis(&mut events, ConnectionState::Live).await;
    assert_eq!(server.connects(), 1 + 3);
    assert_eq!(connection.state(), ConnectionState::Live);
}

#[tokio::test(start_paused = true)]
async fn test_fataler_server_fehler_loest_wiederverbindung_aus() {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Teilnehmer::neu(&directory).await;
    let server = MockServer::neu();
    let connection = live(&server, &alice).await;
    let mut events = connection.subscribe();

    server
        .push(ChannelFrame::Error {
            code: Some("shutdown".into()),
            message: "Server wird neu gestartet".into(),
            fatal: true,
        })
        .await;

    let event = warten_auf(&mut events, |e| matches!(e, ChannelEvent::ServerError { .. })).await;
    assert!(matches!(event, ChannelEvent::ServerError { fatal: true, .. }));
    let zustaende = zustaende_bis(&mut events, ConnectionState::Live).await;
    assert!(matches!(
        zustaende.first(),
        Some(ConnectionState::Reconnecting { attempt: 1, .. })
    ));
    assert_eq!(server.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stoppt_wiederverbindung() {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Teilnehmer::neu(&directory).await;
    let server = MockServer::neu();
    let connection = live(&server, &alice).await;
    let mut events = connection.subscribe();

    server.offline.store(true, Ordering::SeqCst);
    server.links_trennen();
    warten_auf(&mut events, |e| {
        matches!(
            e,
            ChannelEvent::StateChanged(ConnectionState::Reconnecting { attempt: 1, .. })
        )
    })
    .await;

    connection.disconnect();
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(server.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_ablehnung_beendet_wiederverbindung() {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Teilnehmer::neu(&directory).await;
    let server = MockServer::neu();
    let connection = live(&server, &alice).await;
    let mut events = connection.subscribe();

    *server.auth_ablehnung.lock() = Some("Gesperrt".into());
    server.links_trennen();

    let zustaende = zustaende_bis(&mut events, ConnectionState::Disconnected).await;
    assert_eq!(verzoegerungen(&zustaende), vec![(1, 1_000)]);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.connects(), 2);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_open_nach_disconnect_startet_neu() {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Teilnehmer::neu(&directory).await;
    let server = MockServer::neu();
    let connection = live(&server, &alice).await;
    let channel_id = connection.channel_id().expect("Kein Channel gebunden");

    connection.disconnect();
    connection
        .open(channel_id)
        .await
        .expect("Erneutes open fehlgeschlagen");

    assert_eq!(connection.state(), ConnectionState::Live);
    assert_eq!(server.connects(), 2);
}
