//! Ende-zu-Ende-Szenarien: A und B teilen einen Channel, C nicht

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sealchat_core::ChannelId;
use sealchat_crypto::{
    decode_parts, CryptoError, MemoryDirectory, PublicKeyDirectory, WrappedKeyRecord,
};
use sealchat_protocol::{ChannelFrame, MessageFrame, MessageType};

use super::support::{warten_auf, warten_bis, MockServer, Teilnehmer};
use crate::connection::ChannelConnection;
use crate::error::ClientError;
use crate::event::ChannelEvent;
use crate::types::{MessageContent, MessageEnvelope};

/// Schluessel-Frame, wie ihn der Server fuer `empfaenger` ausliefert
fn key_info(
    absender: &Teilnehmer,
    empfaenger: &Teilnehmer,
    channel_id: ChannelId,
) -> ChannelFrame {
    let record = absender
        .keys
        .wrap_for_member(channel_id, empfaenger.user_id(), &empfaenger.public_key)
        .expect("Einwickeln fehlgeschlagen");
    ChannelFrame::KeyInfo {
        channel_id,
        key_version: Some(record.key_version),
        encrypted_group_key: Some(record.encrypted_group_key),
    }
}

fn entschluesseln(teilnehmer: &Teilnehmer, frame: &MessageFrame) -> Result<String, CryptoError> {
    let key = teilnehmer.keys.key(frame.channel_id, frame.key_version)?;
    let nonce = BASE64.decode(&frame.nonce)?;
    let ciphertext = BASE64.decode(&frame.ciphertext)?;
    let bytes = decode_parts(&nonce, &ciphertext, &key)?;
    Ok(MessageEnvelope::from_bytes(&bytes)
        .expect("Klartext ungueltig")
        .text)
}

async fn live(
    server: &Arc<MockServer>,
    teilnehmer: &Teilnehmer,
    channel_id: ChannelId,
) -> ChannelConnection {
    let connection = teilnehmer.verbindung(server);
    connection
        .open(channel_id)
        .await
        .expect("open fehlgeschlagen");
    connection
}

#[tokio::test]
async fn test_a_und_b_lesen_c_nicht() {
    let directory = Arc::new(MemoryDirectory::new());
    let a = Teilnehmer::neu(&directory).await;
    let b = Teilnehmer::neu(&directory).await;
    let c = Teilnehmer::neu(&directory).await;
    let channel_id = ChannelId::new();
    a.keys.create_channel(channel_id);

    // A schlaegt B im Verzeichnis nach und wickelt den Schluessel ein
    let b_public = directory
        .lookup_public_key(b.user_id())
        .await
        .expect("B nicht im Verzeichnis");
    assert_eq!(b_public, b.public_key);
    let fuer_b = a
        .keys
        .wrap_for_member(channel_id, b.user_id(), &b_public)
        .expect("Einwickeln fehlgeschlagen");

    let b_privat = b.identity.load().await.expect("B ohne Identitaet");
    b.keys
        .accept_wrapped(&fuer_b, &b_privat)
        .expect("B kann den Schluessel nicht auswickeln");

    let frame = a.nachricht(channel_id, 1, "nur fuer A und B");
    assert_eq!(
        entschluesseln(&b, &frame).expect("B kann nicht lesen"),
        "nur fuer A und B"
    );

    // C faengt den Datensatz fuer B ab
    let c_privat = c.identity.load().await.expect("C ohne Identitaet");
    assert!(matches!(
        c.keys.accept_wrapped(&fuer_b, &c_privat),
        Err(CryptoError::UnwrapFailure(_))
    ));
    assert!(c.keys.current_version(channel_id).is_none());
    assert!(matches!(
        entschluesseln(&c, &frame),
        Err(CryptoError::KeinGruppenSchluessel { .. })
    ));
}

#[tokio::test]
async fn test_nachricht_von_a_ueber_den_server_bei_b() {
    let directory = Arc::new(MemoryDirectory::new());
    let a = Teilnehmer::neu(&directory).await;
    let b = Teilnehmer::neu(&directory).await;
    let channel_id = ChannelId::new();
    a.keys.create_channel(channel_id);

    let server_a = MockServer::neu();
    let server_b = MockServer::neu();
    let verbindung_a = live(&server_a, &a, channel_id).await;
    let verbindung_b = live(&server_b, &b, channel_id).await;
    let mut events_b = verbindung_b.subscribe();

    verbindung_b
        .request_key_info()
        .await
        .expect("key_info-Anfrage fehlgeschlagen");
    warten_bis(|| !server_b.empfangen("key_info").is_empty()).await;
    server_b.push(key_info(&a, &b, channel_id)).await;
    let event = warten_auf(&mut events_b, |e| matches!(e, ChannelEvent::KeyInstalled { .. })).await;
    assert!(matches!(event, ChannelEvent::KeyInstalled { key_version: 1, .. }));
    assert_eq!(verbindung_b.key_version(), Some(1));

    let id = verbindung_a
        .send(MessageEnvelope::text("Hallo B"), MessageType::Text)
        .await
        .expect("Senden fehlgeschlagen");
    warten_bis(|| server_a.gesendete_nachrichten().iter().any(|m| m.id == id)).await;
    let frame = server_a
        .gesendete_nachrichten()
        .into_iter()
        .find(|m| m.id == id)
        .expect("Nachricht nicht beim Server");
    server_b.push(ChannelFrame::NewMessage(frame)).await;

    let event = warten_auf(&mut events_b, |e| matches!(e, ChannelEvent::MessageReceived(_))).await;
    match event {
        ChannelEvent::MessageReceived(eintrag) => {
            assert_eq!(eintrag.message.sender_id, a.user_id());
            assert_eq!(
                eintrag.content,
                MessageContent::Decrypted(MessageEnvelope::text("Hallo B"))
            );
        }
        andere => panic!("Unerwartetes Ereignis {andere:?}"),
    }
}

#[tokio::test]
async fn test_spaeter_schluessel_entschluesselt_platzhalter() {
    let directory = Arc::new(MemoryDirectory::new());
    let a = Teilnehmer::neu(&directory).await;
    let b = Teilnehmer::neu(&directory).await;
    let channel_id = ChannelId::new();
    a.keys.create_channel(channel_id);

    let server_b = MockServer::neu();
    let verbindung_b = live(&server_b, &b, channel_id).await;
    let mut events_b = verbindung_b.subscribe();

    let frame = a.nachricht(channel_id, 10, "vor dem Schluessel");
    server_b.push(ChannelFrame::NewMessage(frame.clone())).await;
    warten_auf(&mut events_b, |e| matches!(e, ChannelEvent::MessageReceived(_))).await;
    let platzhalter = verbindung_b.cache().get(&frame.id).expect("Eintrag fehlt");
    assert!(matches!(platzhalter.content, MessageContent::Unreadable(_)));

    server_b.push(key_info(&a, &b, channel_id)).await;

    let event = warten_auf(&mut events_b, |e| matches!(e, ChannelEvent::MessageUpdated(_))).await;
    match event {
        ChannelEvent::MessageUpdated(eintrag) => {
            assert_eq!(eintrag.message.id, frame.id);
            assert_eq!(
                eintrag.content.envelope().map(|e| e.text.as_str()),
                Some("vor dem Schluessel")
            );
        }
        andere => panic!("Unerwartetes Ereignis {andere:?}"),
    }
    assert!(verbindung_b.cache().unreadable().is_empty());
}

#[tokio::test]
async fn test_rotation_schliesst_entferntes_mitglied_aus() {
    let directory = Arc::new(MemoryDirectory::new());
    let a = Teilnehmer::neu(&directory).await;
    let b = Teilnehmer::neu(&directory).await;
    let c = Teilnehmer::neu(&directory).await;
    let channel_id = ChannelId::new();
    a.keys.create_channel(channel_id);

    let server_a = MockServer::neu();
    let verbindung_a = live(&server_a, &a, channel_id).await;
    let mut events_a = verbindung_a.subscribe();

    // C verlaesst den Channel, es bleiben A und B
    let version = verbindung_a
        .rotate_key(&[(a.user_id(), a.public_key), (b.user_id(), b.public_key)])
        .await
        .expect("Rotation fehlgeschlagen");
    assert_eq!(version, 2);
    assert_eq!(verbindung_a.key_version(), Some(2));
    let event = warten_auf(&mut events_a, |e| matches!(e, ChannelEvent::KeyRotated { .. })).await;
    assert!(matches!(event, ChannelEvent::KeyRotated { key_version: 2, .. }));

    warten_bis(|| !server_a.empfangen("key_rotation").is_empty()).await;
    let eintraege = match server_a.empfangen("key_rotation").pop() {
        Some(ChannelFrame::KeyRotation {
            key_version,
            wrapped_keys,
            ..
        }) => {
            assert_eq!(key_version, 2);
            wrapped_keys
        }
        andere => panic!("Erwartet key_rotation, erhalten {andere:?}"),
    };
    assert_eq!(eintraege.len(), 2);

    let id = verbindung_a
        .send(MessageEnvelope::text("nach der Rotation"), MessageType::Text)
        .await
        .expect("Senden fehlgeschlagen");
    warten_bis(|| server_a.gesendete_nachrichten().iter().any(|m| m.id == id)).await;
    let frame = server_a
        .gesendete_nachrichten()
        .into_iter()
        .find(|m| m.id == id)
        .expect("Nachricht nicht beim Server");
    assert_eq!(frame.key_version, 2);

    // B installiert seinen Eintrag und liest
    let eintrag_b = eintraege
        .iter()
        .find(|e| e.member_id == b.user_id())
        .expect("Kein Eintrag fuer B");
    let record = WrappedKeyRecord {
        scope_id: channel_id,
        member_id: b.user_id(),
        encrypted_group_key: eintrag_b.encrypted_group_key.clone(),
        key_version: 2,
        algorithm: None,
    };
    let b_privat = b.identity.load().await.expect("B ohne Identitaet");
    b.keys
        .accept_wrapped(&record, &b_privat)
        .expect("B kann v2 nicht auswickeln");
    assert_eq!(
        entschluesseln(&b, &frame).expect("B kann nicht lesen"),
        "nach der Rotation"
    );

    // C kann keinen der Eintraege auswickeln
    let c_privat = c.identity.load().await.expect("C ohne Identitaet");
    for eintrag in &eintraege {
        let record = WrappedKeyRecord {
            scope_id: channel_id,
            member_id: c.user_id(),
            encrypted_group_key: eintrag.encrypted_group_key.clone(),
            key_version: 2,
            algorithm: None,
        };
        assert!(matches!(
            c.keys.accept_wrapped(&record, &c_privat),
            Err(CryptoError::UnwrapFailure(_))
        ));
    }
}

#[tokio::test]
async fn test_angekuendigte_rotation_fordert_schluessel_an() {
    let directory = Arc::new(MemoryDirectory::new());
    let a = Teilnehmer::neu(&directory).await;
    let b = Teilnehmer::neu(&directory).await;
    let channel_id = ChannelId::new();
    a.keys.create_channel(channel_id);
    let b_privat = b.identity.load().await.expect("B ohne Identitaet");
    let fuer_b = a
        .keys
        .wrap_for_member(channel_id, b.user_id(), &b.public_key)
        .expect("Einwickeln fehlgeschlagen");
    b.keys
        .accept_wrapped(&fuer_b, &b_privat)
        .expect("Auswickeln fehlgeschlagen");

    let server_b = MockServer::neu();
    let verbindung_b = live(&server_b, &b, channel_id).await;
    let mut events_b = verbindung_b.subscribe();

    a.keys
        .rotate(channel_id, &[(a.user_id(), a.public_key), (b.user_id(), b.public_key)])
        .expect("Rotation fehlgeschlagen");
    server_b
        .push(ChannelFrame::KeyRotated {
            channel_id,
            key_version: 2,
        })
        .await;
    warten_auf(&mut events_b, |e| matches!(e, ChannelEvent::KeyRotated { key_version: 2, .. })).await;
    warten_bis(|| !server_b.empfangen("key_info").is_empty()).await;
    assert_eq!(
        server_b.empfangen("key_info"),
        vec![ChannelFrame::KeyInfo {
            channel_id,
            key_version: Some(2),
            encrypted_group_key: None,
        }]
    );

    // Ohne v2 wird nicht mit der alten Version gesendet
    let ergebnis = verbindung_b
        .send(MessageEnvelope::text("zu frueh"), MessageType::Text)
        .await;
    assert!(matches!(ergebnis, Err(ClientError::SendFailure(_))));

    server_b.push(key_info(&a, &b, channel_id)).await;
    warten_auf(&mut events_b, |e| matches!(e, ChannelEvent::KeyInstalled { key_version: 2, .. })).await;

    let id = verbindung_b
        .send(MessageEnvelope::text("mit v2"), MessageType::Text)
        .await
        .expect("Senden mit v2 fehlgeschlagen");
    warten_bis(|| server_b.gesendete_nachrichten().iter().any(|m| m.id == id)).await;
    let gesendet = server_b.gesendete_nachrichten();
    assert_eq!(gesendet.last().map(|m| m.key_version), Some(2));
}
