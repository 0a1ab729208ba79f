//! Channel-Protokoll (JSON-Frames)
//!
//! Definiert alle Frames die zwischen Client und Channel-Server
//! ausgetauscht werden.
//!
//! ## Design
//! - Tagged Enum: `{"type": "...", ...}`, Felder in camelCase
//! - Nachrichten-Inhalte sind immer verschluesselt (Base64-Ciphertext)
//! - Legacy-Varianten werden nicht hier, sondern in `negotiation` uebersetzt

use serde::{Deserialize, Serialize};
use sealchat_core::{ChannelId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Nachrichten
// ---------------------------------------------------------------------------

/// Art des verschluesselten Inhalts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    #[serde(alias = "Text", alias = "TEXT")]
    Text,
    #[serde(alias = "Image", alias = "IMAGE")]
    Image,
    #[serde(alias = "Video", alias = "VIDEO")]
    Video,
    #[serde(alias = "Audio", alias = "AUDIO")]
    Audio,
}

/// Eine verschluesselte Nachricht auf dem Draht
///
/// Unveraenderlich nach der Erstellung. Der Server sieht nur Metadaten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub sender_id: UserId,
    /// Base64-Ciphertext inkl. Auth-Tag
    pub ciphertext: String,
    /// Base64-Nonce (12 Bytes)
    pub nonce: String,
    #[serde(default)]
    pub message_type: MessageType,
    /// Version des Gruppen-Schluessels mit dem verschluesselt wurde
    #[serde(default = "erste_version")]
    pub key_version: u32,
    /// Unix-Zeitstempel in Millisekunden
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u32>,
}

fn erste_version() -> u32 {
    1
}

fn ist_vollstaendig() -> bool {
    true
}

/// Eingewickelter Gruppen-Schluessel fuer ein Mitglied (in `key_rotation`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyEntry {
    pub member_id: UserId,
    /// Base64 oder `0x`-Hex
    pub encrypted_group_key: String,
}

// ---------------------------------------------------------------------------
// ChannelFrame
// ---------------------------------------------------------------------------

/// Alle Frames des Channel-Protokolls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelFrame {
    // --- Handshake ---
    #[serde(rename_all = "camelCase")]
    Hello {
        protocol_version: u16,
        channel_id: ChannelId,
        client_version: String,
    },
    #[serde(rename_all = "camelCase")]
    HelloAck {
        #[serde(default)]
        protocol_version: Option<u16>,
    },

    // --- Authentifizierung ---
    #[serde(rename_all = "camelCase")]
    Auth {
        user_id: UserId,
        /// Base64-X25519-Schluessel
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        #[serde(default)]
        user_id: Option<UserId>,
    },
    AuthFailure {
        #[serde(default)]
        reason: String,
    },

    // --- Verlauf ---
    #[serde(rename_all = "camelCase")]
    GetHistory {
        channel_id: ChannelId,
        limit: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<i64>,
    },
    /// Ein Verlaufs-Abschnitt; `complete == false` kuendigt weitere an
    #[serde(rename_all = "camelCase")]
    History {
        channel_id: ChannelId,
        #[serde(default)]
        messages: Vec<MessageFrame>,
        #[serde(default = "ist_vollstaendig")]
        complete: bool,
    },

    // --- Live-Nachrichten ---
    NewMessage(MessageFrame),

    // --- Schluessel ---
    /// Client -> Server: neue Version mit eingewickelten Schluesseln
    #[serde(rename_all = "camelCase")]
    KeyRotation {
        channel_id: ChannelId,
        key_version: u32,
        wrapped_keys: Vec<WrappedKeyEntry>,
    },
    /// Server -> Client: Channel hat eine neue Schluessel-Version
    #[serde(rename_all = "camelCase")]
    KeyRotated {
        channel_id: ChannelId,
        key_version: u32,
    },
    /// Anfrage (ohne Schluessel) oder Lieferung des eigenen eingewickelten Schluessels
    #[serde(rename_all = "camelCase")]
    KeyInfo {
        channel_id: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_version: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_group_key: Option<String>,
    },

    // --- Sonstiges ---
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
        /// Fatale Fehler fuehren zum Wiederverbinden
        #[serde(default)]
        fatal: bool,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}

impl ChannelFrame {
    /// Wire-Name des Frame-Typs (fuer Logs und Adapter)
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::HelloAck { .. } => "hello_ack",
            Self::Auth { .. } => "auth",
            Self::AuthSuccess { .. } => "auth_success",
            Self::AuthFailure { .. } => "auth_failure",
            Self::GetHistory { .. } => "get_history",
            Self::History { .. } => "history",
            Self::NewMessage(_) => "new_message",
            Self::KeyRotation { .. } => "key_rotation",
            Self::KeyRotated { .. } => "key_rotated",
            Self::KeyInfo { .. } => "key_info",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn beispiel_nachricht() -> MessageFrame {
        MessageFrame {
            id: MessageId::new(),
            channel_id: ChannelId::new(),
            sender_id: UserId::new(),
            ciphertext: "AAAA".into(),
            nonce: "BBBB".into(),
            message_type: MessageType::Image,
            key_version: 2,
            timestamp: 1_700_000_000_000,
            ephemeral: None,
            ttl_seconds: Some(60),
        }
    }

    #[test]
    fn new_message_ist_flach_und_camel_case() {
        let msg = beispiel_nachricht();
        let value = serde_json::to_value(ChannelFrame::NewMessage(msg.clone())).unwrap();

        assert_eq!(value["type"], "new_message");
        assert_eq!(value["channelId"], msg.channel_id.to_string());
        assert_eq!(value["senderId"], msg.sender_id.to_string());
        assert_eq!(value["messageType"], "image");
        assert_eq!(value["keyVersion"], 2);
        assert_eq!(value["ttlSeconds"], 60);
        assert!(value.get("ephemeral").is_none());

        let back: ChannelFrame = serde_json::from_value(value).unwrap();
        assert_eq!(back, ChannelFrame::NewMessage(msg));
    }

    #[test]
    fn message_type_akzeptiert_grossschreibung() {
        let t: MessageType = serde_json::from_value(json!("VIDEO")).unwrap();
        assert_eq!(t, MessageType::Video);
        let t: MessageType = serde_json::from_value(json!("Audio")).unwrap();
        assert_eq!(t, MessageType::Audio);
    }

    #[test]
    fn fehlende_key_version_ist_eins() {
        let msg = beispiel_nachricht();
        let mut value = serde_json::to_value(&msg).unwrap();
        value.as_object_mut().unwrap().remove("keyVersion");
        value.as_object_mut().unwrap().remove("messageType");

        let back: MessageFrame = serde_json::from_value(value).unwrap();
        assert_eq!(back.key_version, 1);
        assert_eq!(back.message_type, MessageType::Text);
    }

    #[test]
    fn history_ohne_complete_ist_vollstaendig() {
        let channel = ChannelId::new();
        let frame: ChannelFrame = serde_json::from_value(json!({
            "type": "history",
            "channelId": channel.to_string(),
            "messages": [],
        }))
        .unwrap();
        assert_eq!(
            frame,
            ChannelFrame::History {
                channel_id: channel,
                messages: vec![],
                complete: true
            }
        );
    }

    #[test]
    fn get_history_ohne_before() {
        let frame = ChannelFrame::GetHistory {
            channel_id: ChannelId::new(),
            limit: 50,
            before: None,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "get_history");
        assert_eq!(value["limit"], 50);
        assert!(value.get("before").is_none());
    }

    #[test]
    fn error_frame_standardmaessig_nicht_fatal() {
        let frame = ChannelFrame::from_json(r#"{"type":"error","message":"kaputt"}"#).unwrap();
        assert_eq!(
            frame,
            ChannelFrame::Error {
                code: None,
                message: "kaputt".into(),
                fatal: false
            }
        );
    }

    #[test]
    fn type_name_passt_zum_tag() {
        let frames = [
            ChannelFrame::Ping { timestamp: 1 },
            ChannelFrame::HelloAck { protocol_version: Some(2) },
            ChannelFrame::KeyRotated { channel_id: ChannelId::new(), key_version: 3 },
            ChannelFrame::AuthFailure { reason: "nein".into() },
            ChannelFrame::NewMessage(beispiel_nachricht()),
        ];
        for frame in frames {
            let value = serde_json::to_value(&frame).unwrap();
            assert_eq!(value["type"], frame.type_name());
        }
    }

    #[test]
    fn unbekannter_typ_ist_fehler() {
        assert!(ChannelFrame::from_json(r#"{"type":"voice_init"}"#).is_err());
    }
}
