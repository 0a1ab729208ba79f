//! Klartext-Nutzdaten und Cache-Eintraege

use serde::{Deserialize, Serialize};
use sealchat_protocol::MessageFrame;

use crate::error::{ClientError, ClientResult};

/// Verweis auf ein Medien-Objekt (Bild, Video, Audio)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaReference {
    pub url: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Klartext einer Nachricht vor der Verschluesselung
///
/// Wird als JSON serialisiert und dann mit dem Gruppen-Schluessel versiegelt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaReference>,
}

impl MessageEnvelope {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: MediaReference) -> Self {
        self.media.push(media);
        self
    }

    pub fn to_bytes(&self) -> ClientResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ClientError::SendFailure(format!("Klartext nicht serialisierbar: {e}")))
    }

    /// Entschluesselte Bytes als Envelope; reiner UTF-8-Text wird toleriert
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        match serde_json::from_slice(bytes) {
            Ok(envelope) => Ok(envelope),
            Err(json_fehler) => std::str::from_utf8(bytes)
                .map(Self::text)
                .map_err(|_| format!("Klartext unlesbar: {json_fehler}")),
        }
    }
}

/// Entschluesselter oder nicht lesbarer Inhalt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Decrypted(MessageEnvelope),
    /// Platzhalter mit Grund; wird nach Schluessel-Empfang erneut versucht
    Unreadable(String),
}

impl MessageContent {
    pub fn ist_lesbar(&self) -> bool {
        matches!(self, Self::Decrypted(_))
    }

    pub fn envelope(&self) -> Option<&MessageEnvelope> {
        match self {
            Self::Decrypted(envelope) => Some(envelope),
            Self::Unreadable(_) => None,
        }
    }
}

/// Zustellstatus aus Sicht des Senders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Lokal eingefuegt, Server-Echo steht aus
    Pending,
    /// Vom Server bestaetigt (Echo oder Verlauf)
    Confirmed,
    /// Uebertragung fehlgeschlagen
    Failed,
}

/// Eintrag im `MessageCache`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub message: MessageFrame,
    pub content: MessageContent,
    pub status: DeliveryStatus,
}

impl CachedMessage {
    pub fn timestamp(&self) -> i64 {
        self.message.timestamp
    }
}
