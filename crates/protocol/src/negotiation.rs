//! Versions-Aushandlung und Legacy-Adapter
//!
//! Der Client probiert eine geordnete Liste von Endpunkten. Jeder Endpunkt
//! spricht eine Protokoll-Variante; aeltere Server erwarten andere
//! Frame-Namen und (V0) verschachtelte Nutzdaten unter `data`.
//!
//! Der Adapter uebersetzt ausschliesslich JSON. Die Zustandsmaschine sieht
//! immer nur `ChannelFrame`s der aktuellen Version.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sealchat_core::{ChannelId, SealchatError};

use crate::frame::ChannelFrame;

/// Platzhalter fuer die Channel-ID in Endpunkt-Vorlagen
pub const CHANNEL_PLATZHALTER: &str = "{channel}";

/// Protokoll-Variante eines Endpunkts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVariant {
    /// Aktuelles Protokoll (Version 2)
    #[default]
    V2,
    /// `send_message` statt `new_message`
    LegacyV1,
    /// `chat_message`, Felder unter `data`
    LegacyV0,
}

impl ProtocolVariant {
    pub fn protocol_version(self) -> u16 {
        match self {
            Self::V2 => 2,
            Self::LegacyV1 => 1,
            Self::LegacyV0 => 0,
        }
    }

    pub fn from_version(version: u16) -> Option<Self> {
        match version {
            2 => Some(Self::V2),
            1 => Some(Self::LegacyV1),
            0 => Some(Self::LegacyV0),
            _ => None,
        }
    }

    /// Wire-Name fuer ausgehende Nachrichten
    fn outbound_message_type(self) -> &'static str {
        match self {
            Self::V2 => "new_message",
            Self::LegacyV1 => "send_message",
            Self::LegacyV0 => "chat_message",
        }
    }
}

impl std::fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V2 => write!(f, "v2"),
            Self::LegacyV1 => write!(f, "legacy-v1"),
            Self::LegacyV0 => write!(f, "legacy-v0"),
        }
    }
}

/// Konfigurierte Endpunkt-Vorlage, z.B. `wss://chat.example/ws/{channel}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTemplate {
    pub url: String,
    #[serde(default)]
    pub variant: ProtocolVariant,
}

impl EndpointTemplate {
    pub fn new(url: impl Into<String>, variant: ProtocolVariant) -> Self {
        Self {
            url: url.into(),
            variant,
        }
    }

    /// Setzt die Channel-ID ein und prueft das URL-Schema
    pub fn resolve(&self, channel_id: ChannelId) -> Result<Endpoint, SealchatError> {
        let url = self
            .url
            .replace(CHANNEL_PLATZHALTER, &channel_id.to_string());
        if !url.contains("://") {
            return Err(SealchatError::UngueltigerEndpunkt(url));
        }
        Ok(Endpoint {
            url,
            variant: self.variant,
        })
    }
}

/// Aufgeloester Endpunkt fuer genau einen Channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub variant: ProtocolVariant,
}

impl Endpoint {
    /// URL-Schema in Kleinbuchstaben (`ws`, `wss`, `tcp`, ...)
    pub fn scheme(&self) -> String {
        self.url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// Geordnete Kandidaten-Liste fuer einen Channel
///
/// Ungueltige Vorlagen werden mit Warnung uebersprungen.
pub fn candidates(templates: &[EndpointTemplate], channel_id: ChannelId) -> Vec<Endpoint> {
    templates
        .iter()
        .filter_map(|template| match template.resolve(channel_id) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                tracing::warn!(template = %template.url, fehler = %e, "Endpunkt-Vorlage ignoriert");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Uebersetzt einen Frame in das JSON der Variante
pub fn outbound(frame: &ChannelFrame, variant: ProtocolVariant) -> Result<Value, SealchatError> {
    let mut value = serde_json::to_value(frame)?;
    if variant == ProtocolVariant::V2 {
        return Ok(value);
    }

    if let Value::Object(object) = &mut value {
        if matches!(frame, ChannelFrame::NewMessage(_)) {
            object.insert(
                "type".into(),
                Value::String(variant.outbound_message_type().into()),
            );
        }

        if variant == ProtocolVariant::LegacyV0 {
            let typ = object.remove("type").unwrap_or(Value::Null);
            let data = std::mem::take(object);
            object.insert("type".into(), typ);
            object.insert("data".into(), Value::Object(data));
        }
    }

    Ok(value)
}

/// Normalisiert eingehendes JSON aller Varianten und typisiert es
///
/// Aliase: `message`/`send_message`/`chat_message` -> `new_message`,
/// `key_rotation` -> `key_rotated`, `connected` -> `hello_ack`.
/// Ein Objekt unter `data` wird in die oberste Ebene gehoben.
pub fn inbound(value: Value) -> Result<ChannelFrame, SealchatError> {
    let Value::Object(mut object) = value else {
        return Err(SealchatError::UngueltigeNachricht(
            "Frame ist kein JSON-Objekt".into(),
        ));
    };

    if let Some(Value::Object(data)) = object.remove("data") {
        for (key, value) in data {
            if key != "type" {
                object.entry(key).or_insert(value);
            }
        }
    }

    let typ = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SealchatError::UngueltigeNachricht("Frame ohne 'type'".into()))?;
    let normalisiert = match typ {
        "message" | "send_message" | "chat_message" => Some("new_message"),
        "key_rotation" => Some("key_rotated"),
        "connected" => Some("hello_ack"),
        _ => None,
    };
    if let Some(neu) = normalisiert {
        tracing::trace!(alias = typ, typ = neu, "Legacy-Frame uebersetzt");
        object.insert("type".into(), Value::String(neu.into()));
    }

    serde_json::from_value(Value::Object(object))
        .map_err(|e| SealchatError::UngueltigeNachricht(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
