//! Gemeinsame Typen fuer das Kryptografie-Subsystem

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sealchat_core::{ChannelId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};

/// Laenge eines symmetrischen Gruppen-Schluessels (AES-256 / ChaCha20)
pub const KEY_LEN: usize = 32;
/// Laenge einer AEAD-Nonce
pub const NONCE_LEN: usize = 12;
/// Laenge eines X25519-Schluessels
pub const PUBLIC_KEY_LEN: usize = 32;
/// Laenge des AEAD-Auth-Tags
pub const TAG_LEN: usize = 16;

/// Monotoner Zaehler der Schluessel-Epoche eines Channels
pub type KeyVersion = u32;

/// Sicherer Schluessel-Container (wird beim Drop genullt)
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes(Vec<u8>);

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([REDACTED] {} bytes)", self.0.len())
    }
}

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Oeffentlicher X25519-Schluessel (auf dem Draht Base64-kodiert)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Parst einen Schluessel aus einem Byte-Slice beliebiger Herkunft
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let array: [u8; PUBLIC_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::UngueltigeSchluesselLaenge {
                    erwartet: PUBLIC_KEY_LEN,
                    erhalten: bytes.len(),
                })?;
        Ok(Self(array))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = BASE64.decode(encoded)?;
        Self::from_slice(&bytes)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Privater X25519-Schluessel des Geraets (verlaesst das Geraet nie)
///
/// `StaticSecret` wird beim Drop genullt (zeroize-Feature).
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Parst einen privaten Schluessel aus dem sicheren Speicher
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let mut array: [u8; KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::UngueltigeSchluesselLaenge {
                    erwartet: KEY_LEN,
                    erhalten: bytes.len(),
                })?;
        let key = Self::from_bytes(array);
        array.zeroize();
        Ok(key)
    }

    /// Rohe Bytes fuer die Persistenz im sicheren Speicher
    pub fn to_secret_bytes(&self) -> SecretBytes {
        SecretBytes::new(self.0.to_bytes().to_vec())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.0
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// Asymmetrisches Identitaets-Schluesselpaar eines Geraets
#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

/// Algorithmus fuer Gruppen-Schluessel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GroupKeyAlgorithm {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

/// Symmetrischer Gruppen-Schluessel eines Channels in einer Version
#[derive(Debug, Clone)]
pub struct GroupKey {
    /// Channel, zu dem der Schluessel gehoert
    pub channel_id: ChannelId,
    /// Schluessel-Version (monoton steigend, erhoeht bei Rotation)
    pub version: KeyVersion,
    /// Der eigentliche Schluessel (32 Bytes)
    pub key_bytes: SecretBytes,
    /// Algorithmus
    pub algorithm: GroupKeyAlgorithm,
}

/// Kodierung eines binaeren Blobs fuer Speicherung und Draht
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobEncoding {
    Base64,
    /// Hex mit `0x`-Praefix
    Hex,
}

/// Kodiert einen Blob als Base64 oder `0x`-Hex
pub fn encode_blob(bytes: &[u8], encoding: BlobEncoding) -> String {
    match encoding {
        BlobEncoding::Base64 => BASE64.encode(bytes),
        BlobEncoding::Hex => format!("0x{}", hex::encode(bytes)),
    }
}

/// Dekodiert einen Blob; `0x`-Praefix bedeutet Hex, sonst Base64.
///
/// Jede fehlerhafte Kodierung ist ein `UnwrapFailure`.
pub fn decode_blob(encoded: &str) -> CryptoResult<Vec<u8>> {
    let trimmed = encoded.trim();
    if let Some(hex_part) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return hex::decode(hex_part)
            .map_err(|e| CryptoError::UnwrapFailure(format!("Ungueltiges Hex: {e}")));
    }
    BASE64
        .decode(trimmed)
        .map_err(|e| CryptoError::UnwrapFailure(format!("Ungueltiges Base64: {e}")))
}

/// Eingewickelter Gruppen-Schluessel fuer genau ein Mitglied
///
/// Persistierte Form: `{scopeId, memberId, encryptedGroupKey, keyVersion}`,
/// optional mit `algorithm`. Der Server sieht nie den Klartext-Schluessel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyRecord {
    /// Channel (Scope) des Schluessels
    pub scope_id: ChannelId,
    /// Empfaenger
    pub member_id: UserId,
    /// `nonce ‖ ephemeralPublicKey ‖ ciphertext`, Base64 oder `0x`-Hex
    pub encrypted_group_key: String,
    /// Version des eingewickelten Schluessels
    #[serde(default = "erste_version")]
    pub key_version: KeyVersion,
    /// Algorithmus des Absenders; fehlt er, gilt der des Empfaengers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<GroupKeyAlgorithm>,
}

fn erste_version() -> KeyVersion {
    1
}

impl WrappedKeyRecord {
    pub fn new(
        scope_id: ChannelId,
        member_id: UserId,
        key_version: KeyVersion,
        blob: &[u8],
    ) -> Self {
        Self {
            scope_id,
            member_id,
            encrypted_group_key: encode_blob(blob, BlobEncoding::Base64),
            key_version,
            algorithm: None,
        }
    }

    pub fn with_algorithm(mut self, algorithm: GroupKeyAlgorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// Dekodierter Blob
    pub fn blob(&self) -> CryptoResult<Vec<u8>> {
        decode_blob(&self.encrypted_group_key)
    }
}
