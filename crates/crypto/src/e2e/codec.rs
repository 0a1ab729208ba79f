//! Nachrichten-Codec
//!
//! Verschluesselt Nutzdaten mit dem Gruppen-Schluessel eines Channels.
//!
//! Format: `nonce(12) ‖ ciphertext+tag`
//! AAD:    `sealchat-msg ‖ keyVersion (u32 BE)`
//!
//! Die Version steckt in der AAD, ein Schluessel der falschen Version
//! scheitert deshalb an der Authentifizierung.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::types::{GroupKey, GroupKeyAlgorithm, KeyVersion, NONCE_LEN, TAG_LEN};

const AAD_PREFIX: &[u8] = b"sealchat-msg";

/// Frische Zufalls-Nonce
pub(crate) fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// AEAD-Verschluesselung mit dem angegebenen Algorithmus
pub(crate) fn seal(
    algorithm: GroupKeyAlgorithm,
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let payload = Payload { msg: plaintext, aad };
    let nonce = GenericArray::from_slice(nonce);
    let result = match algorithm {
        GroupKeyAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::Verschluesselung(e.to_string()))?
            .encrypt(nonce, payload),
        GroupKeyAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CryptoError::Verschluesselung(e.to_string()))?
            .encrypt(nonce, payload),
    };
    result.map_err(|e| CryptoError::Verschluesselung(e.to_string()))
}

/// AEAD-Entschluesselung; jeder Fehler ist `AuthenticationFailure`
pub(crate) fn open(
    algorithm: GroupKeyAlgorithm,
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::AuthenticationFailure);
    }
    let payload = Payload { msg: ciphertext, aad };
    let nonce = GenericArray::from_slice(nonce);
    let result = match algorithm {
        GroupKeyAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::AuthenticationFailure)?
            .decrypt(nonce, payload),
        GroupKeyAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CryptoError::AuthenticationFailure)?
            .decrypt(nonce, payload),
    };
    result.map_err(|_| CryptoError::AuthenticationFailure)
}

fn message_aad(version: KeyVersion) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_PREFIX.len() + 4);
    aad.extend_from_slice(AAD_PREFIX);
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

/// Verschluesselt Nutzdaten mit dem Gruppen-Schluessel
///
/// Gibt `nonce ‖ ciphertext` zurueck.
pub fn encode(payload: &[u8], key: &GroupKey) -> CryptoResult<Vec<u8>> {
    let nonce = random_nonce();
    let ciphertext = seal(
        key.algorithm,
        key.key_bytes.as_bytes(),
        &nonce,
        payload,
        &message_aad(key.version),
    )?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    tracing::trace!(
        channel = %key.channel_id,
        key_version = key.version,
        bytes = out.len(),
        "Nutzdaten verschluesselt"
    );
    Ok(out)
}

/// Entschluesselt `nonce ‖ ciphertext`
///
/// Zu kurzer Blob, falsches Tag oder falsche Schluessel-Version ergeben
/// `AuthenticationFailure`.
pub fn decode(blob: &[u8], key: &GroupKey) -> CryptoResult<Vec<u8>> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AuthenticationFailure);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    open(
        key.algorithm,
        key.key_bytes.as_bytes(),
        nonce,
        ciphertext,
        &message_aad(key.version),
    )
}

/// Entschluesselt eine Nachricht deren Nonce getrennt uebertragen wurde
pub fn decode_parts(nonce: &[u8], ciphertext: &[u8], key: &GroupKey) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthenticationFailure);
    }
    open(
        key.algorithm,
        key.key_bytes.as_bytes(),
        nonce,
        ciphertext,
        &message_aad(key.version),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
