//! Gruppen-Schluessel pro Channel
//!
//! Jeder Channel hat einen symmetrischen Schluessel (32 Zufallsbytes) mit
//! monoton steigender Version. Fuer jedes Mitglied wird der Schluessel mit
//! dessen oeffentlichem X25519-Schluessel eingewickelt.
//!
//! Blob-Format: `nonce(12) ‖ ephemeralPub(32) ‖ ciphertext(32 + 16)`

use rand::rngs::OsRng;
use rand::RngCore;
use sealchat_core::{ChannelId, UserId};

use crate::e2e::codec::{open, random_nonce, seal};
use crate::e2e::key_exchange::{recipient_wrapping_key, sender_wrapping_key};
use crate::error::{CryptoError, CryptoResult};
use crate::types::{
    GroupKey, GroupKeyAlgorithm, KeyVersion, PrivateKey, PublicKey, SecretBytes, WrappedKeyRecord,
    KEY_LEN, NONCE_LEN, PUBLIC_KEY_LEN, TAG_LEN,
};

/// Gesamtlaenge eines eingewickelten Schluessels
pub const WRAPPED_LEN: usize = NONCE_LEN + PUBLIC_KEY_LEN + KEY_LEN + TAG_LEN;

/// Ergebnis einer Rotation
#[derive(Debug, Clone)]
pub struct RotatedKey {
    /// Der neue Schluessel
    pub key: GroupKey,
    /// Neue Version (`alt + 1`)
    pub version: KeyVersion,
    /// Ein eingewickelter Datensatz pro verbleibendem Mitglied
    pub records: Vec<WrappedKeyRecord>,
}

/// Erstellt einen neuen Gruppen-Schluessel fuer einen Channel
pub fn create_group_key(
    channel_id: ChannelId,
    version: KeyVersion,
    algorithm: GroupKeyAlgorithm,
) -> GroupKey {
    let mut key_bytes = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key_bytes);

    GroupKey {
        channel_id,
        version,
        key_bytes: SecretBytes::new(key_bytes),
        algorithm,
    }
}

/// Wickelt einen Gruppen-Schluessel fuer ein Mitglied ein
///
/// Der Wrapping-Key ist immer AES-256-GCM, unabhaengig vom Algorithmus des
/// Gruppen-Schluessels.
pub fn wrap_key_for_member(group_key: &GroupKey, member_public: &PublicKey) -> CryptoResult<Vec<u8>> {
    let (wrapping_key, ephemeral_public) = sender_wrapping_key(member_public)?;

    let nonce = random_nonce();
    let ciphertext = seal(
        GroupKeyAlgorithm::Aes256Gcm,
        wrapping_key.as_bytes(),
        &nonce,
        group_key.key_bytes.as_bytes(),
        &[],
    )
    .map_err(|e| CryptoError::WrapFailure(e.to_string()))?;

    let mut out = Vec::with_capacity(WRAPPED_LEN);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ephemeral_public);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Wickelt einen Gruppen-Schluessel mit dem eigenen privaten Schluessel aus
///
/// Jeder Fehler (Kuerzung, falscher Schluessel, MAC, falsche Laenge) ist
/// `UnwrapFailure`; es wird nie ein Teil-Klartext zurueckgegeben.
pub fn unwrap_key(
    blob: &[u8],
    own_private: &PrivateKey,
    channel_id: ChannelId,
    version: KeyVersion,
    algorithm: GroupKeyAlgorithm,
) -> CryptoResult<GroupKey> {
    if blob.len() < NONCE_LEN + PUBLIC_KEY_LEN + TAG_LEN {
        return Err(CryptoError::UnwrapFailure(format!(
            "Blob zu kurz: {} Bytes",
            blob.len()
        )));
    }

    let (nonce, rest) = blob.split_at(NONCE_LEN);
    let (ephemeral, ciphertext) = rest.split_at(PUBLIC_KEY_LEN);
    let mut ephemeral_public = [0u8; PUBLIC_KEY_LEN];
    ephemeral_public.copy_from_slice(ephemeral);

    let wrapping_key = recipient_wrapping_key(own_private, &ephemeral_public)?;
    let plaintext = SecretBytes::new(
        open(
            GroupKeyAlgorithm::Aes256Gcm,
            wrapping_key.as_bytes(),
            nonce,
            ciphertext,
            &[],
        )
        .map_err(|_| CryptoError::UnwrapFailure("Authentifizierung fehlgeschlagen".into()))?,
    );

    if plaintext.len() != KEY_LEN {
        return Err(CryptoError::UnwrapFailure(format!(
            "Ausgewickelter Schluessel hat {} statt {KEY_LEN} Bytes",
            plaintext.len()
        )));
    }

    Ok(GroupKey {
        channel_id,
        version,
        key_bytes: plaintext,
        algorithm,
    })
}

/// Erzeugt die naechste Schluessel-Version und wickelt sie fuer alle
/// verbleibenden Mitglieder ein
pub fn rotate_group_key(
    current: &GroupKey,
    remaining_members: &[(UserId, PublicKey)],
) -> CryptoResult<RotatedKey> {
    let version = current.version + 1;
    let key = create_group_key(current.channel_id, version, current.algorithm);

    let records = remaining_members
        .iter()
        .map(|(member_id, public_key)| {
            let blob = wrap_key_for_member(&key, public_key)?;
            Ok(WrappedKeyRecord::new(key.channel_id, *member_id, version, &blob)
                .with_algorithm(key.algorithm))
        })
        .collect::<CryptoResult<Vec<_>>>()?;

    tracing::info!(
        channel = %key.channel_id,
        key_version = version,
        members = records.len(),
        "Gruppen-Schluessel rotiert"
    );

    Ok(RotatedKey {
        key,
        version,
        records,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
