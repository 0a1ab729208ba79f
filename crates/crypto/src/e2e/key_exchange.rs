//! X25519-Vereinbarung und HKDF-Ableitung fuer das Einwickeln von Schluesseln
//!
//! Das Einwickeln ist ECIES-aehnlich: der Absender erzeugt ein ephemeres
//! Schluessel-Paar, berechnet DH mit dem Empfaenger-Schluessel und leitet
//! daraus per HKDF-SHA256 einen Wrapping-Key ab.
//!
//! Salt = `ephemeralPub ‖ memberPub`, Info = `sealchat-key-wrap-v1`.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::error::{CryptoError, CryptoResult};
use crate::types::{PrivateKey, PublicKey, SecretBytes, KEY_LEN, PUBLIC_KEY_LEN};

/// HKDF-Info fuer Wrapping-Keys
pub const WRAP_INFO: &[u8] = b"sealchat-key-wrap-v1";

/// HKDF-basierte Key Derivation (allgemein verwendbar)
pub fn hkdf_derive(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> CryptoResult<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// Leitet den Wrapping-Key aus einem DH-Ergebnis ab
fn wrapping_key(
    shared: &[u8],
    ephemeral_public: &[u8; PUBLIC_KEY_LEN],
    member_public: &[u8; PUBLIC_KEY_LEN],
) -> CryptoResult<SecretBytes> {
    let mut salt = [0u8; 2 * PUBLIC_KEY_LEN];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(ephemeral_public);
    salt[PUBLIC_KEY_LEN..].copy_from_slice(member_public);

    Ok(SecretBytes::new(hkdf_derive(shared, &salt, WRAP_INFO, KEY_LEN)?))
}

/// Absenderseite: frisches ephemeres Paar, DH mit dem Mitglied
///
/// Liefert den Wrapping-Key und den ephemeren oeffentlichen Schluessel, der
/// im Blob mitgeschickt wird.
pub fn sender_wrapping_key(
    member_public: &PublicKey,
) -> CryptoResult<(SecretBytes, [u8; PUBLIC_KEY_LEN])> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret).to_bytes();

    let shared = ephemeral_secret.diffie_hellman(&X25519PublicKey::from(member_public.0));
    // Kleine-Ordnung-Punkte liefern ein bekanntes Geheimnis
    if !shared.was_contributory() {
        return Err(CryptoError::WrapFailure(
            "Oeffentlicher Schluessel des Mitglieds ist ungueltig".into(),
        ));
    }

    let key = wrapping_key(shared.as_bytes(), &ephemeral_public, member_public.as_bytes())?;
    Ok((key, ephemeral_public))
}

/// Empfaengerseite: DH zwischen eigenem privaten und dem ephemeren Schluessel
pub fn recipient_wrapping_key(
    own_private: &PrivateKey,
    ephemeral_public: &[u8; PUBLIC_KEY_LEN],
) -> CryptoResult<SecretBytes> {
    let shared = own_private
        .secret()
        .diffie_hellman(&X25519PublicKey::from(*ephemeral_public));
    if !shared.was_contributory() {
        return Err(CryptoError::UnwrapFailure(
            "Ephemerer Schluessel ist ungueltig".into(),
        ));
    }

    let own_public = own_private.public_key();
    wrapping_key(shared.as_bytes(), ephemeral_public, own_public.as_bytes())
        .map_err(|e| CryptoError::UnwrapFailure(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
