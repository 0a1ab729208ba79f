//! # sealchat-crypto
//!
//! Ende-zu-Ende Verschluesselung fuer Sealchat.
//!
//! ## Module
//! - `identity` - X25519 Langzeit-Identitaetsschluessel
//! - `e2e` - Gruppen-Schluessel, Schluesselbund und Nachrichten-Codec
//! - `storage` - Sicherer Speicher (Trait + Memory/Datei)
//! - `directory` - Verzeichnis oeffentlicher Schluessel
//! - `types` - Gemeinsame Typen (PublicKey, GroupKey, WrappedKeyRecord, ...)
//! - `error` - Fehlertypen

pub mod directory;
pub mod e2e;
pub mod error;
pub mod identity;
pub mod storage;
pub mod types;

// Bequeme Re-Exports
pub use directory::{MemoryDirectory, PublicKeyDirectory};
pub use error::{CryptoError, CryptoResult};
pub use identity::IdentityKeyStore;
pub use storage::{DiskSecureStorage, MemorySecureStorage, SecureStorage};
pub use types::{
    decode_blob, encode_blob, BlobEncoding, GroupKey, GroupKeyAlgorithm, IdentityKeyPair,
    KeyVersion, PrivateKey, PublicKey, SecretBytes, WrappedKeyRecord,
};

pub use e2e::{
    create_group_key, decode, decode_parts, encode, hkdf_derive, rotate_group_key, unwrap_key,
    wrap_key_for_member, GroupKeyManager, RotatedKey,
};
