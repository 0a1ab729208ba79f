//! E2E Verschluesselung (End-to-End)
//!
//! Client <-> Client Verschluesselung. Der Server leitet Nachrichten und
//! eingewickelte Schluessel weiter, kann aber keine davon oeffnen.
//!
//! ## Ablauf
//! 1. Jedes Geraet hat ein X25519-Identitaets-Paar (`IdentityKeyStore`)
//! 2. Der Channel-Ersteller erzeugt einen Gruppen-Schluessel (Version 1)
//! 3. Der Schluessel wird pro Mitglied eingewickelt und verteilt
//! 4. Nachrichten werden mit dem Gruppen-Schluessel verschluesselt (`codec`)
//! 5. Bei Mitgliederwechsel: Rotation (neue Version, alte bleiben lesbar)

pub mod codec;
pub mod group_key;
pub mod key_exchange;
pub mod key_manager;

pub use codec::{decode, decode_parts, encode};
pub use group_key::{
    create_group_key, rotate_group_key, unwrap_key, wrap_key_for_member, RotatedKey, WRAPPED_LEN,
};
pub use key_exchange::hkdf_derive;
pub use key_manager::GroupKeyManager;
