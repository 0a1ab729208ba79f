//! sealchat-client – Echtzeit-Client fuer verschluesselte Channels
//!
//! Dieses Crate implementiert:
//! - ChannelConnection: Zustandsmaschine (connect, authenticate, Verlauf, Live, Wiederverbindung)
//! - MessageCache: deduplizierter, nach Zeit geordneter Nachrichten-Speicher
//! - ConnectionPool: eine Verbindung pro Channel mit Leerlauf-Raeumung
//! - Transporte: TCP (laengenpraefixiertes JSON) und WebSocket
//!
//! # Beispiel
//!
//! ```no_run
//! use std::sync::Arc;
//! use sealchat_client::{ChannelConnection, MessageEnvelope, SchemeConnector};
//! use sealchat_core::{ChannelId, UserId};
//! use sealchat_crypto::{GroupKeyManager, IdentityKeyStore, MemoryDirectory, MemorySecureStorage};
//! use sealchat_protocol::MessageType;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let identity = Arc::new(IdentityKeyStore::new(
//!         UserId::new(),
//!         Arc::new(MemorySecureStorage::new()),
//!         Arc::new(MemoryDirectory::new()),
//!     ));
//!     identity.load_or_generate().await?;
//!
//!     let keys = Arc::new(GroupKeyManager::new());
//!     let channel = ChannelId::new();
//!     keys.create_channel(channel);
//!
//!     let connection =
//!         ChannelConnection::builder(identity, keys, Arc::new(SchemeConnector::new())).build();
//!     connection.open(channel).await?;
//!     connection
//!         .send(MessageEnvelope::text("Hallo"), MessageType::Text)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod pool;
pub mod state;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

// Bequeme Re-Exporte
pub use cache::{CacheEvent, InsertOutcome, MessageCache};
pub use config::{ClientConfig, ConnectionSettings};
pub use connection::{ChannelConnection, ChannelConnectionBuilder};
pub use error::{ClientError, ClientResult};
pub use event::ChannelEvent;
pub use pool::ConnectionPool;
pub use state::{ConnectionState, ReconnectPolicy};
pub use store::{MemoryMessageStore, MessageStore};
pub use transport::{
    Connector, InboundFrame, Link, LinkPeer, SchemeConnector, TcpConnector, WsConnector,
};
pub use types::{CachedMessage, DeliveryStatus, MediaReference, MessageContent, MessageEnvelope};
