//! sealchat-protocol – Channel-Protokoll
//!
//! Dieses Crate definiert die JSON-Frames zwischen Client und
//! Channel-Server, den laengenpraefixierten TCP-Codec und die
//! Versions-Aushandlung mit Legacy-Adapter.

pub mod frame;
pub mod negotiation;
pub mod wire;

pub use frame::{ChannelFrame, MessageFrame, MessageType, WrappedKeyEntry};
pub use negotiation::{candidates, inbound, outbound, Endpoint, EndpointTemplate, ProtocolVariant};
pub use wire::FrameCodec;
