//! # sealchat-observability
//!
//! Observability-Crate fuer Sealchat:
//! - Structured Logging via tracing-subscriber (Text oder JSON)
//! - Prometheus-kompatible Client-Metriken

pub mod logging;
pub mod metrics;

pub use logging::{logging_initialisieren, LogFormat};
pub use metrics::ClientMetrics;
