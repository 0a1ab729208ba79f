//! Prometheus-kompatible Client-Metriken fuer Sealchat
//!
//! Registrierte Metriken:
//! - `sealchat_connections_live` – Gauge: Verbindungen im Zustand Live
//! - `sealchat_frames_received_total` – Counter: Empfangene Frames (type)
//! - `sealchat_frames_sent_total` – Counter: Gesendete Frames (type)
//! - `sealchat_frames_malformed_total` – Counter: Verworfene, ungueltige Frames
//! - `sealchat_decode_failures_total` – Counter: Nicht entschluesselbare Nachrichten
//! - `sealchat_reconnect_attempts_total` – Counter: Wiederverbindungs-Versuche
//! - `sealchat_messages_sent_total` – Counter: Gesendete Nachrichten
//! - `sealchat_history_sync_seconds` – Histogram: Dauer einer Verlaufs-Synchronisation
//!
//! Es gibt keinen HTTP-Endpunkt; der Einbettende entscheidet ueber den Export.

use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Alle Sealchat-Client-Metriken
#[derive(Clone)]
pub struct ClientMetrics {
    pub registry: Arc<Registry>,

    // Verbindungen
    pub connections_live: IntGauge,
    pub reconnect_attempts_total: IntCounter,

    // Frames
    pub frames_received_total: IntCounterVec,
    pub frames_sent_total: IntCounterVec,
    pub frames_malformed_total: IntCounter,

    // Nachrichten
    pub decode_failures_total: IntCounter,
    pub messages_sent_total: IntCounter,
    pub history_sync_seconds: Histogram,
}

impl ClientMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        // --- Verbindungen ---
        let connections_live = IntGauge::with_opts(Opts::new(
            "sealchat_connections_live",
            "Anzahl Verbindungen im Zustand Live",
        ))?;
        registry.register(Box::new(connections_live.clone()))?;

        let reconnect_attempts_total = IntCounter::with_opts(Opts::new(
            "sealchat_reconnect_attempts_total",
            "Gesamtanzahl Wiederverbindungs-Versuche",
        ))?;
        registry.register(Box::new(reconnect_attempts_total.clone()))?;

        // --- Frames ---
        let frames_received_total = IntCounterVec::new(
            Opts::new("sealchat_frames_received_total", "Empfangene Frames"),
            &["type"],
        )?;
        registry.register(Box::new(frames_received_total.clone()))?;

        let frames_sent_total = IntCounterVec::new(
            Opts::new("sealchat_frames_sent_total", "Gesendete Frames"),
            &["type"],
        )?;
        registry.register(Box::new(frames_sent_total.clone()))?;

        let frames_malformed_total = IntCounter::with_opts(Opts::new(
            "sealchat_frames_malformed_total",
            "Verworfene ungueltige Frames",
        ))?;
        registry.register(Box::new(frames_malformed_total.clone()))?;

        // --- Nachrichten ---
        let decode_failures_total = IntCounter::with_opts(Opts::new(
            "sealchat_decode_failures_total",
            "Nachrichten die nicht entschluesselt werden konnten",
        ))?;
        registry.register(Box::new(decode_failures_total.clone()))?;

        let messages_sent_total = IntCounter::with_opts(Opts::new(
            "sealchat_messages_sent_total",
            "Gesendete Nachrichten",
        ))?;
        registry.register(Box::new(messages_sent_total.clone()))?;

        let history_sync_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sealchat_history_sync_seconds",
                "Dauer einer Verlaufs-Synchronisation in Sekunden",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(history_sync_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            connections_live,
            reconnect_attempts_total,
            frames_received_total,
            frames_sent_total,
            frames_malformed_total,
            decode_failures_total,
            messages_sent_total,
            history_sync_seconds,
        })
    }

    /// Zaehlt einen empfangenen Frame
    pub fn frame_empfangen(&self, typ: &str) {
        self.frames_received_total.with_label_values(&[typ]).inc();
    }

    /// Zaehlt einen gesendeten Frame
    pub fn frame_gesendet(&self, typ: &str) {
        self.frames_sent_total.with_label_values(&[typ]).inc();
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl std::fmt::Debug for ClientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetrics")
            .field("connections_live", &self.connections_live.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metriken_erstellen_erfolgreich() {
        let metriken = ClientMetrics::neu().unwrap();
        assert!(!metriken.registry.gather().is_empty());
    }

    #[test]
    fn gauge_und_counter() {
        let metriken = ClientMetrics::neu().unwrap();
        metriken.connections_live.inc();
        metriken.connections_live.inc();
        metriken.connections_live.dec();
        assert_eq!(metriken.connections_live.get(), 1);

        metriken.reconnect_attempts_total.inc_by(3);
        assert_eq!(metriken.reconnect_attempts_total.get(), 3);
    }

    #[test]
    fn frame_counter_mit_typ_label() {
        let metriken = ClientMetrics::neu().unwrap();
        metriken.frame_empfangen("new_message");
        metriken.frame_empfangen("new_message");
        metriken.frame_gesendet("ping");

        assert_eq!(
            metriken
                .frames_received_total
                .with_label_values(&["new_message"])
                .get(),
            2
        );
        assert_eq!(
            metriken.frames_sent_total.with_label_values(&["ping"]).get(),
            1
        );
    }

    #[test]
    fn export_im_prometheus_format() {
        let metriken = ClientMetrics::neu().unwrap();
        metriken.messages_sent_total.inc();
        metriken.frame_empfangen("history");
        metriken.history_sync_seconds.observe(0.2);

        let output = metriken.exportieren().unwrap();
        assert!(output.contains("sealchat_messages_sent_total 1"));
        assert!(output.contains("sealchat_frames_received_total{type=\"history\"} 1"));
        assert!(output.contains("sealchat_history_sync_seconds_count 1"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn getrennte_instanzen_teilen_nichts() {
        let a = ClientMetrics::neu().unwrap();
        let b = ClientMetrics::neu().unwrap();
        a.decode_failures_total.inc();
        assert_eq!(b.decode_failures_total.get(), 0);
    }
}
