//! Verbindungszustand und Wiederverbindungs-Strategie

use std::time::Duration;

/// Zustand einer `ChannelConnection`
///
/// ```text
/// Disconnected -> Connecting -> Authenticating -> Syncing -> Live
///                                                  ^          |
///                                                  |          v
///                                   Reconnecting(attempt, delay)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Syncing,
    Live,
    Reconnecting { attempt: u32, delay_ms: u64 },
}

impl ConnectionState {
    /// Ob gerade eine Transport-Verbindung besteht oder aufgebaut wird
    pub fn ist_aktiv(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }

    pub fn ist_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Syncing => write!(f, "syncing"),
            Self::Live => write!(f, "live"),
            Self::Reconnecting { attempt, delay_ms } => {
                write!(f, "reconnecting(attempt={attempt}, delay={delay_ms}ms)")
            }
        }
    }
}

/// Exponentielles Backoff fuer Wiederverbindungen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Wartezeit vor Versuch `attempt` (1-basiert): `initial * 2^(attempt-1)`,
    /// begrenzt auf `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let faktor = 1u32 << exponent;
        self.initial_delay
            .checked_mul(faktor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Alle Wartezeiten bis zum letzten erlaubten Versuch
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|a| self.delay_for(a)).collect()
    }
}
