use std::time::Duration;

use tracing::warn;

/// Session tunables. Read-marking is delayed slightly so an incoming
/// message renders before it is acknowledged; summaries are polled
/// because no push channel exists for aggregate counts, and the
/// interval trades staleness against store load.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub read_debounce: Duration,
    pub summary_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_debounce: Duration::from_millis(400),
            summary_poll_interval: Duration::from_secs(3),
        }
    }
}

impl SessionConfig {
    /// Environment overrides: PARLOR_READ_DEBOUNCE_MS and
    /// PARLOR_SUMMARY_POLL_MS.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(value) = env_ms("PARLOR_READ_DEBOUNCE_MS") {
            cfg.read_debounce = value;
        }
        if let Some(value) = env_ms("PARLOR_SUMMARY_POLL_MS") {
            cfg.summary_poll_interval = value;
        }
        cfg
    }
}

fn env_ms(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!("Ignoring non-numeric {}: {}", key, raw);
            None
        }
    }
}
