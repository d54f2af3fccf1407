//! Engine configuration
//!
//! Every knob has a default matching the reference deployment; `from_env`
//! overrides them from the environment without failing on malformed values
//! (a bad value keeps the default and logs a warning).

use std::time::Duration;

/// Durability mode for the per-run log history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPersistence {
    /// Append each envelope to the run row, tolerate write failures
    BestEffort,
    /// Reserved; the engine currently downgrades this to best-effort
    Strict,
}

/// Configuration for the session engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum in-flight plugin calls per stage (`PARALLELISM`)
    pub parallelism: usize,

    /// Per-call plugin timeout; `None` is unbounded (`PLUGIN_CALL_TIMEOUT`, seconds)
    pub plugin_call_timeout: Option<Duration>,

    /// Ring-buffer capacity for replay to late subscribers (`LOG_BUFFER_SIZE`)
    pub log_buffer_size: usize,

    /// How long a terminated session stays attachable (`SESSION_EVICT_GRACE`, seconds)
    pub session_evict_grace: Duration,

    /// Log durability mode (`LOG_PERSISTENCE`)
    pub log_persistence: LogPersistence,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            plugin_call_timeout: None,
            log_buffer_size: 500,
            session_evict_grace: Duration::from_secs(30),
            log_persistence: LogPersistence::BestEffort,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = read_env("PARALLELISM") {
            if n > 0 {
                config.parallelism = n;
            }
        }
        if let Ok(raw) = std::env::var("PLUGIN_CALL_TIMEOUT") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    config.plugin_call_timeout = Some(Duration::from_secs(secs));
                }
                _ => tracing::warn!(value = %raw, "Invalid PLUGIN_CALL_TIMEOUT, using unbounded"),
            }
        }
        if let Some(n) = read_env("LOG_BUFFER_SIZE") {
            if n > 0 {
                config.log_buffer_size = n;
            }
        }
        if let Some(secs) = read_env("SESSION_EVICT_GRACE") {
            config.session_evict_grace = Duration::from_secs(secs as u64);
        }
        if let Ok(raw) = std::env::var("LOG_PERSISTENCE") {
            match raw.as_str() {
                "best_effort" => config.log_persistence = LogPersistence::BestEffort,
                "strict" => config.log_persistence = LogPersistence::Strict,
                other => tracing::warn!(value = %other, "Unknown LOG_PERSISTENCE, using best_effort"),
            }
        }

        config
    }
}

fn read_env(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid numeric value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.parallelism, 10);
        assert_eq!(config.plugin_call_timeout, None);
        assert_eq!(config.log_buffer_size, 500);
        assert_eq!(config.session_evict_grace, Duration::from_secs(30));
        assert_eq!(config.log_persistence, LogPersistence::BestEffort);
    }
}
