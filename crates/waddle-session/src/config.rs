//! Session configuration.

use std::time::Duration;

use tracing::warn;

/// Default interval between keep-alive payloads (30 seconds).
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default pause after a failed write before retrying (250 ms).
pub const DEFAULT_WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between keep-alive payloads (default: 30s)
    pub keep_alive_interval: Duration,
    /// Bytes sent as keep-alive (default: a single space)
    pub keep_alive_payload: Vec<u8>,
    /// Pause after a failed write before retrying (default: 250ms)
    pub write_retry_backoff: Duration,
    /// Timeout applied by `Session::send_iq` (default: none, wait forever)
    pub default_iq_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_payload: b" ".to_vec(),
            write_retry_backoff: DEFAULT_WRITE_RETRY_BACKOFF,
            default_iq_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Build a configuration from the defaults overridden by environment variables.
    ///
    /// - `WADDLE_SESSION_KEEPALIVE_SECS`: keep-alive interval in seconds
    /// - `WADDLE_SESSION_WRITE_RETRY_MS`: write retry backoff in milliseconds
    /// - `WADDLE_SESSION_IQ_TIMEOUT_SECS`: default IQ timeout in seconds (0 disables)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(secs) = parse_u64(&lookup, "WADDLE_SESSION_KEEPALIVE_SECS") {
            config.keep_alive_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&lookup, "WADDLE_SESSION_WRITE_RETRY_MS") {
            config.write_retry_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "WADDLE_SESSION_IQ_TIMEOUT_SECS") {
            config.default_iq_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = %key, value = %raw, "Ignoring unparsable session setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.write_retry_backoff, Duration::from_millis(250));
        assert_eq!(config.keep_alive_payload, b" ");
        assert!(config.default_iq_timeout.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("WADDLE_SESSION_KEEPALIVE_SECS", "60"),
            ("WADDLE_SESSION_WRITE_RETRY_MS", "500"),
            ("WADDLE_SESSION_IQ_TIMEOUT_SECS", "10"),
        ]));

        assert_eq!(config.keep_alive_interval, Duration::from_secs(60));
        assert_eq!(config.write_retry_backoff, Duration::from_millis(500));
        assert_eq!(config.default_iq_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_invalid_and_zero_values() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("WADDLE_SESSION_KEEPALIVE_SECS", "soon"),
            ("WADDLE_SESSION_IQ_TIMEOUT_SECS", "0"),
        ]));

        assert_eq!(config.keep_alive_interval, DEFAULT_KEEP_ALIVE_INTERVAL);
        assert!(config.default_iq_timeout.is_none());
    }
}
