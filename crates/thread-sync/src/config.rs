use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::client::ThreadsClientConfig;
use crate::controller::ControllerConfig;
use crate::keepalive::KeepaliveConfig;
use crate::lifecycle::ReconnectPolicy;

pub const ENV_API_BASE_URL: &str = "THREAD_SYNC_API_BASE_URL";
pub const ENV_WS_BASE_URL: &str = "THREAD_SYNC_WS_BASE_URL";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "THREAD_SYNC_REQUEST_TIMEOUT_MS";
pub const ENV_REQUEST_ATTEMPTS: &str = "THREAD_SYNC_REQUEST_ATTEMPTS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "THREAD_SYNC_CONNECT_TIMEOUT_MS";
pub const ENV_RECONNECT_DELAY_MS: &str = "THREAD_SYNC_RECONNECT_DELAY_MS";
pub const ENV_RECONNECT_MAX_MS: &str = "THREAD_SYNC_RECONNECT_MAX_MS";
pub const ENV_KEEPALIVE_INTERVAL_MS: &str = "THREAD_SYNC_KEEPALIVE_INTERVAL_MS";
pub const ENV_KEEPALIVE_TIMEOUT_MS: &str = "THREAD_SYNC_KEEPALIVE_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "THREAD_SYNC_POLL_INTERVAL_MS";
pub const ENV_JOURNAL_CAPACITY: &str = "THREAD_SYNC_JOURNAL_CAPACITY";

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
    #[error("invalid {key}: expected an http:// or https:// url, got {value}")]
    InvalidBaseUrl { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub request_timeout_ms: u64,
    pub request_attempts: usize,
    pub controller: ControllerConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let client = ThreadsClientConfig::new(DEFAULT_API_BASE_URL);
        Self {
            api_base_url: client.base_url,
            ws_base_url: "ws://localhost:8000".to_string(),
            request_timeout_ms: client.timeout_ms,
            request_attempts: client.request_attempts,
            controller: ControllerConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        let controller_defaults = defaults.controller.clone();

        let api_base_url = lookup(ENV_API_BASE_URL)
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let ws_base_url = match lookup(ENV_WS_BASE_URL) {
            Some(value) => value.trim_end_matches('/').to_string(),
            None => derive_ws_base_url(&api_base_url).ok_or_else(|| {
                ConfigError::InvalidBaseUrl {
                    key: ENV_API_BASE_URL,
                    value: api_base_url.clone(),
                }
            })?,
        };

        let request_timeout_ms =
            parse_u64(&lookup, ENV_REQUEST_TIMEOUT_MS, defaults.request_timeout_ms)?;
        let request_attempts = parse_u64(
            &lookup,
            ENV_REQUEST_ATTEMPTS,
            defaults.request_attempts as u64,
        )?
        .max(1) as usize;
        let connect_timeout_ms = parse_u64(
            &lookup,
            ENV_CONNECT_TIMEOUT_MS,
            duration_ms(controller_defaults.connect_timeout),
        )?;
        let reconnect_delay_ms = parse_u64(
            &lookup,
            ENV_RECONNECT_DELAY_MS,
            duration_ms(reconnect_base(controller_defaults.reconnect)),
        )?;
        let reconnect = match lookup(ENV_RECONNECT_MAX_MS) {
            None => ReconnectPolicy::Fixed {
                delay: Duration::from_millis(reconnect_delay_ms),
            },
            Some(raw) => ReconnectPolicy::Exponential {
                base: Duration::from_millis(reconnect_delay_ms),
                max: Duration::from_millis(parse_raw_u64(ENV_RECONNECT_MAX_MS, &raw)?),
            },
        };
        let keepalive_interval_ms = parse_u64(
            &lookup,
            ENV_KEEPALIVE_INTERVAL_MS,
            duration_ms(controller_defaults.keepalive.interval),
        )?;
        let keepalive_timeout_ms = parse_u64(
            &lookup,
            ENV_KEEPALIVE_TIMEOUT_MS,
            controller_defaults
                .keepalive
                .reply_timeout
                .map_or(0, duration_ms),
        )?;
        let poll_interval_ms = parse_u64(&lookup, ENV_POLL_INTERVAL_MS, 0)?;
        let journal_capacity = parse_u64(
            &lookup,
            ENV_JOURNAL_CAPACITY,
            controller_defaults.journal_capacity as u64,
        )?;
        if journal_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_JOURNAL_CAPACITY,
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            api_base_url,
            ws_base_url,
            request_timeout_ms,
            request_attempts,
            controller: ControllerConfig {
                connect_timeout: Duration::from_millis(connect_timeout_ms.max(1)),
                reconnect,
                keepalive: KeepaliveConfig {
                    interval: Duration::from_millis(keepalive_interval_ms),
                    reply_timeout: (keepalive_timeout_ms > 0)
                        .then(|| Duration::from_millis(keepalive_timeout_ms)),
                },
                poll_interval: (poll_interval_ms > 0)
                    .then(|| Duration::from_millis(poll_interval_ms)),
                journal_capacity: journal_capacity as usize,
            },
        })
    }

    #[must_use]
    pub fn client_config(&self) -> ThreadsClientConfig {
        ThreadsClientConfig {
            base_url: self.api_base_url.clone(),
            timeout_ms: self.request_timeout_ms,
            request_attempts: self.request_attempts,
        }
    }
}

/// `http` becomes `ws`, `https` becomes `wss`.
#[must_use]
pub fn derive_ws_base_url(api_base_url: &str) -> Option<String> {
    let trimmed = api_base_url.trim().trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    trimmed
        .strip_prefix("http://")
        .map(|rest| format!("ws://{rest}"))
}

fn reconnect_base(policy: ReconnectPolicy) -> Duration {
    match policy {
        ReconnectPolicy::Fixed { delay } => delay,
        ReconnectPolicy::Exponential { base, .. } => base,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        Some(raw) => parse_raw_u64(key, &raw),
        None => Ok(default),
    }
}

fn parse_raw_u64(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|error| ConfigError::InvalidValue {
        key,
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{ConfigError, SyncConfig, derive_ws_base_url};
    use crate::lifecycle::ReconnectPolicy;

    fn lookup(values: &HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        |key| values.get(key).map(ToString::to_string)
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let values = HashMap::new();
        let config = SyncConfig::from_lookup(lookup(&values)).expect("config");

        assert_eq!(config.api_base_url, "http://localhost:8000");
        assert_eq!(config.ws_base_url, "ws://localhost:8000");
        assert_eq!(config.request_timeout_ms, 5_000);
        assert_eq!(config.request_attempts, 2);
        assert_eq!(config.controller.connect_timeout, Duration::from_secs(10));
        assert_eq!(
            config.controller.reconnect,
            ReconnectPolicy::Fixed {
                delay: Duration::from_secs(3)
            }
        );
        assert_eq!(config.controller.keepalive.interval, Duration::from_secs(30));
        assert_eq!(
            config.controller.keepalive.reply_timeout,
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.controller.poll_interval, None);
        assert_eq!(config.controller.journal_capacity, 512);
    }

    #[test]
    fn env_overrides_are_applied() {
        let values = HashMap::from([
            ("THREAD_SYNC_API_BASE_URL", "https://api.example.com/"),
            ("THREAD_SYNC_RECONNECT_DELAY_MS", "250"),
            ("THREAD_SYNC_RECONNECT_MAX_MS", "8000"),
            ("THREAD_SYNC_KEEPALIVE_TIMEOUT_MS", "0"),
            ("THREAD_SYNC_POLL_INTERVAL_MS", "1000"),
            ("THREAD_SYNC_REQUEST_ATTEMPTS", "0"),
        ]);
        let config = SyncConfig::from_lookup(lookup(&values)).expect("config");

        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.ws_base_url, "wss://api.example.com");
        assert_eq!(config.request_attempts, 1);
        assert_eq!(
            config.controller.reconnect,
            ReconnectPolicy::Exponential {
                base: Duration::from_millis(250),
                max: Duration::from_millis(8_000)
            }
        );
        assert_eq!(config.controller.keepalive.reply_timeout, None);
        assert_eq!(
            config.controller.poll_interval,
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let values = HashMap::from([("THREAD_SYNC_CONNECT_TIMEOUT_MS", "soon")]);
        let error = SyncConfig::from_lookup(lookup(&values)).expect_err("invalid value should fail");
        assert!(error.to_string().contains("THREAD_SYNC_CONNECT_TIMEOUT_MS"));

        let values = HashMap::from([("THREAD_SYNC_API_BASE_URL", "ftp://files")]);
        let error = SyncConfig::from_lookup(lookup(&values)).expect_err("bad scheme should fail");
        assert!(matches!(error, ConfigError::InvalidBaseUrl { .. }));

        let values = HashMap::from([("THREAD_SYNC_JOURNAL_CAPACITY", "0")]);
        assert!(SyncConfig::from_lookup(lookup(&values)).is_err());
    }

    #[test]
    fn ws_base_is_derived_from_api_scheme() {
        assert_eq!(
            derive_ws_base_url("http://127.0.0.1:8000/"),
            Some("ws://127.0.0.1:8000".to_string())
        );
        assert_eq!(
            derive_ws_base_url("https://host/api"),
            Some("wss://host/api".to_string())
        );
        assert_eq!(derive_ws_base_url("host:8000"), None);
    }
}
