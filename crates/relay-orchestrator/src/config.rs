//! Relay orchestrator configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8082";

/// Default TTL of the instance registry lock in milliseconds.
pub const DEFAULT_REGISTRY_LOCK_TTL_MS: u64 = 1000;

/// Default number of lock acquisition attempts.
pub const DEFAULT_LOCK_RETRY_COUNT: u32 = 50;

/// Default delay between lock acquisition attempts in milliseconds.
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 200;

/// Default maximum random jitter added to the lock retry delay in milliseconds.
pub const DEFAULT_LOCK_RETRY_JITTER_MS: u64 = 200;

/// Default telemetry poll and event-stream reconnect cadence in seconds.
pub const DEFAULT_MONITOR_INTERVAL_SECONDS: u64 = 5;

/// Default stream reaper cadence in seconds.
pub const DEFAULT_REAPER_INTERVAL_SECONDS: u64 = 1;

/// Default stream-list broadcast cadence in seconds.
pub const DEFAULT_STREAM_LIST_INTERVAL_SECONDS: u64 = 5;

/// Default relay control request timeout in seconds.
pub const DEFAULT_RELAY_REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Default relay long-poll timeout in seconds. The relay holds polls for ~30s.
pub const DEFAULT_RELAY_POLL_TIMEOUT_SECONDS: u64 = 65;

/// One relay instance as configured by the operator.
#[derive(Clone, Deserialize)]
pub struct RelayInstanceConfig {
    /// Stable identity of the instance.
    pub host: String,
    /// Base URL of the control channel (e.g. `http://relay-1:8088`).
    pub control_url: String,
    /// WebSocket URL of the event stream (e.g. `ws://relay-1:8188`).
    pub event_url: String,
    /// HTTP URL returning `{"loadAverage": <float>}`.
    pub telemetry_url: String,
    /// Relay API secret, sent as `apisecret`.
    #[serde(default)]
    pub secret: Option<SecretString>,
    /// Disabled instances are never selected.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl fmt::Debug for RelayInstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayInstanceConfig")
            .field("host", &self.host)
            .field("control_url", &self.control_url)
            .field("event_url", &self.event_url)
            .field("telemetry_url", &self.telemetry_url)
            .field(
                "secret",
                &self.secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Relay orchestrator configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Shared store URL. May embed credentials.
    pub redis_url: SecretString,

    /// Configured relay fleet.
    pub relay_instances: Vec<RelayInstanceConfig>,

    /// Health and metrics HTTP bind address (default: "0.0.0.0:8082").
    pub health_bind_address: String,

    /// TTL of `instance-registry-lock`.
    pub registry_lock_ttl: Duration,

    /// Lock acquisition attempts before giving up.
    pub lock_retry_count: u32,

    /// Base delay between lock attempts.
    pub lock_retry_delay: Duration,

    /// Maximum random jitter added to each lock retry delay.
    pub lock_retry_jitter: Duration,

    /// Telemetry poll and event-stream reconnect cadence.
    pub monitor_interval: Duration,

    /// Stream reaper cadence.
    pub reaper_interval: Duration,

    /// Stream-list broadcast cadence.
    pub stream_list_interval: Duration,

    /// Control-channel request timeout.
    pub relay_request_timeout: Duration,

    /// Event-channel long-poll timeout.
    pub relay_poll_timeout: Duration,

    /// Emit JSON-formatted logs.
    pub json_logs: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("relay_instances", &self.relay_instances)
            .field("health_bind_address", &self.health_bind_address)
            .field("registry_lock_ttl", &self.registry_lock_ttl)
            .field("lock_retry_count", &self.lock_retry_count)
            .field("lock_retry_delay", &self.lock_retry_delay)
            .field("lock_retry_jitter", &self.lock_retry_jitter)
            .field("monitor_interval", &self.monitor_interval)
            .field("reaper_interval", &self.reaper_interval)
            .field("stream_list_interval", &self.stream_list_interval)
            .field("relay_request_timeout", &self.relay_request_timeout)
            .field("relay_poll_timeout", &self.relay_poll_timeout)
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let raw_instances = vars
            .get("RELAY_INSTANCES")
            .ok_or_else(|| ConfigError::MissingEnvVar("RELAY_INSTANCES".to_string()))?;
        let relay_instances = parse_relay_instances(raw_instances)?;

        let health_bind_address = vars
            .get("RO_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let registry_lock_ttl = Duration::from_millis(parse_or(
            vars,
            "RO_REGISTRY_LOCK_TTL_MS",
            DEFAULT_REGISTRY_LOCK_TTL_MS,
        )?);
        let lock_retry_count = parse_or(vars, "RO_LOCK_RETRY_COUNT", DEFAULT_LOCK_RETRY_COUNT)?;
        let lock_retry_delay = Duration::from_millis(parse_or(
            vars,
            "RO_LOCK_RETRY_DELAY_MS",
            DEFAULT_LOCK_RETRY_DELAY_MS,
        )?);
        let lock_retry_jitter = Duration::from_millis(parse_or(
            vars,
            "RO_LOCK_RETRY_JITTER_MS",
            DEFAULT_LOCK_RETRY_JITTER_MS,
        )?);

        let monitor_interval = Duration::from_secs(parse_or(
            vars,
            "RO_MONITOR_INTERVAL_SECONDS",
            DEFAULT_MONITOR_INTERVAL_SECONDS,
        )?);
        let reaper_interval = Duration::from_secs(parse_or(
            vars,
            "RO_REAPER_INTERVAL_SECONDS",
            DEFAULT_REAPER_INTERVAL_SECONDS,
        )?);
        let stream_list_interval = Duration::from_secs(parse_or(
            vars,
            "RO_STREAM_LIST_INTERVAL_SECONDS",
            DEFAULT_STREAM_LIST_INTERVAL_SECONDS,
        )?);
        let relay_request_timeout = Duration::from_secs(parse_or(
            vars,
            "RO_RELAY_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_RELAY_REQUEST_TIMEOUT_SECONDS,
        )?);
        let relay_poll_timeout = Duration::from_secs(parse_or(
            vars,
            "RO_RELAY_POLL_TIMEOUT_SECONDS",
            DEFAULT_RELAY_POLL_TIMEOUT_SECONDS,
        )?);

        if monitor_interval.is_zero() || reaper_interval.is_zero() || stream_list_interval.is_zero()
        {
            return Err(ConfigError::InvalidValue(
                "task intervals must be greater than zero".to_string(),
            ));
        }

        let json_logs = vars
            .get("LOG_FORMAT")
            .is_some_and(|format| format.eq_ignore_ascii_case("json"));

        Ok(Config {
            redis_url,
            relay_instances,
            health_bind_address,
            registry_lock_ttl,
            lock_retry_count,
            lock_retry_delay,
            lock_retry_jitter,
            monitor_interval,
            reaper_interval,
            stream_list_interval,
            relay_request_timeout,
            relay_poll_timeout,
            json_logs,
        })
    }

    /// Enabled relay instances only.
    pub fn enabled_instances(&self) -> impl Iterator<Item = &RelayInstanceConfig> {
        self.relay_instances.iter().filter(|instance| instance.enabled)
    }
}

fn parse_relay_instances(raw: &str) -> Result<Vec<RelayInstanceConfig>, ConfigError> {
    let instances: Vec<RelayInstanceConfig> = serde_json::from_str(raw)
        .map_err(|e| ConfigError::InvalidValue(format!("RELAY_INSTANCES: {e}")))?;

    if let Some(blank) = instances.iter().find(|i| i.host.trim().is_empty()) {
        return Err(ConfigError::InvalidValue(format!(
            "RELAY_INSTANCES: instance with control_url {} has an empty host",
            blank.control_url
        )));
    }

    let mut seen = std::collections::HashSet::new();
    for instance in &instances {
        if !seen.insert(instance.host.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_INSTANCES: duplicate host {}",
                instance.host
            )));
        }
    }

    if !instances.iter().any(|i| i.enabled) {
        return Err(ConfigError::InvalidValue(
            "RELAY_INSTANCES: at least one enabled instance is required".to_string(),
        ));
    }

    Ok(instances)
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={value}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    const TWO_INSTANCES: &str = r#"[
        {"host": "relay-1", "control_url": "http://relay-1:8088", "event_url": "ws://relay-1:8188",
         "telemetry_url": "http://relay-1:9100/load", "secret": "janusrocks"},
        {"host": "relay-2", "control_url": "http://relay-2:8088", "event_url": "ws://relay-2:8188",
         "telemetry_url": "http://relay-2:9100/load", "enabled": false}
    ]"#;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "REDIS_URL".to_string(),
                "redis://:hunter2@localhost:6379".to_string(),
            ),
            ("RELAY_INSTANCES".to_string(), TWO_INSTANCES.to_string()),
        ])
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_vars(&base_vars()).unwrap();

        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.registry_lock_ttl, Duration::from_millis(1000));
        assert_eq!(config.lock_retry_count, 50);
        assert_eq!(config.lock_retry_delay, Duration::from_millis(200));
        assert_eq!(config.lock_retry_jitter, Duration::from_millis(200));
        assert_eq!(config.monitor_interval, Duration::from_secs(5));
        assert_eq!(config.reaper_interval, Duration::from_secs(1));
        assert_eq!(config.stream_list_interval, Duration::from_secs(5));
        assert!(!config.json_logs);
    }

    #[test]
    fn test_relay_instances_parsed() {
        let config = Config::from_vars(&base_vars()).unwrap();

        assert_eq!(config.relay_instances.len(), 2);
        let first = config.relay_instances.first().unwrap();
        assert_eq!(first.host, "relay-1");
        assert!(first.enabled, "enabled defaults to true");
        assert_eq!(
            first.secret.as_ref().unwrap().expose_secret(),
            "janusrocks"
        );

        let enabled: Vec<_> = config.enabled_instances().map(|i| i.host.as_str()).collect();
        assert_eq!(enabled, vec!["relay-1"]);
    }

    #[test]
    fn test_custom_values() {
        let mut vars = base_vars();
        vars.insert("RO_HEALTH_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert("RO_REGISTRY_LOCK_TTL_MS".to_string(), "2500".to_string());
        vars.insert("RO_LOCK_RETRY_COUNT".to_string(), "3".to_string());
        vars.insert("RO_MONITOR_INTERVAL_SECONDS".to_string(), "2".to_string());
        vars.insert("LOG_FORMAT".to_string(), "JSON".to_string());

        let config = Config::from_vars(&vars).unwrap();

        assert_eq!(config.health_bind_address, "127.0.0.1:9000");
        assert_eq!(config.registry_lock_ttl, Duration::from_millis(2500));
        assert_eq!(config.lock_retry_count, 3);
        assert_eq!(config.monitor_interval, Duration::from_secs(2));
        assert!(config.json_logs);
    }

    #[test]
    fn test_missing_required_vars() {
        let mut vars = base_vars();
        vars.remove("REDIS_URL");
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::MissingEnvVar(name)) if name == "REDIS_URL"
        ));

        let mut vars = base_vars();
        vars.remove("RELAY_INSTANCES");
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::MissingEnvVar(name)) if name == "RELAY_INSTANCES"
        ));
    }

    #[test]
    fn test_invalid_numeric_value_rejected() {
        let mut vars = base_vars();
        vars.insert("RO_LOCK_RETRY_COUNT".to_string(), "many".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut vars = base_vars();
        vars.insert("RO_REAPER_INTERVAL_SECONDS".to_string(), "0".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_instance_list_validation() {
        let mut vars = base_vars();
        vars.insert("RELAY_INSTANCES".to_string(), "not json".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        vars.insert(
            "RELAY_INSTANCES".to_string(),
            r#"[{"host": "relay-1", "control_url": "a", "event_url": "b", "telemetry_url": "c", "enabled": false}]"#
                .to_string(),
        );
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("enabled")
        ));

        vars.insert(
            "RELAY_INSTANCES".to_string(),
            r#"[{"host": "relay-1", "control_url": "a", "event_url": "b", "telemetry_url": "c"},
                {"host": "relay-1", "control_url": "d", "event_url": "e", "telemetry_url": "f"}]"#
                .to_string(),
        );
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug = format!("{config:?}");

        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("janusrocks"));
        assert!(debug.contains("relay-1"));
    }
}
