//! Configuration for the check relay.
//!
//! Settings arrive as an untyped JSON (or YAML) document and are parsed into a
//! typed [`RelayConfig`] by the table in [`schema`]. Connection descriptors for
//! the publisher and consumer roles are derived from the config on every
//! connect attempt.

mod descriptor;
pub mod schema;
pub mod types;

use std::path::Path;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{ConfigError, ConfigResult};

pub use descriptor::{ConnectionDescriptor, QueueBinding};
pub use types::{BoundedString, PatternList, MAX_STRING_LEN};

/// Default broker port.
pub const DEFAULT_PORT: u16 = 5672;

/// Default seconds between reconnect attempts.
pub const DEFAULT_RETRY_WAIT_SECS: u64 = 3;

/// Root configuration for the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Broker host name or address.
    pub host: BoundedString,
    pub port: u16,
    pub vhost: BoundedString,
    /// Login user. Supports environment variable expansion: "${AMQP_USER}"
    pub user: BoundedString,
    /// Login password. Supports environment variable expansion: "${AMQP_PASSWORD}"
    pub password: BoundedString,

    /// Exchange check requests are published to.
    pub publisher_exchange: BoundedString,
    pub publisher_exchange_type: BoundedString,
    /// Default routing key for published check requests.
    pub publisher_routing_key: BoundedString,

    /// Exchange check results are consumed from.
    pub consumer_exchange: BoundedString,
    pub consumer_exchange_type: BoundedString,
    /// Queue name; empty means a server-named exclusive queue.
    pub consumer_queue: BoundedString,
    /// Key the consumer queue is bound with. Also sent as reply-to on publish.
    pub consumer_binding_key: BoundedString,

    /// Hostgroups whose checks are dispatched through the broker.
    pub local_hostgroups: PatternList,
    /// Servicegroups whose checks are dispatched through the broker.
    pub local_servicegroups: PatternList,

    /// Seconds to wait between reconnect attempts (1-30).
    pub retry_wait_time: u64,
    /// Log connection milestones at info instead of debug.
    pub debug: bool,

    /// Log level: trace, debug, info, warn, error.
    pub log_level: BoundedString,
    /// Output logs in JSON format.
    pub log_json: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            vhost: "/".into(),
            user: "guest".into(),
            password: "guest".into(),
            publisher_exchange: "checks".into(),
            publisher_exchange_type: "direct".into(),
            publisher_routing_key: "checks".into(),
            consumer_exchange: "checks".into(),
            consumer_exchange_type: "direct".into(),
            consumer_queue: "check_results".into(),
            consumer_binding_key: "check_results".into(),
            local_hostgroups: PatternList::default(),
            local_servicegroups: PatternList::default(),
            retry_wait_time: DEFAULT_RETRY_WAIT_SECS,
            debug: false,
            log_level: "info".into(),
            log_json: false,
        }
    }
}

// Configuration loading

impl RelayConfig {
    /// Load configuration from a file.
    ///
    /// Files ending in `.yaml` or `.yml` are read as YAML, anything else as
    /// JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if any
    /// setting fails validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        if is_yaml {
            Self::from_yaml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    /// Load configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        let value: Value = serde_json::from_str(content)?;
        Self::from_value(&value)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let value: Value = serde_yaml::from_str(content)?;
        Self::from_value(&value)
    }

    /// Build a configuration from defaults plus the keys present in `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not an object or a setting is invalid.
    pub fn from_value(value: &Value) -> ConfigResult<Self> {
        let document = value.as_object().ok_or(ConfigError::NotAnObject {
            found: match value {
                Value::Null => "null",
                Value::Bool(_) => "a boolean",
                Value::Number(_) => "a number",
                Value::String(_) => "a string",
                Value::Array(_) => "an array",
                Value::Object(_) => "an object",
            },
        })?;

        let mut config = Self::default();
        config.apply(document)?;
        Ok(config)
    }

    /// Apply the keys present in `document` on top of this configuration.
    ///
    /// # Errors
    ///
    /// Returns the first failing setting; `self` is unchanged in that case.
    pub fn apply(&mut self, document: &Map<String, Value>) -> ConfigResult<()> {
        schema::apply(self, document)
    }

    /// Time to wait between reconnect attempts.
    #[must_use]
    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.host.as_str(), "localhost");
        assert_eq!(config.port, 5672);
        assert_eq!(config.vhost.as_str(), "/");
        assert_eq!(config.user.as_str(), "guest");
        assert_eq!(config.retry_wait(), Duration::from_secs(3));
        assert!(!config.debug);
    }

    #[test]
    fn test_parse_json() {
        let config = RelayConfig::from_json_str(
            r#"{
                "host": "rabbit",
                "port": 5671,
                "consumer_queue": "",
                "local_hostgroups": ["linux-*"],
                "retry_wait_time": 5
            }"#,
        )
        .unwrap();

        assert_eq!(config.host.as_str(), "rabbit");
        assert_eq!(config.port, 5671);
        assert!(config.consumer_queue.is_empty());
        assert!(config.local_hostgroups.matches_any("linux-web"));
        assert_eq!(config.retry_wait_time, 5);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
host: rabbit.example.com
debug: true
local_servicegroups:
  - "http-*"
"#;
        let config = RelayConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.host.as_str(), "rabbit.example.com");
        assert!(config.debug);
        assert_eq!(config.local_servicegroups.sources(), vec!["http-*"]);
    }

    #[test]
    fn test_root_must_be_object() {
        let err = RelayConfig::from_json_str("[1, 2]").unwrap_err();
        assert!(matches!(err, ConfigError::NotAnObject { found: "an array" }));
    }

    #[test]
    fn test_invalid_json() {
        let err = RelayConfig::from_json_str("{ host: ").unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_from_file_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("relay.json");
        let mut file = std::fs::File::create(&json_path).unwrap();
        file.write_all(br#"{"port": 5700}"#).unwrap();
        assert_eq!(RelayConfig::from_file(&json_path).unwrap().port, 5700);

        let yaml_path = dir.path().join("relay.yml");
        std::fs::write(&yaml_path, "port: 5701\n").unwrap();
        assert_eq!(RelayConfig::from_file(&yaml_path).unwrap().port, 5701);
    }

    #[test]
    fn test_missing_file() {
        let err = RelayConfig::from_file("/nonexistent/relay.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
