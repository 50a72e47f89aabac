//! Table-driven parsing of an untyped settings document.
//!
//! Each recognized key is described by a [`SettingSpec`]: its name, the JSON
//! type it must have, where the converted value is stored and an optional
//! semantic check. [`apply`] walks the table in order, so the first offending
//! key in table order is the one reported.

use std::ops::RangeInclusive;

use glob::Pattern;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::types::{BoundedString, PatternList};
use super::RelayConfig;
use crate::error::{ConfigError, ConfigResult};

/// Semantic check run on a converted string value.
pub type StringCheck = fn(&str) -> std::result::Result<(), String>;

/// Expected type, destination and checks for one setting.
pub enum SettingKind {
    String {
        field: fn(&mut RelayConfig) -> &mut BoundedString,
        check: Option<StringCheck>,
    },
    Integer {
        range: RangeInclusive<i64>,
        store: fn(&mut RelayConfig, i64),
    },
    Boolean {
        field: fn(&mut RelayConfig) -> &mut bool,
    },
    PatternList {
        field: fn(&mut RelayConfig) -> &mut PatternList,
    },
}

impl SettingKind {
    fn expected(&self) -> &'static str {
        match self {
            Self::String { .. } => "a string",
            Self::Integer { .. } => "an integer",
            Self::Boolean { .. } => "a boolean",
            Self::PatternList { .. } => "an array",
        }
    }
}

/// One entry of the settings table.
pub struct SettingSpec {
    pub name: &'static str,
    pub kind: SettingKind,
}

const EXCHANGE_KINDS: &[&str] = &["direct", "fanout", "topic", "headers"];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Names sent to the broker travel as short strings.
const MAX_NAME_LEN: usize = u8::MAX as usize;

fn check_name_len(value: &str) -> std::result::Result<(), String> {
    if value.len() <= MAX_NAME_LEN {
        Ok(())
    } else {
        Err(format!("{} bytes long, at most {MAX_NAME_LEN} allowed", value.len()))
    }
}

fn check_exchange_kind(value: &str) -> std::result::Result<(), String> {
    if EXCHANGE_KINDS.contains(&value) {
        Ok(())
    } else {
        Err(format!("expected one of {}", EXCHANGE_KINDS.join(", ")))
    }
}

fn check_log_level(value: &str) -> std::result::Result<(), String> {
    if LOG_LEVELS.contains(&value.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(format!("expected one of {}", LOG_LEVELS.join(", ")))
    }
}

/// Every recognized setting, in the order they are parsed.
pub static SETTINGS: &[SettingSpec] = &[
    SettingSpec {
        name: "host",
        kind: SettingKind::String {
            field: |c| &mut c.host,
            check: None,
        },
    },
    SettingSpec {
        name: "port",
        kind: SettingKind::Integer {
            range: 1..=65535,
            store: |c, v| c.port = v as u16,
        },
    },
    SettingSpec {
        name: "vhost",
        kind: SettingKind::String {
            field: |c| &mut c.vhost,
            check: Some(check_name_len),
        },
    },
    SettingSpec {
        name: "user",
        kind: SettingKind::String {
            field: |c| &mut c.user,
            check: None,
        },
    },
    SettingSpec {
        name: "password",
        kind: SettingKind::String {
            field: |c| &mut c.password,
            check: None,
        },
    },
    SettingSpec {
        name: "publisher_exchange",
        kind: SettingKind::String {
            field: |c| &mut c.publisher_exchange,
            check: Some(check_name_len),
        },
    },
    SettingSpec {
        name: "publisher_exchange_type",
        kind: SettingKind::String {
            field: |c| &mut c.publisher_exchange_type,
            check: Some(check_exchange_kind),
        },
    },
    SettingSpec {
        name: "publisher_routing_key",
        kind: SettingKind::String {
            field: |c| &mut c.publisher_routing_key,
            check: Some(check_name_len),
        },
    },
    SettingSpec {
        name: "consumer_exchange",
        kind: SettingKind::String {
            field: |c| &mut c.consumer_exchange,
            check: Some(check_name_len),
        },
    },
    SettingSpec {
        name: "consumer_exchange_type",
        kind: SettingKind::String {
            field: |c| &mut c.consumer_exchange_type,
            check: Some(check_exchange_kind),
        },
    },
    SettingSpec {
        name: "consumer_queue",
        kind: SettingKind::String {
            field: |c| &mut c.consumer_queue,
            check: Some(check_name_len),
        },
    },
    SettingSpec {
        name: "consumer_binding_key",
        kind: SettingKind::String {
            field: |c| &mut c.consumer_binding_key,
            check: Some(check_name_len),
        },
    },
    SettingSpec {
        name: "local_hostgroups",
        kind: SettingKind::PatternList {
            field: |c| &mut c.local_hostgroups,
        },
    },
    SettingSpec {
        name: "local_servicegroups",
        kind: SettingKind::PatternList {
            field: |c| &mut c.local_servicegroups,
        },
    },
    SettingSpec {
        name: "retry_wait_time",
        kind: SettingKind::Integer {
            range: 1..=30,
            store: |c, v| c.retry_wait_time = v as u64,
        },
    },
    SettingSpec {
        name: "debug",
        kind: SettingKind::Boolean {
            field: |c| &mut c.debug,
        },
    },
    SettingSpec {
        name: "log_level",
        kind: SettingKind::String {
            field: |c| &mut c.log_level,
            check: Some(check_log_level),
        },
    },
    SettingSpec {
        name: "log_json",
        kind: SettingKind::Boolean {
            field: |c| &mut c.log_json,
        },
    },
];

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "an integer",
        Value::Number(_) => "a float",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl SettingSpec {
    /// Type-check, convert, validate and store one value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Type`] on a type mismatch and
    /// [`ConfigError::Value`] when the semantic check fails.
    pub fn apply(&self, config: &mut RelayConfig, value: &Value) -> ConfigResult<()> {
        let type_error = || ConfigError::Type {
            key: self.name,
            expected: self.kind.expected(),
            found: json_kind(value),
        };

        match &self.kind {
            SettingKind::String { field, check } => {
                let raw = value.as_str().ok_or_else(type_error)?;
                if BoundedString::would_truncate(raw) {
                    warn!(key = self.name, len = raw.len(), "setting value truncated");
                }
                let converted = BoundedString::new(raw);
                if let Some(check) = check {
                    check(converted.as_str()).map_err(|reason| ConfigError::Value {
                        key: self.name,
                        value: format!("{:?}", converted.as_str()),
                        reason,
                    })?;
                }
                *field(config) = converted;
            }
            SettingKind::Integer { range, store } => {
                let raw = match value {
                    Value::Number(n) => n.as_i64().ok_or_else(type_error)?,
                    _ => return Err(type_error()),
                };
                if !range.contains(&raw) {
                    return Err(ConfigError::Value {
                        key: self.name,
                        value: raw.to_string(),
                        reason: format!(
                            "must be between {} and {}",
                            range.start(),
                            range.end()
                        ),
                    });
                }
                store(config, raw);
            }
            SettingKind::Boolean { field } => {
                *field(config) = value.as_bool().ok_or_else(type_error)?;
            }
            SettingKind::PatternList { field } => {
                let items = value.as_array().ok_or_else(type_error)?;
                if items.is_empty() {
                    debug!(key = self.name, "empty pattern list, leaving setting unchanged");
                    return Ok(());
                }
                *field(config) = self.compile_patterns(items);
            }
        }

        Ok(())
    }

    fn compile_patterns(&self, items: &[Value]) -> PatternList {
        let mut patterns = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let Some(source) = item.as_str() else {
                warn!(
                    key = self.name,
                    index,
                    found = json_kind(item),
                    "skipping non-string pattern entry"
                );
                continue;
            };
            match Pattern::new(source) {
                Ok(pattern) => patterns.push(pattern),
                Err(e) => warn!(
                    key = self.name,
                    index,
                    pattern = source,
                    error = %e,
                    "skipping invalid pattern entry"
                ),
            }
        }

        if patterns.is_empty() {
            warn!(
                key = self.name,
                entries = items.len(),
                "no usable pattern in list, setting cleared"
            );
        }
        PatternList::new(patterns)
    }
}

/// Apply every recognized key of `document` to `config`.
///
/// The document is applied to a working copy which replaces `config` only if
/// every present key passes; on error `config` is left untouched. Keys missing
/// from the document keep their current values. Unknown keys are ignored.
///
/// # Errors
///
/// Returns the error of the first offending key in table order.
pub fn apply(config: &mut RelayConfig, document: &Map<String, Value>) -> ConfigResult<()> {
    let mut staged = config.clone();

    for spec in SETTINGS {
        if let Some(value) = document.get(spec.name) {
            spec.apply(&mut staged, value)?;
        }
    }

    for key in document.keys() {
        if !SETTINGS.iter().any(|spec| spec.name == key) {
            debug!(key = %key, "ignoring unknown setting");
        }
    }

    *config = staged;
    Ok(())
}
