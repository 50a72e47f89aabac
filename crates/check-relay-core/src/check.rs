//! Check request and check result messages.
//!
//! Requests are published as compact JSON objects tagged with `"type"`;
//! results come back as JSON objects keyed by host name and, for service
//! checks, a non-empty service description.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::broker::MessageEnvelope;

/// Service state reported for a check nobody answered.
pub const STATE_CRITICAL: i32 = 2;

/// Host state reported for a check nobody answered.
pub const HOST_UNREACHABLE: i32 = 2;

/// Output of a check result synthesized for an orphaned check.
pub const ORPHANED_OUTPUT: &str = "check is orphaned (no workers running?)";

/// Seconds and microseconds since the Unix epoch.
///
/// Encoded on the wire as fractional seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    pub secs: i64,
    pub micros: u32,
}

impl Timestamp {
    #[must_use]
    pub fn new(secs: i64, micros: u32) -> Self {
        Self {
            secs: secs + i64::from(micros / 1_000_000),
            micros: micros % 1_000_000,
        }
    }

    #[must_use]
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Nearest timestamp to `seconds`, rounded to the microsecond.
    #[must_use]
    pub fn from_secs_f64(seconds: f64) -> Self {
        let secs = seconds.floor();
        let micros = ((seconds - secs) * 1_000_000.0).round() as u32;
        Self::new(secs as i64, micros)
    }

    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + f64::from(self.micros) / 1_000_000.0
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Self::new(since.as_secs() as i64, since.subsec_micros()),
            Err(e) => {
                let before = e.duration();
                let mut ts = Self::new(-(before.as_secs() as i64), 0);
                if before.subsec_micros() > 0 {
                    ts.secs -= 1;
                    ts.micros = 1_000_000 - before.subsec_micros();
                }
                ts
            }
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        let micros = Duration::from_micros(u64::from(ts.micros));
        if ts.secs >= 0 {
            UNIX_EPOCH + Duration::from_secs(ts.secs as u64) + micros
        } else {
            UNIX_EPOCH - Duration::from_secs(ts.secs.unsigned_abs()) + micros
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_secs_f64())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        if !seconds.is_finite() {
            return Err(serde::de::Error::custom("timestamp must be finite"));
        }
        Ok(Self::from_secs_f64(seconds))
    }
}

/// Whether a check targets a host or one of its services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Host,
    Service,
}

/// A check to be executed by a remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    #[serde(rename = "type")]
    pub kind: CheckKind,
    pub host_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_description: Option<String>,
    pub command_line: String,
    pub check_options: i32,
    pub start_time: Timestamp,
    pub latency: f64,
    /// Seconds the worker may spend on the check.
    pub timeout: u32,
}

impl CheckRequest {
    #[must_use]
    pub fn host(host_name: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            kind: CheckKind::Host,
            host_name: host_name.into(),
            service_description: None,
            command_line: command_line.into(),
            check_options: 0,
            start_time: Timestamp::now(),
            latency: 0.0,
            timeout: 30,
        }
    }

    #[must_use]
    pub fn service(
        host_name: impl Into<String>,
        service_description: impl Into<String>,
        command_line: impl Into<String>,
    ) -> Self {
        Self {
            kind: CheckKind::Service,
            service_description: Some(service_description.into()),
            ..Self::host(host_name, command_line)
        }
    }

    /// Identifier the result is expected to carry back.
    ///
    /// djb2 over the host name, service description and start time,
    /// printed as upper-case hex.
    #[must_use]
    pub fn correlation_id(&self) -> String {
        let key = format!(
            "{}{}{}.{}",
            self.host_name,
            self.service_description.as_deref().unwrap_or(""),
            self.start_time.secs,
            self.start_time.micros
        );
        format!("{:X}", djb2(key.as_bytes()))
    }

    /// Message publishing this request under `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be serialized.
    pub fn to_envelope(
        &self,
        routing_key: &str,
        reply_to: Option<&str>,
    ) -> Result<MessageEnvelope, serde_json::Error> {
        let body = serde_json::to_vec(self)?;
        let envelope = MessageEnvelope::json(routing_key, self.correlation_id(), Bytes::from(body));
        Ok(match reply_to {
            Some(reply_to) => envelope.with_reply_to(reply_to),
            None => envelope,
        })
    }
}

fn djb2(data: &[u8]) -> u64 {
    data.iter().fold(5381u64, |hash, &c| {
        hash.wrapping_mul(33).wrapping_add(u64::from(c))
    })
}

/// The outcome of a check as reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub host_name: String,
    /// `None` for host checks. An empty string counts as absent.
    #[serde(
        default,
        deserialize_with = "non_empty_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub service_description: Option<String>,
    pub return_code: i32,
    pub start_time: Timestamp,
    pub finish_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_options: Option<i32>,
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "Option::is_none")]
    pub scheduled_check: Option<bool>,
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "Option::is_none")]
    pub reschedule_check: Option<bool>,
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "Option::is_none")]
    pub exited_ok: Option<bool>,
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "Option::is_none")]
    pub early_timeout: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
}

impl CheckResult {
    /// Parse a result message body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not JSON or a required field is
    /// missing or mistyped.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    #[must_use]
    pub fn is_service_check(&self) -> bool {
        self.service_description.is_some()
    }

    /// Result recorded for a check that no worker picked up.
    #[must_use]
    pub fn orphaned(host_name: impl Into<String>, service_description: Option<String>) -> Self {
        let now = Timestamp::now();
        let return_code = if service_description.is_some() {
            STATE_CRITICAL
        } else {
            HOST_UNREACHABLE
        };
        Self {
            host_name: host_name.into(),
            service_description,
            return_code,
            start_time: now,
            finish_time: now,
            output: Some(ORPHANED_OUTPUT.to_string()),
            check_options: Some(0),
            scheduled_check: Some(true),
            reschedule_check: Some(true),
            exited_ok: Some(true),
            early_timeout: Some(false),
            latency: Some(0.0),
        }
    }
}

fn non_empty_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Flags are sent as integers by most workers; booleans are accepted too.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(Option::<Flag>::deserialize(deserializer)?.map(|flag| match flag {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    }))
}
