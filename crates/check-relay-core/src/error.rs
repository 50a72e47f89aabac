//! Domain error types for the check relay.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use std::fmt;

use thiserror::Error;

use crate::protocol::CloseArgs;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A present key holds a value of the wrong JSON type.
    #[error("setting '{key}' must be {expected}, got {found}")]
    Type {
        key: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    /// A value has the right type but fails its semantic check.
    #[error("setting '{key}' has invalid value {value}: {reason}")]
    Value {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// The document root is not an object.
    #[error("config document must be an object, got {found}")]
    NotAnObject { found: &'static str },

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse JSON configuration.
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The connect or transfer step an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Socket,
    Login,
    ChannelOpen,
    ExchangeDeclare,
    QueueDeclare,
    QueueBind,
    BasicConsume,
    ChannelClose,
    ConnectionClose,
    Publish,
    Consume,
}

impl Step {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Login => "login",
            Self::ChannelOpen => "channel_open",
            Self::ExchangeDeclare => "exchange_declare",
            Self::QueueDeclare => "queue_declare",
            Self::QueueBind => "queue_bind",
            Self::BasicConsume => "basic_consume",
            Self::ChannelClose => "channel_close",
            Self::ConnectionClose => "connection_close",
            Self::Publish => "publish",
            Self::Consume => "consume",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the broker closed the whole connection or just the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseScope {
    Connection,
    Channel,
}

impl fmt::Display for CloseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => f.write_str("connection"),
            Self::Channel => f.write_str("channel"),
        }
    }
}

/// A close reply sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerReply {
    pub scope: CloseScope,
    pub code: u16,
    pub text: String,
    /// Class of the method that caused the close, 0 if none.
    pub class_id: u16,
    pub method_id: u16,
}

impl fmt::Display for BrokerReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} closed by server: {} {}",
            self.scope, self.code, self.text
        )
    }
}

/// Errors that occur while talking to the broker.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Socket-level failure; recoverable by reconnecting.
    #[error("{step}: transport error: {source}")]
    Transport {
        step: Step,
        #[source]
        source: std::io::Error,
    },

    /// The peer sent something the protocol does not allow here.
    #[error("{step}: protocol error: {message}")]
    Protocol { step: Step, message: String },

    /// The broker closed the connection or channel.
    #[error("{step}: {reply}")]
    BrokerReply { step: Step, reply: BrokerReply },

    /// A message could not be transmitted.
    #[error("publish failed: {message}")]
    Publish { message: String },

    /// The role has no live broker connection.
    #[error("not connected to broker")]
    NotConnected,

    /// Shutdown signal received.
    #[error("relay shutting down")]
    Shutdown,
}

impl RelayError {
    /// The step this error was raised in, if it carries one.
    #[must_use]
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Transport { step, .. }
            | Self::Protocol { step, .. }
            | Self::BrokerReply { step, .. } => Some(*step),
            Self::Publish { .. } => Some(Step::Publish),
            Self::NotConnected | Self::Shutdown => None,
        }
    }

    pub(crate) fn protocol(step: Step, message: impl Into<String>) -> Self {
        Self::Protocol {
            step,
            message: message.into(),
        }
    }

    pub(crate) fn transport(step: Step, source: std::io::Error) -> Self {
        Self::Transport { step, source }
    }

    /// Classify a frame read failure: undecodable input is a protocol error,
    /// anything else a transport error.
    pub(crate) fn from_read(step: Step, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::InvalidData {
            Self::protocol(step, source.to_string())
        } else {
            Self::Transport { step, source }
        }
    }

    pub(crate) fn eof(step: Step) -> Self {
        Self::Transport {
            step,
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by broker",
            ),
        }
    }

    /// A copy of this error for a second receiver. I/O sources keep their
    /// kind and message only.
    #[must_use]
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Transport { step, source } => Self::Transport {
                step: *step,
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Self::Protocol { step, message } => Self::protocol(*step, message.clone()),
            Self::BrokerReply { step, reply } => Self::BrokerReply {
                step: *step,
                reply: reply.clone(),
            },
            Self::Publish { message } => Self::Publish {
                message: message.clone(),
            },
            Self::NotConnected => Self::NotConnected,
            Self::Shutdown => Self::Shutdown,
        }
    }

    /// Build the error for a close method sent by the broker.
    pub(crate) fn closed_by_broker(step: Step, scope: CloseScope, args: &CloseArgs) -> Self {
        Self::BrokerReply {
            step,
            reply: BrokerReply {
                scope,
                code: args.reply_code,
                text: args.reply_text.clone(),
                class_id: args.class_id,
                method_id: args.method_id,
            },
        }
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Value {
            key: "retry_wait_time",
            value: "45".to_string(),
            reason: "must be between 1 and 30".to_string(),
        };
        assert!(err.to_string().contains("retry_wait_time"));
        assert!(err.to_string().contains("45"));
    }

    #[test]
    fn test_broker_reply_display() {
        let err = RelayError::BrokerReply {
            step: Step::Login,
            reply: BrokerReply {
                scope: CloseScope::Connection,
                code: 403,
                text: "ACCESS_REFUSED".to_string(),
                class_id: 0,
                method_id: 0,
            },
        };
        let rendered = err.to_string();
        assert!(rendered.starts_with("login:"));
        assert!(rendered.contains("403"));
        assert!(rendered.contains("ACCESS_REFUSED"));
    }

    #[test]
    fn test_step_is_reported() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let err = RelayError::transport(Step::Socket, io_err);
        assert_eq!(err.step(), Some(Step::Socket));
        assert_eq!(RelayError::NotConnected.step(), None);
    }

    #[test]
    fn test_duplicate_keeps_kind() {
        let err = RelayError::eof(Step::Publish);
        match err.duplicate() {
            RelayError::Transport { step, source } => {
                assert_eq!(step, Step::Publish);
                assert_eq!(source.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
