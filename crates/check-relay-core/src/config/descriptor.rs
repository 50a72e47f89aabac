//! Per-role connection parameters derived from [`RelayConfig`].

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use super::RelayConfig;

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for a reply to a synchronous method.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to open one broker connection and declare its exchange.
///
/// A snapshot built per connect attempt; later config changes do not affect
/// an attempt in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub exchange: String,
    /// Exchange type: direct, fanout, topic or headers.
    pub exchange_kind: String,
    /// Log connection milestones at info instead of debug.
    pub debug: bool,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl ConnectionDescriptor {
    /// `host:port` for log output.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Queue topology declared by the consumer role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    /// Queue name; `None` asks the broker for a server-named exclusive queue.
    pub queue: Option<String>,
    pub binding_key: String,
}

impl RelayConfig {
    /// Descriptor for the connection that publishes check requests.
    #[must_use]
    pub fn publisher_descriptor(&self) -> ConnectionDescriptor {
        self.descriptor(
            self.publisher_exchange.as_str(),
            self.publisher_exchange_type.as_str(),
        )
    }

    /// Descriptor for the connection that consumes check results.
    #[must_use]
    pub fn consumer_descriptor(&self) -> ConnectionDescriptor {
        self.descriptor(
            self.consumer_exchange.as_str(),
            self.consumer_exchange_type.as_str(),
        )
    }

    /// Queue declaration and binding for the consumer role.
    #[must_use]
    pub fn queue_binding(&self) -> QueueBinding {
        QueueBinding {
            queue: (!self.consumer_queue.is_empty()).then(|| self.consumer_queue.to_string()),
            binding_key: self.consumer_binding_key.to_string(),
        }
    }

    fn descriptor(&self, exchange: &str, exchange_kind: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: self.host.to_string(),
            port: self.port,
            vhost: self.vhost.to_string(),
            user: expand_env_vars(&self.user),
            password: expand_env_vars(&self.password),
            exchange: exchange.to_string(),
            exchange_kind: exchange_kind.to_string(),
            debug: self.debug,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();
    let re = ENV_VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
    });
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_descriptors_use_their_exchange() {
        let mut config = RelayConfig::default();
        config.publisher_exchange = "requests".into();
        config.consumer_exchange = "results".into();
        config.consumer_exchange_type = "topic".into();

        let publisher = config.publisher_descriptor();
        let consumer = config.consumer_descriptor();
        assert_eq!(publisher.exchange, "requests");
        assert_eq!(publisher.exchange_kind, "direct");
        assert_eq!(consumer.exchange, "results");
        assert_eq!(consumer.exchange_kind, "topic");
        assert_eq!(publisher.address(), "localhost:5672");
    }

    #[test]
    fn test_queue_binding() {
        let mut config = RelayConfig::default();
        let binding = config.queue_binding();
        assert_eq!(binding.queue.as_deref(), Some("check_results"));
        assert_eq!(binding.binding_key, "check_results");

        config.consumer_queue = "".into();
        assert_eq!(config.queue_binding().queue, None);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("CHECK_RELAY_TEST_USER", "monitor");
        let mut config = RelayConfig::default();
        config.user = "${CHECK_RELAY_TEST_USER}".into();
        config.password = "${CHECK_RELAY_TEST_UNSET_VAR}".into();

        let desc = config.publisher_descriptor();
        assert_eq!(desc.user, "monitor");
        assert_eq!(desc.password, "");
    }
}
