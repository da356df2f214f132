//! Application configuration
//!
//! Centralized configuration management with environment variable support
//! and sensible defaults.

use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Persistence configuration
    pub persistence: PersistenceConfig,
    /// Timeouts and retries for conversation sessions
    pub session: SessionConfig,
    /// Bridged-mode reply polling
    pub polling: PollingConfig,
    /// External gateway process
    pub bridge: BridgeConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind the server to
    pub port: u16,
    /// Host address to bind to
    pub host: String,
}

/// Persistence configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Path of the SQLite database file
    pub database_path: String,
}

/// Timeouts and retry budget applied to remote calls made by a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Upper bound for a single store or feed call
    pub request_timeout: Duration,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry
    pub retry_backoff: Duration,
    /// `list()` cadence while the change feed is disconnected
    pub resync_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            max_retries: 1,
            retry_backoff: Duration::from_millis(250),
            resync_interval: Duration::from_secs(5),
        }
    }
}

/// Reply polling for bridged conversations
#[derive(Debug, Clone, PartialEq)]
pub struct PollingConfig {
    /// Time between two `fetch_latest_reply` calls
    pub interval: Duration,
    /// Give up waiting after this long; `None` waits indefinitely
    pub max_wait: Option<Duration>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            max_wait: None,
        }
    }
}

/// External gateway configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Executable that speaks the gateway JSON-lines protocol
    pub gateway_command: String,
    /// Arguments passed to the gateway executable
    pub gateway_args: Vec<String>,
    /// Participant recorded as the operator side of bridged conversations
    pub operator_label: String,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let session_defaults = SessionConfig::default();
        let polling_defaults = PollingConfig::default();

        Self {
            server: ServerConfig {
                port: env_parse("PORT").unwrap_or(8080),
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            },
            persistence: PersistenceConfig {
                database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| {
                    if let Some(home) = env::var_os("HOME") {
                        format!("{}/.conversation-relay/chat.db", home.to_string_lossy())
                    } else {
                        ".conversation-relay/chat.db".to_string()
                    }
                }),
            },
            session: SessionConfig {
                request_timeout: env_parse("REQUEST_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(session_defaults.request_timeout),
                max_retries: env_parse("MAX_RETRIES").unwrap_or(session_defaults.max_retries),
                retry_backoff: env_parse("RETRY_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(session_defaults.retry_backoff),
                resync_interval: env_parse("RESYNC_INTERVAL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(session_defaults.resync_interval),
            },
            polling: PollingConfig {
                interval: env_parse("POLL_INTERVAL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(polling_defaults.interval),
                max_wait: env_parse("POLL_MAX_WAIT_SECS").map(Duration::from_secs),
            },
            bridge: BridgeConfig {
                gateway_command: env::var("BRIDGE_GATEWAY_CMD")
                    .unwrap_or_else(|_| "node".to_string()),
                gateway_args: env::var("BRIDGE_GATEWAY_ARGS")
                    .map(|args| args.split_whitespace().map(String::from).collect())
                    .unwrap_or_else(|_| vec!["bridge/gateway.js".to_string()]),
                operator_label: env::var("BRIDGE_OPERATOR_LABEL")
                    .unwrap_or_else(|_| "operator".to_string()),
            },
        }
    }

    /// Get the server address as a string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "PORT",
        "HOST",
        "REQUEST_TIMEOUT_SECS",
        "MAX_RETRIES",
        "POLL_INTERVAL_MS",
        "POLL_MAX_WAIT_SECS",
        "BRIDGE_GATEWAY_ARGS",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server_addr(), "0.0.0.0:8080");
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.polling.interval, Duration::from_secs(2));
        assert_eq!(config.polling.max_wait, None);
        assert_eq!(config.bridge.gateway_args, vec!["bridge/gateway.js"]);
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        clear_env();
        env::set_var("PORT", "9090");
        env::set_var("REQUEST_TIMEOUT_SECS", "20");
        env::set_var("MAX_RETRIES", "3");
        env::set_var("POLL_MAX_WAIT_SECS", "600");
        env::set_var("BRIDGE_GATEWAY_ARGS", "gateway.js --channel whatsapp");

        let config = Config::from_env();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.session.request_timeout, Duration::from_secs(20));
        assert_eq!(config.session.max_retries, 3);
        assert_eq!(config.polling.max_wait, Some(Duration::from_secs(600)));
        assert_eq!(
            config.bridge.gateway_args,
            vec!["gateway.js", "--channel", "whatsapp"]
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back_to_defaults() {
        clear_env();
        env::set_var("PORT", "not-a-port");
        env::set_var("POLL_INTERVAL_MS", "-5");

        let config = Config::from_env();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.polling.interval, Duration::from_secs(2));
        clear_env();
    }
}
