use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Where the user-editable settings record (API key, users, fetch limit) lives.
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
}

/// Remote scrobbling service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Upper bound for a single user's request.  `None` leaves the request
    /// unbounded and relies on the transport to settle.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between scheduled cycles.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl PollConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs.max(1))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            settings_file: default_settings_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_socket_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
        }
    }
}

fn default_settings_file() -> PathBuf {
    platform::data_dir().join("settings.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8991
}

fn default_socket_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_base_url() -> String {
    "https://ws.audioscrobbler.com/2.0/".to_string()
}

fn default_user_agent() -> String {
    concat!("scrobble-daemon/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_timeout_secs() -> Option<u64> {
    Some(30)
}

// Roughly the length of "Golden Slumbers".
fn default_period_secs() -> u64 {
    91
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            socket: SocketConfig::default(),
            api: ApiConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8991);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.socket.port, platform::DAEMON_TCP_PORT);
        assert_eq!(config.socket.bind_address, "127.0.0.1");
        assert!(config.api.base_url.starts_with("https://"));
        assert_eq!(config.poll.period(), Duration::from_secs(91));
        assert!(config.daemon.settings_file.ends_with("scrobble/settings.json"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [poll]
            period_secs = 30

            [api]
            base_url = "http://127.0.0.1:9000/2.0/"
            "#,
        )
        .unwrap();
        assert_eq!(config.poll.period_secs, 30);
        assert_eq!(config.api.base_url, "http://127.0.0.1:9000/2.0/");
        assert_eq!(config.api.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.http.port, 8991);
    }

    #[test]
    fn test_socket_bind_address_is_separate_from_http() {
        let config: Config = toml::from_str(
            r#"
            [http]
            bind_address = "0.0.0.0"

            [socket]
            bind_address = "127.0.0.2"
            "#,
        )
        .unwrap();
        assert_eq!(config.http.bind_address, "0.0.0.0");
        assert_eq!(config.socket.bind_address, "127.0.0.2");
        assert_eq!(config.socket.port, platform::DAEMON_TCP_PORT);
    }

    #[test]
    fn test_zero_timeout_means_unbounded() {
        let api = ApiConfig {
            request_timeout_secs: Some(0),
            ..ApiConfig::default()
        };
        assert_eq!(api.request_timeout(), None);
    }
}
