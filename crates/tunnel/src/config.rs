use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::addr::Address;

/// Top-level configuration for both tunnel ends.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Relay server settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Sessions without traffic for this long are closed. 0 disables reaping.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_server_port(),
            session_timeout_secs: default_session_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl ServerConfig {
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_secs > 0).then(|| Duration::from_secs(self.session_timeout_secs))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Client relay settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Remote relay, `host:port`
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Intermediate HTTP proxy, `host:port`
    #[serde(default)]
    pub proxy: Option<String>,
    /// Retries of a write the relay reported as timed out
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            remote: default_remote(),
            proxy: None,
            write_retries: default_write_retries(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn remote_addr(&self) -> Result<Address> {
        self.remote
            .parse()
            .with_context(|| format!("Invalid remote relay address {:?}", self.remote))
    }

    pub fn proxy_addr(&self) -> Result<Option<Address>> {
        match self.proxy.as_deref() {
            None | Some("") => Ok(None),
            Some(p) => p
                .parse()
                .map(Some)
                .with_context(|| format!("Invalid proxy address {:?}", p)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Protocol timing.
///
/// Defaults follow the wire protocol:
/// - Read/write readiness wait: 5s
/// - Downlink poll interval after an empty read: 1s
/// - Local connection idle timeout: 20s
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// 0 disables the idle timeout
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            poll_interval_ms: default_poll_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl TimingConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    9999
}
fn default_session_timeout() -> u64 {
    300
}
fn default_cleanup_interval() -> u64 {
    60
}
fn default_listen_port() -> u16 {
    8889
}
fn default_remote() -> String {
    "localhost:9999".to_string()
}
fn default_write_retries() -> u32 {
    3
}
fn default_request_timeout() -> u64 {
    15 // must exceed the relay's read timeout
}
fn default_read_timeout() -> u64 {
    5
}
fn default_write_timeout() -> u64 {
    5
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_idle_timeout() -> u64 {
    20
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/httptunnel/config.toml",
            "~/.httptunnel/config.toml",
            "./httptunnel.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_protocol() {
        let config = Config::default();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.client.listen_port, 8889);
        assert_eq!(config.client.remote_addr().unwrap(), Address::new("localhost", 9999));
        assert_eq!(config.client.proxy_addr().unwrap(), None);
        assert_eq!(config.timing.read_timeout(), crate::protocol::READ_TIMEOUT);
        assert_eq!(config.timing.write_timeout(), crate::protocol::WRITE_TIMEOUT);
        assert_eq!(config.timing.poll_interval(), crate::protocol::POLL_INTERVAL);
        assert_eq!(config.timing.idle_timeout(), Some(crate::protocol::IDLE_TIMEOUT));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[client]\nremote = \"relay.example:80\"\nproxy = \"proxy:3128\"\n\n[timing]\nidle_timeout_secs = 0"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.client.remote_addr().unwrap(),
            Address::new("relay.example", 80)
        );
        assert_eq!(
            config.client.proxy_addr().unwrap(),
            Some(Address::new("proxy", 3128))
        );
        assert_eq!(config.timing.idle_timeout(), None);
        assert_eq!(config.timing.read_timeout_secs, 5);
        assert_eq!(config.server.session_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = \"not a number\"").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
