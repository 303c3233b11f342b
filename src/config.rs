use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::{TransportMode, TransportOptions, DEFAULT_LOOPBACK_PORT, DEFAULT_LOOPBACK_TIMEOUT};

const DEFAULT_CONFIG_PATH: &str = "/etc/hcitap.conf";
const DEFAULT_INTERFACE: &str = "hci0";
const DEFAULT_QUEUE_SIZE: usize = 1000;
const DEFAULT_BTSNOOP_PATH: &str = "/tmp/hcitap-btsnoop.log";
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub interface: String,
    pub mode: TransportMode,
    /// Capacity of queues registered without an explicit size
    pub queue_size: usize,
    pub btsnoop_path: PathBuf,
    pub write_btsnoop: bool,
    pub receive_timeout: Duration,
    pub response_timeout: Duration,
    pub poll_interval: Duration,
    pub loopback_port: u16,
    /// Where the loopback bridge sends outbound frames (its own listener if unset)
    pub loopback_inject: Option<SocketAddr>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            mode: TransportMode::Hci,
            queue_size: DEFAULT_QUEUE_SIZE,
            btsnoop_path: PathBuf::from(DEFAULT_BTSNOOP_PATH),
            write_btsnoop: true,
            receive_timeout: Duration::from_millis(DEFAULT_RECEIVE_TIMEOUT_MS),
            response_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            loopback_port: DEFAULT_LOOPBACK_PORT,
            loopback_inject: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    /// Defaults, then the config file (`HCITAP_CONFIG`), then `HCITAP_*`
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("HCITAP_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let content = if Path::new(&config_path).exists() {
            Some(std::fs::read_to_string(&config_path)?)
        } else {
            None
        };

        Self::from_sources(content.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build a config from file content and an environment lookup.
    pub fn from_sources<F>(content: Option<&str>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(content) = content {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    config.apply(key.trim(), value.trim())?;
                }
            }
        }

        // Allow environment variable overrides
        for key in KEYS {
            if let Some(value) = env(&format!("HCITAP_{}", key.to_ascii_uppercase())) {
                config.apply(key, value.trim())?;
            }
        }

        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "interface" => self.interface = value.to_string(),
            "mode" => self.mode = value.parse().map_err(|_| invalid(key, value))?,
            "queue_size" => {
                self.queue_size = value
                    .parse()
                    .ok()
                    .filter(|&size| size > 0)
                    .ok_or_else(|| invalid(key, value))?;
            }
            "btsnoop_path" => self.btsnoop_path = PathBuf::from(value),
            "write_btsnoop" => self.write_btsnoop = parse_bool(key, value)?,
            "receive_timeout_ms" => self.receive_timeout = parse_millis(key, value)?,
            "response_timeout_ms" => self.response_timeout = parse_millis(key, value)?,
            "poll_interval_ms" => self.poll_interval = parse_millis(key, value)?,
            "loopback_port" => {
                self.loopback_port = value.parse().map_err(|_| invalid(key, value))?;
            }
            "loopback_inject" => {
                self.loopback_inject = match value {
                    "" | "none" => None,
                    addr => Some(addr.parse().map_err(|_| invalid(key, addr))?),
                };
            }
            "log_level" => self.log_level = value.to_string(),
            _ => {}
        }
        Ok(())
    }

    /// Options handed to transport establishment.
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            receive_timeout: self.receive_timeout,
            loopback_port: self.loopback_port,
            loopback_timeout: DEFAULT_LOOPBACK_TIMEOUT,
            loopback_inject: self.loopback_inject,
        }
    }
}

const KEYS: [&str; 11] = [
    "interface",
    "mode",
    "queue_size",
    "btsnoop_path",
    "write_btsnoop",
    "receive_timeout_ms",
    "response_timeout_ms",
    "poll_interval_ms",
    "loopback_port",
    "loopback_inject",
    "log_level",
];

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(invalid(key, value)),
    }
}
