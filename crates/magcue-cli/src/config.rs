//! Relay configuration – reads/writes `~/.magcue/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use magcue_hal::SessionConfig;
use magcue_hal::locator::default_signatures;
use magcue_hal::session::DEFAULT_BAUD_RATE;
use magcue_hub::DEFAULT_SUBSCRIBER_CAPACITY;
use magcue_server::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Persisted relay configuration stored in `~/.magcue/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// HTTP + WebSocket port of the relay.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Manufacturer substrings that identify the sensor board.
    #[serde(default = "default_signatures")]
    pub vendor_signatures: Vec<String>,

    /// Serial path to open directly, skipping the locator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_override: Option<String>,

    /// How long shutdown waits for the final zero command to reach the board.
    #[serde(default = "default_shutdown_flush_ms")]
    pub shutdown_flush_ms: u64,

    /// Poll interval for reconnecting an idle device.  Unset disables polling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_interval_secs: Option<u64>,

    /// Queue depth of each client subscription.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

fn default_http_port() -> u16 {
    DEFAULT_PORT
}
fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_shutdown_flush_ms() -> u64 {
    500
}
fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            baud_rate: default_baud_rate(),
            vendor_signatures: default_signatures(),
            port_override: None,
            shutdown_flush_ms: default_shutdown_flush_ms(),
            reconnect_interval_secs: None,
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl Config {
    /// Session settings derived from this config.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            baud_rate: self.baud_rate,
            vendor_signatures: self.vendor_signatures.clone(),
            port_override: self.port_override.clone(),
        }
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_flush_ms)
    }

    /// Reconnect poll interval, if polling is enabled.  Zero counts as off.
    pub fn reconnect_interval(&self) -> Option<Duration> {
        self.reconnect_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Return the path to `~/.magcue/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".magcue").join("config.toml")
}

/// Effective configuration: file at `path` (or the default location),
/// then `MAGCUE_*` overrides.
///
/// A missing file yields defaults.  A malformed file is reported and
/// defaults are used.
pub fn resolve(path: Option<&Path>) -> Config {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let mut cfg = match load_from(&path) {
        Ok(Some(cfg)) => cfg,
        Ok(None) => Config::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable config; using defaults");
            Config::default()
        }
    };
    apply_env_overrides(&mut cfg);
    cfg
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `MAGCUE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MAGCUE_HTTP_PORT` | `http_port` |
/// | `MAGCUE_BAUD_RATE` | `baud_rate` |
/// | `MAGCUE_PORT` | `port_override` |
/// | `MAGCUE_RECONNECT_SECS` | `reconnect_interval_secs` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(port) = parsed_var::<u16>("MAGCUE_HTTP_PORT") {
        cfg.http_port = port;
    }
    if let Some(baud) = parsed_var::<u32>("MAGCUE_BAUD_RATE") {
        cfg.baud_rate = baud;
    }
    if let Ok(path) = std::env::var("MAGCUE_PORT") {
        if !path.trim().is_empty() {
            cfg.port_override = Some(path);
        }
    }
    if let Some(secs) = parsed_var::<u64>("MAGCUE_RECONNECT_SECS") {
        cfg.reconnect_interval_secs = Some(secs);
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Save the config to a specific path, creating the parent directory.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
