use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};
use stowage_types::Provider;

/// How the redirect URI for a provider is chosen.
///
/// In YAML this is a plain string: `in_process`, `origin`, or a literal URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RedirectSetting {
    /// Deliver the result to the opener in-process (no redirect page).
    InProcess,
    /// `{origin}/oauth/{provider}/callback`.
    Origin,
    /// A fixed, registered URL independent of the serving origin.
    Fixed(String),
}

impl From<String> for RedirectSetting {
    fn from(s: String) -> Self {
        match s.as_str() {
            "in_process" => Self::InProcess,
            "origin" => Self::Origin,
            _ => Self::Fixed(s),
        }
    }
}

impl From<RedirectSetting> for String {
    fn from(r: RedirectSetting) -> Self {
        match r {
            RedirectSetting::InProcess => "in_process".to_string(),
            RedirectSetting::Origin => "origin".to_string(),
            RedirectSetting::Fixed(url) => url,
        }
    }
}

/// Size of the detached authorization window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            width: 600,
            height: 700,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging setup for the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_origin() -> String {
    "http://localhost:3000".to_string()
}
fn default_exchange_url() -> String {
    "http://localhost:8080/api/oauth/token".to_string()
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_purge_after_secs() -> u64 {
    3600
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Callback server listen port (defaults to 3000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Callback server listen address (defaults to `127.0.0.1`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Origin the admin client is served from.
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Backend token-exchange endpoint.
    #[serde(default = "default_exchange_url")]
    pub exchange_url: String,
    /// Popup-closed poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on one attempt in seconds; `0` waits indefinitely.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Age in seconds after which the server sweeps staged entries left by
    /// crashed attempts; `0` disables the sweep.
    #[serde(default = "default_purge_after_secs")]
    pub purge_after_secs: u64,
    #[serde(default)]
    pub popup: PopupConfig,
    /// Per-provider redirect overrides.
    #[serde(default)]
    pub redirects: HashMap<Provider, RedirectSetting>,
    #[serde(default)]
    pub log: LogConfig,
    /// Staging database path (defaults to `~/.stowage/staging.db`).
    #[serde(default)]
    pub db: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            origin: default_origin(),
            exchange_url: default_exchange_url(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_timeout_secs(),
            purge_after_secs: default_purge_after_secs(),
            popup: PopupConfig::default(),
            redirects: HashMap::new(),
            log: LogConfig::default(),
            db: None,
        }
    }
}

impl Config {
    /// Parses configuration from a YAML string, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the YAML is invalid or extraction fails.
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Format as _, Serialized, Yaml},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
    }

    /// Loads configuration from a file path, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the file cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn from_file(path: &std::path::Path) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Format as _, Serialized, Yaml},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .extract()
    }

    /// Loads defaults, then the optional file, then `STOWAGE_*` variables
    /// (nested keys separated by `__`, e.g. `STOWAGE_POPUP__WIDTH`).
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if any layer fails to parse.
    #[allow(clippy::result_large_err)]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Env, Format as _, Serialized, Yaml},
        };
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("STOWAGE_").split("__"))
            .extract()
    }

    /// Interval between popup-closed checks.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Bounded wait for one attempt, `None` when disabled.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Age past which staged entries may be swept, `None` when sweeping is
    /// off.
    ///
    /// Never shorter than one attempt's wait. With the wait disabled an
    /// attempt may legitimately stay pending forever, so nothing is swept.
    #[must_use]
    pub fn purge_after(&self) -> Option<Duration> {
        if self.timeout_secs == 0 || self.purge_after_secs == 0 {
            return None;
        }
        Some(Duration::from_secs(self.purge_after_secs.max(self.timeout_secs)))
    }

    /// Socket address string for the callback server.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
