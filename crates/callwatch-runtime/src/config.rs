//! Daemon configuration: optional TOML file, then CLI flags / environment.
//!
//! Every field has a default so an empty (or absent) file is valid.
//!
//! ```toml
//! api_base_url = "https://api.example.com/api/v1"
//! socket_url = "https://api.example.com"
//! business_id = "6f1c..."
//!
//! [poll]
//! interval_ms = 5000
//! limit = 20
//!
//! [reconnect]
//! initial_backoff_ms = 1000
//! max_backoff_ms = 30000
//! ```

use std::path::Path;
use std::time::Duration;

use callwatch_core::takeover::MAX_DISPLAY_WINDOW_MS;
use serde::Deserialize;
use thiserror::Error;

use crate::cli::DaemonOpts;

const MAX_LOOKBACK_HOURS: u32 = 24 * 366;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {detail}")]
    Invalid { field: &'static str, detail: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST base, including the version prefix.
    pub api_base_url: String,
    /// Origin of the push channel server.
    pub socket_url: String,
    /// Engine.IO mount path on `socket_url`.
    pub socket_path: String,
    /// Bearer token. Usually supplied through `CALLWATCH_TOKEN`.
    pub token: Option<String>,
    /// Business scope; resolved from `/auth/me` when absent.
    pub business_id: Option<String>,
    /// Default phone number for takeovers; resolved from `/auth/me` when absent.
    pub takeover_phone: Option<String>,
    pub request_timeout_ms: u64,
    pub takeover_display_ms: u64,
    pub poll: PollConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub limit: u32,
    /// Only fetch calls started within this many hours. Unbounded when unset.
    pub lookback_hours: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".into(),
            socket_url: "http://localhost:8000".into(),
            socket_path: "/ws/alerts/socket.io".into(),
            token: None,
            business_id: None,
            takeover_phone: None,
            request_timeout_ms: 20_000,
            takeover_display_ms: callwatch_core::takeover::DEFAULT_DISPLAY_WINDOW_MS,
            poll: PollConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            limit: 20,
            lookback_hours: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Config {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// CLI flags and environment (via clap) win over the file.
    pub fn apply_opts(&mut self, opts: &DaemonOpts) {
        if let Some(ref url) = opts.api_url {
            self.api_base_url.clone_from(url);
        }
        if let Some(ref url) = opts.socket_url {
            self.socket_url.clone_from(url);
        }
        if let Some(ref token) = opts.token {
            self.token = Some(token.clone());
        }
        if let Some(ref business) = opts.business_id {
            self.business_id = Some(business.clone());
        }
        if let Some(ref phone) = opts.takeover_phone {
            self.takeover_phone = Some(phone.clone());
        }
        if let Some(ms) = opts.poll_interval_ms {
            self.poll.interval_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll.interval_ms",
                detail: "must be greater than zero".into(),
            });
        }
        if self.poll.limit == 0 {
            return Err(ConfigError::Invalid {
                field: "poll.limit",
                detail: "must be greater than zero".into(),
            });
        }
        if self.reconnect.initial_backoff_ms == 0
            || self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms
        {
            return Err(ConfigError::Invalid {
                field: "reconnect",
                detail: format!(
                    "need 0 < initial_backoff_ms ({}) <= max_backoff_ms ({})",
                    self.reconnect.initial_backoff_ms, self.reconnect.max_backoff_ms
                ),
            });
        }
        if self.poll.lookback_hours.is_some_and(|h| h > MAX_LOOKBACK_HOURS) {
            return Err(ConfigError::Invalid {
                field: "poll.lookback_hours",
                detail: format!("must be at most {MAX_LOOKBACK_HOURS}"),
            });
        }
        if self.takeover_display_ms > MAX_DISPLAY_WINDOW_MS {
            return Err(ConfigError::Invalid {
                field: "takeover_display_ms",
                detail: format!("must be at most {MAX_DISPLAY_WINDOW_MS}"),
            });
        }
        if !self.socket_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "socket_path",
                detail: format!("{:?} must start with '/'", self.socket_path),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
