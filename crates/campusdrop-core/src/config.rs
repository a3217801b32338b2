// Configuration loading and parsing (campusdrop.toml, credentials.toml).

use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::transport::TransportKind;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to read {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to copy default config to {path}: {source}")]
    DefaultsCopyError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no defaults/ or config/ directory under {base}; run from the project root")]
    NoConfigDir { base: PathBuf },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub poller: PollerConfig,
    pub reconnect: ReconnectConfig,
    pub credentials: CredentialsConfig,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poller.interval_secs)
    }
}

// ---------------------------------------------------------------------------
// campusdrop.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire campusdrop.toml file.
#[derive(Debug, Clone, Deserialize)]
struct SettingsFile {
    server: ServerConfig,
    session: SessionConfig,
    #[serde(default)]
    poller: PollerConfig,
    #[serde(default)]
    reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// REST base, e.g. `http://localhost:8000/api/v1`.
    pub api_base_url: String,
    /// Push endpoint (`ws://` for websocket, `http://` for sse).
    pub push_url: String,
    #[serde(default)]
    pub transport: TransportKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub campus_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    pub interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig { interval_secs: 15 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    /// Bearer token for the REST API and the push handshake.
    pub auth_token: Option<String>,
}

impl CredentialsConfig {
    /// The token, if one is set and non-empty.
    pub fn token(&self) -> Option<&str> {
        self.auth_token.as_deref().filter(|t| !t.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/campusdrop.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// Does not copy defaults; `load_config()` does that first.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- campusdrop.toml (required) ---
    let settings_path = config_dir.join("campusdrop.toml");
    let settings_text = read_file(&settings_path)?;
    let settings: SettingsFile =
        toml::from_str(&settings_text).map_err(|e| ConfigError::ParseError {
            path: settings_path.clone(),
            source: e,
        })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        server: settings.server,
        session: settings.session,
        poller: settings.poller,
        reconnect: settings.reconnect,
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

/// Files shipped in `defaults/` that are copied into `config/` on first run.
/// `credentials.toml` is user-created from its `.example`.
const SHIPPED_FILES: &[&str] = &["campusdrop.toml"];

/// Copy each shipped default that is missing from `config/`.
/// Returns the paths that were written.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.is_dir() {
        if config_dir.is_dir() {
            return Ok(vec![]);
        }
        return Err(ConfigError::NoConfigDir {
            base: base_dir.to_path_buf(),
        });
    }

    std::fs::create_dir_all(&config_dir).map_err(|source| ConfigError::DefaultsCopyError {
        path: config_dir.clone(),
        source,
    })?;

    let mut copied = Vec::new();
    for name in SHIPPED_FILES {
        let source_path = defaults_dir.join(name);
        if !source_path.is_file() {
            debug!(file = %source_path.display(), "no shipped default");
            continue;
        }
        let target = config_dir.join(name);
        if copy_if_missing(&source_path, &target)? {
            info!(file = %target.display(), "created config from defaults");
            copied.push(target);
        }
    }
    Ok(copied)
}

/// Copy `from` to `to` unless `to` already exists. Never overwrites.
fn copy_if_missing(from: &Path, to: &Path) -> Result<bool, ConfigError> {
    let content = std::fs::read(from).map_err(|e| copy_error(from, e))?;
    let mut dest = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(to)
    {
        Ok(dest) => dest,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(copy_error(to, e)),
    };
    dest.write_all(&content).map_err(|e| copy_error(to, e))?;
    Ok(true)
}

fn copy_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::DefaultsCopyError {
        path: path.to_path_buf(),
        source,
    }
}

/// Load config relative to the current working directory, creating
/// `config/` from `defaults/` on first run.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|source| ConfigError::ReadError {
        path: PathBuf::from("."),
        source,
    })?;
    let created = ensure_config_files(&cwd)?;
    if !created.is_empty() {
        info!(count = created.len(), "first run: default config written to config/");
    }
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::ReadError {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let required: &[(&str, &str)] = &[
        ("server.api_base_url", config.server.api_base_url.as_str()),
        ("server.push_url", config.server.push_url.as_str()),
        ("session.campus_id", config.session.campus_id.as_str()),
        ("session.user_id", config.session.user_id.as_str()),
    ];
    for (name, val) in required {
        if val.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must not be empty".into(),
            });
        }
    }

    let scheme_ok = match config.server.transport {
        TransportKind::WebSocket => {
            config.server.push_url.starts_with("ws://") || config.server.push_url.starts_with("wss://")
        }
        TransportKind::Sse => {
            config.server.push_url.starts_with("http://")
                || config.server.push_url.starts_with("https://")
        }
    };
    if !scheme_ok {
        return Err(ConfigError::ValidationError {
            field: "server.push_url".into(),
            message: format!(
                "scheme does not match transport `{}`: {}",
                config.server.transport, config.server.push_url
            ),
        });
    }

    if config.poller.interval_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "poller.interval_secs".into(),
            message: "must be > 0".into(),
        });
    }

    let reconnect = &config.reconnect;
    if reconnect.initial_backoff_ms == 0 {
        return Err(ConfigError::ValidationError {
            field: "reconnect.initial_backoff_ms".into(),
            message: "must be > 0".into(),
        });
    }
    if reconnect.max_backoff_ms < reconnect.initial_backoff_ms {
        return Err(ConfigError::ValidationError {
            field: "reconnect.max_backoff_ms".into(),
            message: format!(
                "must be >= initial_backoff_ms ({}), got {}",
                reconnect.initial_backoff_ms, reconnect.max_backoff_ms
            ),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
