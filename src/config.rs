//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILCATCH_CONFIG` (environment variable)
//! 2. `~/.config/mailcatch/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailcatch\config.toml` (Windows)
//! 3. Built-in defaults

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::store::attachments::CollisionPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// SMTP listener settings.
    pub server: ServerConfig,
    /// Where messages and attachments are kept.
    pub storage: StorageConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override the data directory (database, attachments, logs).
    pub data_dir: Option<PathBuf>,
}

/// SMTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_addr: SocketAddr,
    /// Name announced in the greeting and EHLO reply.
    pub hostname: String,
    /// Largest accepted DATA payload in bytes (default: 33554432 = 32 MB).
    pub max_message_size: usize,
    /// Longest command line in bytes; longer DATA lines are read in chunks.
    pub max_line_length: usize,
    /// Seconds to wait for the next client line; 0 waits forever.
    pub idle_timeout_secs: u64,
}

/// Where messages and attachments are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Defaults to `<data_dir>/emails.db`.
    pub database: Option<PathBuf>,
    /// Attachment directory. Defaults to `<data_dir>/attachments`.
    pub attachments_dir: Option<PathBuf>,
    /// What to do when an attachment filename is already taken.
    pub collision: CollisionPolicy,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 1025)),
            hostname: "localhost".to_string(),
            max_message_size: 32 * 1024 * 1024, // 32 MB
            max_line_length: 4096,
            idle_timeout_secs: 300,
        }
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILCATCH_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("mailcatch").join("config.toml"))
}

/// Return the data directory for the database, attachments and logs.
pub fn data_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.data_dir {
        return dir.clone();
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailcatch")
}

/// Return the message database path.
pub fn database_path(config: &Config) -> PathBuf {
    config
        .storage
        .database
        .clone()
        .unwrap_or_else(|| data_dir(config).join("emails.db"))
}

/// Return the attachment directory.
pub fn attachments_dir(config: &Config) -> PathBuf {
    config
        .storage
        .attachments_dir
        .clone()
        .unwrap_or_else(|| data_dir(config).join("attachments"))
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    data_dir(config).join("mailcatch.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "info");
        assert_eq!(cfg.server.bind_addr.port(), 1025);
        assert_eq!(cfg.server.hostname, "localhost");
        assert_eq!(cfg.server.idle_timeout_secs, 300);
        assert_eq!(cfg.storage.collision, CollisionPolicy::Rename);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.server.bind_addr, cfg.server.bind_addr);
        assert_eq!(parsed.server.max_message_size, cfg.server.max_message_size);
        assert_eq!(parsed.storage.collision, cfg.storage.collision);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[server]
bind_addr = "0.0.0.0:2525"

[storage]
collision = "overwrite"
attachments_dir = "/srv/mail/att"
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.server.bind_addr.port(), 2525);
        assert_eq!(cfg.storage.collision, CollisionPolicy::Overwrite);
        assert_eq!(attachments_dir(&cfg), PathBuf::from("/srv/mail/att"));
        // Other fields use defaults
        assert_eq!(cfg.server.hostname, "localhost");
        assert_eq!(cfg.server.max_line_length, 4096);
    }

    #[test]
    fn test_paths_follow_data_dir() {
        let mut cfg = Config::default();
        cfg.general.data_dir = Some(PathBuf::from("/tmp/mc"));
        assert_eq!(database_path(&cfg), PathBuf::from("/tmp/mc/emails.db"));
        assert_eq!(attachments_dir(&cfg), PathBuf::from("/tmp/mc/attachments"));
        assert_eq!(log_file_path(&cfg), PathBuf::from("/tmp/mc/mailcatch.log"));
    }
}
