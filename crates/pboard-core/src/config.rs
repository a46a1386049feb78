use std::fs;
use std::path::PathBuf;

use dirs::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_DIR_NAME: &str = "pulseboard";
const CONFIG_FILE_NAME: &str = "config.toml";
const CURRENT_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_SCHEME: &str = "pulseboard";
pub const DEFAULT_IPC_PORT: u16 = 38911;
pub const DEFAULT_SESSION_HOURS: f32 = 8.0;

/// Result returned by [`load_config`], capturing the source and any non-fatal issues.
#[derive(Debug, Clone)]
pub struct ConfigLoadResult {
    pub config: FileConfig,
    pub warnings: Vec<String>,
    pub source: ConfigSource,
}

/// Indicates where the configuration was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// No persisted configuration was found or usable; defaults were synthesized.
    Default,
    /// Configuration was read from `config.toml`.
    File,
}

/// Errors that can occur when persisting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML serialization error: {0}")]
    Ser(#[from] toml::ser::Error),
}

/// Disk-backed configuration schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "FileConfig::schema_version")]
    pub schema_version: u32,
    /// Base URL of the Pulseboard REST backend.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Custom URI scheme registered with the OS for auth callbacks.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Loopback port for the UI bridge; doubles as the single-instance lock.
    #[serde(default = "default_ipc_port")]
    pub ipc_port: u16,
    /// App-session self-renewal interval, in hours.
    #[serde(default = "default_session_hours")]
    pub session_hours: f32,
}

/// Identity-provider endpoints and client identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub client_id: String,
    pub redirect_uri: String,
}

fn default_backend_url() -> String {
    "https://api.pulseboard.app".to_string()
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

const fn default_ipc_port() -> u16 {
    DEFAULT_IPC_PORT
}

const fn default_session_hours() -> f32 {
    DEFAULT_SESSION_HOURS
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            authorize_url: "https://id.pulseboard.app/oauth/authorize".to_string(),
            token_url: "https://id.pulseboard.app/oauth/token".to_string(),
            userinfo_url: "https://id.pulseboard.app/oauth/userinfo".to_string(),
            client_id: "pulseboard-desktop".to_string(),
            redirect_uri: format!("{DEFAULT_SCHEME}://auth/callback"),
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            backend_url: default_backend_url(),
            identity: IdentityConfig::default(),
            scheme: default_scheme(),
            ipc_port: default_ipc_port(),
            session_hours: default_session_hours(),
        }
    }
}

impl FileConfig {
    const fn schema_version() -> u32 {
        CURRENT_SCHEMA_VERSION
    }
}

/// Directory that holds `config.toml`, logs, and per-user usage counters.
pub fn config_directory() -> PathBuf {
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

pub fn config_path() -> PathBuf {
    config_directory().join(CONFIG_FILE_NAME)
}

/// Load configuration from disk, falling back to defaults on any problem.
///
/// Parse and sanitization issues are reported as warnings, never errors; a
/// broken config file must not keep the client from starting.
pub fn load_config() -> ConfigLoadResult {
    let path = config_path();
    let mut warnings = Vec::new();

    let raw = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return ConfigLoadResult {
                config: FileConfig::default(),
                warnings,
                source: ConfigSource::Default,
            };
        }
        Err(err) => {
            warnings.push(format!(
                "Failed to read {}: {err}; using defaults.",
                path.display()
            ));
            return ConfigLoadResult {
                config: FileConfig::default(),
                warnings,
                source: ConfigSource::Default,
            };
        }
    };

    match toml::from_str::<FileConfig>(&raw) {
        Ok(config) => {
            let (config, mut sanitize_warnings) = sanitize_config(config);
            warnings.append(&mut sanitize_warnings);
            ConfigLoadResult {
                config,
                warnings,
                source: ConfigSource::File,
            }
        }
        Err(err) => {
            warnings.push(format!(
                "Failed to parse {}: {err}; using defaults.",
                path.display()
            ));
            ConfigLoadResult {
                config: FileConfig::default(),
                warnings,
                source: ConfigSource::Default,
            }
        }
    }
}

fn sanitize_config(mut config: FileConfig) -> (FileConfig, Vec<String>) {
    let mut warnings = Vec::new();

    if config.backend_url.trim().is_empty() {
        warnings.push("backend_url was empty; restored default.".to_string());
        config.backend_url = default_backend_url();
    }
    while config.backend_url.ends_with('/') {
        config.backend_url.pop();
    }

    if config.scheme.trim().is_empty()
        || !config
            .scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+')
    {
        warnings.push(format!(
            "scheme '{}' is not a valid URI scheme; restored default.",
            config.scheme
        ));
        config.scheme = default_scheme();
    }

    if !config.session_hours.is_finite() || config.session_hours <= 0.0 {
        warnings.push(format!(
            "session_hours {} is not usable; restored default of {DEFAULT_SESSION_HOURS}.",
            config.session_hours
        ));
        config.session_hours = default_session_hours();
    }

    (config, warnings)
}

/// Persist configuration to `config.toml`, creating the directory if needed.
pub fn save_config(config: &FileConfig) -> Result<(), ConfigError> {
    let dir = config_directory();
    fs::create_dir_all(&dir)?;
    let encoded = toml::to_string_pretty(config)?;
    fs::write(config_path(), encoded)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = FileConfig::default();
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(config.scheme, DEFAULT_SCHEME);
        assert!(config.identity.redirect_uri.starts_with(DEFAULT_SCHEME));
    }

    #[test]
    fn sanitize_restores_bad_scheme_and_hours() {
        let mut config = FileConfig::default();
        config.scheme = "not a scheme!".to_string();
        config.session_hours = 0.0;

        let (config, warnings) = sanitize_config(config);
        assert_eq!(config.scheme, DEFAULT_SCHEME);
        assert_eq!(config.session_hours, DEFAULT_SESSION_HOURS);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn sanitize_strips_trailing_slash() {
        let mut config = FileConfig::default();
        config.backend_url = "https://api.example.com/".to_string();

        let (config, warnings) = sanitize_config(config);
        assert_eq!(config.backend_url, "https://api.example.com");
        assert!(warnings.is_empty());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = FileConfig::default();
        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: FileConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.backend_url, config.backend_url);
        assert_eq!(decoded.ipc_port, config.ipc_port);
    }
}
