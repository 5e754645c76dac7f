//! TOML-based configuration for the bridge.
//!
//! Reads and writes [`AppConfig`] at an explicit path or at the
//! platform-appropriate default:
//! - Windows:  `%APPDATA%\VendBridge\config.toml`
//! - Linux:    `~/.config/vend-bridge/config.toml` (honours `XDG_CONFIG_HOME`)
//! - macOS:    `~/Library/Application Support/VendBridge/config.toml`
//!
//! Example:
//!
//! ```toml
//! [bridge]
//! log_level = "debug"
//!
//! [backend]
//! base_url = "https://api.vmflow.xyz/functions/v1"
//! api_key = "public-anon-key"
//!
//! [ble]
//! write_retries = 2
//! ```
//!
//! Every field has a serde default, so an empty or partial file is valid and
//! a missing file behaves like an empty one.  Tokens are deliberately not part
//! of this file; they come from the command line or the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use vend_core::domain::device::DEFAULT_ALIAS_SUFFIX;

use crate::application::transport::WritePolicy;

/// GATT service advertised by payment controllers.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0xb2bbc642_46da_11ed_b878_0242ac120002);

/// The single write/notify characteristic inside that service.
pub const DEFAULT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xc9af9c76_46de_11ed_b878_0242ac120002);

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub ble: BleConfig,
}

/// General process settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where and how to reach the credit backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Base URL every path below is appended to.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sent as the `apikey` header when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_request_credit_path")]
    pub request_credit_path: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    /// Email/password sign-in returning a fresh token pair.
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_send_credit_path")]
    pub send_credit_path: String,
    #[serde(default = "default_devices_path")]
    pub devices_path: String,
    /// Whole-request timeout for backend calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Bluetooth link settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BleConfig {
    /// Controllers advertise `<site id>.<alias_suffix>`.
    #[serde(default = "default_alias_suffix")]
    pub alias_suffix: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: Uuid,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Retries shared by all writes of one session or provisioning call.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl BleConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            timeout: Duration::from_millis(self.write_timeout_ms),
            retries: self.write_retries,
        }
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_base_url() -> String {
    "http://localhost:54321/functions/v1".to_string()
}
fn default_request_credit_path() -> String {
    "/request-credit".to_string()
}
fn default_refresh_path() -> String {
    "/token/refresh".to_string()
}
fn default_login_path() -> String {
    "/token/login".to_string()
}
fn default_send_credit_path() -> String {
    "/send-credit".to_string()
}
fn default_devices_path() -> String {
    "/devices".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_alias_suffix() -> String {
    DEFAULT_ALIAS_SUFFIX.to_string()
}
fn default_service_uuid() -> Uuid {
    DEFAULT_SERVICE_UUID
}
fn default_characteristic_uuid() -> Uuid {
    DEFAULT_CHARACTERISTIC_UUID
}
fn default_discovery_timeout_ms() -> u64 {
    3_000
}
fn default_write_timeout_ms() -> u64 {
    3_000
}
fn default_write_retries() -> u32 {
    2
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_credit_path: default_request_credit_path(),
            refresh_path: default_refresh_path(),
            login_path: default_login_path(),
            send_credit_path: default_send_credit_path(),
            devices_path: default_devices_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            alias_suffix: default_alias_suffix(),
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            write_retries: default_write_retries(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path for this platform.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads `AppConfig` from `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory including the app subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("VendBridge"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("vend-bridge"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("VendBridge")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("vend_bridge_test_{}", Uuid::new_v4()))
            .join("config.toml")
    }

    #[test]
    fn test_defaults_match_controller_firmware() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.ble.alias_suffix, "vmflow.xyz");
        assert_eq!(
            cfg.ble.service_uuid.to_string(),
            "b2bbc642-46da-11ed-b878-0242ac120002"
        );
        assert_eq!(
            cfg.ble.characteristic_uuid.to_string(),
            "c9af9c76-46de-11ed-b878-0242ac120002"
        );
        assert_eq!(cfg.ble.discovery_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.ble.write_policy(), WritePolicy::default());
    }

    #[test]
    fn test_backend_defaults() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.request_credit_path, "/request-credit");
        assert_eq!(cfg.refresh_path, "/token/refresh");
        assert_eq!(cfg.login_path, "/token/login");
        assert_eq!(cfg.api_key, None);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_partial_section_overrides_only_named_fields() {
        // Arrange
        let toml_str = r#"
[ble]
write_retries = 5
alias_suffix = "test.local"
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.ble.write_retries, 5);
        assert_eq!(cfg.ble.alias_suffix, "test.local");
        assert_eq!(cfg.ble.write_timeout_ms, 3_000);
        assert_eq!(cfg.bridge.log_level, "info");
    }

    #[test]
    fn test_absent_api_key_is_omitted_from_toml() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        assert!(!toml_str.contains("api_key"));
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let result = load_config(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/config.toml");

        let cfg = load_config(&path).expect("absent file is not an error");

        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        // Arrange
        let path = temp_path();
        let mut cfg = AppConfig::default();
        cfg.backend.base_url = "https://backend.example".to_string();
        cfg.backend.api_key = Some("anon".to_string());
        cfg.bridge.log_level = "debug".to_string();

        // Act
        save_config(&path, &cfg).expect("save");
        let loaded = load_config(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(
                path.ends_with("config.toml"),
                "config file must be named config.toml, got {path:?}"
            );
        }
        // NoPlatformConfigDir in a stripped environment is also acceptable.
    }
}
