//! Client configuration
//!
//! Loaded from a TOML file merged with `VOLTAGE_BLE_`-prefixed environment
//! variables. Every field has a sensible default so an empty file is valid;
//! the key bundle is optional and its absence simply disables encryption
//! auto-detection.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_TIMEOUT_MS, ENCRYPTION_WINDOW_MS};
use crate::error::BleResult;
use crate::keys::KeyBundle;

fn default_response_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_encryption_window_ms() -> u64 {
    ENCRYPTION_WINDOW_MS
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_console() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log to console instead of files
    #[serde(default = "default_console")]
    pub console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            level: default_log_level(),
            console: default_console(),
        }
    }
}

/// Hex-encoded pairing material as distributed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBundleConfig {
    /// 64 hex chars: raw big-endian P-256 scalar
    pub signing_key: String,
    /// Hex of a DER-encoded SubjectPublicKeyInfo
    pub verify_key: String,
    /// 32 hex chars: symmetric shared secret
    pub shared_secret: String,
}

impl KeyBundleConfig {
    /// Parse into a typed [`KeyBundle`]
    pub fn to_bundle(&self) -> BleResult<KeyBundle> {
        KeyBundle::from_hex(&self.signing_key, &self.verify_key, &self.shared_secret)
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Response deadline for each operation, in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Encryption detection window after connect, in milliseconds
    #[serde(default = "default_encryption_window_ms")]
    pub encryption_window_ms: u64,
    /// Logging setup
    #[serde(default)]
    pub log: LogConfig,
    /// Pairing material; absent means plaintext-only operation
    #[serde(default)]
    pub keys: Option<KeyBundleConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            encryption_window_ms: default_encryption_window_ms(),
            log: LogConfig::default(),
            keys: None,
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file with `VOLTAGE_BLE_` environment overrides
    ///
    /// Nested fields split on double underscore, e.g.
    /// `VOLTAGE_BLE_LOG__LEVEL=debug`.
    pub fn load(path: impl AsRef<Path>) -> BleResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VOLTAGE_BLE_").split("__"))
            .extract()?;
        Ok(config)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn encryption_window(&self) -> Duration {
        Duration::from_millis(self.encryption_window_ms)
    }

    /// Parse the configured key material, if any
    pub fn key_bundle(&self) -> BleResult<Option<KeyBundle>> {
        self.keys.as_ref().map(KeyBundleConfig::to_bundle).transpose()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "").unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.response_timeout_ms, 5000);
        assert_eq!(config.encryption_window_ms, 500);
        assert_eq!(config.log.level, "info");
        assert!(config.log.console);
        assert!(config.keys.is_none());
        assert!(config.key_bundle().unwrap().is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            response_timeout_ms = 2500

            [log]
            level = "debug"
            console = false
            "#
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.response_timeout_ms, 2500);
        assert_eq!(config.response_timeout(), Duration::from_millis(2500));
        assert_eq!(config.log.level, "debug");
        assert!(!config.log.console);
    }

    #[test]
    fn test_key_bundle_roundtrip_through_config() {
        use p256::pkcs8::EncodePublicKey;

        let bundle = KeyBundle::generate();
        let der = p256::PublicKey::from_sec1_bytes(
            bundle.verify_key().to_encoded_point(false).as_bytes(),
        )
        .unwrap()
        .to_public_key_der()
        .unwrap();

        let keys = KeyBundleConfig {
            signing_key: hex::encode(bundle.signing_key().to_bytes()),
            verify_key: hex::encode(der.as_bytes()),
            shared_secret: hex::encode(bundle.shared_secret()),
        };
        let parsed = keys.to_bundle().unwrap();
        assert_eq!(parsed.shared_secret(), bundle.shared_secret());
    }

    #[test]
    fn test_invalid_key_material_is_config_error() {
        let keys = KeyBundleConfig {
            signing_key: "zz".into(),
            verify_key: "3059".into(),
            shared_secret: "00".into(),
        };
        assert!(matches!(
            keys.to_bundle().unwrap_err(),
            crate::error::BleError::Config(_)
        ));
    }
}
