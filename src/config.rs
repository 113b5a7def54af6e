//! Bridge settings, read from a TOML file.
//!
//! ```toml
//! [serial]
//! baud_rate = 9600
//! read_timeout_ms = 600   # omit to use each variant's own timeout
//!
//! [handshake]
//! attempts = 15
//!
//! [treatment]
//! name_padding = "space"  # or "null"
//!
//! [logging]
//! filter = "info"
//! ```
//!
//! Every key is optional.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::NamePadding;
use crate::handshake::{DETECTION_ATTEMPTS, HANDSHAKE_TIMEOUT};
use crate::registry::DeviceProfile;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub serial: SerialConfig,
    pub handshake: HandshakeConfig,
    pub treatment: TreatmentConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// Overrides every variant's read timeout when set.
    pub read_timeout_ms: Option<u64>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            read_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub attempts: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            attempts: DETECTION_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreatmentConfig {
    pub name_padding: NamePadding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// The read timeout to use with `profile`'s device.
    pub fn read_timeout(&self, profile: &DeviceProfile) -> Duration {
        self.serial
            .read_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(profile.read_timeout)
    }

    /// The read timeout to use before the device is identified.
    pub fn handshake_timeout(&self) -> Duration {
        self.serial
            .read_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(HANDSHAKE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceType;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.handshake.attempts, 15);
        assert_eq!(config.treatment.name_padding, NamePadding::Space);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [serial]
            read_timeout_ms = 650

            [treatment]
            name_padding = "null"
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.treatment.name_padding, NamePadding::Null);
        assert_eq!(
            config.read_timeout(DeviceType::Em27.profile()),
            Duration::from_millis(650)
        );
    }

    #[test]
    fn timeout_falls_back_to_variant_default() {
        let config = BridgeConfig::default();
        assert_eq!(
            config.read_timeout(DeviceType::Mr72.profile()),
            Duration::from_millis(500)
        );
        assert_eq!(
            config.read_timeout(DeviceType::Em272b.profile()),
            Duration::from_millis(800)
        );
        assert_eq!(config.handshake_timeout(), HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn unknown_padding_is_rejected() {
        let err = BridgeConfig::from_toml_str("[treatment]\nname_padding = \"dots\"\n");
        assert!(matches!(err, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[handshake]\nattempts = 30").unwrap();
        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.handshake.attempts, 30);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        match BridgeConfig::load(&path) {
            Err(ConfigError::Read { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected read error, got {other:?}"),
        }
    }
}
