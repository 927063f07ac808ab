//! Bridge configuration, loaded from JSON
//!
//! ```json
//! {
//!   "allowed_measurements": ["3f0a…"],
//!   "padding": {"kind": "moving_average", "window": 20},
//!   "enclave_gate": true,
//!   "log_filter": "info",
//!   "store_dir": "enclave-mail-sessions"
//! }
//! ```
//!
//! Every field is optional. An empty `allowed_measurements` trusts no enclave.

use crate::mail::padding::MinSizePolicy;
use crate::tee::attestation::MeasurementAllowList;
use crate::tee::enclave::Measurement;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Enclave measurements this party accepts
    pub allowed_measurements: Vec<Measurement>,
    /// Padding applied to sealed mail bodies
    pub padding: MinSizePolicy,
    /// Admit one call chain at a time into the enclave
    pub enclave_gate: bool,
    /// env_logger filter used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Where sealed session snapshots live, if persisted
    pub store_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            allowed_measurements: Vec::new(),
            padding: MinSizePolicy::default(),
            enclave_gate: true,
            log_filter: "info".to_string(),
            store_dir: None,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_json(&json)?;
        log::info!(
            "Loaded config from {}: {} allowed measurements",
            path.display(),
            config.allowed_measurements.len()
        );
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn allow_list(&self) -> MeasurementAllowList {
        self.allowed_measurements.iter().copied().collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.padding.check().map_err(ConfigError::Invalid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_json("{}").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert!(config.allow_list().is_empty());
        assert!(config.enclave_gate);
        assert_eq!(config.padding, MinSizePolicy::MovingAverage { window: 20 });
    }

    #[test]
    fn test_full_config() {
        let m = Measurement::of_code(b"enclave");
        let json = format!(
            r#"{{
                "allowed_measurements": ["{}"],
                "padding": {{"kind": "largest_seen"}},
                "enclave_gate": false,
                "log_filter": "debug",
                "store_dir": "/var/lib/sessions"
            }}"#,
            m
        );
        let config = BridgeConfig::from_json(&json).unwrap();
        assert!(config.allow_list().contains(&m));
        assert_eq!(config.padding, MinSizePolicy::LargestSeen);
        assert!(!config.enclave_gate);
        assert_eq!(config.store_dir, Some(PathBuf::from("/var/lib/sessions")));

        let back = BridgeConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            BridgeConfig::from_json(r#"{"allowed_measurements": ["xyz"]}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"padding": {"kind": "moving_average", "window": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"padding": {"kind": "moving_average", "window": 1000000}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"padding": {"kind": "fixed", "size": 18446744073709551615}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(BridgeConfig::from_json(r#"{"padding": {"kind": "fixed", "size": 4096}}"#).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(&path, r#"{"log_filter": "warn"}"#).unwrap();
        assert_eq!(BridgeConfig::load(&path).unwrap().log_filter, "warn");
        assert!(matches!(
            BridgeConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
    }
}
