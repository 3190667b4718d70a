//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::constants::{DEFAULT_TABLE_SIZE, MAX_TABLE_SIZE};
use crate::utility::is_power_of_two;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpochConfig {
    /// Epoch table configuration.
    pub epoch: Option<EpochSection>,
}

/// `[epoch]` section of the configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpochSection {
    /// Number of usable slots in the entry table. Must be a power of two,
    /// at most 32768.
    pub table_size: Option<u64>,
}

impl EpochConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIEPOCH_CONFIG` env var (if set),
    /// then apply `OXIEPOCH__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXIEPOCH_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIEPOCH__") {
                continue;
            }
            let path = key["OXIEPOCH__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            if let ["epoch", "table_size"] = parts.as_slice() {
                self.epoch_mut().table_size = Some(parse_value(&key, &value)?);
            }
            // Unknown keys are ignored so unrelated OXIEPOCH__ vars do not
            // break startup.
        }
        Ok(())
    }

    /// Resolve the entry table size, falling back to the default and
    /// validating the constraints on it.
    pub fn resolved_table_size(&self) -> Result<usize, ConfigError> {
        let table_size = self
            .epoch
            .as_ref()
            .and_then(|e| e.table_size)
            .unwrap_or(DEFAULT_TABLE_SIZE as u64);
        if !is_power_of_two(table_size) || table_size > MAX_TABLE_SIZE as u64 {
            return Err(ConfigError::InvalidValue {
                key: "epoch.table_size".to_string(),
                value: table_size.to_string(),
            });
        }
        Ok(table_size as usize)
    }

    fn epoch_mut(&mut self) -> &mut EpochSection {
        self.epoch.get_or_insert_with(EpochSection::default)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
