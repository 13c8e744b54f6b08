//! Runtime configuration, usually loaded from a TOML file.

use std::fs;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::dsa::{DsaOptions, DEFAULT_CHECK_INTERVAL, DEFAULT_MAX_ADJUSTMENT_FACTOR};
use crate::registry::RegistryDefaults;
use crate::retry::{validate_max_tries, RetryOperation};
use crate::Error;

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Try ceilings.
    pub retries: RetryConfig,
    /// Delay tuning.
    pub sleep: SleepConfig,
    /// Bus access.
    pub i2c: I2cConfig,
    /// Display checks.
    pub detection: DetectionConfig,
    /// Per-display state.
    pub registry: RegistryConfig,
}

/// Default try ceiling of each operation type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Requests without a reply.
    pub write_only: u8,
    /// Requests with a reply.
    pub write_read: u8,
    /// Whole capabilities or table reads.
    pub multi_part_read: u8,
    /// Whole table writes.
    pub multi_part_write: u8,
}

/// Delay tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    /// Scales every protocol delay.
    pub multiplier: f64,
    /// Adapt delays to how reliably each display answers.
    pub dynamic: bool,
    /// Exchanges between adaptive checks.
    pub check_interval: u32,
    /// Ceiling of the adaptive factor.
    pub max_adjustment_factor: f64,
}

/// Bus access.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct I2cConfig {
    /// Read replies one byte at a time.
    pub read_bytewise: bool,
}

/// Display checks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Check displays on their own threads once there are at least this
    /// many.
    pub async_threshold: usize,
}

/// Per-display state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Milliseconds a cross-display operation waits for in-flight
    /// single-display operations.
    pub grace_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            write_only: RetryOperation::WriteOnly.default_max_tries(),
            write_read: RetryOperation::WriteRead.default_max_tries(),
            multi_part_read: RetryOperation::MultiPartRead.default_max_tries(),
            multi_part_write: RetryOperation::MultiPartWrite.default_max_tries(),
        }
    }
}

impl RetryConfig {
    /// The ceiling for `op`.
    pub fn max_tries(&self, op: RetryOperation) -> u8 {
        match op {
            RetryOperation::WriteOnly => self.write_only,
            RetryOperation::WriteRead => self.write_read,
            RetryOperation::MultiPartRead => self.multi_part_read,
            RetryOperation::MultiPartWrite => self.multi_part_write,
        }
    }
}

impl Default for SleepConfig {
    fn default() -> Self {
        SleepConfig {
            multiplier: 1.0,
            dynamic: true,
            check_interval: DEFAULT_CHECK_INTERVAL,
            max_adjustment_factor: DEFAULT_MAX_ADJUSTMENT_FACTOR,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            async_threshold: 3,
        }
    }
}

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(s)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let s = fs::read_to_string(path)?;
        Config::from_toml_str(&s)
    }

    /// Serializes the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, Error> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Checks every value is in range.
    pub fn validate(&self) -> Result<(), Error> {
        for &op in RetryOperation::ALL.iter() {
            validate_max_tries(self.retries.max_tries(op))
                .map_err(|e| Error::Config(format!("retries.{}: {}", op, e)))?;
        }

        let sleep = &self.sleep;
        if !(sleep.multiplier > 0.0 && sleep.multiplier.is_finite()) {
            return Err(Error::Config(format!("sleep.multiplier must be positive, got {}", sleep.multiplier)))
        }
        if !(sleep.max_adjustment_factor >= 1.0 && sleep.max_adjustment_factor.is_finite()) {
            return Err(Error::Config(format!("sleep.max_adjustment_factor must be at least 1, got {}", sleep.max_adjustment_factor)))
        }
        if sleep.check_interval == 0 {
            return Err(Error::Config("sleep.check_interval must be at least 1".into()))
        }

        Ok(())
    }

    /// Starting values for registry entries.
    pub fn registry_defaults(&self) -> RegistryDefaults {
        let mut max_tries = [0u8; 4];
        for &op in RetryOperation::ALL.iter() {
            max_tries[op.index()] = self.retries.max_tries(op);
        }

        RegistryDefaults {
            max_tries: max_tries,
            sleep_multiplier: self.sleep.multiplier,
            check_interval: self.sleep.check_interval,
            grace: Duration::from_millis(self.registry.grace_ms),
        }
    }

    /// Options for the adaptive sleep policy.
    pub fn dsa_options(&self) -> DsaOptions {
        DsaOptions {
            dynamic: self.sleep.dynamic,
            max_adjustment_factor: self.sleep.max_adjustment_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
        assert_eq!(Config::default().registry_defaults(), RegistryDefaults::default());
    }

    #[test]
    fn partial_sections() {
        let config = Config::from_toml_str(r#"
            [retries]
            write_read = 3

            [sleep]
            multiplier = 1.5
            dynamic = false

            [detection]
            async_threshold = 8
        "#).unwrap();
        assert_eq!(config.retries.write_read, 3);
        assert_eq!(config.retries.write_only, 4);
        assert_eq!(config.sleep.multiplier, 1.5);
        assert!(!config.dsa_options().dynamic);
        assert_eq!(config.detection.async_threshold, 8);
        assert_eq!(config.registry_defaults().max_tries[RetryOperation::WriteRead.index()], 3);
    }

    #[test]
    fn out_of_range_values() {
        assert!(Config::from_toml_str("[retries]\nwrite_only = 16").is_err());
        assert!(Config::from_toml_str("[retries]\nmulti_part_read = 0").is_err());
        assert!(Config::from_toml_str("[sleep]\nmultiplier = 0.0").is_err());
        assert!(Config::from_toml_str("[sleep]\nmax_adjustment_factor = 0.5").is_err());
        assert!(Config::from_toml_str("[sleep]\ncheck_interval = 0").is_err());
    }

    #[test]
    fn toml_round_trip() {
        let mut config = Config::default();
        config.i2c.read_bytewise = true;
        config.registry.grace_ms = 20;
        let s = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&s).unwrap(), config);
    }
}
