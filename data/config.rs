//! # Strategy Configuration
//!
//! The strategy configuration names the comparator, the strategies under
//! evaluation, their list prices and the cost perspectives present in the PSA
//! file. It is read once at the start of an analysis and never mutated.
//!
//! The YAML document must carry every key in [`REQUIRED_KEYS`]; `labels` is
//! optional and maps internal strategy names to the names printed in tables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Top-level keys that must be present in every strategy configuration file.
pub const REQUIRED_KEYS: [&str; 6] = [
    "base",
    "perspectives",
    "strategies",
    "prices",
    "effects_unit",
    "currency",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Reference comparator; always one of `strategies`.
    pub base: String,
    /// Ordered cost perspectives, e.g. `health_system`, `societal`.
    pub perspectives: Vec<String>,
    /// Strategy names in the order used for every derived table.
    pub strategies: Vec<String>,
    /// List prices used to build the price-adjusted cost `K`.
    pub prices: BTreeMap<String, f64>,
    pub effects_unit: String,
    pub currency: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read strategy configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse strategy configuration YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("The strategy configuration must be a YAML mapping at the top level.")]
    NotAMapping,
    #[error("The strategy configuration is missing the required key '{0}'.")]
    MissingKey(&'static str),
    #[error("The strategy configuration lists no strategies.")]
    EmptyStrategies,
    #[error("Strategy '{0}' is listed more than once in the configuration.")]
    DuplicateStrategy(String),
    #[error("Base strategy '{0}' is not one of the configured strategies.")]
    BaseNotInStrategies(String),
    #[error("A price is configured for '{0}', which is not one of the configured strategies.")]
    UnknownPricedStrategy(String),
    #[error("The configured price for '{strategy}' is not a finite number (found {value}).")]
    NonFinitePrice { strategy: String, value: f64 },
    #[error(
        "Perspective '{requested}' does not match any configured perspective (available: {available})."
    )]
    UnknownPerspective { requested: String, available: String },
}

impl StrategyConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parses a YAML document, checking required keys before deserialising so
    /// that a missing key is reported by name.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        let mapping = value.as_mapping().ok_or(ConfigError::NotAMapping)?;
        for key in REQUIRED_KEYS {
            if !mapping.contains_key(key) {
                return Err(ConfigError::MissingKey(key));
            }
        }
        let config: StrategyConfig = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.strategies.is_empty() {
            return Err(ConfigError::EmptyStrategies);
        }
        let mut seen = HashSet::with_capacity(self.strategies.len());
        for name in &self.strategies {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateStrategy(name.clone()));
            }
        }
        if !seen.contains(self.base.as_str()) {
            return Err(ConfigError::BaseNotInStrategies(self.base.clone()));
        }
        for (strategy, &value) in &self.prices {
            if !seen.contains(strategy.as_str()) {
                return Err(ConfigError::UnknownPricedStrategy(strategy.clone()));
            }
            if !value.is_finite() {
                return Err(ConfigError::NonFinitePrice {
                    strategy: strategy.clone(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Display name for a strategy, falling back to the internal name.
    pub fn label<'a>(&'a self, strategy: &'a str) -> &'a str {
        self.labels
            .get(strategy)
            .map(String::as_str)
            .unwrap_or(strategy)
    }

    pub fn price(&self, strategy: &str) -> Option<f64> {
        self.prices.get(strategy).copied()
    }

    /// Matches a user-supplied perspective against the configured ones,
    /// ignoring case, underscores and hyphens. Returns the configured spelling.
    pub fn resolve_perspective(&self, requested: &str) -> Result<String, ConfigError> {
        let wanted = normalize_perspective(requested);
        self.perspectives
            .iter()
            .find(|candidate| normalize_perspective(candidate) == wanted)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPerspective {
                requested: requested.to_string(),
                available: self.perspectives.join(", "),
            })
    }
}

/// Canonical form used to compare perspective names: lowercase, with `_` and
/// `-` treated as spaces and runs of whitespace collapsed.
pub fn normalize_perspective(raw: &str) -> String {
    raw.to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
