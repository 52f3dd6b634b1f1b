//! Configuration surface (§6).
//!
//! Deserialized from YAML via `serde_yaml`; every field carries a
//! `Default` matching the documented default so a partial file only
//! overrides what it names. `Config::load` deserializes then validates.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7497,
            client_id: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsConfig {
    pub provider_code: String,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            provider_code: "BZ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub worker_count: usize,
    pub price_mult: f64,
    pub vol_mult: f64,
    pub cooldown_sec: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            price_mult: 3.0,
            vol_mult: 5.0,
            cooldown_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub per_trade_fraction: f64,
    pub take_profit_pct: f64,
    pub max_hold_sec: i64,
    pub account_value_tag: String,
    pub primary_exchange: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            per_trade_fraction: 0.01,
            take_profit_pct: 0.02,
            max_hold_sec: 600,
            account_value_tag: "NetLiquidation".to_string(),
            primary_exchange: "ISLAND".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub url: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8088/extract".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// When absent, an in-memory store is used (tests, `--dry-run`).
    pub path: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub news: NewsConfig,
    pub detection: DetectionConfig,
    pub risk: RiskConfig,
    pub extractor: ExtractorConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load and validate a configuration file. Validation rejects
    /// out-of-range fractions/multipliers and empty host/url fields with
    /// `EngineError::Config`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Config(format!("reading {}: {e}", path.as_ref().display())))?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(EngineError::Config("broker.host must not be empty".into()));
        }
        if self.news.provider_code.trim().is_empty() {
            return Err(EngineError::Config("news.provider_code must not be empty".into()));
        }
        if self.detection.worker_count == 0 {
            return Err(EngineError::Config("detection.worker_count must be > 0".into()));
        }
        if !(self.detection.price_mult > 0.0) {
            return Err(EngineError::Config("detection.price_mult must be > 0".into()));
        }
        if !(self.detection.vol_mult > 0.0) {
            return Err(EngineError::Config("detection.vol_mult must be > 0".into()));
        }
        if !(self.risk.per_trade_fraction > 0.0 && self.risk.per_trade_fraction <= 1.0) {
            return Err(EngineError::Config(
                "risk.per_trade_fraction must be in (0,1]".into(),
            ));
        }
        if !(self.risk.take_profit_pct > 0.0 && self.risk.take_profit_pct <= 1.0) {
            return Err(EngineError::Config("risk.take_profit_pct must be in (0,1]".into()));
        }
        if self.risk.max_hold_sec <= 0 {
            return Err(EngineError::Config("risk.max_hold_sec must be > 0".into()));
        }
        if self.risk.primary_exchange.trim().is_empty() {
            return Err(EngineError::Config("risk.primary_exchange must not be empty".into()));
        }
        if self.extractor.url.trim().is_empty() {
            return Err(EngineError::Config("extractor.url must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_fraction() {
        let mut config = Config::default();
        config.risk.per_trade_fraction = 1.5;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_empty_host() {
        let mut config = Config::default();
        config.broker.host = String::new();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn parses_documented_yaml_example() {
        let yaml = r#"
broker:
  host: "127.0.0.1"
  port: 7497
  client_id: 7
news:
  provider_code: "BZ"
detection:
  worker_count: 4
  price_mult: 3.0
  vol_mult: 5.0
  cooldown_sec: 300
risk:
  per_trade_fraction: 0.01
  take_profit_pct: 0.02
  max_hold_sec: 600
extractor:
  url: "http://localhost:8088/extract"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.broker.port, 7497);
        assert_eq!(config.detection.worker_count, 4);
    }
}
