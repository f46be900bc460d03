//! Configuration for the ledger and the node around it
//!
//! Defaults first, then an optional file, then `ESCROW_`-prefixed
//! environment variables (nested keys joined with `__`, for example
//! `ESCROW_LEDGER__OWNER=0xabc`).

use crate::{
    error::LedgerError,
    models::{Amount, Identity},
    LedgerResult,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ledger settings fixed at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Owning identity with deadline-refund authority over every record
    #[serde(default = "default_owner")]
    pub owner: Identity,
    /// Largest accepted deposit, unlimited when unset
    #[serde(default, with = "base_units_setting")]
    pub max_amount: Option<Amount>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            max_amount: None,
        }
    }
}

/// Background refund of expired escrows by the owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_sweep_interval(),
        }
    }
}

/// Configuration for an escrow node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// Filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            sweeper: SweeperConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_owner() -> Identity {
    Identity::from("operator")
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Base-unit amounts as settings
///
/// The config crate stops at 64-bit integers, so amounts are written out as
/// decimal strings and read back from either an integer or a string.
mod base_units_setting {
    use crate::models::Amount;
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawAmount {
        Integer(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<Amount>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(amount) => serializer.serialize_some(&amount.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Amount>, D::Error> {
        let raw = match Option::<RawAmount>::deserialize(deserializer)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let base_units = match raw {
            RawAmount::Integer(units) => u128::from(units),
            RawAmount::Text(text) => text.trim().parse::<u128>().map_err(|e| {
                de::Error::custom(format!("invalid amount '{}': {}", text, e))
            })?,
        };

        Ok(Some(Amount::new(base_units)))
    }
}

impl NodeConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> LedgerResult<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&NodeConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ESCROW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> LedgerResult<()> {
        if self.ledger.owner.is_null() {
            return Err(LedgerError::config("ledger owner cannot be null"));
        }

        if matches!(self.ledger.max_amount, Some(max) if max.is_zero()) {
            return Err(LedgerError::config("max_amount must be greater than 0"));
        }

        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(LedgerError::config(
                "sweeper interval must be greater than 0",
            ));
        }

        Ok(())
    }
}
