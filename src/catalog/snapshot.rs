//! Immutable configuration snapshot shared by in-flight requests.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::pricing::PricingTable;
use super::registry::ProviderRegistry;
use crate::config::{Config, ConfigError};

/// Pricing table and provider registry, built and published as one unit.
///
/// A request loads the snapshot once and uses it for resolution and costing,
/// so a concurrent reload can never give it one half of each.
#[derive(Debug)]
pub struct Snapshot {
    pub version: u64,
    pub pricing: PricingTable,
    pub registry: ProviderRegistry,
    pub retry_backoff: Duration,
    pub loaded_at: DateTime<Utc>,
}

impl Snapshot {
    /// Validate `config` and build a snapshot from it.
    pub fn from_config(config: &Config, version: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            version,
            pricing: PricingTable::from_config(config),
            registry: ProviderRegistry::from_config(config)?,
            retry_backoff: Duration::from_millis(config.gateway.retry_backoff_ms),
            loaded_at: Utc::now(),
        })
    }

    /// A snapshot with no models, for tests and tooling.
    pub fn empty() -> Self {
        Self {
            version: 0,
            pricing: PricingTable::default(),
            registry: ProviderRegistry::default(),
            retry_backoff: Duration::ZERO,
            loaded_at: Utc::now(),
        }
    }
}
