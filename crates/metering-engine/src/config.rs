//! Engine Configuration

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use metering_common::{FeatureKey, Tokens};

use crate::error::{MeteringError, MeteringResult};
use crate::pricing::PricingConfig;
use crate::purchases::TokenPackage;
use crate::quota::{QuotaCaps, QuotaPlan};

/// Engine configuration, usually read from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Storage backend
    pub store: StoreConfig,
    /// Pricing cache and seed data
    pub pricing: PricingSettings,
    /// Purchase catalogue
    pub purchases: PurchaseSettings,
    /// Quota plans
    pub plans: Vec<QuotaPlan>,
    /// Logging
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            pricing: PricingSettings::default(),
            purchases: PurchaseSettings::default(),
            plans: vec![
                QuotaPlan {
                    name: "starter".into(),
                    blast: QuotaCaps::new(1_000, 100),
                    ai: QuotaCaps::new(500, 50),
                },
                QuotaPlan {
                    name: "growth".into(),
                    blast: QuotaCaps::new(10_000, 1_000),
                    ai: QuotaCaps::new(5_000, 500),
                },
                QuotaPlan {
                    name: "enterprise".into(),
                    blast: QuotaCaps::new(0, 0),
                    ai: QuotaCaps::new(0, 0),
                },
            ],
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> MeteringResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MeteringError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| MeteringError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, or fall back to defaults if it does not exist
    ///
    /// A file that exists but does not parse is still an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> MeteringResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> MeteringResult<String> {
        toml::to_string_pretty(self).map_err(|e| MeteringError::Config(e.to_string()))
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> MeteringResult<()> {
        if self.store.op_timeout_ms == 0 {
            return Err(MeteringError::Config("store.op_timeout_ms must be positive".into()));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.as_os_str().is_empty() {
            return Err(MeteringError::Config("store.path is required for the sqlite backend".into()));
        }

        for seed in &self.pricing.seed {
            seed.validate()?;
        }

        let mut seen = HashSet::new();
        for package in &self.purchases.packages {
            if !seen.insert(package.id.as_str()) {
                return Err(MeteringError::Config(format!("duplicate package id '{}'", package.id)));
            }
            if package.tokens.is_zero() {
                return Err(MeteringError::Config(format!("package '{}' grants no tokens", package.id)));
            }
        }

        let mut seen = HashSet::new();
        for plan in &self.plans {
            if !seen.insert(plan.name.as_str()) {
                return Err(MeteringError::Config(format!("duplicate plan '{}'", plan.name)));
            }
        }
        Ok(())
    }

    /// Plan by name
    pub fn plan(&self, name: &str) -> Option<&QuotaPlan> {
        self.plans.iter().find(|p| p.name == name)
    }
}

/// Which store to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; lost on exit
    Memory,
    /// SQLite file
    Sqlite,
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend kind
    pub backend: StoreBackend,
    /// Database file for `sqlite`
    pub path: PathBuf,
    /// Per-operation deadline
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from("metering.sqlite"),
            op_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Deadline as a duration
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Pricing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingSettings {
    /// Refresh interval of the resolver cache
    pub cache_ttl_secs: u64,
    /// Maximum cached resolutions
    pub cache_capacity: u64,
    /// Configs inserted at startup when their key is absent
    pub seed: Vec<PricingConfig>,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            cache_capacity: 1_024,
            seed: vec![PricingConfig::new(
                FeatureKey::default_key(),
                1_000,
                Decimal::ONE,
                Tokens::from_minor_units(1).unwrap_or_default(),
            )],
        }
    }
}

impl PricingSettings {
    /// Cache refresh interval
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Purchase settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurchaseSettings {
    /// Pending purchases older than this are expired
    pub pending_ttl_hours: u32,
    /// Sellable packages
    pub packages: Vec<TokenPackage>,
}

impl Default for PurchaseSettings {
    fn default() -> Self {
        let package = |id: &str, name: &str, minor: i64, price: Decimal| TokenPackage {
            id: id.into(),
            name: name.into(),
            tokens: Tokens::from_minor_units(minor).unwrap_or_default(),
            price,
        };
        Self {
            pending_ttl_hours: 24,
            packages: vec![
                package("tokens-100", "100 AI tokens", 10_000, dec!(5.00)),
                package("tokens-500", "500 AI tokens", 50_000, dec!(20.00)),
                package("tokens-2000", "2000 AI tokens", 200_000, dec!(70.00)),
            ],
        }
    }
}

impl PurchaseSettings {
    /// Pending TTL as a chrono duration
    pub fn pending_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.pending_ttl_hours))
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: "info".into() }
    }
}
