//! Pricing Resolver
//!
//! Maps a feature key to the formula that turns raw provider units into a
//! token charge. Lookups go through a TTL cache; the administrative write
//! path invalidates it so updates are visible immediately in this process
//! and within one refresh interval everywhere else.

use moka::sync::Cache;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metering_common::{FeatureKey, Tokens, TOKEN_SCALE};

use crate::error::{MeteringError, MeteringResult};
use crate::store::StoreHandle;

/// Cost formula for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Feature key, or `"default"`
    pub key: FeatureKey,
    /// Raw units per charged unit
    pub divisor: u64,
    /// Multiplier applied after division
    pub markup: Decimal,
    /// Floor charged per request, even for zero usage
    pub min_tokens: Tokens,
    /// Inactive configs fall through to the default
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl PricingConfig {
    /// Create an active config
    pub fn new(key: FeatureKey, divisor: u64, markup: Decimal, min_tokens: Tokens) -> Self {
        Self {
            key,
            divisor,
            markup,
            min_tokens,
            is_active: true,
        }
    }

    /// Check invariants
    pub fn validate(&self) -> MeteringResult<()> {
        if self.divisor == 0 {
            return Err(MeteringError::InvalidPricing(format!(
                "{}: divisor must be positive",
                self.key
            )));
        }
        if self.markup < Decimal::ZERO {
            return Err(MeteringError::InvalidPricing(format!(
                "{}: markup must be >= 0, got {}",
                self.key, self.markup
            )));
        }
        Ok(())
    }
}

/// Charge for `raw_units` under `config`
///
/// `max((raw_units / divisor) * markup, min_tokens)`, rounded half-up to two
/// decimal places. `min_tokens` already has two decimals, so rounding can
/// never take the result below the floor.
pub fn compute_charge(config: &PricingConfig, raw_units: u64) -> MeteringResult<Tokens> {
    let overflow = || MeteringError::InvalidPricing(format!("{}: charge overflows", config.key));

    let computed = Decimal::from(raw_units)
        .checked_div(Decimal::from(config.divisor))
        .and_then(|units| units.checked_mul(config.markup))
        .ok_or_else(overflow)?;

    let floored = computed.max(config.min_tokens.value());
    let charged = floored.round_dp_with_strategy(TOKEN_SCALE, RoundingStrategy::MidpointAwayFromZero);

    Ok(Tokens::new(charged)?)
}

/// Resolves feature keys to pricing with an invalidate-on-write cache
pub struct PricingResolver {
    store: StoreHandle,
    cache: Cache<FeatureKey, Arc<PricingConfig>>,
    /// Bumped on every invalidation; loads started before a bump are not cached
    generation: AtomicU64,
}

impl PricingResolver {
    /// Create resolver; `refresh` bounds how stale a cached entry can get
    pub fn new(store: StoreHandle, capacity: u64, refresh: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(refresh)
            .build();

        Self {
            store,
            cache,
            generation: AtomicU64::new(0),
        }
    }

    /// Active config for `key`, falling back to the active `"default"`
    pub async fn resolve(&self, key: &FeatureKey) -> MeteringResult<Arc<PricingConfig>> {
        if let Some(hit) = self.cache.get(key) {
            tracing::debug!(feature = %key, resolved = %hit.key, "pricing cache hit");
            return Ok(hit);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let resolved = Arc::new(self.load(key).await?);

        if self.generation.load(Ordering::Acquire) == generation {
            self.cache.insert(key.clone(), resolved.clone());
        }
        Ok(resolved)
    }

    async fn load(&self, key: &FeatureKey) -> MeteringResult<PricingConfig> {
        if !key.is_default() {
            let specific = self.store.run(self.store.get().pricing_config(key)).await?;
            if let Some(config) = specific.filter(|c| c.is_active) {
                return Ok(config);
            }
        }

        let default_key = FeatureKey::default_key();
        match self.store.run(self.store.get().pricing_config(&default_key)).await? {
            Some(config) if config.is_active => {
                tracing::debug!(feature = %key, "falling back to default pricing");
                Ok(config)
            }
            _ => {
                tracing::error!(feature = %key, "no pricing configured");
                Err(MeteringError::NoPricingConfigured {
                    feature: key.clone(),
                })
            }
        }
    }

    /// Charge for `raw_units` of `key` without debiting anything
    pub async fn quote(&self, key: &FeatureKey, raw_units: u64) -> MeteringResult<Tokens> {
        let config = self.resolve(key).await?;
        compute_charge(&config, raw_units)
    }

    /// Replace a config (administrative path)
    pub async fn upsert(&self, config: PricingConfig) -> MeteringResult<()> {
        config.validate()?;
        self.store.run(self.store.get().upsert_pricing(&config)).await?;
        self.invalidate();

        tracing::info!(
            feature = %config.key,
            divisor = config.divisor,
            markup = %config.markup,
            min_tokens = %config.min_tokens,
            active = config.is_active,
            "pricing updated"
        );
        Ok(())
    }

    /// Insert a config only if its key is new; `true` if inserted
    pub async fn seed(&self, config: PricingConfig) -> MeteringResult<bool> {
        config.validate()?;
        let inserted = self
            .store
            .run(self.store.get().insert_pricing_if_absent(&config))
            .await?;
        if inserted {
            self.invalidate();
        }
        Ok(inserted)
    }

    /// Activate or deactivate a config; `false` if the key is unknown
    pub async fn set_active(&self, key: &FeatureKey, active: bool) -> MeteringResult<bool> {
        let found = self
            .store
            .run(self.store.get().set_pricing_active(key, active))
            .await?;
        self.invalidate();

        if found {
            tracing::info!(feature = %key, active, "pricing activation changed");
        }
        Ok(found)
    }

    /// All stored configs, bypassing the cache
    pub async fn list(&self) -> MeteringResult<Vec<PricingConfig>> {
        Ok(self.store.run(self.store.get().list_pricing()).await?)
    }

    /// Drop every cached resolution
    ///
    /// A change to `"default"` affects every key that fell back to it, so
    /// invalidation is always cache-wide.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate_all();
    }
}
