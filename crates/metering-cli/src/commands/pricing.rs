//! Pricing commands

use anyhow::bail;
use rust_decimal::Decimal;
use serde::Serialize;

use metering_common::{FeatureKey, Tokens};
use metering_engine::{MeteringEngine, PricingConfig};

use super::parse_arg;
use crate::{output::OutputFormat, PricingCommands};

#[derive(Debug, Serialize)]
struct Quote {
    feature: FeatureKey,
    pricing: FeatureKey,
    raw_units: u64,
    charge: Tokens,
}

pub async fn handle(action: PricingCommands, engine: &MeteringEngine, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        PricingCommands::List => {
            let configs = engine.pricing.list().await?;
            format.print(&configs)?;
        }
        PricingCommands::Set {
            key,
            divisor,
            markup,
            min_tokens,
            inactive,
        } => {
            let mut config = PricingConfig::new(
                parse_arg::<FeatureKey>("key", &key)?,
                divisor,
                parse_arg::<Decimal>("markup", &markup)?,
                parse_arg::<Tokens>("min-tokens", &min_tokens)?,
            );
            config.is_active = !inactive;
            engine.pricing.upsert(config.clone()).await?;
            format.print(&config)?;
        }
        PricingCommands::Deactivate { key } => set_active(engine, &key, false).await?,
        PricingCommands::Activate { key } => set_active(engine, &key, true).await?,
    }
    Ok(())
}

async fn set_active(engine: &MeteringEngine, key: &str, active: bool) -> anyhow::Result<()> {
    let key = parse_arg::<FeatureKey>("key", key)?;
    if !engine.pricing.set_active(&key, active).await? {
        bail!("no pricing config for '{}'", key);
    }
    println!("{} {}", key, if active { "activated" } else { "deactivated" });
    Ok(())
}

pub async fn quote(feature: &str, units: u64, engine: &MeteringEngine, format: OutputFormat) -> anyhow::Result<()> {
    let feature = parse_arg::<FeatureKey>("feature", feature)?;
    let config = engine.pricing.resolve(&feature).await?;
    let charge = engine.meter.quote(&feature, units).await?;

    format.print(&Quote {
        feature,
        pricing: config.key.clone(),
        raw_units: units,
        charge,
    })?;
    Ok(())
}
