//! CLI Commands

pub mod accounts;
pub mod pricing;
pub mod purchases;
pub mod subscriptions;

use anyhow::Context;
use std::str::FromStr;

/// Parse an argument, naming it in the error
pub fn parse_arg<T>(name: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .with_context(|| format!("invalid --{} '{}'", name, raw))
}
