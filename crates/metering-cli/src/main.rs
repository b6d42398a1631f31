//! meterctl
//!
//! Operator CLI for the usage metering engine.
//!
//! # Usage
//!
//! ```bash
//! meterctl account open
//! meterctl account balance --tenant 6f1c...
//! meterctl charge --tenant 6f1c... --feature chatbot --units 1200 --reference msg-42
//! meterctl pricing set --key chatbot --divisor 200 --markup 1.5 --min-tokens 0.01
//! meterctl subscription consume --subscription 9a0e... --kind blast --amount 250
//! meterctl purchase status --purchase 1d2b... --status success --reference pay_123
//! meterctl --format json pricing list
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metering_common::SystemClock;
use metering_engine::{EngineConfig, MeteringEngine};

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "meterctl")]
#[command(version)]
#[command(about = "Usage metering and quota enforcement CLI", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, short, env = "METERING_CONFIG", default_value = "metering.toml")]
    config: PathBuf,

    /// Output format
    #[arg(long, short, default_value = "table")]
    format: output::OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Token accounts
    Account {
        #[command(subcommand)]
        action: AccountCommands,
    },
    /// Charge a metered call (optionally quota-gated)
    Charge(ChargeArgs),
    /// Price a call without charging
    Quote {
        #[arg(long, default_value = "default")]
        feature: String,
        #[arg(long)]
        units: u64,
    },
    /// Pricing administration
    Pricing {
        #[command(subcommand)]
        action: PricingCommands,
    },
    /// Subscription quotas
    Subscription {
        #[command(subcommand)]
        action: SubscriptionCommands,
    },
    /// Token purchases
    Purchase {
        #[command(subcommand)]
        action: PurchaseCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Open a zero-balance account (new tenant id if omitted)
    Open {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Show balance
    Balance {
        #[arg(long)]
        tenant: String,
    },
    /// Show recent usage
    History {
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Manual credit, applied once per key
    Credit {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        amount: String,
        #[arg(long)]
        key: String,
    },
}

#[derive(clap::Args)]
struct ChargeArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long, default_value = "default")]
    feature: String,
    /// Raw provider units
    #[arg(long)]
    units: u64,
    /// Request id; retries with the same id are not charged twice
    #[arg(long)]
    reference: Option<String>,
    /// JSON metadata stored with the usage record
    #[arg(long)]
    metadata: Option<String>,
    /// Consume quota on this subscription first
    #[arg(long, requires = "kind")]
    subscription: Option<String>,
    /// Quota kind to consume; needs `--subscription`
    #[arg(long, requires = "subscription")]
    kind: Option<String>,
    #[arg(long, default_value = "1")]
    quota_amount: u64,
}

#[derive(Subcommand)]
enum PricingCommands {
    /// List configs
    List,
    /// Create or replace a config
    Set {
        #[arg(long)]
        key: String,
        #[arg(long)]
        divisor: u64,
        #[arg(long)]
        markup: String,
        #[arg(long, default_value = "0.01")]
        min_tokens: String,
        #[arg(long)]
        inactive: bool,
    },
    /// Deactivate a config
    Deactivate { key: String },
    /// Activate a config
    Activate { key: String },
}

#[derive(Subcommand)]
enum SubscriptionCommands {
    /// Register a subscription term and provision its plan
    Create {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        plan: String,
        /// First day, YYYY-MM-DD
        #[arg(long)]
        start: String,
        /// Last day (inclusive), YYYY-MM-DD
        #[arg(long)]
        end: String,
        #[arg(long)]
        id: Option<String>,
    },
    /// Consume quota
    Consume {
        #[arg(long)]
        subscription: String,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        amount: u64,
    },
    /// Show usage with rollover applied
    Usage {
        #[arg(long)]
        subscription: String,
        #[arg(long)]
        kind: String,
    },
}

#[derive(Subcommand)]
enum PurchaseCommands {
    /// List configured packages
    Packages,
    /// Start a pending purchase
    Open {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        package: String,
        #[arg(long)]
        reference: String,
    },
    /// Apply a payment status notification
    Status {
        #[arg(long)]
        purchase: String,
        #[arg(long)]
        status: String,
        #[arg(long)]
        reference: String,
    },
    /// Expire stale pending purchases
    Expire,
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let found = cli.config.exists();
    let config = if found {
        EngineConfig::load(&cli.config)?
    } else {
        EngineConfig::default()
    };

    init_tracing(&config.log.filter);
    if !found {
        tracing::warn!(path = %cli.config.display(), "config not found, using defaults");
    }

    let engine = MeteringEngine::from_config(config, Arc::new(SystemClock)).await?;

    match cli.command {
        Commands::Account { action } => commands::accounts::handle(action, &engine, cli.format).await,
        Commands::Charge(args) => commands::accounts::charge(args, &engine, cli.format).await,
        Commands::Quote { feature, units } => commands::pricing::quote(&feature, units, &engine, cli.format).await,
        Commands::Pricing { action } => commands::pricing::handle(action, &engine, cli.format).await,
        Commands::Subscription { action } => commands::subscriptions::handle(action, &engine, cli.format).await,
        Commands::Purchase { action } => commands::purchases::handle(action, &engine, cli.format).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_quota_flags_require_each_other() {
        let base = ["meterctl", "charge", "--tenant", "6f1c", "--units", "10"];

        let kind_only = Cli::try_parse_from(base.iter().copied().chain(["--kind", "ai"]));
        assert_eq!(
            kind_only.err().map(|e| e.kind()),
            Some(clap::error::ErrorKind::MissingRequiredArgument)
        );

        let subscription_only = Cli::try_parse_from(base.iter().copied().chain(["--subscription", "9a0e"]));
        assert!(subscription_only.is_err());

        let both = Cli::try_parse_from(base.iter().copied().chain(["--subscription", "9a0e", "--kind", "ai"]));
        assert!(both.is_ok());
        assert!(Cli::try_parse_from(base).is_ok());
    }
}
