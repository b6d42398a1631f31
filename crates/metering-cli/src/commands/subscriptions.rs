//! Subscription commands

use chrono::NaiveDate;

use metering_common::{SubscriptionId, TenantId};
use metering_engine::{MeteringEngine, QuotaKind, SubscriptionTerm};

use super::parse_arg;
use crate::{output::OutputFormat, SubscriptionCommands};

pub async fn handle(
    action: SubscriptionCommands,
    engine: &MeteringEngine,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match action {
        SubscriptionCommands::Create {
            tenant,
            plan,
            start,
            end,
            id,
        } => {
            let subscription_id = match id {
                Some(raw) => parse_arg::<SubscriptionId>("id", &raw)?,
                None => SubscriptionId::new_v4(),
            };
            let term = SubscriptionTerm {
                subscription_id,
                tenant_id: parse_arg::<TenantId>("tenant", &tenant)?,
                plan: plan.clone(),
                start_date: parse_arg::<NaiveDate>("start", &start)?,
                end_date: parse_arg::<NaiveDate>("end", &end)?,
            };
            engine.provision_subscription(&term, &plan).await?;
            format.print(&term)?;
        }
        SubscriptionCommands::Consume {
            subscription,
            kind,
            amount,
        } => {
            let subscription_id = parse_arg::<SubscriptionId>("subscription", &subscription)?;
            let kind = parse_arg::<QuotaKind>("kind", &kind)?;
            let quota = engine.quotas.check_and_consume(subscription_id, amount, kind).await?;
            format.print(&quota)?;
        }
        SubscriptionCommands::Usage { subscription, kind } => {
            let subscription_id = parse_arg::<SubscriptionId>("subscription", &subscription)?;
            let kind = parse_arg::<QuotaKind>("kind", &kind)?;
            let usage = engine.quotas.usage(subscription_id, kind).await?;
            format.print(&usage)?;
        }
    }
    Ok(())
}
