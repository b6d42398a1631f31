//! Account and charge commands

use anyhow::Context;
use serde::Serialize;

use metering_common::{FeatureKey, SubscriptionId, TenantId, Tokens};
use metering_engine::{ChargeRequest, FeatureInvocation, MeteringEngine, QuotaGate, QuotaKind};

use super::parse_arg;
use crate::{output::OutputFormat, AccountCommands, ChargeArgs};

#[derive(Debug, Serialize)]
struct Balance {
    tenant_id: TenantId,
    balance: Tokens,
}

#[derive(Debug, Serialize)]
struct CreditResult {
    tenant_id: TenantId,
    applied: bool,
    balance: Tokens,
}

pub async fn handle(action: AccountCommands, engine: &MeteringEngine, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        AccountCommands::Open { tenant } => {
            let tenant_id = match tenant {
                Some(raw) => parse_arg::<TenantId>("tenant", &raw)?,
                None => TenantId::new_v4(),
            };
            if !engine.ledger.open_account(tenant_id).await? {
                eprintln!("Account {} already exists", tenant_id);
            }
            let balance = engine.ledger.balance(tenant_id).await?;
            format.print(&Balance { tenant_id, balance })?;
        }
        AccountCommands::Balance { tenant } => {
            let tenant_id = parse_arg::<TenantId>("tenant", &tenant)?;
            let balance = engine.ledger.balance(tenant_id).await?;
            format.print(&Balance { tenant_id, balance })?;
        }
        AccountCommands::History { tenant, limit } => {
            let tenant_id = parse_arg::<TenantId>("tenant", &tenant)?;
            let records = engine.ledger.history(tenant_id, limit).await?;
            format.print(&records)?;
        }
        AccountCommands::Credit { tenant, amount, key } => {
            let tenant_id = parse_arg::<TenantId>("tenant", &tenant)?;
            let amount = parse_arg::<Tokens>("amount", &amount)?;
            let outcome = engine.ledger.credit(tenant_id, amount, &key).await?;
            format.print(&CreditResult {
                tenant_id,
                applied: outcome.was_applied(),
                balance: outcome.balance(),
            })?;
        }
    }
    Ok(())
}

pub async fn charge(args: ChargeArgs, engine: &MeteringEngine, format: OutputFormat) -> anyhow::Result<()> {
    let tenant_id = parse_arg::<TenantId>("tenant", &args.tenant)?;
    let feature = parse_arg::<FeatureKey>("feature", &args.feature)?;

    let mut request = ChargeRequest::new(tenant_id, feature, args.units);
    if let Some(reference) = args.reference {
        request = request.reference(reference);
    }
    if let Some(raw) = args.metadata {
        let metadata = serde_json::from_str(&raw).context("invalid --metadata JSON")?;
        request = request.metadata(metadata);
    }

    let quota = match (args.subscription, args.kind) {
        (Some(subscription), Some(kind)) => Some(QuotaGate {
            subscription_id: parse_arg::<SubscriptionId>("subscription", &subscription)?,
            kind: parse_arg::<QuotaKind>("kind", &kind)?,
            amount: args.quota_amount,
        }),
        _ => None,
    };

    let receipt = engine
        .invoke(FeatureInvocation {
            quota,
            charge: Some(request),
        })
        .await?;
    format.print(&receipt)?;
    Ok(())
}
