//! Purchase commands

use serde::Serialize;

use metering_common::{PaymentReference, PurchaseId, TenantId};
use metering_engine::{MeteringEngine, PurchaseStatus, ReconcileOutcome};

use super::parse_arg;
use crate::{output::OutputFormat, PurchaseCommands};

#[derive(Debug, Serialize)]
struct Reconciled {
    purchase_id: PurchaseId,
    outcome: &'static str,
    status: Option<PurchaseStatus>,
    balance: Option<String>,
}

impl Reconciled {
    fn new(purchase_id: PurchaseId, outcome: &ReconcileOutcome) -> Self {
        let (name, status, balance) = match outcome {
            ReconcileOutcome::Credited { purchase, balance } => ("credited", Some(purchase.status), Some(balance.to_string())),
            ReconcileOutcome::AlreadyCredited { purchase, balance } => {
                ("already_credited", Some(purchase.status), Some(balance.to_string()))
            }
            ReconcileOutcome::StatusRecorded(p) => ("status_recorded", Some(p.status), None),
            ReconcileOutcome::Duplicate(p) => ("duplicate", Some(p.status), None),
            ReconcileOutcome::InvalidTransition { from, .. } => ("invalid_transition", Some(*from), None),
            ReconcileOutcome::PurchaseNotFound => ("purchase_not_found", None, None),
            ReconcileOutcome::ReferenceMismatch => ("reference_mismatch", None, None),
        };
        Self {
            purchase_id,
            outcome: name,
            status,
            balance,
        }
    }
}

pub async fn handle(action: PurchaseCommands, engine: &MeteringEngine, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        PurchaseCommands::Packages => {
            format.print(&engine.purchases.packages())?;
        }
        PurchaseCommands::Open {
            tenant,
            package,
            reference,
        } => {
            let purchase = engine
                .purchases
                .open_purchase(
                    parse_arg::<TenantId>("tenant", &tenant)?,
                    &package,
                    parse_arg::<PaymentReference>("reference", &reference)?,
                )
                .await?;
            format.print(&purchase)?;
        }
        PurchaseCommands::Status {
            purchase,
            status,
            reference,
        } => {
            let purchase_id = parse_arg::<PurchaseId>("purchase", &purchase)?;
            let outcome = engine
                .purchases
                .on_payment_status_changed(
                    purchase_id,
                    parse_arg::<PurchaseStatus>("status", &status)?,
                    &parse_arg::<PaymentReference>("reference", &reference)?,
                )
                .await?;
            format.print(&Reconciled::new(purchase_id, &outcome))?;
        }
        PurchaseCommands::Expire => {
            let expired = engine.purchases.expire_stale().await?;
            format.print(&expired)?;
        }
    }
    Ok(())
}
