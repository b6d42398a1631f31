//! Purchase Reconciler
//!
//! Applies payment-gateway status notifications to purchases. Notifications
//! arrive at least once and possibly out of order; the status machine is
//! one-way (`pending -> success | failed | expired`) and only `success`
//! credits the ledger, keyed by the payment reference.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use metering_common::{Clock, DomainError, PaymentReference, PurchaseId, TenantId, Tokens};

use crate::error::{MeteringError, MeteringResult};
use crate::ledger::{CreditOutcome, TokenLedger};
use crate::store::{StoreHandle, TransitionWrite};

/// Purchase status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    /// Awaiting payment
    Pending,
    /// Paid; tokens granted
    Success,
    /// Payment failed
    Failed,
    /// Never completed in time
    Expired,
}

impl PurchaseStatus {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Terminal statuses never change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether `self -> to` is allowed
    pub fn can_transition_to(&self, to: PurchaseStatus) -> bool {
        *self == Self::Pending && to.is_terminal()
    }
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurchaseStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(DomainError::InvalidIdentifier(format!(
                "unknown purchase status '{}'",
                other
            ))),
        }
    }
}

/// A tenant's order for a token package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    /// Purchase id
    pub id: PurchaseId,
    /// Buyer
    pub tenant_id: TenantId,
    /// Package bought
    pub package_id: String,
    /// Gateway reference; unique, and the credit idempotency key
    pub payment_reference: PaymentReference,
    /// Tokens granted on success
    pub token_amount: Tokens,
    /// Current status
    pub status: PurchaseStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Purchase {
    /// New pending purchase
    pub fn pending(
        tenant_id: TenantId,
        package_id: impl Into<String>,
        payment_reference: PaymentReference,
        token_amount: Tokens,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PurchaseId::new_v4(),
            tenant_id,
            package_id: package_id.into(),
            payment_reference,
            token_amount,
            status: PurchaseStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status change in place
    pub fn transition(&mut self, to: PurchaseStatus, at: DateTime<Utc>) -> MeteringResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(MeteringError::InvalidStatusTransition { from: self.status, to });
        }
        self.status = to;
        self.updated_at = at;
        Ok(())
    }
}

/// Sellable bundle of tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPackage {
    /// Package id
    pub id: String,
    /// Display name
    pub name: String,
    /// Tokens granted
    pub tokens: Tokens,
    /// List price in the billing currency
    pub price: Decimal,
}

/// What a status notification did
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Moved to success and credited the ledger
    Credited {
        /// Purchase after the change
        purchase: Purchase,
        /// Balance after the credit
        balance: Tokens,
    },
    /// Redelivered success; credit re-issued and found already applied
    AlreadyCredited {
        /// Stored purchase
        purchase: Purchase,
        /// Current balance
        balance: Tokens,
    },
    /// Moved to failed or expired
    StatusRecorded(Purchase),
    /// Same terminal status delivered again
    Duplicate(Purchase),
    /// Terminal status asked to change; ignored
    InvalidTransition {
        /// Stored status
        from: PurchaseStatus,
        /// Requested status
        to: PurchaseStatus,
    },
    /// Unknown purchase id; ignored
    PurchaseNotFound,
    /// Reference does not match the stored purchase; ignored
    ReferenceMismatch,
}

/// Drives purchases through their status machine
pub struct PurchaseReconciler {
    store: StoreHandle,
    ledger: Arc<TokenLedger>,
    clock: Arc<dyn Clock>,
    packages: HashMap<String, TokenPackage>,
    pending_ttl: Duration,
}

impl PurchaseReconciler {
    /// Create reconciler
    pub fn new(
        store: StoreHandle,
        ledger: Arc<TokenLedger>,
        clock: Arc<dyn Clock>,
        packages: impl IntoIterator<Item = TokenPackage>,
        pending_ttl: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            packages: packages.into_iter().map(|p| (p.id.clone(), p)).collect(),
            pending_ttl,
        }
    }

    /// Configured package catalogue, sorted by id
    pub fn packages(&self) -> Vec<&TokenPackage> {
        let mut list: Vec<_> = self.packages.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Start a pending purchase for a package
    pub async fn open_purchase(
        &self,
        tenant_id: TenantId,
        package_id: &str,
        payment_reference: PaymentReference,
    ) -> MeteringResult<Purchase> {
        let package = self
            .packages
            .get(package_id)
            .ok_or_else(|| MeteringError::PackageNotFound(package_id.to_string()))?;

        if self.store.run(self.store.get().balance(tenant_id)).await?.is_none() {
            return Err(MeteringError::TenantNotFound(tenant_id));
        }

        let purchase = Purchase::pending(
            tenant_id,
            &package.id,
            payment_reference,
            package.tokens,
            self.clock.now(),
        );

        if !self.store.run(self.store.get().insert_purchase(&purchase)).await? {
            return Err(MeteringError::DuplicatePaymentReference(purchase.payment_reference));
        }

        tracing::info!(
            purchase_id = %purchase.id,
            tenant_id = %tenant_id,
            package = %package.id,
            tokens = %package.tokens,
            reference = %purchase.payment_reference,
            "purchase opened"
        );
        Ok(purchase)
    }

    /// Stored purchase
    pub async fn purchase(&self, purchase_id: PurchaseId) -> MeteringResult<Option<Purchase>> {
        Ok(self.store.run(self.store.get().purchase(purchase_id)).await?)
    }

    /// Apply a gateway notification
    ///
    /// Only store failures are errors; every business outcome, including
    /// rejected transitions, is reported through [`ReconcileOutcome`].
    pub async fn on_payment_status_changed(
        &self,
        purchase_id: PurchaseId,
        status: PurchaseStatus,
        payment_reference: &PaymentReference,
    ) -> MeteringResult<ReconcileOutcome> {
        let Some(stored) = self.purchase(purchase_id).await? else {
            tracing::warn!(purchase_id = %purchase_id, status = %status, "payment notification for unknown purchase");
            return Ok(ReconcileOutcome::PurchaseNotFound);
        };

        if &stored.payment_reference != payment_reference {
            tracing::warn!(
                purchase_id = %purchase_id,
                expected = %stored.payment_reference,
                received = %payment_reference,
                "payment reference mismatch"
            );
            return Ok(ReconcileOutcome::ReferenceMismatch);
        }

        if status == PurchaseStatus::Pending && stored.status == PurchaseStatus::Pending {
            return Ok(ReconcileOutcome::Duplicate(stored));
        }

        self.apply(purchase_id, status).await
    }

    async fn apply(&self, purchase_id: PurchaseId, status: PurchaseStatus) -> MeteringResult<ReconcileOutcome> {
        let write = self
            .store
            .run(self.store.get().transition_purchase(purchase_id, status, self.clock.now()))
            .await?;

        match write {
            TransitionWrite::Transitioned(purchase) => {
                tracing::info!(
                    purchase_id = %purchase.id,
                    tenant_id = %purchase.tenant_id,
                    status = %purchase.status,
                    "purchase status changed"
                );
                if purchase.status == PurchaseStatus::Success {
                    self.credit(purchase).await
                } else {
                    Ok(ReconcileOutcome::StatusRecorded(purchase))
                }
            }
            TransitionWrite::Unchanged(purchase) if purchase.status == PurchaseStatus::Success => {
                // A crash between status write and credit is healed here
                self.credit(purchase).await
            }
            TransitionWrite::Unchanged(purchase) => {
                tracing::debug!(purchase_id = %purchase.id, status = %purchase.status, "duplicate status notification");
                Ok(ReconcileOutcome::Duplicate(purchase))
            }
            TransitionWrite::Rejected(purchase) => {
                tracing::warn!(
                    purchase_id = %purchase.id,
                    from = %purchase.status,
                    to = %status,
                    "invalid purchase status transition ignored"
                );
                Ok(ReconcileOutcome::InvalidTransition {
                    from: purchase.status,
                    to: status,
                })
            }
            TransitionWrite::NotFound => Ok(ReconcileOutcome::PurchaseNotFound),
        }
    }

    async fn credit(&self, purchase: Purchase) -> MeteringResult<ReconcileOutcome> {
        let outcome = self
            .ledger
            .credit(
                purchase.tenant_id,
                purchase.token_amount,
                purchase.payment_reference.as_str(),
            )
            .await?;

        Ok(match outcome {
            CreditOutcome::Applied(balance) => ReconcileOutcome::Credited { purchase, balance },
            CreditOutcome::AlreadyApplied(balance) => ReconcileOutcome::AlreadyCredited { purchase, balance },
        })
    }

    /// Expire pending purchases older than the pending TTL
    pub async fn expire_stale(&self) -> MeteringResult<Vec<PurchaseId>> {
        let cutoff = self.clock.now() - self.pending_ttl;
        let stale = self
            .store
            .run(self.store.get().pending_purchases_before(cutoff))
            .await?;

        let mut expired = Vec::with_capacity(stale.len());
        for purchase_id in stale {
            if let ReconcileOutcome::StatusRecorded(_) = self.apply(purchase_id, PurchaseStatus::Expired).await? {
                expired.push(purchase_id);
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), cutoff = %cutoff, "stale purchases expired");
        }
        Ok(expired)
    }
}
