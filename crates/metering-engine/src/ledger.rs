//! Token Ledger
//!
//! Per-tenant prepaid balance. Debits are conditional on the balance
//! covering the amount; credits are applied once per idempotency key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use metering_common::{FeatureKey, TenantId, Tokens};

use crate::error::{MeteringError, MeteringResult};
use crate::store::{CreditWrite, DebitWrite, StoreHandle};

/// Immutable audit entry for one successful charge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Record id
    pub id: Uuid,
    /// Charged tenant
    pub tenant_id: TenantId,
    /// Feature that was invoked
    pub feature_key: FeatureKey,
    /// Amount debited
    pub charged: Tokens,
    /// Originating request; unique per tenant and feature when present
    pub reference_id: Option<String>,
    /// Free-form caller metadata
    pub metadata: Option<serde_json::Value>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    /// New record stamped now
    pub fn new(tenant_id: TenantId, feature_key: FeatureKey, charged: Tokens) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            feature_key,
            charged,
            reference_id: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    /// Set reference id; blank references are dropped
    pub fn with_reference(mut self, reference_id: Option<String>) -> Self {
        self.reference_id = reference_id
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        self
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of an idempotent credit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    /// First time this key was seen
    Applied(Tokens),
    /// Key was applied before; balance unchanged
    AlreadyApplied(Tokens),
}

impl CreditOutcome {
    /// Balance after the call
    pub fn balance(&self) -> Tokens {
        match self {
            Self::Applied(b) | Self::AlreadyApplied(b) => *b,
        }
    }

    /// Whether the balance moved
    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Result of a metered debit
#[derive(Debug, Clone, PartialEq)]
pub struct DebitReceipt {
    /// Stored usage record (the original one on replay)
    pub record: UsageRecord,
    /// Balance after the call
    pub balance: Tokens,
    /// Charge was already recorded under this reference id
    pub replayed: bool,
}

/// Per-tenant token balances
pub struct TokenLedger {
    store: StoreHandle,
}

impl TokenLedger {
    /// Create ledger over a store
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Create a zero balance; `false` if one already exists
    pub async fn open_account(&self, tenant_id: TenantId) -> MeteringResult<bool> {
        let created = self.store.run(self.store.get().open_account(tenant_id)).await?;
        if created {
            tracing::info!(tenant_id = %tenant_id, "token account opened");
        }
        Ok(created)
    }

    /// Balance snapshot
    pub async fn balance(&self, tenant_id: TenantId) -> MeteringResult<Tokens> {
        self.store
            .run(self.store.get().balance(tenant_id))
            .await?
            .ok_or(MeteringError::TenantNotFound(tenant_id))
    }

    /// Debit `amount`, failing without side effects if the balance is short
    pub async fn debit(&self, tenant_id: TenantId, amount: Tokens) -> MeteringResult<Tokens> {
        let write = self.store.run(self.store.get().debit(tenant_id, amount)).await?;
        match write {
            DebitWrite::Applied { balance } => {
                tracing::info!(tenant_id = %tenant_id, amount = %amount, balance = %balance, "tokens debited");
                Ok(balance)
            }
            DebitWrite::Insufficient { available } => Err(insufficient(tenant_id, amount, available)),
            DebitWrite::UnknownTenant => Err(MeteringError::TenantNotFound(tenant_id)),
            // Plain debits carry no reference id
            DebitWrite::Replayed { balance, .. } => Ok(balance),
        }
    }

    /// Debit `record.charged` and append `record` as one committed unit
    pub async fn debit_for_usage(&self, record: UsageRecord) -> MeteringResult<DebitReceipt> {
        let tenant_id = record.tenant_id;
        let write = self.store.run(self.store.get().debit_with_usage(&record)).await?;

        match write {
            DebitWrite::Applied { balance } => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    feature = %record.feature_key,
                    charged = %record.charged,
                    balance = %balance,
                    record_id = %record.id,
                    "usage charged"
                );
                Ok(DebitReceipt {
                    record,
                    balance,
                    replayed: false,
                })
            }
            DebitWrite::Replayed { record: original, balance } => {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    reference_id = ?original.reference_id,
                    record_id = %original.id,
                    "usage charge replayed"
                );
                Ok(DebitReceipt {
                    record: original,
                    balance,
                    replayed: true,
                })
            }
            DebitWrite::Insufficient { available } => Err(insufficient(tenant_id, record.charged, available)),
            DebitWrite::UnknownTenant => Err(MeteringError::TenantNotFound(tenant_id)),
        }
    }

    /// Credit `amount` at most once per `idempotency_key`
    pub async fn credit(
        &self,
        tenant_id: TenantId,
        amount: Tokens,
        idempotency_key: &str,
    ) -> MeteringResult<CreditOutcome> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Err(MeteringError::InvalidIdempotencyKey);
        }

        let write = self
            .store
            .run(self.store.get().credit_once(tenant_id, amount, key))
            .await?;

        match write {
            CreditWrite::Applied { balance } => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    amount = %amount,
                    balance = %balance,
                    idempotency_key = key,
                    "tokens credited"
                );
                Ok(CreditOutcome::Applied(balance))
            }
            CreditWrite::AlreadyApplied { balance } => {
                tracing::debug!(tenant_id = %tenant_id, idempotency_key = key, "credit already applied");
                Ok(CreditOutcome::AlreadyApplied(balance))
            }
            CreditWrite::UnknownTenant => Err(MeteringError::TenantNotFound(tenant_id)),
        }
    }

    /// Most recent usage, newest first
    pub async fn history(&self, tenant_id: TenantId, limit: usize) -> MeteringResult<Vec<UsageRecord>> {
        Ok(self
            .store
            .run(self.store.get().usage_history(tenant_id, limit))
            .await?)
    }

    /// Committed usage for a reference id, if any
    pub async fn find_usage(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        reference_id: &str,
    ) -> MeteringResult<Option<UsageRecord>> {
        Ok(self
            .store
            .run(self.store.get().usage_by_reference(tenant_id, feature_key, reference_id))
            .await?)
    }
}

fn insufficient(tenant_id: TenantId, required: Tokens, available: Tokens) -> MeteringError {
    tracing::info!(
        tenant_id = %tenant_id,
        required = %required,
        available = %available,
        "insufficient token balance"
    );
    MeteringError::InsufficientBalance { required, available }
}
