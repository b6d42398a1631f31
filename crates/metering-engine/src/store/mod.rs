//! Storage seam
//!
//! Every money- or counter-moving method on [`MeteringStore`] is a single
//! atomic conditional update: the backend checks the precondition and applies
//! the change in one step, so concurrent callers (including other processes
//! sharing the same database) serialise at the store. Components never read a
//! value, decide, and write it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_common::{FeatureKey, PurchaseId, SubscriptionId, TenantId, Tokens};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::ledger::UsageRecord;
use crate::pricing::PricingConfig;
use crate::purchases::{Purchase, PurchaseStatus};
use crate::quota::{QuotaCaps, QuotaKind, QuotaPeriod, QuotaScope, SubscriptionQuota, SubscriptionTerm};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Operation did not finish within the configured timeout
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Lost a race for a lock or row; retry the whole operation
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend failure
    #[error("storage error: {0}")]
    Backend(String),

    /// Persisted row could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Conflict(_))
    }
}

/// Outcome of a conditional debit
#[derive(Debug, Clone, PartialEq)]
pub enum DebitWrite {
    /// Balance reduced
    Applied {
        /// Balance after the debit
        balance: Tokens,
    },
    /// Usage with the same reference id was already charged; nothing debited
    Replayed {
        /// The original record
        record: UsageRecord,
        /// Current balance
        balance: Tokens,
    },
    /// Balance too low; nothing written
    Insufficient {
        /// Balance at the time of the attempt
        available: Tokens,
    },
    /// No balance row for the tenant
    UnknownTenant,
}

/// Outcome of an idempotent credit
#[derive(Debug, Clone, PartialEq)]
pub enum CreditWrite {
    /// Key was new; balance increased
    Applied {
        /// Balance after the credit
        balance: Tokens,
    },
    /// Key already applied; balance untouched
    AlreadyApplied {
        /// Current balance
        balance: Tokens,
    },
    /// No balance row for the tenant
    UnknownTenant,
}

/// Outcome of a quota check-and-consume
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeWrite {
    /// Counters rolled over as needed and incremented
    Consumed(SubscriptionQuota),
    /// Cap would be exceeded; stored counters untouched
    Exceeded {
        /// Rejecting counter
        scope: QuotaScope,
        /// Counters as seen after rollover
        quota: SubscriptionQuota,
    },
    /// No quota row for this subscription and kind
    NotProvisioned,
}

/// Outcome of a purchase status change
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionWrite {
    /// Moved out of `pending`
    Transitioned(Purchase),
    /// Already in the requested status
    Unchanged(Purchase),
    /// Terminal status cannot change
    Rejected(Purchase),
    /// Unknown purchase
    NotFound,
}

/// Persistence for balances, usage, pricing, quotas and purchases
#[async_trait]
pub trait MeteringStore: Send + Sync {
    /// Create a zero balance for the tenant; `false` if it already existed
    async fn open_account(&self, tenant_id: TenantId) -> StoreResult<bool>;

    /// Current balance, `None` for unknown tenants
    async fn balance(&self, tenant_id: TenantId) -> StoreResult<Option<Tokens>>;

    /// Debit if and only if the balance covers `amount`
    async fn debit(&self, tenant_id: TenantId, amount: Tokens) -> StoreResult<DebitWrite>;

    /// Debit `record.charged` and append `record` as one unit
    ///
    /// A record whose `(tenant_id, feature_key, reference_id)` was already
    /// stored is a replay: returns the stored record without debiting.
    async fn debit_with_usage(&self, record: &UsageRecord) -> StoreResult<DebitWrite>;

    /// Credit once per idempotency key
    async fn credit_once(
        &self,
        tenant_id: TenantId,
        amount: Tokens,
        idempotency_key: &str,
    ) -> StoreResult<CreditWrite>;

    /// Most recent usage records, newest first
    async fn usage_history(&self, tenant_id: TenantId, limit: usize) -> StoreResult<Vec<UsageRecord>>;

    /// Usage record stored under `(tenant_id, feature_key, reference_id)`
    async fn usage_by_reference(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        reference_id: &str,
    ) -> StoreResult<Option<UsageRecord>>;

    /// Pricing config by exact key, active or not
    async fn pricing_config(&self, key: &FeatureKey) -> StoreResult<Option<PricingConfig>>;

    /// All pricing configs ordered by key
    async fn list_pricing(&self) -> StoreResult<Vec<PricingConfig>>;

    /// Insert or replace a pricing config
    async fn upsert_pricing(&self, config: &PricingConfig) -> StoreResult<()>;

    /// Insert unless the key exists; `true` if inserted
    async fn insert_pricing_if_absent(&self, config: &PricingConfig) -> StoreResult<bool>;

    /// Flip `is_active`; `false` if the key does not exist
    async fn set_pricing_active(&self, key: &FeatureKey, active: bool) -> StoreResult<bool>;

    /// Insert or replace a subscription term
    async fn upsert_subscription(&self, term: &SubscriptionTerm) -> StoreResult<()>;

    /// Subscription term by id
    async fn subscription(&self, subscription_id: SubscriptionId) -> StoreResult<Option<SubscriptionTerm>>;

    /// Set caps for a quota row, creating it with zero counters if absent
    async fn provision_quota(
        &self,
        subscription_id: SubscriptionId,
        kind: QuotaKind,
        caps: QuotaCaps,
    ) -> StoreResult<()>;

    /// Stored quota row, without rollover applied
    async fn quota(&self, subscription_id: SubscriptionId, kind: QuotaKind) -> StoreResult<Option<SubscriptionQuota>>;

    /// Roll over, check caps and increment in one atomic step
    async fn consume_quota(
        &self,
        subscription_id: SubscriptionId,
        kind: QuotaKind,
        amount: u64,
        period: QuotaPeriod,
    ) -> StoreResult<ConsumeWrite>;

    /// Give back consumption made in `period`; `None` if not provisioned
    async fn release_quota(
        &self,
        subscription_id: SubscriptionId,
        kind: QuotaKind,
        amount: u64,
        period: QuotaPeriod,
    ) -> StoreResult<Option<SubscriptionQuota>>;

    /// Insert a purchase; `false` if the payment reference is taken
    async fn insert_purchase(&self, purchase: &Purchase) -> StoreResult<bool>;

    /// Purchase by id
    async fn purchase(&self, purchase_id: PurchaseId) -> StoreResult<Option<Purchase>>;

    /// Move a pending purchase to `to`
    async fn transition_purchase(
        &self,
        purchase_id: PurchaseId,
        to: PurchaseStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<TransitionWrite>;

    /// Pending purchases created before `cutoff`, oldest first
    async fn pending_purchases_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<PurchaseId>>;
}

/// Shared store with a per-operation deadline
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn MeteringStore>,
    op_timeout: Duration,
}

impl StoreHandle {
    /// Wrap a store
    pub fn new(inner: Arc<dyn MeteringStore>, op_timeout: Duration) -> Self {
        Self { inner, op_timeout }
    }

    /// Underlying store
    pub fn get(&self) -> &dyn MeteringStore {
        self.inner.as_ref()
    }

    /// Run a store future under the deadline
    pub async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?self.op_timeout, "store operation timed out");
                Err(StoreError::Timeout(self.op_timeout))
            }
        }
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_handle_times_out() {
        let handle = StoreHandle::new(Arc::new(InMemoryStore::new()), Duration::from_millis(20));
        let result: StoreResult<()> = handle
            .run(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert!(result.unwrap_err().is_transient());
    }
}
