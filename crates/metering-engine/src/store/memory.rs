//! In-memory store (tests, development, single-process deployments)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use metering_common::{FeatureKey, PaymentReference, PurchaseId, SubscriptionId, TenantId, Tokens};

use super::{ConsumeWrite, CreditWrite, DebitWrite, MeteringStore, StoreError, StoreResult, TransitionWrite};
use crate::ledger::UsageRecord;
use crate::pricing::PricingConfig;
use crate::purchases::{Purchase, PurchaseStatus};
use crate::quota::{QuotaCaps, QuotaKind, QuotaPeriod, SubscriptionQuota, SubscriptionTerm};

type UsageKey = (TenantId, FeatureKey, String);

#[derive(Default)]
struct MemoryState {
    balances: HashMap<TenantId, Tokens>,
    /// Applied credit keys
    credits: HashMap<String, (TenantId, Tokens)>,
    usage: Vec<UsageRecord>,
    /// Index into `usage` by identity key
    usage_refs: HashMap<UsageKey, usize>,
    pricing: BTreeMap<FeatureKey, PricingConfig>,
    subscriptions: HashMap<SubscriptionId, SubscriptionTerm>,
    quotas: HashMap<(SubscriptionId, QuotaKind), SubscriptionQuota>,
    purchases: HashMap<PurchaseId, Purchase>,
    references: HashMap<PaymentReference, PurchaseId>,
}

impl MemoryState {
    fn debit(&mut self, tenant_id: TenantId, amount: Tokens) -> DebitWrite {
        let Some(balance) = self.balances.get_mut(&tenant_id) else {
            return DebitWrite::UnknownTenant;
        };
        match balance.checked_sub(amount) {
            Some(next) => {
                *balance = next;
                DebitWrite::Applied { balance: next }
            }
            None => DebitWrite::Insufficient { available: *balance },
        }
    }
}

/// Store backed by process memory
///
/// Every operation takes the lock once and never holds it across an await.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn usage_key(record: &UsageRecord) -> Option<UsageKey> {
    record
        .reference_id
        .as_ref()
        .map(|r| (record.tenant_id, record.feature_key.clone(), r.clone()))
}

#[async_trait]
impl MeteringStore for InMemoryStore {
    async fn open_account(&self, tenant_id: TenantId) -> StoreResult<bool> {
        let mut state = self.state.write();
        if state.balances.contains_key(&tenant_id) {
            return Ok(false);
        }
        state.balances.insert(tenant_id, Tokens::ZERO);
        Ok(true)
    }

    async fn balance(&self, tenant_id: TenantId) -> StoreResult<Option<Tokens>> {
        Ok(self.state.read().balances.get(&tenant_id).copied())
    }

    async fn debit(&self, tenant_id: TenantId, amount: Tokens) -> StoreResult<DebitWrite> {
        Ok(self.state.write().debit(tenant_id, amount))
    }

    async fn debit_with_usage(&self, record: &UsageRecord) -> StoreResult<DebitWrite> {
        let mut state = self.state.write();
        let key = usage_key(record);

        if let Some(&index) = key.as_ref().and_then(|k| state.usage_refs.get(k)) {
            let original = state.usage[index].clone();
            let balance = state
                .balances
                .get(&record.tenant_id)
                .copied()
                .ok_or_else(|| StoreError::Corrupt(format!("usage without account {}", record.tenant_id)))?;
            return Ok(DebitWrite::Replayed {
                record: original,
                balance,
            });
        }

        let write = state.debit(record.tenant_id, record.charged);
        if let DebitWrite::Applied { .. } = write {
            let index = state.usage.len();
            state.usage.push(record.clone());
            if let Some(key) = key {
                state.usage_refs.insert(key, index);
            }
        }
        Ok(write)
    }

    async fn credit_once(
        &self,
        tenant_id: TenantId,
        amount: Tokens,
        idempotency_key: &str,
    ) -> StoreResult<CreditWrite> {
        let mut state = self.state.write();
        let Some(&current) = state.balances.get(&tenant_id) else {
            return Ok(CreditWrite::UnknownTenant);
        };
        if state.credits.contains_key(idempotency_key) {
            return Ok(CreditWrite::AlreadyApplied { balance: current });
        }

        let balance = current
            .checked_add(amount)
            .ok_or_else(|| StoreError::Backend(format!("balance overflow for {}", tenant_id)))?;
        state.balances.insert(tenant_id, balance);
        state.credits.insert(idempotency_key.to_string(), (tenant_id, amount));
        Ok(CreditWrite::Applied { balance })
    }

    async fn usage_history(&self, tenant_id: TenantId, limit: usize) -> StoreResult<Vec<UsageRecord>> {
        Ok(self
            .state
            .read()
            .usage
            .iter()
            .rev()
            .filter(|r| r.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn usage_by_reference(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        reference_id: &str,
    ) -> StoreResult<Option<UsageRecord>> {
        let state = self.state.read();
        let key = (tenant_id, feature_key.clone(), reference_id.to_string());
        Ok(state.usage_refs.get(&key).map(|&index| state.usage[index].clone()))
    }

    async fn pricing_config(&self, key: &FeatureKey) -> StoreResult<Option<PricingConfig>> {
        Ok(self.state.read().pricing.get(key).cloned())
    }

    async fn list_pricing(&self) -> StoreResult<Vec<PricingConfig>> {
        Ok(self.state.read().pricing.values().cloned().collect())
    }

    async fn upsert_pricing(&self, config: &PricingConfig) -> StoreResult<()> {
        self.state.write().pricing.insert(config.key.clone(), config.clone());
        Ok(())
    }

    async fn insert_pricing_if_absent(&self, config: &PricingConfig) -> StoreResult<bool> {
        let mut state = self.state.write();
        if state.pricing.contains_key(&config.key) {
            return Ok(false);
        }
        state.pricing.insert(config.key.clone(), config.clone());
        Ok(true)
    }

    async fn set_pricing_active(&self, key: &FeatureKey, active: bool) -> StoreResult<bool> {
        Ok(match self.state.write().pricing.get_mut(key) {
            Some(config) => {
                config.is_active = active;
                true
            }
            None => false,
        })
    }

    async fn upsert_subscription(&self, term: &SubscriptionTerm) -> StoreResult<()> {
        self.state
            .write()
            .subscriptions
            .insert(term.subscription_id, term.clone());
        Ok(())
    }

    async fn subscription(&self, subscription_id: SubscriptionId) -> StoreResult<Option<SubscriptionTerm>> {
        Ok(self.state.read().subscriptions.get(&subscription_id).cloned())
    }

    async fn provision_quota(
        &self,
        subscription_id: SubscriptionId,
        kind: QuotaKind,
        caps: QuotaCaps,
    ) -> StoreResult<()> {
        self.state
            .write()
            .quotas
            .entry((subscription_id, kind))
            .and_modify(|q| q.caps = caps)
            .or_insert_with(|| SubscriptionQuota::new(subscription_id, kind, caps));
        Ok(())
    }

    async fn quota(&self, subscription_id: SubscriptionId, kind: QuotaKind) -> StoreResult<Option<SubscriptionQuota>> {
        Ok(self.state.read().quotas.get(&(subscription_id, kind)).cloned())
    }

    async fn consume_quota(
        &self,
        subscription_id: SubscriptionId,
        kind: QuotaKind,
        amount: u64,
        period: QuotaPeriod,
    ) -> StoreResult<ConsumeWrite> {
        let mut state = self.state.write();
        let Some(quota) = state.quotas.get_mut(&(subscription_id, kind)) else {
            return Ok(ConsumeWrite::NotProvisioned);
        };
        Ok(match quota.consume(amount, period) {
            Ok(()) => ConsumeWrite::Consumed(quota.clone()),
            Err((scope, quota)) => ConsumeWrite::Exceeded { scope, quota },
        })
    }

    async fn release_quota(
        &self,
        subscription_id: SubscriptionId,
        kind: QuotaKind,
        amount: u64,
        period: QuotaPeriod,
    ) -> StoreResult<Option<SubscriptionQuota>> {
        let mut state = self.state.write();
        Ok(state.quotas.get_mut(&(subscription_id, kind)).map(|quota| {
            quota.release(amount, period);
            quota.clone()
        }))
    }

    async fn insert_purchase(&self, purchase: &Purchase) -> StoreResult<bool> {
        let mut state = self.state.write();
        if state.references.contains_key(&purchase.payment_reference) || state.purchases.contains_key(&purchase.id) {
            return Ok(false);
        }
        state
            .references
            .insert(purchase.payment_reference.clone(), purchase.id);
        state.purchases.insert(purchase.id, purchase.clone());
        Ok(true)
    }

    async fn purchase(&self, purchase_id: PurchaseId) -> StoreResult<Option<Purchase>> {
        Ok(self.state.read().purchases.get(&purchase_id).cloned())
    }

    async fn transition_purchase(
        &self,
        purchase_id: PurchaseId,
        to: PurchaseStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<TransitionWrite> {
        let mut state = self.state.write();
        let Some(purchase) = state.purchases.get_mut(&purchase_id) else {
            return Ok(TransitionWrite::NotFound);
        };
        if purchase.status == to {
            return Ok(TransitionWrite::Unchanged(purchase.clone()));
        }
        Ok(match purchase.transition(to, at) {
            Ok(()) => TransitionWrite::Transitioned(purchase.clone()),
            Err(_) => TransitionWrite::Rejected(purchase.clone()),
        })
    }

    async fn pending_purchases_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<PurchaseId>> {
        let state = self.state.read();
        let mut stale: Vec<_> = state
            .purchases
            .values()
            .filter(|p| p.status == PurchaseStatus::Pending && p.created_at < cutoff)
            .map(|p| (p.created_at, p.id))
            .collect();
        stale.sort();
        Ok(stale.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_debit_is_conditional() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new_v4();
        assert_eq!(
            store.debit(tenant, Tokens::ZERO).await.unwrap(),
            DebitWrite::UnknownTenant
        );

        store.open_account(tenant).await.unwrap();
        store.credit_once(tenant, Tokens::new(dec!(1)).unwrap(), "k").await.unwrap();

        let short = store.debit(tenant, Tokens::new(dec!(1.01)).unwrap()).await.unwrap();
        assert_eq!(
            short,
            DebitWrite::Insufficient {
                available: Tokens::new(dec!(1)).unwrap()
            }
        );
        let ok = store.debit(tenant, Tokens::new(dec!(1)).unwrap()).await.unwrap();
        assert_eq!(ok, DebitWrite::Applied { balance: Tokens::ZERO });
    }

    #[tokio::test]
    async fn test_usage_without_reference_is_never_replayed() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new_v4();
        store.open_account(tenant).await.unwrap();
        store.credit_once(tenant, Tokens::new(dec!(1)).unwrap(), "k").await.unwrap();

        let record = UsageRecord::new(tenant, FeatureKey::default_key(), Tokens::new(dec!(0.01)).unwrap());
        store.debit_with_usage(&record).await.unwrap();
        store.debit_with_usage(&record).await.unwrap();

        assert_eq!(store.usage_history(tenant, 10).await.unwrap().len(), 2);
        assert_eq!(store.balance(tenant).await.unwrap().unwrap().value(), dec!(0.98));
    }

    #[tokio::test]
    async fn test_rejected_consume_leaves_row() {
        let store = InMemoryStore::new();
        let sub = SubscriptionId::new_v4();
        store.provision_quota(sub, QuotaKind::Blast, QuotaCaps::new(0, 100)).await.unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let period = QuotaPeriod {
            today: day,
            cycle_start: day,
        };
        store.consume_quota(sub, QuotaKind::Blast, 95, period).await.unwrap();
        let write = store.consume_quota(sub, QuotaKind::Blast, 10, period).await.unwrap();
        assert!(matches!(write, ConsumeWrite::Exceeded { .. }));

        let row = store.quota(sub, QuotaKind::Blast).await.unwrap().unwrap();
        assert_eq!(row.used_today, 95);
        assert_eq!(
            store.consume_quota(sub, QuotaKind::Ai, 1, period).await.unwrap(),
            ConsumeWrite::NotProvisioned
        );
    }

    #[tokio::test]
    async fn test_late_consume_across_midnight_keeps_new_day() {
        let store = InMemoryStore::new();
        let sub = SubscriptionId::new_v4();
        store.provision_quota(sub, QuotaKind::Blast, QuotaCaps::new(100, 10)).await.unwrap();

        let new_day = QuotaPeriod {
            today: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            cycle_start: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
        };
        let old_day = QuotaPeriod {
            today: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            cycle_start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        };

        store.consume_quota(sub, QuotaKind::Blast, 10, new_day).await.unwrap();
        let late = store.consume_quota(sub, QuotaKind::Blast, 1, old_day).await.unwrap();
        assert!(matches!(late, ConsumeWrite::Exceeded { .. }));
        let again = store.consume_quota(sub, QuotaKind::Blast, 10, new_day).await.unwrap();
        assert!(matches!(again, ConsumeWrite::Exceeded { .. }));

        let row = store.quota(sub, QuotaKind::Blast).await.unwrap().unwrap();
        assert_eq!((row.used_today, row.used_monthly), (10, 10));
        assert_eq!(row.last_usage_date, Some(new_day.today));
        assert_eq!(row.cycle_start, Some(new_day.cycle_start));
    }
}
