//! Usage Metering & Quota Enforcement Engine
//!
//! Prepaid token balances metered per AI call, plus subscription quotas that
//! roll over on day and billing-cycle boundaries. Every money- or
//! counter-moving step is a single conditional update at the store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         METERING ENGINE                                 │
//! │                                                                         │
//! │   FeatureInvocation ─► QuotaTracker ─► UsageMeter ─► GateReceipt        │
//! │                        (daily/cycle)    │                               │
//! │                                         ├─► PricingResolver (moka TTL)  │
//! │                                         └─► TokenLedger.debit_for_usage │
//! │                                                                         │
//! │   Payment webhook ─► PurchaseReconciler ─► TokenLedger.credit (once)    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  MeteringStore: InMemoryStore | SqliteStore (WAL, IMMEDIATE tx)  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod metering;
pub mod pricing;
pub mod purchases;
pub mod quota;
pub mod store;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use metering_common::{Clock, SubscriptionId};

pub use config::{EngineConfig, StoreBackend};
pub use error::{MeteringError, MeteringResult};
pub use ledger::{CreditOutcome, DebitReceipt, TokenLedger, UsageRecord};
pub use metering::{ChargeReceipt, ChargeRequest, UsageMeter};
pub use pricing::{compute_charge, PricingConfig, PricingResolver};
pub use purchases::{Purchase, PurchaseReconciler, PurchaseStatus, ReconcileOutcome, TokenPackage};
pub use quota::{QuotaCaps, QuotaKind, QuotaPlan, QuotaScope, QuotaTracker, QuotaUsage, SubscriptionQuota, SubscriptionTerm};
pub use store::{InMemoryStore, MeteringStore, StoreError, StoreHandle};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

/// Quota to consume before a gated action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaGate {
    /// Subscription whose allowance is consumed
    pub subscription_id: SubscriptionId,
    /// Allowance kind
    pub kind: QuotaKind,
    /// Units to consume
    pub amount: u64,
}

/// One feature invocation to admit
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureInvocation {
    /// Quota check, for quota-gated features
    pub quota: Option<QuotaGate>,
    /// Charge, for token-metered features
    pub charge: Option<ChargeRequest>,
}

/// What admitting an invocation consumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReceipt {
    /// Counters after consumption; `None` when nothing was consumed
    pub quota: Option<SubscriptionQuota>,
    /// Charge details
    pub charge: Option<ChargeReceipt>,
}

/// Wires the five components over one store
pub struct MeteringEngine {
    /// Pricing resolver
    pub pricing: Arc<PricingResolver>,
    /// Token ledger
    pub ledger: Arc<TokenLedger>,
    /// Usage meter
    pub meter: Arc<UsageMeter>,
    /// Quota tracker
    pub quotas: Arc<QuotaTracker>,
    /// Purchase reconciler
    pub purchases: Arc<PurchaseReconciler>,
    config: EngineConfig,
}

impl MeteringEngine {
    /// Build the engine over an existing store
    pub fn new(store: Arc<dyn MeteringStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let handle = StoreHandle::new(store, config.store.op_timeout());

        let pricing = Arc::new(PricingResolver::new(
            handle.clone(),
            config.pricing.cache_capacity,
            config.pricing.cache_ttl(),
        ));
        let ledger = Arc::new(TokenLedger::new(handle.clone()));
        let meter = Arc::new(UsageMeter::new(pricing.clone(), ledger.clone()));
        let quotas = Arc::new(QuotaTracker::new(handle.clone(), clock.clone()));
        let purchases = Arc::new(PurchaseReconciler::new(
            handle,
            ledger.clone(),
            clock,
            config.purchases.packages.iter().cloned(),
            config.purchases.pending_ttl(),
        ));

        Self {
            pricing,
            ledger,
            meter,
            quotas,
            purchases,
            config,
        }
    }

    /// Build the configured backend and seed missing pricing
    pub async fn from_config(config: EngineConfig, clock: Arc<dyn Clock>) -> MeteringResult<Self> {
        config.validate()?;

        let store: Arc<dyn MeteringStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(InMemoryStore::new()),
            #[cfg(feature = "sqlite")]
            StoreBackend::Sqlite => Arc::new(
                SqliteStore::open(config.store.path.clone())
                    .await
                    .map_err(|e| MeteringError::Store(e.into()))?,
            ),
            #[cfg(not(feature = "sqlite"))]
            StoreBackend::Sqlite => {
                return Err(MeteringError::Config(
                    "sqlite backend requested but the `sqlite` feature is disabled".into(),
                ))
            }
        };

        tracing::info!(backend = ?config.store.backend, "metering engine starting");

        let engine = Self::new(store, clock, config);
        for seed in engine.config.pricing.seed.clone() {
            let key = seed.key.clone();
            if engine.pricing.seed(seed).await? {
                tracing::info!(feature = %key, "seeded pricing");
            }
        }
        Ok(engine)
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Provision a subscription from a configured plan
    pub async fn provision_subscription(&self, term: &SubscriptionTerm, plan: &str) -> MeteringResult<()> {
        let plan = self
            .config
            .plan(plan)
            .ok_or_else(|| MeteringError::Config(format!("unknown quota plan '{}'", plan)))?;
        self.quotas.provision(term, plan).await
    }

    /// Admit a feature invocation
    ///
    /// A charge already committed under the request's reference id is
    /// returned as a replay before any quota is touched. Otherwise quota is
    /// consumed first, then tokens are charged. Quota is released only when
    /// the charge failed without writing anything; a store error may hide a
    /// committed charge, so it keeps the quota. The gated action may run
    /// only on `Ok`.
    pub async fn invoke(&self, invocation: FeatureInvocation) -> MeteringResult<GateReceipt> {
        if let Some(request) = &invocation.charge {
            if let Some(receipt) = self.meter.committed(request).await? {
                tracing::debug!(
                    tenant_id = %request.tenant_id,
                    feature = %request.feature_key,
                    record_id = %receipt.record_id,
                    "invocation already charged"
                );
                return Ok(GateReceipt {
                    quota: None,
                    charge: Some(receipt),
                });
            }
        }

        let quota = match invocation.quota {
            Some(gate) => Some(
                self.quotas
                    .check_and_consume(gate.subscription_id, gate.amount, gate.kind)
                    .await?,
            ),
            None => None,
        };

        let charge = match invocation.charge {
            Some(request) => match self.meter.charge(request).await {
                Ok(receipt) => Some(receipt),
                Err(e) if e.is_uncommitted_charge() => {
                    let released = self.release_gate(invocation.quota).await;
                    tracing::debug!(error = %e, released = released.is_some(), "charge rejected");
                    return Err(e);
                }
                Err(e) => {
                    if let Some(gate) = invocation.quota {
                        tracing::warn!(
                            subscription_id = %gate.subscription_id,
                            kind = %gate.kind,
                            amount = gate.amount,
                            error = %e,
                            "charge outcome unknown, keeping consumed quota"
                        );
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(GateReceipt { quota, charge })
    }

    async fn release_gate(&self, gate: Option<QuotaGate>) -> Option<SubscriptionQuota> {
        let gate = gate?;
        match self
            .quotas
            .release(gate.subscription_id, gate.amount, gate.kind)
            .await
        {
            Ok(quota) => Some(quota),
            Err(e) => {
                tracing::error!(
                    subscription_id = %gate.subscription_id,
                    kind = %gate.kind,
                    amount = gate.amount,
                    error = %e,
                    "failed to release quota"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use metering_common::{FeatureKey, ManualClock, PurchaseId, TenantId, Tokens};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn engine() -> MeteringEngine {
        let config = EngineConfig {
            store: config::StoreConfig {
                backend: StoreBackend::Memory,
                ..Default::default()
            },
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap()));
        MeteringEngine::from_config(config, clock).await.unwrap()
    }

    async fn tenant_with_subscription(engine: &MeteringEngine, credit: Tokens) -> (TenantId, SubscriptionId) {
        let tenant = TenantId::new_v4();
        engine.ledger.open_account(tenant).await.unwrap();
        engine.ledger.credit(tenant, credit, "initial").await.unwrap();

        let term = SubscriptionTerm {
            subscription_id: SubscriptionId::new_v4(),
            tenant_id: tenant,
            plan: "starter".into(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        };
        engine.provision_subscription(&term, "starter").await.unwrap();
        (tenant, term.subscription_id)
    }

    #[tokio::test]
    async fn test_seeded_default_pricing() {
        let engine = engine().await;
        let quote = engine.meter.quote(&FeatureKey::new("anything").unwrap(), 0).await.unwrap();
        assert_eq!(quote.value(), dec!(0.01));
    }

    #[tokio::test]
    async fn test_invoke_consumes_quota_and_charges() {
        let engine = engine().await;
        let (tenant, sub) = tenant_with_subscription(&engine, Tokens::new(dec!(10)).unwrap()).await;

        let receipt = engine
            .invoke(FeatureInvocation {
                quota: Some(QuotaGate {
                    subscription_id: sub,
                    kind: QuotaKind::Ai,
                    amount: 1,
                }),
                charge: Some(ChargeRequest::new(tenant, FeatureKey::new("chatbot").unwrap(), 2_500)),
            })
            .await
            .unwrap();

        assert_eq!(receipt.quota.unwrap().used_today, 1);
        let charge = receipt.charge.unwrap();
        assert_eq!(charge.charged.value(), dec!(2.50));
        assert_eq!(charge.balance.value(), dec!(7.50));
    }

    #[tokio::test]
    async fn test_failed_charge_releases_quota() {
        let engine = engine().await;
        let (tenant, sub) = tenant_with_subscription(&engine, Tokens::new(dec!(1)).unwrap()).await;

        let err = engine
            .invoke(FeatureInvocation {
                quota: Some(QuotaGate {
                    subscription_id: sub,
                    kind: QuotaKind::Ai,
                    amount: 5,
                }),
                charge: Some(ChargeRequest::new(tenant, FeatureKey::default_key(), 5_000)),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::InsufficientBalance { .. }));

        let usage = engine.quotas.usage(sub, QuotaKind::Ai).await.unwrap();
        assert_eq!(usage.used_today, 0);
        assert_eq!(usage.used_monthly, 0);
    }

    #[tokio::test]
    async fn test_quota_rejection_skips_charge() {
        let engine = engine().await;
        let (tenant, sub) = tenant_with_subscription(&engine, Tokens::new(dec!(100)).unwrap()).await;

        let err = engine
            .invoke(FeatureInvocation {
                quota: Some(QuotaGate {
                    subscription_id: sub,
                    kind: QuotaKind::Blast,
                    amount: 101,
                }),
                charge: Some(ChargeRequest::new(tenant, FeatureKey::default_key(), 1_000)),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::QuotaExceeded { scope: QuotaScope::Daily, .. }));
        assert_eq!(engine.ledger.balance(tenant).await.unwrap().value(), dec!(100));
    }

    #[tokio::test]
    async fn test_replayed_invocation_does_not_double_count() {
        let engine = engine().await;
        let (tenant, sub) = tenant_with_subscription(&engine, Tokens::new(dec!(10)).unwrap()).await;

        let invocation = FeatureInvocation {
            quota: Some(QuotaGate {
                subscription_id: sub,
                kind: QuotaKind::Ai,
                amount: 1,
            }),
            charge: Some(ChargeRequest::new(tenant, FeatureKey::default_key(), 1_000).reference("job-1")),
        };
        let first = engine.invoke(invocation.clone()).await.unwrap();
        assert_eq!(first.quota.unwrap().used_today, 1);

        let again = engine.invoke(invocation).await.unwrap();
        assert!(again.quota.is_none());
        let charge = again.charge.unwrap();
        assert!(charge.replayed);
        assert_eq!(charge.record_id, first.charge.unwrap().record_id);
        assert_eq!(charge.balance.value(), dec!(9.00));

        let usage = engine.quotas.usage(sub, QuotaKind::Ai).await.unwrap();
        assert_eq!(usage.used_today, 1);
        assert_eq!(engine.ledger.balance(tenant).await.unwrap().value(), dec!(9.00));
    }

    /// Commits usage writes, then stalls once past the engine's deadline
    struct StallAfterCommit {
        inner: InMemoryStore,
        stall: AtomicBool,
    }

    #[async_trait::async_trait]
    impl MeteringStore for StallAfterCommit {
        async fn open_account(&self, tenant_id: TenantId) -> store::StoreResult<bool> {
            self.inner.open_account(tenant_id).await
        }

        async fn balance(&self, tenant_id: TenantId) -> store::StoreResult<Option<Tokens>> {
            self.inner.balance(tenant_id).await
        }

        async fn debit(&self, tenant_id: TenantId, amount: Tokens) -> store::StoreResult<store::DebitWrite> {
            self.inner.debit(tenant_id, amount).await
        }

        async fn debit_with_usage(&self, record: &UsageRecord) -> store::StoreResult<store::DebitWrite> {
            let write = self.inner.debit_with_usage(record).await;
            if self.stall.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
            write
        }

        async fn credit_once(
            &self,
            tenant_id: TenantId,
            amount: Tokens,
            idempotency_key: &str,
        ) -> store::StoreResult<store::CreditWrite> {
            self.inner.credit_once(tenant_id, amount, idempotency_key).await
        }

        async fn usage_history(&self, tenant_id: TenantId, limit: usize) -> store::StoreResult<Vec<UsageRecord>> {
            self.inner.usage_history(tenant_id, limit).await
        }

        async fn usage_by_reference(
            &self,
            tenant_id: TenantId,
            feature_key: &FeatureKey,
            reference_id: &str,
        ) -> store::StoreResult<Option<UsageRecord>> {
            self.inner.usage_by_reference(tenant_id, feature_key, reference_id).await
        }

        async fn pricing_config(&self, key: &FeatureKey) -> store::StoreResult<Option<PricingConfig>> {
            self.inner.pricing_config(key).await
        }

        async fn list_pricing(&self) -> store::StoreResult<Vec<PricingConfig>> {
            self.inner.list_pricing().await
        }

        async fn upsert_pricing(&self, config: &PricingConfig) -> store::StoreResult<()> {
            self.inner.upsert_pricing(config).await
        }

        async fn insert_pricing_if_absent(&self, config: &PricingConfig) -> store::StoreResult<bool> {
            self.inner.insert_pricing_if_absent(config).await
        }

        async fn set_pricing_active(&self, key: &FeatureKey, active: bool) -> store::StoreResult<bool> {
            self.inner.set_pricing_active(key, active).await
        }

        async fn upsert_subscription(&self, term: &SubscriptionTerm) -> store::StoreResult<()> {
            self.inner.upsert_subscription(term).await
        }

        async fn subscription(&self, subscription_id: SubscriptionId) -> store::StoreResult<Option<SubscriptionTerm>> {
            self.inner.subscription(subscription_id).await
        }

        async fn provision_quota(
            &self,
            subscription_id: SubscriptionId,
            kind: QuotaKind,
            caps: QuotaCaps,
        ) -> store::StoreResult<()> {
            self.inner.provision_quota(subscription_id, kind, caps).await
        }

        async fn quota(
            &self,
            subscription_id: SubscriptionId,
            kind: QuotaKind,
        ) -> store::StoreResult<Option<SubscriptionQuota>> {
            self.inner.quota(subscription_id, kind).await
        }

        async fn consume_quota(
            &self,
            subscription_id: SubscriptionId,
            kind: QuotaKind,
            amount: u64,
            period: quota::QuotaPeriod,
        ) -> store::StoreResult<store::ConsumeWrite> {
            self.inner.consume_quota(subscription_id, kind, amount, period).await
        }

        async fn release_quota(
            &self,
            subscription_id: SubscriptionId,
            kind: QuotaKind,
            amount: u64,
            period: quota::QuotaPeriod,
        ) -> store::StoreResult<Option<SubscriptionQuota>> {
            self.inner.release_quota(subscription_id, kind, amount, period).await
        }

        async fn insert_purchase(&self, purchase: &Purchase) -> store::StoreResult<bool> {
            self.inner.insert_purchase(purchase).await
        }

        async fn purchase(&self, purchase_id: PurchaseId) -> store::StoreResult<Option<Purchase>> {
            self.inner.purchase(purchase_id).await
        }

        async fn transition_purchase(
            &self,
            purchase_id: PurchaseId,
            to: PurchaseStatus,
            at: DateTime<Utc>,
        ) -> store::StoreResult<store::TransitionWrite> {
            self.inner.transition_purchase(purchase_id, to, at).await
        }

        async fn pending_purchases_before(&self, cutoff: DateTime<Utc>) -> store::StoreResult<Vec<PurchaseId>> {
            self.inner.pending_purchases_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_timed_out_charge_keeps_quota_and_retry_replays() {
        let store = Arc::new(StallAfterCommit {
            inner: InMemoryStore::new(),
            stall: AtomicBool::new(false),
        });
        let config = EngineConfig {
            store: config::StoreConfig {
                backend: StoreBackend::Memory,
                op_timeout_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap()));
        let engine = MeteringEngine::new(store.clone(), clock, config);
        for seed in engine.config().pricing.seed.clone() {
            engine.pricing.upsert(seed).await.unwrap();
        }
        let (tenant, sub) = tenant_with_subscription(&engine, Tokens::new(dec!(10)).unwrap()).await;

        let invocation = FeatureInvocation {
            quota: Some(QuotaGate {
                subscription_id: sub,
                kind: QuotaKind::Ai,
                amount: 1,
            }),
            charge: Some(ChargeRequest::new(tenant, FeatureKey::default_key(), 1_000).reference("job-7")),
        };

        store.stall.store(true, Ordering::SeqCst);
        let err = engine.invoke(invocation.clone()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(engine.quotas.usage(sub, QuotaKind::Ai).await.unwrap().used_today, 1);

        let retry = engine.invoke(invocation).await.unwrap();
        assert!(retry.charge.unwrap().replayed);
        assert!(retry.quota.is_none());

        let usage = engine.quotas.usage(sub, QuotaKind::Ai).await.unwrap();
        assert_eq!((usage.used_today, usage.used_monthly), (1, 1));
        assert_eq!(engine.ledger.balance(tenant).await.unwrap().value(), dec!(9.00));
        assert_eq!(engine.ledger.history(tenant, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_plan() {
        let engine = engine().await;
        let term = SubscriptionTerm {
            subscription_id: SubscriptionId::new_v4(),
            tenant_id: TenantId::new_v4(),
            plan: "platinum".into(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        };
        assert!(matches!(
            engine.provision_subscription(&term, "platinum").await,
            Err(MeteringError::Config(_))
        ));
    }
}
