//! Quota Tracker
//!
//! Rolling daily and monthly counters per subscription. Daily counters reset
//! when the last consumption happened on an earlier UTC date; monthly
//! counters reset when the subscription enters a new billing cycle. Both
//! resets are applied in the same atomic step as the cap check, so two
//! callers racing across midnight see exactly one reset.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use metering_common::{Clock, DomainError, SubscriptionId, TenantId};

use crate::error::{MeteringError, MeteringResult};
use crate::store::{ConsumeWrite, StoreHandle};

/// Allowance being consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// Message-blast allowance
    Blast,
    /// AI allowance
    Ai,
}

impl QuotaKind {
    /// Both kinds
    pub const ALL: [QuotaKind; 2] = [QuotaKind::Blast, QuotaKind::Ai];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blast => "blast",
            Self::Ai => "ai",
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blast" => Ok(Self::Blast),
            "ai" => Ok(Self::Ai),
            other => Err(DomainError::InvalidIdentifier(format!(
                "unknown quota kind '{}'",
                other
            ))),
        }
    }
}

/// Counter that rejected a consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    /// Per-day counter
    Daily,
    /// Per-billing-cycle counter
    Monthly,
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daily => f.write_str("daily"),
            Self::Monthly => f.write_str("monthly"),
        }
    }
}

/// Caps for one kind; `0` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotaCaps {
    /// Per-cycle cap
    pub monthly: u64,
    /// Per-day cap
    pub daily: u64,
}

impl QuotaCaps {
    /// Create caps
    pub fn new(monthly: u64, daily: u64) -> Self {
        Self { monthly, daily }
    }
}

/// The day and billing cycle a consumption belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPeriod {
    /// Current UTC date
    pub today: NaiveDate,
    /// First day of the current billing cycle
    pub cycle_start: NaiveDate,
}

/// Counters for one `(subscription, kind)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionQuota {
    /// Owning subscription
    pub subscription_id: SubscriptionId,
    /// Allowance kind
    pub kind: QuotaKind,
    /// Caps
    pub caps: QuotaCaps,
    /// Consumed in `cycle_start`'s cycle
    pub used_monthly: u64,
    /// Consumed on `last_usage_date`
    pub used_today: u64,
    /// Date of the last consumption
    pub last_usage_date: Option<NaiveDate>,
    /// Cycle `used_monthly` was accumulated under
    pub cycle_start: Option<NaiveDate>,
}

impl SubscriptionQuota {
    /// Fresh row with zero counters
    pub fn new(subscription_id: SubscriptionId, kind: QuotaKind, caps: QuotaCaps) -> Self {
        Self {
            subscription_id,
            kind,
            caps,
            used_monthly: 0,
            used_today: 0,
            last_usage_date: None,
            cycle_start: None,
        }
    }

    /// Counters as they stand in `period`
    ///
    /// Rollover only moves forward. A `period` older than the stored day or
    /// cycle sees the stored counters and never rewinds the dates.
    pub fn rolled_over(&self, period: QuotaPeriod) -> Self {
        let mut next = self.clone();
        if next.last_usage_date.map_or(true, |last| last < period.today) {
            next.used_today = 0;
            next.last_usage_date = Some(period.today);
        }
        if next.cycle_start.map_or(true, |start| start < period.cycle_start) {
            next.used_monthly = 0;
            next.cycle_start = Some(period.cycle_start);
        }
        next
    }

    /// Which counter would reject `amount`, daily checked first
    pub fn check(&self, amount: u64) -> Result<(), QuotaScope> {
        if exceeds(self.caps.daily, self.used_today, amount) {
            return Err(QuotaScope::Daily);
        }
        if exceeds(self.caps.monthly, self.used_monthly, amount) {
            return Err(QuotaScope::Monthly);
        }
        Ok(())
    }

    /// Roll over, check and increment
    ///
    /// On rejection `self` is left untouched and the rolled-over view is
    /// returned alongside the rejecting scope.
    pub fn consume(&mut self, amount: u64, period: QuotaPeriod) -> Result<(), (QuotaScope, Self)> {
        let mut next = self.rolled_over(period);
        if let Err(scope) = next.check(amount) {
            return Err((scope, next));
        }
        next.used_today = next.used_today.saturating_add(amount);
        next.used_monthly = next.used_monthly.saturating_add(amount);
        *self = next;
        Ok(())
    }

    /// Give back `amount` consumed within `period`
    ///
    /// Counters from an earlier day or cycle are left alone: they have
    /// already rolled over in effect.
    pub fn release(&mut self, amount: u64, period: QuotaPeriod) {
        if self.last_usage_date == Some(period.today) {
            self.used_today = self.used_today.saturating_sub(amount);
        }
        if self.cycle_start == Some(period.cycle_start) {
            self.used_monthly = self.used_monthly.saturating_sub(amount);
        }
    }

    /// Read-only snapshot in `period`
    pub fn usage(&self, period: QuotaPeriod) -> QuotaUsage {
        let current = self.rolled_over(period);
        QuotaUsage {
            subscription_id: current.subscription_id,
            kind: current.kind,
            caps: current.caps,
            used_today: current.used_today,
            used_monthly: current.used_monthly,
            remaining_today: remaining(current.caps.daily, current.used_today),
            remaining_monthly: remaining(current.caps.monthly, current.used_monthly),
            cycle_start: current.cycle_start.unwrap_or(period.cycle_start),
        }
    }
}

fn exceeds(cap: u64, used: u64, amount: u64) -> bool {
    cap != 0 && used.saturating_add(amount) > cap
}

fn remaining(cap: u64, used: u64) -> Option<u64> {
    (cap != 0).then(|| cap.saturating_sub(used))
}

/// Quota snapshot with rollover applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Subscription
    pub subscription_id: SubscriptionId,
    /// Allowance kind
    pub kind: QuotaKind,
    /// Caps
    pub caps: QuotaCaps,
    /// Consumed today
    pub used_today: u64,
    /// Consumed this cycle
    pub used_monthly: u64,
    /// `None` when the daily cap is unlimited
    pub remaining_today: Option<u64>,
    /// `None` when the monthly cap is unlimited
    pub remaining_monthly: Option<u64>,
    /// Current cycle start
    pub cycle_start: NaiveDate,
}

/// Subscription validity window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTerm {
    /// Subscription id
    pub subscription_id: SubscriptionId,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Plan name
    pub plan: String,
    /// First day (inclusive)
    pub start_date: NaiveDate,
    /// Last day (inclusive)
    pub end_date: NaiveDate,
}

impl SubscriptionTerm {
    /// Validate the window
    pub fn validate(&self) -> MeteringResult<()> {
        if self.end_date < self.start_date {
            return Err(MeteringError::InvalidSubscriptionTerm(format!(
                "end date {} is before start date {}",
                self.end_date, self.start_date
            )));
        }
        if self.plan.trim().is_empty() {
            return Err(MeteringError::InvalidSubscriptionTerm(
                "plan name cannot be empty".into(),
            ));
        }
        Ok(())
    }

    /// Whether `date` falls inside the term
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    /// First day of the billing cycle containing `date`
    pub fn cycle_start_on(&self, date: NaiveDate) -> NaiveDate {
        cycle_start(self.start_date, date)
    }

    /// First day of the cycle after the one containing `date`
    pub fn next_cycle_start(&self, date: NaiveDate) -> Option<NaiveDate> {
        let current = cycle_index(self.start_date, date);
        anniversary(self.start_date, current + 1)
    }
}

/// Start of the billing cycle containing `today`
///
/// Cycles are monthly anniversaries of `start`. A start on the 31st lands on
/// the last day of shorter months. Dates before `start` map to `start`.
pub fn cycle_start(start: NaiveDate, today: NaiveDate) -> NaiveDate {
    let index = cycle_index(start, today);
    anniversary(start, index).unwrap_or(start)
}

fn anniversary(start: NaiveDate, months: u32) -> Option<NaiveDate> {
    start.checked_add_months(Months::new(months))
}

fn cycle_index(start: NaiveDate, today: NaiveDate) -> u32 {
    use chrono::Datelike;

    if today <= start {
        return 0;
    }
    let months = (today.year() - start.year()) * 12 + today.month() as i32 - start.month() as i32;
    let mut index = months.max(0) as u32;

    // The anniversary in today's month may still be ahead (or clamped behind)
    while index > 0 && anniversary(start, index).map_or(true, |d| d > today) {
        index -= 1;
    }
    index
}

/// Named caps for both kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPlan {
    /// Plan name
    pub name: String,
    /// Blast caps
    #[serde(default)]
    pub blast: QuotaCaps,
    /// AI caps
    #[serde(default)]
    pub ai: QuotaCaps,
}

impl QuotaPlan {
    /// Caps for a kind
    pub fn caps(&self, kind: QuotaKind) -> QuotaCaps {
        match kind {
            QuotaKind::Blast => self.blast,
            QuotaKind::Ai => self.ai,
        }
    }
}

/// Enforces subscription quotas
pub struct QuotaTracker {
    store: StoreHandle,
    clock: Arc<dyn Clock>,
}

impl QuotaTracker {
    /// Create tracker
    pub fn new(store: StoreHandle, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Store the term and set caps for both kinds; counters are preserved
    pub async fn provision(&self, term: &SubscriptionTerm, plan: &QuotaPlan) -> MeteringResult<()> {
        term.validate()?;
        self.store.run(self.store.get().upsert_subscription(term)).await?;

        for kind in QuotaKind::ALL {
            self.store
                .run(self.store.get().provision_quota(term.subscription_id, kind, plan.caps(kind)))
                .await?;
        }

        tracing::info!(
            subscription_id = %term.subscription_id,
            tenant_id = %term.tenant_id,
            plan = %plan.name,
            start = %term.start_date,
            end = %term.end_date,
            "subscription provisioned"
        );
        Ok(())
    }

    /// Current term, if any
    pub async fn subscription(&self, subscription_id: SubscriptionId) -> MeteringResult<Option<SubscriptionTerm>> {
        Ok(self.store.run(self.store.get().subscription(subscription_id)).await?)
    }

    async fn current_period(&self, subscription_id: SubscriptionId) -> MeteringResult<QuotaPeriod> {
        let term = self
            .subscription(subscription_id)
            .await?
            .ok_or(MeteringError::SubscriptionNotFound(subscription_id))?;

        let today = self.clock.today();
        if !term.is_active_on(today) {
            return Err(MeteringError::SubscriptionInactive {
                subscription_id,
                date: today,
            });
        }

        Ok(QuotaPeriod {
            today,
            cycle_start: term.cycle_start_on(today),
        })
    }

    /// Consume `amount` if both caps allow it
    pub async fn check_and_consume(
        &self,
        subscription_id: SubscriptionId,
        amount: u64,
        kind: QuotaKind,
    ) -> MeteringResult<SubscriptionQuota> {
        let period = self.current_period(subscription_id).await?;

        let write = self
            .store
            .run(self.store.get().consume_quota(subscription_id, kind, amount, period))
            .await?;

        match write {
            ConsumeWrite::Consumed(quota) => {
                tracing::debug!(
                    subscription_id = %subscription_id,
                    kind = %kind,
                    amount,
                    used_today = quota.used_today,
                    used_monthly = quota.used_monthly,
                    "quota consumed"
                );
                Ok(quota)
            }
            ConsumeWrite::Exceeded { scope, quota } => {
                let (cap, used) = match scope {
                    QuotaScope::Daily => (quota.caps.daily, quota.used_today),
                    QuotaScope::Monthly => (quota.caps.monthly, quota.used_monthly),
                };
                tracing::info!(
                    subscription_id = %subscription_id,
                    kind = %kind,
                    scope = %scope,
                    cap,
                    used,
                    requested = amount,
                    "quota exceeded"
                );
                Err(MeteringError::QuotaExceeded {
                    subscription_id,
                    kind,
                    scope,
                    cap,
                    used,
                    requested: amount,
                })
            }
            ConsumeWrite::NotProvisioned => Err(MeteringError::QuotaNotProvisioned { subscription_id, kind }),
        }
    }

    /// Return consumption made earlier today
    pub async fn release(
        &self,
        subscription_id: SubscriptionId,
        amount: u64,
        kind: QuotaKind,
    ) -> MeteringResult<SubscriptionQuota> {
        let period = self.current_period(subscription_id).await?;
        let quota = self
            .store
            .run(self.store.get().release_quota(subscription_id, kind, amount, period))
            .await?
            .ok_or(MeteringError::QuotaNotProvisioned { subscription_id, kind })?;

        tracing::debug!(subscription_id = %subscription_id, kind = %kind, amount, "quota released");
        Ok(quota)
    }

    /// Snapshot with rollover applied, without writing
    pub async fn usage(&self, subscription_id: SubscriptionId, kind: QuotaKind) -> MeteringResult<QuotaUsage> {
        let period = self.current_period(subscription_id).await?;
        let quota = self
            .store
            .run(self.store.get().quota(subscription_id, kind))
            .await?
            .ok_or(MeteringError::QuotaNotProvisioned { subscription_id, kind })?;
        Ok(quota.usage(period))
    }
}
