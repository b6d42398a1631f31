//! SQLite store
//!
//! Each operation runs on the blocking pool with its own connection. Writes
//! that check a precondition do so inside the `UPDATE ... WHERE` itself, in a
//! `BEGIN IMMEDIATE` transaction, so several processes sharing one database
//! file serialise at SQLite's write lock.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use metering_common::{DomainError, FeatureKey, PaymentReference, PurchaseId, SubscriptionId, TenantId, Tokens};

use super::{ConsumeWrite, CreditWrite, DebitWrite, MeteringStore, StoreError, StoreResult, TransitionWrite};
use crate::ledger::UsageRecord;
use crate::pricing::PricingConfig;
use crate::purchases::{Purchase, PurchaseStatus};
use crate::quota::{QuotaCaps, QuotaKind, QuotaPeriod, SubscriptionQuota, SubscriptionTerm};

const DATE_FORMAT: &str = "%Y-%m-%d";

const USAGE_COLUMNS: &str =
    "id, tenant_id, feature_key, charged_minor, reference_id, metadata_json, created_at_ms";
const PRICING_COLUMNS: &str = "key, divisor, markup, min_tokens, is_active";
const QUOTA_COLUMNS: &str =
    "subscription_id, kind, monthly_cap, daily_cap, used_monthly, used_today, last_usage_date, cycle_start";
const PURCHASE_COLUMNS: &str =
    "id, tenant_id, package_id, payment_reference, token_amount_minor, status, created_at_ms, updated_at_ms";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS token_balances (
    tenant_id TEXT PRIMARY KEY,
    balance_minor INTEGER NOT NULL CHECK (balance_minor >= 0),
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_credits (
    idempotency_key TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    amount_minor INTEGER NOT NULL,
    applied_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_records (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    feature_key TEXT NOT NULL,
    charged_minor INTEGER NOT NULL,
    reference_id TEXT,
    metadata_json TEXT,
    created_at_ms INTEGER NOT NULL,
    UNIQUE (tenant_id, feature_key, reference_id)
);

CREATE INDEX IF NOT EXISTS usage_records_by_tenant
    ON usage_records (tenant_id, created_at_ms);

CREATE TABLE IF NOT EXISTS pricing_configs (
    key TEXT PRIMARY KEY,
    divisor INTEGER NOT NULL CHECK (divisor > 0),
    markup TEXT NOT NULL,
    min_tokens TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    subscription_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    plan TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subscription_quotas (
    subscription_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    monthly_cap INTEGER NOT NULL,
    daily_cap INTEGER NOT NULL,
    used_monthly INTEGER NOT NULL,
    used_today INTEGER NOT NULL,
    last_usage_date TEXT,
    cycle_start TEXT,
    PRIMARY KEY (subscription_id, kind)
);

CREATE TABLE IF NOT EXISTS purchases (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    package_id TEXT NOT NULL,
    payment_reference TEXT NOT NULL UNIQUE,
    token_amount_minor INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS purchases_by_status
    ON purchases (status, created_at_ms);
"#;

/// SQLite-backed store
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

/// SQLite backend errors
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Blocking task panicked or was cancelled
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// Driver error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Metadata column
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Value does not map between a domain type and its column
    #[error("invalid value: {0}")]
    Value(String),
}

impl From<DomainError> for SqliteStoreError {
    fn from(e: DomainError) -> Self {
        Self::Value(e.to_string())
    }
}

impl From<SqliteStoreError> for StoreError {
    fn from(e: SqliteStoreError) -> Self {
        match e {
            SqliteStoreError::Sqlite(ref err) if is_busy(err) => StoreError::Conflict(e.to_string()),
            SqliteStoreError::Value(msg) => StoreError::Corrupt(msg),
            SqliteStoreError::Json(err) => StoreError::Corrupt(err.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SqliteStoreError> {
        let store = Self { path: path.into() };
        let path = store.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await??;

        tracing::info!(path = %store.path.display(), "sqlite metering store ready");
        Ok(store)
    }

    /// Database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, SqliteStoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<T, SqliteStoreError> {
            let mut conn = open_connection(&path)?;
            op(&mut conn)
        })
        .await
        .map_err(SqliteStoreError::from)?;

        result.map_err(|e| {
            let err = StoreError::from(e);
            tracing::warn!(error = %err, "sqlite store operation failed");
            err
        })
    }
}

fn open_connection(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, SqliteStoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| SqliteStoreError::Value(format!("timestamp {} out of range", ms)))
}

fn date_to_text(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn date_from_text(text: &str) -> Result<NaiveDate, SqliteStoreError> {
    NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|e| SqliteStoreError::Value(format!("date '{}': {}", text, e)))
}

fn u64_to_i64(value: u64) -> Result<i64, SqliteStoreError> {
    i64::try_from(value).map_err(|_| SqliteStoreError::Value(format!("{} does not fit an INTEGER column", value)))
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 {
        0
    } else {
        value as u64
    }
}

fn minor(amount: Tokens) -> Result<i64, SqliteStoreError> {
    Ok(amount.to_minor_units()?)
}

fn balance_of(conn: &Connection, tenant: &str) -> Result<Option<Tokens>, SqliteStoreError> {
    let minor: Option<i64> = conn
        .query_row(
            "SELECT balance_minor FROM token_balances WHERE tenant_id = ?1",
            [tenant],
            |row| row.get(0),
        )
        .optional()?;
    Ok(minor.map(Tokens::from_minor_units).transpose()?)
}

/// Conditional debit; `None` when the row is missing or short
fn try_debit(conn: &Connection, tenant: &str, amount: i64) -> Result<Option<Tokens>, SqliteStoreError> {
    let minor: Option<i64> = conn
        .query_row(
            "UPDATE token_balances
             SET balance_minor = balance_minor - ?2, updated_at_ms = ?3
             WHERE tenant_id = ?1 AND balance_minor >= ?2
             RETURNING balance_minor",
            rusqlite::params![tenant, amount, now_millis()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(minor.map(Tokens::from_minor_units).transpose()?)
}

fn debit_failure(conn: &Connection, tenant: &str) -> Result<DebitWrite, SqliteStoreError> {
    Ok(match balance_of(conn, tenant)? {
        Some(available) => DebitWrite::Insufficient { available },
        None => DebitWrite::UnknownTenant,
    })
}

fn usage_from_row(row: &Row<'_>) -> Result<UsageRecord, SqliteStoreError> {
    let id: String = row.get(0)?;
    let tenant: String = row.get(1)?;
    let feature: String = row.get(2)?;
    let metadata: Option<String> = row.get(5)?;

    Ok(UsageRecord {
        id: Uuid::parse_str(&id).map_err(|e| SqliteStoreError::Value(format!("usage id '{}': {}", id, e)))?,
        tenant_id: tenant.parse()?,
        feature_key: FeatureKey::new(feature)?,
        charged: Tokens::from_minor_units(row.get(3)?)?,
        reference_id: row.get(4)?,
        metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
        created_at: from_millis(row.get(6)?)?,
    })
}

fn pricing_from_row(row: &Row<'_>) -> Result<PricingConfig, SqliteStoreError> {
    let key: String = row.get(0)?;
    let divisor: i64 = row.get(1)?;
    let markup: String = row.get(2)?;
    let min_tokens: String = row.get(3)?;
    let is_active: bool = row.get(4)?;

    Ok(PricingConfig {
        key: FeatureKey::new(key)?,
        divisor: u64::try_from(divisor).map_err(|_| SqliteStoreError::Value(format!("divisor {}", divisor)))?,
        markup: Decimal::from_str(&markup).map_err(|e| SqliteStoreError::Value(format!("markup '{}': {}", markup, e)))?,
        min_tokens: min_tokens.parse()?,
        is_active,
    })
}

fn quota_from_row(row: &Row<'_>) -> Result<SubscriptionQuota, SqliteStoreError> {
    let subscription: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let last_usage_date: Option<String> = row.get(6)?;
    let cycle_start: Option<String> = row.get(7)?;

    Ok(SubscriptionQuota {
        subscription_id: subscription.parse()?,
        kind: kind.parse()?,
        caps: QuotaCaps::new(i64_to_u64(row.get(2)?), i64_to_u64(row.get(3)?)),
        used_monthly: i64_to_u64(row.get(4)?),
        used_today: i64_to_u64(row.get(5)?),
        last_usage_date: last_usage_date.as_deref().map(date_from_text).transpose()?,
        cycle_start: cycle_start.as_deref().map(date_from_text).transpose()?,
    })
}

fn term_from_row(row: &Row<'_>) -> Result<SubscriptionTerm, SqliteStoreError> {
    let subscription: String = row.get(0)?;
    let tenant: String = row.get(1)?;
    let start: String = row.get(3)?;
    let end: String = row.get(4)?;

    Ok(SubscriptionTerm {
        subscription_id: subscription.parse()?,
        tenant_id: tenant.parse()?,
        plan: row.get(2)?,
        start_date: date_from_text(&start)?,
        end_date: date_from_text(&end)?,
    })
}

fn purchase_from_row(row: &Row<'_>) -> Result<Purchase, SqliteStoreError> {
    let id: String = row.get(0)?;
    let tenant: String = row.get(1)?;
    let reference: String = row.get(3)?;
    let status: String = row.get(5)?;

    Ok(Purchase {
        id: id.parse()?,
        tenant_id: tenant.parse()?,
        package_id: row.get(2)?,
        payment_reference: PaymentReference::new(reference)?,
        token_amount: Tokens::from_minor_units(row.get(4)?)?,
        status: status.parse()?,
        created_at: from_millis(row.get(6)?)?,
        updated_at: from_millis(row.get(7)?)?,
    })
}

fn load_purchase(conn: &Connection, id: &str) -> Result<Option<Purchase>, SqliteStoreError> {
    conn.query_row(
        &format!("SELECT {} FROM purchases WHERE id = ?1", PURCHASE_COLUMNS),
        [id],
        |row| Ok(purchase_from_row(row)),
    )
    .optional()?
    .transpose()
}

fn load_quota(conn: &Connection, subscription: &str, kind: &str) -> Result<Option<SubscriptionQuota>, SqliteStoreError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM subscription_quotas WHERE subscription_id = ?1 AND kind = ?2",
            QUOTA_COLUMNS
        ),
        [subscription, kind],
        |row| Ok(quota_from_row(row)),
    )
    .optional()?
    .transpose()
}

#[async_trait]
impl MeteringStore for SqliteStore {
    async fn open_account(&self, tenant_id: TenantId) -> StoreResult<bool> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO token_balances (tenant_id, balance_minor, updated_at_ms)
                 VALUES (?1, 0, ?2)",
                rusqlite::params![tenant_id.to_string(), now_millis()],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn balance(&self, tenant_id: TenantId) -> StoreResult<Option<Tokens>> {
        self.with_conn(move |conn| balance_of(conn, &tenant_id.to_string()))
            .await
    }

    async fn debit(&self, tenant_id: TenantId, amount: Tokens) -> StoreResult<DebitWrite> {
        self.with_conn(move |conn| {
            let tenant = tenant_id.to_string();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let write = match try_debit(&tx, &tenant, minor(amount)?)? {
                Some(balance) => DebitWrite::Applied { balance },
                None => debit_failure(&tx, &tenant)?,
            };
            tx.commit()?;
            Ok(write)
        })
        .await
    }

    async fn debit_with_usage(&self, record: &UsageRecord) -> StoreResult<DebitWrite> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tenant = record.tenant_id.to_string();
            let feature = record.feature_key.to_string();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(reference) = &record.reference_id {
                let existing = tx
                    .query_row(
                        &format!(
                            "SELECT {} FROM usage_records
                             WHERE tenant_id = ?1 AND feature_key = ?2 AND reference_id = ?3",
                            USAGE_COLUMNS
                        ),
                        [&tenant, &feature, reference],
                        |row| Ok(usage_from_row(row)),
                    )
                    .optional()?
                    .transpose()?;

                if let Some(original) = existing {
                    let balance = balance_of(&tx, &tenant)?
                        .ok_or_else(|| SqliteStoreError::Value(format!("usage without account {}", tenant)))?;
                    return Ok(DebitWrite::Replayed {
                        record: original,
                        balance,
                    });
                }
            }

            let Some(balance) = try_debit(&tx, &tenant, minor(record.charged)?)? else {
                return debit_failure(&tx, &tenant);
            };

            let metadata = record.metadata.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "INSERT INTO usage_records
                 (id, tenant_id, feature_key, charged_minor, reference_id, metadata_json, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.id.to_string(),
                    tenant,
                    feature,
                    minor(record.charged)?,
                    record.reference_id,
                    metadata,
                    record.created_at.timestamp_millis(),
                ],
            )?;
            tx.commit()?;
            Ok(DebitWrite::Applied { balance })
        })
        .await
    }

    async fn credit_once(
        &self,
        tenant_id: TenantId,
        amount: Tokens,
        idempotency_key: &str,
    ) -> StoreResult<CreditWrite> {
        let key = idempotency_key.to_string();
        self.with_conn(move |conn| {
            let tenant = tenant_id.to_string();
            let amount = minor(amount)?;
            let now = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(current) = balance_of(&tx, &tenant)? else {
                return Ok(CreditWrite::UnknownTenant);
            };

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO ledger_credits (idempotency_key, tenant_id, amount_minor, applied_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![key, tenant, amount, now],
            )?;
            if inserted == 0 {
                return Ok(CreditWrite::AlreadyApplied { balance: current });
            }

            let balance: i64 = tx.query_row(
                "UPDATE token_balances
                 SET balance_minor = balance_minor + ?2, updated_at_ms = ?3
                 WHERE tenant_id = ?1
                 RETURNING balance_minor",
                rusqlite::params![tenant, amount, now],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(CreditWrite::Applied {
                balance: Tokens::from_minor_units(balance)?,
            })
        })
        .await
    }

    async fn usage_history(&self, tenant_id: TenantId, limit: usize) -> StoreResult<Vec<UsageRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM usage_records WHERE tenant_id = ?1
                 ORDER BY created_at_ms DESC, rowid DESC LIMIT ?2",
                USAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![tenant_id.to_string(), i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| Ok(usage_from_row(row)),
            )?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row??);
            }
            Ok(records)
        })
        .await
    }

    async fn usage_by_reference(
        &self,
        tenant_id: TenantId,
        feature_key: &FeatureKey,
        reference_id: &str,
    ) -> StoreResult<Option<UsageRecord>> {
        let feature = feature_key.to_string();
        let reference = reference_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM usage_records
                     WHERE tenant_id = ?1 AND feature_key = ?2 AND reference_id = ?3",
                    USAGE_COLUMNS
                ),
                rusqlite::params![tenant_id.to_string(), feature, reference],
                |row| Ok(usage_from_row(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    async fn pricing_config(&self, key: &FeatureKey) -> StoreResult<Option<PricingConfig>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM pricing_configs WHERE key = ?1", PRICING_COLUMNS),
                [&key],
                |row| Ok(pricing_from_row(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    async fn list_pricing(&self) -> StoreResult<Vec<PricingConfig>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM pricing_configs ORDER BY key", PRICING_COLUMNS))?;
            let rows = stmt.query_map([], |row| Ok(pricing_from_row(row)))?;

            let mut configs = Vec::new();
            for row in rows {
                configs.push(row??);
            }
            Ok(configs)
        })
        .await
    }

    async fn upsert_pricing(&self, config: &PricingConfig) -> StoreResult<()> {
        let config = config.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO pricing_configs (key, divisor, markup, min_tokens, is_active, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (key) DO UPDATE SET
                     divisor = excluded.divisor,
                     markup = excluded.markup,
                     min_tokens = excluded.min_tokens,
                     is_active = excluded.is_active,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![
                    config.key.to_string(),
                    u64_to_i64(config.divisor)?,
                    config.markup.to_string(),
                    config.min_tokens.to_string(),
                    config.is_active,
                    now_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_pricing_if_absent(&self, config: &PricingConfig) -> StoreResult<bool> {
        let config = config.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO pricing_configs (key, divisor, markup, min_tokens, is_active, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    config.key.to_string(),
                    u64_to_i64(config.divisor)?,
                    config.markup.to_string(),
                    config.min_tokens.to_string(),
                    config.is_active,
                    now_millis(),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn set_pricing_active(&self, key: &FeatureKey, active: bool) -> StoreResult<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE pricing_configs SET is_active = ?2, updated_at_ms = ?3 WHERE key = ?1",
                rusqlite::params![key, active, now_millis()],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    async fn upsert_subscription(&self, term: &SubscriptionTerm) -> StoreResult<()> {
        let term = term.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO subscriptions (subscription_id, tenant_id, plan, start_date, end_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (subscription_id) DO UPDATE SET
                     tenant_id = excluded.tenant_id,
                     plan = excluded.plan,
                     start_date = excluded.start_date,
                     end_date = excluded.end_date",
                rusqlite::params![
                    term.subscription_id.to_string(),
                    term.tenant_id.to_string(),
                    term.plan,
                    date_to_text(term.start_date),
                    date_to_text(term.end_date),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn subscription(&self, subscription_id: SubscriptionId) -> StoreResult<Option<SubscriptionTerm>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT subscription_id, tenant_id, plan, start_date, end_date
                 FROM subscriptions WHERE subscription_id = ?1",
                [subscription_id.to_string()],
                |row| Ok(term_from_row(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    async fn provision_quota(
        &self,
        subscription_id: SubscriptionId,
        kind: QuotaKind,
        caps: QuotaCaps,
    ) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO subscription_quotas
                 (subscription_id, kind, monthly_cap, daily_cap, used_monthly, used_today, last_usage_date, cycle_start)
                 VALUES (?1, ?2, ?3, ?4, 0, 0, NULL, NULL)
                 ON CONFLICT (subscription_id, kind) DO UPDATE SET
                     monthly_cap = excluded.monthly_cap,
                     daily_cap = excluded.daily_cap",
                rusqlite::params![
                    subscription_id.to_string(),
                    kind.as_str(),
                    u64_to_i64(caps.monthly)?,
                    u64_to_i64(caps.daily)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn quota(&self, subscription_id: SubscriptionId, kind: QuotaKind) -> StoreResult<Option<SubscriptionQuota>> {
        self.with_conn(move |conn| load_quota(conn, &subscription_id.to_string(), kind.as_str()))
            .await
    }

    async fn consume_quota(
        &self,
        subscription_id: SubscriptionId,
        kind: QuotaKind,
        amount: u64,
        period: QuotaPeriod,
    ) -> StoreResult<ConsumeWrite> {
        self.with_conn(move |conn| {
            let subscription = subscription_id.to_string();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // Rollover, cap check and increment in one statement. Dates are
            // ISO text so `>=` orders them; a NULL date always rolls over and
            // an older caller date never rewinds the stored one.
            let consumed = tx
                .query_row(
                    &format!(
                        "UPDATE subscription_quotas
                         SET used_today = (CASE WHEN last_usage_date >= ?3 THEN used_today ELSE 0 END) + ?5,
                             used_monthly = (CASE WHEN cycle_start >= ?4 THEN used_monthly ELSE 0 END) + ?5,
                             last_usage_date = CASE WHEN last_usage_date > ?3 THEN last_usage_date ELSE ?3 END,
                             cycle_start = CASE WHEN cycle_start > ?4 THEN cycle_start ELSE ?4 END
                         WHERE subscription_id = ?1 AND kind = ?2
                           AND (daily_cap = 0
                                OR (CASE WHEN last_usage_date >= ?3 THEN used_today ELSE 0 END) + ?5 <= daily_cap)
                           AND (monthly_cap = 0
                                OR (CASE WHEN cycle_start >= ?4 THEN used_monthly ELSE 0 END) + ?5 <= monthly_cap)
                         RETURNING {}",
                        QUOTA_COLUMNS
                    ),
                    rusqlite::params![
                        subscription,
                        kind.as_str(),
                        date_to_text(period.today),
                        date_to_text(period.cycle_start),
                        u64_to_i64(amount)?,
                    ],
                    |row| Ok(quota_from_row(row)),
                )
                .optional()?
                .transpose()?;

            if let Some(quota) = consumed {
                tx.commit()?;
                return Ok(ConsumeWrite::Consumed(quota));
            }

            let Some(stored) = load_quota(&tx, &subscription, kind.as_str())? else {
                return Ok(ConsumeWrite::NotProvisioned);
            };
            let quota = stored.rolled_over(period);
            match quota.check(amount) {
                Err(scope) => Ok(ConsumeWrite::Exceeded { scope, quota }),
                Ok(()) => Err(SqliteStoreError::Value(format!(
                    "quota {}/{} rejected by store but within caps",
                    subscription, kind
                ))),
            }
        })
        .await
    }

    async fn release_quota(
        &self,
        subscription_id: SubscriptionId,
        kind: QuotaKind,
        amount: u64,
        period: QuotaPeriod,
    ) -> StoreResult<Option<SubscriptionQuota>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "UPDATE subscription_quotas
                     SET used_today = CASE WHEN last_usage_date = ?3
                                      THEN MAX(used_today - ?5, 0) ELSE used_today END,
                         used_monthly = CASE WHEN cycle_start = ?4
                                        THEN MAX(used_monthly - ?5, 0) ELSE used_monthly END
                     WHERE subscription_id = ?1 AND kind = ?2
                     RETURNING {}",
                    QUOTA_COLUMNS
                ),
                rusqlite::params![
                    subscription_id.to_string(),
                    kind.as_str(),
                    date_to_text(period.today),
                    date_to_text(period.cycle_start),
                    u64_to_i64(amount)?,
                ],
                |row| Ok(quota_from_row(row)),
            )
            .optional()?
            .transpose()
        })
        .await
    }

    async fn insert_purchase(&self, purchase: &Purchase) -> StoreResult<bool> {
        let purchase = purchase.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO purchases ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    PURCHASE_COLUMNS
                ),
                rusqlite::params![
                    purchase.id.to_string(),
                    purchase.tenant_id.to_string(),
                    purchase.package_id,
                    purchase.payment_reference.as_str(),
                    minor(purchase.token_amount)?,
                    purchase.status.as_str(),
                    purchase.created_at.timestamp_millis(),
                    purchase.updated_at.timestamp_millis(),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn purchase(&self, purchase_id: PurchaseId) -> StoreResult<Option<Purchase>> {
        self.with_conn(move |conn| load_purchase(conn, &purchase_id.to_string()))
            .await
    }

    async fn transition_purchase(
        &self,
        purchase_id: PurchaseId,
        to: PurchaseStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<TransitionWrite> {
        self.with_conn(move |conn| {
            let id = purchase_id.to_string();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let moved = tx
                .query_row(
                    &format!(
                        "UPDATE purchases SET status = ?2, updated_at_ms = ?3
                         WHERE id = ?1 AND status = 'pending' AND ?2 <> 'pending'
                         RETURNING {}",
                        PURCHASE_COLUMNS
                    ),
                    rusqlite::params![id, to.as_str(), at.timestamp_millis()],
                    |row| Ok(purchase_from_row(row)),
                )
                .optional()?
                .transpose()?;

            if let Some(purchase) = moved {
                tx.commit()?;
                return Ok(TransitionWrite::Transitioned(purchase));
            }

            Ok(match load_purchase(&tx, &id)? {
                None => TransitionWrite::NotFound,
                Some(purchase) if purchase.status == to => TransitionWrite::Unchanged(purchase),
                Some(purchase) => TransitionWrite::Rejected(purchase),
            })
        })
        .await
    }

    async fn pending_purchases_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<PurchaseId>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM purchases
                 WHERE status = 'pending' AND created_at_ms < ?1
                 ORDER BY created_at_ms, id",
            )?;
            let rows = stmt.query_map([cutoff.timestamp_millis()], |row| row.get::<_, String>(0))?;

            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?.parse::<PurchaseId>()?);
            }
            Ok(ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn store(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::open(dir.path().join("metering.sqlite"))
            .await
            .expect("open")
    }

    fn tokens(v: Decimal) -> Tokens {
        Tokens::new(v).expect("tokens")
    }

    #[tokio::test]
    async fn test_balance_debit_credit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let tenant = TenantId::new_v4();

        assert_eq!(store.balance(tenant).await.expect("balance"), None);
        assert!(store.open_account(tenant).await.expect("open"));
        assert!(!store.open_account(tenant).await.expect("reopen"));

        let credit = store.credit_once(tenant, tokens(dec!(12.34)), "pay_1").await.expect("credit");
        assert_eq!(credit, CreditWrite::Applied { balance: tokens(dec!(12.34)) });
        let again = store.credit_once(tenant, tokens(dec!(12.34)), "pay_1").await.expect("credit");
        assert_eq!(again, CreditWrite::AlreadyApplied { balance: tokens(dec!(12.34)) });

        let debit = store.debit(tenant, tokens(dec!(2.34))).await.expect("debit");
        assert_eq!(debit, DebitWrite::Applied { balance: tokens(dec!(10)) });

        let short = store.debit(tenant, tokens(dec!(10.01))).await.expect("debit");
        assert_eq!(short, DebitWrite::Insufficient { available: tokens(dec!(10)) });

        assert_eq!(
            store.debit(TenantId::new_v4(), tokens(dec!(1))).await.expect("debit"),
            DebitWrite::UnknownTenant
        );
    }

    #[tokio::test]
    async fn test_usage_replay_and_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let tenant = TenantId::new_v4();
        store.open_account(tenant).await.expect("open");
        store.credit_once(tenant, tokens(dec!(5)), "seed").await.expect("credit");

        let record = UsageRecord::new(tenant, FeatureKey::new("chatbot").expect("key"), tokens(dec!(1.50)))
            .with_reference(Some("req-9".into()))
            .with_metadata(Some(serde_json::json!({ "model": "small" })));
        let first = store.debit_with_usage(&record).await.expect("debit");
        assert_eq!(first, DebitWrite::Applied { balance: tokens(dec!(3.50)) });

        let mut retry = record.clone();
        retry.id = Uuid::new_v4();
        match store.debit_with_usage(&retry).await.expect("replay") {
            DebitWrite::Replayed { record: original, balance } => {
                assert_eq!(original.id, record.id);
                assert_eq!(original.metadata, record.metadata);
                assert_eq!(balance, tokens(dec!(3.50)));
            }
            other => panic!("expected replay, got {:?}", other),
        }

        let history = store.usage_history(tenant, 10).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reference_id.as_deref(), Some("req-9"));

        let found = store
            .usage_by_reference(tenant, &record.feature_key, "req-9")
            .await
            .expect("lookup")
            .expect("record");
        assert_eq!(found.id, record.id);
        assert!(store
            .usage_by_reference(tenant, &record.feature_key, "req-10")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn test_pricing_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;

        let config = PricingConfig::new(FeatureKey::new("chatbot").expect("key"), 200, dec!(1.5), tokens(dec!(0.05)));
        store.upsert_pricing(&config).await.expect("upsert");
        assert!(!store.insert_pricing_if_absent(&config).await.expect("insert"));

        let loaded = store.pricing_config(&config.key).await.expect("load").expect("present");
        assert_eq!(loaded, config);

        assert!(store.set_pricing_active(&config.key, false).await.expect("deactivate"));
        assert!(!store.set_pricing_active(&FeatureKey::default_key(), false).await.expect("missing"));
        let all = store.list_pricing().await.expect("list");
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_active);
    }

    #[tokio::test]
    async fn test_quota_rollover_in_sql() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let sub = SubscriptionId::new_v4();
        store
            .provision_quota(sub, QuotaKind::Blast, QuotaCaps::new(150, 100))
            .await
            .expect("provision");

        let day1 = QuotaPeriod {
            today: NaiveDate::from_ymd_opt(2024, 3, 10).expect("date"),
            cycle_start: NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
        };
        store.consume_quota(sub, QuotaKind::Blast, 95, day1).await.expect("consume");

        match store.consume_quota(sub, QuotaKind::Blast, 10, day1).await.expect("consume") {
            ConsumeWrite::Exceeded { scope, quota } => {
                assert_eq!(scope, crate::quota::QuotaScope::Daily);
                assert_eq!(quota.used_today, 95);
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        let day2 = QuotaPeriod {
            today: NaiveDate::from_ymd_opt(2024, 3, 11).expect("date"),
            ..day1
        };
        match store.consume_quota(sub, QuotaKind::Blast, 10, day2).await.expect("consume") {
            ConsumeWrite::Consumed(q) => {
                assert_eq!(q.used_today, 10);
                assert_eq!(q.used_monthly, 105);
            }
            other => panic!("expected consume, got {:?}", other),
        }

        match store.consume_quota(sub, QuotaKind::Blast, 50, day2).await.expect("consume") {
            ConsumeWrite::Exceeded { scope, .. } => assert_eq!(scope, crate::quota::QuotaScope::Monthly),
            other => panic!("expected monthly rejection, got {:?}", other),
        }

        let released = store
            .release_quota(sub, QuotaKind::Blast, 5, day2)
            .await
            .expect("release")
            .expect("row");
        assert_eq!((released.used_today, released.used_monthly), (5, 100));

        // Provisioning again only touches caps
        store
            .provision_quota(sub, QuotaKind::Blast, QuotaCaps::new(0, 0))
            .await
            .expect("provision");
        let row = store.quota(sub, QuotaKind::Blast).await.expect("quota").expect("row");
        assert_eq!(row.used_monthly, 100);
        assert_eq!(row.caps, QuotaCaps::new(0, 0));
    }

    #[tokio::test]
    async fn test_late_consume_across_midnight_keeps_new_day() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let sub = SubscriptionId::new_v4();
        store
            .provision_quota(sub, QuotaKind::Blast, QuotaCaps::new(100, 10))
            .await
            .expect("provision");

        let new_day = QuotaPeriod {
            today: NaiveDate::from_ymd_opt(2024, 4, 1).expect("date"),
            cycle_start: NaiveDate::from_ymd_opt(2024, 4, 1).expect("date"),
        };
        let old_day = QuotaPeriod {
            today: NaiveDate::from_ymd_opt(2024, 3, 31).expect("date"),
            cycle_start: NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
        };

        store.consume_quota(sub, QuotaKind::Blast, 10, new_day).await.expect("consume");
        match store.consume_quota(sub, QuotaKind::Blast, 1, old_day).await.expect("late consume") {
            ConsumeWrite::Exceeded { scope, quota } => {
                assert_eq!(scope, crate::quota::QuotaScope::Daily);
                assert_eq!(quota.last_usage_date, Some(new_day.today));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(matches!(
            store.consume_quota(sub, QuotaKind::Blast, 10, new_day).await.expect("consume"),
            ConsumeWrite::Exceeded { .. }
        ));

        let row = store.quota(sub, QuotaKind::Blast).await.expect("quota").expect("row");
        assert_eq!((row.used_today, row.used_monthly), (10, 10));
        assert_eq!(row.last_usage_date, Some(new_day.today));
        assert_eq!(row.cycle_start, Some(new_day.cycle_start));

        // Within caps, a late caller counts against the stored day
        store
            .provision_quota(sub, QuotaKind::Blast, QuotaCaps::new(0, 0))
            .await
            .expect("provision");
        match store.consume_quota(sub, QuotaKind::Blast, 2, old_day).await.expect("late consume") {
            ConsumeWrite::Consumed(q) => {
                assert_eq!((q.used_today, q.used_monthly), (12, 12));
                assert_eq!(q.last_usage_date, Some(new_day.today));
                assert_eq!(q.cycle_start, Some(new_day.cycle_start));
            }
            other => panic!("expected consume, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_range_integers_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let sub = SubscriptionId::new_v4();

        let err = store
            .provision_quota(sub, QuotaKind::Ai, QuotaCaps::new(u64::MAX, 0))
            .await
            .expect_err("cap past i64");
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert_eq!(store.quota(sub, QuotaKind::Ai).await.expect("quota"), None);

        let config = PricingConfig::new(FeatureKey::new("chatbot").expect("key"), u64::MAX, dec!(1), tokens(dec!(0)));
        assert!(store.upsert_pricing(&config).await.is_err());
        assert!(store.list_pricing().await.expect("list").is_empty());

        store
            .provision_quota(sub, QuotaKind::Ai, QuotaCaps::new(0, 0))
            .await
            .expect("provision");
        assert!(store
            .consume_quota(sub, QuotaKind::Ai, u64::MAX, QuotaPeriod {
                today: NaiveDate::from_ymd_opt(2024, 4, 1).expect("date"),
                cycle_start: NaiveDate::from_ymd_opt(2024, 4, 1).expect("date"),
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_purchase_transitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).await;
        let now = Utc::now();
        let purchase = Purchase::pending(
            TenantId::new_v4(),
            "starter",
            PaymentReference::new("pay_77").expect("ref"),
            tokens(dec!(100)),
            now - chrono::Duration::hours(30),
        );

        assert!(store.insert_purchase(&purchase).await.expect("insert"));
        let mut dup = purchase.clone();
        dup.id = PurchaseId::new_v4();
        assert!(!store.insert_purchase(&dup).await.expect("insert dup"));

        let stale = store.pending_purchases_before(now).await.expect("stale");
        assert_eq!(stale, vec![purchase.id]);

        let write = store
            .transition_purchase(purchase.id, PurchaseStatus::Success, now)
            .await
            .expect("transition");
        assert!(matches!(write, TransitionWrite::Transitioned(ref p) if p.status == PurchaseStatus::Success));

        assert!(matches!(
            store.transition_purchase(purchase.id, PurchaseStatus::Success, now).await.expect("again"),
            TransitionWrite::Unchanged(_)
        ));
        assert!(matches!(
            store.transition_purchase(purchase.id, PurchaseStatus::Expired, now).await.expect("expire"),
            TransitionWrite::Rejected(_)
        ));
        assert!(matches!(
            store.transition_purchase(PurchaseId::new_v4(), PurchaseStatus::Failed, now).await.expect("missing"),
            TransitionWrite::NotFound
        ));
        assert!(store.pending_purchases_before(now).await.expect("stale").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_across_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = Arc::new(store(&dir).await);
        // A second handle stands in for another process on the same file
        let second = Arc::new(SqliteStore::open(first.path().to_path_buf()).await.expect("open"));

        let tenant = TenantId::new_v4();
        first.open_account(tenant).await.expect("open");
        first.credit_once(tenant, tokens(dec!(1)), "seed").await.expect("credit");

        let mut handles = Vec::new();
        for i in 0..30 {
            let store = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                store.debit(tenant, tokens(dec!(0.10))).await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if let DebitWrite::Applied { .. } = handle.await.expect("join").expect("debit") {
                applied += 1;
            }
        }
        assert_eq!(applied, 10);
        assert_eq!(first.balance(tenant).await.expect("balance"), Some(Tokens::ZERO));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consume_respects_daily_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(store(&dir).await);
        let sub = SubscriptionId::new_v4();
        store
            .provision_quota(sub, QuotaKind::Ai, QuotaCaps::new(0, 25))
            .await
            .expect("provision");

        let period = QuotaPeriod {
            today: NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"),
            cycle_start: NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"),
        };

        let mut handles = Vec::new();
        for _ in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.consume_quota(sub, QuotaKind::Ai, 1, period).await
            }));
        }
        let mut consumed = 0;
        for handle in handles {
            if let ConsumeWrite::Consumed(_) = handle.await.expect("join").expect("consume") {
                consumed += 1;
            }
        }

        assert_eq!(consumed, 25);
        let row = store.quota(sub, QuotaKind::Ai).await.expect("quota").expect("row");
        assert_eq!(row.used_today, 25);
    }
}
