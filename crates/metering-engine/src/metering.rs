//! Usage Meter
//!
//! Converts a provider-reported raw unit count into a token charge and
//! commits the debit together with its usage record. The gated action may
//! run only after `charge` returns `Ok`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use metering_common::{FeatureKey, TenantId, Tokens};

use crate::error::MeteringResult;
use crate::ledger::{TokenLedger, UsageRecord};
use crate::pricing::{compute_charge, PricingResolver};

/// One metered call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Tenant to charge
    pub tenant_id: TenantId,
    /// Feature that consumed the units
    pub feature_key: FeatureKey,
    /// Vendor-reported units
    pub raw_units: u64,
    /// Originating request; retries with the same id are replays
    #[serde(default)]
    pub reference_id: Option<String>,
    /// Stored with the usage record
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl ChargeRequest {
    /// Request without reference or metadata
    pub fn new(tenant_id: TenantId, feature_key: FeatureKey, raw_units: u64) -> Self {
        Self {
            tenant_id,
            feature_key,
            raw_units,
            reference_id: None,
            metadata: None,
        }
    }

    /// Attach a reference id
    pub fn reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    /// Attach metadata
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of a successful charge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    /// Usage record id
    pub record_id: Uuid,
    /// Amount debited
    pub charged: Tokens,
    /// Balance after the charge
    pub balance: Tokens,
    /// Returned from an earlier charge with the same reference id
    pub replayed: bool,
}

/// Meters feature usage against the token ledger
pub struct UsageMeter {
    pricing: Arc<PricingResolver>,
    ledger: Arc<TokenLedger>,
}

impl UsageMeter {
    /// Create meter
    pub fn new(pricing: Arc<PricingResolver>, ledger: Arc<TokenLedger>) -> Self {
        Self { pricing, ledger }
    }

    /// Price, debit and record one call
    ///
    /// On `InsufficientBalance` nothing is written and the error is
    /// returned so the caller can abort before performing the action.
    pub async fn charge(&self, request: ChargeRequest) -> MeteringResult<ChargeReceipt> {
        let config = self.pricing.resolve(&request.feature_key).await?;
        let charged = compute_charge(&config, request.raw_units)?;

        tracing::debug!(
            tenant_id = %request.tenant_id,
            feature = %request.feature_key,
            pricing = %config.key,
            raw_units = request.raw_units,
            charged = %charged,
            "charge computed"
        );

        let record = UsageRecord::new(request.tenant_id, request.feature_key, charged)
            .with_reference(request.reference_id)
            .with_metadata(request.metadata);

        let receipt = self.ledger.debit_for_usage(record).await?;
        Ok(ChargeReceipt {
            record_id: receipt.record.id,
            charged: receipt.record.charged,
            balance: receipt.balance,
            replayed: receipt.replayed,
        })
    }

    /// Receipt for a charge already committed under the request's reference
    ///
    /// `None` when the request has no reference id or nothing was charged
    /// under it yet.
    pub async fn committed(&self, request: &ChargeRequest) -> MeteringResult<Option<ChargeReceipt>> {
        let Some(reference) = request.reference_id.as_deref() else {
            return Ok(None);
        };
        let Some(record) = self
            .ledger
            .find_usage(request.tenant_id, &request.feature_key, reference)
            .await?
        else {
            return Ok(None);
        };

        let balance = self.ledger.balance(request.tenant_id).await?;
        Ok(Some(ChargeReceipt {
            record_id: record.id,
            charged: record.charged,
            balance,
            replayed: true,
        }))
    }

    /// What `charge` would debit, without debiting
    pub async fn quote(&self, feature_key: &FeatureKey, raw_units: u64) -> MeteringResult<Tokens> {
        self.pricing.quote(feature_key, raw_units).await
    }
}
