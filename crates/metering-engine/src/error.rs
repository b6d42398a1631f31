//! Engine error taxonomy

use chrono::NaiveDate;
use metering_common::{DomainError, FeatureKey, PaymentReference, SubscriptionId, TenantId, Tokens};
use thiserror::Error;

use crate::purchases::PurchaseStatus;
use crate::quota::{QuotaKind, QuotaScope};
use crate::store::StoreError;

/// Metering engine error
///
/// Every variant is per-request. None of them leaves shared state half
/// applied, so callers may retry transient failures as a whole.
#[derive(Debug, Error)]
pub enum MeteringError {
    /// Balance does not cover the debit
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Amount the debit asked for
        required: Tokens,
        /// Balance at the time of the attempt
        available: Tokens,
    },

    /// Consumption would push a counter past its cap
    #[error(
        "{scope} {kind} quota exceeded on subscription {subscription_id}: \
         used {used} + requested {requested} > cap {cap}"
    )]
    QuotaExceeded {
        /// Subscription the quota belongs to
        subscription_id: SubscriptionId,
        /// Which allowance was checked
        kind: QuotaKind,
        /// Which counter rejected
        scope: QuotaScope,
        /// Cap of the rejecting counter
        cap: u64,
        /// Counter value after rollover
        used: u64,
        /// Requested amount
        requested: u64,
    },

    /// Neither the feature nor an active default has pricing
    #[error("no pricing configured for feature '{feature}' and no active default")]
    NoPricingConfigured {
        /// Feature that was resolved
        feature: FeatureKey,
    },

    /// Purchase status machine violation
    #[error("invalid purchase status transition: {from} -> {to}")]
    InvalidStatusTransition {
        /// Current status
        from: PurchaseStatus,
        /// Requested status
        to: PurchaseStatus,
    },

    /// Tenant has no balance row
    #[error("tenant not found: {0}")]
    TenantNotFound(TenantId),

    /// Unknown subscription
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// Subscription term does not cover the date
    #[error("subscription {subscription_id} is not active on {date}")]
    SubscriptionInactive {
        /// Subscription checked
        subscription_id: SubscriptionId,
        /// Date the check ran for
        date: NaiveDate,
    },

    /// Quota row for this kind was never provisioned
    #[error("no {kind} quota provisioned for subscription {subscription_id}")]
    QuotaNotProvisioned {
        /// Subscription checked
        subscription_id: SubscriptionId,
        /// Missing allowance
        kind: QuotaKind,
    },

    /// Unknown token package
    #[error("token package not found: {0}")]
    PackageNotFound(String),

    /// Purchase with this payment reference already exists
    #[error("duplicate payment reference: {0}")]
    DuplicatePaymentReference(PaymentReference),

    /// Pricing config failed validation
    #[error("invalid pricing: {0}")]
    InvalidPricing(String),

    /// Subscription term failed validation
    #[error("invalid subscription term: {0}")]
    InvalidSubscriptionTerm(String),

    /// Credit called without a usable idempotency key
    #[error("idempotency key cannot be empty")]
    InvalidIdempotencyKey,

    /// Value object validation
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Backing store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl MeteringError {
    /// Caller should abort the gated action; retrying will not help
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientBalance { .. } | Self::QuotaExceeded { .. }
        )
    }

    /// Safe to retry the whole operation
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// A failed charge that certainly wrote nothing
    ///
    /// Store errors are excluded: a timed-out write may still commit.
    pub fn is_uncommitted_charge(&self) -> bool {
        matches!(
            self,
            Self::InsufficientBalance { .. }
                | Self::NoPricingConfigured { .. }
                | Self::InvalidPricing(_)
                | Self::TenantNotFound(_)
                | Self::Domain(_)
        )
    }
}

/// Result type for engine operations
pub type MeteringResult<T> = Result<T, MeteringError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_classification() {
        let err = MeteringError::InsufficientBalance {
            required: Tokens::from_minor_units(500).unwrap(),
            available: Tokens::from_minor_units(120).unwrap(),
        };
        assert!(err.is_recoverable());
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "insufficient balance: required 5.00, available 1.20"
        );

        let err = MeteringError::Store(StoreError::Timeout(Duration::from_millis(50)));
        assert!(err.is_transient());
        assert!(!err.is_recoverable());

        let err = MeteringError::Store(StoreError::Backend("disk full".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_uncommitted_charge_classification() {
        let short = MeteringError::InsufficientBalance {
            required: Tokens::from_minor_units(500).unwrap(),
            available: Tokens::ZERO,
        };
        assert!(short.is_uncommitted_charge());
        assert!(MeteringError::TenantNotFound(TenantId::new_v4()).is_uncommitted_charge());

        let timeout = MeteringError::Store(StoreError::Timeout(Duration::from_millis(50)));
        assert!(!timeout.is_uncommitted_charge());
        assert!(!MeteringError::Store(StoreError::Conflict("busy".into())).is_uncommitted_charge());
        assert!(!MeteringError::Store(StoreError::Backend("io".into())).is_uncommitted_charge());
    }
}
