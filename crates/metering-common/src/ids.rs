//! Identifiers - Immutable, validated keys for tenants, subscriptions and purchases
//!
//! UUID-backed identifiers are always valid once parsed. String-backed keys
//! (`FeatureKey`, `PaymentReference`) validate on construction and on
//! deserialization, so a config file cannot smuggle in an empty key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Get the inner UUID
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> DomainResult<Self> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|e| DomainError::InvalidIdentifier(format!("{}: {}", stringify!($name), e)))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Tenant identifier (Value Object)
    TenantId
);

uuid_id!(
    /// Subscription identifier (Value Object)
    SubscriptionId
);

uuid_id!(
    /// Purchase identifier (Value Object)
    PurchaseId
);

/// Reserved key of the fallback pricing config
pub const DEFAULT_FEATURE_KEY: &str = "default";

/// Feature key (Value Object)
///
/// # Invariants
/// - Must be non-empty
/// - Max 64 characters
/// - ASCII alphanumerics, `-`, `_` and `.` only
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureKey(String);

impl FeatureKey {
    /// Create new feature key with validation
    pub fn new(key: impl Into<String>) -> DomainResult<Self> {
        let key = key.into();

        if key.is_empty() {
            return Err(DomainError::InvalidFeatureKey("cannot be empty".into()));
        }
        if key.len() > 64 {
            return Err(DomainError::InvalidFeatureKey("max 64 characters".into()));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(DomainError::InvalidFeatureKey(format!(
                "'{}' contains characters outside [A-Za-z0-9._-]",
                key
            )));
        }

        Ok(Self(key))
    }

    /// The `"default"` key used when no feature-specific pricing applies
    pub fn default_key() -> Self {
        Self(DEFAULT_FEATURE_KEY.to_string())
    }

    /// Whether this is the fallback key
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_FEATURE_KEY
    }

    /// Get inner value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FeatureKey {
    type Error = DomainError;

    fn try_from(value: String) -> DomainResult<Self> {
        Self::new(value)
    }
}

impl From<FeatureKey> for String {
    fn from(key: FeatureKey) -> Self {
        key.0
    }
}

impl FromStr for FeatureKey {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        Self::new(s)
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External payment reference issued by the payment gateway (Value Object)
///
/// Doubles as the idempotency key of the ledger credit for a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaymentReference(String);

impl PaymentReference {
    /// Create new payment reference with validation
    pub fn new(reference: impl Into<String>) -> DomainResult<Self> {
        let reference = reference.into().trim().to_string();
        if reference.is_empty() {
            return Err(DomainError::InvalidPaymentReference("cannot be empty".into()));
        }
        if reference.len() > 128 {
            return Err(DomainError::InvalidPaymentReference("max 128 characters".into()));
        }
        Ok(Self(reference))
    }

    /// Get inner value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PaymentReference {
    type Error = DomainError;

    fn try_from(value: String) -> DomainResult<Self> {
        Self::new(value)
    }
}

impl From<PaymentReference> for String {
    fn from(reference: PaymentReference) -> Self {
        reference.0
    }
}

impl FromStr for PaymentReference {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        Self::new(s)
    }
}

impl fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_key_valid() {
        let key = FeatureKey::new("ai.reply-suggest_v2").unwrap();
        assert_eq!(key.as_str(), "ai.reply-suggest_v2");
        assert!(!key.is_default());
        assert!(FeatureKey::default_key().is_default());
    }

    #[test]
    fn test_feature_key_rejects_bad_input() {
        assert!(FeatureKey::new("").is_err());
        assert!(FeatureKey::new("a".repeat(65)).is_err());
        assert!(FeatureKey::new("ai reply").is_err());
        assert!(FeatureKey::new("ai/reply").is_err());
    }

    #[test]
    fn test_feature_key_deserialize_validates() {
        let ok: FeatureKey = serde_json::from_str("\"chatbot\"").unwrap();
        assert_eq!(ok.as_str(), "chatbot");
        assert!(serde_json::from_str::<FeatureKey>("\"\"").is_err());
    }

    #[test]
    fn test_payment_reference_trims() {
        let reference = PaymentReference::new("  INV-2024-0001 ").unwrap();
        assert_eq!(reference.as_str(), "INV-2024-0001");
        assert!(PaymentReference::new("   ").is_err());
        assert!(PaymentReference::new("x".repeat(129)).is_err());
    }

    #[test]
    fn test_uuid_ids_parse() {
        let tenant = TenantId::new_v4();
        let parsed: TenantId = tenant.to_string().parse().unwrap();
        assert_eq!(parsed, tenant);
        assert!("not-a-uuid".parse::<PurchaseId>().is_err());
    }
}
