//! Metering Common - Shared value objects for the metering engine
//!
//! Everything here is a self-validating value: once constructed, an
//! identifier or an amount is known to satisfy its invariants, so the
//! engine layers never re-check them.
//!
//! - **Identifiers**: `TenantId`, `SubscriptionId`, `PurchaseId`,
//!   `FeatureKey`, `PaymentReference`
//! - **Amounts**: `Tokens`, an exact two-decimal token quantity
//! - **Time**: `Clock`, the UTC source used for quota rollover

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod amount;
pub mod clock;
pub mod error;
pub mod ids;

pub use amount::{Tokens, TOKEN_SCALE};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use ids::{FeatureKey, PaymentReference, PurchaseId, SubscriptionId, TenantId};
