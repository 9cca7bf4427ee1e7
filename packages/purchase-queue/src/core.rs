//! Domain types shared by every part of the coordinator.
//!
//! # Overview
//!
//! Two kinds of values flow through the system:
//! - [`PurchaseRequest`] = Intent (a caller wants to buy a product)
//! - [`TransactionEvent`] = Facts (the store reports what happened to a transaction)
//!
//! Requests are never mutated. A repeat purchase of the same product after the
//! previous attempt settled is a fresh request.
//!
//! Transaction events are store-assigned and delivered at least once. The same
//! [`TransactionId`] may arrive several times, and states are not guaranteed to
//! be monotonic across redeliveries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PurchaseError;

/// Outcome delivered to every caller waiting on a product.
pub type PurchaseResult = Result<PurchasedInfo, PurchaseError>;

/// Store-assigned, opaque transaction identifier.
///
/// # Example
///
/// ```ignore
/// use purchase_queue::TransactionId;
///
/// let id = TransactionId::from("1000000123456789");
/// assert_eq!(id.as_str(), "1000000123456789");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wrap a store-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for TransactionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a store transaction.
///
/// ```text
/// Purchasing ──► Purchased | Failed | Restored   (terminal)
///      │
///      └──────► Deferred ──► (superseded by a later event)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Purchasing,
    Deferred,
    Purchased,
    Failed,
    Restored,
}

impl TransactionState {
    /// Terminal states are the ones the reconciler acts on.
    ///
    /// `Deferred` is a stable holding state (e.g. parental approval) but it is
    /// not terminal: the transaction stays pending until a later event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Purchased | TransactionState::Failed | TransactionState::Restored
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Purchasing => write!(f, "purchasing"),
            TransactionState::Deferred => write!(f, "deferred"),
            TransactionState::Purchased => write!(f, "purchased"),
            TransactionState::Failed => write!(f, "failed"),
            TransactionState::Restored => write!(f, "restored"),
        }
    }
}

/// Error payload attached to a failed transaction by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionError {
    /// Store-specific error code, when the store provided one.
    pub code: Option<i64>,
    /// Error domain reported by the store.
    pub domain: Option<String>,
    pub message: String,
}

impl TransactionError {
    /// Code the store uses when the user dismissed the payment sheet.
    pub const PAYMENT_CANCELLED: i64 = 2;

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            domain: None,
            message: message.into(),
        }
    }

    /// Set the store error code.
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Set the store error domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// The error the store reports for a user-cancelled payment.
    pub fn cancelled() -> Self {
        Self::new("payment cancelled by user").with_code(Self::PAYMENT_CANCELLED)
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == Some(Self::PAYMENT_CANCELLED)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.domain, self.code) {
            (Some(domain), Some(code)) => write!(f, "{} ({}:{})", self.message, domain, code),
            (None, Some(code)) => write!(f, "{} (code {})", self.message, code),
            _ => f.write_str(&self.message),
        }
    }
}

/// One delivery from the store collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: TransactionId,
    pub product_id: String,
    pub state: TransactionState,
    pub error: Option<TransactionError>,
    /// When the store recorded the transaction, if known.
    pub transacted_at: Option<DateTime<Utc>>,
}

impl TransactionEvent {
    pub fn new(
        transaction_id: impl Into<TransactionId>,
        product_id: impl Into<String>,
        state: TransactionState,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            product_id: product_id.into(),
            state,
            error: None,
            transacted_at: None,
        }
    }

    pub fn purchased(transaction_id: impl Into<TransactionId>, product_id: impl Into<String>) -> Self {
        Self::new(transaction_id, product_id, TransactionState::Purchased)
    }

    pub fn failed(transaction_id: impl Into<TransactionId>, product_id: impl Into<String>) -> Self {
        Self::new(transaction_id, product_id, TransactionState::Failed)
    }

    pub fn restored(transaction_id: impl Into<TransactionId>, product_id: impl Into<String>) -> Self {
        Self::new(transaction_id, product_id, TransactionState::Restored)
    }

    /// Attach the store's error payload.
    pub fn with_error(mut self, error: TransactionError) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach the store timestamp.
    pub fn with_transacted_at(mut self, at: DateTime<Utc>) -> Self {
        self.transacted_at = Some(at);
        self
    }
}

/// Descriptive product data.
///
/// A product may be structurally empty ([`Product::unknown`]) when the catalog
/// could not resolve it. Outcomes are still reported for such products.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub vendor_product_id: String,
    pub localized_title: Option<String>,
    /// Display price as formatted by the store.
    pub localized_price: Option<String>,
    pub currency_code: Option<String>,
}

impl Product {
    pub fn new(vendor_product_id: impl Into<String>) -> Self {
        Self {
            vendor_product_id: vendor_product_id.into(),
            localized_title: None,
            localized_price: None,
            currency_code: None,
        }
    }

    /// An empty product carrying only its identifier.
    pub fn unknown(vendor_product_id: impl Into<String>) -> Self {
        Self::new(vendor_product_id)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.localized_title = Some(title.into());
        self
    }

    pub fn with_price(mut self, price: impl Into<String>, currency_code: impl Into<String>) -> Self {
        self.localized_price = Some(price.into());
        self.currency_code = Some(currency_code.into());
        self
    }

    /// True when nothing beyond the identifier is known.
    pub fn is_unknown(&self) -> bool {
        self.localized_title.is_none()
            && self.localized_price.is_none()
            && self.currency_code.is_none()
    }
}

/// A caller-initiated purchase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRequest {
    pub product: Product,
    /// Paywall variation the product was presented under.
    pub variation_id: Option<String>,
    /// Explicit override for the persistent attribution table.
    pub persistent_variation_id: Option<String>,
}

impl PurchaseRequest {
    pub fn new(product: Product) -> Self {
        Self {
            product,
            variation_id: None,
            persistent_variation_id: None,
        }
    }

    pub fn with_variation_id(mut self, variation_id: impl Into<String>) -> Self {
        self.variation_id = Some(variation_id.into());
        self
    }

    pub fn with_persistent_variation_id(mut self, variation_id: impl Into<String>) -> Self {
        self.persistent_variation_id = Some(variation_id.into());
        self
    }

    pub fn product_id(&self) -> &str {
        &self.product.vendor_product_id
    }
}

/// Everything the validator needs to verify one purchased transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseProductInfo {
    pub product: Product,
    pub variation_id: Option<String>,
    pub persistent_variation_id: Option<String>,
    pub transaction: TransactionEvent,
}

/// Profile returned by a successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub profile_id: String,
    pub customer_user_id: Option<String>,
    /// Access levels currently active for the profile.
    #[serde(default)]
    pub access_levels: Vec<String>,
}

impl Profile {
    pub fn new(profile_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            customer_user_id: None,
            access_levels: Vec::new(),
        }
    }

    pub fn with_access_level(mut self, level: impl Into<String>) -> Self {
        self.access_levels.push(level.into());
        self
    }
}

/// Success outcome of a purchase.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchasedInfo {
    pub profile: Profile,
    pub transaction: TransactionEvent,
}
