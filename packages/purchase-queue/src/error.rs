//! Structured purchase errors and their categories.
//!
//! `PurchaseError` is the only error type delivered to callers. It is `Clone`
//! because one outcome fans out, verbatim, to every caller coalesced onto the
//! same purchase attempt.
//!
//! # The Error Boundary Rule
//!
//! > **Collaborator errors never escape as unhandled faults.**
//!
//! - `anyhow` is the collaborator transport (store, catalog, validator, storage)
//! - `PurchaseError` is the only externalized error (structured for callers)
//!
//! Validator errors are carried unchanged inside [`PurchaseError::ValidationFailed`].
//!
//! # Example
//!
//! ```ignore
//! match handle.submit_purchase(request).await {
//!     Ok(info) => println!("unlocked {:?}", info.profile.access_levels),
//!     Err(PurchaseError::TransactionFailed { error, .. }) if error.is_cancellation() => {}
//!     Err(e) => eprintln!("purchase failed ({}): {}", e.category(), e),
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::core::TransactionError;

// =============================================================================
// Error Category
// =============================================================================

/// Coarse classification used in structured log fields and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The store refused to take a payment.
    StoreUnavailable,
    /// The store reported the transaction as failed.
    TransactionFailed,
    /// The validator rejected or could not verify the purchase.
    Validation,
    /// The coordinator was torn down.
    Lifecycle,
    /// Anomalies that are logged but never delivered.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::StoreUnavailable => write!(f, "store_unavailable"),
            ErrorCategory::TransactionFailed => write!(f, "transaction_failed"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Lifecycle => write!(f, "lifecycle"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

// =============================================================================
// Purchase Error
// =============================================================================

/// Errors delivered to purchase callers or logged by the coordinator.
#[derive(Debug, Clone, Error)]
pub enum PurchaseError {
    /// The store cannot accept payments on this device, or rejected the submission.
    #[error("payments are unavailable for product {product_id}: {reason}")]
    PaymentSubmissionUnavailable { product_id: String, reason: String },

    /// Product metadata lookup failed. Non-fatal: the product degrades to empty metadata.
    #[error("failed to resolve product {product_id}: {reason}")]
    ProductResolutionFailed { product_id: String, reason: String },

    /// The validator returned an error. The transaction is left un-finalized.
    #[error("purchase validation failed: {0}")]
    ValidationFailed(Arc<anyhow::Error>),

    /// The store reported the transaction as failed.
    #[error("purchase of {product_id} failed: {error}")]
    TransactionFailed {
        product_id: String,
        error: TransactionError,
    },

    /// The store reported a failure without attaching an error.
    #[error("purchase of {product_id} failed for an unknown reason")]
    UnknownTransactionFailure { product_id: String },

    /// A terminal event arrived with nobody waiting on the product.
    #[error("no pending purchase request for product {product_id}")]
    NoPendingRequestForProduct { product_id: String },

    /// No store-initiated payment is parked for the product.
    #[error("no deferred store payment for product {product_id}")]
    NoDeferredPayment { product_id: String },

    /// The coordinator was torn down before the purchase resolved.
    #[error("purchase coordinator has shut down")]
    CoordinatorShutDown,
}

impl PurchaseError {
    /// Wrap a validator error without altering it.
    pub fn validation(err: anyhow::Error) -> Self {
        PurchaseError::ValidationFailed(Arc::new(err))
    }

    /// Build the failure outcome for a failed transaction.
    ///
    /// Falls back to [`PurchaseError::UnknownTransactionFailure`] when the store
    /// attached no error.
    pub fn from_failed_transaction(product_id: &str, error: Option<&TransactionError>) -> Self {
        match error {
            Some(error) => PurchaseError::TransactionFailed {
                product_id: product_id.to_string(),
                error: error.clone(),
            },
            None => PurchaseError::UnknownTransactionFailure {
                product_id: product_id.to_string(),
            },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PurchaseError::PaymentSubmissionUnavailable { .. } => ErrorCategory::StoreUnavailable,
            PurchaseError::TransactionFailed { .. }
            | PurchaseError::UnknownTransactionFailure { .. } => ErrorCategory::TransactionFailed,
            PurchaseError::ValidationFailed(_) => ErrorCategory::Validation,
            PurchaseError::CoordinatorShutDown => ErrorCategory::Lifecycle,
            PurchaseError::ProductResolutionFailed { .. }
            | PurchaseError::NoPendingRequestForProduct { .. }
            | PurchaseError::NoDeferredPayment { .. } => ErrorCategory::Internal,
        }
    }

    /// True when the user dismissed the payment themselves.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PurchaseError::TransactionFailed { error, .. } if error.is_cancellation()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_failed_transaction_with_error() {
        let tx_error = TransactionError::new("card declined").with_code(4);
        let err = PurchaseError::from_failed_transaction("pro_monthly", Some(&tx_error));

        match &err {
            PurchaseError::TransactionFailed { product_id, error } => {
                assert_eq!(product_id, "pro_monthly");
                assert_eq!(error, &tx_error);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.category(), ErrorCategory::TransactionFailed);
    }

    #[test]
    fn test_failed_transaction_without_error_is_unknown() {
        let err = PurchaseError::from_failed_transaction("pro_monthly", None);
        assert!(matches!(
            err,
            PurchaseError::UnknownTransactionFailure { ref product_id } if product_id == "pro_monthly"
        ));
    }

    #[test]
    fn test_validation_error_is_shared_not_copied() {
        let err = PurchaseError::validation(anyhow!("receipt rejected"));
        let cloned = err.clone();

        match (&err, &cloned) {
            (PurchaseError::ValidationFailed(a), PurchaseError::ValidationFailed(b)) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => panic!("expected validation errors"),
        }
        assert_eq!(
            cloned.to_string(),
            "purchase validation failed: receipt rejected"
        );
    }

    #[test]
    fn test_cancellation_detection() {
        let err =
            PurchaseError::from_failed_transaction("pro_monthly", Some(&TransactionError::cancelled()));
        assert!(err.is_cancellation());
        assert!(!PurchaseError::CoordinatorShutDown.is_cancellation());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::StoreUnavailable.to_string(), "store_unavailable");
        assert_eq!(
            PurchaseError::CoordinatorShutDown.category().to_string(),
            "lifecycle"
        );
    }
}
