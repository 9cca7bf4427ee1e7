//! Platform transaction adapters.
//!
//! Store APIs report transactions in different shapes. Each adapter turns one
//! platform shape into a [`TransactionEvent`] so the reconciler only ever sees
//! one type.
//!
//! - [`LegacyQueueTransaction`]: queue-observer style updates with numeric
//!   state codes.
//! - [`ModernPurchaseResult`]: the result of an awaited purchase call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{TransactionError, TransactionEvent, TransactionId, TransactionState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("unknown transaction state code {0}")]
    UnknownStateCode(i64),

    #[error("transaction for {product_id} has no identifier")]
    MissingTransactionId { product_id: String },
}

// =============================================================================
// Legacy queue observer
// =============================================================================

/// Update delivered by a queue observer.
///
/// State codes: 0 purchasing, 1 purchased, 2 failed, 3 restored, 4 deferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyQueueTransaction {
    /// Absent while the transaction is still purchasing.
    pub transaction_identifier: Option<String>,
    pub product_identifier: String,
    pub transaction_state: i64,
    pub error: Option<TransactionError>,
    pub transaction_date: Option<DateTime<Utc>>,
}

impl LegacyQueueTransaction {
    pub fn state(&self) -> Result<TransactionState, AdapterError> {
        match self.transaction_state {
            0 => Ok(TransactionState::Purchasing),
            1 => Ok(TransactionState::Purchased),
            2 => Ok(TransactionState::Failed),
            3 => Ok(TransactionState::Restored),
            4 => Ok(TransactionState::Deferred),
            other => Err(AdapterError::UnknownStateCode(other)),
        }
    }
}

impl TryFrom<LegacyQueueTransaction> for TransactionEvent {
    type Error = AdapterError;

    fn try_from(tx: LegacyQueueTransaction) -> Result<Self, Self::Error> {
        let state = tx.state()?;

        let transaction_id = match tx.transaction_identifier {
            Some(id) => TransactionId::from(id),
            // Pending states carry no id yet; key them by product.
            None if !state.is_terminal() => {
                TransactionId::new(format!("pending:{}", tx.product_identifier))
            }
            None => {
                return Err(AdapterError::MissingTransactionId {
                    product_id: tx.product_identifier,
                })
            }
        };

        Ok(TransactionEvent {
            transaction_id,
            product_id: tx.product_identifier,
            state,
            error: tx.error,
            transacted_at: tx.transaction_date,
        })
    }
}

// =============================================================================
// Modern purchase result
// =============================================================================

/// Verified transaction carried by a successful modern purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedTransaction {
    pub id: u64,
    pub product_id: String,
    pub purchase_date: DateTime<Utc>,
}

/// Outcome of an awaited modern purchase call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ModernPurchaseResult {
    Success(VerifiedTransaction),
    /// Awaiting approval (e.g. ask-to-buy); a later update resolves it.
    Pending { product_id: String },
    UserCancelled { product_id: String },
}

impl From<ModernPurchaseResult> for TransactionEvent {
    fn from(result: ModernPurchaseResult) -> Self {
        match result {
            ModernPurchaseResult::Success(tx) => {
                TransactionEvent::purchased(tx.id.to_string(), tx.product_id)
                    .with_transacted_at(tx.purchase_date)
            }
            ModernPurchaseResult::Pending { product_id } => TransactionEvent::new(
                format!("pending:{}", product_id),
                product_id,
                TransactionState::Deferred,
            ),
            // Cancellations have no store id; each one must settle on its own.
            ModernPurchaseResult::UserCancelled { product_id } => {
                TransactionEvent::failed(format!("cancelled:{}", Uuid::new_v4()), product_id)
                    .with_error(TransactionError::cancelled())
            }
        }
    }
}
