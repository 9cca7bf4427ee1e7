//! Store commands and their execution against the collaborators.
//!
//! Commands are the reconciler's requests for IO. Each one runs outside the
//! serialized context and reports back with at most one continuation event,
//! which the dispatcher enqueues onto the coordinator's mailbox.
//!
//! # Key Properties
//!
//! - **Stateless**: commands carry all needed data, effects never see
//!   reconciler state
//! - **Errors become events**: a failing collaborator produces a continuation
//!   describing the failure, never an unhandled fault
//! - **Narrow context**: only the collaborators are available

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::core::{PurchaseProductInfo, TransactionEvent};
use crate::error::PurchaseError;
use crate::reconciler::CoordinatorEvent;
use crate::resolver;
use crate::traits::{BasePaymentQueue, BaseProductCatalog, BasePurchaseValidator};

/// Collaborator IO decided by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    /// Add a payment for the product to the store queue.
    SubmitPayment { product_id: String },
    /// Look up metadata for a purchased transaction's product.
    ///
    /// Carries the attribution captured when the transaction arrived.
    ResolveProduct {
        transaction: TransactionEvent,
        variation_id: Option<String>,
        persistent_variation_id: Option<String>,
    },
    /// Ask the validator to verify a purchased transaction.
    Validate(PurchaseProductInfo),
    /// Acknowledge a transaction so the store stops redelivering it.
    Finalize(TransactionEvent),
}

impl StoreCommand {
    pub fn name(&self) -> &'static str {
        match self {
            StoreCommand::SubmitPayment { .. } => "submit_payment",
            StoreCommand::ResolveProduct { .. } => "resolve_product",
            StoreCommand::Validate(_) => "validate",
            StoreCommand::Finalize(_) => "finalize",
        }
    }

    pub fn product_id(&self) -> &str {
        match self {
            StoreCommand::SubmitPayment { product_id } => product_id,
            StoreCommand::ResolveProduct { transaction, .. } => &transaction.product_id,
            StoreCommand::Validate(info) => &info.transaction.product_id,
            StoreCommand::Finalize(transaction) => &transaction.product_id,
        }
    }

    /// Run the command and produce its continuation, if any.
    pub async fn execute(self, ctx: &EffectContext) -> Option<CoordinatorEvent> {
        match self {
            StoreCommand::SubmitPayment { product_id } => submit_payment(ctx, product_id).await,
            StoreCommand::ResolveProduct {
                transaction,
                variation_id,
                persistent_variation_id,
            } => {
                let product = resolver::fetch(ctx.catalog(), &transaction.product_id).await;
                Some(CoordinatorEvent::ProductResolved {
                    transaction,
                    product,
                    variation_id,
                    persistent_variation_id,
                })
            }
            StoreCommand::Validate(info) => {
                let transaction = info.transaction.clone();
                let result = ctx
                    .validator()
                    .validate_purchase(info)
                    .await
                    .map_err(PurchaseError::validation);
                Some(CoordinatorEvent::ValidationFinished {
                    transaction,
                    result,
                })
            }
            StoreCommand::Finalize(transaction) => {
                // A failed finish leaves the transaction in the store queue;
                // the store redelivers it and nobody is waiting on this call.
                match ctx.store().finish_transaction(&transaction).await {
                    Ok(()) => debug!(
                        transaction_id = %transaction.transaction_id,
                        product_id = %transaction.product_id,
                        "transaction finished"
                    ),
                    Err(e) => warn!(
                        transaction_id = %transaction.transaction_id,
                        product_id = %transaction.product_id,
                        error = %e,
                        "failed to finish transaction"
                    ),
                }
                None
            }
        }
    }

    /// Continuation to enqueue when execution panicked.
    ///
    /// Keeps waiters from hanging on a command that will never report back.
    pub fn panic_continuation(&self, panic_msg: &str) -> Option<CoordinatorEvent> {
        match self {
            StoreCommand::SubmitPayment { product_id } => Some(CoordinatorEvent::PaymentRejected {
                product_id: product_id.clone(),
                reason: format!("payment submission panicked: {}", panic_msg),
            }),
            StoreCommand::ResolveProduct {
                transaction,
                variation_id,
                persistent_variation_id,
            } => Some(CoordinatorEvent::ProductResolved {
                transaction: transaction.clone(),
                product: crate::core::Product::unknown(&transaction.product_id),
                variation_id: variation_id.clone(),
                persistent_variation_id: persistent_variation_id.clone(),
            }),
            StoreCommand::Validate(info) => Some(CoordinatorEvent::ValidationFinished {
                transaction: info.transaction.clone(),
                result: Err(PurchaseError::validation(anyhow!(
                    "validator panicked: {}",
                    panic_msg
                ))),
            }),
            StoreCommand::Finalize(_) => None,
        }
    }
}

async fn submit_payment(ctx: &EffectContext, product_id: String) -> Option<CoordinatorEvent> {
    if !ctx.store().can_make_payments() {
        info!(product_id = %product_id, "store cannot make payments");
        return Some(CoordinatorEvent::PaymentRejected {
            product_id,
            reason: "payments are not allowed on this device".to_string(),
        });
    }

    match ctx.store().submit_payment(&product_id).await {
        Ok(()) => None,
        Err(e) => {
            warn!(product_id = %product_id, error = %e, "payment submission failed");
            Some(CoordinatorEvent::PaymentRejected {
                product_id,
                reason: e.to_string(),
            })
        }
    }
}

/// Collaborators available to commands.
///
/// # Immutability Invariant
///
/// `EffectContext` is immutable and cheap to clone. Clones are semantically
/// identical; every command gets its own clone.
#[derive(Clone)]
pub struct EffectContext {
    store: Arc<dyn BasePaymentQueue>,
    catalog: Arc<dyn BaseProductCatalog>,
    validator: Arc<dyn BasePurchaseValidator>,
}

impl EffectContext {
    pub fn new(
        store: Arc<dyn BasePaymentQueue>,
        catalog: Arc<dyn BaseProductCatalog>,
        validator: Arc<dyn BasePurchaseValidator>,
    ) -> Self {
        Self {
            store,
            catalog,
            validator,
        }
    }

    pub fn store(&self) -> &dyn BasePaymentQueue {
        self.store.as_ref()
    }

    pub fn catalog(&self) -> &dyn BaseProductCatalog {
        self.catalog.as_ref()
    }

    pub fn validator(&self) -> &dyn BasePurchaseValidator {
        self.validator.as_ref()
    }
}

impl std::fmt::Debug for EffectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectContext").finish_non_exhaustive()
    }
}
