//! Transaction reconciler - the coordinator's state machine.
//!
//! Owns every piece of mutable coordinator state and decides, one message at a
//! time, which collaborator IO is needed next:
//!
//! ```text
//! PurchaseRequested ──► set variation ─► track product ─► register waiter
//!                                                        └─► SubmitPayment (first only)
//!
//! Purchased ──► ResolveProduct? ──► Validate ──► ok:  clear, Finalize, deliver success
//!                                            └─► err: deliver error (no finalize)
//! Failed    ──► Finalize, clear, deliver failure
//! Restored  ──► Finalize
//! ```
//!
//! # Duplicate delivery
//!
//! The store delivers transaction events at least once. Terminal events for a
//! transaction that is being validated, or that already settled, are no-ops.
//! A validation failure does not settle the transaction, so a redelivery
//! validates again.

use std::collections::{HashMap, HashSet, VecDeque};

use smallvec::smallvec;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, ObserverMode};
use crate::core::{
    Product, Profile, PurchaseProductInfo, PurchaseRequest, PurchasedInfo, TransactionError,
    TransactionEvent, TransactionId, TransactionState,
};
use crate::effect::StoreCommand;
use crate::error::PurchaseError;
use crate::machine::{Decision, Machine};
use crate::registry::{Completion, CompletionRegistry};
use crate::resolver::ProductResolver;
use crate::tap::{DiagnosticEvent, TapRegistry};
use crate::variation::{VariationSnapshot, VariationStore};

// =============================================================================
// Messages
// =============================================================================

/// Every message processed by the coordinator's serialized context.
///
/// Caller operations and collaborator continuations share one mailbox, so they
/// are reconciled strictly in enqueue order.
#[derive(Debug)]
pub enum CoordinatorEvent {
    /// A caller wants to buy a product.
    PurchaseRequested {
        request: PurchaseRequest,
        reply: Completion,
    },
    /// The store reported a transaction update.
    TransactionUpdated(TransactionEvent),
    /// Continuation: catalog lookup for a purchased transaction finished.
    ProductResolved {
        transaction: TransactionEvent,
        product: Product,
        variation_id: Option<String>,
        persistent_variation_id: Option<String>,
    },
    /// Continuation: the validator answered.
    ValidationFinished {
        transaction: TransactionEvent,
        result: Result<Profile, PurchaseError>,
    },
    /// Continuation: the store refused the payment.
    PaymentRejected { product_id: String, reason: String },
    RestoreCompleted,
    RestoreFailed(TransactionError),
    EntitlementsRevoked(Vec<String>),
    /// A store-initiated payment the delegate chose not to run yet.
    StorePaymentDeferred(PurchaseRequest),
    /// Run a parked store-initiated payment.
    ResumeDeferred {
        product_id: String,
        reply: Completion,
    },
    /// Read both variation tables.
    Snapshot(oneshot::Sender<VariationSnapshot>),
    Shutdown,
}

impl CoordinatorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorEvent::PurchaseRequested { .. } => "purchase_requested",
            CoordinatorEvent::TransactionUpdated(_) => "transaction_updated",
            CoordinatorEvent::ProductResolved { .. } => "product_resolved",
            CoordinatorEvent::ValidationFinished { .. } => "validation_finished",
            CoordinatorEvent::PaymentRejected { .. } => "payment_rejected",
            CoordinatorEvent::RestoreCompleted => "restore_completed",
            CoordinatorEvent::RestoreFailed(_) => "restore_failed",
            CoordinatorEvent::EntitlementsRevoked(_) => "entitlements_revoked",
            CoordinatorEvent::StorePaymentDeferred(_) => "store_payment_deferred",
            CoordinatorEvent::ResumeDeferred { .. } => "resume_deferred",
            CoordinatorEvent::Snapshot(_) => "snapshot",
            CoordinatorEvent::Shutdown => "shutdown",
        }
    }
}

/// Whether the coordinator still accepts work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    TornDown,
}

// =============================================================================
// Settled history
// =============================================================================

/// Bounded memory of settled transaction ids, oldest evicted first.
#[derive(Debug)]
struct SettledHistory {
    order: VecDeque<TransactionId>,
    ids: HashSet<TransactionId>,
    capacity: usize,
}

impl SettledHistory {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &TransactionId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: TransactionId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct TransactionReconciler {
    variations: VariationStore,
    completions: CompletionRegistry,
    products: ProductResolver,
    /// Purchased transactions between the event and the validator's answer.
    validating: HashSet<TransactionId>,
    settled: SettledHistory,
    /// Store-initiated payments parked by the delegate.
    deferred_payments: HashMap<String, PurchaseRequest>,
    observer_mode: ObserverMode,
    taps: TapRegistry,
    lifecycle: Lifecycle,
}

impl TransactionReconciler {
    pub fn new(variations: VariationStore, config: &CoordinatorConfig, taps: TapRegistry) -> Self {
        Self {
            variations,
            completions: CompletionRegistry::new(),
            products: ProductResolver::new(),
            validating: HashSet::new(),
            settled: SettledHistory::new(config.settled_history),
            deferred_payments: HashMap::new(),
            observer_mode: config.observer_mode.clone(),
            taps,
            lifecycle: Lifecycle::Active,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn variations(&self) -> &VariationStore {
        &self.variations
    }

    pub fn completions(&self) -> &CompletionRegistry {
        &self.completions
    }

    pub fn products(&self) -> &ProductResolver {
        &self.products
    }

    pub fn is_validating(&self, id: &TransactionId) -> bool {
        self.validating.contains(id)
    }

    pub fn is_settled(&self, id: &TransactionId) -> bool {
        self.settled.contains(id)
    }

    pub fn has_deferred_payment(&self, product_id: &str) -> bool {
        self.deferred_payments.contains_key(product_id)
    }

    // -------------------------------------------------------------------------
    // Purchase requests
    // -------------------------------------------------------------------------

    fn on_purchase_requested(
        &mut self,
        request: PurchaseRequest,
        reply: Completion,
    ) -> Decision<StoreCommand> {
        let product_id = request.product_id().to_string();

        // Attribution first, so a transaction arriving mid-flight sees it.
        if let Some(variation_id) = &request.variation_id {
            self.variations.set(&product_id, variation_id);
        }
        if let Some(variation_id) = &request.persistent_variation_id {
            self.variations.set_persistent(&product_id, variation_id);
        }
        self.products.track(request.product);

        if !self.completions.register(&product_id, reply).is_first {
            return Decision::new();
        }

        info!(product_id = %product_id, "submitting payment");
        self.taps.emit(DiagnosticEvent::PaymentSubmitted {
            product_id: product_id.clone(),
        });
        smallvec![StoreCommand::SubmitPayment { product_id }]
    }

    fn on_payment_rejected(&mut self, product_id: String, reason: String) {
        self.products.forget(&product_id);
        self.variations.remove(&product_id);
        let error = PurchaseError::PaymentSubmissionUnavailable {
            product_id: product_id.clone(),
            reason,
        };
        self.completions.drain_and_deliver(&product_id, Err(error));
    }

    fn on_resume_deferred(&mut self, product_id: String, reply: Completion) -> Decision<StoreCommand> {
        match self.deferred_payments.remove(&product_id) {
            Some(request) => {
                info!(product_id = %product_id, "resuming deferred store payment");
                self.on_purchase_requested(request, reply)
            }
            None => {
                let _ = reply.send(Err(PurchaseError::NoDeferredPayment { product_id }));
                Decision::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Transaction events
    // -------------------------------------------------------------------------

    fn on_transaction(&mut self, transaction: TransactionEvent) -> Decision<StoreCommand> {
        debug!(
            transaction_id = %transaction.transaction_id,
            product_id = %transaction.product_id,
            state = %transaction.state,
            "transaction updated"
        );

        match transaction.state {
            TransactionState::Purchasing | TransactionState::Deferred => Decision::new(),
            TransactionState::Purchased => self.on_purchased(transaction),
            TransactionState::Failed => self.on_failed(transaction),
            TransactionState::Restored => self.on_restored(transaction),
        }
    }

    fn on_purchased(&mut self, transaction: TransactionEvent) -> Decision<StoreCommand> {
        let id = &transaction.transaction_id;
        if self.settled.contains(id) || self.validating.contains(id) {
            debug!(transaction_id = %id, "duplicate purchased event ignored");
            return Decision::new();
        }
        self.validating.insert(id.clone());

        // Attribution on file now; a later request may overwrite it mid-lookup.
        let product_id = transaction.product_id.as_str();
        let variation_id = self.variations.get(product_id).map(str::to_string);
        let persistent_variation_id = self.variations.get_persistent(product_id).map(str::to_string);

        match self.products.local(product_id).cloned() {
            Some(product) => smallvec![StoreCommand::Validate(PurchaseProductInfo {
                product,
                variation_id,
                persistent_variation_id,
                transaction,
            })],
            None => smallvec![StoreCommand::ResolveProduct {
                transaction,
                variation_id,
                persistent_variation_id,
            }],
        }
    }

    fn on_validation_finished(
        &mut self,
        transaction: TransactionEvent,
        result: Result<Profile, PurchaseError>,
    ) -> Decision<StoreCommand> {
        self.validating.remove(&transaction.transaction_id);
        let product_id = transaction.product_id.clone();

        match result {
            Ok(profile) => {
                info!(
                    transaction_id = %transaction.transaction_id,
                    product_id = %product_id,
                    profile_id = %profile.profile_id,
                    "purchase validated"
                );
                self.variations.remove(&product_id);
                self.products.forget(&product_id);
                let commands = if self.settled.contains(&transaction.transaction_id) {
                    debug!(
                        transaction_id = %transaction.transaction_id,
                        "already settled, not finalizing again"
                    );
                    Decision::new()
                } else {
                    self.finalize(&transaction)
                };
                self.completions
                    .drain_and_deliver(&product_id, Ok(PurchasedInfo { profile, transaction }));
                commands
            }
            Err(error) => {
                // Left un-finalized: the store redelivers and we validate again.
                warn!(
                    transaction_id = %transaction.transaction_id,
                    product_id = %product_id,
                    error = %error,
                    "purchase validation failed"
                );
                self.completions.drain_and_deliver(&product_id, Err(error));
                Decision::new()
            }
        }
    }

    fn on_failed(&mut self, transaction: TransactionEvent) -> Decision<StoreCommand> {
        if self.settled.contains(&transaction.transaction_id) {
            debug!(transaction_id = %transaction.transaction_id, "duplicate failed event ignored");
            return Decision::new();
        }
        if self.validating.contains(&transaction.transaction_id) {
            debug!(
                transaction_id = %transaction.transaction_id,
                "failed event superseded by validation in progress"
            );
            return Decision::new();
        }

        let product_id = transaction.product_id.clone();
        let error = PurchaseError::from_failed_transaction(&product_id, transaction.error.as_ref());
        info!(
            transaction_id = %transaction.transaction_id,
            product_id = %product_id,
            error = %error,
            cancelled = error.is_cancellation(),
            "purchase failed"
        );

        let commands = self.finalize(&transaction);
        self.variations.remove(&product_id);
        self.products.forget(&product_id);
        self.completions.drain_and_deliver(&product_id, Err(error));
        commands
    }

    /// Restores are finalized without validation and reach no waiter.
    fn on_restored(&mut self, transaction: TransactionEvent) -> Decision<StoreCommand> {
        if self.settled.contains(&transaction.transaction_id) {
            debug!(transaction_id = %transaction.transaction_id, "duplicate restored event ignored");
            return Decision::new();
        }
        if self.validating.contains(&transaction.transaction_id) {
            debug!(
                transaction_id = %transaction.transaction_id,
                "restored event superseded by validation in progress"
            );
            return Decision::new();
        }
        info!(
            transaction_id = %transaction.transaction_id,
            product_id = %transaction.product_id,
            "transaction restored"
        );
        self.finalize(&transaction)
    }

    /// Settle a transaction and, outside observer mode, finish it in the store.
    fn finalize(&mut self, transaction: &TransactionEvent) -> Decision<StoreCommand> {
        self.settled.insert(transaction.transaction_id.clone());

        if self.observer_mode.is_enabled() {
            debug!(
                transaction_id = %transaction.transaction_id,
                "observer mode, leaving transaction unfinished"
            );
            return Decision::new();
        }

        self.taps.emit(DiagnosticEvent::TransactionFinished {
            transaction_id: transaction.transaction_id.clone(),
            product_id: transaction.product_id.clone(),
            state: transaction.state,
        });
        smallvec![StoreCommand::Finalize(transaction.clone())]
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    fn teardown(&mut self) {
        if self.lifecycle == Lifecycle::TornDown {
            return;
        }
        self.lifecycle = Lifecycle::TornDown;

        let parked = self.deferred_payments.len();
        self.deferred_payments.clear();
        let notified = self.completions.drain_all(PurchaseError::CoordinatorShutDown);
        self.validating.clear();
        info!(notified, parked, "purchase coordinator torn down");
    }

    /// Resolve a message that arrived after teardown.
    fn reject(&self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::PurchaseRequested { reply, .. }
            | CoordinatorEvent::ResumeDeferred { reply, .. } => {
                let _ = reply.send(Err(PurchaseError::CoordinatorShutDown));
            }
            CoordinatorEvent::Snapshot(reply) => {
                let _ = reply.send(self.variations.snapshot());
            }
            CoordinatorEvent::Shutdown => {}
            other => debug!(message = other.name(), "discarding message after teardown"),
        }
    }
}

impl Machine for TransactionReconciler {
    type Event = CoordinatorEvent;
    type Command = StoreCommand;

    fn decide(&mut self, event: CoordinatorEvent) -> Decision<StoreCommand> {
        if self.lifecycle == Lifecycle::TornDown {
            self.reject(event);
            return Decision::new();
        }

        match event {
            CoordinatorEvent::PurchaseRequested { request, reply } => {
                self.on_purchase_requested(request, reply)
            }
            CoordinatorEvent::TransactionUpdated(transaction) => self.on_transaction(transaction),
            CoordinatorEvent::ProductResolved {
                transaction,
                product,
                variation_id,
                persistent_variation_id,
            } => smallvec![StoreCommand::Validate(PurchaseProductInfo {
                product,
                variation_id,
                persistent_variation_id,
                transaction,
            })],
            CoordinatorEvent::ValidationFinished {
                transaction,
                result,
            } => self.on_validation_finished(transaction, result),
            CoordinatorEvent::PaymentRejected { product_id, reason } => {
                self.on_payment_rejected(product_id, reason);
                Decision::new()
            }
            CoordinatorEvent::RestoreCompleted => {
                info!("restore completed");
                self.taps.emit(DiagnosticEvent::RestoreCompleted);
                Decision::new()
            }
            CoordinatorEvent::RestoreFailed(error) => {
                warn!(error = %error, "restore failed");
                self.taps.emit(DiagnosticEvent::RestoreFailed {
                    error: error.to_string(),
                });
                Decision::new()
            }
            CoordinatorEvent::EntitlementsRevoked(product_ids) => {
                info!(count = product_ids.len(), "entitlements revoked");
                self.taps
                    .emit(DiagnosticEvent::EntitlementsRevoked { product_ids });
                Decision::new()
            }
            CoordinatorEvent::StorePaymentDeferred(request) => {
                let product_id = request.product_id().to_string();
                info!(product_id = %product_id, "store payment deferred");
                self.deferred_payments.insert(product_id.clone(), request);
                self.taps
                    .emit(DiagnosticEvent::StorePaymentDeferred { product_id });
                Decision::new()
            }
            CoordinatorEvent::ResumeDeferred { product_id, reply } => {
                self.on_resume_deferred(product_id, reply)
            }
            CoordinatorEvent::Snapshot(reply) => {
                let _ = reply.send(self.variations.snapshot());
                Decision::new()
            }
            CoordinatorEvent::Shutdown => {
                self.teardown();
                Decision::new()
            }
        }
    }
}

impl std::fmt::Debug for TransactionReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionReconciler")
            .field("lifecycle", &self.lifecycle)
            .field("pending_products", &self.completions.len())
            .field("validating", &self.validating.len())
            .field("deferred_payments", &self.deferred_payments.len())
            .finish_non_exhaustive()
    }
}
