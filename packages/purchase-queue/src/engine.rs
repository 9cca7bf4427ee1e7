//! Purchase coordinator - the serialized entry point.
//!
//! The coordinator owns the reconciler and processes one mailbox message at a
//! time. Collaborator IO runs on spawned tasks whose continuations come back
//! through the same mailbox:
//!
//! ```text
//! Handle ─► Mailbox ─► Reconciler ─► Commands ─► Dispatcher ─► Collaborators
//!              ▲                                                    │
//!              └──────────────── continuations ─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use purchase_queue::{CoordinatorBuilder, PurchaseRequest};
//!
//! let handle = CoordinatorBuilder::new(store, catalog, validator)
//!     .with_config(CoordinatorConfig::from_env()?)
//!     .build()?
//!     .start();
//!
//! // Feed store updates from the platform observer
//! handle.transaction_updated(event)?;
//!
//! // Purchase and wait for the validated outcome
//! let info = handle.submit_purchase(PurchaseRequest::new(product)).await?;
//! ```
//!
//! # Teardown
//!
//! `shutdown()` moves the coordinator to its torn-down state: every waiter
//! receives [`PurchaseError::CoordinatorShutDown`], the mailbox is closed and
//! messages already queued are resolved the same way.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::{CoordinatorConfig, ObserverMode};
use crate::core::{PurchaseRequest, PurchaseResult, TransactionError, TransactionEvent};
use crate::dispatch::Dispatcher;
use crate::effect::EffectContext;
use crate::error::PurchaseError;
use crate::machine::Machine;
use crate::reconciler::{CoordinatorEvent, TransactionReconciler};
use crate::tap::{EventTap, TapRegistry};
use crate::traits::{
    BaseKeyValueStorage, BasePaymentQueue, BaseProductCatalog, BasePurchaseValidator,
    PurchaseDelegate,
};
use crate::variation::{VariationSnapshot, VariationStore};

// =============================================================================
// Coordinator
// =============================================================================

/// A built coordinator that has not started processing yet.
pub struct Coordinator {
    reconciler: TransactionReconciler,
    dispatcher: Dispatcher,
    mailbox: mpsc::UnboundedReceiver<CoordinatorEvent>,
    handle: CoordinatorHandle,
}

impl Coordinator {
    /// Create a new coordinator builder.
    pub fn builder(
        store: Arc<dyn BasePaymentQueue>,
        catalog: Arc<dyn BaseProductCatalog>,
        validator: Arc<dyn BasePurchaseValidator>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder::new(store, catalog, validator)
    }

    /// A handle for talking to this coordinator once it runs.
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Start processing in the background.
    pub fn start(self) -> CoordinatorHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Process messages until shut down or until every handle is dropped.
    pub async fn run(self) {
        let Coordinator {
            mut reconciler,
            dispatcher,
            mut mailbox,
            handle,
        } = self;
        // Our own handle must not keep the mailbox open.
        drop(handle);

        info!("purchase coordinator started");

        while let Some(event) = mailbox.recv().await {
            let shutting_down = matches!(event, CoordinatorEvent::Shutdown);

            for command in reconciler.decide(event) {
                dispatcher.dispatch(command);
            }

            if shutting_down {
                mailbox.close();
            }
        }

        // Every sender is gone; resolve anything still waiting.
        reconciler.decide(CoordinatorEvent::Shutdown);
        debug!(inflight = dispatcher.inflight(), "purchase coordinator mailbox drained");
        info!("purchase coordinator stopped");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("reconciler", &self.reconciler)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Coordinator Handle
// =============================================================================

/// Cloneable handle to a running coordinator.
///
/// # Fire-and-Forget vs Await
///
/// - Store feed methods (`transaction_updated`, `restore_completed`, ...) return
///   as soon as the message is queued.
/// - `submit_purchase` and `resume_deferred_payment` wait for the outcome of the
///   (possibly coalesced) purchase attempt.
///
/// Every method returns [`PurchaseError::CoordinatorShutDown`] once the
/// coordinator has been torn down.
#[derive(Clone)]
pub struct CoordinatorHandle {
    mailbox: mpsc::UnboundedSender<CoordinatorEvent>,
    delegate: Option<Arc<dyn PurchaseDelegate>>,
    observer_mode: ObserverMode,
}

impl CoordinatorHandle {
    fn send(&self, event: CoordinatorEvent) -> Result<(), PurchaseError> {
        self.mailbox
            .send(event)
            .map_err(|_| PurchaseError::CoordinatorShutDown)
    }

    /// Purchase a product and wait for the outcome.
    ///
    /// Concurrent calls for the same product share one payment and all
    /// receive the same outcome.
    pub async fn submit_purchase(&self, request: PurchaseRequest) -> PurchaseResult {
        let (reply, outcome) = oneshot::channel();
        self.send(CoordinatorEvent::PurchaseRequested { request, reply })?;
        outcome.await.unwrap_or(Err(PurchaseError::CoordinatorShutDown))
    }

    /// Feed one store transaction update.
    pub fn transaction_updated(&self, transaction: TransactionEvent) -> Result<(), PurchaseError> {
        self.send(CoordinatorEvent::TransactionUpdated(transaction))
    }

    /// Feed a batch of store transaction updates, in order.
    pub fn transactions_updated(
        &self,
        transactions: impl IntoIterator<Item = TransactionEvent>,
    ) -> Result<(), PurchaseError> {
        for transaction in transactions {
            self.transaction_updated(transaction)?;
        }
        Ok(())
    }

    pub fn restore_completed(&self) -> Result<(), PurchaseError> {
        self.send(CoordinatorEvent::RestoreCompleted)
    }

    pub fn restore_failed(&self, error: TransactionError) -> Result<(), PurchaseError> {
        self.send(CoordinatorEvent::RestoreFailed(error))
    }

    pub fn entitlements_revoked(&self, product_ids: Vec<String>) -> Result<(), PurchaseError> {
        self.send(CoordinatorEvent::EntitlementsRevoked(product_ids))
    }

    /// The store proposes a payment it initiated itself.
    ///
    /// Returns whether the store should go ahead now. Without a delegate every
    /// proposal is accepted. A declined proposal is parked until
    /// [`CoordinatorHandle::resume_deferred_payment`].
    pub fn store_payment_proposed(&self, request: PurchaseRequest) -> Result<bool, PurchaseError> {
        let accept = self
            .delegate
            .as_ref()
            .map(|delegate| delegate.should_add_store_payment(&request.product))
            .unwrap_or(true);

        if accept {
            debug!(product_id = %request.product_id(), "store payment accepted");
            return Ok(true);
        }

        self.send(CoordinatorEvent::StorePaymentDeferred(request))?;
        Ok(false)
    }

    /// Run a parked store-initiated payment and wait for its outcome.
    pub async fn resume_deferred_payment(&self, product_id: &str) -> PurchaseResult {
        let (reply, outcome) = oneshot::channel();
        self.send(CoordinatorEvent::ResumeDeferred {
            product_id: product_id.to_string(),
            reply,
        })?;
        outcome.await.unwrap_or(Err(PurchaseError::CoordinatorShutDown))
    }

    /// Both variation tables as seen from inside the coordinator.
    pub async fn variation_ids(&self) -> Result<VariationSnapshot, PurchaseError> {
        let (reply, snapshot) = oneshot::channel();
        self.send(CoordinatorEvent::Snapshot(reply))?;
        snapshot.await.map_err(|_| PurchaseError::CoordinatorShutDown)
    }

    /// Shared observer mode flag; flip it to change finalize behaviour.
    pub fn observer_mode(&self) -> &ObserverMode {
        &self.observer_mode
    }

    /// Tear the coordinator down. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.send(CoordinatorEvent::Shutdown).is_err() {
            debug!("purchase coordinator already shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("closed", &self.is_closed())
            .field("has_delegate", &self.delegate.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Coordinator Builder
// =============================================================================

/// Builder for wiring a coordinator to its collaborators.
///
/// # Example
///
/// ```ignore
/// let coordinator = CoordinatorBuilder::new(store, catalog, validator)
///     .with_storage(Arc::new(JsonFileStorage::open("state")?))
///     .with_tap(Arc::new(AnalyticsTap::new(client)))
///     .with_delegate(Arc::new(PromoDelegate))
///     .build()?;
/// ```
pub struct CoordinatorBuilder {
    store: Arc<dyn BasePaymentQueue>,
    catalog: Arc<dyn BaseProductCatalog>,
    validator: Arc<dyn BasePurchaseValidator>,
    storage: Option<Arc<dyn BaseKeyValueStorage>>,
    config: CoordinatorConfig,
    taps: TapRegistry,
    delegate: Option<Arc<dyn PurchaseDelegate>>,
}

impl CoordinatorBuilder {
    pub fn new(
        store: Arc<dyn BasePaymentQueue>,
        catalog: Arc<dyn BaseProductCatalog>,
        validator: Arc<dyn BasePurchaseValidator>,
    ) -> Self {
        Self {
            store,
            catalog,
            validator,
            storage: None,
            config: CoordinatorConfig::default(),
            taps: TapRegistry::new(),
            delegate: None,
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this storage instead of the one the config describes.
    pub fn with_storage(mut self, storage: Arc<dyn BaseKeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_tap(mut self, tap: Arc<dyn EventTap>) -> Self {
        self.taps.register(tap);
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn PurchaseDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Load persisted state and assemble the coordinator.
    pub fn build(self) -> Result<Coordinator> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => self.config.open_storage()?,
        };

        let variations = VariationStore::load(storage, self.taps.clone());
        let reconciler = TransactionReconciler::new(variations, &self.config, self.taps);

        let (sender, mailbox) = mpsc::unbounded_channel();
        let ctx = EffectContext::new(self.store, self.catalog, self.validator);
        let dispatcher = Dispatcher::new(ctx, &sender);

        Ok(Coordinator {
            reconciler,
            dispatcher,
            mailbox,
            handle: CoordinatorHandle {
                mailbox: sender,
                delegate: self.delegate,
                observer_mode: self.config.observer_mode,
            },
        })
    }
}
