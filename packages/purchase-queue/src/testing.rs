//! Testing utilities for the coordinator and its state machine.
//!
//! # Feature Flag
//!
//! This module is only available in unit tests or with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! purchase-queue = { path = "../purchase-queue", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use purchase_queue::testing::{MockPaymentQueue, MockPurchaseValidator};
//!
//! let store = Arc::new(MockPaymentQueue::new());
//! let validator = Arc::new(MockPurchaseValidator::new());
//!
//! let handle = CoordinatorBuilder::new(store.clone(), catalog, validator.clone()).start();
//! let pending = tokio::spawn({
//!     let handle = handle.clone();
//!     async move { handle.submit_purchase(request).await }
//! });
//!
//! assert!(store.wait_for_submitted(1).await);
//! handle.transaction_updated(TransactionEvent::purchased("t1", "pro_monthly"));
//! ```
//!
//! # Philosophy
//!
//! Tests should wait for meaning, not time. The `wait_for_*` helpers resolve as
//! soon as the expected number of calls has been recorded and only fall back to
//! a timeout when the expectation is never met.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::core::{Product, Profile, PurchaseProductInfo, TransactionEvent, TransactionId};
use crate::machine::{Decision, Machine};
use crate::tap::{DiagnosticEvent, EventTap, TapContext};
use crate::traits::{BasePaymentQueue, BaseProductCatalog, BasePurchaseValidator, FetchPolicy};

/// How long `wait_for_*` helpers wait before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

async fn wait_until<F>(notify: &Notify, mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    let wait = async {
        loop {
            let notified = notify.notified();
            if done() {
                return;
            }
            notified.await;
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, wait).await.is_ok()
}

// =============================================================================
// Recording Tap
// =============================================================================

/// Tap that records every diagnostic it sees.
#[derive(Debug, Default)]
pub struct RecordingTap {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl RecordingTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Method-style names of the recorded events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }
}

impl EventTap for RecordingTap {
    fn on_event(&self, event: &DiagnosticEvent, _ctx: &TapContext) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// =============================================================================
// Mock Payment Queue
// =============================================================================

pub struct MockPaymentQueue {
    can_make_payments: AtomicBool,
    submit_error: Mutex<Option<String>>,
    finish_error: Mutex<Option<String>>,
    submitted: Mutex<Vec<String>>,
    finished: Mutex<Vec<TransactionEvent>>,
    notify: Notify,
}

impl MockPaymentQueue {
    pub fn new() -> Self {
        Self {
            can_make_payments: AtomicBool::new(true),
            submit_error: Mutex::new(None),
            finish_error: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Report that this device cannot make payments.
    pub fn with_payments_disabled(self) -> Self {
        self.can_make_payments.store(false, Ordering::SeqCst);
        self
    }

    /// Make every `submit_payment` call fail.
    pub fn with_submit_error(self, reason: &str) -> Self {
        *self.submit_error.lock().unwrap() = Some(reason.to_string());
        self
    }

    /// Make every `finish_transaction` call fail (after recording it).
    pub fn with_finish_error(self, reason: &str) -> Self {
        *self.finish_error.lock().unwrap() = Some(reason.to_string());
        self
    }

    pub fn set_can_make_payments(&self, enabled: bool) {
        self.can_make_payments.store(enabled, Ordering::SeqCst);
    }

    /// Product ids passed to `submit_payment`, in call order.
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<TransactionEvent> {
        self.finished.lock().unwrap().clone()
    }

    pub fn finished_ids(&self) -> Vec<TransactionId> {
        self.finished()
            .into_iter()
            .map(|t| t.transaction_id)
            .collect()
    }

    /// Wait until at least `count` payments were submitted.
    pub async fn wait_for_submitted(&self, count: usize) -> bool {
        wait_until(&self.notify, || self.submitted.lock().unwrap().len() >= count).await
    }

    /// Wait until at least `count` transactions were finished.
    pub async fn wait_for_finished(&self, count: usize) -> bool {
        wait_until(&self.notify, || self.finished.lock().unwrap().len() >= count).await
    }
}

impl Default for MockPaymentQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BasePaymentQueue for MockPaymentQueue {
    fn can_make_payments(&self) -> bool {
        self.can_make_payments.load(Ordering::SeqCst)
    }

    async fn submit_payment(&self, product_id: &str) -> Result<()> {
        let error = self.submit_error.lock().unwrap().clone();
        if let Some(reason) = error {
            return Err(anyhow!(reason));
        }
        self.submitted.lock().unwrap().push(product_id.to_string());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn finish_transaction(&self, transaction: &TransactionEvent) -> Result<()> {
        self.finished.lock().unwrap().push(transaction.clone());
        self.notify.notify_waiters();
        let error = self.finish_error.lock().unwrap().clone();
        match error {
            Some(reason) => Err(anyhow!(reason)),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Mock Product Catalog
// =============================================================================

pub struct MockProductCatalog {
    products: Mutex<HashMap<String, Product>>,
    error: Mutex<Option<String>>,
    calls: Mutex<Vec<(String, FetchPolicy)>>,
}

impl MockProductCatalog {
    pub fn new() -> Self {
        Self {
            products: Mutex::new(HashMap::new()),
            error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_product(self, product: Product) -> Self {
        self.products
            .lock()
            .unwrap()
            .insert(product.vendor_product_id.clone(), product);
        self
    }

    /// Make every lookup fail.
    pub fn with_error(self, reason: &str) -> Self {
        *self.error.lock().unwrap() = Some(reason.to_string());
        self
    }

    /// Replace a product's metadata, e.g. to observe cache refreshes.
    pub fn update_product(&self, product: Product) {
        self.products
            .lock()
            .unwrap()
            .insert(product.vendor_product_id.clone(), product);
    }

    pub fn calls(&self) -> Vec<(String, FetchPolicy)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockProductCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseProductCatalog for MockProductCatalog {
    async fn fetch_product(&self, product_id: &str, policy: FetchPolicy) -> Result<Option<Product>> {
        self.calls
            .lock()
            .unwrap()
            .push((product_id.to_string(), policy));

        let error = self.error.lock().unwrap().clone();
        if let Some(reason) = error {
            return Err(anyhow!(reason));
        }
        Ok(self.products.lock().unwrap().get(product_id).cloned())
    }
}

// =============================================================================
// Mock Purchase Validator
// =============================================================================

/// Validator with scripted outcomes.
///
/// Unscripted calls succeed with a profile named after the product. A gated
/// validator holds every call until [`MockPurchaseValidator::release`].
pub struct MockPurchaseValidator {
    scripted: Mutex<VecDeque<Result<Profile, String>>>,
    calls: Mutex<Vec<PurchaseProductInfo>>,
    gate: Option<Arc<Semaphore>>,
    panic_on_call: AtomicBool,
    in_progress: AtomicUsize,
    notify: Notify,
}

impl MockPurchaseValidator {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
            panic_on_call: AtomicBool::new(false),
            in_progress: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Queue a successful outcome.
    pub fn with_profile(self, profile: Profile) -> Self {
        self.scripted.lock().unwrap().push_back(Ok(profile));
        self
    }

    /// Queue a failed outcome.
    pub fn with_error(self, reason: &str) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .push_back(Err(reason.to_string()));
        self
    }

    /// Hold every validation until released.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Panic inside `validate_purchase`.
    pub fn panicking(self) -> Self {
        self.panic_on_call.store(true, Ordering::SeqCst);
        self
    }

    /// Let `count` held validations proceed.
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    pub fn calls(&self) -> Vec<PurchaseProductInfo> {
        self.calls.lock().unwrap().clone()
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` validations were started.
    pub async fn wait_for_calls(&self, count: usize) -> bool {
        wait_until(&self.notify, || self.calls.lock().unwrap().len() >= count).await
    }
}

impl Default for MockPurchaseValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BasePurchaseValidator for MockPurchaseValidator {
    async fn validate_purchase(&self, info: PurchaseProductInfo) -> Result<Profile> {
        let product_id = info.product.vendor_product_id.clone();
        self.calls.lock().unwrap().push(info);
        self.notify.notify_waiters();

        if self.panic_on_call.load(Ordering::SeqCst) {
            panic!("validator exploded for {}", product_id);
        }

        if let Some(gate) = &self.gate {
            self.in_progress.fetch_add(1, Ordering::SeqCst);
            let permit = gate.acquire().await;
            self.in_progress.fetch_sub(1, Ordering::SeqCst);
            permit.map_err(|e| anyhow!("validator gate closed: {}", e))?.forget();
        }

        let scripted = self.scripted.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(profile)) => Ok(profile),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Ok(Profile::new(format!("profile-{}", product_id))),
        }
    }
}

// =============================================================================
// Workflow Test
// =============================================================================

/// Fluent test builder for machine workflows.
///
/// # Example
///
/// ```ignore
/// WorkflowTest::new(reconciler)
///     .given(CoordinatorEvent::TransactionUpdated(purchased))
///     .expect_commands(|cmds| matches!(cmds, [StoreCommand::Validate(_)]))
///     .then(CoordinatorEvent::TransactionUpdated(duplicate))
///     .expect_none()
///     .assert_state(|r| r.is_validating(&id));
/// ```
pub struct WorkflowTest<M>
where
    M: Machine,
{
    machine: M,
    last_commands: Decision<M::Command>,
}

impl<M> WorkflowTest<M>
where
    M: Machine,
    M::Command: std::fmt::Debug,
{
    pub fn new(machine: M) -> Self {
        Self {
            machine,
            last_commands: Decision::new(),
        }
    }

    /// Process an initial event and capture its commands.
    pub fn given(mut self, event: M::Event) -> Self {
        self.last_commands = self.machine.decide(event);
        self
    }

    /// Process a subsequent event and capture its commands.
    pub fn then(self, event: M::Event) -> Self {
        self.given(event)
    }

    /// Assert the last event produced no commands.
    pub fn expect_none(self) -> Self {
        assert!(
            self.last_commands.is_empty(),
            "Expected no commands, got {:?}",
            self.last_commands
        );
        self
    }

    /// Assert the last commands match a predicate.
    pub fn expect_commands<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&[M::Command]) -> bool,
    {
        assert!(
            predicate(&self.last_commands),
            "Command predicate failed for {:?}",
            self.last_commands
        );
        self
    }

    /// Assert the machine state matches a predicate.
    pub fn assert_state<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&M) -> bool,
    {
        assert!(predicate(&self.machine), "State predicate failed");
        self
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// Commands produced by the last event.
    pub fn last_commands(&self) -> &[M::Command] {
        &self.last_commands
    }

    pub fn into_machine(self) -> M {
        self.machine
    }
}

/// Drive a future to completion with the standard wait timeout.
pub async fn within_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT_TIMEOUT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out after {:?}", WAIT_TIMEOUT))
}
