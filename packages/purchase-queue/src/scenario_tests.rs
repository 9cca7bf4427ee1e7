//! End-to-end scenarios against a running coordinator.
//!
//! Each test wires the coordinator to mock collaborators and drives it the way
//! a platform store would: purchases from callers, transaction updates from the
//! store feed.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::task::Poll;

    use tokio::task::JoinHandle;

    use crate::config::CoordinatorConfig;
    use crate::core::{Product, Profile, PurchaseRequest, PurchaseResult, TransactionEvent};
    use crate::engine::{CoordinatorBuilder, CoordinatorHandle};
    use crate::error::PurchaseError;
    use crate::persistence::{InMemoryStorage, JsonFileStorage};
    use crate::tap::{DiagnosticEvent, VariationTable};
    use crate::testing::{
        within_timeout, MockPaymentQueue, MockProductCatalog, MockPurchaseValidator, RecordingTap,
    };
    use crate::traits::BaseKeyValueStorage;
    use crate::variation::{PERSISTENT_VARIATIONS_KEY, SESSION_VARIATIONS_KEY};

    // ==========================================================================
    // Harness
    // ==========================================================================

    struct Scenario {
        handle: CoordinatorHandle,
        store: Arc<MockPaymentQueue>,
        validator: Arc<MockPurchaseValidator>,
        catalog: Arc<MockProductCatalog>,
        storage: Arc<InMemoryStorage>,
        tap: Arc<RecordingTap>,
    }

    struct ScenarioBuilder {
        store: MockPaymentQueue,
        validator: MockPurchaseValidator,
        catalog: MockProductCatalog,
        storage: InMemoryStorage,
        config: CoordinatorConfig,
    }

    impl ScenarioBuilder {
        fn new() -> Self {
            Self {
                store: MockPaymentQueue::new(),
                validator: MockPurchaseValidator::new(),
                catalog: MockProductCatalog::new(),
                storage: InMemoryStorage::new(),
                config: CoordinatorConfig::default(),
            }
        }

        fn store(mut self, store: MockPaymentQueue) -> Self {
            self.store = store;
            self
        }

        fn validator(mut self, validator: MockPurchaseValidator) -> Self {
            self.validator = validator;
            self
        }

        fn catalog(mut self, catalog: MockProductCatalog) -> Self {
            self.catalog = catalog;
            self
        }

        fn storage(mut self, storage: InMemoryStorage) -> Self {
            self.storage = storage;
            self
        }

        fn observer_mode(self) -> Self {
            self.config.observer_mode.set(true);
            self
        }

        fn start(self) -> Scenario {
            let store = Arc::new(self.store);
            let validator = Arc::new(self.validator);
            let catalog = Arc::new(self.catalog);
            let storage = Arc::new(self.storage);
            let tap = Arc::new(RecordingTap::new());

            let handle = CoordinatorBuilder::new(store.clone(), catalog.clone(), validator.clone())
                .with_config(self.config)
                .with_storage(storage.clone())
                .with_tap(tap.clone())
                .build()
                .unwrap()
                .start();

            Scenario {
                handle,
                store,
                validator,
                catalog,
                storage,
                tap,
            }
        }
    }

    impl Scenario {
        /// Enqueue a purchase and hand back its outcome.
        ///
        /// The first poll sends the request, so ordering against later feed
        /// calls is fixed before this returns.
        async fn purchase(&self, request: PurchaseRequest) -> JoinHandle<PurchaseResult> {
            let handle = self.handle.clone();
            let mut pending = Box::pin(async move { handle.submit_purchase(request).await });
            match futures::poll!(&mut pending) {
                Poll::Ready(outcome) => tokio::spawn(async move { outcome }),
                Poll::Pending => tokio::spawn(pending),
            }
        }

        fn feed(&self, transaction: TransactionEvent) {
            self.handle.transaction_updated(transaction).unwrap();
        }

        /// Round trip through the mailbox, so everything queued before is processed.
        async fn settle(&self) {
            self.handle.variation_ids().await.unwrap();
        }
    }

    fn monthly() -> Product {
        Product::new("pro_monthly")
            .with_title("Pro Monthly")
            .with_price("$9.99", "USD")
    }

    fn table(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ==========================================================================
    // Coalescing
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_purchases_share_one_payment() {
        let s = ScenarioBuilder::new()
            .validator(MockPurchaseValidator::new().with_profile(Profile::new("p-shared")))
            .start();

        let mut waiters = Vec::new();
        for _ in 0..8 {
            waiters.push(s.purchase(PurchaseRequest::new(monthly())).await);
        }
        assert!(s.store.wait_for_submitted(1).await);
        s.settle().await;

        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));

        for waiter in waiters {
            let info = within_timeout(waiter).await.unwrap().unwrap();
            assert_eq!(info.profile.profile_id, "p-shared");
            assert_eq!(info.transaction.transaction_id.as_str(), "t1");
        }
        assert_eq!(s.store.submitted(), vec!["pro_monthly"]);
        assert_eq!(s.validator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_two_callers_before_any_event() {
        let s = ScenarioBuilder::new().start();

        let first = s.purchase(PurchaseRequest::new(monthly())).await;
        let second = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.settle().await;
        assert_eq!(s.store.submitted().len(), 1);

        s.feed(TransactionEvent::failed("t1", "pro_monthly"));

        let a = within_timeout(first).await.unwrap();
        let b = within_timeout(second).await.unwrap();
        assert!(matches!(a, Err(PurchaseError::UnknownTransactionFailure { .. })));
        assert!(matches!(b, Err(PurchaseError::UnknownTransactionFailure { .. })));
    }

    #[tokio::test]
    async fn test_purchase_after_settlement_starts_new_attempt() {
        let s = ScenarioBuilder::new().start();

        let first = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));
        within_timeout(first).await.unwrap().unwrap();

        let second = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(2).await);
        s.feed(TransactionEvent::purchased("t2", "pro_monthly"));

        let info = within_timeout(second).await.unwrap().unwrap();
        assert_eq!(info.transaction.transaction_id.as_str(), "t2");
        assert_eq!(s.store.submitted().len(), 2);
    }

    // ==========================================================================
    // Worked scenarios
    // ==========================================================================

    #[tokio::test]
    async fn test_pro_monthly_with_variation_succeeds() {
        let s = ScenarioBuilder::new()
            .validator(MockPurchaseValidator::new().with_profile(Profile::new("p-1")))
            .start();

        let pending = s.purchase(PurchaseRequest::new(monthly()).with_variation_id("v1")).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));

        let info = within_timeout(pending).await.unwrap().unwrap();
        assert_eq!(info.profile.profile_id, "p-1");
        assert!(s.store.wait_for_finished(1).await);

        assert_eq!(s.store.submitted(), vec!["pro_monthly"]);
        assert_eq!(s.store.finished_ids(), vec!["t1".into()]);

        let validated = &s.validator.calls()[0];
        assert_eq!(validated.product, monthly());
        assert_eq!(validated.variation_id.as_deref(), Some("v1"));
        assert_eq!(validated.persistent_variation_id.as_deref(), Some("v1"));

        let snapshot = s.handle.variation_ids().await.unwrap();
        assert!(!snapshot.session.contains_key("pro_monthly"));
        assert_eq!(snapshot.persistent, table(&[("pro_monthly", "v1")]));
        assert_eq!(s.storage.get(SESSION_VARIATIONS_KEY), Some(HashMap::new()));
        assert_eq!(
            s.storage.get(PERSISTENT_VARIATIONS_KEY),
            Some(table(&[("pro_monthly", "v1")]))
        );
        // Resolved from memory, no catalog round trip.
        assert!(s.catalog.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_without_error_is_unknown_failure() {
        let s = ScenarioBuilder::new().start();

        let pending = s.purchase(PurchaseRequest::new(monthly()).with_variation_id("v1")).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.feed(TransactionEvent::failed("t1", "pro_monthly"));

        let outcome = within_timeout(pending).await.unwrap();
        assert!(matches!(
            outcome,
            Err(PurchaseError::UnknownTransactionFailure { ref product_id }) if product_id == "pro_monthly"
        ));
        assert!(s.store.wait_for_finished(1).await);
        assert_eq!(s.store.finished_ids(), vec!["t1".into()]);

        let snapshot = s.handle.variation_ids().await.unwrap();
        assert!(snapshot.session.is_empty());
        assert_eq!(snapshot.persistent, table(&[("pro_monthly", "v1")]));
    }

    #[tokio::test]
    async fn test_restored_without_request_is_finalized() {
        let s = ScenarioBuilder::new().start();

        s.feed(TransactionEvent::restored("t-restore", "pro_yearly"));

        assert!(s.store.wait_for_finished(1).await);
        s.settle().await;
        assert_eq!(s.store.finished_ids(), vec!["t-restore".into()]);
        assert!(s.validator.calls().is_empty());
        assert!(s.store.submitted().is_empty());
    }

    // ==========================================================================
    // Duplicate delivery
    // ==========================================================================

    #[tokio::test]
    async fn test_duplicate_terminal_event_is_noop() {
        let s = ScenarioBuilder::new().start();

        let pending = s.purchase(PurchaseRequest::new(monthly()).with_variation_id("v1")).await;
        assert!(s.store.wait_for_submitted(1).await);

        let purchased = TransactionEvent::purchased("t1", "pro_monthly");
        s.feed(purchased.clone());
        within_timeout(pending).await.unwrap().unwrap();
        assert!(s.store.wait_for_finished(1).await);
        let taps_before = s.tap.events().len();

        s.feed(purchased.clone());
        s.feed(purchased);
        s.settle().await;

        assert_eq!(s.store.finished().len(), 1);
        assert_eq!(s.validator.calls().len(), 1);
        assert_eq!(s.tap.events().len(), taps_before);
    }

    #[tokio::test]
    async fn test_redelivery_during_validation_validates_once() {
        let s = ScenarioBuilder::new()
            .validator(MockPurchaseValidator::new().gated())
            .start();

        let pending = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(1).await);

        let purchased = TransactionEvent::purchased("t1", "pro_monthly");
        s.feed(purchased.clone());
        assert!(s.validator.wait_for_calls(1).await);
        s.feed(purchased);
        s.settle().await;

        s.validator.release(1);
        within_timeout(pending).await.unwrap().unwrap();
        assert_eq!(s.validator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_transaction_for_redelivery() {
        let s = ScenarioBuilder::new()
            .validator(
                MockPurchaseValidator::new()
                    .with_error("receipt rejected")
                    .with_profile(Profile::new("p-2")),
            )
            .start();

        let first = s.purchase(PurchaseRequest::new(monthly()).with_variation_id("v1")).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));

        let outcome = within_timeout(first).await.unwrap();
        match outcome {
            Err(PurchaseError::ValidationFailed(e)) => assert_eq!(e.to_string(), "receipt rejected"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        s.settle().await;
        assert!(s.store.finished().is_empty());

        // The store redelivers; a new caller is waiting this time.
        let second = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(2).await);
        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));

        let info = within_timeout(second).await.unwrap().unwrap();
        assert_eq!(info.profile.profile_id, "p-2");
        assert!(s.store.wait_for_finished(1).await);
        assert_eq!(s.validator.calls()[1].variation_id.as_deref(), Some("v1"));
    }

    // ==========================================================================
    // Observer mode
    // ==========================================================================

    #[tokio::test]
    async fn test_observer_mode_never_finalizes() {
        let s = ScenarioBuilder::new()
            .validator(MockPurchaseValidator::new().with_error("backend down"))
            .observer_mode()
            .start();

        let rejected = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));
        assert!(within_timeout(rejected).await.unwrap().is_err());

        let accepted = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(2).await);
        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));
        within_timeout(accepted).await.unwrap().unwrap();

        s.feed(TransactionEvent::failed("t2", "pro_yearly"));
        s.feed(TransactionEvent::restored("t3", "pro_yearly"));
        s.settle().await;

        assert!(s.store.finished().is_empty());
        assert_eq!(s.tap.count("finish_transaction"), 0);
    }

    #[tokio::test]
    async fn test_observer_mode_flag_read_per_transition() {
        let s = ScenarioBuilder::new().start();

        s.handle.observer_mode().set(true);
        s.feed(TransactionEvent::restored("t1", "pro_yearly"));
        s.settle().await;
        assert!(s.store.finished().is_empty());

        s.handle.observer_mode().set(false);
        s.feed(TransactionEvent::restored("t2", "pro_yearly"));
        assert!(s.store.wait_for_finished(1).await);
        assert_eq!(s.store.finished_ids(), vec!["t2".into()]);
    }

    // ==========================================================================
    // Store and catalog failures
    // ==========================================================================

    #[tokio::test]
    async fn test_payments_disabled_fails_every_waiter() {
        let s = ScenarioBuilder::new()
            .store(MockPaymentQueue::new().with_payments_disabled())
            .start();

        let a = s.purchase(PurchaseRequest::new(monthly()).with_variation_id("v1")).await;
        let b = s.purchase(PurchaseRequest::new(monthly())).await;

        for waiter in [a, b] {
            let outcome = within_timeout(waiter).await.unwrap();
            let err = outcome.unwrap_err();
            assert!(matches!(err, PurchaseError::PaymentSubmissionUnavailable { .. }));
        }
        assert!(s.store.submitted().is_empty());

        let snapshot = s.handle.variation_ids().await.unwrap();
        assert!(snapshot.session.is_empty());
        assert_eq!(snapshot.persistent, table(&[("pro_monthly", "v1")]));
    }

    #[tokio::test]
    async fn test_unknown_product_still_reports_outcome() {
        let s = ScenarioBuilder::new()
            .catalog(MockProductCatalog::new().with_error("catalog offline"))
            .start();

        // Store-initiated transaction: nothing in memory, catalog fails.
        s.feed(TransactionEvent::purchased("t1", "legacy_sku"));
        assert!(s.validator.wait_for_calls(1).await);
        assert!(s.store.wait_for_finished(1).await);

        let validated = &s.validator.calls()[0];
        assert!(validated.product.is_unknown());
        assert_eq!(validated.product.vendor_product_id, "legacy_sku");
    }

    #[tokio::test]
    async fn test_catalog_product_is_used_for_unknown_in_flight() {
        let catalog_product = Product::new("pro_yearly").with_title("Pro Yearly");
        let s = ScenarioBuilder::new()
            .catalog(MockProductCatalog::new().with_product(catalog_product.clone()))
            .start();

        s.feed(TransactionEvent::purchased("t1", "pro_yearly"));
        assert!(s.validator.wait_for_calls(1).await);

        assert_eq!(s.validator.calls()[0].product, catalog_product);
        assert_eq!(s.catalog.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_finish_errors_do_not_reach_callers() {
        let s = ScenarioBuilder::new()
            .store(MockPaymentQueue::new().with_finish_error("already finished"))
            .start();

        let pending = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));

        within_timeout(pending).await.unwrap().unwrap();
        assert!(s.store.wait_for_finished(1).await);
    }

    #[tokio::test]
    async fn test_panicking_validator_fails_waiters() {
        let s = ScenarioBuilder::new()
            .validator(MockPurchaseValidator::new().panicking())
            .start();

        let pending = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));

        assert!(matches!(
            within_timeout(pending).await.unwrap(),
            Err(PurchaseError::ValidationFailed(_))
        ));
    }

    // ==========================================================================
    // Pending states, restores and diagnostics
    // ==========================================================================

    #[tokio::test]
    async fn test_deferred_keeps_waiters_pending() {
        let s = ScenarioBuilder::new().start();

        let mut pending = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.feed(TransactionEvent::new(
            "t1",
            "pro_monthly",
            crate::core::TransactionState::Deferred,
        ));
        s.settle().await;

        let still_waiting =
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut pending).await;
        assert!(still_waiting.is_err());

        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));
        within_timeout(pending).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restore_and_revocation_diagnostics() {
        let s = ScenarioBuilder::new().start();

        s.handle.restore_completed().unwrap();
        s.handle
            .restore_failed(crate::core::TransactionError::new("network").with_code(-1009))
            .unwrap();
        s.handle
            .entitlements_revoked(vec!["pro_monthly".into()])
            .unwrap();
        s.settle().await;

        let events = s.tap.events();
        assert_eq!(events[0], DiagnosticEvent::RestoreCompleted);
        assert!(matches!(
            &events[1],
            DiagnosticEvent::RestoreFailed { error } if error.contains("-1009")
        ));
        assert_eq!(
            events[2],
            DiagnosticEvent::EntitlementsRevoked {
                product_ids: vec!["pro_monthly".into()]
            }
        );
    }

    #[tokio::test]
    async fn test_variation_diagnostics_carry_full_table() {
        let s = ScenarioBuilder::new().start();

        let _a = s.purchase(PurchaseRequest::new(monthly()).with_variation_id("v1")).await;
        let _b = s
            .purchase(PurchaseRequest::new(Product::new("pro_yearly")).with_variation_id("v2"))
            .await;
        assert!(s.store.wait_for_submitted(2).await);
        s.settle().await;

        let last_persistent = s
            .tap
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DiagnosticEvent::VariationsUpdated {
                    table: VariationTable::Persistent,
                    values,
                } => Some(values),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(
            last_persistent,
            table(&[("pro_monthly", "v1"), ("pro_yearly", "v2")])
        );
    }

    // ==========================================================================
    // Persistence across restarts
    // ==========================================================================

    #[tokio::test]
    async fn test_attribution_survives_restart() {
        let storage = InMemoryStorage::new();
        storage
            .save(SESSION_VARIATIONS_KEY, &table(&[("pro_monthly", "v1")]))
            .unwrap();

        // First launch after upgrade: persistent table seeded from session.
        let s = ScenarioBuilder::new().storage(storage).start();
        let snapshot = s.handle.variation_ids().await.unwrap();
        assert_eq!(snapshot.persistent, table(&[("pro_monthly", "v1")]));

        // A transaction left over from the previous run validates with it.
        s.feed(TransactionEvent::purchased("t1", "pro_monthly"));
        assert!(s.validator.wait_for_calls(1).await);
        let validated = &s.validator.calls()[0];
        assert_eq!(validated.variation_id.as_deref(), Some("v1"));
        assert_eq!(validated.persistent_variation_id.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_file_storage_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MockPaymentQueue::new());
        let validator = Arc::new(MockPurchaseValidator::new());

        let first_run = CoordinatorBuilder::new(
            store.clone(),
            Arc::new(MockProductCatalog::new()),
            validator.clone(),
        )
        .with_storage(Arc::new(JsonFileStorage::open(dir.path()).unwrap()))
        .build()
        .unwrap()
        .start();

        let _abandoned = tokio::spawn({
            let handle = first_run.clone();
            async move {
                handle
                    .submit_purchase(PurchaseRequest::new(monthly()).with_variation_id("v1"))
                    .await
            }
        });
        assert!(store.wait_for_submitted(1).await);
        first_run.shutdown();

        let second_run = CoordinatorBuilder::new(
            store.clone(),
            Arc::new(MockProductCatalog::new()),
            validator.clone(),
        )
        .with_storage(Arc::new(JsonFileStorage::open(dir.path()).unwrap()))
        .build()
        .unwrap()
        .start();

        second_run
            .transaction_updated(TransactionEvent::purchased("t1", "pro_monthly"))
            .unwrap();
        assert!(validator.wait_for_calls(1).await);
        assert!(store.wait_for_finished(1).await);

        let validated = &validator.calls()[0];
        assert_eq!(validated.variation_id.as_deref(), Some("v1"));
        assert_eq!(validated.persistent_variation_id.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_later_calls() {
        let s = ScenarioBuilder::new().start();

        let pending = s.purchase(PurchaseRequest::new(monthly())).await;
        assert!(s.store.wait_for_submitted(1).await);
        s.handle.shutdown();

        assert!(matches!(
            within_timeout(pending).await.unwrap(),
            Err(PurchaseError::CoordinatorShutDown)
        ));
        assert!(matches!(
            s.handle.variation_ids().await,
            Err(PurchaseError::CoordinatorShutDown)
        ));
    }
}
