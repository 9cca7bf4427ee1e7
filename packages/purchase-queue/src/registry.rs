//! Per-product queues of callers waiting on a purchase outcome.
//!
//! Concurrent requests for the same product coalesce onto one underlying
//! payment. The first registrant is told to submit it; later registrants
//! piggy-back and receive the same outcome.
//!
//! # Invariants
//!
//! - A product's queue is removed as soon as it is drained.
//! - Draining delivers one result, in registration order, to every waiter.
//! - A registration after a drain starts a new queue (and a new payment).

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::PurchaseResult;
use crate::error::PurchaseError;

/// One-shot channel through which a caller receives its outcome.
pub type Completion = oneshot::Sender<PurchaseResult>;

/// Result of [`CompletionRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// True when the caller must submit a new payment.
    pub is_first: bool,
}

#[derive(Default)]
pub struct CompletionRegistry {
    queues: HashMap<String, Vec<Completion>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    /// Queue a waiter for the product.
    pub fn register(&mut self, product_id: &str, completion: Completion) -> Registration {
        match self.queues.get_mut(product_id) {
            Some(waiters) => {
                waiters.push(completion);
                debug!(product_id, waiters = waiters.len(), "joined in-flight purchase");
                Registration { is_first: false }
            }
            None => {
                self.queues.insert(product_id.to_string(), vec![completion]);
                Registration { is_first: true }
            }
        }
    }

    /// Remove the product's queue and deliver `result` to every waiter.
    ///
    /// Returns the number of waiters reached. A missing queue is logged and
    /// ignored: duplicate delivery from the store is expected.
    pub fn drain_and_deliver(&mut self, product_id: &str, result: PurchaseResult) -> usize {
        let Some(waiters) = self.queues.remove(product_id) else {
            let anomaly = PurchaseError::NoPendingRequestForProduct {
                product_id: product_id.to_string(),
            };
            warn!(product_id, error = %anomaly, "no waiters to deliver purchase outcome to");
            return 0;
        };

        match &result {
            Ok(_) => debug!(product_id, waiters = waiters.len(), "delivering purchase success"),
            Err(e) => debug!(
                product_id,
                waiters = waiters.len(),
                category = %e.category(),
                "delivering purchase failure"
            ),
        }

        deliver(product_id, waiters, &result)
    }

    /// Deliver `error` to every waiter of every product. Used on teardown.
    pub fn drain_all(&mut self, error: PurchaseError) -> usize {
        let mut delivered = 0;
        for (product_id, waiters) in self.queues.drain() {
            delivered += deliver(&product_id, waiters, &Err(error.clone()));
        }
        delivered
    }

    pub fn is_pending(&self, product_id: &str) -> bool {
        self.queues.contains_key(product_id)
    }

    /// Number of waiters queued for a product.
    pub fn waiters(&self, product_id: &str) -> usize {
        self.queues.get(product_id).map(Vec::len).unwrap_or(0)
    }

    /// Number of products with at least one waiter.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

impl std::fmt::Debug for CompletionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionRegistry")
            .field("pending_products", &self.queues.len())
            .finish()
    }
}

fn deliver(product_id: &str, waiters: Vec<Completion>, result: &PurchaseResult) -> usize {
    let mut delivered = 0;
    for completion in waiters {
        // The caller may have stopped waiting.
        if completion.send(result.clone()).is_ok() {
            delivered += 1;
        } else {
            debug!(product_id, "purchase caller went away before the outcome");
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Profile, PurchasedInfo, TransactionEvent};

    fn success() -> PurchaseResult {
        Ok(PurchasedInfo {
            profile: Profile::new("profile-1"),
            transaction: TransactionEvent::purchased("t1", "pro_monthly"),
        })
    }

    #[test]
    fn test_first_registrant_submits() {
        let mut registry = CompletionRegistry::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        assert!(registry.register("pro_monthly", tx1).is_first);
        assert!(!registry.register("pro_monthly", tx2).is_first);
        assert_eq!(registry.waiters("pro_monthly"), 2);
    }

    #[test]
    fn test_drain_delivers_same_result_to_all() {
        let mut registry = CompletionRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            registry.register("pro_monthly", tx);
            receivers.push(rx);
        }

        let delivered = registry.drain_and_deliver("pro_monthly", success());
        assert_eq!(delivered, 3);
        assert!(!registry.is_pending("pro_monthly"));

        for mut rx in receivers {
            let result = rx.try_recv().unwrap();
            assert_eq!(result.unwrap().profile.profile_id, "profile-1");
        }
    }

    #[test]
    fn test_registration_after_drain_starts_new_attempt() {
        let mut registry = CompletionRegistry::new();
        let (tx1, _rx1) = oneshot::channel();
        registry.register("pro_monthly", tx1);
        registry.drain_and_deliver("pro_monthly", success());

        let (tx2, _rx2) = oneshot::channel();
        assert!(registry.register("pro_monthly", tx2).is_first);
    }

    #[test]
    fn test_drain_without_queue_is_noop() {
        let mut registry = CompletionRegistry::new();
        assert_eq!(registry.drain_and_deliver("pro_monthly", success()), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dropped_receiver_is_skipped() {
        let mut registry = CompletionRegistry::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        registry.register("pro_monthly", tx1);
        registry.register("pro_monthly", tx2);
        drop(rx1);

        let delivered = registry.drain_and_deliver(
            "pro_monthly",
            Err(PurchaseError::UnknownTransactionFailure {
                product_id: "pro_monthly".into(),
            }),
        );

        assert_eq!(delivered, 1);
        assert!(matches!(
            rx2.try_recv().unwrap(),
            Err(PurchaseError::UnknownTransactionFailure { .. })
        ));
    }

    #[test]
    fn test_drain_all_reaches_every_product() {
        let mut registry = CompletionRegistry::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        registry.register("pro_monthly", tx1);
        registry.register("pro_yearly", tx2);

        assert_eq!(registry.drain_all(PurchaseError::CoordinatorShutDown), 2);
        assert!(registry.is_empty());
        assert!(matches!(rx1.try_recv().unwrap(), Err(PurchaseError::CoordinatorShutDown)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(PurchaseError::CoordinatorShutDown)));
    }

    #[test]
    fn test_products_are_independent() {
        let mut registry = CompletionRegistry::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        assert!(registry.register("pro_monthly", tx1).is_first);
        assert!(registry.register("pro_yearly", tx2).is_first);
        assert_eq!(registry.len(), 2);
    }
}
