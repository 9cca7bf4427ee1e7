//! Diagnostic taps - observe what the coordinator did without influencing it.
//!
//! Taps provide a first-class way to observe coordinator activity for:
//! - Forwarding system events to analytics
//! - Auditing variation attribution changes
//! - Test assertions
//!
//! # Execution Order
//!
//! Taps run inline, inside the serialized context, right after the state change
//! they describe:
//!
//! ```text
//! Message
//!  → Reconciler (mutate state)
//!  → Taps   ← here (observe the new state)
//!  → Effects (collaborator IO)
//! ```
//!
//! Taps must be quick and must not call back into the coordinator. Errors are
//! logged and never affect processing.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{TransactionId, TransactionState};

// =============================================================================
// Diagnostic Events
// =============================================================================

/// Which variation table a diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariationTable {
    Session,
    Persistent,
}

/// Facts emitted for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    /// A variation table changed; carries the full updated table.
    VariationsUpdated {
        table: VariationTable,
        values: HashMap<String, String>,
    },
    /// A payment was handed to the store.
    PaymentSubmitted { product_id: String },
    /// A transaction was handed to the store for finalization.
    TransactionFinished {
        transaction_id: TransactionId,
        product_id: String,
        state: TransactionState,
    },
    /// The store finished replaying restored transactions.
    RestoreCompleted,
    /// The store failed to replay restored transactions.
    RestoreFailed { error: String },
    /// The store revoked entitlements for these products.
    EntitlementsRevoked { product_ids: Vec<String> },
    /// A store-initiated payment was parked until the app resumes it.
    StorePaymentDeferred { product_id: String },
}

impl DiagnosticEvent {
    /// Stable method-style name, e.g. for analytics event keys.
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticEvent::VariationsUpdated { .. } => "set_variations_ids",
            DiagnosticEvent::PaymentSubmitted { .. } => "add_payment",
            DiagnosticEvent::TransactionFinished { .. } => "finish_transaction",
            DiagnosticEvent::RestoreCompleted => "restore_completed",
            DiagnosticEvent::RestoreFailed { .. } => "restore_failed",
            DiagnosticEvent::EntitlementsRevoked { .. } => "entitlements_revoked",
            DiagnosticEvent::StorePaymentDeferred { .. } => "store_payment_deferred",
        }
    }
}

// =============================================================================
// Tap Context
// =============================================================================

/// Context provided to event taps.
///
/// Intentionally minimal - taps observe, they don't act.
#[derive(Debug, Clone)]
pub struct TapContext {
    /// Unique id for this emission, shared by every tap that sees it.
    pub call_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl TapContext {
    pub fn new() -> Self {
        Self {
            call_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for TapContext {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Event Tap Trait
// =============================================================================

/// Trait for observing diagnostics without side effects on the coordinator.
pub trait EventTap: Send + Sync + 'static {
    /// Called for every diagnostic event.
    ///
    /// Errors are logged but do not affect the main flow.
    fn on_event(&self, event: &DiagnosticEvent, ctx: &TapContext) -> Result<()>;
}

// =============================================================================
// Tap Registry
// =============================================================================

/// Registry of taps, owned by the reconciler.
#[derive(Clone, Default)]
pub struct TapRegistry {
    taps: Vec<Arc<dyn EventTap>>,
}

impl TapRegistry {
    pub fn new() -> Self {
        Self { taps: Vec::new() }
    }

    pub fn register(&mut self, tap: Arc<dyn EventTap>) {
        self.taps.push(tap);
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    /// Deliver an event to every tap.
    pub fn emit(&self, event: DiagnosticEvent) {
        let ctx = TapContext::new();
        debug!(event = event.name(), call_id = %ctx.call_id, payload = ?event, "diagnostic");

        for tap in &self.taps {
            if let Err(e) = tap.on_event(&event, &ctx) {
                warn!(event = event.name(), error = %e, "event tap failed");
            }
        }
    }
}

impl std::fmt::Debug for TapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapRegistry")
            .field("tap_count", &self.taps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingTap {
        seen: AtomicUsize,
    }

    impl EventTap for CountingTap {
        fn on_event(&self, _event: &DiagnosticEvent, _ctx: &TapContext) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTap;

    impl EventTap for FailingTap {
        fn on_event(&self, _event: &DiagnosticEvent, _ctx: &TapContext) -> Result<()> {
            Err(anyhow!("analytics offline"))
        }
    }

    struct CallIdTap {
        ids: Mutex<Vec<Uuid>>,
    }

    impl EventTap for CallIdTap {
        fn on_event(&self, _event: &DiagnosticEvent, ctx: &TapContext) -> Result<()> {
            self.ids.lock().unwrap().push(ctx.call_id);
            Ok(())
        }
    }

    #[test]
    fn test_failing_tap_does_not_block_others() {
        let counter = Arc::new(CountingTap {
            seen: AtomicUsize::new(0),
        });

        let mut registry = TapRegistry::new();
        registry.register(Arc::new(FailingTap));
        registry.register(counter.clone());

        registry.emit(DiagnosticEvent::RestoreCompleted);
        registry.emit(DiagnosticEvent::PaymentSubmitted {
            product_id: "pro_monthly".into(),
        });

        assert_eq!(counter.seen.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_taps_share_call_id_per_emission() {
        let a = Arc::new(CallIdTap {
            ids: Mutex::new(Vec::new()),
        });
        let b = Arc::new(CallIdTap {
            ids: Mutex::new(Vec::new()),
        });

        let mut registry = TapRegistry::new();
        registry.register(a.clone());
        registry.register(b.clone());

        registry.emit(DiagnosticEvent::RestoreCompleted);
        registry.emit(DiagnosticEvent::RestoreCompleted);

        let a_ids = a.ids.lock().unwrap().clone();
        let b_ids = b.ids.lock().unwrap().clone();
        assert_eq!(a_ids, b_ids);
        assert_ne!(a_ids[0], a_ids[1]);
    }

    #[test]
    fn test_diagnostic_serializes_with_tag() {
        let event = DiagnosticEvent::PaymentSubmitted {
            product_id: "pro_monthly".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "payment_submitted");
        assert_eq!(json["product_id"], "pro_monthly");
        assert_eq!(event.name(), "add_payment");
    }
}
