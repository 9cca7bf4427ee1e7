//! # Purchase Queue
//!
//! A serialized coordinator that reconciles the store's asynchronous,
//! at-least-once transaction feed with locally issued purchase requests.
//!
//! ## Guarantees
//!
//! - At most one payment in flight per product; concurrent requests coalesce.
//! - Every caller receives exactly one outcome, even when coalesced.
//! - A purchased transaction is finalized only after validation succeeds, and
//!   never in observer mode.
//! - Product-to-variation attribution is written through to durable storage
//!   and is on file when validation needs it.
//!
//! ## Core Concepts
//!
//! - [`PurchaseRequest`] = Intent (a caller wants a product)
//! - [`TransactionEvent`] = Facts (the store reports what happened)
//! - [`StoreCommand`] = IO the reconciler decided on
//!
//! ## Architecture
//!
//! ```text
//! Caller / Store feed
//!     │
//!     ▼ CoordinatorHandle
//! Mailbox (one serialized context) ◄──────────────────┐
//!     │                                               │
//!     ▼                                               │
//! TransactionReconciler.decide()                      │
//!     │  ├─ VariationStore     (write-through)        │
//!     │  ├─ CompletionRegistry (fan-out to waiters)   │
//!     │  ├─ ProductResolver    (in-flight products)   │
//!     │  └─ TapRegistry        (diagnostics)          │
//!     │                                               │
//!     ▼ StoreCommand                                  │
//! Dispatcher ─► spawned task ─► collaborator IO       │
//!                                   │                 │
//!                                   └─ continuation ──┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use purchase_queue::{CoordinatorBuilder, CoordinatorConfig, Product, PurchaseRequest};
//!
//! let handle = CoordinatorBuilder::new(store, catalog, validator)
//!     .with_config(CoordinatorConfig::from_env()?)
//!     .build()?
//!     .start();
//!
//! let request = PurchaseRequest::new(Product::new("pro_monthly")).with_variation_id("v1");
//! let info = handle.submit_purchase(request).await?;
//! println!("access levels: {:?}", info.profile.access_levels);
//! ```

// Core modules
mod adapter;
mod config;
mod core;
mod dispatch;
mod effect;
mod engine;
mod error;
mod persistence;
mod reconciler;
mod registry;
mod resolver;
mod tap;
mod traits;
mod variation;

// State machine trait
pub mod machine;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Scenario tests (test-only)
#[cfg(test)]
mod scenario_tests;


// Re-export domain types
pub use crate::core::{
    Product, Profile, PurchaseProductInfo, PurchaseRequest, PurchaseResult, PurchasedInfo,
    TransactionError, TransactionEvent, TransactionId, TransactionState,
};

// Re-export error types
pub use crate::error::{ErrorCategory, PurchaseError};

// Re-export collaborator traits
pub use crate::traits::{
    BaseKeyValueStorage, BasePaymentQueue, BaseProductCatalog, BasePurchaseValidator, FetchPolicy,
    PurchaseDelegate,
};

// Re-export the coordinator
pub use crate::engine::{Coordinator, CoordinatorBuilder, CoordinatorHandle};
pub use crate::reconciler::{CoordinatorEvent, Lifecycle, TransactionReconciler};
pub use crate::effect::{EffectContext, StoreCommand};
pub use crate::config::{CoordinatorConfig, ObserverMode, DEFAULT_SETTLED_HISTORY};

// Re-export components
pub use crate::variation::{
    VariationSnapshot, VariationStore, PERSISTENT_VARIATIONS_KEY, SESSION_VARIATIONS_KEY,
};
pub use crate::registry::{Completion, CompletionRegistry, Registration};
pub use crate::resolver::{CachingCatalog, ProductResolver};
pub use crate::persistence::{InMemoryStorage, JsonFileStorage};
pub use crate::tap::{DiagnosticEvent, EventTap, TapContext, TapRegistry, VariationTable};
pub use crate::adapter::{
    AdapterError, LegacyQueueTransaction, ModernPurchaseResult, VerifiedTransaction,
};
