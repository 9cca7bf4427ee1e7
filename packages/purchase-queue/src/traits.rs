// Trait definitions for the coordinator's collaborators
//
// These are INFRASTRUCTURE traits only - no reconciliation logic.
// The coordinator owns every decision; collaborators only perform IO.
//
// Naming convention: Base* for trait names (e.g., BasePaymentQueue, BasePurchaseValidator)

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{Product, Profile, PurchaseProductInfo, TransactionEvent};

// =============================================================================
// Payment Queue Trait (Infrastructure - native store queue)
// =============================================================================

#[async_trait]
pub trait BasePaymentQueue: Send + Sync {
    /// Whether this device/account may make payments at all
    fn can_make_payments(&self) -> bool;

    /// Add a payment for the product to the native queue
    /// The outcome arrives later as transaction events
    async fn submit_payment(&self, product_id: &str) -> Result<()>;

    /// Finalize (acknowledge/consume) a transaction so the store stops redelivering it
    async fn finish_transaction(&self, transaction: &TransactionEvent) -> Result<()>;
}

// =============================================================================
// Product Catalog Trait (Infrastructure - product metadata lookup)
// =============================================================================

/// How a catalog lookup may use cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchPolicy {
    /// Serve cached data when present, fetch otherwise
    ReturnCacheDataElseLoad,
    /// Always fetch, refreshing the cache
    ReloadRevalidatingCacheData,
}

#[async_trait]
pub trait BaseProductCatalog: Send + Sync {
    /// Resolve a product identifier to metadata
    /// Returns Ok(None) when the store does not know the product
    async fn fetch_product(&self, product_id: &str, policy: FetchPolicy) -> Result<Option<Product>>;
}

// =============================================================================
// Purchase Validator Trait (Infrastructure - receipt validation backend)
// =============================================================================

#[async_trait]
pub trait BasePurchaseValidator: Send + Sync {
    /// Validate a purchased transaction, returning the updated profile
    async fn validate_purchase(&self, info: PurchaseProductInfo) -> Result<Profile>;
}

// =============================================================================
// Key-Value Storage Trait (Infrastructure - durable small maps)
// =============================================================================

/// Durable storage for small string maps.
///
/// Called synchronously from inside the coordinator; implementations must not
/// call back into the coordinator.
pub trait BaseKeyValueStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    fn save(&self, key: &str, values: &HashMap<String, String>) -> Result<()>;
}

// =============================================================================
// Purchase Delegate Trait (App hook for store-initiated payments)
// =============================================================================

pub trait PurchaseDelegate: Send + Sync {
    /// Decide whether a payment the store initiated itself should proceed now
    /// Returning false parks it until `resume_deferred_payment` is called
    fn should_add_store_payment(&self, product: &Product) -> bool;
}
