//! Product metadata resolution.
//!
//! [`ProductResolver`] keeps the products currently being purchased so a
//! transaction for them resolves without a catalog round trip. Everything else
//! goes to the catalog with cached data preferred. Resolution never fails: an
//! unrecognized product degrades to [`Product::unknown`] so an outcome can still
//! be reported.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::core::Product;
use crate::error::PurchaseError;
use crate::traits::{BaseProductCatalog, FetchPolicy};

// =============================================================================
// In-flight products
// =============================================================================

/// Products with a purchase in flight, keyed by product id.
///
/// Owned by the reconciler; only touched from the serialized context.
#[derive(Debug, Default)]
pub struct ProductResolver {
    purchasing: HashMap<String, Product>,
}

impl ProductResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a product a caller is purchasing.
    pub fn track(&mut self, product: Product) {
        self.purchasing
            .insert(product.vendor_product_id.clone(), product);
    }

    /// In-memory product, if a purchase for it is in flight.
    pub fn local(&self, product_id: &str) -> Option<&Product> {
        self.purchasing.get(product_id)
    }

    pub fn forget(&mut self, product_id: &str) {
        self.purchasing.remove(product_id);
    }

    pub fn len(&self) -> usize {
        self.purchasing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.purchasing.is_empty()
    }
}

/// Resolve a product through the catalog, preferring cached data.
///
/// Lookup failures are logged and degrade to an empty product.
pub async fn fetch(catalog: &dyn BaseProductCatalog, product_id: &str) -> Product {
    match catalog
        .fetch_product(product_id, FetchPolicy::ReturnCacheDataElseLoad)
        .await
    {
        Ok(Some(product)) => product,
        Ok(None) => {
            debug!(product_id, "catalog does not know product, using empty metadata");
            Product::unknown(product_id)
        }
        Err(e) => {
            let error = PurchaseError::ProductResolutionFailed {
                product_id: product_id.to_string(),
                reason: e.to_string(),
            };
            warn!(product_id, error = %error, category = %error.category(), "product lookup failed");
            Product::unknown(product_id)
        }
    }
}

// =============================================================================
// Caching catalog
// =============================================================================

/// Catalog decorator with an in-memory product cache.
///
/// Only found products are cached; a miss is looked up again next time.
pub struct CachingCatalog<C> {
    inner: C,
    cache: DashMap<String, Product>,
}

impl<C: BaseProductCatalog> CachingCatalog<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    /// Seed the cache, e.g. with products fetched for a paywall.
    pub fn prime(&self, products: impl IntoIterator<Item = Product>) {
        for product in products {
            self.cache.insert(product.vendor_product_id.clone(), product);
        }
    }

    pub fn cached(&self, product_id: &str) -> Option<Product> {
        self.cache.get(product_id).map(|entry| entry.value().clone())
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: BaseProductCatalog> BaseProductCatalog for CachingCatalog<C> {
    async fn fetch_product(&self, product_id: &str, policy: FetchPolicy) -> Result<Option<Product>> {
        if policy == FetchPolicy::ReturnCacheDataElseLoad {
            if let Some(product) = self.cached(product_id) {
                return Ok(Some(product));
            }
        }

        let fetched = self.inner.fetch_product(product_id, policy).await?;
        if let Some(product) = &fetched {
            self.cache.insert(product_id.to_string(), product.clone());
        }
        Ok(fetched)
    }
}

#[async_trait]
impl<C: BaseProductCatalog + ?Sized> BaseProductCatalog for Arc<C> {
    async fn fetch_product(&self, product_id: &str, policy: FetchPolicy) -> Result<Option<Product>> {
        (**self).fetch_product(product_id, policy).await
    }
}
