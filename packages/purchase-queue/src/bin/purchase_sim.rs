//! Purchase Simulator
//!
//! Runs the coordinator against an in-process store that answers every payment
//! with a transaction update, the way a platform queue observer would. Useful
//! for watching coalescing, validation and finalization in the logs.
//!
//! Configuration comes from the environment (see `CoordinatorConfig::from_env`);
//! set `PURCHASE_QUEUE_STORAGE_DIR` to keep attribution across runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use purchase_queue::{
    BasePaymentQueue, BaseProductCatalog, BasePurchaseValidator, CachingCatalog,
    CoordinatorBuilder, CoordinatorConfig, CoordinatorHandle, FetchPolicy, LegacyQueueTransaction,
    ModernPurchaseResult, Product, Profile, PurchaseProductInfo, PurchaseRequest, TransactionError,
    TransactionEvent, VerifiedTransaction,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Product the simulated store always declines.
const DECLINED_PRODUCT: &str = "pro_lifetime";

// =============================================================================
// Simulated collaborators
// =============================================================================

/// Store that reports each submitted payment on the feed channel.
struct SimulatedStore {
    feed: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl BasePaymentQueue for SimulatedStore {
    fn can_make_payments(&self) -> bool {
        true
    }

    async fn submit_payment(&self, product_id: &str) -> Result<()> {
        self.feed
            .send(product_id.to_string())
            .map_err(|_| anyhow!("store feed closed"))
    }

    async fn finish_transaction(&self, transaction: &TransactionEvent) -> Result<()> {
        tracing::info!(
            transaction_id = %transaction.transaction_id,
            state = %transaction.state,
            "store finished transaction"
        );
        Ok(())
    }
}

struct StaticCatalog {
    products: HashMap<String, Product>,
}

#[async_trait]
impl BaseProductCatalog for StaticCatalog {
    async fn fetch_product(&self, product_id: &str, _policy: FetchPolicy) -> Result<Option<Product>> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.products.get(product_id).cloned())
    }
}

/// Grants a "premium" access level for every purchased product.
struct SimulatedValidator;

#[async_trait]
impl BasePurchaseValidator for SimulatedValidator {
    async fn validate_purchase(&self, info: PurchaseProductInfo) -> Result<Profile> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracing::info!(
            product_id = %info.product.vendor_product_id,
            variation_id = ?info.variation_id,
            persistent_variation_id = ?info.persistent_variation_id,
            "validating receipt"
        );
        Ok(Profile::new("sim-profile").with_access_level("premium"))
    }
}

/// Turn submitted payments into store updates.
async fn run_store_feed(mut payments: mpsc::UnboundedReceiver<String>, handle: CoordinatorHandle) {
    let mut sequence: u64 = 2_000_000_000;

    while let Some(product_id) = payments.recv().await {
        sequence += 1;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let update = if product_id == DECLINED_PRODUCT {
            TransactionEvent::try_from(LegacyQueueTransaction {
                transaction_identifier: Some(sequence.to_string()),
                product_identifier: product_id,
                transaction_state: 2,
                error: Some(TransactionError::new("payment declined").with_code(5)),
                transaction_date: None,
            })
        } else {
            Ok(TransactionEvent::from(ModernPurchaseResult::Success(
                VerifiedTransaction {
                    id: sequence,
                    product_id,
                    purchase_date: Utc::now(),
                },
            )))
        };

        let sent = match update {
            Ok(transaction) => handle.transaction_updated(transaction),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed store update");
                continue;
            }
        };
        if sent.is_err() {
            break;
        }
    }
}

fn catalog() -> CachingCatalog<StaticCatalog> {
    let products = [
        Product::new("pro_monthly")
            .with_title("Pro Monthly")
            .with_price("$9.99", "USD"),
        Product::new("pro_yearly")
            .with_title("Pro Yearly")
            .with_price("$59.99", "USD"),
        Product::new(DECLINED_PRODUCT)
            .with_title("Pro Lifetime")
            .with_price("$199.99", "USD"),
    ];
    CachingCatalog::new(StaticCatalog {
        products: products
            .into_iter()
            .map(|p| (p.vendor_product_id.clone(), p))
            .collect(),
    })
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,purchase_queue=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = CoordinatorConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        observer_mode = config.observer_mode.is_enabled(),
        storage_dir = ?config.storage_dir,
        "Starting purchase simulator"
    );

    let (payments_tx, payments_rx) = mpsc::unbounded_channel();
    let handle = CoordinatorBuilder::new(
        Arc::new(SimulatedStore { feed: payments_tx }),
        Arc::new(catalog()),
        Arc::new(SimulatedValidator),
    )
    .with_config(config)
    .build()
    .context("Failed to build purchase coordinator")?
    .start();

    let feed = tokio::spawn(run_store_feed(payments_rx, handle.clone()));

    // Three callers tap "buy" at once; one payment is submitted.
    let monthly = Product::new("pro_monthly").with_title("Pro Monthly");
    let buyers = (0..3).map(|_| {
        handle.submit_purchase(PurchaseRequest::new(monthly.clone()).with_variation_id("paywall-a"))
    });
    for (caller, outcome) in futures::future::join_all(buyers).await.into_iter().enumerate() {
        match outcome {
            Ok(info) => tracing::info!(
                caller,
                transaction_id = %info.transaction.transaction_id,
                access_levels = ?info.profile.access_levels,
                "purchase succeeded"
            ),
            Err(e) => tracing::warn!(caller, error = %e, "purchase failed"),
        }
    }

    // The store declines this one.
    let declined = handle
        .submit_purchase(PurchaseRequest::new(Product::new(DECLINED_PRODUCT)))
        .await;
    if let Err(e) = declined {
        tracing::info!(error = %e, category = %e.category(), "purchase declined as expected");
    }

    // A restore replays an old transaction nobody is waiting for.
    handle
        .transaction_updated(TransactionEvent::restored("1999999999", "pro_yearly"))
        .context("Failed to feed restored transaction")?;
    handle
        .restore_completed()
        .context("Failed to report restore completion")?;

    let snapshot = handle
        .variation_ids()
        .await
        .context("Failed to read variation tables")?;
    tracing::info!(
        variations = %serde_json::to_string(&snapshot).context("Failed to encode variations")?,
        "attribution on file"
    );

    handle.shutdown();
    feed.await.context("Store feed task failed")?;
    tracing::info!("Purchase simulator finished");

    Ok(())
}
