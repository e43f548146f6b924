use async_trait::async_trait;

use crate::{DeliveryError, FetchError, Sample};

/// Source of live prices. Implementations perform one fetch per call and
/// never retry — retries belong to the watch loop.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self, ticker: &str, exchange: &str) -> Result<Sample, FetchError>;
}

/// Delivery channel for price alerts. Called at most once per watch run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, ticker: &str, price: f64)
        -> Result<(), DeliveryError>;
}
