use thiserror::Error;

/// Failure from a live price source. Transient by design — the watch loop
/// retries these, implementations must not.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing data: {0}")]
    MissingData(String),
}

/// Failure from a notification channel.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// Top-level watch failure. Only invalid specs and an exhausted fetch
/// tolerance terminate a watch through this type.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Invalid watch spec: {0}")]
    InvalidSpec(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}
