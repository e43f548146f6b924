use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::WatchError;

/// Which way the price has to move to trigger the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Alert when price rises to or above the target.
    Above,
    /// Alert when price falls to or below the target.
    Below,
}

impl Direction {
    /// Boundary is inclusive for both directions: an exactly-equal price
    /// satisfies either predicate.
    pub fn satisfied(&self, price: f64, target: f64) -> bool {
        match self {
            Direction::Above => price >= target,
            Direction::Below => price <= target,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Above => write!(f, "above"),
            Direction::Below => write!(f, "below"),
        }
    }
}

/// Immutable input to one watch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSpec {
    pub ticker: String,
    pub exchange: String,
    pub direction: Direction,
    pub target_price: f64,
    pub recipient: String,
}

impl WatchSpec {
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.ticker.trim().is_empty() {
            return Err(WatchError::InvalidSpec("ticker must not be empty".into()));
        }
        if self.recipient.trim().is_empty() {
            return Err(WatchError::InvalidSpec(
                "recipient must not be empty".into(),
            ));
        }
        if !self.target_price.is_finite() || self.target_price < 0.0 {
            return Err(WatchError::InvalidSpec(format!(
                "target price must be a non-negative number, got {}",
                self.target_price
            )));
        }
        Ok(())
    }
}

/// One observed price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Watch lifecycle. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchStatus {
    Running,
    Alerted,
    Failed,
    Stopped,
}

impl std::fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchStatus::Running => write!(f, "running"),
            WatchStatus::Alerted => write!(f, "alerted"),
            WatchStatus::Failed => write!(f, "failed"),
            WatchStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Mutable state of a running watch. Owned and mutated exclusively by its
/// watch loop; everyone else sees copies through events or the final value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchState {
    pub status: WatchStatus,
    pub last_sample: Option<Sample>,
    pub consecutive_failures: u32,
}

impl WatchState {
    pub fn new() -> Self {
        Self {
            status: WatchStatus::Running,
            last_sample: None,
            consecutive_failures: 0,
        }
    }
}

impl Default for WatchState {
    fn default() -> Self {
        Self::new()
    }
}

/// Observable progress emitted by the watch loop for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WatchEvent {
    Sample {
        ticker: String,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    FetchFailed {
        error: String,
        consecutive_failures: u32,
    },
    Notified {
        price: f64,
    },
    NotifyFailed {
        error: String,
    },
    Finished {
        status: WatchStatus,
    },
}
