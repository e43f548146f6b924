use clap::{Parser, ValueEnum};

use quote_client::HistoryRange;
use watch_core::Direction;

#[derive(Parser, Debug)]
#[command(
    name = "watch-agent",
    about = "Email alert when a stock's live price crosses a target"
)]
pub struct Cli {
    /// Stock ticker to watch (e.g. TCS)
    pub ticker: String,

    /// Listing venue (NSE, BSE, or any Yahoo-recognized market)
    #[arg(long, default_value = "NSE")]
    pub exchange: String,

    /// Alert when the price moves above or below the target
    #[arg(long, value_enum)]
    pub direction: DirectionArg,

    /// Target price
    #[arg(long)]
    pub target: f64,

    /// Email address to notify
    #[arg(long)]
    pub email: String,

    /// Seconds between polls
    #[arg(long, default_value_t = 5)]
    pub interval_secs: u64,

    /// Consecutive fetch failures tolerated before giving up
    #[arg(long, default_value_t = 60)]
    pub max_failures: u32,

    /// Keep retrying fetch failures forever instead of giving up
    #[arg(long)]
    pub retry_forever: bool,

    /// Print a daily-close summary over this range before monitoring
    /// (1d, 5d, 1mo, 6mo, 1y, 5y)
    #[arg(long)]
    pub history: Option<HistoryRange>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionArg {
    Above,
    Below,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Above => Direction::Above,
            DirectionArg::Below => Direction::Below,
        }
    }
}
