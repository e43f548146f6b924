use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal::unix::SignalKind;
use tokio::sync::{mpsc, watch};

mod cli;

use cli::Cli;
use email_notifier::{EmailConfig, SmtpNotifier};
use quote_client::QuoteClient;
use watch_core::{WatchConfig, WatchEvent, WatchLoop, WatchSpec, WatchStatus};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    let cli = Cli::parse();

    let spec = WatchSpec {
        ticker: cli.ticker.clone(),
        exchange: cli.exchange.clone(),
        direction: cli.direction.into(),
        target_price: cli.target,
        recipient: cli.email.clone(),
    };
    // Reject bad input with a visible error before anything else runs.
    spec.validate()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    // Notifier configuration is fatal before the first poll: a watch that
    // cannot send its alert must not start.
    let email_config = EmailConfig::from_env();
    let currency = email_config.currency.clone();
    let notifier = SmtpNotifier::new(&email_config)
        .map_err(|e| anyhow::anyhow!("Notifier configuration: {}", e))?;
    tracing::info!("Email notifier ready (alerts go to {})", spec.recipient);

    let source = QuoteClient::new();

    if let Some(range) = cli.history {
        print_history_summary(&source, &spec, range, &currency).await;
    }

    let config = WatchConfig {
        poll_interval: Duration::from_secs(cli.interval_secs),
        max_consecutive_failures: if cli.retry_forever {
            None
        } else {
            Some(cli.max_failures)
        },
    };
    tracing::info!(
        "Polling every {}s, failure tolerance: {}",
        cli.interval_secs,
        match config.max_consecutive_failures {
            Some(max) => max.to_string(),
            None => "unbounded".to_string(),
        }
    );

    let (event_tx, mut event_rx) = mpsc::channel(64);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let worker = tokio::spawn(
        WatchLoop::new(spec, config, source, notifier, event_tx, cancel_rx).run(),
    );

    // Render the event stream until the loop finishes; Ctrl+C or SIGTERM
    // cancels the watch and the loop winds down on its own.
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => match maybe_event {
                Some(event) => render_event(&event, &currency),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, stopping watch...");
                cancel_tx.send(true).ok();
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping watch...");
                cancel_tx.send(true).ok();
            }
        }
    }

    let state = worker
        .await?
        .map_err(|e| anyhow::anyhow!("Watch failed: {}", e))?;
    tracing::info!("Watch finished with status: {}", state.status);
    Ok(())
}

fn render_event(event: &WatchEvent, currency: &str) {
    match event {
        WatchEvent::Sample { ticker, price, .. } => {
            tracing::info!("Current price of {}: {}{:.2}", ticker, currency, price);
        }
        WatchEvent::FetchFailed {
            error,
            consecutive_failures,
        } => {
            tracing::warn!(
                "Error fetching stock price ({} in a row): {}",
                consecutive_failures,
                error
            );
        }
        WatchEvent::Notified { price } => {
            tracing::info!("Email sent successfully (price {}{:.2})", currency, price);
        }
        WatchEvent::NotifyFailed { error } => {
            tracing::error!("Error sending email: {}", error);
        }
        WatchEvent::Finished { status } => match status {
            WatchStatus::Alerted => tracing::info!("Target reached, monitoring stopped"),
            WatchStatus::Stopped => tracing::info!("Monitoring cancelled"),
            WatchStatus::Failed => tracing::error!("Monitoring failed"),
            WatchStatus::Running => {}
        },
    }
}

/// Print a short recent-close summary before monitoring starts. History is a
/// nicety, never fatal.
async fn print_history_summary(
    source: &QuoteClient,
    spec: &WatchSpec,
    range: quote_client::HistoryRange,
    currency: &str,
) {
    match source
        .daily_history(&spec.ticker, &spec.exchange, range)
        .await
    {
        Ok(prices) => {
            if let (Some(first), Some(last)) = (prices.first(), prices.last()) {
                let low = prices.iter().map(|p| p.close).fold(f64::INFINITY, f64::min);
                let high = prices
                    .iter()
                    .map(|p| p.close)
                    .fold(f64::NEG_INFINITY, f64::max);
                tracing::info!(
                    "{} over {}: {} closes, first {}{:.2}, last {}{:.2}, low {}{:.2}, high {}{:.2}",
                    spec.ticker,
                    range.as_str(),
                    prices.len(),
                    currency,
                    first.close,
                    currency,
                    last.close,
                    currency,
                    low,
                    currency,
                    high
                );
            } else {
                tracing::warn!("No historical closes returned for {}", spec.ticker);
            }
        }
        Err(e) => {
            tracing::warn!("Failed to fetch history for {}: {}", spec.ticker, e);
        }
    }
}
