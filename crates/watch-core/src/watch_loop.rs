use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::{Notifier, PriceSource, WatchError, WatchEvent, WatchSpec, WatchState, WatchStatus};

/// Tuning for one watch run.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Sleep between polls.
    pub poll_interval: Duration,
    /// Consecutive fetch failures tolerated before the watch fails.
    /// `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            // ~5 minutes of downtime at the default interval
            max_consecutive_failures: Some(60),
        }
    }
}

/// Drives poll -> evaluate -> alert until a terminal status is reached.
///
/// The loop owns its `WatchState` for the whole run and reports progress
/// through the event channel. Cancellation flips the watch channel to `true`
/// and is observed within one poll interval; the notifier is never called
/// after an observed cancellation.
pub struct WatchLoop<P, N> {
    spec: WatchSpec,
    config: WatchConfig,
    source: P,
    notifier: N,
    events: mpsc::Sender<WatchEvent>,
    cancel: watch::Receiver<bool>,
}

impl<P, N> WatchLoop<P, N>
where
    P: PriceSource,
    N: Notifier,
{
    pub fn new(
        spec: WatchSpec,
        config: WatchConfig,
        source: P,
        notifier: N,
        events: mpsc::Sender<WatchEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            spec,
            config,
            source,
            notifier,
            events,
            cancel,
        }
    }

    /// Run the watch to completion. Returns the final state on a clean
    /// terminal status (`Alerted` or `Stopped`); returns an error for an
    /// invalid spec or an exhausted fetch tolerance (status `Failed`).
    pub async fn run(mut self) -> Result<WatchState, WatchError> {
        let mut state = WatchState::new();

        if let Err(e) = self.spec.validate() {
            tracing::error!("Refusing to start watch: {}", e);
            state.status = WatchStatus::Failed;
            self.emit(WatchEvent::Finished {
                status: state.status,
            })
            .await;
            return Err(e);
        }

        tracing::info!(
            "Watching {} on {}: alert when price moves {} {:.2}",
            self.spec.ticker,
            self.spec.exchange,
            self.spec.direction,
            self.spec.target_price
        );

        loop {
            if self.cancelled() {
                return Ok(self.finish_stopped(state).await);
            }

            match self
                .source
                .fetch(&self.spec.ticker, &self.spec.exchange)
                .await
            {
                Err(err) => {
                    state.consecutive_failures += 1;
                    tracing::warn!(
                        "Fetch failed for {} ({} consecutive): {}",
                        self.spec.ticker,
                        state.consecutive_failures,
                        err
                    );
                    self.emit(WatchEvent::FetchFailed {
                        error: err.to_string(),
                        consecutive_failures: state.consecutive_failures,
                    })
                    .await;

                    if let Some(max) = self.config.max_consecutive_failures {
                        if state.consecutive_failures > max {
                            tracing::error!(
                                "Giving up on {} after {} consecutive fetch failures",
                                self.spec.ticker,
                                state.consecutive_failures
                            );
                            state.status = WatchStatus::Failed;
                            self.emit(WatchEvent::Finished {
                                status: state.status,
                            })
                            .await;
                            return Err(WatchError::Fetch(err));
                        }
                    }
                }
                Ok(sample) => {
                    state.consecutive_failures = 0;
                    state.last_sample = Some(sample.clone());
                    self.emit(WatchEvent::Sample {
                        ticker: self.spec.ticker.clone(),
                        price: sample.price,
                        timestamp: sample.timestamp,
                    })
                    .await;

                    if self
                        .spec
                        .direction
                        .satisfied(sample.price, self.spec.target_price)
                    {
                        // A cancellation that raced the fetch still wins:
                        // no notification after an observed stop.
                        if self.cancelled() {
                            return Ok(self.finish_stopped(state).await);
                        }

                        match self
                            .notifier
                            .notify(&self.spec.recipient, &self.spec.ticker, sample.price)
                            .await
                        {
                            Ok(()) => {
                                tracing::info!(
                                    "Alert sent: {} reached {:.2}",
                                    self.spec.ticker,
                                    sample.price
                                );
                                self.emit(WatchEvent::Notified {
                                    price: sample.price,
                                })
                                .await;
                            }
                            Err(err) => {
                                // Single delivery attempt; the watch still
                                // terminates as alerted.
                                tracing::warn!(
                                    "Alert delivery failed for {}: {}",
                                    self.spec.ticker,
                                    err
                                );
                                self.emit(WatchEvent::NotifyFailed {
                                    error: err.to_string(),
                                })
                                .await;
                            }
                        }

                        state.status = WatchStatus::Alerted;
                        self.emit(WatchEvent::Finished {
                            status: state.status,
                        })
                        .await;
                        return Ok(state);
                    }
                }
            }

            if self.sleep_or_cancelled().await {
                return Ok(self.finish_stopped(state).await);
            }
        }
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Sleep one poll interval, waking early on cancellation. Returns true
    /// when the watch was cancelled.
    async fn sleep_or_cancelled(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.poll_interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = self.cancel.changed() => match changed {
                    Ok(()) if *self.cancel.borrow() => return true,
                    Ok(()) => continue,
                    Err(_) => {
                        // Controller dropped the cancel handle; keep polling.
                        sleep.as_mut().await;
                        return false;
                    }
                },
            }
        }
    }

    async fn finish_stopped(&self, mut state: WatchState) -> WatchState {
        tracing::info!("Watch for {} stopped", self.spec.ticker);
        state.status = WatchStatus::Stopped;
        self.emit(WatchEvent::Finished {
            status: state.status,
        })
        .await;
        state
    }

    async fn emit(&self, event: WatchEvent) {
        // A closed display channel must never take the loop down.
        self.events.send(event).await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Direction, FetchError, Notifier, PriceSource, Sample};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scripted price source: pops one outcome per fetch, counts calls, and
    /// optionally flips the cancel switch from inside a fetch.
    struct ScriptedSource {
        outcomes: Mutex<Vec<Result<f64, FetchError>>>,
        fetches: AtomicUsize,
        cancel_on_fetch: Option<watch::Sender<bool>>,
    }

    impl ScriptedSource {
        fn new(outcomes: Vec<Result<f64, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                fetches: AtomicUsize::new(0),
                cancel_on_fetch: None,
            })
        }
    }

    #[async_trait]
    impl PriceSource for Arc<ScriptedSource> {
        async fn fetch(&self, _ticker: &str, _exchange: &str) -> Result<Sample, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = &self.cancel_on_fetch {
                tx.send(true).ok();
            }
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Err(FetchError::MissingData("script exhausted".into()));
            }
            outcomes.remove(0).map(|price| Sample {
                price,
                timestamp: chrono::Utc::now(),
            })
        }
    }

    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Notifier for Arc<CountingNotifier> {
        async fn notify(
            &self,
            _recipient: &str,
            _ticker: &str,
            _price: f64,
        ) -> Result<(), crate::DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::DeliveryError::Transport("smtp down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn spec(direction: Direction, target: f64) -> WatchSpec {
        WatchSpec {
            ticker: "TCS".to_string(),
            exchange: "NSE".to_string(),
            direction,
            target_price: target,
            recipient: "user@example.com".to_string(),
        }
    }

    fn fast_config() -> WatchConfig {
        WatchConfig {
            poll_interval: Duration::from_millis(1),
            max_consecutive_failures: Some(60),
        }
    }

    fn channels() -> (
        mpsc::Sender<WatchEvent>,
        mpsc::Receiver<WatchEvent>,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (event_tx, event_rx, cancel_tx, cancel_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<WatchEvent>) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn alerts_once_at_inclusive_boundary_above() {
        let source = ScriptedSource::new(vec![Ok(3480.0), Ok(3495.0), Ok(3500.0)]);
        let notifier = CountingNotifier::new();
        let (event_tx, mut event_rx, _cancel_tx, cancel_rx) = channels();

        let watch_loop = WatchLoop::new(
            spec(Direction::Above, 3500.0),
            fast_config(),
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        );
        let state = watch_loop.run().await.unwrap();

        assert_eq!(state.status, WatchStatus::Alerted);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(state.last_sample.unwrap().price, 3500.0);

        let events = drain(&mut event_rx);
        let samples = events
            .iter()
            .filter(|e| matches!(e, WatchEvent::Sample { .. }))
            .count();
        assert_eq!(samples, 3);
        assert!(events
            .iter()
            .any(|e| matches!(e, WatchEvent::Notified { price } if *price == 3500.0)));
        assert!(matches!(
            events.last(),
            Some(WatchEvent::Finished {
                status: WatchStatus::Alerted
            })
        ));
    }

    #[tokio::test]
    async fn below_direction_alerts_after_transient_failures() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Http("timeout".into())),
            Err(FetchError::Parse("bad json".into())),
            Ok(95.0),
        ]);
        let notifier = CountingNotifier::new();
        let (event_tx, mut event_rx, _cancel_tx, cancel_rx) = channels();

        let watch_loop = WatchLoop::new(
            spec(Direction::Below, 100.0),
            fast_config(),
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        );
        let state = watch_loop.run().await.unwrap();

        assert_eq!(state.status, WatchStatus::Alerted);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        // Failure count was reset by the successful fetch before evaluation.
        assert_eq!(state.consecutive_failures, 0);

        let events = drain(&mut event_rx);
        let failures: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                WatchEvent::FetchFailed {
                    consecutive_failures,
                    ..
                } => Some(*consecutive_failures),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![1, 2]);
        assert!(events
            .iter()
            .any(|e| matches!(e, WatchEvent::Notified { price } if *price == 95.0)));
    }

    #[tokio::test]
    async fn above_never_notifies_below_target() {
        // Script ends in a satisfying price so the run terminates; everything
        // before it must not notify.
        let source = ScriptedSource::new(vec![Ok(90.0), Ok(99.99), Ok(100.0)]);
        let notifier = CountingNotifier::new();
        let (event_tx, _event_rx, _cancel_tx, cancel_rx) = channels();

        let state = WatchLoop::new(
            spec(Direction::Above, 100.0),
            fast_config(),
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(state.status, WatchStatus::Alerted);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_spec_never_fetches() {
        let source = ScriptedSource::new(vec![Ok(1.0)]);
        let notifier = CountingNotifier::new();
        let (event_tx, mut event_rx, _cancel_tx, cancel_rx) = channels();

        let mut bad = spec(Direction::Above, 100.0);
        bad.recipient = String::new();

        let result = WatchLoop::new(
            bad,
            fast_config(),
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        )
        .run()
        .await;

        assert!(matches!(result, Err(WatchError::InvalidSpec(_))));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);

        let events = drain(&mut event_rx);
        assert!(matches!(
            events.last(),
            Some(WatchEvent::Finished {
                status: WatchStatus::Failed
            })
        ));
    }

    #[tokio::test]
    async fn delivery_failure_still_terminates_alerted() {
        let source = ScriptedSource::new(vec![Ok(3500.0)]);
        let notifier = CountingNotifier::failing();
        let (event_tx, mut event_rx, _cancel_tx, cancel_rx) = channels();

        let state = WatchLoop::new(
            spec(Direction::Above, 3500.0),
            fast_config(),
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(state.status, WatchStatus::Alerted);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        let events = drain(&mut event_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, WatchEvent::NotifyFailed { .. })));
        assert!(!events.iter().any(|e| matches!(e, WatchEvent::Notified { .. })));
    }

    #[tokio::test]
    async fn exhausted_tolerance_fails_the_watch() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Http("down".into())),
            Err(FetchError::Http("down".into())),
            Err(FetchError::Http("down".into())),
        ]);
        let notifier = CountingNotifier::new();
        let (event_tx, mut event_rx, _cancel_tx, cancel_rx) = channels();

        let config = WatchConfig {
            poll_interval: Duration::from_millis(1),
            max_consecutive_failures: Some(2),
        };
        let result = WatchLoop::new(
            spec(Direction::Above, 100.0),
            config,
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        )
        .run()
        .await;

        assert!(matches!(result, Err(WatchError::Fetch(_))));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);

        let events = drain(&mut event_rx);
        assert!(matches!(
            events.last(),
            Some(WatchEvent::Finished {
                status: WatchStatus::Failed
            })
        ));
    }

    #[tokio::test]
    async fn pre_cancelled_watch_stops_without_fetching() {
        let source = ScriptedSource::new(vec![Ok(3500.0)]);
        let notifier = CountingNotifier::new();
        let (event_tx, _event_rx, cancel_tx, cancel_rx) = channels();

        cancel_tx.send(true).unwrap();

        let state = WatchLoop::new(
            spec(Direction::Above, 3500.0),
            fast_config(),
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(state.status, WatchStatus::Stopped);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_during_fetch_suppresses_notification() {
        // The fetch itself flips the cancel switch and returns a satisfying
        // price; the loop must observe the stop before notifying.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let source = Arc::new(ScriptedSource {
            outcomes: Mutex::new(vec![Ok(3600.0)]),
            fetches: AtomicUsize::new(0),
            cancel_on_fetch: Some(cancel_tx),
        });
        let notifier = CountingNotifier::new();
        let (event_tx, mut event_rx) = mpsc::channel(256);

        let state = WatchLoop::new(
            spec(Direction::Above, 3500.0),
            fast_config(),
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(state.status, WatchStatus::Stopped);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);

        let events = drain(&mut event_rx);
        // The satisfying sample was still reported before the stop.
        assert!(events.iter().any(|e| matches!(e, WatchEvent::Sample { .. })));
        assert!(matches!(
            events.last(),
            Some(WatchEvent::Finished {
                status: WatchStatus::Stopped
            })
        ));
    }

    #[tokio::test]
    async fn cancellation_wakes_the_poll_sleep() {
        let source = ScriptedSource::new(vec![Ok(10.0), Ok(10.0), Ok(10.0)]);
        let notifier = CountingNotifier::new();
        let (event_tx, _event_rx, cancel_tx, cancel_rx) = channels();

        let config = WatchConfig {
            poll_interval: Duration::from_secs(60),
            max_consecutive_failures: Some(60),
        };
        let handle = tokio::spawn(
            WatchLoop::new(
                spec(Direction::Above, 100.0),
                config,
                Arc::clone(&source),
                Arc::clone(&notifier),
                event_tx,
                cancel_rx,
            )
            .run(),
        );

        // Let the first (non-satisfying) sample land, then cancel mid-sleep.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(state.status, WatchStatus::Stopped);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unbounded_tolerance_keeps_retrying() {
        let mut outcomes: Vec<Result<f64, FetchError>> = (0..10)
            .map(|_| Err(FetchError::Http("flaky".into())))
            .collect();
        outcomes.push(Ok(3500.0));
        let source = ScriptedSource::new(outcomes);
        let notifier = CountingNotifier::new();
        let (event_tx, _event_rx, _cancel_tx, cancel_rx) = channels();

        let config = WatchConfig {
            poll_interval: Duration::from_millis(1),
            max_consecutive_failures: None,
        };
        let state = WatchLoop::new(
            spec(Direction::Above, 3500.0),
            config,
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(state.status, WatchStatus::Alerted);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 11);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_event_channel_does_not_crash_the_loop() {
        let source = ScriptedSource::new(vec![Ok(3500.0)]);
        let notifier = CountingNotifier::new();
        let (event_tx, event_rx) = mpsc::channel(1);
        drop(event_rx);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let state = WatchLoop::new(
            spec(Direction::Above, 3500.0),
            fast_config(),
            Arc::clone(&source),
            Arc::clone(&notifier),
            event_tx,
            cancel_rx,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(state.status, WatchStatus::Alerted);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }
}
