//! Polling Ingestion Client
//!
//! REST fallback/complement to the stream. Signals and stats are pulled on
//! independent schedules and written through the same store. Signal polls
//! run fast while the stream is down and slow while it is up; a poll that
//! comes due while the previous one is still outstanding is skipped.
//! Once the handle is stopped, fetches still in flight drop their results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::rest::{SignalApi, SignalQuery};
use crate::config::ClientConfig;
use crate::models::ConnectionStatus;
use crate::signals::SignalStore;
use crate::telemetry::POLL_SKIPPED_TOTAL;

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub limit: usize,
    /// Interval while the stream is disconnected.
    pub fallback_interval: Duration,
    /// Interval while the stream is connected.
    pub connected_interval: Duration,
    pub stats_interval: Duration,
    pub exclude_updown: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            limit: 500,
            fallback_interval: Duration::from_secs(5),
            connected_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(30),
            exclude_updown: false,
        }
    }
}

impl From<&ClientConfig> for PollingConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            limit: config.signal_limit,
            fallback_interval: config.poll_fallback_interval(),
            connected_interval: config.poll_connected_interval(),
            stats_interval: config.stats_interval(),
            exclude_updown: config.exclude_updown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A previous fetch was still outstanding.
    Skipped,
    /// Fetched and merged this many signals.
    Applied(usize),
    /// Fetch failed; the store carries the error.
    Failed,
    /// Resolved after the client was stopped; nothing was written.
    Discarded,
}

/// Clears the in-flight flag when the fetch finishes or is cancelled.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PollingIngestionClient {
    api: Arc<dyn SignalApi>,
    store: Arc<SignalStore>,
    config: PollingConfig,
    signals_in_flight: AtomicBool,
    older_in_flight: AtomicBool,
    live: AtomicBool,
}

impl PollingIngestionClient {
    pub fn new(api: Arc<dyn SignalApi>, store: Arc<SignalStore>, config: PollingConfig) -> Self {
        Self {
            api,
            store,
            config,
            signals_in_flight: AtomicBool::new(false),
            older_in_flight: AtomicBool::new(false),
            live: AtomicBool::new(true),
        }
    }

    /// False once the polling handle has been stopped or dropped.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn latest_query(&self) -> SignalQuery {
        SignalQuery {
            exclude_updown: self.config.exclude_updown,
            ..SignalQuery::latest(self.config.limit)
        }
    }

    /// Fetch the latest page and merge it as the working set.
    pub async fn poll_signals_once(&self) -> PollOutcome {
        let Some(_guard) = InFlight::acquire(&self.signals_in_flight) else {
            debug!("signal poll skipped, previous still in flight");
            metrics::counter!(POLL_SKIPPED_TOTAL, 1);
            return PollOutcome::Skipped;
        };

        let result = self.api.fetch_signals(&self.latest_query()).await;
        if !self.is_live() {
            debug!("signal poll resolved after stop, discarded");
            return PollOutcome::Discarded;
        }
        match result {
            Ok(signals) => {
                let count = signals.len();
                self.store.set_signals(signals);
                self.store.clear_error();
                debug!(count, "signal poll applied");
                PollOutcome::Applied(count)
            }
            Err(e) => {
                warn!(error = %e, "signal poll failed");
                self.store.set_error(format!("Failed to fetch signals: {:#}", e));
                PollOutcome::Failed
            }
        }
    }

    /// Fetch stats; failures are logged and otherwise ignored.
    pub async fn poll_stats_once(&self) -> bool {
        let result = self.api.fetch_signal_stats().await;
        if !self.is_live() {
            return false;
        }
        match result {
            Ok(stats) => {
                self.store.set_stats(stats);
                true
            }
            Err(e) => {
                warn!(error = %e, "stats poll failed");
                false
            }
        }
    }

    /// Fetch the page before the oldest visible signal and merge it.
    pub async fn load_older(&self) -> Result<usize> {
        let Some(_guard) = InFlight::acquire(&self.older_in_flight) else {
            return Ok(0);
        };
        let Some(oldest) = self.store.oldest() else {
            return Ok(0);
        };

        let query = SignalQuery {
            before: Some(oldest.detected_at.clone()),
            before_id: Some(oldest.id.clone()),
            ..self.latest_query()
        };
        let signals = self.api.fetch_signals(&query).await?;
        if !self.is_live() {
            return Ok(0);
        }
        let count = signals.len();
        self.store.add_signals(signals);
        debug!(count, before_id = %oldest.id, "older signals loaded");
        Ok(count)
    }

    /// Fetch the stored context of one signal and apply it unless the store
    /// already holds a newer version.
    pub async fn hydrate_context(&self, signal_id: &str) -> Result<bool> {
        let record = self.api.fetch_signal_context(signal_id).await?;
        if !self.is_live() {
            return Ok(false);
        }
        if let Some(error) = &record.error {
            debug!(signal_id, %error, "context record carries an enrichment error");
        }

        let current = self
            .store
            .get(signal_id)
            .map(|s| s.effective_context_version());
        match current {
            Some(version) if version > record.context_version => Ok(false),
            Some(_) => Ok(self
                .store
                .apply_signal_context_update(record.into_update())),
            None => Ok(false),
        }
    }

    /// Run both schedules until the handle is stopped or dropped.
    pub fn spawn(self: Arc<Self>, status: watch::Receiver<ConnectionStatus>) -> PollingHandle {
        self.live.store(true, Ordering::Release);
        let signals = tokio::spawn(Arc::clone(&self).signal_loop(status));
        let stats = tokio::spawn(Arc::clone(&self).stats_loop());
        info!(
            limit = self.config.limit,
            fallback = ?self.config.fallback_interval,
            connected = ?self.config.connected_interval,
            "polling started"
        );
        PollingHandle {
            client: self,
            tasks: vec![signals, stats],
        }
    }

    async fn signal_loop(self: Arc<Self>, mut status: watch::Receiver<ConnectionStatus>) {
        loop {
            let connected = status.borrow_and_update().is_connected();
            let period = if connected {
                self.config.connected_interval
            } else {
                self.config.fallback_interval
            };

            // Detached so a slow fetch makes the next tick skip, not queue.
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.poll_signals_once().await;
            });

            tokio::select! {
                _ = sleep(period) => {}
                changed = status.changed() => {
                    if changed.is_err() {
                        sleep(period).await;
                    }
                }
            }
        }
    }

    async fn stats_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.poll_stats_once().await;
        }
    }
}

pub struct PollingHandle {
    client: Arc<PollingIngestionClient>,
    tasks: Vec<JoinHandle<()>>,
}

impl PollingHandle {
    pub fn stop(mut self) {
        self.abort_all();
    }

    /// Clear liveness before aborting so detached polls see it on resolve.
    fn abort_all(&mut self) {
        self.client.live.store(false, Ordering::Release);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Signal, SignalContextRecord, SignalStats, SignalType};
    use crate::signals::RetentionPolicy;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn create_test_signal(id: &str, minutes_ago: i64) -> Signal {
        Signal::new(
            id,
            SignalType::MarketExpiryEdge {
                hours_to_expiry: 2.0,
                volume_spike: 3.0,
            },
            0.7,
        )
        .with_detected_at((Utc::now() - chrono::Duration::minutes(minutes_ago)).to_rfc3339())
    }

    #[derive(Default)]
    struct FakeSignalApi {
        page: Mutex<Vec<Signal>>,
        fail_signals: AtomicBool,
        fail_stats: AtomicBool,
        queries: Mutex<Vec<SignalQuery>>,
        signal_calls: AtomicUsize,
        hold: Option<Arc<Notify>>,
        context: Mutex<Option<SignalContextRecord>>,
    }

    #[async_trait]
    impl SignalApi for FakeSignalApi {
        async fn fetch_signals(&self, query: &SignalQuery) -> Result<Vec<Signal>> {
            self.signal_calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().push(query.clone());
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            if self.fail_signals.load(Ordering::SeqCst) {
                anyhow::bail!("GET /api/signals 503 Service Unavailable: ");
            }
            Ok(self.page.lock().clone())
        }

        async fn fetch_signal_stats(&self) -> Result<SignalStats> {
            if self.fail_stats.load(Ordering::SeqCst) {
                anyhow::bail!("stats down");
            }
            Ok(SignalStats {
                total_signals: 3,
                high_confidence_count: 1,
                avg_confidence: 0.7,
                timestamp: Utc::now().to_rfc3339(),
            })
        }

        async fn fetch_signal_context(&self, signal_id: &str) -> Result<SignalContextRecord> {
            self.context
                .lock()
                .clone()
                .filter(|r| r.signal_id == signal_id)
                .ok_or_else(|| anyhow::anyhow!("GET /api/signals/context 404 Not Found"))
        }
    }

    fn client_for(api: Arc<FakeSignalApi>) -> (Arc<SignalStore>, Arc<PollingIngestionClient>) {
        let store = Arc::new(SignalStore::new(RetentionPolicy::default()));
        let client = Arc::new(PollingIngestionClient::new(
            api,
            store.clone(),
            PollingConfig {
                limit: 50,
                exclude_updown: true,
                ..Default::default()
            },
        ));
        (store, client)
    }

    #[tokio::test]
    async fn test_poll_applies_and_clears_error() {
        let api = Arc::new(FakeSignalApi::default());
        *api.page.lock() = vec![create_test_signal("a", 1), create_test_signal("b", 2)];
        api.fail_signals.store(true, Ordering::SeqCst);
        let (store, client) = client_for(api.clone());

        assert_eq!(client.poll_signals_once().await, PollOutcome::Failed);
        assert!(store.error().unwrap().contains("503"));

        api.fail_signals.store(false, Ordering::SeqCst);
        assert_eq!(client.poll_signals_once().await, PollOutcome::Applied(2));
        assert!(store.error().is_none());
        assert_eq!(store.len(), 2);

        let queries = api.queries.lock();
        assert_eq!(queries[0].limit, 50);
        assert!(queries[0].exclude_updown);
    }

    #[tokio::test]
    async fn test_overlapping_poll_is_skipped() {
        let hold = Arc::new(Notify::new());
        let api = Arc::new(FakeSignalApi {
            hold: Some(hold.clone()),
            ..Default::default()
        });
        let (_store, client) = client_for(api.clone());

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.poll_signals_once().await }
        });
        while api.signal_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(client.poll_signals_once().await, PollOutcome::Skipped);
        hold.notify_one();
        assert_eq!(first.await.unwrap(), PollOutcome::Applied(0));
        assert_eq!(api.signal_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_failure_is_ignored() {
        let api = Arc::new(FakeSignalApi::default());
        api.fail_stats.store(true, Ordering::SeqCst);
        let (store, client) = client_for(api.clone());

        assert!(!client.poll_stats_once().await);
        assert!(store.error().is_none());
        assert!(store.stats().is_none());

        api.fail_stats.store(false, Ordering::SeqCst);
        assert!(client.poll_stats_once().await);
        assert_eq!(store.stats().unwrap().total_signals, 3);
    }

    #[tokio::test]
    async fn test_load_older_uses_oldest_as_cursor() {
        let api = Arc::new(FakeSignalApi::default());
        let (store, client) = client_for(api.clone());
        store.add_signals(vec![create_test_signal("new", 1), create_test_signal("old", 30)]);
        *api.page.lock() = vec![create_test_signal("older", 60)];

        assert_eq!(client.load_older().await.unwrap(), 1);
        assert_eq!(store.len(), 3);

        let queries = api.queries.lock();
        assert_eq!(queries[0].before_id.as_deref(), Some("old"));
        assert!(queries[0].before.is_some());
    }

    #[tokio::test]
    async fn test_hydrate_context_respects_newer_version() {
        let api = Arc::new(FakeSignalApi::default());
        let (store, client) = client_for(api.clone());
        store.add_signal(create_test_signal("a", 1));
        *api.context.lock() = Some(SignalContextRecord {
            signal_id: "a".to_string(),
            context_version: 2,
            enriched_at: 100,
            status: "ok".to_string(),
            error: None,
            context: json!({ "full": true }),
        });

        assert!(client.hydrate_context("a").await.unwrap());
        assert_eq!(store.get("a").unwrap().context_version, Some(2));

        store.apply_signal_context_update(crate::models::SignalContextUpdate {
            signal_id: "a".to_string(),
            context_version: 5,
            enriched_at: 200,
            status: "ok".to_string(),
            context: json!({ "stream": true }),
        });
        assert!(!client.hydrate_context("a").await.unwrap());
        assert_eq!(store.get("a").unwrap().context_version, Some(5));
        assert!(client.hydrate_context("missing").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_follows_stream_status() {
        let api = Arc::new(FakeSignalApi::default());
        let (_store, client) = client_for(api.clone());
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let handle = client.clone().spawn(status_rx);
        // Immediate poll, then every 5s while disconnected.
        sleep(Duration::from_millis(10_500)).await;
        assert_eq!(api.signal_calls.load(Ordering::SeqCst), 3);

        // Status change polls right away, then every 60s.
        status_tx.send_replace(ConnectionStatus::Connected);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(api.signal_calls.load(Ordering::SeqCst), 4);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_poller_discards_late_result() {
        let hold = Arc::new(Notify::new());
        let api = Arc::new(FakeSignalApi {
            hold: Some(hold.clone()),
            ..Default::default()
        });
        *api.page.lock() = vec![create_test_signal("late", 1)];
        let (store, client) = client_for(api.clone());
        let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let handle = client.clone().spawn(status_rx);
        while api.signal_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        handle.stop();
        assert!(!client.is_live());

        hold.notify_one();
        while client.signals_in_flight.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        sleep(Duration::from_millis(100)).await;

        assert_eq!(store.revision(), 0);
        assert!(store.is_empty());
        assert!(store.error().is_none());

        hold.notify_one();
        assert_eq!(client.poll_signals_once().await, PollOutcome::Discarded);
        assert!(store.is_empty());
    }
}
