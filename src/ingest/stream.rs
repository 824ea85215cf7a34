//! Stream Ingestion Buffer
//!
//! Consumes the live feed (status, signal, signal_context, pong) from an
//! injected [`StreamClient`] and feeds the store:
//! - signals are buffered and flushed in one `add_signals` call per
//!   coalescing window, so a reconnect replay lands as a single merge
//! - context updates flush anything pending first, then apply in order
//! - high-confidence signals fire a best-effort alert
//! - pong echoes update the round-trip gauge

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::models::{ConnectionStatus, Signal, SignalContextUpdate, StreamEvent};
use crate::signals::SignalStore;
use crate::telemetry::{SIGNALS_FLUSHED_TOTAL, STREAM_RTT_MS};

/// Source of live stream events.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// New receiver for every event published after this call.
    fn subscribe(&self) -> broadcast::Receiver<StreamEvent>;

    fn status(&self) -> ConnectionStatus;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    /// Send a latency probe carrying `timestamp_ms` on the probe clock.
    async fn send_ping(&self, timestamp_ms: i64) -> Result<()>;
}

/// Side effect for high-confidence signals. Failures are logged and ignored.
pub trait AlertSink: Send + Sync {
    fn notify(&self, signal: &Signal) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, signal: &Signal) -> Result<()> {
        info!(
            signal_id = %signal.id,
            market = %signal.market_slug,
            confidence = signal.confidence,
            family = signal.signal_type.family(),
            "high-confidence signal"
        );
        Ok(())
    }
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Default)]
pub struct BellAlertSink;

impl AlertSink for BellAlertSink {
    fn notify(&self, _signal: &Signal) -> Result<()> {
        use std::io::Write;
        let mut stderr = std::io::stderr();
        stderr.write_all(b"\x07")?;
        stderr.flush()?;
        Ok(())
    }
}

/// Last observed stream round-trip time.
#[derive(Debug)]
pub struct LatencyGauge {
    last_ms_bits: AtomicU64,
}

impl Default for LatencyGauge {
    fn default() -> Self {
        Self {
            last_ms_bits: AtomicU64::new(f64::NAN.to_bits()),
        }
    }
}

impl LatencyGauge {
    pub fn record(&self, rtt_ms: f64) {
        self.last_ms_bits.store(rtt_ms.to_bits(), Ordering::Relaxed);
        metrics::gauge!(STREAM_RTT_MS, rtt_ms);
    }

    /// `None` until the first probe comes back.
    pub fn last_ms(&self) -> Option<f64> {
        let v = f64::from_bits(self.last_ms_bits.load(Ordering::Relaxed));
        if v.is_nan() {
            None
        } else {
            Some(v)
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamBufferConfig {
    pub coalesce_window: Duration,
    pub high_confidence: f64,
    pub ping_interval: Duration,
}

impl Default for StreamBufferConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(50),
            high_confidence: 0.90,
            ping_interval: Duration::from_secs(15),
        }
    }
}

impl From<&ClientConfig> for StreamBufferConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            coalesce_window: config.coalesce_window(),
            high_confidence: config.high_confidence,
            ping_interval: config.ping_interval(),
        }
    }
}

#[derive(Default)]
struct Pending {
    signals: Vec<Signal>,
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

struct Shared {
    store: Arc<SignalStore>,
    alerts: Arc<dyn AlertSink>,
    latency: Arc<LatencyGauge>,
    config: StreamBufferConfig,
    pending: Mutex<Pending>,
    status_tx: watch::Sender<ConnectionStatus>,
    /// Origin of the probe clock.
    epoch: Instant,
    flushes: AtomicU64,
}

impl Shared {
    fn probe_now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn handle_event(self: &Arc<Self>, event: StreamEvent) {
        match event {
            StreamEvent::Status(status) => {
                let previous = self.status_tx.send_replace(status);
                if previous != status {
                    info!(from = previous.as_str(), to = status.as_str(), "stream status");
                }
            }
            StreamEvent::Signal(signal) => self.buffer_signal(signal),
            StreamEvent::SignalContext(update) => self.apply_context(update),
            StreamEvent::Pong { timestamp_ms } => {
                let rtt = self.probe_now_ms() - timestamp_ms;
                if rtt >= 0 {
                    self.latency.record(rtt as f64);
                } else {
                    debug!(timestamp_ms, "ignoring pong from another probe clock");
                }
            }
        }
    }

    fn buffer_signal(self: &Arc<Self>, signal: Signal) {
        if signal.confidence >= self.config.high_confidence {
            if let Err(e) = self.alerts.notify(&signal) {
                warn!(signal_id = %signal.id, error = %e, "alert failed");
            }
        }

        let mut pending = self.pending.lock();
        if pending.disposed {
            return;
        }
        pending.signals.push(signal);
        if pending.timer.is_none() {
            let shared = Arc::clone(self);
            let window = self.config.coalesce_window;
            pending.timer = Some(tokio::spawn(async move {
                sleep(window).await;
                shared.flush();
            }));
        }
    }

    fn apply_context(&self, update: SignalContextUpdate) {
        if self.pending.lock().disposed {
            return;
        }
        // Keep invocation order: the signal may still be sitting in the buffer.
        self.flush_now();
        self.store.apply_signal_context_update(update);
    }

    /// Timer path: the timer handle is finished, just release it.
    fn flush(&self) {
        let batch = {
            let mut pending = self.pending.lock();
            pending.timer = None;
            if pending.disposed {
                return;
            }
            std::mem::take(&mut pending.signals)
        };
        self.deliver(batch);
    }

    /// Early flush: cancel the armed timer.
    fn flush_now(&self) {
        let batch = {
            let mut pending = self.pending.lock();
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut pending.signals)
        };
        self.deliver(batch);
    }

    fn deliver(&self, batch: Vec<Signal>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        self.store.add_signals(batch);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(SIGNALS_FLUSHED_TOTAL, count as u64);
        debug!(count, "flushed streamed signals");
    }
}

pub struct StreamIngestionBuffer {
    shared: Arc<Shared>,
    client: Mutex<Option<Arc<dyn StreamClient>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamIngestionBuffer {
    pub fn new(store: Arc<SignalStore>, config: StreamBufferConfig) -> Self {
        Self::with_alerts(store, config, Arc::new(LogAlertSink))
    }

    pub fn with_alerts(
        store: Arc<SignalStore>,
        config: StreamBufferConfig,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                store,
                alerts,
                latency: Arc::new(LatencyGauge::default()),
                config,
                pending: Mutex::new(Pending::default()),
                status_tx,
                epoch: Instant::now(),
                flushes: AtomicU64::new(0),
            }),
            client: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Process one event. Must run inside a tokio runtime.
    pub fn handle_event(&self, event: StreamEvent) {
        self.shared.handle_event(event);
    }

    /// Subscribe to `client`, start the probe loop, then connect.
    ///
    /// One client at a time: a second `attach` fails until `teardown` has
    /// run. Attaching after a teardown re-arms the buffer.
    pub async fn attach(&self, client: Arc<dyn StreamClient>) -> Result<()> {
        {
            let mut slot = self.client.lock();
            if slot.is_some() {
                anyhow::bail!("stream client already attached");
            }
            *slot = Some(Arc::clone(&client));
        }
        self.shared.pending.lock().disposed = false;

        let mut events = client.subscribe();
        let shared = Arc::clone(&self.shared);
        let consumer = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => shared.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "stream consumer lagged; polling will backfill");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        let probe_client = Arc::clone(&client);
        let pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.ping_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !shared.status_tx.borrow().is_connected() {
                    continue;
                }
                if let Err(e) = probe_client.send_ping(shared.probe_now_ms()).await {
                    debug!(error = %e, "latency probe not sent");
                }
            }
        });

        self.tasks.lock().extend([consumer, pinger]);
        self.shared.status_tx.send_replace(client.status());
        client.connect().await
    }

    /// Cancel the pending flush, drop subscriptions, then disconnect.
    pub async fn teardown(&self) {
        let dropped = {
            let mut pending = self.shared.pending.lock();
            pending.disposed = true;
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut pending.signals).len()
        };
        if dropped > 0 {
            debug!(dropped, "discarded buffered signals on teardown");
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let client = self.client.lock().take();
        if let Some(client) = client {
            client.disconnect().await;
        }
        self.shared.status_tx.send_replace(ConnectionStatus::Disconnected);
    }

    /// Connection status as last reported by the stream.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn latency(&self) -> Arc<LatencyGauge> {
        Arc::clone(&self.shared.latency)
    }

    /// Current probe clock reading, for sending probes outside the loop.
    pub fn probe_now_ms(&self) -> i64 {
        self.shared.probe_now_ms()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().signals.len()
    }

    /// Number of batches delivered to the store.
    pub fn flush_count(&self) -> u64 {
        self.shared.flushes.load(Ordering::Relaxed)
    }
}

impl Drop for StreamIngestionBuffer {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(timer) = self.shared.pending.lock().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalType;
    use crate::signals::RetentionPolicy;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn create_test_signal(id: &str, confidence: f64) -> Signal {
        Signal::new(
            id,
            SignalType::EliteWallet {
                wallet_address: "0xelite".to_string(),
                win_rate: 0.7,
                total_volume: 50_000.0,
            },
            confidence,
        )
        .with_detected_at(Utc::now().to_rfc3339())
    }

    fn buffer_with(alerts: Arc<dyn AlertSink>) -> (Arc<SignalStore>, StreamIngestionBuffer) {
        let store = Arc::new(SignalStore::new(RetentionPolicy::default()));
        let buffer =
            StreamIngestionBuffer::with_alerts(store.clone(), StreamBufferConfig::default(), alerts);
        (store, buffer)
    }

    struct CountingAlerts(AtomicUsize);

    impl AlertSink for CountingAlerts {
        fn notify(&self, _signal: &Signal) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingAlerts;

    impl AlertSink for FailingAlerts {
        fn notify(&self, _signal: &Signal) -> Result<()> {
            Err(anyhow::anyhow!("no audio device"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_with_duplicates_is_one_flush() {
        let (store, buffer) = buffer_with(Arc::new(LogAlertSink));

        // 500 signals, the last 120 repeating earlier ids
        for i in 0..500 {
            let id = format!("sig_{}", i % 380);
            buffer.handle_event(StreamEvent::Signal(create_test_signal(&id, 0.5)));
        }
        assert_eq!(store.len(), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(buffer.flush_count(), 1);
        assert_eq!(store.len(), 380);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_update_flushes_pending_signal_first() {
        let (store, buffer) = buffer_with(Arc::new(LogAlertSink));

        buffer.handle_event(StreamEvent::Signal(create_test_signal("a", 0.5)));
        buffer.handle_event(StreamEvent::SignalContext(SignalContextUpdate {
            signal_id: "a".to_string(),
            context_version: 1,
            enriched_at: 10,
            status: "ok".to_string(),
            context: json!({ "lite": true }),
        }));

        assert_eq!(store.get("a").unwrap().context_version, Some(1));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(buffer.flush_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alerts_are_best_effort() {
        let alerts = Arc::new(CountingAlerts(AtomicUsize::new(0)));
        let (_store, buffer) = buffer_with(alerts.clone());
        buffer.handle_event(StreamEvent::Signal(create_test_signal("hi", 0.95)));
        buffer.handle_event(StreamEvent::Signal(create_test_signal("edge", 0.90)));
        buffer.handle_event(StreamEvent::Signal(create_test_signal("lo", 0.89)));
        assert_eq!(alerts.0.load(Ordering::SeqCst), 2);

        let (store, failing) = buffer_with(Arc::new(FailingAlerts));
        failing.handle_event(StreamEvent::Signal(create_test_signal("hi", 0.99)));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_records_round_trip() {
        let (_store, buffer) = buffer_with(Arc::new(LogAlertSink));
        assert_eq!(buffer.latency().last_ms(), None);

        let sent = buffer.probe_now_ms();
        sleep(Duration::from_millis(42)).await;
        buffer.handle_event(StreamEvent::Pong { timestamp_ms: sent });

        assert_eq!(buffer.latency().last_ms(), Some(42.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_events_publish_to_watchers() {
        let (_store, buffer) = buffer_with(Arc::new(LogAlertSink));
        let status = buffer.status();
        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);

        buffer.handle_event(StreamEvent::Status(ConnectionStatus::Connected));
        assert!(status.borrow().is_connected());
    }

    /// Stream double driven by the test through a broadcast channel.
    struct FakeStream {
        events: broadcast::Sender<StreamEvent>,
        connected: Mutex<bool>,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl StreamClient for FakeStream {
        fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
            self.events.subscribe()
        }

        fn status(&self) -> ConnectionStatus {
            if *self.connected.lock() {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            }
        }

        async fn connect(&self) -> Result<()> {
            *self.connected.lock() = true;
            let _ = self.events.send(StreamEvent::Status(ConnectionStatus::Connected));
            Ok(())
        }

        async fn disconnect(&self) {
            *self.connected.lock() = false;
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        async fn send_ping(&self, _timestamp_ms: i64) -> Result<()> {
            Ok(())
        }
    }

    fn fake_stream() -> (broadcast::Sender<StreamEvent>, Arc<FakeStream>) {
        let (events, _) = broadcast::channel(1024);
        let stream = Arc::new(FakeStream {
            events: events.clone(),
            connected: Mutex::new(false),
            disconnects: AtomicUsize::new(0),
        });
        (events, stream)
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_timer_before_disconnect() {
        let (store, buffer) = buffer_with(Arc::new(LogAlertSink));
        let (events, stream) = fake_stream();

        buffer.attach(stream.clone()).await.unwrap();
        events
            .send(StreamEvent::Signal(create_test_signal("live", 0.5)))
            .unwrap();
        settle().await;
        assert_eq!(buffer.pending_len(), 1);

        buffer.teardown().await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(store.len(), 0);
        assert_eq!(buffer.flush_count(), 0);
        assert_eq!(stream.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(events.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_after_teardown_delivers_signals() {
        let (store, buffer) = buffer_with(Arc::new(LogAlertSink));
        let (events, stream) = fake_stream();

        buffer.attach(stream.clone()).await.unwrap();
        buffer.teardown().await;
        assert!(!buffer.status().borrow().is_connected());

        buffer.attach(stream.clone()).await.unwrap();
        events
            .send(StreamEvent::Signal(create_test_signal("after", 0.5)))
            .unwrap();
        settle().await;
        buffer.handle_event(StreamEvent::Signal(create_test_signal("direct", 0.5)));
        sleep(Duration::from_millis(100)).await;

        assert_eq!(store.len(), 2);
        assert!(store.get("after").is_some());
        assert!(buffer.status().borrow().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_attach_is_rejected() {
        let alerts = Arc::new(CountingAlerts(AtomicUsize::new(0)));
        let (store, buffer) = buffer_with(alerts.clone());
        let (events, stream) = fake_stream();

        buffer.attach(stream.clone()).await.unwrap();
        assert!(buffer.attach(stream.clone()).await.is_err());
        assert_eq!(events.receiver_count(), 1);

        events
            .send(StreamEvent::Signal(create_test_signal("hot", 0.95)))
            .unwrap();
        settle().await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(alerts.0.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.flush_count(), 1);
        assert_eq!(store.len(), 1);
    }
}
