//! Signal Reconciliation Store
//!
//! Canonical in-memory view of live signals. Every ingestion path (stream
//! replay, live stream, REST polling, on-demand hydration) writes through the
//! operations here, so the visible set is always:
//! - deduplicated by `id`
//! - sorted newest-first by `detected_at`, ties by ascending `id`
//! - trimmed to a rolling window and a hard size cap
//!
//! Mutations are synchronous and total. Observers are notified in the same
//! call, after the state lock has been released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::merge::{apply_context_update, merge_signal, sort_newest_first};
use crate::models::{Signal, SignalContextUpdate, SignalStats};
use crate::telemetry::SIGNAL_STORE_SIZE;

/// Rolling window applied after every mutation.
pub const DEFAULT_RETENTION_HOURS: i64 = 24;
/// Hard cap on stored signals.
pub const DEFAULT_MAX_SIGNALS: usize = 20_000;

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub window: Duration,
    pub max_entries: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            window: Duration::hours(DEFAULT_RETENTION_HOURS),
            max_entries: DEFAULT_MAX_SIGNALS,
        }
    }
}

/// Immutable view handed to readers and observers.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub signals: Arc<Vec<Signal>>,
    pub revision: u64,
    pub error: Option<String>,
    pub stats: Option<SignalStats>,
}

type Observer = Arc<dyn Fn(&StoreSnapshot) + Send + Sync>;
type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Handle returned by [`SignalStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct StoreState {
    signals: Arc<Vec<Signal>>,
    revision: u64,
    error: Option<String>,
    stats: Option<SignalStats>,
}

impl StoreState {
    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            signals: self.signals.clone(),
            revision: self.revision,
            error: self.error.clone(),
            stats: self.stats.clone(),
        }
    }
}

pub struct SignalStore {
    state: RwLock<StoreState>,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_observer: AtomicU64,
    policy: RetentionPolicy,
    clock: Clock,
}

impl Default for SignalStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl SignalStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self::with_clock(policy, Utc::now)
    }

    /// Store with an injected wall clock for the retention window.
    pub fn with_clock<F>(policy: RetentionPolicy, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        Self {
            state: RwLock::new(StoreState::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            policy,
            clock: Box::new(clock),
        }
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    pub fn add_signal(&self, signal: Signal) {
        self.add_signals(vec![signal]);
    }

    /// Insert-or-merge a batch. Duplicates inside the batch merge in order.
    pub fn add_signals(&self, signals: Vec<Signal>) {
        if signals.is_empty() {
            return;
        }
        self.mutate_signals(|current| merge_into(current, signals));
    }

    /// Merge the full working set fetched by polling. Enrichment already
    /// present in the store is preserved by version arbitration.
    pub fn set_signals(&self, signals: Vec<Signal>) {
        self.mutate_signals(|current| merge_into(current, signals));
    }

    /// Apply an enrichment update. Unknown ids are ignored.
    pub fn apply_signal_context_update(&self, update: SignalContextUpdate) -> bool {
        let mut applied = false;
        self.mutate_signals(|current| {
            let mut next = current.to_vec();
            if let Some(signal) = next.iter_mut().find(|s| s.id == update.signal_id) {
                apply_context_update(signal, update);
                applied = true;
            } else {
                debug!(signal_id = %update.signal_id, "context update for unknown signal ignored");
            }
            next
        });
        applied
    }

    /// Drop every stored signal (session reset).
    pub fn clear(&self) {
        self.mutate_signals(|_| Vec::new());
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.mutate(|state| {
            if state.error.as_deref() == Some(message.as_str()) {
                return false;
            }
            state.error = Some(message);
            true
        });
    }

    pub fn clear_error(&self) {
        self.mutate(|state| state.error.take().is_some());
    }

    pub fn set_stats(&self, stats: SignalStats) {
        self.mutate(|state| {
            if state.stats.as_ref() == Some(&stats) {
                return false;
            }
            state.stats = Some(stats);
            true
        });
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.read().snapshot()
    }

    pub fn signals(&self) -> Arc<Vec<Signal>> {
        self.state.read().signals.clone()
    }

    pub fn get(&self, id: &str) -> Option<Signal> {
        self.state.read().signals.iter().find(|s| s.id == id).cloned()
    }

    /// Oldest visible signal, used as the pagination cursor.
    pub fn oldest(&self) -> Option<Signal> {
        self.state.read().signals.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn stats(&self) -> Option<SignalStats> {
        self.state.read().stats.clone()
    }

    // =========================================================================
    // OBSERVERS
    // =========================================================================

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&StoreSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(observer)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id.0);
        observers.len() != before
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Compute the next signal set from the current one, then apply retention
    /// and ordering. No-op results leave the revision untouched.
    fn mutate_signals<F>(&self, f: F)
    where
        F: FnOnce(&[Signal]) -> Vec<Signal>,
    {
        let now = (self.clock)();
        let policy = &self.policy;
        self.mutate(|state| {
            let mut next = f(&state.signals);
            retain_window(&mut next, now, policy);
            if next.as_slice() == state.signals.as_slice() {
                return false;
            }
            state.signals = Arc::new(next);
            true
        });
    }

    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut StoreState) -> bool,
    {
        let snapshot = {
            let mut state = self.state.write();
            if !f(&mut state) {
                return;
            }
            state.revision += 1;
            state.snapshot()
        };

        metrics::gauge!(SIGNAL_STORE_SIZE, snapshot.signals.len() as f64);
        self.notify(&snapshot);
    }

    fn notify(&self, snapshot: &StoreSnapshot) {
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer(snapshot);
        }
    }
}

fn merge_into(current: &[Signal], incoming: Vec<Signal>) -> Vec<Signal> {
    let mut next = current.to_vec();
    let mut index: HashMap<String, usize> = next
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    for signal in incoming {
        match index.get(&signal.id) {
            Some(&i) => {
                let merged = merge_signal(&next[i], signal);
                next[i] = merged;
            }
            None => {
                index.insert(signal.id.clone(), next.len());
                next.push(signal);
            }
        }
    }
    next
}

/// Window trim, then order, then cap. Unparseable timestamps survive the
/// window trim and sort last, so they are the first to go at the cap.
fn retain_window(signals: &mut Vec<Signal>, now: DateTime<Utc>, policy: &RetentionPolicy) {
    let cutoff = now - policy.window;
    signals.retain(|s| match s.detected_at_utc() {
        Some(ts) => ts >= cutoff,
        None => true,
    });
    sort_newest_first(signals);
    signals.truncate(policy.max_entries);
}
