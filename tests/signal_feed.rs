//! End-to-end signal feed: polling over HTTP and stream events converging
//! on one store.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use betterbot_client::api::RestClient;
use betterbot_client::ingest::{
    PollOutcome, PollingConfig, PollingIngestionClient, StreamBufferConfig, StreamIngestionBuffer,
};
use betterbot_client::models::{Signal, SignalType};
use betterbot_client::signals::{RetentionPolicy, SignalStore};
use betterbot_client::{SignalContextUpdate, StreamEvent};

#[derive(Default)]
struct Feed {
    pages: Mutex<Vec<Value>>,
    cursors: Mutex<Vec<Option<String>>>,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    before_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContextParams {
    signal_id: String,
}

fn raw_signal(id: &str, detected_at: &str, context_version: Option<i64>) -> Value {
    let mut raw = json!({
        "id": id,
        "signal_type": {"type": "WhaleFollowing", "whale_address": "0xwhale", "position_size": 5000.0},
        "market_slug": "btc-above-100k",
        "confidence": 0.8,
        "detected_at": detected_at,
        "source": "dome"
    });
    if let Some(version) = context_version {
        raw["context_version"] = json!(version);
        raw["context"] = json!({"from": "poll"});
    }
    raw
}

async fn list_signals(State(feed): State<Arc<Feed>>, Query(params): Query<ListParams>) -> Json<Value> {
    feed.cursors.lock().push(params.before_id.clone());
    let signals = if params.before_id.is_some() {
        vec![raw_signal("sig_older", "2025-11-16T11:00:00Z", None)]
    } else {
        feed.pages.lock().clone()
    };
    let count = signals.len();
    Json(json!({"signals": signals, "count": count, "timestamp": ""}))
}

async fn signal_context(Query(params): Query<ContextParams>) -> Json<Value> {
    Json(json!({
        "signal_id": params.signal_id,
        "context_version": 3,
        "enriched_at": 1763294500,
        "status": "ok",
        "context": {"from": "hydrate"}
    }))
}

async fn spawn_feed(feed: Arc<Feed>) -> String {
    let app = Router::new()
        .route("/api/signals", get(list_signals))
        .route("/api/signals/context", get(signal_context))
        .with_state(feed);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 16, 13, 0, 0).unwrap()
}

fn feed_store() -> Arc<SignalStore> {
    Arc::new(SignalStore::with_clock(RetentionPolicy::default(), fixed_now))
}

fn poller_for(base: &str, store: Arc<SignalStore>) -> PollingIngestionClient {
    let rest = RestClient::with_base_url(base, None, Duration::from_secs(5)).unwrap();
    PollingIngestionClient::new(Arc::new(rest), store, PollingConfig::default())
}

fn ids(store: &SignalStore) -> Vec<String> {
    store.signals().iter().map(|s| s.id.clone()).collect()
}

#[tokio::test]
async fn test_poll_and_stream_converge_on_one_store() {
    let feed = Arc::new(Feed::default());
    *feed.pages.lock() = vec![
        raw_signal("sig_b", "2025-11-16T12:00:00Z", Some(2)),
        raw_signal("sig_a", "2025-11-16T12:05:00Z", None),
    ];
    let base = spawn_feed(feed.clone()).await;
    let store = feed_store();
    let poller = poller_for(&base, store.clone());
    let buffer = StreamIngestionBuffer::new(store.clone(), StreamBufferConfig::default());

    assert_eq!(poller.poll_signals_once().await, PollOutcome::Applied(2));
    assert_eq!(ids(&store), vec!["sig_a", "sig_b"]);

    // Enrichment pushed over the stream outranks the polled context.
    buffer.handle_event(StreamEvent::SignalContext(SignalContextUpdate {
        signal_id: "sig_b".to_string(),
        context_version: 5,
        enriched_at: 1763294600,
        status: "ok".to_string(),
        context: json!({"from": "stream"}),
    }));
    assert_eq!(store.get("sig_b").unwrap().context_version, Some(5));

    // A later poll still carrying version 2 must not roll it back.
    assert_eq!(poller.poll_signals_once().await, PollOutcome::Applied(2));
    let sig_b = store.get("sig_b").unwrap();
    assert_eq!(sig_b.context_version, Some(5));
    assert_eq!(sig_b.context, Some(json!({"from": "stream"})));

    let streamed = Signal::new(
        "sig_c",
        SignalType::MarketExpiryEdge {
            hours_to_expiry: 1.0,
            volume_spike: 2.0,
        },
        0.5,
    )
    .with_market("eth-above-4k")
    .with_detected_at("2025-11-16T12:10:00Z");
    buffer.handle_event(StreamEvent::Signal(streamed));
    assert_eq!(buffer.pending_len(), 1);
    assert_eq!(store.len(), 2);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(buffer.pending_len(), 0);
    assert_eq!(ids(&store), vec!["sig_c", "sig_a", "sig_b"]);
}

#[tokio::test]
async fn test_history_and_context_hydration() {
    let feed = Arc::new(Feed::default());
    *feed.pages.lock() = vec![
        raw_signal("sig_a", "2025-11-16T12:05:00Z", None),
        raw_signal("sig_b", "2025-11-16T12:00:00Z", Some(7)),
    ];
    let base = spawn_feed(feed.clone()).await;
    let store = feed_store();
    let poller = poller_for(&base, store.clone());

    poller.poll_signals_once().await;
    assert_eq!(poller.load_older().await.unwrap(), 1);
    assert_eq!(feed.cursors.lock().last().cloned(), Some(Some("sig_b".to_string())));
    assert_eq!(ids(&store), vec!["sig_a", "sig_b", "sig_older"]);

    assert!(poller.hydrate_context("sig_a").await.unwrap());
    assert_eq!(store.get("sig_a").unwrap().context_version, Some(3));

    // Stored version 7 is newer than the hydrated 3.
    assert!(!poller.hydrate_context("sig_b").await.unwrap());
    assert_eq!(store.get("sig_b").unwrap().context_version, Some(7));
}

#[tokio::test]
async fn test_failed_poll_sets_then_clears_error() {
    let feed = Arc::new(Feed::default());
    *feed.pages.lock() = vec![raw_signal("sig_a", "2025-11-16T12:05:00Z", None)];
    let base = spawn_feed(feed).await;
    let store = feed_store();

    let broken = poller_for(&format!("{}/offline", base), store.clone());
    assert_eq!(broken.poll_signals_once().await, PollOutcome::Failed);
    let error = store.error().unwrap();
    assert!(error.starts_with("Failed to fetch signals"), "{}", error);

    let healthy = poller_for(&base, store.clone());
    assert_eq!(healthy.poll_signals_once().await, PollOutcome::Applied(1));
    assert_eq!(store.error(), None);
    assert_eq!(ids(&store), vec!["sig_a"]);
}
