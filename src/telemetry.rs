//! Tracing setup and metric names
//!
//! The library only records through the `metrics` facade; installing an
//! exporter is left to the embedding application.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Round-trip time of the last stream latency probe, in milliseconds.
pub const STREAM_RTT_MS: &str = "betterbot_client_stream_rtt_ms";
/// Signals delivered to the store by coalesced stream flushes.
pub const SIGNALS_FLUSHED_TOTAL: &str = "betterbot_client_signals_flushed_total";
/// Current number of signals held by the store.
pub const SIGNAL_STORE_SIZE: &str = "betterbot_client_signal_store_size";
/// Artifact identity mismatches detected between cache generations.
pub const ARTIFACT_MISMATCH_TOTAL: &str = "betterbot_client_artifact_mismatch_total";
/// Signal polls skipped because the previous one was still outstanding.
pub const POLL_SKIPPED_TOTAL: &str = "betterbot_client_poll_skipped_total";

pub const DEFAULT_LOG_FILTER: &str = "betterbot_client=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
