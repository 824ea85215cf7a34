//! Signal merge rules
//!
//! Pure functions shared by every path that writes into the store:
//! context-version arbitration between two observations of the same signal,
//! application of asynchronous enrichment, and the canonical display order.

use std::cmp::{Ordering, Reverse};

use chrono::{DateTime, Utc};

use crate::models::{Signal, SignalContextUpdate};

/// Merge an incoming observation of a signal into the existing record.
///
/// Base fields always come from `incoming`. The context block
/// (`context`, `context_status`, `context_version`, `context_enriched_at`)
/// comes from whichever side has the strictly greater context version, with
/// absent versions treated as -1. On a tie the incoming side wins.
pub fn merge_signal(existing: &Signal, incoming: Signal) -> Signal {
    if existing.effective_context_version() > incoming.effective_context_version() {
        Signal {
            context: existing.context.clone(),
            context_status: existing.context_status.clone(),
            context_version: existing.context_version,
            context_enriched_at: existing.context_enriched_at,
            ..incoming
        }
    } else {
        incoming
    }
}

/// Apply an enrichment update unconditionally.
///
/// Updates are produced by the backend after the base signal was stored, so
/// they are treated as newer than whatever context the record carries.
pub fn apply_context_update(signal: &mut Signal, update: SignalContextUpdate) {
    signal.context = if update.context.is_null() {
        None
    } else {
        Some(update.context)
    };
    signal.context_status = Some(update.status);
    signal.context_version = Some(update.context_version);
    signal.context_enriched_at = Some(update.enriched_at);
}

/// Sort key: newest `detected_at` first, then ascending id.
///
/// Unparseable timestamps sort after every parseable one.
#[inline]
fn display_key(signal: &Signal) -> (Reverse<Option<DateTime<Utc>>>, String) {
    (Reverse(signal.detected_at_utc()), signal.id.clone())
}

/// Total display order used by the store.
pub fn compare_newest_first(a: &Signal, b: &Signal) -> Ordering {
    Reverse(a.detected_at_utc())
        .cmp(&Reverse(b.detected_at_utc()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort a working set into display order.
pub fn sort_newest_first(signals: &mut [Signal]) {
    signals.sort_by_cached_key(display_key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalType;
    use serde_json::json;

    fn signal(id: &str, detected_at: &str) -> Signal {
        Signal::new(
            id,
            SignalType::PriceDeviation {
                market_price: 0.55,
                fair_value: 0.50,
                deviation_pct: 10.0,
            },
            0.8,
        )
        .with_detected_at(detected_at)
    }

    fn with_context(mut s: Signal, version: i64, marker: &str) -> Signal {
        s.context = Some(json!({ "marker": marker }));
        s.context_status = Some("ok".to_string());
        s.context_version = Some(version);
        s.context_enriched_at = Some(version * 10);
        s
    }

    #[test]
    fn test_newer_existing_context_survives_stale_payload() {
        let existing = with_context(signal("a", "2025-11-16T12:00:00Z"), 3, "enriched");
        let mut incoming = with_context(signal("a", "2025-11-16T12:00:00Z"), 1, "stale");
        incoming.confidence = 0.95;

        let merged = merge_signal(&existing, incoming);
        assert_eq!(merged.context_version, Some(3));
        assert_eq!(merged.context, Some(json!({ "marker": "enriched" })));
        assert_eq!(merged.context_enriched_at, Some(30));
        // Base fields always follow the incoming record.
        assert_eq!(merged.confidence, 0.95);
    }

    #[test]
    fn test_incoming_context_hydrates_bare_signal() {
        let existing = signal("a", "2025-11-16T12:00:00Z");
        let incoming = with_context(signal("a", "2025-11-16T12:00:00Z"), 0, "rest");

        let merged = merge_signal(&existing, incoming);
        assert_eq!(merged.context_version, Some(0));
        assert_eq!(merged.context, Some(json!({ "marker": "rest" })));
    }

    #[test]
    fn test_context_version_tie_prefers_incoming() {
        let existing = with_context(signal("a", "2025-11-16T12:00:00Z"), 2, "old");
        let incoming = with_context(signal("a", "2025-11-16T12:00:00Z"), 2, "new");

        let merged = merge_signal(&existing, incoming);
        assert_eq!(merged.context, Some(json!({ "marker": "new" })));
    }

    #[test]
    fn test_absent_versions_tie_toward_incoming() {
        let mut existing = signal("a", "2025-11-16T12:00:00Z");
        existing.context_status = Some("pending".to_string());
        let incoming = signal("a", "2025-11-16T12:00:00Z");

        let merged = merge_signal(&existing, incoming);
        assert_eq!(merged.context_status, None);
    }

    #[test]
    fn test_apply_context_update_overrides_regardless_of_version() {
        let mut s = with_context(signal("a", "2025-11-16T12:00:00Z"), 5, "five");
        apply_context_update(
            &mut s,
            SignalContextUpdate {
                signal_id: "a".to_string(),
                context_version: 2,
                enriched_at: 99,
                status: "partial".to_string(),
                context: json!({ "marker": "two" }),
            },
        );

        assert_eq!(s.context_version, Some(2));
        assert_eq!(s.context_status.as_deref(), Some("partial"));
        assert_eq!(s.context_enriched_at, Some(99));
        assert_eq!(s.context, Some(json!({ "marker": "two" })));
    }

    #[test]
    fn test_display_order() {
        let mut signals = vec![
            signal("c", "2025-11-16T11:59:00Z"),
            signal("garbage", "not-a-date"),
            signal("b", "2025-11-16T12:00:00Z"),
            signal("a", "2025-11-16T13:00:00+01:00"),
        ];
        sort_newest_first(&mut signals);

        let ids: Vec<_> = signals.iter().map(|s| s.id.as_str()).collect();
        // "a" and "b" are the same instant once offsets are applied.
        assert_eq!(ids, vec!["a", "b", "c", "garbage"]);
        assert_eq!(compare_newest_first(&signals[0], &signals[1]), Ordering::Less);
    }
}
