use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

/// Signal types
///
/// Closed set: a payload naming any other `type` fails to decode and is
/// dropped at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalType {
    PriceDeviation {
        #[serde(default)]
        market_price: f64,
        #[serde(default)]
        fair_value: f64,
        #[serde(default)]
        deviation_pct: f64,
    },
    MarketExpiryEdge {
        #[serde(default)]
        hours_to_expiry: f64,
        #[serde(default)]
        volume_spike: f64,
    },
    WhaleFollowing {
        #[serde(default)]
        whale_address: String,
        #[serde(default)]
        position_size: f64,
        #[serde(default)]
        confidence_score: f64,
    },
    EliteWallet {
        #[serde(default)]
        wallet_address: String,
        #[serde(default)]
        win_rate: f64,
        #[serde(default)]
        total_volume: f64,
    },
    InsiderWallet {
        #[serde(default)]
        wallet_address: String,
        #[serde(default)]
        early_entry_score: f64,
        #[serde(default)]
        position_size: f64,
    },
    TrackedWalletEntry {
        #[serde(default)]
        wallet_address: String,
        #[serde(default)]
        wallet_label: String,
        #[serde(default)]
        position_value_usd: f64,
        #[serde(default)]
        order_count: u32,
        #[serde(default)]
        token_label: Option<String>,
    },
    CrossPlatformArbitrage {
        #[serde(default)]
        polymarket_price: f64,
        #[serde(default)]
        kalshi_price: Option<f64>,
        #[serde(default)]
        spread_pct: f64,
    },
}

impl SignalType {
    pub fn family(&self) -> &'static str {
        match self {
            SignalType::PriceDeviation { .. } => "price_deviation",
            SignalType::MarketExpiryEdge { .. } => "market_expiry_edge",
            SignalType::WhaleFollowing { .. } => "whale_following",
            SignalType::EliteWallet { .. } => "elite_wallet",
            SignalType::InsiderWallet { .. } => "insider_wallet",
            SignalType::TrackedWalletEntry { .. } => "tracked_wallet_entry",
            SignalType::CrossPlatformArbitrage { .. } => "cross_platform_arbitrage",
        }
    }

    /// Wallet-driven families share the "who is trading" presentation.
    pub fn is_wallet_signal(&self) -> bool {
        matches!(
            self,
            SignalType::WhaleFollowing { .. }
                | SignalType::EliteWallet { .. }
                | SignalType::InsiderWallet { .. }
                | SignalType::TrackedWalletEntry { .. }
        )
    }
}

/// Market details attached to every signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalDetails {
    #[serde(default)]
    pub market_id: String,
    #[serde(default)]
    pub market_title: String,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub volume_24h: f64,
    #[serde(default)]
    pub liquidity: f64,
    #[serde(default)]
    pub recommended_action: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub expiry_time: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub signal_family: Option<String>,
}

/// A trading signal as seen by the client, with its enrichment context
/// flattened in the same way the backend's `/api/signals` response does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub signal_type: SignalType,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub market_slug: String,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub confidence: f64,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub risk_level: String,
    #[serde(default)]
    pub details: SignalDetails,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub detected_at: String,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub source: String,
    #[serde(
        default,
        deserialize_with = "lenient::opt_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub context: Option<Value>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub context_status: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub context_version: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub context_enriched_at: Option<i64>,
}

impl Signal {
    pub fn new(id: impl Into<String>, signal_type: SignalType, confidence: f64) -> Self {
        Self {
            id: id.into(),
            signal_type,
            market_slug: String::new(),
            confidence,
            risk_level: String::new(),
            details: SignalDetails::default(),
            detected_at: Utc::now().to_rfc3339(),
            source: String::new(),
            context: None,
            context_status: None,
            context_version: None,
            context_enriched_at: None,
        }
    }

    pub fn with_market(mut self, market_slug: impl Into<String>) -> Self {
        self.market_slug = market_slug.into();
        self
    }

    pub fn with_detected_at(mut self, detected_at: impl Into<String>) -> Self {
        self.detected_at = detected_at.into();
        self
    }

    /// Context version used for arbitration; absent is older than any version.
    #[inline]
    pub fn effective_context_version(&self) -> i64 {
        self.context_version.unwrap_or(-1)
    }

    /// Parsed `detected_at`, `None` when the backend sent something unparseable.
    #[inline]
    pub fn detected_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.detected_at)
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Asynchronous enrichment pushed after the base signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContextUpdate {
    pub signal_id: String,
    pub context_version: i64,
    #[serde(default)]
    pub enriched_at: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub context: Value,
}

/// Stored context as returned by `GET /api/signals/context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalContextRecord {
    pub signal_id: String,
    pub context_version: i64,
    #[serde(default)]
    pub enriched_at: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub context: Value,
}

impl SignalContextRecord {
    pub fn into_update(self) -> SignalContextUpdate {
        SignalContextUpdate {
            signal_id: self.signal_id,
            context_version: self.context_version,
            enriched_at: self.enriched_at,
            status: self.status,
            context: self.context,
        }
    }
}

/// Response of `GET /api/signals/stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    #[serde(default)]
    pub total_signals: usize,
    #[serde(default)]
    pub high_confidence_count: usize,
    #[serde(default)]
    pub avg_confidence: f64,
    #[serde(default)]
    pub timestamp: String,
}

/// Response of `GET /api/signals`. Signals are kept raw so one malformed
/// entry cannot poison the whole page.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalListResponse {
    #[serde(default)]
    pub signals: Vec<Value>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub timestamp: String,
}

impl SignalListResponse {
    pub fn into_signals(self) -> Vec<Signal> {
        decode_signals(self.signals)
    }
}

/// Decode raw signal payloads, dropping (and logging) the ones that fail.
pub fn decode_signals(raw: Vec<Value>) -> Vec<Signal> {
    let mut signals = Vec::with_capacity(raw.len());
    for value in raw {
        match serde_json::from_value::<Signal>(value) {
            Ok(signal) => signals.push(signal),
            Err(e) => warn!(error = %e, "dropping undecodable signal"),
        }
    }
    signals
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbePayload {
    #[serde(default)]
    pub timestamp: i64,
}

/// Events pushed by the backend over `/ws`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsServerEvent {
    Signal(Signal),
    SignalContext(SignalContextUpdate),
    Pong(ProbePayload),
}

/// Messages the client sends over `/ws`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsClientMessage {
    Ping(ProbePayload),
}

/// Connection lifecycle of the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Everything the ingestion buffer consumes from a stream client.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Status(ConnectionStatus),
    Signal(Signal),
    SignalContext(SignalContextUpdate),
    /// Echo of a latency probe, carrying the send timestamp in probe-clock ms.
    Pong { timestamp_ms: i64 },
}

impl From<WsServerEvent> for StreamEvent {
    fn from(event: WsServerEvent) -> Self {
        match event {
            WsServerEvent::Signal(signal) => StreamEvent::Signal(signal),
            WsServerEvent::SignalContext(update) => StreamEvent::SignalContext(update),
            WsServerEvent::Pong(probe) => StreamEvent::Pong {
                timestamp_ms: probe.timestamp,
            },
        }
    }
}

/// Deserializers that turn wrongly-typed optional fields into `None`
/// instead of failing the whole record.
pub(crate) mod lenient {
    use super::*;

    pub fn opt_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Null => None,
            other => Some(other),
        })
    }

    pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::String(s) => Some(s),
            _ => None,
        })
    }

    pub fn opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        })
    }

    pub fn opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Number(n) => n.as_f64(),
            _ => None,
        })
    }

    pub fn string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(opt_string(deserializer)?.unwrap_or_default())
    }

    pub fn f64_or_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_decodes_with_flattened_context() {
        let raw = json!({
            "id": "dome_order_1",
            "signal_type": {"type": "TrackedWalletEntry", "wallet_address": "0xabc",
                            "wallet_label": "whale", "position_value_usd": 1200.0,
                            "order_count": 1, "token_label": "Up"},
            "market_slug": "btc-updown-15m",
            "confidence": 0.91,
            "risk_level": "medium",
            "details": {"market_title": "BTC Up or Down"},
            "detected_at": "2025-11-16T12:00:00Z",
            "source": "dome",
            "context": {"market": null},
            "context_status": "ok",
            "context_version": 3,
            "context_enriched_at": 1763294400
        });

        let signal: Signal = serde_json::from_value(raw).unwrap();
        assert_eq!(signal.id, "dome_order_1");
        assert_eq!(signal.context_version, Some(3));
        assert_eq!(signal.signal_type.family(), "tracked_wallet_entry");
        assert!(signal.signal_type.is_wallet_signal());
        assert!(signal.detected_at_utc().is_some());
    }

    #[test]
    fn test_malformed_optional_fields_are_absent() {
        let raw = json!({
            "id": "s1",
            "signal_type": {"type": "PriceDeviation", "market_price": 0.55},
            "confidence": "not a number",
            "detected_at": "yesterday-ish",
            "context": null,
            "context_status": 42,
            "context_version": {"nested": true},
            "context_enriched_at": "soon"
        });

        let signal: Signal = serde_json::from_value(raw).unwrap();
        assert_eq!(signal.confidence, 0.0);
        assert_eq!(signal.context, None);
        assert_eq!(signal.context_status, None);
        assert_eq!(signal.context_version, None);
        assert_eq!(signal.effective_context_version(), -1);
        assert_eq!(signal.context_enriched_at, None);
        assert!(signal.detected_at_utc().is_none());
    }

    #[test]
    fn test_unknown_signal_type_is_dropped_from_page() {
        let page = SignalListResponse {
            signals: vec![
                json!({"id": "ok", "signal_type": {"type": "MarketExpiryEdge"}, "confidence": 0.5}),
                json!({"id": "bad", "signal_type": {"type": "Telepathy"}, "confidence": 0.5}),
            ],
            count: 2,
            timestamp: String::new(),
        };

        let signals = page.into_signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].id, "ok");
    }

    #[test]
    fn test_ws_event_wire_format() {
        let pong: WsServerEvent =
            serde_json::from_str(r#"{"type":"pong","data":{"timestamp":1234}}"#).unwrap();
        assert!(matches!(
            StreamEvent::from(pong),
            StreamEvent::Pong { timestamp_ms: 1234 }
        ));

        let ctx: WsServerEvent = serde_json::from_str(
            r#"{"type":"signal_context","data":{"signal_id":"a","context_version":2,"enriched_at":5,"status":"ok","context":{}}}"#,
        )
        .unwrap();
        match ctx {
            WsServerEvent::SignalContext(update) => assert_eq!(update.context_version, 2),
            other => panic!("unexpected event {:?}", other),
        }

        let ping = serde_json::to_string(&WsClientMessage::Ping(ProbePayload { timestamp: 7 }))
            .unwrap();
        assert_eq!(ping, r#"{"type":"ping","data":{"timestamp":7}}"#);
    }
}
