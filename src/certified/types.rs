//! Certified run artifact types
//!
//! Client-side mirrors of the backend's published run artifacts. Decoding is
//! lenient: a missing or wrongly-typed provenance field becomes absent, and
//! the validators decide whether the artifact may be shown.

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::models::lenient;

/// Only histogram schema this client understands.
pub const WINDOW_PNL_HISTOGRAM_SCHEMA_VERSION: &str = "v1";

// =============================================================================
// TRUST LEVEL
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum TrustStatus {
    Trusted,
    Untrusted,
    Bypassed,
    Unknown,
    NonRepresentative,
}

/// Structured trust level as published with every artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustLevelDto {
    pub status: TrustStatus,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl Default for TrustLevelDto {
    fn default() -> Self {
        Self {
            status: TrustStatus::Unknown,
            reasons: Vec::new(),
        }
    }
}

impl TrustLevelDto {
    pub fn is_trusted(&self) -> bool {
        self.status == TrustStatus::Trusted
    }
}

/// Accepts both the structured object and the legacy string form
/// (`"Trusted"`, `"Untrusted { reasons: [...] }"`, `"Bypassed"`).
pub fn deserialize_trust_level<'de, D>(deserializer: D) -> Result<TrustLevelDto, D::Error>
where
    D: Deserializer<'de>,
{
    struct TrustLevelVisitor;

    impl<'de> de::Visitor<'de> for TrustLevelVisitor {
        type Value = TrustLevelDto;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a trust level object or a legacy string")
        }

        fn visit_str<E>(self, value: &str) -> Result<TrustLevelDto, E>
        where
            E: de::Error,
        {
            let value = value.trim();
            let status = match value {
                "Trusted" => TrustStatus::Trusted,
                "Bypassed" => TrustStatus::Bypassed,
                "NonRepresentative" => TrustStatus::NonRepresentative,
                v if v.starts_with("Untrusted") => TrustStatus::Untrusted,
                _ => TrustStatus::Unknown,
            };
            let reasons = match (value.find('['), value.rfind(']')) {
                (Some(start), Some(end)) if status == TrustStatus::Untrusted && start < end => {
                    value[start + 1..end]
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                }
                _ => Vec::new(),
            };
            Ok(TrustLevelDto { status, reasons })
        }

        fn visit_unit<E>(self) -> Result<TrustLevelDto, E>
        where
            E: de::Error,
        {
            Ok(TrustLevelDto::default())
        }

        fn visit_map<M>(self, map: M) -> Result<TrustLevelDto, M::Error>
        where
            M: de::MapAccess<'de>,
        {
            TrustLevelDto::deserialize(de::value::MapAccessDeserializer::new(map))
        }
    }

    deserializer.deserialize_any(TrustLevelVisitor)
}

// =============================================================================
// ARTIFACT ENVELOPE
// =============================================================================

/// Disclaimer that must be displayed alongside results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disclaimer {
    pub code: String,
    /// "info", "warning" or "danger".
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires_acknowledgment: bool,
}

/// Provenance block set at publication time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceBlock {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub schema_version: Option<String>,
    /// Unix seconds.
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub publish_timestamp: Option<i64>,
    #[serde(default)]
    pub dataset_version_id: String,
    #[serde(default)]
    pub dataset_readiness: String,
    #[serde(default)]
    pub settlement_source: String,
    #[serde(default)]
    pub integrity_policy: String,
    #[serde(default)]
    pub strategy_code_hash: String,
    #[serde(default)]
    pub fingerprint_hash: String,
}

/// Envelope wrapping every published run endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactResponse<T> {
    #[serde(default)]
    pub api_version: String,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub run_id: String,
    #[serde(default)]
    pub fingerprint_hash: String,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub manifest_hash: String,
    #[serde(default, deserialize_with = "deserialize_trust_level")]
    pub trust_level: TrustLevelDto,
    #[serde(default)]
    pub is_trusted: bool,
    #[serde(default)]
    pub disclaimers: Vec<Disclaimer>,
    #[serde(default)]
    pub provenance: ProvenanceBlock,
    pub data: T,
}

impl<T> ArtifactResponse<T> {
    /// Disclaimers the user must acknowledge before acting on results.
    pub fn blocking_disclaimers(&self) -> impl Iterator<Item = &Disclaimer> {
        self.disclaimers.iter().filter(|d| d.requires_acknowledgment)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyIdDto {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_hash: Option<String>,
}

/// Run summary payload (`data` of the summary endpoint).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub persisted_at: i64,
    #[serde(default)]
    pub strategy_id: StrategyIdDto,
    #[serde(default)]
    pub final_pnl: f64,
    #[serde(default)]
    pub total_fills: u64,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub sharpe_ratio: Option<f64>,
    #[serde(default)]
    pub max_drawdown: f64,
    #[serde(default)]
    pub win_rate: f64,
    #[serde(default, deserialize_with = "deserialize_trust_level")]
    pub trust_level: TrustLevelDto,
    #[serde(default)]
    pub is_trusted: bool,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub is_certified: bool,
    #[serde(default)]
    pub production_grade: bool,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub dataset_readiness: String,
    #[serde(default)]
    pub fingerprint_hash: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub manifest_hash: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub schema_version: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub publish_timestamp: Option<i64>,
}

pub type RunSummaryResponse = ArtifactResponse<RunSummary>;

// =============================================================================
// WINDOW PNL HISTOGRAM
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinningMethod {
    #[default]
    FixedEdges,
    BackendV1,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinningConfig {
    #[serde(default)]
    pub method: BinningMethod,
    #[serde(default)]
    pub bin_count: usize,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

/// One bin; `left` inclusive, `right` exclusive except for the last bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub left: f64,
    pub right: f64,
    pub count: u64,
}

/// Response of `GET /api/runs/{run_id}/distribution/window_pnl`.
///
/// Bins are backend-computed and never recomputed here; see
/// [`validate_window_pnl_histogram`](super::validation::validate_window_pnl_histogram).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowPnlHistogramResponse {
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub schema_version: String,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub run_id: String,
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub manifest_hash: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub binning: BinningConfig,
    /// `None` when the backend omitted the array or sent `null`.
    #[serde(default)]
    pub bins: Option<Vec<HistogramBin>>,
    #[serde(default)]
    pub underflow_count: u64,
    #[serde(default)]
    pub overflow_count: u64,
    #[serde(default)]
    pub total_samples: u64,
    #[serde(default, deserialize_with = "deserialize_trust_level")]
    pub trust_level: TrustLevelDto,
    #[serde(default)]
    pub is_trusted: bool,
}

// =============================================================================
// FOOTER
// =============================================================================

/// Provenance fields that must all be present before a certified run is shown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertifiedRunFooterData {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub run_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub publish_timestamp: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub schema_version: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub manifest_hash: Option<String>,
}

impl CertifiedRunFooterData {
    /// Footer for a run summary. Summary fields win; the envelope and its
    /// provenance block fill gaps.
    pub fn from_summary(response: &RunSummaryResponse) -> Self {
        let summary = &response.data;
        let non_empty = |s: &str| Some(s.to_string()).filter(|s| !s.trim().is_empty());
        Self {
            run_id: summary
                .run_id
                .clone()
                .or_else(|| non_empty(&response.run_id)),
            publish_timestamp: summary
                .publish_timestamp
                .or(response.provenance.publish_timestamp),
            schema_version: summary
                .schema_version
                .clone()
                .or_else(|| response.provenance.schema_version.clone()),
            manifest_hash: summary
                .manifest_hash
                .clone()
                .or_else(|| non_empty(&response.manifest_hash)),
        }
    }
}

// =============================================================================
// CACHEABLE PAYLOADS
// =============================================================================

/// Identity metadata carried inside a certified payload.
pub trait CertifiedPayload {
    fn manifest_hash(&self) -> Option<&str>;

    fn publish_timestamp(&self) -> Option<i64> {
        None
    }
}

impl<T> CertifiedPayload for ArtifactResponse<T> {
    fn manifest_hash(&self) -> Option<&str> {
        Some(self.manifest_hash.as_str()).filter(|h| !h.is_empty())
    }

    fn publish_timestamp(&self) -> Option<i64> {
        self.provenance.publish_timestamp
    }
}

impl CertifiedPayload for WindowPnlHistogramResponse {
    fn manifest_hash(&self) -> Option<&str> {
        Some(self.manifest_hash.as_str()).filter(|h| !h.is_empty())
    }
}

/// Published run endpoints served through the artifact cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactEndpoint {
    Summary,
    WindowPnlHistogram,
}

impl ArtifactEndpoint {
    /// Request path relative to the API base URL.
    pub fn path(&self, run_id: &str) -> String {
        match self {
            ArtifactEndpoint::Summary => format!("/api/public/v2/backtest/runs/{}", run_id),
            ArtifactEndpoint::WindowPnlHistogram => {
                format!("/api/runs/{}/distribution/window_pnl", run_id)
            }
        }
    }
}
