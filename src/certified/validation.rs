//! Certified artifact validators
//!
//! Pure checks run before any backend-computed statistic is displayed.
//! Violations are reported, never corrected.

use serde::Serialize;

use super::types::{CertifiedRunFooterData, WindowPnlHistogramResponse, WINDOW_PNL_HISTOGRAM_SCHEMA_VERSION};

/// Absolute tolerance for bin edge contiguity.
pub const BIN_EDGE_TOLERANCE: f64 = 1e-10;

/// Structural violations of a window PnL histogram.
#[derive(Debug, Clone, PartialEq)]
pub enum HistogramError {
    UnsupportedSchemaVersion(String),
    MissingBins,
    BinCountMismatch {
        bins: usize,
        bin_count: usize,
    },
    /// Bin `index` does not start where bin `index - 1` ends.
    NonContiguous {
        index: usize,
        previous_right: f64,
        left: f64,
    },
    CountMismatch {
        bin_sum: u64,
        underflow: u64,
        overflow: u64,
        total_samples: u64,
    },
    MissingManifestHash,
}

impl std::fmt::Display for HistogramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedSchemaVersion(v) => write!(
                f,
                "Unsupported schema version: {} (expected {})",
                v, WINDOW_PNL_HISTOGRAM_SCHEMA_VERSION
            ),
            Self::MissingBins => write!(f, "Missing bins array"),
            Self::BinCountMismatch { bins, bin_count } => write!(
                f,
                "Bin count mismatch: {} bins but binning.bin_count = {}",
                bins, bin_count
            ),
            Self::NonContiguous {
                index,
                previous_right,
                left,
            } => write!(
                f,
                "Bins are not contiguous at index {}: {} != {}",
                index, previous_right, left
            ),
            Self::CountMismatch {
                bin_sum,
                underflow,
                overflow,
                total_samples,
            } => write!(
                f,
                "Count mismatch: bins({}) + underflow({}) + overflow({}) = {} != total_samples({})",
                bin_sum,
                underflow,
                overflow,
                bin_sum.saturating_add(*underflow).saturating_add(*overflow),
                total_samples
            ),
            Self::MissingManifestHash => write!(f, "Missing manifest hash"),
        }
    }
}

impl std::error::Error for HistogramError {}

/// Check a histogram against its structural invariants, first failure wins.
pub fn validate_window_pnl_histogram(hist: &WindowPnlHistogramResponse) -> Result<(), HistogramError> {
    if hist.schema_version != WINDOW_PNL_HISTOGRAM_SCHEMA_VERSION {
        return Err(HistogramError::UnsupportedSchemaVersion(
            hist.schema_version.clone(),
        ));
    }

    let bins = hist.bins.as_ref().ok_or(HistogramError::MissingBins)?;

    if bins.len() != hist.binning.bin_count {
        return Err(HistogramError::BinCountMismatch {
            bins: bins.len(),
            bin_count: hist.binning.bin_count,
        });
    }

    for (i, pair) in bins.windows(2).enumerate() {
        let gap = (pair[0].right - pair[1].left).abs();
        if gap.is_nan() || gap > BIN_EDGE_TOLERANCE {
            return Err(HistogramError::NonContiguous {
                index: i + 1,
                previous_right: pair[0].right,
                left: pair[1].left,
            });
        }
    }

    let bin_sum = bins.iter().fold(0u64, |acc, b| acc.saturating_add(b.count));
    let observed = bin_sum
        .saturating_add(hist.underflow_count)
        .saturating_add(hist.overflow_count);
    if observed != hist.total_samples {
        return Err(HistogramError::CountMismatch {
            bin_sum,
            underflow: hist.underflow_count,
            overflow: hist.overflow_count,
            total_samples: hist.total_samples,
        });
    }

    if hist.manifest_hash.trim().is_empty() {
        return Err(HistogramError::MissingManifestHash);
    }

    Ok(())
}

/// `None` when valid, otherwise the human-readable violation.
pub fn histogram_violation(hist: &WindowPnlHistogramResponse) -> Option<String> {
    validate_window_pnl_histogram(hist).err().map(|e| e.to_string())
}

/// Mandatory footer fields, in reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FooterField {
    RunId,
    PublishTimestamp,
    SchemaVersion,
    ManifestHash,
}

impl FooterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            FooterField::RunId => "run_id",
            FooterField::PublishTimestamp => "publish_timestamp",
            FooterField::SchemaVersion => "schema_version",
            FooterField::ManifestHash => "manifest_hash",
        }
    }
}

impl std::fmt::Display for FooterField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FooterValidation {
    pub is_valid: bool,
    pub missing_fields: Vec<FooterField>,
}

/// Every field is checked independently; all missing ones are reported.
pub fn validate_footer_fields(footer: &CertifiedRunFooterData) -> FooterValidation {
    fn blank(value: &Option<String>) -> bool {
        value.as_deref().map_or(true, |s| s.trim().is_empty())
    }

    let mut missing_fields = Vec::with_capacity(4);
    if blank(&footer.run_id) {
        missing_fields.push(FooterField::RunId);
    }
    if footer.publish_timestamp.is_none() {
        missing_fields.push(FooterField::PublishTimestamp);
    }
    if blank(&footer.schema_version) {
        missing_fields.push(FooterField::SchemaVersion);
    }
    if blank(&footer.manifest_hash) {
        missing_fields.push(FooterField::ManifestHash);
    }

    FooterValidation {
        is_valid: missing_fields.is_empty(),
        missing_fields,
    }
}
