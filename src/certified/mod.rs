//! Certified run artifacts: types, validators, cache and the consumer that
//! gates rendering on them.

pub mod cache;
pub mod loader;
pub mod types;
pub mod validation;

pub use cache::{
    ArtifactCache, ArtifactFetchError, ArtifactMeta, CacheEntry, CacheKey, CachePersistence,
    FetchOptions, FetchOutcome, JsonFilePersistence, MemoryPersistence, MismatchField,
    MismatchInfo, StaticToken, TokenSource,
};
pub use loader::{
    summary_loader, window_pnl_loader, CertifiedRunLoader, LoadOutcome, RenderGate, RunView,
};
pub use types::{
    ArtifactEndpoint, ArtifactResponse, CertifiedRunFooterData, RunSummary, RunSummaryResponse,
    TrustLevelDto, TrustStatus, WindowPnlHistogramResponse,
};
pub use validation::{
    histogram_violation, validate_footer_fields, validate_window_pnl_histogram, FooterField,
    FooterValidation, HistogramError,
};
