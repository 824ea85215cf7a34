//! Certified run consumer
//!
//! Drives one [`ArtifactCache`] on behalf of a view and owns the render
//! gate. Metrics are only exposed once a payload with a manifest hash has
//! passed validation; anything else is `Loading` or `Unavailable`.
//!
//! Each loader tracks the run id it was last asked for plus a generation
//! token. A fetch that resolves for an older request, or after `unmount`,
//! is dropped without touching the view.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::cache::{ArtifactCache, ArtifactMeta, FetchOptions, MismatchInfo, TokenSource};
use super::types::{
    CertifiedPayload, CertifiedRunFooterData, RunSummaryResponse, WindowPnlHistogramResponse,
};
use super::validation::{validate_footer_fields, validate_window_pnl_histogram};

pub type PayloadValidator<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum RenderGate {
    Loading,
    Ready,
    Unavailable { reason: String, retryable: bool },
}

impl RenderGate {
    pub fn is_ready(&self) -> bool {
        matches!(self, RenderGate::Ready)
    }
}

/// What the view may render. `data` is `Some` only when the gate is `Ready`.
#[derive(Debug, Clone)]
pub struct RunView<T> {
    pub run_id: Option<String>,
    pub data: Option<T>,
    pub meta: Option<ArtifactMeta>,
    pub gate: RenderGate,
    pub from_cache: bool,
    pub not_modified: bool,
    pub mismatch: Option<MismatchInfo>,
    /// Bumped on every applied change; a mismatch always bumps it.
    pub revision: u64,
}

impl<T> Default for RunView<T> {
    fn default() -> Self {
        Self {
            run_id: None,
            data: None,
            meta: None,
            gate: RenderGate::Loading,
            from_cache: false,
            not_modified: false,
            mismatch: None,
            revision: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The result was written to the view.
    Applied,
    /// A fetch for the same run was already outstanding.
    Deduplicated,
    /// A newer request superseded this one.
    Discarded,
    /// The loader was unmounted.
    Unmounted,
}

struct LoaderState<T> {
    mounted: bool,
    current_run: Option<String>,
    in_flight: Option<String>,
    generation: u64,
    view: RunView<T>,
}

pub struct CertifiedRunLoader<T> {
    cache: Arc<ArtifactCache<T>>,
    tokens: Arc<dyn TokenSource>,
    validator: Option<PayloadValidator<T>>,
    state: Mutex<LoaderState<T>>,
}

impl<T> CertifiedRunLoader<T>
where
    T: CertifiedPayload + DeserializeOwned + Clone + Send,
{
    pub fn new(cache: Arc<ArtifactCache<T>>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            cache,
            tokens,
            validator: None,
            state: Mutex::new(LoaderState {
                mounted: true,
                current_run: None,
                in_flight: None,
                generation: 0,
                view: RunView::default(),
            }),
        }
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn view(&self) -> RunView<T> {
        self.state.lock().view.clone()
    }

    pub fn current_run(&self) -> Option<String> {
        self.state.lock().current_run.clone()
    }

    pub async fn load(&self, run_id: &str) -> LoadOutcome {
        self.load_with(run_id, FetchOptions::default()).await
    }

    /// Re-request the current run after a failure.
    pub async fn retry(&self) -> Option<LoadOutcome> {
        let run_id = self.current_run()?;
        Some(self.load_with(&run_id, FetchOptions::default()).await)
    }

    /// Conditional refetch of the current run, bypassing the cache hit path.
    pub async fn refresh(&self) -> Option<LoadOutcome> {
        let run_id = self.current_run()?;
        Some(self.load_with(&run_id, FetchOptions::force()).await)
    }

    /// Drop cached entries of the current run and fetch it from scratch.
    pub async fn invalidate(&self) -> Option<LoadOutcome> {
        let run_id = self.current_run()?;
        self.cache.clear_cache(&run_id);
        Some(self.load_with(&run_id, FetchOptions::default()).await)
    }

    /// Stop accepting results; pending fetches resolve as `Unmounted`.
    pub fn unmount(&self) {
        let mut state = self.state.lock();
        state.mounted = false;
        state.in_flight = None;
    }

    async fn load_with(&self, run_id: &str, options: FetchOptions) -> LoadOutcome {
        let generation = {
            let mut state = self.state.lock();
            if !state.mounted {
                return LoadOutcome::Unmounted;
            }
            if state.in_flight.as_deref() == Some(run_id) {
                debug!(run_id, "certified run fetch already in flight");
                return LoadOutcome::Deduplicated;
            }

            state.generation += 1;
            state.current_run = Some(run_id.to_string());
            state.in_flight = Some(run_id.to_string());
            if state.view.run_id.as_deref() != Some(run_id) {
                state.view = RunView {
                    run_id: Some(run_id.to_string()),
                    revision: state.view.revision + 1,
                    ..RunView::default()
                };
            }
            state.generation
        };

        let result = self.cache.fetch(run_id, self.tokens.as_ref(), options).await;

        let mut state = self.state.lock();
        if state.generation == generation {
            state.in_flight = None;
        }
        if !state.mounted {
            return LoadOutcome::Unmounted;
        }
        if state.generation != generation || state.current_run.as_deref() != Some(run_id) {
            debug!(run_id, "discarding stale certified run result");
            return LoadOutcome::Discarded;
        }

        let view = &mut state.view;
        view.revision += 1;
        match result {
            Ok(outcome) => {
                view.from_cache = outcome.from_cache;
                view.not_modified = outcome.not_modified;
                view.mismatch = outcome.mismatch;

                match self.check(&outcome.data, &outcome.meta) {
                    Ok(()) => {
                        view.data = Some(outcome.data);
                        view.gate = RenderGate::Ready;
                    }
                    Err(reason) => {
                        warn!(run_id, %reason, "certified run failed validation");
                        view.data = None;
                        view.gate = RenderGate::Unavailable {
                            reason,
                            retryable: false,
                        };
                    }
                }
                view.meta = Some(outcome.meta);
            }
            Err(e) => {
                warn!(run_id, error = %e, "certified run fetch failed");
                view.data = None;
                view.gate = RenderGate::Unavailable {
                    reason: e.to_string(),
                    retryable: true,
                };
            }
        }
        LoadOutcome::Applied
    }

    fn check(&self, data: &T, meta: &ArtifactMeta) -> Result<(), String> {
        if !meta.has_manifest_hash() {
            return Err("Missing manifest hash".to_string());
        }
        match &self.validator {
            Some(validator) => validator(data),
            None => Ok(()),
        }
    }
}

/// Loader for run summaries; every footer field must be present.
pub fn summary_loader(
    cache: Arc<ArtifactCache<RunSummaryResponse>>,
    tokens: Arc<dyn TokenSource>,
) -> CertifiedRunLoader<RunSummaryResponse> {
    CertifiedRunLoader::new(cache, tokens).with_validator(|summary| {
        let footer = validate_footer_fields(&CertifiedRunFooterData::from_summary(summary));
        if footer.is_valid {
            return Ok(());
        }
        let missing: Vec<&str> = footer.missing_fields.iter().map(|f| f.as_str()).collect();
        Err(format!("Missing provenance fields: {}", missing.join(", ")))
    })
}

/// Loader for the window PnL histogram.
pub fn window_pnl_loader(
    cache: Arc<ArtifactCache<WindowPnlHistogramResponse>>,
    tokens: Arc<dyn TokenSource>,
) -> CertifiedRunLoader<WindowPnlHistogramResponse> {
    CertifiedRunLoader::new(cache, tokens)
        .with_validator(|hist| validate_window_pnl_histogram(hist).map_err(|e| e.to_string()))
}
