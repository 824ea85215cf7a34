//! Certified Artifact Cache
//!
//! Per-run cache of published artifacts with conditional refetch:
//! - hit without `force_refresh` => cached payload, no network
//! - otherwise `If-None-Match` with the cached ETag; 304 reuses the payload
//! - identity metadata (ETag, manifest hash, publish timestamp) of a published
//!   run never changes, so any disagreement between cache generations is
//!   reported as a [`MismatchInfo`]
//!
//! Entries live behind a [`CachePersistence`] port so they outlive any single
//! consumer. The default is per-process memory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::types::{ArtifactEndpoint, CertifiedPayload};
use crate::api::rest::{ArtifactApi, ArtifactRequest, ConditionalResponse};
use crate::telemetry::ARTIFACT_MISMATCH_TOTAL;

// =============================================================================
// META / ENTRIES
// =============================================================================

/// Identity of one cached artifact generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub etag: Option<String>,
    pub manifest_hash: Option<String>,
    /// Unix seconds, as published.
    pub publish_timestamp: Option<i64>,
    /// When this generation was last confirmed by the backend.
    pub cached_at: DateTime<Utc>,
}

impl ArtifactMeta {
    /// A manifest hash is the minimum proof that the payload is a published run.
    pub fn has_manifest_hash(&self) -> bool {
        self.manifest_hash
            .as_deref()
            .map_or(false, |h| !h.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub run_id: String,
    pub path: String,
}

impl CacheKey {
    pub fn new(run_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            path: path.into(),
        }
    }
}

/// Persisted form of an entry; the payload is kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: Value,
    pub meta: ArtifactMeta,
    /// When the payload body was last downloaded.
    pub fetched_at: DateTime<Utc>,
}

// =============================================================================
// PERSISTENCE
// =============================================================================

pub trait CachePersistence: Send + Sync {
    fn load(&self, key: &CacheKey) -> Option<CacheEntry>;

    fn store(&self, key: CacheKey, entry: CacheEntry) -> Result<()>;

    /// Every entry of `run_id`, across endpoints.
    fn run_entries(&self, run_id: &str) -> Vec<(CacheKey, CacheEntry)>;

    /// Drop every entry of `run_id`; returns how many were removed.
    fn remove_run(&self, run_id: &str) -> Result<usize>;
}

/// Entries held for the life of the process.
#[derive(Default)]
pub struct MemoryPersistence {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CachePersistence for MemoryPersistence {
    fn load(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    fn store(&self, key: CacheKey, entry: CacheEntry) -> Result<()> {
        self.entries.lock().insert(key, entry);
        Ok(())
    }

    fn run_entries(&self, run_id: &str) -> Vec<(CacheKey, CacheEntry)> {
        entries_of_run(&self.entries.lock(), run_id)
    }

    fn remove_run(&self, run_id: &str) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| k.run_id != run_id);
        Ok(before - entries.len())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    key: CacheKey,
    entry: CacheEntry,
}

/// Entries mirrored to a single JSON file, rewritten atomically on change.
pub struct JsonFilePersistence {
    path: PathBuf,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl JsonFilePersistence {
    /// Open (or start) a cache file. A missing file is an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read cache file {:?}", path))?;
            let records: Vec<StoredRecord> = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse cache file {:?}", path))?;
            records.into_iter().map(|r| (r.key, r.entry)).collect()
        } else {
            HashMap::new()
        };

        debug!(path = ?path, entries = entries.len(), "artifact cache file opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<CacheKey, CacheEntry>) -> Result<()> {
        let mut records: Vec<StoredRecord> = entries
            .iter()
            .map(|(key, entry)| StoredRecord {
                key: key.clone(),
                entry: entry.clone(),
            })
            .collect();
        records.sort_by(|a, b| {
            (a.key.run_id.as_str(), a.key.path.as_str())
                .cmp(&(b.key.run_id.as_str(), b.key.path.as_str()))
        });
        let content =
            serde_json::to_vec_pretty(&records).context("Failed to serialize artifact cache")?;
        write_atomic(&self.path, &content)
    }
}

impl CachePersistence for JsonFilePersistence {
    fn load(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    fn store(&self, key: CacheKey, entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(key, entry);
        self.flush(&entries)
    }

    fn run_entries(&self, run_id: &str) -> Vec<(CacheKey, CacheEntry)> {
        entries_of_run(&self.entries.lock(), run_id)
    }

    fn remove_run(&self, run_id: &str) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| k.run_id != run_id);
        let removed = before - entries.len();
        if removed > 0 {
            self.flush(&entries)?;
        }
        Ok(removed)
    }
}

fn entries_of_run(
    entries: &HashMap<CacheKey, CacheEntry>,
    run_id: &str,
) -> Vec<(CacheKey, CacheEntry)> {
    entries
        .iter()
        .filter(|(k, _)| k.run_id == run_id)
        .map(|(k, e)| (k.clone(), e.clone()))
        .collect()
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(content)
            .with_context(|| format!("Failed to write temp file {:?}", temp_path))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush temp file {:?}", temp_path))?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))
}

// =============================================================================
// TOKENS
// =============================================================================

/// Supplies the bearer token for a fetch; `None` means anonymous.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl StaticToken {
    pub fn anonymous() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

// =============================================================================
// ERRORS / OUTCOMES
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactFetchError {
    /// The request never produced a response.
    Transport(String),
    /// Non-success, non-304 status.
    Status { status: u16, message: String },
    /// Body could not be decoded into the expected payload.
    Decode(String),
    /// 304 for an artifact this cache has never stored.
    UnexpectedNotModified { run_id: String },
}

impl ArtifactFetchError {
    /// Whether retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::UnexpectedNotModified { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) => false,
        }
    }
}

impl std::fmt::Display for ArtifactFetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Status { message, .. } => write!(f, "{}", message),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::UnexpectedNotModified { run_id } => {
                write!(f, "304 Not Modified for uncached run {}", run_id)
            }
        }
    }
}

impl std::error::Error for ArtifactFetchError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchField {
    Etag,
    ManifestHash,
    PublishTimestamp,
}

/// Two generations of the same published artifact disagree on identity.
#[derive(Debug, Clone, PartialEq)]
pub struct MismatchInfo {
    pub run_id: String,
    pub path: String,
    pub fields: Vec<MismatchField>,
    pub previous: ArtifactMeta,
    pub current: ArtifactMeta,
}

impl std::fmt::Display for MismatchInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "artifact {} ({}) changed:", self.run_id, self.path)?;
        for field in &self.fields {
            match field {
                MismatchField::Etag => {
                    write!(f, " etag {:?} -> {:?}", self.previous.etag, self.current.etag)?
                }
                MismatchField::ManifestHash => write!(
                    f,
                    " manifest_hash {:?} -> {:?}",
                    self.previous.manifest_hash, self.current.manifest_hash
                )?,
                MismatchField::PublishTimestamp => write!(
                    f,
                    " publish_timestamp {:?} -> {:?}",
                    self.previous.publish_timestamp, self.current.publish_timestamp
                )?,
            }
        }
        Ok(())
    }
}

/// Compare two generations. ETags and publish timestamps are compared only
/// when both sides carry one; manifest hashes are always compared.
pub fn detect_mismatch(previous: &ArtifactMeta, current: &ArtifactMeta) -> Vec<MismatchField> {
    let mut fields = Vec::new();
    if let (Some(a), Some(b)) = (&previous.etag, &current.etag) {
        if a != b {
            fields.push(MismatchField::Etag);
        }
    }
    if previous.manifest_hash != current.manifest_hash {
        fields.push(MismatchField::ManifestHash);
    }
    if let (Some(a), Some(b)) = (previous.publish_timestamp, current.publish_timestamp) {
        if a != b {
            fields.push(MismatchField::PublishTimestamp);
        }
    }
    fields
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub force_refresh: bool,
}

impl FetchOptions {
    pub fn force() -> Self {
        Self {
            force_refresh: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOutcome<T> {
    pub data: T,
    pub meta: ArtifactMeta,
    /// Served without touching the network.
    pub from_cache: bool,
    /// Backend confirmed the cached copy with a 304.
    pub not_modified: bool,
    pub mismatch: Option<MismatchInfo>,
}

pub type MismatchCallback = Arc<dyn Fn(&MismatchInfo) + Send + Sync>;

// =============================================================================
// CACHE
// =============================================================================

/// Cache of one artifact endpoint, typed by its payload.
pub struct ArtifactCache<T> {
    api: Arc<dyn ArtifactApi>,
    endpoint: ArtifactEndpoint,
    persistence: Arc<dyn CachePersistence>,
    on_mismatch: Option<MismatchCallback>,
    clock: fn() -> DateTime<Utc>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> ArtifactCache<T>
where
    T: CertifiedPayload + DeserializeOwned + Send,
{
    pub fn new(
        api: Arc<dyn ArtifactApi>,
        endpoint: ArtifactEndpoint,
        persistence: Arc<dyn CachePersistence>,
    ) -> Self {
        Self {
            api,
            endpoint,
            persistence,
            on_mismatch: None,
            clock: Utc::now,
            _payload: PhantomData,
        }
    }

    /// Invoked synchronously for every detected mismatch.
    pub fn with_mismatch_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MismatchInfo) + Send + Sync + 'static,
    {
        self.on_mismatch = Some(Arc::new(callback));
        self
    }

    pub fn endpoint(&self) -> ArtifactEndpoint {
        self.endpoint
    }

    pub fn key(&self, run_id: &str) -> CacheKey {
        CacheKey::new(run_id, self.endpoint.path(run_id))
    }

    /// Cached meta for `run_id`, if any.
    pub fn cached_meta(&self, run_id: &str) -> Option<ArtifactMeta> {
        self.persistence.load(&self.key(run_id)).map(|e| e.meta)
    }

    pub async fn fetch(
        &self,
        run_id: &str,
        tokens: &dyn TokenSource,
        options: FetchOptions,
    ) -> Result<FetchOutcome<T>, ArtifactFetchError> {
        let key = self.key(run_id);
        let cached = self.persistence.load(&key);

        if let (Some(entry), false) = (&cached, options.force_refresh) {
            match serde_json::from_value::<T>(entry.payload.clone()) {
                Ok(data) => {
                    debug!(run_id, path = %key.path, "artifact cache hit");
                    return Ok(FetchOutcome {
                        data,
                        meta: entry.meta.clone(),
                        from_cache: true,
                        not_modified: false,
                        mismatch: None,
                    });
                }
                Err(e) => {
                    warn!(run_id, path = %key.path, error = %e, "cached artifact undecodable, refetching");
                }
            }
        }

        let request = ArtifactRequest {
            path: key.path.clone(),
            if_none_match: cached.as_ref().and_then(|e| e.meta.etag.clone()),
            bearer: tokens.token().await,
        };

        match self.api.fetch_artifact(&request).await? {
            ConditionalResponse::NotModified { etag } => {
                let Some(entry) = cached else {
                    return Err(ArtifactFetchError::UnexpectedNotModified {
                        run_id: run_id.to_string(),
                    });
                };
                let data = serde_json::from_value::<T>(entry.payload.clone())
                    .map_err(|e| ArtifactFetchError::Decode(format!("{}: {}", key.path, e)))?;

                let meta = ArtifactMeta {
                    etag: etag.or_else(|| entry.meta.etag.clone()),
                    cached_at: (self.clock)(),
                    ..entry.meta.clone()
                };
                let mismatch = self.check_mismatch(&key, &entry.meta, &meta);
                self.persist(
                    key,
                    CacheEntry {
                        payload: entry.payload,
                        meta: meta.clone(),
                        fetched_at: entry.fetched_at,
                    },
                );

                debug!(run_id, "artifact not modified");
                Ok(FetchOutcome {
                    data,
                    meta,
                    from_cache: false,
                    not_modified: true,
                    mismatch,
                })
            }
            ConditionalResponse::Fresh { body, etag } => {
                let data = serde_json::from_value::<T>(body.clone())
                    .map_err(|e| ArtifactFetchError::Decode(format!("{}: {}", key.path, e)))?;

                let now = (self.clock)();
                let manifest_hash = data.manifest_hash().map(str::to_string);
                let meta = ArtifactMeta {
                    // The backend's ETag is the quoted manifest hash.
                    etag: etag.or_else(|| manifest_hash.as_ref().map(|h| format!("\"{}\"", h))),
                    manifest_hash,
                    publish_timestamp: data.publish_timestamp(),
                    cached_at: now,
                };

                let mismatch = cached
                    .as_ref()
                    .and_then(|entry| self.check_mismatch(&key, &entry.meta, &meta))
                    .or_else(|| self.check_run_mismatch(&key, &meta));
                self.persist(
                    key,
                    CacheEntry {
                        payload: body,
                        meta: meta.clone(),
                        fetched_at: now,
                    },
                );

                info!(run_id, manifest_hash = ?meta.manifest_hash, "artifact fetched");
                Ok(FetchOutcome {
                    data,
                    meta,
                    from_cache: false,
                    not_modified: false,
                    mismatch,
                })
            }
        }
    }

    /// Drop every cached entry of `run_id`.
    pub fn clear_cache(&self, run_id: &str) -> usize {
        match self.persistence.remove_run(run_id) {
            Ok(removed) => {
                debug!(run_id, removed, "artifact cache cleared");
                removed
            }
            Err(e) => {
                warn!(run_id, error = %e, "failed to clear artifact cache");
                0
            }
        }
    }

    fn check_mismatch(
        &self,
        key: &CacheKey,
        previous: &ArtifactMeta,
        current: &ArtifactMeta,
    ) -> Option<MismatchInfo> {
        let fields = detect_mismatch(previous, current);
        if fields.is_empty() {
            return None;
        }
        Some(self.report_mismatch(key, fields, previous, current))
    }

    /// A run publishes one manifest hash for all of its endpoints; compare
    /// against whatever other endpoints of the run are cached.
    fn check_run_mismatch(&self, key: &CacheKey, current: &ArtifactMeta) -> Option<MismatchInfo> {
        let hash = current.manifest_hash.as_deref()?;
        let mut siblings = self.persistence.run_entries(&key.run_id);
        siblings.sort_by(|a, b| a.0.path.cmp(&b.0.path));

        let (sibling, entry) = siblings.into_iter().find(|(k, e)| {
            k.path != key.path
                && e.meta.has_manifest_hash()
                && e.meta.manifest_hash.as_deref() != Some(hash)
        })?;
        debug!(run_id = %key.run_id, sibling = %sibling.path, "manifest hash differs across endpoints");
        Some(self.report_mismatch(
            key,
            vec![MismatchField::ManifestHash],
            &entry.meta,
            current,
        ))
    }

    fn report_mismatch(
        &self,
        key: &CacheKey,
        fields: Vec<MismatchField>,
        previous: &ArtifactMeta,
        current: &ArtifactMeta,
    ) -> MismatchInfo {
        let info = MismatchInfo {
            run_id: key.run_id.clone(),
            path: key.path.clone(),
            fields,
            previous: previous.clone(),
            current: current.clone(),
        };
        warn!("{}", info);
        metrics::counter!(ARTIFACT_MISMATCH_TOTAL, 1);
        if let Some(callback) = &self.on_mismatch {
            callback(&info);
        }
        info
    }

    fn persist(&self, key: CacheKey, entry: CacheEntry) {
        if let Err(e) = self.persistence.store(key, entry) {
            warn!(error = %e, "failed to persist artifact cache entry");
        }
    }
}
