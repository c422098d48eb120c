//! New-listing detection and check-cycle orchestration.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nlw_adapters::{adapter_for, AdapterError, AdapterFault, AdapterSpec, Locality, SearchParams, SourceAdapter};
use nlw_core::{FetchedBatch, IdentityKey, IdentityPolicy, ListingRecord, SourceKind};
use nlw_storage::{
    ArtifactStore, FeedClient, FeedClientConfig, HistoryStore, StorageError, StorageLayout, StoreLock,
    StoredArtifact,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nlw-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub watches_path: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("NLW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            watches_path: std::env::var("NLW_WATCHES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./watches.yaml")),
            reports_dir: std::env::var("NLW_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            scheduler_enabled: std::env::var("NLW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("NLW_SYNC_CRON").unwrap_or_else(|_| "0 */15 * * * *".to_string()),
            user_agent: std::env::var("NLW_USER_AGENT").unwrap_or_else(|_| "nlw-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("NLW_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn storage_layout(&self) -> StorageLayout {
        StorageLayout::new(self.data_dir.clone())
    }

    /// Storage layout with the registry's per-source overrides, when a registry is present.
    ///
    /// Every command that touches a history store goes through here so `check`, `sync`
    /// and `history` agree on where each source lives.
    pub async fn resolved_layout(&self) -> Result<StorageLayout> {
        let present = fs::try_exists(&self.watches_path)
            .await
            .with_context(|| format!("checking {}", self.watches_path.display()))?;
        if !present {
            return Ok(self.storage_layout());
        }
        let registry = WatchRegistry::load(&self.watches_path).await?;
        Ok(registry.apply_storage_overrides(self.storage_layout()))
    }

    pub fn feed_client(&self) -> Result<FeedClient> {
        FeedClient::new(FeedClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })
        .context("building feed client")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchRegistry {
    pub watches: Vec<WatchConfig>,
    /// Per-source storage directories overriding `<data_dir>/<source>`.
    #[serde(default)]
    pub storage: BTreeMap<SourceKind, PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub watch_id: String,
    pub source: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub query: String,
    pub locality: Locality,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    pub adapter: AdapterSpec,
}

fn default_enabled() -> bool {
    true
}

impl WatchConfig {
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            query: self.query.clone(),
            locality: self.locality.clone(),
            filters: self.filters.clone(),
        }
    }
}

impl WatchRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing watch registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn apply_storage_overrides(&self, mut layout: StorageLayout) -> StorageLayout {
        for (source, dir) in &self.storage {
            layout = layout.with_source_dir(*source, dir.clone());
        }
        layout
    }
}

/// A fetched record left out of the comparison because its identity could not be derived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedRecord {
    pub position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoveltyOutcome {
    /// New records in batch order.
    pub novel: Vec<ListingRecord>,
    pub excluded: Vec<ExcludedRecord>,
    /// Exact repeats of an earlier record in the same batch.
    pub duplicate_rows: usize,
    /// History rows whose identity could not be derived; they match nothing.
    pub corrupt_history_rows: usize,
    pub first_run: bool,
}

/// Left-anti-join of a fetched batch against history on the source's identity tuple.
#[derive(Debug, Clone, Copy)]
pub struct NoveltyDetector {
    policy: IdentityPolicy,
}

impl NoveltyDetector {
    pub fn new(source: SourceKind) -> Self {
        Self {
            policy: IdentityPolicy::for_source(source),
        }
    }

    pub fn source(&self) -> SourceKind {
        self.policy.source()
    }

    /// `history` is `None` when the source has never been checked; every valid record is then new.
    pub fn detect(&self, batch: &[ListingRecord], history: Option<&[ListingRecord]>) -> NoveltyOutcome {
        let mut outcome = NoveltyOutcome {
            first_run: history.is_none(),
            ..Default::default()
        };

        let mut seen_rows = HashSet::new();
        let mut candidates = Vec::new();
        for (position, record) in batch.iter().enumerate() {
            if !seen_rows.insert(full_row_key(record)) {
                outcome.duplicate_rows += 1;
                continue;
            }
            match self.policy.validate(record) {
                Ok(key) => candidates.push((key, record)),
                Err(err) => {
                    warn!(source = %self.source(), position, reason = %err, "excluding malformed record");
                    outcome.excluded.push(ExcludedRecord {
                        position,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let known = match history {
            Some(rows) => {
                let (keys, corrupt) = self.history_keys(rows);
                outcome.corrupt_history_rows = corrupt;
                keys
            }
            None => HashSet::new(),
        };

        outcome.novel = candidates
            .into_iter()
            .filter(|(key, _)| !known.contains(key))
            .map(|(_, record)| record.clone())
            .collect();
        outcome
    }

    fn history_keys(&self, rows: &[ListingRecord]) -> (HashSet<IdentityKey>, usize) {
        let mut keys = HashSet::with_capacity(rows.len());
        let mut corrupt = 0usize;
        for (row, record) in rows.iter().enumerate() {
            match self.policy.identity_of(record) {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(err) => {
                    corrupt += 1;
                    warn!(source = %self.source(), row, reason = %err, "skipping history row without identity");
                }
            }
        }
        (keys, corrupt)
    }
}

fn full_row_key(record: &ListingRecord) -> Vec<(String, String)> {
    record
        .field_names()
        .map(|name| {
            let cell = record.get(name).map(|v| v.to_cell()).unwrap_or_default();
            (name.to_string(), cell)
        })
        .collect()
}

/// Holds the store lock from history load until the caller finishes appending.
fn compare(
    history: &HistoryStore,
    detector: &NoveltyDetector,
    records: &[ListingRecord],
) -> Result<(StoreLock, NoveltyOutcome, usize), StorageError> {
    let source = detector.source();
    let lock = history.lock(source)?;
    let rows = if history.exists(source)? {
        Some(history.load(source)?)
    } else {
        None
    };
    let outcome = detector.detect(records, rows.as_deref());
    let before = rows.map(|h| h.len()).unwrap_or(0);
    Ok((lock, outcome, before))
}

/// Artifact first, then history: a crash in between re-reports rows instead of losing them.
fn persist(
    history: &HistoryStore,
    artifacts: &ArtifactStore,
    source: SourceKind,
    fetched_at: DateTime<Utc>,
    novel: &[ListingRecord],
) -> Result<StoredArtifact, StorageError> {
    let stored = artifacts.write_dated(source, fetched_at, novel)?;
    history.append(source, novel)?;
    Ok(stored)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Fetching,
    Comparing,
    Persisting,
    Done,
    Failed,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed for {source_kind}: {error}")]
    Fetch {
        source_kind: SourceKind,
        #[source]
        error: AdapterError,
    },
    #[error("parse failed for {source_kind}: {error}")]
    Parse {
        source_kind: SourceKind,
        #[source]
        error: AdapterError,
    },
    #[error("storage fault for {source_kind} while {stage:?}: {error}")]
    Storage {
        source_kind: SourceKind,
        stage: CycleState,
        #[source]
        error: StorageError,
    },
}

impl CycleError {
    fn from_adapter(source_kind: SourceKind, error: AdapterError) -> Self {
        match error.fault() {
            AdapterFault::Fetch => CycleError::Fetch { source_kind, error },
            AdapterFault::Parse => CycleError::Parse { source_kind, error },
        }
    }

    pub fn fault(&self) -> &'static str {
        match self {
            CycleError::Fetch { .. } => "fetch",
            CycleError::Parse { .. } => "parse",
            CycleError::Storage { .. } => "storage",
        }
    }

    /// Whether history may have been touched before the failure.
    pub fn touched_history(&self) -> bool {
        matches!(
            self,
            CycleError::Storage {
                stage: CycleState::Persisting,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub file_name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
}

impl From<&StoredArtifact> for ArtifactSummary {
    fn from(stored: &StoredArtifact) -> Self {
        Self {
            file_name: stored.file_name.clone(),
            path: stored.absolute_path.display().to_string(),
            sha256: stored.content_hash.clone(),
            bytes: stored.byte_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub source: SourceKind,
    pub query: String,
    pub locality: String,
    pub fetched_at: DateTime<Utc>,
    pub fetched: usize,
    pub novel_count: usize,
    pub excluded: Vec<ExcludedRecord>,
    pub duplicate_rows: usize,
    pub corrupt_history_rows: usize,
    pub first_run: bool,
    pub history_rows_before: usize,
    pub history_rows_after: usize,
    pub artifact: ArtifactSummary,
    pub transitions: Vec<CycleState>,
    pub novel: Vec<ListingRecord>,
}

impl CycleReport {
    pub fn excluded_count(&self) -> usize {
        self.excluded.len()
    }

    /// Single-line operator summary.
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "[{}] Found {} new listings for {} in {}",
            self.source, self.novel_count, self.query, self.locality
        );
        if !self.excluded.is_empty() {
            line.push_str(&format!(" ({} malformed excluded)", self.excluded.len()));
        }
        line
    }
}

struct CycleTracker {
    transitions: Vec<CycleState>,
}

impl CycleTracker {
    fn new() -> Self {
        Self {
            transitions: vec![CycleState::Idle],
        }
    }

    fn advance(&mut self, next: CycleState) {
        info!(state = ?next, "check cycle state");
        self.transitions.push(next);
    }
}

/// Runs fetch -> compare -> persist for one source/query/locality.
///
/// Cycles against the same source must not overlap; each cycle holds the store lock from
/// history load until the append completes.
#[derive(Debug, Clone)]
pub struct CycleRunner {
    history: HistoryStore,
    artifacts: ArtifactStore,
}

impl CycleRunner {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            history: HistoryStore::new(layout.clone()),
            artifacts: ArtifactStore::new(layout),
        }
    }

    pub async fn run(&self, adapter: &dyn SourceAdapter, params: &SearchParams) -> Result<CycleReport, CycleError> {
        let source = adapter.source();
        let span = info_span!(
            "check_cycle",
            source = %source,
            query = %params.query,
            locality = %params.locality
        );
        self.run_in_span(adapter, params).instrument(span).await
    }

    async fn run_in_span(&self, adapter: &dyn SourceAdapter, params: &SearchParams) -> Result<CycleReport, CycleError> {
        let source = adapter.source();
        let mut tracker = CycleTracker::new();

        tracker.advance(CycleState::Fetching);
        let batch = match adapter.fetch(params).await {
            Ok(batch) if batch.source == source => batch,
            Ok(batch) => {
                let error = AdapterError::Fetch(format!("adapter returned a {} batch", batch.source));
                return Err(self.fail_fetch(&mut tracker, source, error));
            }
            Err(error) => return Err(self.fail_fetch(&mut tracker, source, error)),
        };

        let FetchedBatch {
            fetched_at, records, ..
        } = batch;
        let fetched = records.len();

        tracker.advance(CycleState::Comparing);
        let detector = NoveltyDetector::new(source);
        let compared = self
            .off_runtime(source, move |history, _| compare(history, &detector, &records))
            .await;
        let (lock, outcome, history_rows_before) =
            compared.map_err(|error| self.fail_storage(&mut tracker, source, CycleState::Comparing, error))?;

        tracker.advance(CycleState::Persisting);
        let NoveltyOutcome {
            novel,
            excluded,
            duplicate_rows,
            corrupt_history_rows,
            first_run,
        } = outcome;
        let persisted = self
            .off_runtime(source, move |history, artifacts| {
                let stored = persist(history, artifacts, source, fetched_at, &novel)?;
                Ok((stored, novel))
            })
            .await;
        let (stored, novel) =
            persisted.map_err(|error| self.fail_storage(&mut tracker, source, CycleState::Persisting, error))?;
        drop(lock);

        tracker.advance(CycleState::Done);
        let report = CycleReport {
            source,
            query: params.query.clone(),
            locality: params.locality.to_string(),
            fetched_at,
            fetched,
            novel_count: novel.len(),
            excluded,
            duplicate_rows,
            corrupt_history_rows,
            first_run,
            history_rows_before,
            history_rows_after: history_rows_before + novel.len(),
            artifact: ArtifactSummary::from(&stored),
            transitions: tracker.transitions,
            novel,
        };
        info!(
            novel = report.novel_count,
            excluded = report.excluded_count(),
            artifact = %report.artifact.file_name,
            "check cycle complete"
        );
        Ok(report)
    }

    /// Runs file-backed store work on the blocking pool, inside the current cycle span.
    async fn off_runtime<T, F>(&self, source: SourceKind, work: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&HistoryStore, &ArtifactStore) -> Result<T, StorageError> + Send + 'static,
    {
        let history = self.history.clone();
        let artifacts = self.artifacts.clone();
        let dir = history.layout().source_dir(source);
        let span = Span::current();
        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            work(&history, &artifacts)
        })
        .await
        .map_err(|err| StorageError::Io {
            path: dir,
            source: io::Error::new(io::ErrorKind::Other, err),
        })?
    }

    fn fail_fetch(&self, tracker: &mut CycleTracker, source: SourceKind, error: AdapterError) -> CycleError {
        tracker.advance(CycleState::Failed);
        let err = CycleError::from_adapter(source, error);
        error!(fault = err.fault(), error = %err, "check cycle aborted before comparing; history untouched");
        err
    }

    fn fail_storage(
        &self,
        tracker: &mut CycleTracker,
        source: SourceKind,
        stage: CycleState,
        error: StorageError,
    ) -> CycleError {
        tracker.advance(CycleState::Failed);
        let err = CycleError::Storage {
            source_kind: source,
            stage,
            error,
        };
        error!(fault = err.fault(), stage = ?stage, error = %err, "check cycle storage fault");
        err
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WatchOutcome {
    Completed {
        watch_id: String,
        report: CycleReport,
    },
    Failed {
        watch_id: String,
        source: SourceKind,
        fault: String,
        error: String,
    },
}

impl WatchOutcome {
    pub fn watch_id(&self) -> &str {
        match self {
            WatchOutcome::Completed { watch_id, .. } | WatchOutcome::Failed { watch_id, .. } => watch_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_watches: usize,
    pub novel_listings: usize,
    pub failed_watches: usize,
    pub outcomes: Vec<WatchOutcome>,
    pub reports_dir: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    feed: FeedClient,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let feed = config.feed_client()?;
        Ok(Self {
            config,
            feed,
            run_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run every enabled watch once, in registry order. A failing watch does not stop the rest.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _serialized = self.run_lock.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = WatchRegistry::load(&self.config.watches_path).await?;
        let runner = CycleRunner::new(registry.apply_storage_overrides(self.config.storage_layout()));
        let enabled: Vec<_> = registry.watches.iter().filter(|w| w.enabled).collect();

        let mut outcomes = Vec::with_capacity(enabled.len());
        for watch in &enabled {
            let adapter = adapter_for(watch.source, &watch.adapter, &self.feed);
            let outcome = match runner.run(adapter.as_ref(), &watch.search_params()).await {
                Ok(report) => WatchOutcome::Completed {
                    watch_id: watch.watch_id.clone(),
                    report,
                },
                Err(err) => {
                    error!(watch_id = %watch.watch_id, fault = err.fault(), "watch failed");
                    WatchOutcome::Failed {
                        watch_id: watch.watch_id.clone(),
                        source: watch.source,
                        fault: err.fault().to_string(),
                        error: format!("{err:#}"),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let novel_listings = outcomes
            .iter()
            .map(|o| match o {
                WatchOutcome::Completed { report, .. } => report.novel_count,
                WatchOutcome::Failed { .. } => 0,
            })
            .sum();
        let failed_watches = outcomes
            .iter()
            .filter(|o| matches!(o, WatchOutcome::Failed { .. }))
            .count();

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_watches: enabled.len(),
            novel_listings,
            failed_watches,
            outcomes,
            reports_dir: String::new(),
        };
        let reports_dir = self.write_reports(&summary).await?;
        summary.reports_dir = reports_dir.display().to_string();
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(&self.config.sync_cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        novel = summary.novel_listings,
                        failed = summary.failed_watches,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.config.sync_cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn write_reports(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        fs::write(reports_dir.join("daily_brief.md"), render_brief(summary))
            .await
            .context("writing daily_brief.md")?;
        Ok(reports_dir)
    }
}

fn render_brief(summary: &SyncRunSummary) -> String {
    let lines = summary
        .outcomes
        .iter()
        .map(|outcome| match outcome {
            WatchOutcome::Completed { watch_id, report } => {
                format!("- `{watch_id}`: {}", report.summary_line())
            }
            WatchOutcome::Failed {
                watch_id,
                source,
                fault,
                error,
            } => format!("- `{watch_id}` ({source}): FAILED [{fault}] {error}"),
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# New Listing Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Watches: {}\n- New listings: {}\n- Failed watches: {}\n\n## Watches\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.enabled_watches,
        summary.novel_listings,
        summary.failed_watches,
        lines
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: impl Into<nlw_core::Scalar>, price: &str) -> ListingRecord {
        ListingRecord::new()
            .with("listing_id", id)
            .with("query", "toyota")
            .with("lat", 40.0)
            .with("long", -74.0)
            .with("title", "Camry")
            .with("price", price)
    }

    fn ids(records: &[ListingRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.get("listing_id").map(|v| v.to_cell()).unwrap_or_default())
            .collect()
    }

    #[test]
    fn first_run_reports_the_deduplicated_batch() {
        let detector = NoveltyDetector::new(SourceKind::Craigslist);
        let batch = vec![listing(3, "$1"), listing(1, "$2"), listing(3, "$1"), listing(2, "$3")];
        let outcome = detector.detect(&batch, None);
        assert!(outcome.first_run);
        assert_eq!(ids(&outcome.novel), vec!["3", "1", "2"]);
        assert_eq!(outcome.duplicate_rows, 1);
    }

    #[test]
    fn known_identity_is_not_novel_despite_price_drift() {
        let detector = NoveltyDetector::new(SourceKind::Craigslist);
        let history = vec![listing(1, "$900")];
        let outcome = detector.detect(&[listing(1, "$850")], Some(&history));
        assert!(outcome.novel.is_empty());
        assert!(!outcome.first_run);
    }

    #[test]
    fn text_history_ids_match_integer_batch_ids() {
        let detector = NoveltyDetector::new(SourceKind::Craigslist);
        let history = vec![ListingRecord::new()
            .with("listing_id", "4521")
            .with("query", "toyota")
            .with("lat", "40.0")
            .with("long", "-74")];
        let outcome = detector.detect(&[listing(4521, "$5")], Some(&history));
        assert!(outcome.novel.is_empty());
    }

    #[test]
    fn overlapping_batch_yields_only_the_unseen_listing() {
        let detector = NoveltyDetector::new(SourceKind::Craigslist);
        let history = vec![listing(1, "$10")];
        let batch = vec![listing(1, "$10"), listing(2, "$20"), listing(2, "$20")];
        let outcome = detector.detect(&batch, Some(&history));
        assert_eq!(ids(&outcome.novel), vec!["2"]);
        assert_eq!(outcome.duplicate_rows, 1);
    }

    #[test]
    fn malformed_locality_is_excluded_not_novel() {
        let detector = NoveltyDetector::new(SourceKind::Craigslist);
        let bad = listing(7, "$1").with("lat", "forty");
        let outcome = detector.detect(&[listing(6, "$1"), bad], None);
        assert_eq!(ids(&outcome.novel), vec!["6"]);
        assert_eq!(outcome.excluded.len(), 1);
        assert_eq!(outcome.excluded[0].position, 1);
        assert!(outcome.excluded[0].reason.contains("lat"));
    }

    #[test]
    fn descriptive_variants_in_one_batch_are_both_new_on_first_run() {
        let detector = NoveltyDetector::new(SourceKind::Craigslist);
        let outcome = detector.detect(&[listing(8, "$100"), listing(8, "$90")], None);
        assert_eq!(outcome.novel.len(), 2);
        assert_eq!(outcome.duplicate_rows, 0);
        assert_eq!(outcome.novel[0].get("price"), Some(&nlw_core::Scalar::Text("$100".into())));
        assert_eq!(outcome.novel[1].get("price"), Some(&nlw_core::Scalar::Text("$90".into())));
    }

    #[test]
    fn descriptive_variants_of_a_known_listing_are_both_filtered() {
        let detector = NoveltyDetector::new(SourceKind::Craigslist);
        let history = vec![listing(8, "$120")];
        let outcome = detector.detect(&[listing(8, "$100"), listing(8, "$90")], Some(&history));
        assert!(outcome.novel.is_empty());
    }

    #[test]
    fn detection_is_repeatable_and_leaves_inputs_alone() {
        let detector = NoveltyDetector::new(SourceKind::Craigslist);
        let history = vec![listing(1, "$1")];
        let batch = vec![listing(1, "$1"), listing(2, "$2")];
        let first = detector.detect(&batch, Some(&history));
        let second = detector.detect(&batch, Some(&history));
        assert_eq!(first, second);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn empty_batch_is_fine_without_history() {
        let detector = NoveltyDetector::new(SourceKind::Ebay);
        let outcome = detector.detect(&[], None);
        assert!(outcome.novel.is_empty());
        assert!(outcome.excluded.is_empty());
    }

    #[test]
    fn corrupt_history_rows_are_counted_and_skipped() {
        let detector = NoveltyDetector::new(SourceKind::Craigslist);
        let history = vec![ListingRecord::new().with("listing_id", "abc").with("query", "toyota")];
        let outcome = detector.detect(&[listing(1, "$1")], Some(&history));
        assert_eq!(outcome.corrupt_history_rows, 1);
        assert_eq!(outcome.novel.len(), 1);
    }

    #[test]
    fn registry_parses_each_locality_shape() {
        let registry = WatchRegistry::from_yaml_str(
            r#"
storage:
  ebay: /var/lib/nlw/ebay-us
watches:
  - watch_id: nyc-toyota
    source: craigslist
    query: toyota
    locality: { lat: 40.7128, long: -74.006 }
    filters: { search_distance: "50" }
    adapter: { kind: fixture, path: fixtures/craigslist/sample/batch.json }
  - watch_id: toronto-f150
    source: kijiji
    enabled: false
    query: f150
    locality: { city: 1700273, state: 9004 }
    adapter: { kind: feed, url: "http://localhost:8088/kijiji" }
  - watch_id: ny-bmw
    source: ebay
    query: bmw
    locality: { postal_code: "10001", country: US }
    adapter: { kind: feed, url: "http://localhost:8088/ebay" }
"#,
        )
        .unwrap();
        assert_eq!(registry.watches.len(), 3);
        assert!(registry.watches[0].enabled);
        assert!(!registry.watches[1].enabled);
        assert!(registry.watches[1].locality.fits(SourceKind::Kijiji));
        assert!(registry.watches[2].locality.fits(SourceKind::Ebay));
        assert_eq!(registry.watches[0].search_params().filters["search_distance"], "50");

        let layout = registry.apply_storage_overrides(StorageLayout::new("/tmp/nlw"));
        assert_eq!(layout.source_dir(SourceKind::Ebay), PathBuf::from("/var/lib/nlw/ebay-us"));
    }
}
