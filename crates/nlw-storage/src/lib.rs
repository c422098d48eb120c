//! Append-only listing history, write-once dated artifacts and the JSON feed client for NLW.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nlw_core::{FieldManifest, ListingRecord, Scalar, SourceKind};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nlw-storage";

pub const HISTORY_FILE_NAME: &str = "listing_history.csv";
pub const LOCK_FILE_NAME: &str = "history.lock";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("csv failure on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has columns {found:?}, expected {expected:?}")]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("history store is locked by another check cycle ({path}); remove the file if no cycle is running")]
    Locked { path: PathBuf },
    #[error("dated artifact {path} already exists")]
    ArtifactExists { path: PathBuf },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path) -> impl FnOnce(csv::Error) -> StorageError + '_ {
    move |source| StorageError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Maps each source to the directory holding its history and dated artifacts.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    overrides: BTreeMap<SourceKind, PathBuf>,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_source_dir(mut self, source: SourceKind, dir: impl Into<PathBuf>) -> Self {
        self.overrides.insert(source, dir.into());
        self
    }

    pub fn source_dir(&self, source: SourceKind) -> PathBuf {
        self.overrides
            .get(&source)
            .cloned()
            .unwrap_or_else(|| self.root.join(source.as_str()))
    }

    pub fn history_path(&self, source: SourceKind) -> PathBuf {
        self.source_dir(source).join(HISTORY_FILE_NAME)
    }

    pub fn ensure_source_dir(&self, source: SourceKind) -> Result<PathBuf, StorageError> {
        let dir = self.source_dir(source);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(dir)
    }
}

/// File length, or `None` when the history file does not exist.
fn history_len(path: &Path) -> Result<Option<u64>, StorageError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Err(io_error(path)(io::Error::new(
            io::ErrorKind::InvalidInput,
            "history path is not a regular file",
        ))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path)(err)),
    }
}

fn manifest_header(manifest: &FieldManifest) -> Vec<String> {
    manifest.columns().into_iter().map(str::to_string).collect()
}

fn check_header(path: &Path, manifest: &FieldManifest, found: &csv::StringRecord) -> Result<(), StorageError> {
    let expected = manifest_header(manifest);
    let found = found.iter().map(str::to_string).collect::<Vec<_>>();
    if found != expected {
        return Err(StorageError::SchemaMismatch {
            path: path.to_path_buf(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Per-source append-only table of every listing ever reported as new.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    layout: StorageLayout,
}

impl HistoryStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Whether a header has ever been written for `source`.
    ///
    /// A zero-byte file (creation interrupted before the header landed) counts as absent.
    /// Any error other than `NotFound` is returned, never read as "no history".
    pub fn exists(&self, source: SourceKind) -> Result<bool, StorageError> {
        let path = self.layout.history_path(source);
        Ok(history_len(&path)?.is_some_and(|len| len > 0))
    }

    /// All historical records in append order; empty when the store was never written.
    pub fn load(&self, source: SourceKind) -> Result<Vec<ListingRecord>, StorageError> {
        let path = self.layout.history_path(source);
        if !history_len(&path)?.is_some_and(|len| len > 0) {
            return Ok(Vec::new());
        }
        let manifest = source.manifest();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&path)
            .map_err(csv_error(&path))?;
        let header = reader.headers().map_err(csv_error(&path))?.clone();
        check_header(&path, manifest, &header)?;

        let mut records: Vec<ListingRecord> = Vec::new();
        for row in reader.records() {
            let row = row.map_err(csv_error(&path))?;
            records.push(
                header
                    .iter()
                    .zip(row.iter())
                    .map(|(col, cell)| (col.to_string(), Scalar::from_cell(cell)))
                    .collect(),
            );
        }
        debug!(source = %source, rows = records.len(), path = %path.display(), "loaded history");
        Ok(records)
    }

    /// Append `records` after the existing rows, writing the header when the file is created.
    pub fn append(&self, source: SourceKind, records: &[ListingRecord]) -> Result<(), StorageError> {
        self.layout.ensure_source_dir(source)?;
        let path = self.layout.history_path(source);
        let manifest = source.manifest();

        let is_new = history_len(&path)?.map_or(true, |len| len == 0);
        if !is_new {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .from_path(&path)
                .map_err(csv_error(&path))?;
            let header = reader.headers().map_err(csv_error(&path))?.clone();
            check_header(&path, manifest, &header)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer
                .write_record(manifest.columns())
                .map_err(csv_error(&path))?;
        }
        for record in records {
            writer
                .write_record(manifest.project(record))
                .map_err(csv_error(&path))?;
        }
        writer.flush().map_err(io_error(&path))?;
        let file = writer
            .into_inner()
            .map_err(|err| io_error(&path)(err.into_error()))?;
        file.sync_all().map_err(io_error(&path))?;

        info!(source = %source, appended = records.len(), created = is_new, "appended to history");
        Ok(())
    }

    /// Exclusive guard over one source's `load` + `append` sequence.
    pub fn lock(&self, source: SourceKind) -> Result<StoreLock, StorageError> {
        let dir = self.layout.ensure_source_dir(source)?;
        let path = dir.join(LOCK_FILE_NAME);
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "pid={}", std::process::id());
                Ok(StoreLock { path })
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(StorageError::Locked { path }),
            Err(err) => Err(io_error(&path)(err)),
        }
    }
}

/// Removes the lock file when dropped.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub rows: usize,
}

/// Write-once per-run CSV files of the listings found new in that run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: StorageLayout,
}

impl ArtifactStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_file_name(fetched_at: DateTime<Utc>) -> String {
        format!("new_listings_{}.csv", fetched_at.format("%Y%m%d_%H%M%S_%3f"))
    }

    pub fn render_csv(manifest: &FieldManifest, records: &[ListingRecord]) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        writer.write_record(manifest.columns())?;
        for record in records {
            writer.write_record(manifest.project(record))?;
        }
        writer.into_inner().map_err(|err| csv::Error::from(err.into_error()))
    }

    /// Store the novel subset of one run under a name derived from the fetch timestamp.
    ///
    /// Bytes land in a temp file first and are hard-linked into place, so a reader never sees a
    /// partially written artifact. An existing artifact with the same name is never replaced.
    pub fn write_dated(
        &self,
        source: SourceKind,
        fetched_at: DateTime<Utc>,
        records: &[ListingRecord],
    ) -> Result<StoredArtifact, StorageError> {
        let dir = self.layout.ensure_source_dir(source)?;
        let file_name = Self::artifact_file_name(fetched_at);
        let absolute_path = dir.join(&file_name);

        let bytes = Self::render_csv(source.manifest(), records).map_err(csv_error(&absolute_path))?;
        let content_hash = Self::sha256_hex(&bytes);

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write_temp = || -> io::Result<()> {
            let mut file = OpenOptions::new().create_new(true).write(true).open(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()
        };
        if let Err(err) = write_temp() {
            let _ = fs::remove_file(&temp_path);
            return Err(io_error(&temp_path)(err));
        }

        // hard_link refuses an existing destination, unlike rename.
        let published = fs::hard_link(&temp_path, &absolute_path);
        let _ = fs::remove_file(&temp_path);
        match published {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::ArtifactExists {
                    path: absolute_path,
                })
            }
            Err(err) => return Err(io_error(&absolute_path)(err)),
        }

        Ok(StoredArtifact {
            content_hash,
            file_name,
            absolute_path,
            byte_size: bytes.len(),
            rows: records.len(),
        })
    }

    pub fn read_artifact(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        let mut file = File::open(path).map_err(io_error(path))?;
        let mut bytes = Vec::new();
        io::Read::read_to_end(&mut file, &mut bytes).map_err(io_error(path))?;
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: StatusCode,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

/// GETs pre-normalized listing feeds with bounded exponential-backoff retries.
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl FeedClient {
    pub fn new(config: FeedClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(
        &self,
        source: SourceKind,
        url: &str,
        params: &[(String, String)],
    ) -> Result<FetchedBody, FetchError> {
        let span = info_span!("feed_fetch", source = %source, url);
        self.get_with_retries(url, params).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str, params: &[(String, String)]) -> Result<FetchedBody, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).query(params).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let fetched_at = Utc::now();
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedBody {
                            status,
                            final_url,
                            fetched_at,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(%status, attempt, "retrying feed request");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retrying feed request");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn listing(id: i64, price: &str) -> ListingRecord {
        ListingRecord::new()
            .with("listing_id", id)
            .with("query", "toyota")
            .with("lat", 40.0)
            .with("long", -74.0)
            .with("price", price)
            .with("title", "Camry, clean title")
    }

    #[test]
    fn missing_history_loads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(StorageLayout::new(dir.path()));
        assert!(!store.exists(SourceKind::Craigslist).expect("exists"));
        assert!(store.load(SourceKind::Craigslist).expect("load").is_empty());
    }

    #[test]
    fn append_creates_header_once_and_preserves_order() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(StorageLayout::new(dir.path()));

        store
            .append(SourceKind::Craigslist, &[listing(1, "$900")])
            .expect("first append");
        let before = store.load(SourceKind::Craigslist).expect("load");
        store
            .append(SourceKind::Craigslist, &[listing(2, "$1,200"), listing(3, "$50")])
            .expect("second append");
        let after = store.load(SourceKind::Craigslist).expect("load");

        assert_eq!(after.len(), before.len() + 2);
        assert_eq!(&after[..before.len()], &before[..]);
        assert_eq!(after[1].get("price"), Some(&Scalar::Text("$1,200".into())));
        assert_eq!(after[0].get("url"), Some(&Scalar::Null));

        let text = fs::read_to_string(store.layout().history_path(SourceKind::Craigslist)).unwrap();
        assert_eq!(text.matches("listing_id,query").count(), 1);
    }

    #[test]
    fn empty_append_still_creates_the_store() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(StorageLayout::new(dir.path()));
        store.append(SourceKind::Offerup, &[]).expect("append");
        assert!(store.exists(SourceKind::Offerup).expect("exists"));
        assert!(store.load(SourceKind::Offerup).expect("load").is_empty());
    }

    #[test]
    fn zero_byte_history_reads_as_absent_and_gets_its_header() {
        let dir = tempdir().expect("tempdir");
        let layout = StorageLayout::new(dir.path());
        let store = HistoryStore::new(layout.clone());
        layout.ensure_source_dir(SourceKind::Craigslist).expect("dir");
        fs::write(layout.history_path(SourceKind::Craigslist), b"").expect("truncate");

        assert!(!store.exists(SourceKind::Craigslist).expect("exists"));
        assert!(store.load(SourceKind::Craigslist).expect("load").is_empty());

        store
            .append(SourceKind::Craigslist, &[listing(4, "$40")])
            .expect("append");
        assert!(store.exists(SourceKind::Craigslist).expect("exists"));
        assert_eq!(store.load(SourceKind::Craigslist).expect("load").len(), 1);
    }

    #[test]
    fn unreadable_history_location_is_an_error_not_an_empty_store() {
        let dir = tempdir().expect("tempdir");
        let layout = StorageLayout::new(dir.path());
        let store = HistoryStore::new(layout.clone());
        // A directory where the history file should be fails metadata checks.
        fs::create_dir_all(layout.history_path(SourceKind::Kijiji)).expect("dir");

        assert!(matches!(
            store.exists(SourceKind::Kijiji),
            Err(StorageError::Io { .. })
        ));
        assert!(matches!(
            store.load(SourceKind::Kijiji),
            Err(StorageError::Io { .. })
        ));
    }

    #[test]
    fn foreign_header_is_rejected_on_load_and_append() {
        let dir = tempdir().expect("tempdir");
        let layout = StorageLayout::new(dir.path());
        let store = HistoryStore::new(layout.clone());
        layout.ensure_source_dir(SourceKind::Kijiji).unwrap();
        fs::write(
            layout.history_path(SourceKind::Kijiji),
            "listing_id,query,city,state,title\n1,truck,1700281,9001,F150\n",
        )
        .unwrap();

        assert!(matches!(
            store.load(SourceKind::Kijiji),
            Err(StorageError::SchemaMismatch { .. })
        ));
        assert!(matches!(
            store.append(SourceKind::Kijiji, &[]),
            Err(StorageError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn source_dir_overrides_take_precedence() {
        let dir = tempdir().expect("tempdir");
        let layout = StorageLayout::new(dir.path()).with_source_dir(SourceKind::Ebay, dir.path().join("ebay-us"));
        assert_eq!(layout.source_dir(SourceKind::Ebay), dir.path().join("ebay-us"));
        assert_eq!(layout.source_dir(SourceKind::Kijiji), dir.path().join("kijiji"));
    }

    #[test]
    fn second_lock_on_same_store_fails_until_released() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(StorageLayout::new(dir.path()));
        let guard = store.lock(SourceKind::GumtreeUk).expect("lock");
        assert!(matches!(
            store.lock(SourceKind::GumtreeUk),
            Err(StorageError::Locked { .. })
        ));
        drop(guard);
        assert!(store.lock(SourceKind::GumtreeUk).is_ok());
    }

    #[test]
    fn dated_artifacts_are_write_once() {
        let dir = tempdir().expect("tempdir");
        let artifacts = ArtifactStore::new(StorageLayout::new(dir.path()));
        let fetched_at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();

        let stored = artifacts
            .write_dated(SourceKind::Craigslist, fetched_at, &[listing(5, "$10")])
            .expect("write");
        assert_eq!(stored.file_name, "new_listings_20260224_120000_000.csv");
        assert_eq!(stored.rows, 1);
        let bytes = artifacts.read_artifact(&stored.absolute_path).unwrap();
        assert_eq!(ArtifactStore::sha256_hex(&bytes), stored.content_hash);
        assert!(String::from_utf8(bytes).unwrap().contains("\"Camry, clean title\""));

        assert!(matches!(
            artifacts.write_dated(SourceKind::Craigslist, fetched_at, &[]),
            Err(StorageError::ArtifactExists { .. })
        ));
        let kept = artifacts.read_artifact(&stored.absolute_path).expect("reread");
        assert_eq!(ArtifactStore::sha256_hex(&kept), stored.content_hash);
        let leftovers = fs::read_dir(artifacts.layout.source_dir(SourceKind::Craigslist))
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn artifact_hashing_is_stable() {
        assert_eq!(
            ArtifactStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }
}
