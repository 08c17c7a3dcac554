//! Flat-table (CSV) I/O, raw feed snapshot storage, and HTTP fetch with a
//! shared retry policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_core::CanonicalEvent;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cadence-storage";

/// A delimited table held fully in memory, header order preserved.
///
/// This is the interchange shape for the consolidated history file: small by
/// construction (one row per day), rewritten whole on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl FlatTable {
    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    /// Read a table from disk. A missing file is an empty table, not an error.
    /// Rows are padded or truncated to the header width.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("opening {}", path.display()))?;

        let header: Vec<String> = reader
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("reading row of {}", path.display()))?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(header.len(), String::new());
            rows.push(row);
        }

        Ok(Self { header, rows })
    }

    /// Rewrite the whole table, creating parent directories as needed.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut writer =
            csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
        writer
            .write_record(&self.header)
            .with_context(|| format!("writing header of {}", path.display()))?;
        for row in &self.rows {
            writer
                .write_record(row)
                .with_context(|| format!("writing row of {}", path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing {}", path.display()))?;
        Ok(())
    }
}

/// Read a per-source event table. Missing file = empty feed. A row that fails
/// to deserialize (unknown source tag, mangled quoting) is dropped with a
/// warning; the rest of the batch continues.
pub fn read_events(path: &Path) -> Result<Vec<CanonicalEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let mut events = Vec::new();
    for record in reader.deserialize::<CanonicalEvent>() {
        match record {
            Ok(event) => events.push(event),
            Err(err) => warn!(path = %path.display(), %err, "dropping unreadable event row"),
        }
    }
    Ok(events)
}

/// Overwrite a per-source event table with a fresh fetch's output.
pub fn write_events(path: &Path, events: &[CanonicalEvent]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for event in events {
        writer
            .serialize(event)
            .with_context(|| format!("writing event row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// First data row of a one-row summary table as a column→value map.
/// Missing or unreadable files degrade to an empty map.
pub fn read_single_row(path: &Path) -> HashMap<String, String> {
    let mut reader = match csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path) {
        Ok(reader) => reader,
        Err(_) => return HashMap::new(),
    };
    let header = match reader.headers() {
        Ok(header) => header.clone(),
        Err(_) => return HashMap::new(),
    };
    match reader.records().next() {
        Some(Ok(record)) => header
            .iter()
            .zip(record.iter())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Write a one-row summary table with the given column order.
pub fn write_single_row(path: &Path, columns: &[(String, String)]) -> Result<()> {
    let table = FlatTable {
        header: columns.iter().map(|(k, _)| k.clone()).collect(),
        rows: vec![columns.iter().map(|(_, v)| v.clone()).collect()],
    };
    table.write(path)
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable raw feed payload storage: one file per fetched document, named
/// by fetch date and content hash so a re-fetch of identical bytes lands on
/// the existing file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Store one raw document under `<root>/<YYYYMMDD>/<label>_<hash[..12]>.json`
    /// via an atomic temp-file rename.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        bytes: &[u8],
    ) -> Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let dir = self.root.join(stamp);
        let path = dir.join(format!("{label}_{}.json", &content_hash[..12]));

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))?
        {
            return Ok(StoredSnapshot {
                content_hash,
                path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(StoredSnapshot {
                content_hash,
                path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err)
                    .with_context(|| format!("renaming temp snapshot into {}", path.display()))
            }
        }
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// The one shared retry policy for outbound calls: exponential backoff from
/// `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Blocking-style GET fetcher. Feed fetches run strictly one at a time, so
/// there is no concurrency limiting here; retries are the only policy.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` with optional query parameters, retrying per the backoff
    /// policy on retryable statuses and transport errors.
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let result = self.client.get(url).query(query).send().await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, url = %final_url, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%err, url, attempt, "retrying after transport error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::EventSource;
    use tempfile::tempdir;

    fn event(id: &str, url: &str) -> CanonicalEvent {
        CanonicalEvent {
            event_id: id.to_string(),
            source: EventSource::Aeg,
            source_venue_id: String::new(),
            title: "Night Moves".to_string(),
            start_datetime: "2026-05-01T20:00:00-06:00".to_string(),
            venue_name: "Gothic Theatre".to_string(),
            venue_city: "Englewood".to_string(),
            venue_region: "CO".to_string(),
            venue_country: "US".to_string(),
            event_url: url.to_string(),
            presented_by: String::new(),
            headliners: "Night Moves".to_string(),
            supporting: String::new(),
        }
    }

    #[test]
    fn missing_event_table_is_empty_feed() {
        let dir = tempdir().expect("tempdir");
        let events = read_events(&dir.path().join("nope.csv")).expect("read");
        assert!(events.is_empty());
    }

    #[test]
    fn event_table_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("processed").join("events.csv");
        let written = vec![event("a1", "https://www.axs.com/e/1"), event("a2", "")];
        write_events(&path, &written).expect("write");
        let read = read_events(&path).expect("read");
        assert_eq!(read, written);
    }

    #[test]
    fn single_row_reader_degrades_to_empty() {
        let dir = tempdir().expect("tempdir");
        assert!(read_single_row(&dir.path().join("absent.csv")).is_empty());

        let path = dir.path().join("summary.csv");
        write_single_row(
            &path,
            &[
                ("year".to_string(), "2026".to_string()),
                ("miles_total".to_string(), "123.4".to_string()),
            ],
        )
        .expect("write");
        let row = read_single_row(&path);
        assert_eq!(row.get("miles_total").map(String::as_str), Some("123.4"));
    }

    #[test]
    fn flat_table_read_pads_short_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "a,b,c\n1,2\n").expect("seed");
        let table = FlatTable::read(&path).expect("read");
        assert_eq!(table.rows, vec![vec!["1".to_string(), "2".to_string(), String::new()]]);
    }

    #[tokio::test]
    async fn snapshot_store_dedupes_identical_bytes() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store(fetched_at, "aeg_events", br#"{"events":[]}"#)
            .await
            .expect("first");
        let second = store
            .store(fetched_at, "aeg_events", br#"{"events":[]}"#)
            .await
            .expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.path, second.path);
        assert!(first.path.exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn too_many_requests_is_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
