//! Object storage, cache store and retry utilities for the enrichment pipeline.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use redis::aio::ConnectionManager;
use senrich_core::{
    parse_json_lines, render_json_lines, CacheKey, JobPosting, ProcessedJobPosting, RecordError,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "senrich-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < policy.max_retries =>
            {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "remote call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{key} is not valid utf-8")]
    NotUtf8 { key: String },
    #[error("malformed record in {key}: {source}")]
    Record {
        key: String,
        #[source]
        source: RecordError,
    },
}

impl Retryable for StorageError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            StorageError::Io { source, .. }
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                ) =>
            {
                RetryDisposition::Retryable
            }
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.trim_end_matches('/');
        let dir = self.path_for(prefix)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(prefix)(err)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(prefix))? {
            let file_type = entry.file_type().await.map_err(io_error(prefix))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // in-flight temp files from `put`
            if name.starts_with('.') {
                continue;
            }
            keys.push(format!("{prefix}/{name}"));
        }
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(io_error(key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(io_error(key))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_error(key))?;
        file.write_all(&bytes).await.map_err(io_error(key))?;
        file.flush().await.map_err(io_error(key))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(key)(err));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub key: String,
    pub timestamp: i64,
}

pub fn object_key(prefix: &str, timestamp: i64) -> String {
    format!("{}/{timestamp}.jsonl", prefix.trim_end_matches('/'))
}

pub fn parse_file_timestamp(key: &str) -> Option<i64> {
    let name = key.rsplit('/').next()?;
    let (stem, ext) = name.split_once('.')?;
    if ext != "jsonl" || stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Files under `prefix` newer than `since`, oldest first. Timestamps compare as integers.
pub async fn list_new_files(
    store: &dyn ObjectStore,
    prefix: &str,
    since: i64,
) -> Result<Vec<SourceFile>, StorageError> {
    let mut files = Vec::new();
    for key in store.list(prefix).await? {
        match parse_file_timestamp(&key) {
            Some(timestamp) if timestamp > since => files.push(SourceFile { key, timestamp }),
            Some(_) => {}
            None => debug!(key = %key, "skipping object with unexpected name"),
        }
    }
    files.sort_by_key(|f| f.timestamp);
    Ok(files)
}

pub async fn read_postings(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Vec<JobPosting>, StorageError> {
    let bytes = store.get(key).await?;
    let text = String::from_utf8(bytes).map_err(|_| StorageError::NotUtf8 {
        key: key.to_string(),
    })?;
    parse_json_lines(&text).map_err(|source| StorageError::Record {
        key: key.to_string(),
        source,
    })
}

pub async fn write_processed_postings(
    store: &dyn ObjectStore,
    prefix: &str,
    group_id: i64,
    postings: &[ProcessedJobPosting],
) -> Result<String, StorageError> {
    let key = object_key(prefix, group_id);
    let body = render_json_lines(postings).map_err(|source| StorageError::Record {
        key: key.clone(),
        source,
    })?;
    store.put(&key, body.into_bytes()).await?;
    Ok(key)
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache returned {actual} values for {expected} keys")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl Retryable for CacheError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            CacheError::Redis(err)
                if err.is_io_error()
                    || err.is_timeout()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal() =>
            {
                RetryDisposition::Retryable
            }
            CacheError::Unavailable(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Seniority levels rendered as strings, keyed by cache key hex.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;
    async fn set_many(&self, entries: &[(String, String)]) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        // explicit MGET: a single-key mget would otherwise be sent as GET
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        if values.len() != keys.len() {
            return Err(CacheError::LengthMismatch {
                expected: keys.len(),
                actual: values.len(),
            });
        }
        Ok(values)
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("MSET").arg(entries).query_async(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheCallLog {
    pub reads: Vec<Vec<String>>,
    pub writes: Vec<Vec<(String, String)>>,
}

/// In-process cache store that records every bulk call.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
    calls: Mutex<CacheCallLog>,
    failures_remaining: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let cache = Self::default();
        {
            let mut map = cache.entries.lock().unwrap_or_else(|e| e.into_inner());
            map.extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        }
        cache
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn call_log(&self) -> CacheCallLog {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make the next `count` calls fail with a retryable error.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), CacheError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CacheError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        self.take_failure()?;
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reads
            .push(keys.to_vec());
        let map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys.iter().map(|k| map.get(k).cloned()).collect())
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<(), CacheError> {
        self.take_failure()?;
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .writes
            .push(entries.to_vec());
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        map.extend(entries.iter().cloned());
        Ok(())
    }
}

const COMPANY_PREFIXES: &[&str] = &[
    "Agile",
    "Cloud",
    "Code",
    "Data",
    "Dev",
    "Info",
    "Innova",
    "Innovate",
    "Logic",
    "Quick",
    "Rev",
    "Soft",
    "Tech",
    "Web",
    "Cyber",
    "Full",
    "IT",
    "Machine",
    "Mobile",
];

const COMPANY_SUFFIXES: &[&str] = &[
    "AI",
    "Craft",
    "Edge",
    "Flow",
    "Link",
    "Net",
    "Prime",
    "Soft",
    "Solve",
    "Sync",
    "Sys",
    "Tech",
    "Tek",
    "Ware",
    "Works",
    "X",
    "Z",
    "Y",
];

const TITLES: &[&str] = &[
    "Junior Frontend Developer",
    "Senior Backend Engineer",
    "Data Scientist",
    "Product Manager",
    "UX Designer",
    "DevOps Engineer",
    "Machine Learning Engineer",
    "Software Architect",
    "Security Analyst",
    "Cloud Solutions Architect",
    "QA Engineer",
    "Technical Writer",
    "Systems Engineer",
    "Network Administrator",
    "Database Administrator",
    "Business Analyst",
    "Scrum Master",
    "IT Support Specialist",
    "Full Stack Developer",
    "AI Research Scientist",
    "Cybersecurity Specialist",
    "Web Developer",
    "Mobile App Developer",
    "Systems Analyst",
    "Network Engineer",
    "Software Engineer",
    "Data Engineer",
    "Technical Project Manager",
    "UI/UX Designer",
    "Cloud Engineer",
    "Product Designer",
    "Data Analyst",
    "Software Developer",
    "IT Manager",
    "IT Director",
    "CTO",
    "CIO",
    "CEO",
    "COO",
    "CFO",
    "VP of Engineering",
    "VP of Product",
    "VP of Marketing",
    "VP of Sales",
    "VP of Operations",
    "VP of Finance",
    "VP of HR",
    "VP of IT",
    "VP of Business Development",
    "VP of Customer Success",
    "VP of Partnerships",
    "VP of Strategy",
    "VP of Analytics",
    "VP of Research",
    "VP of Compliance",
    "VP of Legal",
    "VP of Administration",
    "VP of Services",
    "VP of Support",
    "VP of Training",
    "VP of Quality",
    "VP of Procurement",
    "VP of Logistics",
    "VP of Supply Chain",
    "VP of Manufacturing",
    "VP of Distribution",
    "VP of Retail",
    "VP of E-commerce",
    "VP of Real Estate",
    "VP of Construction",
];

const LOCATIONS: &[&str] = &[
    "Boston, MA",
    "San Francisco, CA",
    "New York, NY",
    "Austin, TX",
    "Seattle, WA",
    "Chicago, IL",
];

#[derive(Debug)]
pub struct SampleGenerator {
    rng: StdRng,
}

impl SampleGenerator {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    fn pick(&mut self, options: &[&'static str]) -> &'static str {
        options.choose(&mut self.rng).copied().unwrap_or_default()
    }

    pub fn posting(&mut self, scraped_on: i64) -> JobPosting {
        let prefix = self.pick(COMPANY_PREFIXES);
        let suffix = self.pick(COMPANY_SUFFIXES);
        let company = format!("{prefix}{suffix}");
        let title = self.pick(TITLES);
        let location = self.pick(LOCATIONS);
        let cache_key = CacheKey::for_company_title(&company, title);
        JobPosting {
            url: format!(
                "https://www.{}.ai/job/{}/",
                company.to_ascii_lowercase(),
                cache_key.to_hex()
            ),
            company,
            title: title.to_string(),
            location: location.to_string(),
            scraped_on,
        }
    }

    /// Split `total` postings into groups of `per_file`, each named after its last
    /// posting's timestamp. Group timestamps strictly increase.
    pub fn generate(
        &mut self,
        total: usize,
        per_file: usize,
        start_timestamp: i64,
    ) -> Vec<(i64, Vec<JobPosting>)> {
        let per_file = per_file.max(1);
        let mut files = Vec::new();
        let mut current = start_timestamp;
        let mut remaining = total;

        while remaining > 0 {
            let count = remaining.min(per_file);
            let mut postings = Vec::with_capacity(count);
            for _ in 0..count {
                postings.push(self.posting(current));
                current += self.rng.gen_range(0..=1);
            }
            let file_timestamp = postings.last().map(|p| p.scraped_on).unwrap_or(current);
            current = current.max(file_timestamp + 1);
            files.push((file_timestamp, postings));
            remaining -= count;
        }
        files
    }
}

pub async fn write_sample_files(
    store: &dyn ObjectStore,
    prefix: &str,
    files: &[(i64, Vec<JobPosting>)],
) -> Result<Vec<String>, StorageError> {
    let mut keys = Vec::with_capacity(files.len());
    for (timestamp, postings) in files {
        let key = object_key(prefix, *timestamp);
        let body = render_json_lines(postings).map_err(|source| StorageError::Record {
            key: key.clone(),
            source,
        })?;
        store.put(&key, body.into_bytes()).await?;
        keys.push(key);
    }
    Ok(keys)
}
