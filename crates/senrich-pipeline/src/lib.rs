//! Streaming seniority enrichment: cache-aside batching, deduplicated inference and
//! per-file completion tracking, one tokio task per stage.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use senrich_core::{CacheKey, DedupKey, Identity, JobPosting, Manifest, ProcessedJobPosting};
use senrich_inference::{
    HttpInferenceClient, InferenceClient, LocalInferenceClient, SeniorityRequest,
    SeniorityRequestBatch,
};
use senrich_storage::{
    list_new_files, read_postings, retry_with_backoff, write_processed_postings, BackoffPolicy,
    CacheStore, FsObjectStore, MemoryCache, ObjectStore, RedisCache, SourceFile, StorageError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "senrich-pipeline";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub bucket_dir: PathBuf,
    pub download_prefix: String,
    pub upload_prefix: String,
    pub redis_url: String,
    pub inference_url: String,
    pub cache_batch_size: usize,
    pub inference_batch_size: usize,
    pub check_interval_secs: u64,
    pub start_timestamp: i64,
    pub orphan_ttl_secs: u64,
    pub progress_log_interval: u64,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket_dir: PathBuf::from("./bucket"),
            download_prefix: "job-postings-raw".to_string(),
            upload_prefix: "job-postings-mod".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            inference_url: "http://localhost:50051".to_string(),
            cache_batch_size: 1000,
            inference_batch_size: 1000,
            check_interval_secs: 30,
            start_timestamp: 0,
            orphan_ttl_secs: 600,
            progress_log_interval: 100,
            http_timeout_secs: 20,
            max_retries: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 5000,
        }
    }
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bucket_dir: std::env::var("SENRICH_BUCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.bucket_dir),
            download_prefix: std::env::var("SENRICH_DOWNLOAD_PREFIX")
                .unwrap_or(defaults.download_prefix),
            upload_prefix: std::env::var("SENRICH_UPLOAD_PREFIX").unwrap_or(defaults.upload_prefix),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            inference_url: std::env::var("SENRICH_INFERENCE_URL")
                .unwrap_or(defaults.inference_url),
            cache_batch_size: env_parsed("SENRICH_CACHE_BATCH_SIZE", defaults.cache_batch_size),
            inference_batch_size: env_parsed(
                "SENRICH_INFERENCE_BATCH_SIZE",
                defaults.inference_batch_size,
            ),
            check_interval_secs: env_parsed(
                "SENRICH_CHECK_INTERVAL_SECS",
                defaults.check_interval_secs,
            ),
            start_timestamp: env_parsed("SENRICH_START_TIMESTAMP", defaults.start_timestamp),
            orphan_ttl_secs: env_parsed("SENRICH_ORPHAN_TTL_SECS", defaults.orphan_ttl_secs),
            progress_log_interval: env_parsed(
                "SENRICH_PROGRESS_LOG_INTERVAL",
                defaults.progress_log_interval,
            ),
            http_timeout_secs: env_parsed("SENRICH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            max_retries: env_parsed("SENRICH_MAX_RETRIES", defaults.max_retries),
            retry_base_delay_ms: env_parsed(
                "SENRICH_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            ),
            retry_max_delay_ms: env_parsed(
                "SENRICH_RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay_ms,
            ),
        }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn orphan_ttl(&self) -> Duration {
        Duration::from_secs(self.orphan_ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionStats {
    pub files_ingested: usize,
    pub files_rejected: usize,
    pub postings_ingested: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStageStats {
    pub batches: usize,
    pub keys_looked_up: usize,
    pub hits: usize,
    pub misses: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InferenceStageStats {
    pub batches: usize,
    pub request_entries: usize,
    pub postings_enriched: usize,
    pub cache_writes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompletionStats {
    pub postings_received: usize,
    pub groups_flushed: usize,
    pub postings_flushed: usize,
    pub orphans_parked: usize,
    pub orphans_reconciled: usize,
    pub orphans_evicted: usize,
    pub manifests_ignored: usize,
    pub groups_left_open: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingestion: IngestionStats,
    pub cache: CacheStageStats,
    pub inference: InferenceStageStats,
    pub completion: CompletionStats,
}

fn forward<T>(tx: &UnboundedSender<T>, item: T, downstream: &str) -> Result<()> {
    tx.send(item)
        .map_err(|_| anyhow!("{downstream} stage is no longer receiving"))
}

/// Polls the download prefix and feeds postings plus one manifest per file.
pub struct IngestionProducer {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    cursor: i64,
    check_interval: Duration,
    backoff: BackoffPolicy,
    once: bool,
}

impl IngestionProducer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        start_timestamp: i64,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            cursor: start_timestamp,
            check_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            once: false,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Return once no new file is found instead of polling forever.
    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    pub async fn run(
        mut self,
        postings_tx: UnboundedSender<JobPosting>,
        manifests_tx: UnboundedSender<Manifest>,
    ) -> Result<IngestionStats> {
        let mut stats = IngestionStats::default();
        loop {
            debug!(cursor = self.cursor, "checking for new files");
            let files = retry_with_backoff(&self.backoff, "object_store.list", || {
                list_new_files(self.store.as_ref(), &self.prefix, self.cursor)
            })
            .await
            .with_context(|| format!("listing new files under {}", self.prefix))?;

            if files.is_empty() {
                if self.once {
                    info!(?stats, "no new files; ingestion finished");
                    return Ok(stats);
                }
                debug!(wait_secs = self.check_interval.as_secs(), "no new files; waiting");
                tokio::time::sleep(self.check_interval).await;
                continue;
            }

            for file in files {
                self.ingest_file(&file, &postings_tx, &manifests_tx, &mut stats)
                    .await?;
                self.cursor = file.timestamp;
            }
        }
    }

    async fn ingest_file(
        &self,
        file: &SourceFile,
        postings_tx: &UnboundedSender<JobPosting>,
        manifests_tx: &UnboundedSender<Manifest>,
        stats: &mut IngestionStats,
    ) -> Result<()> {
        info!(key = %file.key, "found new file to ingest");
        let read = retry_with_backoff(&self.backoff, "object_store.get", || {
            read_postings(self.store.as_ref(), &file.key)
        })
        .await;

        let postings = match read {
            Ok(postings) => postings,
            Err(err @ (StorageError::Record { .. } | StorageError::NotUtf8 { .. })) => {
                error!(key = %file.key, error = %err, "rejecting file with malformed records");
                stats.files_rejected += 1;
                return Ok(());
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", file.key)),
        };

        let manifest = Manifest::for_postings(file.timestamp, &postings);
        let count = postings.len();
        for posting in postings {
            forward(postings_tx, posting, "cache")?;
        }
        // identities are only announced after every posting of the file was queued
        forward(manifests_tx, manifest, "completion")?;

        stats.files_ingested += 1;
        stats.postings_ingested += count;
        info!(key = %file.key, postings = count, "finished ingesting file");
        Ok(())
    }
}

/// Batches cache lookups by company/title; hits go to completion, misses to inference.
pub struct CacheAsideBatcher {
    cache: Arc<dyn CacheStore>,
    batch_size: usize,
    backoff: BackoffPolicy,
    pending: IndexMap<CacheKey, Vec<JobPosting>>,
    stats: CacheStageStats,
}

impl CacheAsideBatcher {
    pub fn new(cache: Arc<dyn CacheStore>, batch_size: usize, backoff: BackoffPolicy) -> Self {
        Self {
            cache,
            batch_size: batch_size.max(1),
            backoff,
            pending: IndexMap::new(),
            stats: CacheStageStats::default(),
        }
    }

    fn push(&mut self, posting: JobPosting) {
        self.pending
            .entry(posting.cache_key())
            .or_default()
            .push(posting);
    }

    fn is_full(&self) -> bool {
        self.pending.len() >= self.batch_size
    }

    pub async fn run(
        mut self,
        mut postings_rx: UnboundedReceiver<JobPosting>,
        enriched_tx: UnboundedSender<ProcessedJobPosting>,
        misses_tx: UnboundedSender<JobPosting>,
    ) -> Result<CacheStageStats> {
        while let Some(posting) = postings_rx.recv().await {
            self.push(posting);
            // flush on a full batch or as soon as the queue runs dry
            while !self.is_full() {
                match postings_rx.try_recv() {
                    Ok(posting) => self.push(posting),
                    Err(_) => break,
                }
            }
            self.flush(&enriched_tx, &misses_tx).await?;
        }
        debug!(stats = ?self.stats, "cache stage input closed");
        Ok(self.stats)
    }

    async fn flush(
        &mut self,
        enriched_tx: &UnboundedSender<ProcessedJobPosting>,
        misses_tx: &UnboundedSender<JobPosting>,
    ) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        let keys: Vec<String> = batch.keys().map(CacheKey::to_hex).collect();
        let values = retry_with_backoff(&self.backoff, "cache.get_many", || {
            self.cache.get_many(&keys)
        })
        .await
        .context("bulk cache read")?;
        if values.len() != keys.len() {
            bail!(
                "cache returned {} values for {} keys",
                values.len(),
                keys.len()
            );
        }

        self.stats.batches += 1;
        self.stats.keys_looked_up += keys.len();
        let (mut hits, mut misses) = (0usize, 0usize);

        for ((key, postings), value) in batch.into_iter().zip(values) {
            let seniority = match value.as_deref().map(|v| v.trim().parse::<i32>()) {
                Some(Ok(seniority)) => Some(seniority),
                Some(Err(_)) => {
                    warn!(
                        cache_key = %key,
                        value = ?value,
                        "unparseable cached seniority; treating as miss"
                    );
                    None
                }
                None => None,
            };
            match seniority {
                Some(seniority) => {
                    hits += postings.len();
                    for posting in postings {
                        forward(enriched_tx, posting.with_seniority(seniority), "completion")?;
                    }
                }
                None => {
                    misses += postings.len();
                    for posting in postings {
                        forward(misses_tx, posting, "inference")?;
                    }
                }
            }
        }

        self.stats.hits += hits;
        self.stats.misses += misses;
        debug!(keys = keys.len(), hits, misses, "cache batch flushed");
        Ok(())
    }
}

pub struct InferenceBatcher {
    client: Arc<dyn InferenceClient>,
    cache: Arc<dyn CacheStore>,
    batch_size: usize,
    backoff: BackoffPolicy,
    pending: IndexMap<DedupKey, Vec<JobPosting>>,
    stats: InferenceStageStats,
}

impl InferenceBatcher {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        cache: Arc<dyn CacheStore>,
        batch_size: usize,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            cache,
            batch_size: batch_size.max(1),
            backoff,
            pending: IndexMap::new(),
            stats: InferenceStageStats::default(),
        }
    }

    fn push(&mut self, posting: JobPosting) {
        self.pending
            .entry(posting.dedup_key())
            .or_default()
            .push(posting);
    }

    fn is_full(&self) -> bool {
        self.pending.len() >= self.batch_size
    }

    pub async fn run(
        mut self,
        mut misses_rx: UnboundedReceiver<JobPosting>,
        enriched_tx: UnboundedSender<ProcessedJobPosting>,
    ) -> Result<InferenceStageStats> {
        while let Some(posting) = misses_rx.recv().await {
            self.push(posting);
            while !self.is_full() {
                match misses_rx.try_recv() {
                    Ok(posting) => self.push(posting),
                    Err(_) => break,
                }
            }
            self.flush(&enriched_tx).await?;
        }
        debug!(stats = ?self.stats, "inference stage input closed");
        Ok(self.stats)
    }

    async fn flush(&mut self, enriched_tx: &UnboundedSender<ProcessedJobPosting>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut groups = std::mem::take(&mut self.pending);
        // one wire entry per dedup key, taken from the group's first posting
        let request = SeniorityRequestBatch {
            batch: groups
                .iter()
                .filter_map(|(dedup_key, postings)| {
                    postings.first().map(|rep| SeniorityRequest {
                        dedup_key: *dedup_key,
                        company: rep.company.clone(),
                        title: rep.title.clone(),
                    })
                })
                .collect(),
        };

        let response = retry_with_backoff(&self.backoff, "inference.infer_batch", || {
            self.client.infer_batch(&request)
        })
        .await
        .context("seniority inference batch")?;
        self.stats.batches += 1;
        self.stats.request_entries += request.batch.len();

        let mut staged: IndexMap<String, String> = IndexMap::new();
        for answer in response.batch {
            let Some(postings) = groups.swap_remove(&answer.dedup_key) else {
                warn!(
                    dedup_key = %answer.dedup_key,
                    "inference answered a key that was not requested"
                );
                continue;
            };
            if let Some(rep) = postings.first() {
                staged.insert(rep.cache_key().to_hex(), answer.seniority.to_string());
            }
            self.stats.postings_enriched += postings.len();
            for posting in postings {
                forward(enriched_tx, posting.with_seniority(answer.seniority), "completion")?;
            }
        }

        if !groups.is_empty() {
            let dropped: usize = groups.values().map(Vec::len).sum();
            warn!(
                missing_keys = groups.len(),
                postings = dropped,
                "inference response omitted requested keys; postings not forwarded"
            );
        }

        if !staged.is_empty() {
            let entries: Vec<(String, String)> = staged.into_iter().collect();
            retry_with_backoff(&self.backoff, "cache.set_many", || {
                self.cache.set_many(&entries)
            })
            .await
            .context("bulk cache write")?;
            self.stats.cache_writes += entries.len();
        }
        debug!(entries = request.batch.len(), "inference batch flushed");
        Ok(())
    }
}

#[async_trait]
pub trait GroupSink: Send + Sync {
    async fn write_group(&self, group_id: i64, postings: &[ProcessedJobPosting]) -> Result<()>;
}

/// Writes each completed group to `{prefix}/{group_id}.jsonl`.
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    backoff: BackoffPolicy,
}

impl ObjectStoreSink {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            backoff,
        }
    }
}

#[async_trait]
impl GroupSink for ObjectStoreSink {
    async fn write_group(&self, group_id: i64, postings: &[ProcessedJobPosting]) -> Result<()> {
        info!(group_id, postings = postings.len(), "uploading processed postings");
        let key = retry_with_backoff(&self.backoff, "object_store.put", || {
            write_processed_postings(self.store.as_ref(), &self.prefix, group_id, postings)
        })
        .await
        .with_context(|| format!("uploading group {group_id}"))?;
        info!(key = %key, "finished upload");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedGroup {
    pub group_id: i64,
    pub postings: Vec<ProcessedJobPosting>,
}

#[derive(Debug, Default)]
struct OpenGroup {
    expected: HashSet<Identity>,
    collected: Vec<ProcessedJobPosting>,
}

#[derive(Debug)]
struct Orphan {
    posting: ProcessedJobPosting,
    parked_at: Instant,
}

/// Postings nobody expects yet are parked by identity until a manifest claims them or
/// `orphan_ttl` passes. A flushed group never reopens.
#[derive(Debug)]
pub struct CompletionTracker {
    groups: BTreeMap<i64, OpenGroup>,
    orphans: HashMap<Identity, Vec<Orphan>>,
    completed: HashSet<i64>,
    orphan_ttl: Duration,
    stats: CompletionStats,
}

impl CompletionTracker {
    pub fn new(orphan_ttl: Duration) -> Self {
        Self {
            groups: BTreeMap::new(),
            orphans: HashMap::new(),
            completed: HashSet::new(),
            orphan_ttl,
            stats: CompletionStats::default(),
        }
    }

    pub fn stats(&self) -> CompletionStats {
        self.stats
    }

    pub fn outstanding(&self) -> Vec<(i64, usize)> {
        self.groups
            .iter()
            .map(|(id, group)| (*id, group.expected.len()))
            .collect()
    }

    pub fn expected(&self, group_id: i64) -> Option<&HashSet<Identity>> {
        self.groups.get(&group_id).map(|g| &g.expected)
    }

    pub fn parked_orphans(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }

    pub fn on_manifest(&mut self, manifest: Manifest) -> Option<CompletedGroup> {
        let Manifest { group_id, expected } = manifest;
        if self.completed.contains(&group_id) {
            warn!(group_id, "manifest for an already flushed group; ignoring");
            self.stats.manifests_ignored += 1;
            return None;
        }

        let group = self.groups.entry(group_id).or_default();
        if !group.expected.is_empty() {
            warn!(group_id, "duplicate manifest; replacing expected identities");
        }
        group.expected = expected;

        let waiting: Vec<Identity> = group
            .expected
            .iter()
            .filter(|identity| self.orphans.contains_key(*identity))
            .copied()
            .collect();
        for identity in waiting {
            let Some(parked) = self.orphans.get_mut(&identity) else {
                continue;
            };
            let orphan = parked.remove(0);
            if parked.is_empty() {
                self.orphans.remove(&identity);
            }
            group.expected.remove(&identity);
            group.collected.push(orphan.posting);
            self.stats.orphans_reconciled += 1;
        }

        if group.expected.is_empty() {
            return self.complete(group_id);
        }
        None
    }

    pub fn on_posting(
        &mut self,
        posting: ProcessedJobPosting,
        now: Instant,
    ) -> Vec<CompletedGroup> {
        self.stats.postings_received += 1;
        let identity = posting.identity();
        let mut matched = Vec::new();
        for (group_id, group) in self.groups.iter_mut() {
            if group.expected.remove(&identity) {
                group.collected.push(posting.clone());
                matched.push((*group_id, group.expected.is_empty()));
            }
        }

        if matched.is_empty() {
            self.stats.orphans_parked += 1;
            self.orphans.entry(identity).or_default().push(Orphan {
                posting,
                parked_at: now,
            });
            return Vec::new();
        }

        matched
            .into_iter()
            .filter(|(_, done)| *done)
            .filter_map(|(group_id, _)| self.complete(group_id))
            .collect()
    }

    /// Drop parked postings older than the TTL; returns how many were dropped.
    pub fn evict_orphans(&mut self, now: Instant) -> usize {
        let ttl = self.orphan_ttl;
        let mut evicted = 0usize;
        self.orphans.retain(|_, parked| {
            let before = parked.len();
            parked.retain(|o| now.saturating_duration_since(o.parked_at) < ttl);
            evicted += before - parked.len();
            !parked.is_empty()
        });
        self.stats.orphans_evicted += evicted;
        evicted
    }

    fn complete(&mut self, group_id: i64) -> Option<CompletedGroup> {
        let group = self.groups.remove(&group_id)?;
        debug_assert!(group.expected.is_empty());
        self.completed.insert(group_id);
        self.stats.groups_flushed += 1;
        self.stats.postings_flushed += group.collected.len();
        Some(CompletedGroup {
            group_id,
            postings: group.collected,
        })
    }

    fn sweep_period(&self) -> Duration {
        (self.orphan_ttl / 4).max(Duration::from_secs(1))
    }

    fn finish(mut self) -> CompletionStats {
        for (group_id, outstanding) in self.outstanding() {
            warn!(group_id, outstanding, "group still incomplete when inputs closed");
        }
        self.stats.groups_left_open = self.groups.len();
        self.stats
    }
}

/// `group:missing` pairs, e.g. `1700000100:3 1700000200:12`.
pub fn render_outstanding(outstanding: &[(i64, usize)]) -> String {
    outstanding
        .iter()
        .map(|(group_id, missing)| format!("{group_id}:{missing}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub async fn run_completion_stage(
    mut tracker: CompletionTracker,
    mut postings_rx: UnboundedReceiver<ProcessedJobPosting>,
    mut manifests_rx: UnboundedReceiver<Manifest>,
    sink: Arc<dyn GroupSink>,
    progress_log_interval: u64,
) -> Result<CompletionStats> {
    let mut sweep = tokio::time::interval(tracker.sweep_period());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut postings_open = true;
    let mut manifests_open = true;

    while postings_open || manifests_open {
        tokio::select! {
            received = postings_rx.recv(), if postings_open => match received {
                Some(posting) => {
                    let completed = tracker.on_posting(posting, Instant::now());
                    let processed = tracker.stats().postings_received as u64;
                    if progress_log_interval > 0 && processed % progress_log_interval == 0 {
                        let outstanding = tracker.outstanding();
                        info!(
                            processed,
                            open_groups = outstanding.len(),
                            outstanding = %render_outstanding(&outstanding),
                            "completion progress"
                        );
                    }
                    for group in completed {
                        sink.write_group(group.group_id, &group.postings).await?;
                    }
                }
                None => postings_open = false,
            },
            received = manifests_rx.recv(), if manifests_open => match received {
                Some(manifest) => {
                    debug!(
                        group_id = manifest.group_id,
                        expected = manifest.expected.len(),
                        "manifest received"
                    );
                    if let Some(group) = tracker.on_manifest(manifest) {
                        sink.write_group(group.group_id, &group.postings).await?;
                    }
                }
                None => manifests_open = false,
            },
            _ = sweep.tick() => {
                let evicted = tracker.evict_orphans(Instant::now());
                if evicted > 0 {
                    warn!(evicted, "dropped processed postings that no manifest claimed in time");
                }
            }
        }
    }

    let stats = tracker.finish();
    info!(?stats, "completion stage finished");
    Ok(stats)
}

enum StageReport {
    Ingestion(IngestionStats),
    Cache(CacheStageStats),
    Inference(InferenceStageStats),
    Completion(CompletionStats),
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn CacheStore>,
    inference: Arc<dyn InferenceClient>,
    sink: Arc<dyn GroupSink>,
    once: bool,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        cache: Arc<dyn CacheStore>,
        inference: Arc<dyn InferenceClient>,
    ) -> Self {
        let sink = Arc::new(ObjectStoreSink::new(
            store.clone(),
            config.upload_prefix.clone(),
            config.backoff(),
        ));
        Self {
            config,
            store,
            cache,
            inference,
            sink,
            once: false,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn GroupSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Stop once the download prefix holds no new file and every queue has drained.
    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    pub async fn run(self) -> Result<PipelineSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pipeline", %run_id);
        let backoff = self.config.backoff();

        let (postings_tx, postings_rx) = mpsc::unbounded_channel();
        let (misses_tx, misses_rx) = mpsc::unbounded_channel();
        let (enriched_tx, enriched_rx) = mpsc::unbounded_channel();
        let (manifests_tx, manifests_rx) = mpsc::unbounded_channel();

        let producer = IngestionProducer::new(
            self.store.clone(),
            self.config.download_prefix.clone(),
            self.config.start_timestamp,
        )
        .with_check_interval(self.config.check_interval())
        .with_backoff(backoff)
        .once(self.once);
        let cache_stage =
            CacheAsideBatcher::new(self.cache.clone(), self.config.cache_batch_size, backoff);
        let inference_stage = InferenceBatcher::new(
            self.inference.clone(),
            self.cache.clone(),
            self.config.inference_batch_size,
            backoff,
        );
        let tracker = CompletionTracker::new(self.config.orphan_ttl());

        let mut stages = JoinSet::new();
        stages.spawn(
            async move {
                producer
                    .run(postings_tx, manifests_tx)
                    .await
                    .map(StageReport::Ingestion)
            }
            .instrument(span.clone()),
        );
        let cache_enriched_tx = enriched_tx.clone();
        stages.spawn(
            async move {
                cache_stage
                    .run(postings_rx, cache_enriched_tx, misses_tx)
                    .await
                    .map(StageReport::Cache)
            }
            .instrument(span.clone()),
        );
        stages.spawn(
            async move {
                inference_stage
                    .run(misses_rx, enriched_tx)
                    .await
                    .map(StageReport::Inference)
            }
            .instrument(span.clone()),
        );
        let sink = self.sink.clone();
        let progress_log_interval = self.config.progress_log_interval;
        stages.spawn(
            async move {
                run_completion_stage(
                    tracker,
                    enriched_rx,
                    manifests_rx,
                    sink,
                    progress_log_interval,
                )
                .await
                    .map(StageReport::Completion)
            }
            .instrument(span.clone()),
        );

        span.in_scope(|| info!(once = self.once, "pipeline started"));

        let mut summary = PipelineSummary {
            run_id,
            started_at,
            finished_at: started_at,
            ingestion: IngestionStats::default(),
            cache: CacheStageStats::default(),
            inference: InferenceStageStats::default(),
            completion: CompletionStats::default(),
        };

        while let Some(joined) = stages.join_next().await {
            let report = match joined {
                Ok(Ok(report)) => report,
                Ok(Err(err)) => {
                    error!(%run_id, error = %format!("{err:#}"), "pipeline stage failed; stopping");
                    stages.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    stages.abort_all();
                    return Err(anyhow!("pipeline stage did not complete: {join_err}"));
                }
            };
            match report {
                StageReport::Ingestion(stats) => summary.ingestion = stats,
                StageReport::Cache(stats) => summary.cache = stats,
                StageReport::Inference(stats) => summary.inference = stats,
                StageReport::Completion(stats) => summary.completion = stats,
            }
        }

        summary.finished_at = Utc::now();
        info!(%run_id, groups = summary.completion.groups_flushed, "pipeline finished");
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub once: bool,
    pub memory_cache: bool,
    pub local_model: bool,
}

pub async fn run_pipeline(config: PipelineConfig, options: RunOptions) -> Result<PipelineSummary> {
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.bucket_dir.clone()));
    let cache: Arc<dyn CacheStore> = if options.memory_cache {
        Arc::new(MemoryCache::new())
    } else {
        Arc::new(
            RedisCache::connect(&config.redis_url)
                .await
                .with_context(|| format!("connecting to {}", config.redis_url))?,
        )
    };
    let inference: Arc<dyn InferenceClient> = if options.local_model {
        Arc::new(LocalInferenceClient::new())
    } else {
        Arc::new(
            HttpInferenceClient::new(
                &config.inference_url,
                Duration::from_secs(config.http_timeout_secs),
            )
            .context("building inference client")?,
        )
    };

    Pipeline::new(config, store, cache, inference)
        .once(options.once)
        .run()
        .await
}

pub async fn run_pipeline_from_env(options: RunOptions) -> Result<PipelineSummary> {
    run_pipeline(PipelineConfig::from_env(), options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use senrich_inference::{
        InferenceError, MockSeniorityModel, SeniorityResponse, SeniorityResponseBatch,
    };
    use std::sync::Mutex;

    fn posting(company: &str, title: &str, location: &str, scraped_on: i64) -> JobPosting {
        JobPosting::new(
            format!("https://{}.ai/job/{}", company.to_lowercase(), scraped_on),
            company,
            title,
            location,
            scraped_on,
        )
    }

    fn instant() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    async fn run_cache_stage(
        cache: Arc<MemoryCache>,
        batch_size: usize,
        backoff: BackoffPolicy,
        input: Vec<JobPosting>,
    ) -> (Result<CacheStageStats>, Vec<ProcessedJobPosting>, Vec<JobPosting>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (enriched_tx, mut enriched_rx) = mpsc::unbounded_channel();
        let (misses_tx, mut misses_rx) = mpsc::unbounded_channel();
        for p in input {
            tx.send(p).unwrap();
        }
        drop(tx);
        let stats = CacheAsideBatcher::new(cache, batch_size, backoff)
            .run(rx, enriched_tx, misses_tx)
            .await;
        (stats, drain(&mut enriched_rx), drain(&mut misses_rx))
    }

    async fn run_inference_stage(
        client: Arc<LocalInferenceClient>,
        cache: Arc<MemoryCache>,
        batch_size: usize,
        input: Vec<JobPosting>,
    ) -> (InferenceStageStats, Vec<ProcessedJobPosting>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (enriched_tx, mut enriched_rx) = mpsc::unbounded_channel();
        for p in input {
            tx.send(p).unwrap();
        }
        drop(tx);
        let stats = InferenceBatcher::new(client, cache, batch_size, instant())
            .run(rx, enriched_tx)
            .await
            .unwrap();
        (stats, drain(&mut enriched_rx))
    }

    #[tokio::test]
    async fn cache_batch_routes_hits_and_misses() {
        let hit_a = posting("Acme", "CTO", "Boston, MA", 1);
        let hit_b = posting("Globex", "Data Scientist", "Austin, TX", 2);
        let miss_1 = posting("Initech", "QA Engineer", "Seattle, WA", 3);
        let miss_2 = posting("Initech", "QA Engineer", "Chicago, IL", 4);
        let cache = Arc::new(MemoryCache::with_entries([
            (hit_a.cache_key().to_hex(), "5".to_string()),
            (hit_b.cache_key().to_hex(), "3".to_string()),
        ]));

        let (stats, enriched, misses) = run_cache_stage(
            cache.clone(),
            10,
            instant(),
            vec![hit_a.clone(), miss_1.clone(), hit_b.clone(), miss_2.clone()],
        )
        .await;
        let stats = stats.unwrap();

        assert_eq!(
            enriched,
            vec![hit_a.with_seniority(5), hit_b.with_seniority(3)]
        );
        assert_eq!(misses, vec![miss_1, miss_2]);
        assert_eq!(cache.call_log().reads.len(), 1);
        assert_eq!(cache.call_log().reads[0].len(), 3);
        assert_eq!(
            stats,
            CacheStageStats {
                batches: 1,
                keys_looked_up: 3,
                hits: 2,
                misses: 2
            }
        );
    }

    #[tokio::test]
    async fn cache_batches_are_bounded_by_distinct_keys() {
        let cache = Arc::new(MemoryCache::new());
        let titles = ["CTO", "QA Engineer", "Data Scientist", "Scrum Master", "UX Designer"];
        let mut input: Vec<_> = titles
            .iter()
            .enumerate()
            .map(|(i, t)| posting("Acme", t, "Boston, MA", i as i64))
            .collect();
        // repeats of the first key do not count against the batch size
        input.insert(1, posting("Acme", "CTO", "Austin, TX", 99));

        let (stats, enriched, misses) = run_cache_stage(cache.clone(), 2, instant(), input).await;
        assert!(stats.is_ok());
        assert!(enriched.is_empty());
        assert_eq!(misses.len(), 6);

        let sizes: Vec<_> = cache.call_log().reads.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn unparseable_cache_value_is_a_miss() {
        let p = posting("Acme", "CTO", "Boston, MA", 1);
        let cache = Arc::new(MemoryCache::with_entries([(p.cache_key().to_hex(), "senior")]));
        let (_, enriched, misses) = run_cache_stage(cache, 10, instant(), vec![p.clone()]).await;
        assert!(enriched.is_empty());
        assert_eq!(misses, vec![p]);
    }

    #[tokio::test]
    async fn cache_failures_retry_then_become_fatal() {
        let p = posting("Acme", "CTO", "Boston, MA", 1);
        let cache = Arc::new(MemoryCache::new());
        cache.fail_next(2);
        let (stats, _, misses) =
            run_cache_stage(cache.clone(), 10, instant(), vec![p.clone()]).await;
        assert!(stats.is_ok());
        assert_eq!(misses.len(), 1);

        cache.fail_next(1);
        let (stats, _, misses) =
            run_cache_stage(cache, 10, BackoffPolicy::no_retries(), vec![p]).await;
        assert!(stats.is_err());
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn same_company_title_shares_one_inference_entry_and_cache_write() {
        let boston = posting("Acme", "Engineer", "Boston, MA", 1);
        let austin = posting("Acme", "Engineer", "Austin, TX", 2);
        let other = posting("Acme", "Senior Backend Engineer", "Boston, MA", 3);
        let client = Arc::new(LocalInferenceClient::new());
        let cache = Arc::new(MemoryCache::new());

        let (stats, enriched) = run_inference_stage(
            client.clone(),
            cache.clone(),
            10,
            vec![boston.clone(), austin.clone(), other.clone()],
        )
        .await;

        let calls = client.call_log();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].batch.len(), 2);
        assert_eq!(calls[0].batch[0].dedup_key, boston.dedup_key());
        assert_eq!(calls[0].batch[0].company, "Acme");
        assert_eq!(calls[0].batch[0].title, "Engineer");

        let expected_level = MockSeniorityModel.seniority_for("Acme", "Engineer");
        assert!(enriched.contains(&boston.clone().with_seniority(expected_level)));
        assert!(enriched.contains(&austin.with_seniority(expected_level)));
        assert!(enriched.contains(&other.clone().with_seniority(3)));

        let writes = cache.call_log().writes;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 2);
        assert_eq!(
            cache.get(&boston.cache_key().to_hex()),
            Some(expected_level.to_string())
        );
        assert_eq!(cache.get(&other.cache_key().to_hex()), Some("3".to_string()));
        assert_eq!(
            stats,
            InferenceStageStats {
                batches: 1,
                request_entries: 2,
                postings_enriched: 3,
                cache_writes: 2
            }
        );
    }

    #[tokio::test]
    async fn many_postings_one_key_send_one_entry() {
        let input: Vec<_> = (0..5)
            .map(|i| posting("Acme", "Lead Data Engineer", "Seattle, WA", i))
            .collect();
        let client = Arc::new(LocalInferenceClient::new());
        let cache = Arc::new(MemoryCache::new());
        let (stats, enriched) =
            run_inference_stage(client.clone(), cache.clone(), 10, input).await;

        assert_eq!(client.call_log()[0].batch.len(), 1);
        assert_eq!(enriched.len(), 5);
        assert!(enriched.iter().all(|p| p.seniority == 4));
        let key = CacheKey::for_company_title("Acme", "Lead Data Engineer").to_hex();
        assert_eq!(cache.call_log().writes, vec![vec![(key, "4".to_string())]]);
        assert_eq!(stats.cache_writes, 1);
    }

    #[tokio::test]
    async fn inference_batches_are_bounded_by_dedup_keys() {
        let titles = ["CTO", "QA Engineer", "Data Scientist"];
        let input: Vec<_> = titles
            .iter()
            .enumerate()
            .map(|(i, t)| posting("Acme", t, "Boston, MA", i as i64))
            .collect();
        let client = Arc::new(LocalInferenceClient::new());
        let (stats, enriched) =
            run_inference_stage(client.clone(), Arc::new(MemoryCache::new()), 2, input).await;
        let sizes: Vec<_> = client.call_log().iter().map(|b| b.batch.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(stats.batches, 2);
        assert_eq!(enriched.len(), 3);
    }

    struct LossyClient;

    #[async_trait]
    impl InferenceClient for LossyClient {
        async fn infer_batch(
            &self,
            request: &SeniorityRequestBatch,
        ) -> Result<SeniorityResponseBatch, InferenceError> {
            let mut response = MockSeniorityModel.infer(request);
            response.batch.pop();
            response.batch.push(SeniorityResponse {
                dedup_key: DedupKey::from(42),
                seniority: 1,
            });
            Ok(response)
        }
    }

    struct DownClient;

    #[async_trait]
    impl InferenceClient for DownClient {
        async fn infer_batch(
            &self,
            _request: &SeniorityRequestBatch,
        ) -> Result<SeniorityResponseBatch, InferenceError> {
            Err(InferenceError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn unanswered_keys_are_withheld_and_unrequested_keys_ignored() {
        let cto = posting("Acme", "CTO", "Boston, MA", 1);
        let junior = posting("Acme", "Junior Frontend Developer", "Boston, MA", 2);
        let scrum_a = posting("Acme", "Scrum Master", "Boston, MA", 3);
        let scrum_b = posting("Acme", "Scrum Master", "Austin, TX", 4);
        let cache = Arc::new(MemoryCache::new());

        let (tx, rx) = mpsc::unbounded_channel();
        let (enriched_tx, mut enriched_rx) = mpsc::unbounded_channel();
        for p in [cto.clone(), junior.clone(), scrum_a.clone(), scrum_b] {
            tx.send(p).unwrap();
        }
        drop(tx);
        let stats = InferenceBatcher::new(Arc::new(LossyClient), cache.clone(), 10, instant())
            .run(rx, enriched_tx)
            .await
            .unwrap();

        assert_eq!(
            drain(&mut enriched_rx),
            vec![cto.clone().with_seniority(5), junior.clone().with_seniority(2)]
        );
        assert_eq!(
            cache.call_log().writes,
            vec![vec![
                (cto.cache_key().to_hex(), "5".to_string()),
                (junior.cache_key().to_hex(), "2".to_string()),
            ]]
        );
        assert!(cache.get(&scrum_a.cache_key().to_hex()).is_none());
        assert_eq!(
            stats,
            InferenceStageStats {
                batches: 1,
                request_entries: 3,
                postings_enriched: 2,
                cache_writes: 2
            }
        );
    }

    #[tokio::test]
    async fn inference_failure_after_retries_stops_the_stage() {
        let input = vec![posting("Acme", "CTO", "Boston, MA", 1)];

        let cache = Arc::new(MemoryCache::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (enriched_tx, mut enriched_rx) = mpsc::unbounded_channel();
        tx.send(input[0].clone()).unwrap();
        drop(tx);
        let err = InferenceBatcher::new(
            Arc::new(DownClient),
            cache.clone(),
            10,
            BackoffPolicy::no_retries(),
        )
        .run(rx, enriched_tx)
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("inference unavailable: down"));
        assert!(drain(&mut enriched_rx).is_empty());
        assert!(cache.call_log().writes.is_empty());

        // retryable failures that outlast the policy are fatal too
        let client = Arc::new(LocalInferenceClient::new());
        client.fail_next(3);
        let (tx, rx) = mpsc::unbounded_channel();
        let (enriched_tx, _enriched_rx) = mpsc::unbounded_channel();
        tx.send(input[0].clone()).unwrap();
        drop(tx);
        let result = InferenceBatcher::new(client.clone(), cache, 10, instant())
            .run(rx, enriched_tx)
            .await;
        assert!(result.is_err());
        assert!(client.call_log().is_empty());
    }

    fn processed(title: &str, scraped_on: i64) -> ProcessedJobPosting {
        posting("Acme", title, "Boston, MA", scraped_on).with_seniority(5)
    }

    #[test]
    fn group_flushes_only_when_every_identity_arrived() {
        let mut tracker = CompletionTracker::new(Duration::from_secs(60));
        let r1 = processed("CTO", 1);
        let r2 = processed("QA Engineer", 2);
        let (h1, h2) = (r1.identity(), r2.identity());

        let manifest = Manifest {
            group_id: 1000,
            expected: [h1, h2].into_iter().collect(),
        };
        assert!(tracker.on_manifest(manifest).is_none());

        let now = Instant::now();
        assert!(tracker.on_posting(r2.clone(), now).is_empty());
        let still_missing: HashSet<Identity> = [h1].into_iter().collect();
        assert_eq!(tracker.expected(1000), Some(&still_missing));

        let done = tracker.on_posting(r1.clone(), now);
        assert_eq!(
            done,
            vec![CompletedGroup {
                group_id: 1000,
                postings: vec![r2, r1]
            }]
        );
        assert!(tracker.expected(1000).is_none());
        assert_eq!(tracker.stats().groups_flushed, 1);
    }

    #[test]
    fn postings_before_their_manifest_are_reconciled() {
        let mut tracker = CompletionTracker::new(Duration::from_secs(60));
        let r1 = processed("CTO", 1);
        let r2 = processed("QA Engineer", 2);
        let r3 = processed("Data Scientist", 3);
        let now = Instant::now();

        assert!(tracker.on_posting(r1.clone(), now).is_empty());
        assert_eq!(tracker.parked_orphans(), 1);

        let manifest = Manifest::for_postings(7, [&r1.posting, &r2.posting]);
        assert!(tracker.on_manifest(manifest).is_none());
        assert_eq!(tracker.parked_orphans(), 0);
        assert_eq!(tracker.outstanding(), vec![(7, 1)]);

        // a manifest whose postings all arrived early completes immediately
        assert!(tracker.on_posting(r3.clone(), now).is_empty());
        let done = tracker
            .on_manifest(Manifest::for_postings(8, [&r3.posting]))
            .expect("group 8 complete");
        assert_eq!(done.postings, vec![r3]);

        let done = tracker.on_posting(r2, now);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].group_id, 7);
        assert_eq!(tracker.stats().orphans_reconciled, 2);
    }

    #[test]
    fn posting_expected_by_two_groups_joins_both() {
        let mut tracker = CompletionTracker::new(Duration::from_secs(60));
        let shared = processed("CTO", 1);
        let extra = processed("QA Engineer", 2);
        tracker.on_manifest(Manifest::for_postings(1, [&shared.posting, &extra.posting]));
        tracker.on_manifest(Manifest::for_postings(2, [&shared.posting]));

        let done = tracker.on_posting(shared.clone(), Instant::now());
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].group_id, 2);
        assert_eq!(tracker.outstanding(), vec![(1, 1)]);
    }

    #[test]
    fn repeated_manifest_replaces_the_open_group_expectation() {
        let mut tracker = CompletionTracker::new(Duration::from_secs(60));
        let a = processed("CTO", 1);
        let b = processed("QA Engineer", 2);
        let c = processed("Data Scientist", 3);
        let d = processed("UX Designer", 4);
        let now = Instant::now();

        assert!(tracker
            .on_manifest(Manifest::for_postings(9, [&a.posting, &b.posting]))
            .is_none());
        assert!(tracker.on_posting(a.clone(), now).is_empty());
        assert!(tracker
            .on_manifest(Manifest::for_postings(9, [&b.posting]))
            .is_none());
        assert_eq!(tracker.outstanding(), vec![(9, 1)]);
        let done = tracker.on_posting(b.clone(), now);
        assert_eq!(
            done,
            vec![CompletedGroup {
                group_id: 9,
                postings: vec![a, b]
            }]
        );

        // the replacement may also shrink what is still outstanding
        tracker.on_manifest(Manifest::for_postings(10, [&c.posting, &d.posting]));
        tracker.on_manifest(Manifest::for_postings(10, [&c.posting]));
        let done = tracker.on_posting(c.clone(), now);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].postings, vec![c]);
        assert_eq!(tracker.stats().manifests_ignored, 0);
    }

    #[test]
    fn flushed_groups_never_reopen_and_empty_manifests_complete() {
        let mut tracker = CompletionTracker::new(Duration::from_secs(60));
        let none: Vec<JobPosting> = Vec::new();
        let empty = tracker
            .on_manifest(Manifest::for_postings(5, &none))
            .expect("empty group completes");
        assert!(empty.postings.is_empty());

        let r = processed("CTO", 1);
        assert!(tracker
            .on_manifest(Manifest::for_postings(5, [&r.posting]))
            .is_none());
        assert!(tracker.expected(5).is_none());
        assert_eq!(tracker.stats().manifests_ignored, 1);
    }

    #[test]
    fn orphans_expire_after_ttl() {
        let ttl = Duration::from_secs(30);
        let mut tracker = CompletionTracker::new(ttl);
        let t0 = Instant::now();
        tracker.on_posting(processed("CTO", 1), t0);
        tracker.on_posting(processed("QA Engineer", 2), t0 + Duration::from_secs(20));

        assert_eq!(tracker.evict_orphans(t0 + Duration::from_secs(10)), 0);
        assert_eq!(tracker.evict_orphans(t0 + Duration::from_secs(31)), 1);
        assert_eq!(tracker.parked_orphans(), 1);
        assert_eq!(tracker.stats().orphans_evicted, 1);
    }

    #[derive(Default)]
    struct RecordingSink {
        groups: Mutex<Vec<CompletedGroup>>,
    }

    #[async_trait]
    impl GroupSink for RecordingSink {
        async fn write_group(&self, group_id: i64, postings: &[ProcessedJobPosting]) -> Result<()> {
            self.groups.lock().unwrap().push(CompletedGroup {
                group_id,
                postings: postings.to_vec(),
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn completion_stage_joins_both_streams() {
        let (posting_tx, posting_rx) = mpsc::unbounded_channel();
        let (manifest_tx, manifest_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink::default());
        let r1 = processed("CTO", 1);
        let r2 = processed("QA Engineer", 2);

        posting_tx.send(r1.clone()).unwrap();
        manifest_tx
            .send(Manifest::for_postings(1000, [&r1.posting, &r2.posting]))
            .unwrap();
        posting_tx.send(r2.clone()).unwrap();
        drop(posting_tx);
        drop(manifest_tx);

        let stats = run_completion_stage(
            CompletionTracker::new(Duration::from_secs(60)),
            posting_rx,
            manifest_rx,
            sink.clone(),
            1,
        )
        .await
        .unwrap();

        let groups = sink.groups.lock().unwrap().clone();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, 1000);
        assert_eq!(groups[0].postings.len(), 2);
        assert_eq!(stats.groups_flushed, 1);
        assert_eq!(stats.groups_left_open, 0);
    }

    struct FailingSink;

    #[async_trait]
    impl GroupSink for FailingSink {
        async fn write_group(
            &self,
            _group_id: i64,
            _postings: &[ProcessedJobPosting],
        ) -> Result<()> {
            Err(anyhow!("bucket offline"))
        }
    }

    #[tokio::test]
    async fn sink_failure_stops_the_completion_stage() {
        let (posting_tx, posting_rx) = mpsc::unbounded_channel();
        let (manifest_tx, manifest_rx) = mpsc::unbounded_channel();
        let r = processed("CTO", 1);
        manifest_tx
            .send(Manifest::for_postings(7, [&r.posting]))
            .unwrap();
        posting_tx.send(r).unwrap();

        // both senders stay open, so only the sink error can end the stage
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_completion_stage(
                CompletionTracker::new(Duration::from_secs(60)),
                posting_rx,
                manifest_rx,
                Arc::new(FailingSink),
                0,
            ),
        )
        .await
        .expect("stage returns on sink failure");
        assert!(result.unwrap_err().to_string().contains("bucket offline"));
        drop(posting_tx);
        drop(manifest_tx);
    }

    #[test]
    fn outstanding_counts_render_per_group() {
        assert_eq!(
            render_outstanding(&[(1_700_000_100, 3), (1_700_000_200, 12)]),
            "1700000100:3 1700000200:12"
        );
        assert_eq!(render_outstanding(&[]), "");
    }

    #[tokio::test]
    async fn ingestion_rejects_malformed_files_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        let good = vec![
            posting("Acme", "CTO", "Boston, MA", 10),
            posting("Acme", "QA Engineer", "Boston, MA", 11),
        ];
        senrich_storage::write_sample_files(store.as_ref(), "raw", &[(11, good.clone())])
            .await
            .unwrap();
        store
            .put("raw/12.jsonl", b"{\"url\": 1}\n".to_vec())
            .await
            .unwrap();
        store.put("raw/readme.md", b"#".to_vec()).await.unwrap();

        let (postings_tx, mut postings_rx) = mpsc::unbounded_channel();
        let (manifests_tx, mut manifests_rx) = mpsc::unbounded_channel();
        let stats = IngestionProducer::new(store, "raw", 0)
            .with_backoff(instant())
            .once(true)
            .run(postings_tx, manifests_tx)
            .await
            .unwrap();

        assert_eq!(
            stats,
            IngestionStats {
                files_ingested: 1,
                files_rejected: 1,
                postings_ingested: 2
            }
        );
        assert_eq!(drain(&mut postings_rx), good);
        let manifests = drain(&mut manifests_rx);
        assert_eq!(manifests, vec![Manifest::for_postings(11, &good)]);
    }

    #[test]
    fn yaml_config_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "cache_batch_size: 50\nupload_prefix: enriched\n").unwrap();
        let config = PipelineConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.cache_batch_size, 50);
        assert_eq!(config.upload_prefix, "enriched");
        assert_eq!(config.inference_batch_size, 1000);
        assert_eq!(config.download_prefix, "job-postings-raw");
        assert_eq!(config.backoff().max_retries, 3);
    }
}
