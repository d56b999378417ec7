//! Pipeline orchestration: per-page indexing, the background crawl worker
//! pool, crash recovery, and refresh planning.
//!
//! The orchestrator is the composition root of the engine. It owns its
//! collaborators — metadata store, vector store, content cache, fetcher,
//! embedding provider, frontier — and drives the per-page pipeline
//! (fetch → extract → chunk → embed → persist) under a per-docset worker
//! pool with a global host rate limit.
//!
//! # Page state machine
//!
//! ```text
//! pending → fetching → (fetched | skipped | error)
//! fetched → indexing → (indexed | error)
//! indexed → pending   (only via refresh)
//! ```
//!
//! Every transition is persisted before the next step runs, so a crash
//! leaves pages in a state recovery can reason about.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;

use crate::cache::ContentCache;
use crate::chunker::{self, ChunkerOptions};
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::extract;
use crate::fetcher::{Fetch, FetchError, HttpFetcher};
use crate::frontier::Frontier;
use crate::models::{now_ts, ChunkRecord, Docset, DocsetStatus, IndexStatus, Page, PageStatus, VectorMeta};
use crate::store::{DocsetInput, MetadataStore, RefreshCounts};
use crate::vector::{VectorRecord, VectorStore};

/// Pages stuck in-flight longer than this are reset on recovery.
pub const STUCK_THRESHOLD_MS: u64 = 5 * 60 * 1000;
/// Errored pages retry until they have failed this many times.
pub const MAX_RETRIES: i64 = 3;
/// Default refresh window: pages fetched within it are left alone.
pub const DEFAULT_REFRESH_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

/// Shared state of one docset's crawl runner.
///
/// `in_flight` and `stop_requested` are read from many workers;
/// `next_allowed_fetch_at` is a mutex so the rate limiter's
/// check-and-update is atomic.
struct CrawlRunnerState {
    in_flight: AtomicUsize,
    stop_requested: AtomicBool,
    next_allowed_fetch_at: TokioMutex<Instant>,
    running: AtomicBool,
}

impl CrawlRunnerState {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            next_allowed_fetch_at: TokioMutex::new(Instant::now()),
            running: AtomicBool::new(true),
        }
    }
}

/// Request to index (or re-index) a documentation site.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRequest {
    /// Scheme + host, e.g. `https://docs.example.com`.
    pub base_url: String,
    /// Path of the first page to fetch.
    pub seed_slug: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub allowed_paths: Option<Vec<String>>,
    /// Index the seed synchronously before returning.
    #[serde(default)]
    pub wait_for_seed: bool,
}

/// Result of [`Orchestrator::index_docset`].
#[derive(Debug, Clone)]
pub struct IndexOutcome {
    pub docset: Docset,
    pub seed_indexed: bool,
}

/// Refresh parameters.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshRequest {
    /// Refresh every page regardless of age.
    pub force: bool,
    /// Age cutoff in milliseconds (default 24 h).
    pub max_age: Option<u64>,
    /// Discard content hashes and validators so nothing short-circuits.
    pub full_reindex: bool,
}

/// Per-docset refresh outcome.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshPlan {
    pub docset_id: String,
    #[serde(flatten)]
    pub counts: RefreshCounts,
}

/// Per-docset status report.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocsetReport {
    #[serde(flatten)]
    pub docset: Docset,
    pub index_status: IndexStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stuck_pages: Option<Vec<Page>>,
}

/// The engine's composition root. Construct once, share via `Arc`.
pub struct Orchestrator {
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) vectors: Arc<VectorStore>,
    pub(crate) cache: Arc<ContentCache>,
    pub(crate) fetcher: Arc<dyn Fetch>,
    pub(crate) embedder: Arc<dyn EmbeddingProvider>,
    pub(crate) frontier: Arc<Frontier>,
    pub(crate) config: Config,
    runners: StdMutex<HashMap<String, Arc<CrawlRunnerState>>>,
}

impl Orchestrator {
    /// Wire up an orchestrator from explicit collaborators. Tests inject a
    /// stub fetcher here.
    pub fn new(
        store: Arc<MetadataStore>,
        vectors: Arc<VectorStore>,
        cache: Arc<ContentCache>,
        fetcher: Arc<dyn Fetch>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: Config,
    ) -> Arc<Self> {
        let frontier = Arc::new(Frontier::new(
            Arc::clone(&store),
            config.crawler.max_pages,
        ));
        Arc::new(Self {
            store,
            vectors,
            cache,
            fetcher,
            embedder,
            frontier,
            config,
            runners: StdMutex::new(HashMap::new()),
        })
    }

    /// Build the production composition from configuration: SQLite store,
    /// local vector store, disk cache, reqwest fetcher, configured
    /// embedding provider.
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        if config.vector_store.provider != "local" {
            bail!(
                "vector store provider '{}' is not available; use 'local'",
                config.vector_store.provider
            );
        }
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data dir: {}", config.data_dir.display()))?;

        let store = Arc::new(MetadataStore::open(&config.db_path()).await?);
        let vectors = Arc::new(VectorStore::new(config.vectors_dir()));
        let cache = Arc::new(ContentCache::new(config.cache_dir()));
        let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(
            Arc::clone(&cache),
            config.crawler.timeout,
            &config.crawler.user_agent,
        )?);
        let embedder = embedding::create_provider(&config.embedding)?;

        Ok(Self::new(store, vectors, cache, fetcher, embedder, config))
    }

    /// The vector namespace of a docset.
    pub fn namespace_for(&self, docset_id: &str) -> String {
        match &self.config.vector_store.collection_prefix {
            Some(prefix) => format!("{}{}", prefix, docset_id),
            None => docset_id.to_string(),
        }
    }

    // ============ Indexing ============

    /// Find-or-create the docset, ensure its seed page, optionally index
    /// the seed synchronously, and start the background crawl.
    pub async fn index_docset(self: Arc<Self>, request: IndexRequest) -> Result<IndexOutcome> {
        let base_url = request.base_url.trim_end_matches('/').to_string();
        let seed_slug = if request.seed_slug.starts_with('/') {
            request.seed_slug.clone()
        } else {
            format!("/{}", request.seed_slug)
        };

        let docset = match self.store.get_docset_by_url(&base_url).await? {
            Some(existing) => existing,
            None => {
                self.store
                    .create_docset(&DocsetInput {
                        base_url: base_url.clone(),
                        seed_slug: seed_slug.clone(),
                        name: request.name.clone(),
                        allowed_paths: request.allowed_paths.clone(),
                    })
                    .await?
            }
        };

        self.vectors.init(&self.namespace_for(&docset.id)).await?;
        self.store
            .update_docset_status(&docset.id, DocsetStatus::Indexing)
            .await?;

        let seed_url = format!("{}{}", base_url, seed_slug);
        let seed = match self.store.get_page_by_url(&docset.id, &seed_url).await? {
            Some(page) => page,
            None => self.store.create_page(&docset.id, &seed_url).await?,
        };
        self.frontier.note_visited(&docset.id, &seed_url).await;

        let mut seed_indexed = seed.status == PageStatus::Indexed;
        if request.wait_for_seed && !seed_indexed {
            if self.store.claim_page(&seed.id).await? {
                let status = self.index_page(&docset, &seed).await?;
                seed_indexed = status == PageStatus::Indexed;
            }
        }

        Arc::clone(&self).start_background_crawl(docset.id.clone());

        let docset = self
            .store
            .get_docset(&docset.id)
            .await?
            .context("docset vanished during indexing")?;
        Ok(IndexOutcome {
            docset,
            seed_indexed,
        })
    }

    /// Run the full pipeline for one claimed page (status `fetching`).
    /// Failures are absorbed into the page record: expected crawl losses
    /// (HTTP 401/403/404) mark it `skipped`, anything else `error` with a
    /// spent retry. Returns the page's terminal status.
    pub async fn index_page(&self, docset: &Docset, page: &Page) -> Result<PageStatus> {
        match self.index_page_inner(docset, page).await {
            Ok(status) => Ok(status),
            Err(e) => {
                let skippable = e
                    .downcast_ref::<FetchError>()
                    .map(FetchError::is_skippable)
                    .unwrap_or(false);
                let message = e.to_string();
                if skippable {
                    self.store.mark_page_skipped(&page.id, &message).await?;
                    Ok(PageStatus::Skipped)
                } else {
                    self.store.mark_page_error(&page.id, &message).await?;
                    Ok(PageStatus::Error)
                }
            }
        }
    }

    async fn index_page_inner(&self, docset: &Docset, page: &Page) -> Result<PageStatus> {
        let outcome = self
            .fetcher
            .fetch(
                &page.url,
                page.etag.as_deref(),
                page.last_modified.as_deref(),
            )
            .await
            .map_err(anyhow::Error::from)?;

        // Short-circuit 1: server says unchanged and we have indexed this
        // content before.
        if outcome.status == 304 && outcome.from_cache && page.content_hash.is_some() {
            self.store.mark_page_indexed(&page.id, true).await?;
            return Ok(PageStatus::Indexed);
        }

        // Short-circuit 2: body bytes are identical to the last pass.
        let content_hash = sha256_hex(&outcome.content);
        if page.content_hash.as_deref() == Some(content_hash.as_str()) {
            self.store.mark_page_indexed(&page.id, true).await?;
            return Ok(PageStatus::Indexed);
        }

        self.store
            .mark_page_fetched(
                &page.id,
                &content_hash,
                outcome.etag.as_deref(),
                outcome.last_modified.as_deref(),
            )
            .await?;

        let extracted = extract::extract_page(&page.url, &outcome.content, outcome.content_kind);
        self.store
            .mark_page_indexing(&page.id, extracted.title.as_deref())
            .await?;

        self.frontier
            .discover_links(docset, &page.url, &extracted.links, 0)
            .await?;

        // Replace prior chunks and their vectors before re-embedding.
        let namespace = self.namespace_for(&docset.id);
        let old_chunk_ids = self.store.get_chunk_ids_by_page(&page.id).await?;
        if !old_chunk_ids.is_empty() {
            self.vectors.delete(&namespace, &old_chunk_ids).await?;
        }
        self.store.delete_chunks(&page.id).await?;

        let pieces = chunker::chunk_text(
            &extracted.content,
            &extracted.headings,
            &ChunkerOptions::default(),
        );
        if pieces.is_empty() {
            self.store.mark_page_indexed(&page.id, false).await?;
            return Ok(PageStatus::Indexed);
        }

        let created_at = now_ts();
        let records: Vec<ChunkRecord> = pieces
            .iter()
            .map(|piece| ChunkRecord {
                id: uuid::Uuid::new_v4().to_string(),
                page_id: page.id.clone(),
                docset_id: docset.id.clone(),
                content: piece.content.clone(),
                heading: piece.heading.clone(),
                start_offset: piece.start_offset as i64,
                end_offset: piece.end_offset as i64,
                chunk_index: piece.index as i64,
                embedding_id: None,
                created_at,
            })
            .collect();

        let mut page_for_fts = page.clone();
        page_for_fts.title = extracted.title.clone();
        self.store.create_chunks(&records, &page_for_fts).await?;

        let texts: Vec<String> = records.iter().map(|r| r.content.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        if embeddings.len() != records.len() {
            bail!(
                "embedding provider returned {} vectors for {} chunks",
                embeddings.len(),
                records.len()
            );
        }

        let vector_records: Vec<VectorRecord> = records
            .iter()
            .zip(embeddings.into_iter())
            .map(|(record, vector)| VectorRecord {
                id: record.id.clone(),
                vector,
                metadata: VectorMeta {
                    docset_id: record.docset_id.clone(),
                    page_id: record.page_id.clone(),
                    chunk_id: record.id.clone(),
                    url: page.url.clone(),
                    title: extracted.title.clone(),
                    heading: record.heading.clone(),
                    content: record.content.clone(),
                },
            })
            .collect();
        self.vectors.upsert(&namespace, vector_records).await?;

        let chunk_ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        self.store.set_chunks_embedded(&chunk_ids).await?;

        self.store.mark_page_indexed(&page.id, false).await?;
        Ok(PageStatus::Indexed)
    }

    // ============ Background crawl ============

    /// Spawn the crawl runner for a docset. No-op while one is active.
    pub fn start_background_crawl(self: Arc<Self>, docset_id: String) {
        let state = {
            let mut runners = self.runners.lock().expect("runner map poisoned");
            if let Some(existing) = runners.get(&docset_id) {
                if existing.running.load(Ordering::Acquire) {
                    return;
                }
            }
            let state = Arc::new(CrawlRunnerState::new());
            runners.insert(docset_id.clone(), Arc::clone(&state));
            state
        };

        tokio::spawn(async move {
            self.run_crawl(docset_id, state).await;
        });
    }

    /// Ask a docset's runner to stop. Workers observe the flag at each
    /// loop head; in-flight pages complete.
    pub fn stop_background_crawl(&self, docset_id: &str) {
        let runners = self.runners.lock().expect("runner map poisoned");
        if let Some(state) = runners.get(docset_id) {
            state.stop_requested.store(true, Ordering::Release);
        }
    }

    /// Whether a crawl runner is currently active for the docset.
    pub fn is_crawling(&self, docset_id: &str) -> bool {
        let runners = self.runners.lock().expect("runner map poisoned");
        runners
            .get(docset_id)
            .map(|state| state.running.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    async fn run_crawl(self: Arc<Self>, docset_id: String, state: Arc<CrawlRunnerState>) {
        let result = Arc::clone(&self)
            .crawl_docset(docset_id.clone(), Arc::clone(&state))
            .await;
        if let Err(e) = result {
            eprintln!("Warning: crawl for {} aborted: {}", docset_id, e);
            let _ = self
                .store
                .update_docset_status(&docset_id, DocsetStatus::Error)
                .await;
        }
        state.running.store(false, Ordering::Release);
    }

    async fn crawl_docset(
        self: Arc<Self>,
        docset_id: String,
        state: Arc<CrawlRunnerState>,
    ) -> Result<()> {
        let Some(docset) = self.store.get_docset(&docset_id).await? else {
            return Ok(());
        };

        self.frontier.load_pending_pages(&docset_id).await?;

        let concurrency = self.config.crawler.concurrency.max(1);
        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            let orchestrator = Arc::clone(&self);
            workers.spawn(orchestrator.crawl_worker(docset.clone(), Arc::clone(&state)));
        }
        while workers.join_next().await.is_some() {}

        while state.in_flight.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if !state.stop_requested.load(Ordering::Acquire) {
            self.store
                .update_docset_status(&docset.id, DocsetStatus::Ready)
                .await?;
            let status = self.store.get_index_status(&docset.id).await?;
            println!(
                "crawl {} finished: {} pages indexed, {} skipped, {} errors, {} chunks",
                docset.name,
                status.indexed_pages,
                status.skipped_pages,
                status.error_pages,
                status.total_chunks
            );
        }
        Ok(())
    }

    async fn crawl_worker(self: Arc<Self>, docset: Docset, state: Arc<CrawlRunnerState>) {
        let concurrency = self.config.crawler.concurrency.max(1);
        let request_delay = Duration::from_millis(self.config.crawler.request_delay);

        loop {
            if state.stop_requested.load(Ordering::Acquire) {
                break;
            }
            if state.in_flight.load(Ordering::Acquire) >= concurrency {
                tokio::time::sleep(Duration::from_millis(25)).await;
                continue;
            }

            let page = match self.store.get_next_pending_page(&docset.id).await {
                Ok(Some(page)) => page,
                Ok(None) => {
                    // Discovery on in-flight pages may still enqueue work.
                    if state.in_flight.load(Ordering::Acquire) > 0 {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    if self.frontier.len(&docset.id).await == 0 {
                        match self.frontier.load_pending_pages(&docset.id).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => continue,
                        }
                    }
                    break;
                }
                Err(e) => {
                    eprintln!("Warning: pending-page scan failed: {}", e);
                    break;
                }
            };

            // Another worker may have won this page between the scan and
            // the claim; losers just move on.
            match self.store.claim_page(&page.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    eprintln!("Warning: page claim failed: {}", e);
                    continue;
                }
            }

            state.in_flight.fetch_add(1, Ordering::AcqRel);
            wait_for_turn(&state, request_delay).await;

            if let Err(e) = self.index_page(&docset, &page).await {
                eprintln!("Warning: indexing {} failed: {}", page.url, e);
            }
            state.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    // ============ Recovery ============

    /// Reset stuck and retryable pages across every docset and resume
    /// crawls that still have pending work. Call once on process start.
    pub async fn recover_from_crash(self: Arc<Self>, stuck_threshold_ms: u64) -> Result<()> {
        let cutoff = now_ts() - (stuck_threshold_ms / 1000) as i64;
        for docset in self.store.list_docsets().await? {
            let stuck = self.store.reset_stuck_pages(&docset.id, cutoff).await?;
            let retried = self.store.reset_error_pages(&docset.id, MAX_RETRIES).await?;
            let pending = self
                .store
                .count_pages_with_status(&docset.id, PageStatus::Pending)
                .await?;

            if stuck > 0 || retried > 0 {
                println!(
                    "recovery {}: {} stuck pages reset, {} errors requeued",
                    docset.name, stuck, retried
                );
            }
            if pending > 0 {
                self.store
                    .update_docset_status(&docset.id, DocsetStatus::Indexing)
                    .await?;
                self.vectors.init(&self.namespace_for(&docset.id)).await?;
                Arc::clone(&self).start_background_crawl(docset.id.clone());
            }
        }
        Ok(())
    }

    // ============ Refresh ============

    /// Move a docset's settled pages back to `pending`. Incremental mode
    /// keeps content hashes so unchanged pages short-circuit; a full
    /// reindex clears them so every page re-embeds.
    pub async fn refresh_docset(
        self: Arc<Self>,
        docset_id: &str,
        request: &RefreshRequest,
    ) -> Result<RefreshPlan> {
        let docset = self
            .store
            .get_docset(docset_id)
            .await?
            .with_context(|| format!("docset not found: {}", docset_id))?;

        let older_than = if request.force {
            None
        } else {
            let max_age_ms = request.max_age.unwrap_or(DEFAULT_REFRESH_MAX_AGE_MS);
            Some(now_ts() - (max_age_ms / 1000) as i64)
        };

        let counts = self
            .store
            .mark_pages_for_refresh(&docset.id, older_than, request.full_reindex)
            .await?;

        if counts.refreshed_pages > 0 {
            self.store
                .update_docset_status(&docset.id, DocsetStatus::Indexing)
                .await?;
            Arc::clone(&self).start_background_crawl(docset.id.clone());
        }

        Ok(RefreshPlan {
            docset_id: docset.id,
            counts,
        })
    }

    /// Refresh every docset; returns one plan per docset.
    pub async fn refresh_all(self: Arc<Self>, request: &RefreshRequest) -> Result<Vec<RefreshPlan>> {
        let mut plans = Vec::new();
        for docset in self.store.list_docsets().await? {
            let plan = Arc::clone(&self).refresh_docset(&docset.id, request).await?;
            plans.push(plan);
        }
        Ok(plans)
    }

    // ============ Deletion & status ============

    /// Stop the crawl and destroy the docset, its pages, chunks, vectors,
    /// and frontier state. Returns false when the docset was unknown.
    pub async fn delete_docset(&self, docset_id: &str) -> Result<bool> {
        let Some(docset) = self.store.get_docset(docset_id).await? else {
            return Ok(false);
        };
        self.stop_background_crawl(&docset.id);
        {
            let mut runners = self.runners.lock().expect("runner map poisoned");
            runners.remove(&docset.id);
        }
        self.frontier.clear(&docset.id).await;
        self.vectors.clear(&self.namespace_for(&docset.id)).await?;
        self.store.delete_docset(&docset.id).await?;
        Ok(true)
    }

    /// Status report for one docset or all of them.
    pub async fn get_status(
        &self,
        docset_id: Option<&str>,
        include_stuck: bool,
    ) -> Result<Vec<DocsetReport>> {
        let docsets = match docset_id {
            Some(id) => self.store.get_docset(id).await?.into_iter().collect(),
            None => self.store.list_docsets().await?,
        };

        let cutoff = now_ts() - (STUCK_THRESHOLD_MS / 1000) as i64;
        let mut reports = Vec::with_capacity(docsets.len());
        for docset in docsets {
            let index_status = self.store.get_index_status(&docset.id).await?;
            let stuck_pages = if include_stuck {
                Some(self.store.find_stuck_pages(&docset.id, cutoff).await?)
            } else {
                None
            };
            reports.push(DocsetReport {
                docset,
                index_status,
                stuck_pages,
            });
        }
        Ok(reports)
    }

    /// The content cache this orchestrator writes through.
    pub fn content_cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// The metadata store (read access for surfaces like `/docset/{id}`).
    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// The vector store.
    pub fn vector_store(&self) -> &Arc<VectorStore> {
        &self.vectors
    }
}

/// Serialise the rate limiter: take the current slot, push the next slot
/// `delay` into the future, then sleep outside the lock.
async fn wait_for_turn(state: &CrawlRunnerState, delay: Duration) {
    let wait = {
        let mut next = state.next_allowed_fetch_at.lock().await;
        let now = Instant::now();
        let wait = next.saturating_duration_since(now);
        *next = now.max(*next) + delay;
        wait
    };
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
}

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
