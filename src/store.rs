//! Transactional metadata store over SQLite.
//!
//! Single source of truth for docsets, pages, and chunks, plus the FTS5
//! keyword index over chunk text. Opened in WAL mode with foreign keys
//! enforced; every multi-row mutation runs in one transaction. Many crawl
//! workers mutate the store concurrently — page claiming is a conditional
//! status update so at most one worker wins a pending page.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::migrate;
use crate::models::{
    now_ts, ChunkRecord, Docset, DocsetStatus, IndexStatus, Page, PageStatus,
};

/// Input for [`MetadataStore::create_docset`].
#[derive(Debug, Clone)]
pub struct DocsetInput {
    /// Scheme + host, e.g. `https://docs.example.com`.
    pub base_url: String,
    /// Path of the seed page.
    pub seed_slug: String,
    /// Display name; defaults to the base URL host.
    pub name: Option<String>,
    /// Allowed path prefixes; defaults to the directory of the seed path.
    pub allowed_paths: Option<Vec<String>>,
}

/// One keyword-search hit from the FTS index.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub chunk_id: String,
    pub docset_id: String,
    pub page_id: String,
    pub url: String,
    pub title: Option<String>,
    pub heading: Option<String>,
    pub content: String,
    /// BM25 mapped into `[0, 1]` via `1 / (1 + max(0, bm25))`.
    pub keyword_score: f64,
}

/// Counts reported by a refresh pass.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshCounts {
    /// Pages moved back to `pending`.
    pub refreshed_pages: u64,
    /// Pages whose content hash survived (incremental mode).
    pub preserved_hashes: u64,
    /// Pages whose hash/validators were discarded (full reindex).
    pub cleared_hashes: u64,
}

/// Handle over the SQLite pool. Cheap to clone via `Arc` at the call sites.
pub struct MetadataStore {
    pool: SqlitePool,
    fts_checked: AtomicBool,
}

impl MetadataStore {
    /// Open (creating if missing) the database at `db_path` and run
    /// migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            fts_checked: AtomicBool::new(false),
        })
    }

    /// In-memory store for tests. A single connection so every query sees
    /// the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            fts_checked: AtomicBool::new(false),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Docsets ============

    /// Insert a new docset. Name defaults to the base URL host; allowed
    /// paths default to the directory of the seed path (`/` when the seed
    /// sits at the root).
    pub async fn create_docset(&self, input: &DocsetInput) -> Result<Docset> {
        let name = input.name.clone().unwrap_or_else(|| {
            url::Url::parse(&input.base_url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_else(|| input.base_url.clone())
        });
        let allowed_paths = input
            .allowed_paths
            .clone()
            .filter(|paths| !paths.is_empty())
            .unwrap_or_else(|| vec![default_allowed_path(&input.seed_slug)]);

        let docset = Docset {
            id: Uuid::new_v4().to_string(),
            name,
            base_url: input.base_url.clone(),
            seed_slug: input.seed_slug.clone(),
            allowed_paths,
            status: DocsetStatus::Pending,
            created_at: now_ts(),
            updated_at: now_ts(),
        };

        sqlx::query(
            r#"
            INSERT INTO docsets (id, name, base_url, seed_slug, allowed_paths, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&docset.id)
        .bind(&docset.name)
        .bind(&docset.base_url)
        .bind(&docset.seed_slug)
        .bind(serde_json::to_string(&docset.allowed_paths)?)
        .bind(docset.status.as_str())
        .bind(docset.created_at)
        .bind(docset.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(docset)
    }

    pub async fn get_docset(&self, id: &str) -> Result<Option<Docset>> {
        let row = sqlx::query("SELECT * FROM docsets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_docset(&r)).transpose()
    }

    pub async fn get_docset_by_url(&self, base_url: &str) -> Result<Option<Docset>> {
        let row = sqlx::query("SELECT * FROM docsets WHERE base_url = ?")
            .bind(base_url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_docset(&r)).transpose()
    }

    pub async fn list_docsets(&self) -> Result<Vec<Docset>> {
        let rows = sqlx::query("SELECT * FROM docsets ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_docset).collect()
    }

    /// Set the docset status, touching `updated_at`.
    pub async fn update_docset_status(&self, id: &str, status: DocsetStatus) -> Result<()> {
        sqlx::query("UPDATE docsets SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a docset; pages and chunks cascade, the FTS mirror is purged
    /// in the same transaction.
    pub async fn delete_docset(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE docset_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM docsets WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Pages ============

    /// Create a page in `pending` state. The URL must be unique within the
    /// docset.
    pub async fn create_page(&self, docset_id: &str, url: &str) -> Result<Page> {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string());
        let page = Page {
            id: Uuid::new_v4().to_string(),
            docset_id: docset_id.to_string(),
            url: url.to_string(),
            path: path.clone(),
            title: None,
            content_hash: None,
            etag: None,
            last_modified: None,
            status: PageStatus::Pending,
            error_message: None,
            retry_count: 0,
            last_attempt_at: None,
            fetched_at: None,
            indexed_at: None,
            created_at: now_ts(),
        };

        sqlx::query(
            r#"
            INSERT INTO pages (id, docset_id, url, path, status, retry_count, section, created_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(&page.id)
        .bind(&page.docset_id)
        .bind(&page.url)
        .bind(&page.path)
        .bind(migrate::section_from_path(&path))
        .bind(page.created_at)
        .execute(&self.pool)
        .await?;

        Ok(page)
    }

    pub async fn get_page(&self, id: &str) -> Result<Option<Page>> {
        let row = sqlx::query("SELECT * FROM pages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_page(&r)).transpose()
    }

    pub async fn get_page_by_url(&self, docset_id: &str, url: &str) -> Result<Option<Page>> {
        let row = sqlx::query("SELECT * FROM pages WHERE docset_id = ? AND url = ?")
            .bind(docset_id)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_page(&r)).transpose()
    }

    /// Earliest-inserted pending page. Does not reserve it — reservation is
    /// the caller's [`claim_page`](Self::claim_page).
    pub async fn get_next_pending_page(&self, docset_id: &str) -> Result<Option<Page>> {
        let row = sqlx::query(
            "SELECT * FROM pages WHERE docset_id = ? AND status = 'pending' ORDER BY rowid ASC LIMIT 1",
        )
        .bind(docset_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_page(&r)).transpose()
    }

    /// Conditionally transition `pending → fetching`, stamping the attempt
    /// time. Returns false when another worker won the page first.
    pub async fn claim_page(&self, page_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pages SET status = 'fetching', last_attempt_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(now_ts())
        .bind(page_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_page_fetched(
        &self,
        page_id: &str,
        content_hash: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pages SET status = 'fetched', content_hash = ?, etag = ?,
                last_modified = ?, fetched_at = ?, error_message = NULL
            WHERE id = ?
            "#,
        )
        .bind(content_hash)
        .bind(etag)
        .bind(last_modified)
        .bind(now_ts())
        .bind(page_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_page_indexing(&self, page_id: &str, title: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE pages SET status = 'indexing', title = ? WHERE id = ?")
            .bind(title)
            .bind(page_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal success. `touch_fetched_at` also refreshes `fetched_at`,
    /// used by the 304/unchanged short-circuits.
    pub async fn mark_page_indexed(&self, page_id: &str, touch_fetched_at: bool) -> Result<()> {
        let now = now_ts();
        if touch_fetched_at {
            sqlx::query(
                "UPDATE pages SET status = 'indexed', indexed_at = ?, fetched_at = ?, error_message = NULL WHERE id = ?",
            )
            .bind(now)
            .bind(now)
            .bind(page_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE pages SET status = 'indexed', indexed_at = ?, error_message = NULL WHERE id = ?",
            )
            .bind(now)
            .bind(page_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Terminal skip for expected crawl losses (HTTP 401/403/404).
    pub async fn mark_page_skipped(&self, page_id: &str, message: &str) -> Result<()> {
        sqlx::query("UPDATE pages SET status = 'skipped', error_message = ? WHERE id = ?")
            .bind(message)
            .bind(page_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Failure: store the message and spend one retry.
    pub async fn mark_page_error(&self, page_id: &str, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE pages SET status = 'error', error_message = ?, retry_count = retry_count + 1 WHERE id = ?",
        )
        .bind(message)
        .bind(page_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pages of a docset, optionally filtered by status. Ordered by
    /// `indexed_at` (most recent first, never-indexed last) with a stable
    /// rowid tie-break.
    pub async fn list_pages(
        &self,
        docset_id: &str,
        status: Option<PageStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Page>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT * FROM pages WHERE docset_id = ? AND status = ?
                    ORDER BY (indexed_at IS NULL), indexed_at DESC, rowid ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(docset_id)
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM pages WHERE docset_id = ?
                    ORDER BY (indexed_at IS NULL), indexed_at DESC, rowid ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(docset_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_page).collect()
    }

    /// URLs of pending pages in insertion order, for frontier hydration.
    pub async fn pending_page_urls(&self, docset_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT url FROM pages WHERE docset_id = ? AND status = 'pending' ORDER BY rowid ASC",
        )
        .bind(docset_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("url")).collect())
    }

    pub async fn count_pages(&self, docset_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages WHERE docset_id = ?")
            .bind(docset_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_pages_with_status(
        &self,
        docset_id: &str,
        status: PageStatus,
    ) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pages WHERE docset_id = ? AND status = ?")
                .bind(docset_id)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ============ Recovery & refresh ============

    /// Reset in-flight pages whose attempt is older than `cutoff` (or was
    /// never stamped) back to `pending`, spending one retry each.
    pub async fn reset_stuck_pages(&self, docset_id: &str, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE pages SET status = 'pending', retry_count = retry_count + 1
            WHERE docset_id = ? AND status IN ('fetching', 'fetched', 'indexing')
              AND (last_attempt_at IS NULL OR last_attempt_at < ?)
            "#,
        )
        .bind(docset_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Give errored pages with remaining retry budget another chance.
    pub async fn reset_error_pages(&self, docset_id: &str, max_retries: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE pages SET status = 'pending' WHERE docset_id = ? AND status = 'error' AND retry_count < ?",
        )
        .bind(docset_id)
        .bind(max_retries)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// In-flight pages stuck past `cutoff`, for the status endpoint.
    pub async fn find_stuck_pages(&self, docset_id: &str, cutoff: i64) -> Result<Vec<Page>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pages
            WHERE docset_id = ? AND status IN ('fetching', 'fetched', 'indexing')
              AND (last_attempt_at IS NULL OR last_attempt_at < ?)
            ORDER BY rowid ASC
            "#,
        )
        .bind(docset_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_page).collect()
    }

    /// Move pages back to `pending` for a refresh. In incremental mode
    /// (`clear_validators = false`) hashes survive so unchanged pages
    /// short-circuit; a full reindex discards hash + ETag + Last-Modified.
    /// `older_than` restricts the refresh to pages fetched before the
    /// cutoff; `None` refreshes everything.
    pub async fn mark_pages_for_refresh(
        &self,
        docset_id: &str,
        older_than: Option<i64>,
        clear_validators: bool,
    ) -> Result<RefreshCounts> {
        let cutoff = older_than.unwrap_or(i64::MAX);
        let result = if clear_validators {
            sqlx::query(
                r#"
                UPDATE pages SET status = 'pending', content_hash = NULL, etag = NULL, last_modified = NULL
                WHERE docset_id = ? AND status IN ('indexed', 'skipped', 'error')
                  AND (fetched_at IS NULL OR fetched_at < ?)
                "#,
            )
            .bind(docset_id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE pages SET status = 'pending'
                WHERE docset_id = ? AND status IN ('indexed', 'skipped', 'error')
                  AND (fetched_at IS NULL OR fetched_at < ?)
                "#,
            )
            .bind(docset_id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?
        };

        let refreshed = result.rows_affected();
        Ok(RefreshCounts {
            refreshed_pages: refreshed,
            preserved_hashes: if clear_validators { 0 } else { refreshed },
            cleared_hashes: if clear_validators { refreshed } else { 0 },
        })
    }

    // ============ Chunks ============

    /// Insert chunks and their FTS mirror rows in one transaction.
    pub async fn create_chunks(&self, chunks: &[ChunkRecord], page: &Page) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, page_id, docset_id, content, heading, start_offset, end_offset, chunk_index, embedding_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.page_id)
            .bind(&chunk.docset_id)
            .bind(&chunk.content)
            .bind(&chunk.heading)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(chunk.chunk_index)
            .bind(&chunk.embedding_id)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO chunks_fts (chunk_id, docset_id, page_id, url, title, heading, content)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.docset_id)
            .bind(&chunk.page_id)
            .bind(&page.url)
            .bind(&page.title)
            .bind(&chunk.heading)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove a page's chunks and their FTS rows.
    pub async fn delete_chunks(&self, page_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE page_id = ?")
            .bind(page_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_chunks_by_page(&self, page_id: &str) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE page_id = ? ORDER BY chunk_index ASC")
            .bind(page_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    pub async fn get_chunk_ids_by_page(&self, page_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM chunks WHERE page_id = ? ORDER BY chunk_index ASC")
            .bind(page_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    /// Record `embedding_id = chunk_id` for vectorised chunks.
    pub async fn set_chunks_embedded(&self, chunk_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk_id in chunk_ids {
            sqlx::query("UPDATE chunks SET embedding_id = id WHERE id = ?")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count_chunks(&self, docset_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE docset_id = ?")
            .bind(docset_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ============ Keyword search ============

    /// FTS5 keyword search across chunk text (plus denormalised URL,
    /// title, and heading). Tokens are normalised and prefix-expanded;
    /// results come back best-first with BM25 mapped into `[0, 1]`.
    pub async fn search_keyword(
        &self,
        query: &str,
        docset_ids: Option<&[String]>,
        top_k: usize,
    ) -> Result<Vec<KeywordHit>> {
        self.ensure_fts_populated().await?;

        let Some(match_expr) = build_match_expression(query) else {
            return Ok(Vec::new());
        };

        // Over-fetch when a docset filter applies, since filtering happens
        // after the FTS cut.
        let fetch_limit = if docset_ids.is_some() {
            (top_k * 5).max(top_k) as i64
        } else {
            top_k as i64
        };

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, docset_id, page_id, url, title, heading, content,
                   bm25(chunks_fts) AS rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank ASC
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(fetch_limit)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let docset_id: String = row.get("docset_id");
            if let Some(filter) = docset_ids {
                if !filter.iter().any(|id| id == &docset_id) {
                    continue;
                }
            }
            let bm25: f64 = row.get("rank");
            hits.push(KeywordHit {
                chunk_id: row.get("chunk_id"),
                docset_id,
                page_id: row.get("page_id"),
                url: row.get("url"),
                title: row.get("title"),
                heading: row.get("heading"),
                content: row.get("content"),
                keyword_score: keyword_score(bm25),
            });
            if hits.len() >= top_k {
                break;
            }
        }
        Ok(hits)
    }

    /// Rebuild the FTS mirror from the chunks table if it is empty while
    /// chunks exist (e.g. after a schema migration). Runs once per open.
    async fn ensure_fts_populated(&self) -> Result<()> {
        if self.fts_checked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(&self.pool)
            .await?;
        if fts_rows > 0 {
            return Ok(());
        }
        let chunk_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        if chunk_rows == 0 {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chunks_fts (chunk_id, docset_id, page_id, url, title, heading, content)
            SELECT c.id, c.docset_id, c.page_id, p.url, p.title, c.heading, c.content
            FROM chunks c JOIN pages p ON p.id = c.page_id
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Status ============

    /// Page counts per state plus the chunk total.
    pub async fn get_index_status(&self, docset_id: &str) -> Result<IndexStatus> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM pages WHERE docset_id = ? GROUP BY status",
        )
        .bind(docset_id)
        .fetch_all(&self.pool)
        .await?;

        let mut status = IndexStatus::default();
        for row in &rows {
            let state: String = row.get("status");
            let n: i64 = row.get("n");
            status.total_pages += n;
            match PageStatus::parse(&state) {
                PageStatus::Pending => status.pending_pages += n,
                PageStatus::Fetching | PageStatus::Fetched | PageStatus::Indexing => {
                    status.in_flight_pages += n
                }
                PageStatus::Indexed => status.indexed_pages += n,
                PageStatus::Error => status.error_pages += n,
                PageStatus::Skipped => status.skipped_pages += n,
            }
        }
        status.total_chunks = self.count_chunks(docset_id).await?;
        Ok(status)
    }
}

/// `1 / (1 + max(0, bm25))` — maps SQLite's ascending-is-better BM25 into
/// a descending `[0, 1]` score.
pub fn keyword_score(bm25: f64) -> f64 {
    1.0 / (1.0 + bm25.max(0.0))
}

/// Lowercase, strip punctuation, drop ≤1-char tokens, and append `*` to
/// each token for prefix matching. Returns `None` for queries with no
/// usable tokens.
fn build_match_expression(query: &str) -> Option<String> {
    let normalized: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let tokens: Vec<String> = normalized
        .split_whitespace()
        .filter(|t| t.len() > 1)
        .map(|t| format!("{}*", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

/// Directory of the seed path: the seed slug with its final segment
/// removed, or `/` when that would be empty.
fn default_allowed_path(seed_slug: &str) -> String {
    match seed_slug.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => seed_slug[..idx].to_string(),
    }
}

fn row_to_docset(row: &sqlx::sqlite::SqliteRow) -> Result<Docset> {
    let allowed_raw: String = row.get("allowed_paths");
    let status: String = row.get("status");
    Ok(Docset {
        id: row.get("id"),
        name: row.get("name"),
        base_url: row.get("base_url"),
        seed_slug: row.get("seed_slug"),
        allowed_paths: serde_json::from_str(&allowed_raw).unwrap_or_default(),
        status: DocsetStatus::parse(&status),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_page(row: &sqlx::sqlite::SqliteRow) -> Result<Page> {
    let status: String = row.get("status");
    Ok(Page {
        id: row.get("id"),
        docset_id: row.get("docset_id"),
        url: row.get("url"),
        path: row.get("path"),
        title: row.get("title"),
        content_hash: row.get("content_hash"),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
        status: PageStatus::parse(&status),
        error_message: row.get("error_message"),
        retry_count: row.get("retry_count"),
        last_attempt_at: row.get("last_attempt_at"),
        fetched_at: row.get("fetched_at"),
        indexed_at: row.get("indexed_at"),
        created_at: row.get("created_at"),
    })
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        id: row.get("id"),
        page_id: row.get("page_id"),
        docset_id: row.get("docset_id"),
        content: row.get("content"),
        heading: row.get("heading"),
        start_offset: row.get("start_offset"),
        end_offset: row.get("end_offset"),
        chunk_index: row.get("chunk_index"),
        embedding_id: row.get("embedding_id"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docset_input() -> DocsetInput {
        DocsetInput {
            base_url: "https://docs.example.com".to_string(),
            seed_slug: "/guide/start".to_string(),
            name: None,
            allowed_paths: None,
        }
    }

    fn chunk(page: &Page, index: i64, content: &str) -> ChunkRecord {
        ChunkRecord {
            id: Uuid::new_v4().to_string(),
            page_id: page.id.clone(),
            docset_id: page.docset_id.clone(),
            content: content.to_string(),
            heading: Some("Guide".to_string()),
            start_offset: 0,
            end_offset: content.len() as i64,
            chunk_index: index,
            embedding_id: None,
            created_at: now_ts(),
        }
    }

    #[tokio::test]
    async fn docset_defaults() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();

        assert_eq!(docset.name, "docs.example.com");
        assert_eq!(docset.allowed_paths, vec!["/guide".to_string()]);
        assert_eq!(docset.status, DocsetStatus::Pending);

        let root = store
            .create_docset(&DocsetInput {
                base_url: "https://root.example.com".to_string(),
                seed_slug: "/start".to_string(),
                name: Some("Root".to_string()),
                allowed_paths: None,
            })
            .await
            .unwrap();
        assert_eq!(root.name, "Root");
        assert_eq!(root.allowed_paths, vec!["/".to_string()]);
    }

    #[tokio::test]
    async fn get_docset_by_url_finds_existing() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let created = store.create_docset(&docset_input()).await.unwrap();
        let found = store
            .get_docset_by_url("https://docs.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
    }

    #[tokio::test]
    async fn page_claim_is_exclusive() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/guide/start")
            .await
            .unwrap();

        assert!(store.claim_page(&page.id).await.unwrap());
        assert!(!store.claim_page(&page.id).await.unwrap());

        let reloaded = store.get_page(&page.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, PageStatus::Fetching);
        assert!(reloaded.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn pending_pages_claimed_in_insertion_order() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let first = store
            .create_page(&docset.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();
        store
            .create_page(&docset.id, "https://docs.example.com/guide/b")
            .await
            .unwrap();

        let next = store.get_next_pending_page(&docset.id).await.unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }

    #[tokio::test]
    async fn error_increments_retry_count() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/guide/x")
            .await
            .unwrap();

        store.mark_page_error(&page.id, "HTTP 500").await.unwrap();
        store.mark_page_error(&page.id, "HTTP 500").await.unwrap();

        let reloaded = store.get_page(&page.id).await.unwrap().unwrap();
        assert_eq!(reloaded.retry_count, 2);
        assert_eq!(reloaded.status, PageStatus::Error);
        assert_eq!(reloaded.error_message.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn chunks_and_fts_rows_are_created_and_deleted_together() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();

        let chunks = vec![
            chunk(&page, 0, "alpha content about installation"),
            chunk(&page, 1, "beta content about configuration"),
        ];
        store.create_chunks(&chunks, &page).await.unwrap();

        let hits = store.search_keyword("alpha", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_id, page.id);
        assert!(hits[0].keyword_score > 0.0 && hits[0].keyword_score <= 1.0);

        store.delete_chunks(&page.id).await.unwrap();
        assert!(store.get_chunks_by_page(&page.id).await.unwrap().is_empty());
        assert!(store.search_keyword("alpha", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keyword_search_prefix_matches() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();
        store
            .create_chunks(&[chunk(&page, 0, "configuring the scheduler")], &page)
            .await
            .unwrap();

        // "config" prefix-matches "configuring"; 1-char tokens are dropped.
        let hits = store.search_keyword("config x", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);

        // Queries with no usable tokens return nothing.
        assert!(store.search_keyword("a ! ?", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keyword_search_filters_by_docset() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let one = store.create_docset(&docset_input()).await.unwrap();
        let two = store
            .create_docset(&DocsetInput {
                base_url: "https://other.example.com".to_string(),
                seed_slug: "/docs/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();

        let page_one = store
            .create_page(&one.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();
        let page_two = store
            .create_page(&two.id, "https://other.example.com/docs/a")
            .await
            .unwrap();
        store
            .create_chunks(&[chunk(&page_one, 0, "shared topic text")], &page_one)
            .await
            .unwrap();
        store
            .create_chunks(&[chunk(&page_two, 0, "shared topic text")], &page_two)
            .await
            .unwrap();

        let filter = vec![one.id.clone()];
        let hits = store
            .search_keyword("shared", Some(&filter), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].docset_id, one.id);
    }

    #[tokio::test]
    async fn fts_bootstrap_rebuilds_empty_mirror() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();
        store
            .create_chunks(&[chunk(&page, 0, "bootstrap target text")], &page)
            .await
            .unwrap();

        // Simulate a migrated database: chunks exist, mirror is empty.
        sqlx::query("DELETE FROM chunks_fts")
            .execute(&store.pool)
            .await
            .unwrap();
        store.fts_checked.store(false, Ordering::SeqCst);

        let hits = store.search_keyword("bootstrap", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_docset_cascades() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();
        store
            .create_chunks(&[chunk(&page, 0, "cascade me")], &page)
            .await
            .unwrap();

        store.delete_docset(&docset.id).await.unwrap();

        assert!(store.get_docset(&docset.id).await.unwrap().is_none());
        assert_eq!(store.count_pages(&docset.id).await.unwrap(), 0);
        assert_eq!(store.count_chunks(&docset.id).await.unwrap(), 0);
        assert!(store.search_keyword("cascade", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stuck_pages_reset_to_pending_with_retry_spent() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();
        store.claim_page(&page.id).await.unwrap();

        // Pretend the claim happened ten minutes ago.
        sqlx::query("UPDATE pages SET last_attempt_at = ? WHERE id = ?")
            .bind(now_ts() - 600)
            .bind(&page.id)
            .execute(&store.pool)
            .await
            .unwrap();

        let reset = store
            .reset_stuck_pages(&docset.id, now_ts() - 300)
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let reloaded = store.get_page(&page.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, PageStatus::Pending);
        assert_eq!(reloaded.retry_count, 1);
    }

    #[tokio::test]
    async fn error_pages_reset_only_within_retry_budget() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();
        for _ in 0..3 {
            store.mark_page_error(&page.id, "HTTP 500").await.unwrap();
        }

        assert_eq!(store.reset_error_pages(&docset.id, 3).await.unwrap(), 0);
        assert_eq!(store.reset_error_pages(&docset.id, 4).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn refresh_marks_pages_pending() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let page = store
            .create_page(&docset.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();
        store
            .mark_page_fetched(&page.id, "hash", Some("\"tag\""), None)
            .await
            .unwrap();
        store.mark_page_indexed(&page.id, false).await.unwrap();

        let counts = store
            .mark_pages_for_refresh(&docset.id, None, false)
            .await
            .unwrap();
        assert_eq!(counts.refreshed_pages, 1);
        assert_eq!(counts.preserved_hashes, 1);

        let reloaded = store.get_page(&page.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, PageStatus::Pending);
        assert_eq!(reloaded.content_hash.as_deref(), Some("hash"));

        // Full reindex clears the validators.
        store.mark_page_indexed(&page.id, false).await.unwrap();
        let counts = store
            .mark_pages_for_refresh(&docset.id, None, true)
            .await
            .unwrap();
        assert_eq!(counts.cleared_hashes, 1);
        let reloaded = store.get_page(&page.id).await.unwrap().unwrap();
        assert!(reloaded.content_hash.is_none());
        assert!(reloaded.etag.is_none());
    }

    #[tokio::test]
    async fn index_status_aggregates() {
        let store = MetadataStore::open_in_memory().await.unwrap();
        let docset = store.create_docset(&docset_input()).await.unwrap();
        let a = store
            .create_page(&docset.id, "https://docs.example.com/guide/a")
            .await
            .unwrap();
        store
            .create_page(&docset.id, "https://docs.example.com/guide/b")
            .await
            .unwrap();
        store.mark_page_indexed(&a.id, false).await.unwrap();
        store
            .create_chunks(&[chunk(&a, 0, "status text")], &a)
            .await
            .unwrap();

        let status = store.get_index_status(&docset.id).await.unwrap();
        assert_eq!(status.total_pages, 2);
        assert_eq!(status.indexed_pages, 1);
        assert_eq!(status.pending_pages, 1);
        assert_eq!(status.total_chunks, 1);
    }

    #[test]
    fn keyword_score_bounds() {
        assert_eq!(keyword_score(0.0), 1.0);
        assert_eq!(keyword_score(-3.0), 1.0);
        assert!(keyword_score(9.0) > 0.0 && keyword_score(9.0) < 1.0);
    }

    #[test]
    fn match_expression_normalisation() {
        // 1-char tokens drop; the rest lowercase and take a `*` suffix.
        assert_eq!(
            build_match_expression("How do I configure X?").as_deref(),
            Some("how* do* configure*")
        );
        assert!(build_match_expression("? !").is_none());
    }
}
