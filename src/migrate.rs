//! Database schema creation and additive migrations.
//!
//! # Schema
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────┐
//! │   docsets    │──┐  │     pages      │──┐  │    chunks    │
//! │              │  │  │                │  │  │              │
//! │ id (PK)      │  │  │ id (PK)        │  │  │ id (PK)      │
//! │ name         │  └──│ docset_id      │  └──│ page_id      │
//! │ base_url     │     │ url / path     │     │ docset_id    │
//! │ seed_slug    │     │ title          │     │ content      │
//! │ allowed_paths│     │ content_hash   │     │ heading      │
//! │ status       │     │ etag / last_mod│     │ offsets      │
//! │ created_at   │     │ status / error │     │ chunk_index  │
//! │ updated_at   │     │ retry_count    │     │ embedding_id │
//! └──────────────┘     │ last_attempt_at│     │ created_at   │
//!                      │ section        │     └──────────────┘
//!                      │ fetched_at     │
//!                      │ indexed_at     │     ┌──────────────┐
//!                      │ created_at     │     │  chunks_fts  │
//!                      └────────────────┘     │  (FTS5)      │
//!                                             │ chunk_id     │
//!                                             │ docset_id    │
//!                                             │ page_id      │
//!                                             │ url/title/   │
//!                                             │ heading/     │
//!                                             │ content      │
//!                                             └──────────────┘
//! ```
//!
//! Deleting a docset cascades pages → chunks via foreign keys; the FTS5
//! mirror is a virtual table outside FK enforcement, so its rows are
//! deleted explicitly in the same transaction as their owners.
//!
//! # Evolution
//!
//! Older databases may predate `retry_count`, `last_attempt_at`,
//! `section`, or the FTS mirror. [`run_migrations`] inspects the pages
//! table and applies additive `ALTER TABLE`s, backfilling `section`
//! deterministically from the first URL path segment. Safe to run on every
//! open.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

/// Create all tables and indexes, upgrading older schemas in place.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS docsets (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            base_url TEXT NOT NULL UNIQUE,
            seed_slug TEXT NOT NULL,
            allowed_paths TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            id TEXT PRIMARY KEY,
            docset_id TEXT NOT NULL,
            url TEXT NOT NULL,
            path TEXT NOT NULL,
            title TEXT,
            content_hash TEXT,
            etag TEXT,
            last_modified TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at INTEGER,
            section TEXT,
            fetched_at INTEGER,
            indexed_at INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE(docset_id, url),
            FOREIGN KEY (docset_id) REFERENCES docsets(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            page_id TEXT NOT NULL,
            docset_id TEXT NOT NULL,
            content TEXT NOT NULL,
            heading TEXT,
            start_offset INTEGER NOT NULL DEFAULT 0,
            end_offset INTEGER NOT NULL DEFAULT 0,
            chunk_index INTEGER NOT NULL,
            embedding_id TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(page_id, chunk_index),
            FOREIGN KEY (page_id) REFERENCES pages(id) ON DELETE CASCADE,
            FOREIGN KEY (docset_id) REFERENCES docsets(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    upgrade_pages_table(pool).await?;

    // FTS5 virtual table (not idempotent natively, check first).
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                docset_id UNINDEXED,
                page_id UNINDEXED,
                url,
                title,
                heading,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_docset_status ON pages(docset_id, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_page_id ON chunks(page_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_docset_id ON chunks(docset_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Bring a pre-existing pages table up to the canonical column set.
async fn upgrade_pages_table(pool: &SqlitePool) -> Result<()> {
    let columns = sqlx::query("PRAGMA table_info(pages)")
        .fetch_all(pool)
        .await?;
    let names: Vec<String> = columns
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();

    if !names.iter().any(|n| n == "retry_count") {
        sqlx::query("ALTER TABLE pages ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0")
            .execute(pool)
            .await?;
    }
    if !names.iter().any(|n| n == "last_attempt_at") {
        sqlx::query("ALTER TABLE pages ADD COLUMN last_attempt_at INTEGER")
            .execute(pool)
            .await?;
    }
    if !names.iter().any(|n| n == "section") {
        sqlx::query("ALTER TABLE pages ADD COLUMN section TEXT")
            .execute(pool)
            .await?;
        backfill_sections(pool).await?;
    }

    Ok(())
}

/// Derive `section` from the first URL path segment, e.g. `/guide/intro`
/// → `guide`.
async fn backfill_sections(pool: &SqlitePool) -> Result<()> {
    let rows = sqlx::query("SELECT id, path FROM pages WHERE section IS NULL")
        .fetch_all(pool)
        .await?;

    let mut tx = pool.begin().await?;
    for row in rows {
        let id: String = row.get("id");
        let path: String = row.get("path");
        let section = section_from_path(&path);
        sqlx::query("UPDATE pages SET section = ? WHERE id = ?")
            .bind(section)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// First non-empty path segment, or `None` for the root.
pub fn section_from_path(path: &str) -> Option<String> {
    path.split('/')
        .find(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_from_path_takes_first_segment() {
        assert_eq!(section_from_path("/guide/intro"), Some("guide".to_string()));
        assert_eq!(section_from_path("/api"), Some("api".to_string()));
        assert_eq!(section_from_path("/"), None);
        assert_eq!(section_from_path(""), None);
    }
}
