//! Core data models used throughout mem-oracle.
//!
//! These types represent the docsets, pages, and chunks that flow through
//! the crawl and retrieval pipeline. The data lifecycle is:
//!
//! ```text
//! index request → Docset → seed Page → fetch() → extract() → chunk() → Chunk
//!                                                                  ↓
//!                                                             embed() → vector record
//!                                                                  ↓
//!                                                             search() → SearchHit
//! ```
//!
//! # Type Relationships
//!
//! - A **[`Docset`]** is the crawl unit: one documentation site bounded by
//!   host + allowed path prefixes. It owns its pages and a dedicated
//!   namespace in the vector store.
//! - A **[`Page`]** is one URL under a docset, carrying fetch state,
//!   conditional-request headers, and retry bookkeeping.
//! - A **[`ChunkRecord`]** is a size-bounded, heading-aware contiguous slice
//!   of a page's plain text, mirrored into the FTS index.
//! - An **[`ExtractedPage`]** is the intermediate output of the extractor
//!   before chunking.
//!
//! Timestamps are stored as Unix epoch seconds (i64) for efficient
//! comparison and indexing. Identifiers are UUID v4 strings.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Docset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocsetStatus {
    /// Created but no crawl has started yet.
    Pending,
    /// A background crawl is running (or scheduled).
    Indexing,
    /// The last crawl drained the frontier without being stopped.
    Ready,
    /// The docset hit a non-recoverable failure.
    Error,
}

impl DocsetStatus {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocsetStatus::Pending => "pending",
            DocsetStatus::Indexing => "indexing",
            DocsetStatus::Ready => "ready",
            DocsetStatus::Error => "error",
        }
    }

    /// Parse the database representation; unknown values map to `Error`.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => DocsetStatus::Pending,
            "indexing" => DocsetStatus::Indexing,
            "ready" => DocsetStatus::Ready,
            _ => DocsetStatus::Error,
        }
    }
}

/// Lifecycle state of a [`Page`].
///
/// Transitions observed by external readers follow
/// `pending → fetching → fetched → indexing → indexed` with terminal
/// `error` / `skipped`, and `indexed → pending` only via refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    /// Discovered, waiting for a crawl worker.
    Pending,
    /// Claimed by a worker; fetch in progress.
    Fetching,
    /// Body fetched and hashed; extraction pending.
    Fetched,
    /// Chunking/embedding in progress.
    Indexing,
    /// Fully indexed (zero chunks is legal for empty pages).
    Indexed,
    /// Failed; eligible for retry until the retry budget is spent.
    Error,
    /// Intentionally not indexed (HTTP 401/403/404).
    Skipped,
}

impl PageStatus {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Pending => "pending",
            PageStatus::Fetching => "fetching",
            PageStatus::Fetched => "fetched",
            PageStatus::Indexing => "indexing",
            PageStatus::Indexed => "indexed",
            PageStatus::Error => "error",
            PageStatus::Skipped => "skipped",
        }
    }

    /// Parse the database representation; unknown values map to `Error`.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => PageStatus::Pending,
            "fetching" => PageStatus::Fetching,
            "fetched" => PageStatus::Fetched,
            "indexing" => PageStatus::Indexing,
            "indexed" => PageStatus::Indexed,
            "skipped" => PageStatus::Skipped,
            _ => PageStatus::Error,
        }
    }
}

/// A single documentation source: one site bounded by host + path prefixes.
///
/// | Field | Description |
/// |-------|-------------|
/// | `id` | UUID v4 primary key |
/// | `name` | Display name; defaults to the base URL host |
/// | `base_url` | Scheme + host, e.g. `https://docs.example.com` |
/// | `seed_slug` | Path of the first page to fetch, e.g. `/docs/intro` |
/// | `allowed_paths` | Path prefixes the crawl may not leave |
/// | `status` | Lifecycle state |
/// | `created_at` / `updated_at` | Unix epoch seconds |
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Docset {
    /// UUID v4 primary key.
    pub id: String,
    /// Human-readable name (defaults to the base URL host).
    pub name: String,
    /// Scheme + host of the documentation site.
    pub base_url: String,
    /// Path of the seed page.
    pub seed_slug: String,
    /// Ordered set of allowed path prefixes; the frontier never leaves them.
    pub allowed_paths: Vec<String>,
    /// Lifecycle state.
    pub status: DocsetStatus,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Last update timestamp (Unix epoch seconds).
    pub updated_at: i64,
}

/// One fetched (or discovered) URL under a docset.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// UUID v4 primary key.
    pub id: String,
    /// Owning docset.
    pub docset_id: String,
    /// Canonical URL (fragment stripped).
    pub url: String,
    /// URL path component, used for prefix confinement and breadcrumbs.
    pub path: String,
    /// Page title from the extractor.
    pub title: Option<String>,
    /// SHA-256 of the last successfully fetched body.
    pub content_hash: Option<String>,
    /// ETag from the last fetch, for conditional requests.
    pub etag: Option<String>,
    /// Last-Modified from the last fetch, for conditional requests.
    pub last_modified: Option<String>,
    /// Lifecycle state.
    pub status: PageStatus,
    /// Message of the last failure, if any.
    pub error_message: Option<String>,
    /// Number of failed attempts; monotonically non-decreasing.
    pub retry_count: i64,
    /// When a worker last claimed this page (Unix epoch seconds).
    pub last_attempt_at: Option<i64>,
    /// When the body was last fetched (Unix epoch seconds).
    pub fetched_at: Option<i64>,
    /// When the page was last fully indexed (Unix epoch seconds).
    pub indexed_at: Option<i64>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// A contiguous text slice of a page, stored in the `chunks` table and
/// mirrored into the FTS index.
///
/// `start_offset` / `end_offset` are approximate offsets into the page's
/// plain text: a chunk's start is its section start plus the running total
/// of previously emitted chunk text in that section. They are diagnostic
/// only and never drive retrieval.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    /// UUID v4 primary key; doubles as the vector id once embedded.
    pub id: String,
    /// Owning page.
    pub page_id: String,
    /// Owning docset (denormalised for search filtering).
    pub docset_id: String,
    /// Chunk text.
    pub content: String,
    /// Heading of the section this chunk was cut from, if any.
    pub heading: Option<String>,
    /// Approximate start offset into the page's plain text.
    pub start_offset: i64,
    /// Approximate exclusive end offset.
    pub end_offset: i64,
    /// Zero-based, dense index within the page.
    pub chunk_index: i64,
    /// Equal to `id` once the chunk has been vectorised.
    pub embedding_id: Option<String>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// A heading found by the extractor, with its cumulative character offset
/// into the page's plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Heading {
    /// Heading depth (1-6).
    pub level: u8,
    /// Visible heading text.
    pub text: String,
    /// Character offset into the extracted plain text.
    pub offset: usize,
}

/// Extractor output for one page.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    /// Canonical URL of the page.
    pub url: String,
    /// `<title>`, first `<h1>`, or first Markdown heading.
    pub title: Option<String>,
    /// Plain text with normalised whitespace.
    pub content: String,
    /// Same-host outgoing links, fragments stripped, deduped in order.
    pub links: Vec<String>,
    /// Headings in document order.
    pub headings: Vec<Heading>,
}

/// Denormalised metadata carried by each vector record, sufficient for
/// search to return a result without a second store lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMeta {
    /// Owning docset.
    pub docset_id: String,
    /// Owning page.
    pub page_id: String,
    /// Chunk this vector was computed from.
    pub chunk_id: String,
    /// Page URL.
    pub url: String,
    /// Page title at embedding time.
    pub title: Option<String>,
    /// Section heading at embedding time.
    pub heading: Option<String>,
    /// Chunk text.
    pub content: String,
}

/// Aggregated per-docset indexing progress.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    /// All pages known to the docset.
    pub total_pages: i64,
    /// Pages waiting for a crawl worker.
    pub pending_pages: i64,
    /// Pages currently in `{fetching, fetched, indexing}`.
    pub in_flight_pages: i64,
    /// Fully indexed pages.
    pub indexed_pages: i64,
    /// Pages in terminal `error` state.
    pub error_pages: i64,
    /// Pages skipped (HTTP 401/403/404).
    pub skipped_pages: i64,
    /// Chunks across all pages.
    pub total_chunks: i64,
}

/// Current Unix timestamp in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
