//! # mem-oracle
//!
//! **A local documentation oracle for code-assistant clients.**
//!
//! mem-oracle crawls public documentation websites, decomposes pages into
//! semantically coherent chunks, embeds those chunks into a vector space,
//! and answers natural-language queries with the most relevant snippets
//! fused from dense (vector) and sparse (BM25) retrieval.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────────┐   ┌───────────────┐
//! │ Frontier │──▶│         Orchestrator          │──▶│    SQLite     │
//! │ (per     │   │ fetch → extract → chunk →     │   │ docsets/pages │
//! │  docset) │   │ embed → persist               │   │ chunks + FTS5 │
//! └──────────┘   └──────────────┬────────────────┘   └───────┬───────┘
//!                               │                            │
//!                        ┌──────┴──────┐              ┌──────┴──────┐
//!                        │ Vector store│              │   Hybrid    │
//!                        │ (per-docset │─────────────▶│   search    │
//!                        │  namespaces)│              └──────┬──────┘
//!                        └─────────────┘                     │
//!                                          ┌─────────────────┤
//!                                          ▼                 ▼
//!                                    ┌──────────┐      ┌──────────┐
//!                                    │   HTTP   │      │ JSON-RPC │
//!                                    │  worker  │      │  (stdio) │
//!                                    └──────────┘      └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. An **index request** creates a [`models::Docset`] and its seed
//!    [`models::Page`].
//! 2. The **crawl worker pool** ([`orchestrator`]) claims pending pages,
//!    fetches them with conditional requests ([`fetcher`], [`cache`]), and
//!    extracts text, headings, and links ([`extract`]).
//! 3. Discovered links feed the [`frontier`], confined to the docset's
//!    host and allowed path prefixes.
//! 4. Page text is split by the [`chunker`] and embedded ([`embedding`]);
//!    chunks land in SQLite + FTS5 ([`store`]) and vectors in the
//!    per-docset [`vector`] namespaces.
//! 5. Queries run through the **hybrid search** pipeline ([`search`]):
//!    exact cosine + BM25, score fusion, diversity and budget shaping,
//!    snippet formatting ([`snippet`]).
//! 6. Results are exposed via the **HTTP worker** ([`server`]) and the
//!    **JSON-RPC stdio tools** ([`rpc`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | `config.json` parsing, defaults, closed-key validation |
//! | [`models`] | Core data types: `Docset`, `Page`, `ChunkRecord`, statuses |
//! | [`cache`] | Disk cache of fetched bodies with ETag/Last-Modified |
//! | [`store`] | SQLite metadata store with FTS5 keyword search |
//! | [`migrate`] | Schema creation and additive migrations |
//! | [`vector`] | Per-docset flat vector index with exact cosine search |
//! | [`fetcher`] | Conditional HTTP fetching with cache fallback |
//! | [`extract`] | HTML/Markdown → title, plain text, headings, links |
//! | [`chunker`] | Size-and-heading-aware text splitting |
//! | [`embedding`] | Provider trait: local hashing, OpenAI, Voyage, Cohere |
//! | [`retry`] | Backoff with jitter for remote embedding calls |
//! | [`frontier`] | Per-docset crawl queue with host/prefix confinement |
//! | [`orchestrator`] | Pipeline, worker pool, recovery, refresh |
//! | [`search`] | Hybrid fusion, diversity filter, budget filter |
//! | [`snippet`] | Breadcrumbs and boundary-aware truncation |
//! | [`server`] | HTTP worker API (axum) with CORS |
//! | [`rpc`] | Line-delimited JSON-RPC tool surface on stdio |

pub mod cache;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod fetcher;
pub mod frontier;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod rpc;
pub mod search;
pub mod server;
pub mod snippet;
pub mod store;
pub mod vector;
