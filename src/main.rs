//! # mem-oracle CLI
//!
//! The `mem-oracle` binary runs the documentation oracle: a background
//! worker serving HTTP and JSON-RPC surfaces, plus one-shot commands for
//! indexing, searching, and maintenance.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mem-oracle serve` | Start the HTTP worker API |
//! | `mem-oracle rpc` | Serve the JSON-RPC tool protocol on stdio |
//! | `mem-oracle index <base-url> <seed-slug>` | Crawl and index a docs site |
//! | `mem-oracle search "<query>"` | Query indexed documentation |
//! | `mem-oracle status` | Show per-docset crawl progress |
//! | `mem-oracle refresh <docset-id>` | Re-check a docset for changes |
//! | `mem-oracle delete <docset-id>` | Remove a docset and all derived state |
//!
//! Configuration lives at `<data-dir>/config.json` (default data dir:
//! `$HOME/.mem-oracle`); every key is optional and falls back to a
//! sensible default.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mem_oracle::config::{self, Config};
use mem_oracle::orchestrator::{IndexRequest, Orchestrator, RefreshRequest, STUCK_THRESHOLD_MS};
use mem_oracle::search::SearchOptions;
use mem_oracle::{rpc, server};

/// mem-oracle — a local documentation oracle with hybrid retrieval.
#[derive(Parser)]
#[command(
    name = "mem-oracle",
    about = "Local documentation oracle: crawl docs sites, answer queries with hybrid retrieval",
    version
)]
struct Cli {
    /// Path to config.json. Defaults to `<data-dir>/config.json`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory (cache, vectors, database).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP worker API.
    ///
    /// Recovers interrupted crawls on startup, then serves until killed.
    Serve {
        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Serve the JSON-RPC tool protocol on stdin/stdout.
    ///
    /// For editor and assistant integrations that speak line-delimited
    /// JSON-RPC (initialize, tools/list, tools/call).
    Rpc,

    /// Crawl and index a documentation site.
    Index {
        /// Scheme + host, e.g. https://docs.example.com
        base_url: String,
        /// Path of the first page to fetch, e.g. /guide/intro
        seed_slug: String,
        /// Display name (defaults to the host).
        #[arg(long)]
        name: Option<String>,
        /// Allowed path prefix; repeatable. Defaults to the seed's directory.
        #[arg(long = "allowed-path")]
        allowed_paths: Vec<String>,
        /// Return as soon as the crawl is scheduled instead of waiting.
        #[arg(long)]
        no_wait: bool,
    },

    /// Search indexed documentation.
    Search {
        /// The query string.
        query: String,
        /// Maximum results.
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        /// Restrict to one docset id.
        #[arg(long)]
        docset: Option<String>,
        /// Print formatted snippets instead of result lines.
        #[arg(long)]
        snippets: bool,
    },

    /// Show per-docset crawl and index status.
    Status {
        /// Restrict to one docset id.
        #[arg(long)]
        docset: Option<String>,
        /// Include pages stuck in-flight past the recovery threshold.
        #[arg(long)]
        stuck: bool,
    },

    /// Re-check a docset (or all docsets) for changed pages.
    Refresh {
        /// Docset id; refreshes every docset when omitted.
        docset_id: Option<String>,
        /// Refresh all pages regardless of age.
        #[arg(long)]
        force: bool,
        /// Discard content hashes so every page re-embeds.
        #[arg(long)]
        full: bool,
    },

    /// Delete a docset, its pages, chunks, and vectors.
    Delete {
        /// Docset id.
        docset_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = load_config(&cli)?;
    if let Some(data_dir) = &cli.data_dir {
        cfg.data_dir = data_dir.clone();
    }

    match cli.command {
        Commands::Serve { port } => {
            let host = cfg.worker.host.clone();
            let port = port.unwrap_or(cfg.worker.port);
            let orchestrator = Orchestrator::from_config(cfg).await?;
            Arc::clone(&orchestrator)
                .recover_from_crash(STUCK_THRESHOLD_MS)
                .await?;
            server::run_server(orchestrator, &host, port).await?;
        }
        Commands::Rpc => {
            let orchestrator = Orchestrator::from_config(cfg).await?;
            Arc::clone(&orchestrator)
                .recover_from_crash(STUCK_THRESHOLD_MS)
                .await?;
            rpc::run_stdio(orchestrator).await?;
        }
        Commands::Index {
            base_url,
            seed_slug,
            name,
            allowed_paths,
            no_wait,
        } => {
            let orchestrator = Orchestrator::from_config(cfg).await?;
            let outcome = Arc::clone(&orchestrator)
                .index_docset(IndexRequest {
                    base_url,
                    seed_slug,
                    name,
                    allowed_paths: if allowed_paths.is_empty() {
                        None
                    } else {
                        Some(allowed_paths)
                    },
                    wait_for_seed: true,
                })
                .await?;

            println!("docset {} ({})", outcome.docset.name, outcome.docset.id);
            println!("  seed indexed: {}", outcome.seed_indexed);

            if !no_wait {
                wait_for_crawl(&orchestrator, &outcome.docset.id).await?;
            }
        }
        Commands::Search {
            query,
            top_k,
            docset,
            snippets,
        } => {
            let orchestrator = Orchestrator::from_config(cfg).await?;
            let response = orchestrator
                .search(SearchOptions {
                    query,
                    docset_ids: docset.map(|id| vec![id]),
                    top_k: Some(top_k),
                    format_snippets: Some(snippets),
                    ..Default::default()
                })
                .await?;

            if response.results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, hit) in response.results.iter().enumerate() {
                if snippets {
                    if let Some(snippet) = &hit.snippet {
                        println!("{}", snippet.formatted);
                        println!();
                        continue;
                    }
                }
                let title = hit.title.as_deref().unwrap_or("(untitled)");
                println!("{}. [{:.3}] {}", i + 1, hit.score, title);
                println!("    url: {}", hit.url);
                if let Some(heading) = &hit.heading {
                    println!("    section: {}", heading);
                }
                let excerpt: String = hit.content.chars().take(200).collect();
                println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
                println!();
            }
        }
        Commands::Status { docset, stuck } => {
            let orchestrator = Orchestrator::from_config(cfg).await?;
            let reports = orchestrator.get_status(docset.as_deref(), stuck).await?;
            if reports.is_empty() {
                println!("No docsets indexed.");
                return Ok(());
            }
            for report in &reports {
                let s = &report.index_status;
                println!(
                    "{} ({}) — {}",
                    report.docset.name,
                    report.docset.id,
                    report.docset.status.as_str()
                );
                println!(
                    "  pages: {} total, {} indexed, {} pending, {} in flight, {} errors, {} skipped",
                    s.total_pages,
                    s.indexed_pages,
                    s.pending_pages,
                    s.in_flight_pages,
                    s.error_pages,
                    s.skipped_pages
                );
                println!("  chunks: {}", s.total_chunks);
                if let Some(stuck_pages) = &report.stuck_pages {
                    for page in stuck_pages {
                        println!("  stuck: {} ({})", page.url, page.status.as_str());
                    }
                }
            }
        }
        Commands::Refresh {
            docset_id,
            force,
            full,
        } => {
            let orchestrator = Orchestrator::from_config(cfg).await?;
            let request = RefreshRequest {
                force,
                max_age: None,
                full_reindex: full,
            };
            let plans = match docset_id {
                Some(id) => vec![
                    Arc::clone(&orchestrator)
                        .refresh_docset(&id, &request)
                        .await?,
                ],
                None => Arc::clone(&orchestrator).refresh_all(&request).await?,
            };
            for plan in &plans {
                println!(
                    "refresh {}: {} pages requeued ({} hashes preserved, {} cleared)",
                    plan.docset_id,
                    plan.counts.refreshed_pages,
                    plan.counts.preserved_hashes,
                    plan.counts.cleared_hashes
                );
                if plan.counts.refreshed_pages > 0 {
                    wait_for_crawl(&orchestrator, &plan.docset_id).await?;
                }
            }
        }
        Commands::Delete { docset_id } => {
            let orchestrator = Orchestrator::from_config(cfg).await?;
            if orchestrator.delete_docset(&docset_id).await? {
                println!("deleted {}", docset_id);
            } else {
                anyhow::bail!("docset not found: {}", docset_id);
            }
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let data_dir = cli
                .data_dir
                .clone()
                .unwrap_or_else(|| Config::default().data_dir);
            Config::config_path_in(&data_dir)
        }
    };
    config::load_config(&path)
}

/// Block until the docset's background crawl drains, printing progress.
async fn wait_for_crawl(orchestrator: &Arc<Orchestrator>, docset_id: &str) -> Result<()> {
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if !orchestrator.is_crawling(docset_id) {
            break;
        }
        let reports = orchestrator.get_status(Some(docset_id), false).await?;
        if let Some(report) = reports.first() {
            let s = &report.index_status;
            println!(
                "  crawling: {}/{} pages indexed, {} pending",
                s.indexed_pages, s.total_pages, s.pending_pages
            );
        }
    }
    Ok(())
}
