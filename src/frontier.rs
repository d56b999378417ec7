//! Per-docset link frontier: discovered-but-unfetched URLs.
//!
//! The frontier enforces crawl confinement — same host, allowed path
//! prefixes, page cap — at the moment links are discovered, creating
//! `pending` page records as a durable mirror of the queue. Items pop in
//! breadth-first order (smallest depth first, insertion order as the
//! tie-break). On resume, [`Frontier::load_pending_pages`] hydrates the
//! in-memory state from the metadata store.

use anyhow::Result;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

use crate::models::Docset;
use crate::store::MetadataStore;

/// One queued crawl unit.
#[derive(Debug, Clone)]
pub struct CrawlItem {
    pub url: String,
    pub depth: u32,
    /// URL of the page that linked here, if discovered via a link.
    pub from: Option<String>,
}

struct OrderedItem {
    depth: u32,
    seq: u64,
    item: CrawlItem,
}

impl PartialEq for OrderedItem {
    fn eq(&self, other: &Self) -> bool {
        self.depth == other.depth && self.seq == other.seq
    }
}
impl Eq for OrderedItem {}

impl PartialOrd for OrderedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the smallest (depth, seq) first.
impl Ord for OrderedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.depth, other.seq).cmp(&(self.depth, self.seq))
    }
}

#[derive(Default)]
struct DocsetFrontier {
    queue: BinaryHeap<OrderedItem>,
    visited: HashSet<String>,
    seq: u64,
}

impl DocsetFrontier {
    fn push(&mut self, item: CrawlItem) {
        let entry = OrderedItem {
            depth: item.depth,
            seq: self.seq,
            item,
        };
        self.seq += 1;
        self.queue.push(entry);
    }
}

/// Queue of discovered URLs plus visited set, one partition per docset.
pub struct Frontier {
    store: Arc<MetadataStore>,
    max_pages: usize,
    state: Mutex<HashMap<String, DocsetFrontier>>,
}

impl Frontier {
    pub fn new(store: Arc<MetadataStore>, max_pages: usize) -> Self {
        Self {
            store,
            max_pages,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Feed link candidates discovered on `from_url` into the frontier.
    /// Candidates outside the docset's host or allowed prefixes are
    /// rejected; known pages and already-visited URLs are skipped; once the
    /// docset holds `max_pages` pages nothing further is enqueued. Returns
    /// the number of newly created pages.
    pub async fn discover_links(
        &self,
        docset: &Docset,
        from_url: &str,
        candidates: &[String],
        depth: u32,
    ) -> Result<usize> {
        let Some(base_host) = host_of(&docset.base_url) else {
            return Ok(0);
        };

        let mut state = self.state.lock().await;
        let frontier = state.entry(docset.id.clone()).or_default();

        let mut page_count = self.store.count_pages(&docset.id).await?;
        let mut created = 0usize;

        for candidate in candidates {
            if frontier.visited.contains(candidate) {
                continue;
            }
            let Ok(parsed) = Url::parse(candidate) else {
                frontier.visited.insert(candidate.clone());
                continue;
            };
            if parsed.host_str() != Some(base_host.as_str()) {
                frontier.visited.insert(candidate.clone());
                continue;
            }
            let path = parsed.path();
            if !docset
                .allowed_paths
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
            {
                frontier.visited.insert(candidate.clone());
                continue;
            }
            if self
                .store
                .get_page_by_url(&docset.id, candidate)
                .await?
                .is_some()
            {
                frontier.visited.insert(candidate.clone());
                continue;
            }
            if page_count >= self.max_pages as i64 {
                return Ok(created);
            }

            self.store.create_page(&docset.id, candidate).await?;
            page_count += 1;
            created += 1;
            frontier.visited.insert(candidate.clone());
            frontier.push(CrawlItem {
                url: candidate.clone(),
                depth: depth + 1,
                from: Some(from_url.to_string()),
            });
        }
        Ok(created)
    }

    /// Pop the shallowest queued item (stable on insertion order).
    pub async fn get_next(&self, docset_id: &str) -> Option<CrawlItem> {
        let mut state = self.state.lock().await;
        state
            .get_mut(docset_id)
            .and_then(|frontier| frontier.queue.pop())
            .map(|entry| entry.item)
    }

    /// Number of queued items for a docset.
    pub async fn len(&self, docset_id: &str) -> usize {
        let state = self.state.lock().await;
        state.get(docset_id).map_or(0, |f| f.queue.len())
    }

    /// Rebuild the queue from `pending` page records, e.g. after a restart.
    /// Already-queued URLs are not duplicated.
    pub async fn load_pending_pages(&self, docset_id: &str) -> Result<usize> {
        let urls = self.store.pending_page_urls(docset_id).await?;
        let mut state = self.state.lock().await;
        let frontier = state.entry(docset_id.to_string()).or_default();

        let mut loaded = 0usize;
        for url in urls {
            if frontier.visited.insert(url.clone()) {
                frontier.push(CrawlItem {
                    url,
                    depth: 0,
                    from: None,
                });
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Record a URL as known without queueing it (e.g. the seed page the
    /// orchestrator creates directly).
    pub async fn note_visited(&self, docset_id: &str, url: &str) {
        let mut state = self.state.lock().await;
        state
            .entry(docset_id.to_string())
            .or_default()
            .visited
            .insert(url.to_string());
    }

    /// Drop all frontier state for a docset.
    pub async fn clear(&self, docset_id: &str) {
        let mut state = self.state.lock().await;
        state.remove(docset_id);
    }
}

fn host_of(base_url: &str) -> Option<String> {
    Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocsetInput;

    async fn setup(max_pages: usize) -> (Arc<MetadataStore>, Frontier, Docset) {
        let store = Arc::new(MetadataStore::open_in_memory().await.unwrap());
        let docset = store
            .create_docset(&DocsetInput {
                base_url: "https://docs.example.com".to_string(),
                seed_slug: "/docs/start".to_string(),
                name: None,
                allowed_paths: None,
            })
            .await
            .unwrap();
        let frontier = Frontier::new(Arc::clone(&store), max_pages);
        (store, frontier, docset)
    }

    #[tokio::test]
    async fn confines_to_host_and_prefix() {
        let (store, frontier, docset) = setup(100).await;

        let created = frontier
            .discover_links(
                &docset,
                "https://docs.example.com/docs/start",
                &[
                    "https://docs.example.com/docs/a".to_string(),
                    "https://docs.example.com/blog/offside".to_string(),
                    "https://other.example.org/docs/b".to_string(),
                    "not a url".to_string(),
                ],
                0,
            )
            .await
            .unwrap();

        assert_eq!(created, 1);
        assert_eq!(store.count_pages(&docset.id).await.unwrap(), 1);
        let page = store
            .get_page_by_url(&docset.id, "https://docs.example.com/docs/a")
            .await
            .unwrap();
        assert!(page.is_some());
    }

    #[tokio::test]
    async fn visited_and_existing_pages_not_requeued() {
        let (store, frontier, docset) = setup(100).await;
        store
            .create_page(&docset.id, "https://docs.example.com/docs/known")
            .await
            .unwrap();

        let links = vec![
            "https://docs.example.com/docs/known".to_string(),
            "https://docs.example.com/docs/new".to_string(),
        ];
        let created = frontier
            .discover_links(&docset, "https://docs.example.com/docs/start", &links, 0)
            .await
            .unwrap();
        assert_eq!(created, 1);

        // Re-discovering the same candidates adds nothing.
        let created = frontier
            .discover_links(&docset, "https://docs.example.com/docs/start", &links, 0)
            .await
            .unwrap();
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn pops_smallest_depth_first() {
        let (_store, frontier, docset) = setup(100).await;

        frontier
            .discover_links(
                &docset,
                "https://docs.example.com/docs/deep",
                &["https://docs.example.com/docs/d2".to_string()],
                1,
            )
            .await
            .unwrap();
        frontier
            .discover_links(
                &docset,
                "https://docs.example.com/docs/start",
                &[
                    "https://docs.example.com/docs/d1a".to_string(),
                    "https://docs.example.com/docs/d1b".to_string(),
                ],
                0,
            )
            .await
            .unwrap();

        let first = frontier.get_next(&docset.id).await.unwrap();
        assert_eq!(first.url, "https://docs.example.com/docs/d1a");
        assert_eq!(first.depth, 1);
        let second = frontier.get_next(&docset.id).await.unwrap();
        assert_eq!(second.url, "https://docs.example.com/docs/d1b");
        let third = frontier.get_next(&docset.id).await.unwrap();
        assert_eq!(third.depth, 2);
        assert!(frontier.get_next(&docset.id).await.is_none());
    }

    #[tokio::test]
    async fn max_pages_cap_stops_enqueueing() {
        let (store, frontier, docset) = setup(2).await;

        let links: Vec<String> = (0..5)
            .map(|i| format!("https://docs.example.com/docs/p{}", i))
            .collect();
        let created = frontier
            .discover_links(&docset, "https://docs.example.com/docs/start", &links, 0)
            .await
            .unwrap();

        assert_eq!(created, 2);
        assert_eq!(store.count_pages(&docset.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn hydrates_pending_pages_on_resume() {
        let (store, frontier, docset) = setup(100).await;
        store
            .create_page(&docset.id, "https://docs.example.com/docs/a")
            .await
            .unwrap();
        store
            .create_page(&docset.id, "https://docs.example.com/docs/b")
            .await
            .unwrap();

        let loaded = frontier.load_pending_pages(&docset.id).await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(frontier.len(&docset.id).await, 2);

        // Hydrating twice is a no-op.
        let loaded = frontier.load_pending_pages(&docset.id).await.unwrap();
        assert_eq!(loaded, 0);
    }
}
