//! Hybrid query path: vector + keyword retrieval, score fusion, diversity
//! and budget shaping.
//!
//! The pipeline embeds the query once, fans out exact cosine search across
//! the target namespaces, optionally fuses with FTS keyword hits
//! (`hybrid = α·vector + (1−α)·keyword`, both clamped to `[0, 1]`), then
//! shapes the ranked list twice: a diversity filter bounds chunks per
//! `(docset, page)`, and a budget filter bounds total returned characters,
//! truncating the final snippet to spend whatever budget remains.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::orchestrator::Orchestrator;
use crate::snippet::{self, Snippet};
use crate::store::KeywordHit;

/// Caller-supplied search knobs. Every value is clamped server-side as
/// defence in depth; `None` falls back to the configured default.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub query: String,
    /// Restrict to these docsets; all docsets when absent.
    pub docset_ids: Option<Vec<String>>,
    pub top_k: Option<usize>,
    pub min_score: Option<f32>,
    pub max_chunks_per_page: Option<usize>,
    pub max_total_chars: Option<usize>,
    pub format_snippets: Option<bool>,
}

/// One returned result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub chunk_id: String,
    pub docset_id: String,
    pub page_id: String,
    pub url: String,
    pub title: Option<String>,
    pub heading: Option<String>,
    pub content: String,
    /// Fused (or pure vector) relevance score.
    pub score: f64,
    pub vector_score: f64,
    pub keyword_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<Snippet>,
}

/// Full search response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub query: String,
    /// Characters actually spent against the budget.
    pub total_chars: usize,
    /// True when the budget filter dropped or truncated candidates.
    pub truncated: bool,
}

/// A fused candidate, before shaping.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub chunk_id: String,
    pub docset_id: String,
    pub page_id: String,
    pub url: String,
    pub title: Option<String>,
    pub heading: Option<String>,
    pub content: String,
    pub vector_score: f64,
    pub keyword_score: f64,
    pub score: f64,
}

impl Orchestrator {
    /// Answer a query with hybrid retrieval. See the module docs for the
    /// full pipeline.
    pub async fn search(&self, options: SearchOptions) -> Result<SearchResponse> {
        let query = options.query.trim().to_string();
        if query.is_empty() {
            return Ok(SearchResponse {
                results: Vec::new(),
                query,
                total_chars: 0,
                truncated: false,
            });
        }

        let top_k = options.top_k.unwrap_or(10).clamp(1, 100);
        let min_score = options.min_score.unwrap_or(0.0).clamp(0.0, 1.0);
        let vector_top_k = self.config.hybrid.vector_top_k.clamp(1, 1000);
        let keyword_top_k = self.config.hybrid.keyword_top_k.clamp(1, 1000);
        let alpha = self.config.hybrid.alpha.clamp(0.0, 1.0);
        let min_keyword_score = self.config.hybrid.min_keyword_score.clamp(0.0, 1.0);
        let max_chunks_per_page = options
            .max_chunks_per_page
            .unwrap_or(self.config.retrieval.max_chunks_per_page)
            .clamp(1, 20);
        let max_total_chars = options
            .max_total_chars
            .unwrap_or(self.config.retrieval.max_total_chars)
            .clamp(1000, 500_000);
        let format_snippets = options
            .format_snippets
            .unwrap_or(self.config.retrieval.format_snippets);
        let snippet_max_chars = self.config.retrieval.snippet_max_chars.clamp(100, 10_000);

        // Embed the query once; the vector and keyword phases then run in
        // parallel.
        let query_vector = self.embedder.embed_single(&query).await?;

        let docset_ids: Vec<String> = match &options.docset_ids {
            Some(ids) => ids.clone(),
            None => self
                .store
                .list_docsets()
                .await?
                .into_iter()
                .map(|d| d.id)
                .collect(),
        };

        let (vector_candidates, keyword_hits) = tokio::join!(
            self.vector_phase(&docset_ids, &query_vector, vector_top_k, min_score),
            async {
                if self.config.hybrid.enabled {
                    self.store
                        .search_keyword(&query, Some(&docset_ids), keyword_top_k)
                        .await
                } else {
                    Ok(Vec::new())
                }
            }
        );
        let keyword_hits = keyword_hits?;

        let fused = if self.config.hybrid.enabled {
            fuse(
                vector_candidates,
                keyword_hits,
                alpha,
                min_keyword_score,
                vector_top_k + keyword_top_k,
            )
        } else {
            vector_candidates
        };

        let diverse = apply_diversity(fused, max_chunks_per_page, top_k);
        let (results, total_chars, truncated) = apply_budget(
            diverse,
            max_total_chars,
            format_snippets,
            snippet_max_chars,
        );

        Ok(SearchResponse {
            results,
            query,
            total_chars,
            truncated,
        })
    }

    /// Exact cosine search fanned across the target namespaces, merged and
    /// cut to `vector_top_k`. A failing namespace is logged and skipped so
    /// one docset cannot poison the rest.
    async fn vector_phase(
        &self,
        docset_ids: &[String],
        query_vector: &[f32],
        vector_top_k: usize,
        min_score: f32,
    ) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = Vec::new();
        for docset_id in docset_ids {
            let namespace = self.namespace_for(docset_id);
            match self
                .vectors
                .search(&namespace, query_vector, vector_top_k, min_score)
                .await
            {
                Ok(hits) => {
                    for hit in hits {
                        candidates.push(Candidate {
                            chunk_id: hit.id,
                            docset_id: hit.metadata.docset_id,
                            page_id: hit.metadata.page_id,
                            url: hit.metadata.url,
                            title: hit.metadata.title,
                            heading: hit.metadata.heading,
                            content: hit.metadata.content,
                            vector_score: hit.score as f64,
                            keyword_score: 0.0,
                            score: hit.score as f64,
                        });
                    }
                }
                Err(e) => {
                    eprintln!("Warning: vector search failed for {}: {}", docset_id, e);
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.vector_score
                .partial_cmp(&a.vector_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(vector_top_k);
        candidates
    }
}

/// Merge vector and keyword signals per chunk id into
/// `α·vector + (1−α)·keyword`, both clamped to `[0, 1]`.
pub(crate) fn fuse(
    vector: Vec<Candidate>,
    keyword: Vec<KeywordHit>,
    alpha: f64,
    min_keyword_score: f64,
    limit: usize,
) -> Vec<Candidate> {
    let mut by_chunk: HashMap<String, Candidate> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for candidate in vector {
        if !by_chunk.contains_key(&candidate.chunk_id) {
            order.push(candidate.chunk_id.clone());
        }
        by_chunk.insert(candidate.chunk_id.clone(), candidate);
    }

    for hit in keyword {
        if hit.keyword_score < min_keyword_score {
            continue;
        }
        match by_chunk.get_mut(&hit.chunk_id) {
            Some(existing) => {
                existing.keyword_score = existing.keyword_score.max(hit.keyword_score);
            }
            None => {
                order.push(hit.chunk_id.clone());
                by_chunk.insert(
                    hit.chunk_id.clone(),
                    Candidate {
                        chunk_id: hit.chunk_id,
                        docset_id: hit.docset_id,
                        page_id: hit.page_id,
                        url: hit.url,
                        title: hit.title,
                        heading: hit.heading,
                        content: hit.content,
                        vector_score: 0.0,
                        keyword_score: hit.keyword_score,
                        score: 0.0,
                    },
                );
            }
        }
    }

    let mut fused: Vec<Candidate> = order
        .into_iter()
        .filter_map(|chunk_id| by_chunk.remove(&chunk_id))
        .map(|mut candidate| {
            let v = candidate.vector_score.clamp(0.0, 1.0);
            let k = candidate.keyword_score.clamp(0.0, 1.0);
            candidate.score = alpha * v + (1.0 - alpha) * k;
            candidate
        })
        .collect();

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(limit);
    fused
}

/// Admit candidates in score order, at most `max_per_page` per
/// `(docset, page)`, stopping once `top_k` are admitted.
pub(crate) fn apply_diversity(
    candidates: Vec<Candidate>,
    max_per_page: usize,
    top_k: usize,
) -> Vec<Candidate> {
    let mut per_page: HashMap<(String, String), usize> = HashMap::new();
    let mut admitted = Vec::new();
    for candidate in candidates {
        if admitted.len() >= top_k {
            break;
        }
        let key = (candidate.docset_id.clone(), candidate.page_id.clone());
        let count = per_page.entry(key).or_insert(0);
        if *count >= max_per_page {
            continue;
        }
        *count += 1;
        admitted.push(candidate);
    }
    admitted
}

/// Admit results while the running character total stays within
/// `max_total_chars`. The first result is always admitted; when the next
/// result would overflow but at least 200 characters of budget remain and
/// snippets are on, a truncated snippet spends the tail of the budget.
pub(crate) fn apply_budget(
    candidates: Vec<Candidate>,
    max_total_chars: usize,
    format_snippets: bool,
    snippet_max_chars: usize,
) -> (Vec<SearchHit>, usize, bool) {
    let mut results: Vec<SearchHit> = Vec::new();
    let mut total = 0usize;
    let mut truncated = false;
    let candidate_count = candidates.len();

    for candidate in candidates {
        let snippet = if format_snippets {
            Some(snippet::format_snippet(
                candidate.title.as_deref(),
                &candidate.url,
                candidate.heading.as_deref(),
                &candidate.content,
                snippet_max_chars,
            ))
        } else {
            None
        };
        let cost = snippet
            .as_ref()
            .map(|s| s.char_count)
            .unwrap_or(candidate.content.len());

        if results.is_empty() || total + cost <= max_total_chars {
            total += cost;
            results.push(to_hit(candidate, snippet));
            continue;
        }

        let remaining = max_total_chars - total;
        if remaining >= 200 && format_snippets {
            let overhead = snippet::header_overhead(
                candidate.title.as_deref(),
                &candidate.url,
                candidate.heading.as_deref(),
            );
            // Leave room for the header and the 3-byte ellipsis.
            let content_budget = remaining.saturating_sub(overhead + '…'.len_utf8());
            let tail = snippet::format_snippet(
                candidate.title.as_deref(),
                &candidate.url,
                candidate.heading.as_deref(),
                &candidate.content,
                content_budget,
            );
            total += tail.char_count;
            results.push(to_hit(candidate, Some(tail)));
        }
        truncated = true;
        break;
    }

    debug_assert!(truncated || results.len() == candidate_count);
    (results, total, truncated)
}

fn to_hit(candidate: Candidate, snippet: Option<Snippet>) -> SearchHit {
    SearchHit {
        chunk_id: candidate.chunk_id,
        docset_id: candidate.docset_id,
        page_id: candidate.page_id,
        url: candidate.url,
        title: candidate.title,
        heading: candidate.heading,
        content: candidate.content,
        score: candidate.score,
        vector_score: candidate.vector_score,
        keyword_score: candidate.keyword_score,
        snippet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(chunk: &str, page: &str, vector_score: f64, content: &str) -> Candidate {
        Candidate {
            chunk_id: chunk.to_string(),
            docset_id: "d1".to_string(),
            page_id: page.to_string(),
            url: format!("https://docs.example.com/guide/{}", page),
            title: Some("Guide".to_string()),
            heading: None,
            content: content.to_string(),
            vector_score,
            keyword_score: 0.0,
            score: vector_score,
        }
    }

    fn keyword_hit(chunk: &str, page: &str, score: f64) -> KeywordHit {
        KeywordHit {
            chunk_id: chunk.to_string(),
            docset_id: "d1".to_string(),
            page_id: page.to_string(),
            url: format!("https://docs.example.com/guide/{}", page),
            title: Some("Guide".to_string()),
            heading: None,
            content: "keyword text".to_string(),
            keyword_score: score,
        }
    }

    #[test]
    fn fusion_combines_signals() {
        let fused = fuse(
            vec![candidate("c1", "p1", 0.8, "x")],
            vec![keyword_hit("c1", "p1", 0.5)],
            0.7,
            0.0,
            10,
        );
        assert_eq!(fused.len(), 1);
        let expected = 0.7 * 0.8 + 0.3 * 0.5;
        assert!((fused[0].score - expected).abs() < 1e-9);
    }

    #[test]
    fn fusion_adds_keyword_only_results() {
        let fused = fuse(
            vec![candidate("c1", "p1", 0.9, "x")],
            vec![keyword_hit("c2", "p2", 0.8)],
            0.7,
            0.0,
            10,
        );
        assert_eq!(fused.len(), 2);
        let c2 = fused.iter().find(|c| c.chunk_id == "c2").unwrap();
        assert_eq!(c2.vector_score, 0.0);
        assert!((c2.score - 0.3 * 0.8).abs() < 1e-9);
    }

    #[test]
    fn fusion_drops_weak_keyword_hits() {
        let fused = fuse(
            Vec::new(),
            vec![keyword_hit("c1", "p1", 0.05)],
            0.7,
            0.1,
            10,
        );
        assert!(fused.is_empty());
    }

    #[test]
    fn fusion_keeps_max_keyword_score() {
        let fused = fuse(
            Vec::new(),
            vec![keyword_hit("c1", "p1", 0.3), keyword_hit("c1", "p1", 0.6)],
            0.5,
            0.0,
            10,
        );
        assert_eq!(fused.len(), 1);
        assert!((fused[0].keyword_score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn fusion_clamps_out_of_range_scores() {
        let mut hot = candidate("c1", "p1", 1.7, "x");
        hot.score = 0.0;
        let fused = fuse(vec![hot], Vec::new(), 1.0, 0.0, 10);
        assert!(fused[0].score <= 1.0);
    }

    #[test]
    fn diversity_bounds_chunks_per_page() {
        let candidates = vec![
            candidate("c1", "p1", 0.9, "x"),
            candidate("c2", "p1", 0.8, "x"),
            candidate("c3", "p1", 0.7, "x"),
            candidate("c4", "p2", 0.6, "x"),
        ];
        let admitted = apply_diversity(candidates, 2, 10);
        assert_eq!(admitted.len(), 3);
        let from_p1 = admitted.iter().filter(|c| c.page_id == "p1").count();
        assert_eq!(from_p1, 2);
        assert!(admitted.iter().any(|c| c.page_id == "p2"));
    }

    #[test]
    fn diversity_stops_at_top_k() {
        let candidates: Vec<Candidate> = (0..10)
            .map(|i| candidate(&format!("c{}", i), &format!("p{}", i), 0.9, "x"))
            .collect();
        let admitted = apply_diversity(candidates, 5, 3);
        assert_eq!(admitted.len(), 3);
    }

    #[test]
    fn budget_admits_first_result_even_when_oversize() {
        let big = candidate("c1", "p1", 0.9, &"z".repeat(5000));
        let (results, total, _) = apply_budget(vec![big], 1000, false, 1500);
        assert_eq!(results.len(), 1);
        assert_eq!(total, 5000);
    }

    #[test]
    fn budget_caps_total_chars() {
        let candidates: Vec<Candidate> = (0..5)
            .map(|i| candidate(&format!("c{}", i), "p1", 0.9, &"z".repeat(500)))
            .collect();
        let (results, total, truncated) = apply_budget(candidates, 1000, false, 1500);
        assert_eq!(results.len(), 2);
        assert!(total <= 1000);
        assert!(truncated);
    }

    #[test]
    fn budget_spends_tail_on_truncated_snippet() {
        let candidates: Vec<Candidate> = (0..3)
            .map(|i| candidate(&format!("c{}", i), "p1", 0.9, &"word ".repeat(180)))
            .collect();
        let (results, total, truncated) = apply_budget(candidates, 1800, true, 10_000);
        assert!(truncated);
        // The second result is a snippet truncated to fit the remaining
        // budget rather than being dropped outright.
        assert_eq!(results.len(), 2);
        assert!(total <= 1800);
        let tail = results.last().unwrap().snippet.as_ref().unwrap();
        assert!(tail.formatted.ends_with('…'));
    }

    #[test]
    fn budget_sums_snippet_char_counts() {
        let candidates: Vec<Candidate> = (0..2)
            .map(|i| candidate(&format!("c{}", i), &format!("p{}", i), 0.9, "short body"))
            .collect();
        let (results, total, truncated) = apply_budget(candidates, 100_000, true, 1500);
        assert!(!truncated);
        let sum: usize = results
            .iter()
            .map(|r| r.snippet.as_ref().unwrap().char_count)
            .sum();
        assert_eq!(total, sum);
    }
}
