//! Per-docset vector store with exact cosine search.
//!
//! Each namespace (one per docset) is a flat collection of
//! `{id, vector, metadata}` records persisted as a single JSON file under
//! `vectors/<sanitized-namespace>.json`. Search is exhaustive cosine
//! similarity — no ANN index — which is sufficient at the target per-docset
//! scale.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::models::VectorMeta;

/// Errors surfaced by vector store operations.
#[derive(Debug)]
pub enum VectorStoreError {
    /// Query or upsert vector length disagrees with the namespace.
    DimensionMismatch {
        namespace: String,
        expected: usize,
        got: usize,
    },
}

impl fmt::Display for VectorStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorStoreError::DimensionMismatch {
                namespace,
                expected,
                got,
            } => write!(
                f,
                "dimension mismatch in namespace '{}': expected {}, got {}",
                namespace, expected, got
            ),
        }
    }
}

impl std::error::Error for VectorStoreError {}

/// One stored vector with its denormalised metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMeta,
}

/// A search hit: stored record id + cosine score + metadata snapshot.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub metadata: VectorMeta,
}

/// On-disk shape of one namespace file.
#[derive(Debug, Serialize, Deserialize, Default)]
struct NamespaceFile {
    vectors: Vec<VectorRecord>,
    dimensions: Option<usize>,
}

#[derive(Debug, Default)]
struct Namespace {
    /// Insertion-ordered records; `by_id` indexes into this vec.
    records: Vec<VectorRecord>,
    by_id: HashMap<String, usize>,
    dimensions: Option<usize>,
}

impl Namespace {
    fn from_file(file: NamespaceFile) -> Self {
        let mut ns = Namespace {
            dimensions: file.dimensions,
            ..Default::default()
        };
        for record in file.vectors {
            ns.insert(record);
        }
        ns
    }

    fn insert(&mut self, record: VectorRecord) {
        if let Some(&idx) = self.by_id.get(&record.id) {
            self.records[idx] = record;
        } else {
            self.by_id.insert(record.id.clone(), self.records.len());
            self.records.push(record);
        }
    }

    fn remove(&mut self, id: &str) {
        if let Some(idx) = self.by_id.remove(id) {
            self.records.remove(idx);
            // Reindex everything after the removed slot.
            for (i, record) in self.records.iter().enumerate().skip(idx) {
                self.by_id.insert(record.id.clone(), i);
            }
        }
    }

    fn to_file(&self) -> NamespaceFile {
        NamespaceFile {
            vectors: self.records.clone(),
            dimensions: self.dimensions,
        }
    }
}

/// Disk-persisted collection of per-docset vector namespaces.
pub struct VectorStore {
    root: PathBuf,
    namespaces: Mutex<HashMap<String, Namespace>>,
}

impl VectorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Load the namespace file if present, else start empty with unknown
    /// dimensionality. Idempotent.
    pub async fn init(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.lock().await;
        if namespaces.contains_key(namespace) {
            return Ok(());
        }
        let path = self.namespace_path(namespace);
        let ns = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read vector file: {}", path.display()))?;
            let file: NamespaceFile = serde_json::from_str(&content)
                .with_context(|| format!("Corrupt vector file: {}", path.display()))?;
            Namespace::from_file(file)
        } else {
            Namespace::default()
        };
        namespaces.insert(namespace.to_string(), ns);
        Ok(())
    }

    /// Insert or replace a batch of vectors, then persist. The first upsert
    /// into an empty namespace locks its dimensionality.
    pub async fn upsert(&self, namespace: &str, vectors: Vec<VectorRecord>) -> Result<()> {
        if vectors.is_empty() {
            return Ok(());
        }
        let mut namespaces = self.namespaces.lock().await;
        let ns = namespaces.entry(namespace.to_string()).or_default();

        let dims = *ns.dimensions.get_or_insert(vectors[0].vector.len());
        for record in &vectors {
            if record.vector.len() != dims {
                return Err(VectorStoreError::DimensionMismatch {
                    namespace: namespace.to_string(),
                    expected: dims,
                    got: record.vector.len(),
                }
                .into());
            }
        }
        for record in vectors {
            ns.insert(record);
        }
        self.persist(namespace, ns)
    }

    /// Exact cosine search over every stored vector. Returns at most
    /// `top_k` hits with score ≥ `min_score`, best first.
    pub async fn search(
        &self,
        namespace: &str,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<VectorHit>> {
        let namespaces = self.namespaces.lock().await;
        let Some(ns) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        if ns.records.is_empty() {
            return Ok(Vec::new());
        }
        let dims = ns.dimensions.unwrap_or(0);
        if query.len() != dims {
            return Err(VectorStoreError::DimensionMismatch {
                namespace: namespace.to_string(),
                expected: dims,
                got: query.len(),
            }
            .into());
        }

        let mut hits: Vec<VectorHit> = ns
            .records
            .iter()
            .map(|record| VectorHit {
                id: record.id.clone(),
                score: cosine_similarity(query, &record.vector),
                metadata: record.metadata.clone(),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Delete the given ids from a namespace, persisting on change.
    pub async fn delete(&self, namespace: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut namespaces = self.namespaces.lock().await;
        let Some(ns) = namespaces.get_mut(namespace) else {
            return Ok(());
        };
        for id in ids {
            ns.remove(id);
        }
        self.persist(namespace, ns)
    }

    /// Drop every vector in a namespace and remove its file.
    pub async fn clear(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.lock().await;
        namespaces.remove(namespace);
        let path = self.namespace_path(namespace);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Number of vectors currently stored in a namespace.
    pub async fn count(&self, namespace: &str) -> usize {
        let namespaces = self.namespaces.lock().await;
        namespaces.get(namespace).map_or(0, |ns| ns.records.len())
    }

    fn persist(&self, namespace: &str, ns: &Namespace) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.namespace_path(namespace);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string(&ns.to_file())?;
        std::fs::write(&tmp, body)
            .with_context(|| format!("Failed to write vector file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_namespace(namespace)))
    }
}

fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Cosine similarity `dot(a,b) / (‖a‖·‖b‖)`, 0.0 when either operand has
/// zero norm or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Convenience for callers building the store from a data directory.
pub fn default_vectors_root(data_dir: &Path) -> PathBuf {
    data_dir.join("vectors")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(chunk_id: &str) -> VectorMeta {
        VectorMeta {
            docset_id: "d1".to_string(),
            page_id: "p1".to_string(),
            chunk_id: chunk_id.to_string(),
            url: "https://docs.example.com/a".to_string(),
            title: Some("A".to_string()),
            heading: None,
            content: "alpha content".to_string(),
        }
    }

    fn record(id: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            vector,
            metadata: meta(id),
        }
    }

    #[tokio::test]
    async fn upsert_and_search_returns_best_match_first() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::new(tmp.path());
        store.init("ns").await.unwrap();

        store
            .upsert(
                "ns",
                vec![
                    record("a", vec![1.0, 0.0, 0.0]),
                    record("b", vec![0.0, 1.0, 0.0]),
                    record("c", vec![0.7, 0.7, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.search("ns", &[1.0, 0.0, 0.0], 10, 0.0).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        for hit in &hits {
            assert!(hit.score >= -1.0 && hit.score <= 1.0);
        }
    }

    #[tokio::test]
    async fn duplicate_id_replaces() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::new(tmp.path());
        store.init("ns").await.unwrap();

        store
            .upsert("ns", vec![record("a", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert("ns", vec![record("a", vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(store.count("ns").await, 1);
        let hits = store.search("ns", &[0.0, 1.0], 1, 0.0).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn first_upsert_locks_dimensions() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::new(tmp.path());
        store.init("ns").await.unwrap();

        store
            .upsert("ns", vec![record("a", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();

        let err = store
            .upsert("ns", vec![record("b", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<VectorStoreError>().is_some());

        let err = store.search("ns", &[1.0, 0.0], 1, 0.0).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VectorStoreError>(),
            Some(VectorStoreError::DimensionMismatch { expected: 3, got: 2, .. })
        ));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = VectorStore::new(tmp.path());
            store.init("ns").await.unwrap();
            store
                .upsert("ns", vec![record("a", vec![1.0, 0.0])])
                .await
                .unwrap();
        }

        let store = VectorStore::new(tmp.path());
        store.init("ns").await.unwrap();
        assert_eq!(store.count("ns").await, 1);
        let hits = store.search("ns", &[1.0, 0.0], 1, 0.5).await.unwrap();
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::new(tmp.path());
        store.init("ns").await.unwrap();
        store
            .upsert(
                "ns",
                vec![record("a", vec![1.0, 0.0]), record("b", vec![0.0, 1.0])],
            )
            .await
            .unwrap();

        store.delete("ns", &["a".to_string()]).await.unwrap();
        assert_eq!(store.count("ns").await, 1);

        store.clear("ns").await.unwrap();
        assert_eq!(store.count("ns").await, 0);
        assert!(!tmp.path().join("ns.json").exists());
    }

    #[test]
    fn cosine_zero_norm_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn cosine_opposite_is_negative_one() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }
}
