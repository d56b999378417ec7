//! Disk-backed content cache for fetched page bodies.
//!
//! Pure key-value store over URL → body + conditional-request headers. The
//! fetcher owns freshness via conditional requests; the cache itself has no
//! invalidation policy. Entries live at `cache/<hostname>/<16-hex>.json`
//! where the hex key is a prefix of the SHA-256 of the URL.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// One cached page body with the headers needed for conditional refetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPage {
    /// Original URL the body was fetched from.
    pub url: String,
    /// Decoded body text.
    pub content: String,
    /// Content type as sniffed at fetch time (`html` or `markdown`).
    pub content_type: String,
    /// When the body was fetched (Unix epoch seconds).
    pub fetched_at: i64,
    /// ETag response header, if the server sent one.
    pub etag: Option<String>,
    /// Last-Modified response header, if the server sent one.
    pub last_modified: Option<String>,
}

/// Disk-backed store of [`CachedPage`] entries keyed by URL.
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Look up the cached body for `url`, if any.
    pub fn get(&self, url: &str) -> Result<Option<CachedPage>> {
        let path = self.entry_path(url);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache entry: {}", path.display()))?;
        let entry: CachedPage = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt cache entry: {}", path.display()))?;
        Ok(Some(entry))
    }

    /// Write through a freshly fetched body. Writes go to a temp file first
    /// so readers never observe a partial entry.
    pub fn put(&self, entry: &CachedPage) -> Result<()> {
        let path = self.entry_path(&entry.url);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string(entry)?;
        std::fs::write(&tmp, body)
            .with_context(|| format!("Failed to write cache entry: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn has(&self, url: &str) -> bool {
        self.entry_path(url).exists()
    }

    pub fn delete(&self, url: &str) -> Result<()> {
        let path = self.entry_path(url);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Remove every cached entry.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        self.root
            .join(sanitize_host(&host))
            .join(format!("{}.json", url_key(url)))
    }
}

/// First 16 hex characters of the SHA-256 of the URL.
fn url_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Convenience for callers that only have a path-less root at hand.
pub fn default_cache_root(data_dir: &Path) -> PathBuf {
    data_dir.join("cache")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_ts;
    use tempfile::TempDir;

    fn entry(url: &str, content: &str) -> CachedPage {
        CachedPage {
            url: url.to_string(),
            content: content.to_string(),
            content_type: "html".to_string(),
            fetched_at: now_ts(),
            etag: Some("\"abc\"".to_string()),
            last_modified: None,
        }
    }

    #[test]
    fn put_then_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(tmp.path());
        let url = "https://docs.example.com/start";

        assert!(cache.get(url).unwrap().is_none());
        cache.put(&entry(url, "<html>hi</html>")).unwrap();

        let got = cache.get(url).unwrap().unwrap();
        assert_eq!(got.content, "<html>hi</html>");
        assert_eq!(got.etag.as_deref(), Some("\"abc\""));
        assert!(cache.has(url));
    }

    #[test]
    fn entries_are_namespaced_by_host() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(tmp.path());
        cache.put(&entry("https://a.example.com/x", "a")).unwrap();
        cache.put(&entry("https://b.example.com/x", "b")).unwrap();

        assert!(tmp.path().join("a.example.com").is_dir());
        assert!(tmp.path().join("b.example.com").is_dir());
    }

    #[test]
    fn key_is_16_hex_chars() {
        let key = url_key("https://docs.example.com/start");
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn delete_and_clear() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::new(tmp.path());
        let url = "https://docs.example.com/start";
        cache.put(&entry(url, "x")).unwrap();

        cache.delete(url).unwrap();
        assert!(!cache.has(url));

        cache.put(&entry(url, "x")).unwrap();
        cache.clear().unwrap();
        assert!(!cache.has(url));
    }
}
