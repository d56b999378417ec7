//! HTTP page fetcher with conditional requests and cache fallback.
//!
//! One GET per call. ETag / Last-Modified validators come from the caller
//! (the page record) or, failing that, from the content cache. A 304 with a
//! cached body and a transport error with a cached body both degrade to the
//! cache; everything else surfaces as a typed [`FetchError`] the
//! orchestrator can classify without string matching.

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CachedPage, ContentCache};
use crate::models::now_ts;

/// Sniffed content classification the extractor dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Markdown,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Html => "html",
            ContentKind::Markdown => "markdown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "markdown" => ContentKind::Markdown,
            _ => ContentKind::Html,
        }
    }
}

/// Result of a single fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Decoded body text (possibly the cached copy).
    pub content: String,
    /// Sniffed content kind.
    pub content_kind: ContentKind,
    /// ETag of the returned body.
    pub etag: Option<String>,
    /// Last-Modified of the returned body.
    pub last_modified: Option<String>,
    /// HTTP status; 304 for not-modified, 0 for a transport-error cache hit.
    pub status: u16,
    /// True when `content` came from the cache rather than the wire.
    pub from_cache: bool,
}

/// Typed fetch failure. `Http { 401 | 403 | 404 }` is expected during
/// open-web crawling and marks a page skipped rather than errored.
#[derive(Debug)]
pub enum FetchError {
    /// The server answered with a non-success status.
    Http { status: u16 },
    /// The request never completed (timeout, connection failure) and no
    /// cached body was available to fall back to.
    Transport { message: String },
}

impl FetchError {
    /// Statuses that mark a page skipped instead of errored.
    pub fn is_skippable(&self) -> bool {
        matches!(self, FetchError::Http { status: 401 | 403 | 404 })
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Http { status } => write!(f, "HTTP {}", status),
            FetchError::Transport { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for FetchError {}

/// Fetch abstraction so tests can stub page serving.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetch `url`, sending `If-None-Match` / `If-Modified-Since` built
    /// from the overrides or the cache.
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome, FetchError>;
}

/// Production fetcher over reqwest with write-through caching.
pub struct HttpFetcher {
    client: reqwest::Client,
    cache: Arc<ContentCache>,
}

impl HttpFetcher {
    pub fn new(
        cache: Arc<ContentCache>,
        timeout_ms: u64,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client, cache })
    }

    fn cached_outcome(&self, cached: CachedPage, status: u16) -> FetchOutcome {
        FetchOutcome {
            content_kind: ContentKind::parse(&cached.content_type),
            etag: cached.etag,
            last_modified: cached.last_modified,
            content: cached.content,
            status,
            from_cache: true,
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let cached = self.cache.get(url).ok().flatten();

        let etag = etag
            .map(|s| s.to_string())
            .or_else(|| cached.as_ref().and_then(|c| c.etag.clone()));
        let last_modified = last_modified
            .map(|s| s.to_string())
            .or_else(|| cached.as_ref().and_then(|c| c.last_modified.clone()));

        let mut request = self.client.get(url);
        if let Some(tag) = &etag {
            request = request.header(IF_NONE_MATCH, tag);
        }
        if let Some(lm) = &last_modified {
            request = request.header(IF_MODIFIED_SINCE, lm);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // Graceful degradation: serve stale content over nothing.
                if let Some(cached) = cached {
                    return Ok(self.cached_outcome(cached, 0));
                }
                return Err(FetchError::Transport {
                    message: e.to_string(),
                });
            }
        };

        let status = response.status().as_u16();

        if status == 304 {
            if let Some(cached) = cached {
                return Ok(self.cached_outcome(cached, 304));
            }
            // A validator we no longer hold a body for; let the caller
            // retry without the short-circuit.
            return Err(FetchError::Http { status });
        }

        if !response.status().is_success() {
            return Err(FetchError::Http { status });
        }

        let resp_etag = header_value(&response, ETAG);
        let resp_last_modified = header_value(&response, LAST_MODIFIED);
        let content_type = header_value(&response, reqwest::header::CONTENT_TYPE);

        let content = response.text().await.map_err(|e| FetchError::Transport {
            message: e.to_string(),
        })?;

        let content_kind = sniff_content_kind(url, content_type.as_deref(), &content);

        let entry = CachedPage {
            url: url.to_string(),
            content: content.clone(),
            content_type: content_kind.as_str().to_string(),
            fetched_at: now_ts(),
            etag: resp_etag.clone(),
            last_modified: resp_last_modified.clone(),
        };
        if let Err(e) = self.cache.put(&entry) {
            eprintln!("Warning: failed to cache {}: {}", url, e);
        }

        Ok(FetchOutcome {
            content,
            content_kind,
            etag: resp_etag,
            last_modified: resp_last_modified,
            status,
            from_cache: false,
        })
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Content-sniffing classification. Markdown wins over whatever the server
/// claims: docs sites routinely serve `.md` as `text/plain`.
pub fn sniff_content_kind(url: &str, content_type: Option<&str>, body: &str) -> ContentKind {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    if path.ends_with(".md") || path.ends_with(".mdx") {
        return ContentKind::Markdown;
    }

    let trimmed = body.trim_start();
    if trimmed.starts_with("# ") || trimmed.starts_with("## ") {
        return ContentKind::Markdown;
    }
    if trimmed.starts_with("---") {
        // YAML frontmatter: a closing delimiter on its own line.
        if let Some(rest) = trimmed.strip_prefix("---") {
            if rest.lines().any(|line| line.trim() == "---") {
                return ContentKind::Markdown;
            }
        }
    }

    if let Some(ct) = content_type {
        if ct.contains("markdown") {
            return ContentKind::Markdown;
        }
    }
    ContentKind::Html
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_markdown_by_extension() {
        assert_eq!(
            sniff_content_kind("https://x.dev/guide.md", Some("text/html"), "<p>x</p>"),
            ContentKind::Markdown
        );
        assert_eq!(
            sniff_content_kind("https://x.dev/guide.mdx", None, ""),
            ContentKind::Markdown
        );
    }

    #[test]
    fn sniffs_markdown_by_leading_heading() {
        assert_eq!(
            sniff_content_kind("https://x.dev/guide", None, "# Title\n\nbody"),
            ContentKind::Markdown
        );
        assert_eq!(
            sniff_content_kind("https://x.dev/guide", None, "## Sub\n\nbody"),
            ContentKind::Markdown
        );
    }

    #[test]
    fn sniffs_markdown_by_frontmatter() {
        let body = "---\ntitle: X\n---\n\nSome text";
        assert_eq!(
            sniff_content_kind("https://x.dev/guide", None, body),
            ContentKind::Markdown
        );
    }

    #[test]
    fn defaults_to_html() {
        assert_eq!(
            sniff_content_kind("https://x.dev/guide", Some("text/html"), "<html></html>"),
            ContentKind::Html
        );
        // A bare --- with no closing delimiter is not frontmatter.
        assert_eq!(
            sniff_content_kind("https://x.dev/guide", None, "--- draft"),
            ContentKind::Html
        );
    }

    #[test]
    fn skippable_statuses() {
        assert!(FetchError::Http { status: 404 }.is_skippable());
        assert!(FetchError::Http { status: 401 }.is_skippable());
        assert!(FetchError::Http { status: 403 }.is_skippable());
        assert!(!FetchError::Http { status: 500 }.is_skippable());
        assert!(!FetchError::Transport {
            message: "timeout".to_string()
        }
        .is_skippable());
    }

    #[test]
    fn http_error_message_carries_status() {
        assert_eq!(FetchError::Http { status: 404 }.to_string(), "HTTP 404");
    }
}
