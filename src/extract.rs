//! Page extraction: fetched HTML/Markdown → title, plain text, headings,
//! outgoing links.
//!
//! The HTML path parses to a DOM and walks block-level elements under a
//! main-content root (`article`, `main`, `[role=main]`, falling back to
//! `body`), emitting paragraph boundaries as blank lines and tracking a
//! cumulative character offset for each heading. The Markdown path strips
//! HTML comments and YAML frontmatter, then detects `#` headings and
//! `[text](href)` links. Both paths filter links to the page's host and
//! strip fragments, deduping while preserving order.

use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

use crate::fetcher::ContentKind;
use crate::models::{ExtractedPage, Heading};

/// Extract a fetched page. `url` must be the canonical page URL; links are
/// resolved against it and confined to its host.
pub fn extract_page(url: &str, content: &str, kind: ContentKind) -> ExtractedPage {
    match kind {
        ContentKind::Html => extract_html(url, content),
        ContentKind::Markdown => extract_markdown(url, content),
    }
}

// ============ HTML ============

struct HtmlSelectors {
    title: Selector,
    h1: Selector,
    anchors: Selector,
    article: Selector,
    main: Selector,
    role_main: Selector,
    body: Selector,
}

impl HtmlSelectors {
    fn new() -> Self {
        Self {
            title: Selector::parse("title").expect("title selector"),
            h1: Selector::parse("h1").expect("h1 selector"),
            anchors: Selector::parse("a[href]").expect("anchor selector"),
            article: Selector::parse("article").expect("article selector"),
            main: Selector::parse("main").expect("main selector"),
            role_main: Selector::parse("[role=\"main\"]").expect("role selector"),
            body: Selector::parse("body").expect("body selector"),
        }
    }

    fn pick_root<'a>(&self, document: &'a Html) -> ElementRef<'a> {
        document
            .select(&self.article)
            .next()
            .or_else(|| document.select(&self.main).next())
            .or_else(|| document.select(&self.role_main).next())
            .or_else(|| document.select(&self.body).next())
            .unwrap_or_else(|| document.root_element())
    }
}

fn extract_html(url: &str, content: &str) -> ExtractedPage {
    let selectors = HtmlSelectors::new();
    let document = Html::parse_document(content);

    let title = document
        .select(&selectors.title)
        .next()
        .map(|el| collapse_whitespace(&element_text(&el)))
        .filter(|t| !t.is_empty())
        .or_else(|| {
            document
                .select(&selectors.h1)
                .next()
                .map(|el| collapse_whitespace(&element_text(&el)))
                .filter(|t| !t.is_empty())
        });

    let links = collect_links(
        url,
        document
            .select(&selectors.anchors)
            .filter_map(|el| el.attr("href")),
    );

    let root = selectors.pick_root(&document);
    let mut collector = BlockCollector::default();
    collector.walk(root);

    // Readability came up empty (no block-level elements): fall back to the
    // whole body's text content.
    if collector.content.is_empty() {
        if let Some(body) = document.select(&selectors.body).next() {
            collector.content = collapse_whitespace(&element_text(&body));
        }
    }

    ExtractedPage {
        url: url.to_string(),
        title,
        content: collector.content,
        links,
        headings: collector.headings,
    }
}

#[derive(Default)]
struct BlockCollector {
    content: String,
    headings: Vec<Heading>,
}

impl BlockCollector {
    fn walk(&mut self, root: ElementRef<'_>) {
        for element in root.descendants().filter_map(ElementRef::wrap) {
            self.maybe_record(element);
        }
    }

    fn maybe_record(&mut self, element: ElementRef<'_>) {
        let tag = element.value().name();
        if matches!(
            tag,
            "script" | "style" | "template" | "noscript" | "svg" | "nav"
        ) {
            return;
        }

        let heading_level = match tag {
            "h1" => Some(1u8),
            "h2" => Some(2),
            "h3" => Some(3),
            "h4" => Some(4),
            "h5" => Some(5),
            "h6" => Some(6),
            _ => None,
        };

        let is_block = heading_level.is_some()
            || matches!(tag, "p" | "li" | "blockquote" | "pre" | "td");
        if !is_block {
            return;
        }

        // A block nested inside another recorded block (p inside li, code
        // inside pre) would duplicate its text; the ancestor carries it.
        if heading_level.is_none() && has_block_ancestor(&element) {
            return;
        }

        let text = if tag == "pre" {
            collapse_newlines(&element_text(&element))
        } else {
            collapse_whitespace(&element_text(&element))
        };
        if text.is_empty() {
            return;
        }

        if !self.content.is_empty() {
            self.content.push_str("\n\n");
        }
        if let Some(level) = heading_level {
            self.headings.push(Heading {
                level,
                text: text.clone(),
                offset: self.content.len(),
            });
        }
        self.content.push_str(&text);
    }
}

fn has_block_ancestor(element: &ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| matches!(a.value().name(), "p" | "li" | "blockquote" | "pre"))
}

fn element_text(element: &ElementRef<'_>) -> String {
    let mut raw = String::new();
    for piece in element.text() {
        raw.push_str(piece);
    }
    raw
}

// ============ Markdown ============

fn extract_markdown(url: &str, content: &str) -> ExtractedPage {
    let stripped = strip_html_comments(content);
    let stripped = strip_frontmatter(&stripped);
    let normalized = normalize_markdown(&stripped);

    let mut headings = Vec::new();
    let mut offset = 0usize;
    for line in normalized.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n');
        if let Some((level, text)) = parse_heading_line(trimmed) {
            headings.push(Heading {
                level,
                text,
                offset,
            });
        }
        offset += line.len();
    }

    let title = headings.first().map(|h| h.text.clone());
    let links = collect_links(url, markdown_hrefs(&normalized).iter().map(|s| s.as_str()));

    ExtractedPage {
        url: url.to_string(),
        title,
        content: normalized,
        links,
        headings,
    }
}

fn parse_heading_line(line: &str) -> Option<(u8, String)> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if !(1..=6).contains(&hashes) {
        return None;
    }
    let rest = &line[hashes..];
    let text = rest.strip_prefix(' ')?.trim();
    if text.is_empty() {
        return None;
    }
    Some((hashes as u8, text.to_string()))
}

fn strip_html_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn strip_frontmatter(content: &str) -> String {
    let trimmed = content.trim_start_matches('\u{feff}');
    if !trimmed.starts_with("---") {
        return trimmed.to_string();
    }
    let mut lines = trimmed.lines();
    let first = lines.next().unwrap_or_default();
    if first.trim() != "---" {
        return trimmed.to_string();
    }
    let mut consumed = first.len() + 1;
    for line in lines {
        let line_len = line.len() + 1;
        if line.trim() == "---" {
            let end = (consumed + line_len).min(trimmed.len());
            return trimmed[end..].to_string();
        }
        consumed += line_len;
    }
    trimmed.to_string()
}

/// Trim trailing line whitespace, replace tabs, collapse 3+ newlines.
fn normalize_markdown(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut blank_run = 0usize;
    for line in content.lines() {
        let line = line.replace('\t', "    ");
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run >= 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Pull `href` values out of `[text](href)` spans, skipping images.
fn markdown_hrefs(content: &str) -> Vec<String> {
    let bytes = content.as_bytes();
    let mut hrefs = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            if i > 0 && bytes[i - 1] == b'!' {
                i += 1;
                continue;
            }
            if let Some(close) = find_from(bytes, i + 1, b']') {
                if close + 1 < bytes.len() && bytes[close + 1] == b'(' {
                    if let Some(end) = find_from(bytes, close + 2, b')') {
                        let href = content[close + 2..end].trim();
                        // Drop optional titles: [x](url "title")
                        let href = href.split_whitespace().next().unwrap_or("");
                        if !href.is_empty() {
                            hrefs.push(href.to_string());
                        }
                        i = end + 1;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }
    hrefs
}

fn find_from(bytes: &[u8], start: usize, needle: u8) -> Option<usize> {
    bytes[start..].iter().position(|&b| b == needle).map(|p| p + start)
}

// ============ Shared helpers ============

/// Resolve candidate hrefs against the page URL, keep same-host http(s)
/// links, strip fragments, dedupe preserving order.
fn collect_links<'a>(page_url: &str, candidates: impl Iterator<Item = &'a str>) -> Vec<String> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    let base_host = base.host_str().map(|h| h.to_string());

    let mut seen: HashSet<String> = HashSet::new();
    let mut links = Vec::new();
    for href in candidates {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("mailto:") {
            continue;
        }
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        if resolved.host_str().map(|h| h.to_string()) != base_host {
            continue;
        }
        resolved.set_fragment(None);
        let link = resolved.to_string();
        if seen.insert(link.clone()) {
            links.push(link);
        }
    }
    links
}

fn collapse_whitespace(input: &str) -> String {
    let mut buf = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !buf.is_empty() {
                buf.push(' ');
            }
            last_space = true;
        } else {
            buf.push(ch);
            last_space = false;
        }
    }
    buf.trim_end().to_string()
}

fn collapse_newlines(input: &str) -> String {
    let mut lines = Vec::new();
    for line in input.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        lines.push(trimmed.replace('\t', "    "));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_URL: &str = "https://docs.example.com/guide/start";

    #[test]
    fn html_title_and_content() {
        let html = r#"<html><head><title>Start  Guide</title></head>
            <body><article>
              <h1>Start</h1>
              <p>First paragraph with <b>bold</b> text.</p>
              <h2>Details</h2>
              <p>More info.</p>
            </article></body></html>"#;
        let page = extract_page(PAGE_URL, html, ContentKind::Html);

        assert_eq!(page.title.as_deref(), Some("Start Guide"));
        assert!(page.content.contains("First paragraph with bold text."));
        assert!(!page.content.contains("\n\n\n"));
        assert_eq!(page.headings.len(), 2);
        assert_eq!(page.headings[0].text, "Start");
        assert_eq!(page.headings[1].level, 2);
        // Offsets track the cumulative plain text position.
        assert_eq!(&page.content[page.headings[1].offset..][..7], "Details");
    }

    #[test]
    fn html_falls_back_to_h1_title() {
        let html = "<html><body><h1>Only Heading</h1><p>x</p></body></html>";
        let page = extract_page(PAGE_URL, html, ContentKind::Html);
        assert_eq!(page.title.as_deref(), Some("Only Heading"));
    }

    #[test]
    fn html_links_same_host_only() {
        let html = r#"<body>
            <a href="/a">A</a>
            <a href="/b#section">B</a>
            <a href="https://other.example.org/c">C</a>
            <a href="/a">A again</a>
            <a href="mailto:x@example.com">mail</a>
        </body>"#;
        let page = extract_page(PAGE_URL, html, ContentKind::Html);
        assert_eq!(
            page.links,
            vec![
                "https://docs.example.com/a".to_string(),
                "https://docs.example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn html_nested_blocks_not_duplicated() {
        let html = "<body><ul><li><p>item text</p></li></ul></body>";
        let page = extract_page(PAGE_URL, html, ContentKind::Html);
        assert_eq!(page.content.matches("item text").count(), 1);
    }

    #[test]
    fn html_empty_main_falls_back_to_body_text() {
        let html = "<body>loose text with no block elements</body>";
        let page = extract_page(PAGE_URL, html, ContentKind::Html);
        assert_eq!(page.content, "loose text with no block elements");
    }

    #[test]
    fn markdown_strips_frontmatter_and_comments() {
        let md = "---\ntitle: Hidden\n---\n\n# Visible\n\n<!-- note -->\nBody text.";
        let page = extract_page(PAGE_URL, md, ContentKind::Markdown);
        assert!(!page.content.contains("Hidden"));
        assert!(!page.content.contains("note"));
        assert_eq!(page.title.as_deref(), Some("Visible"));
        assert!(page.content.contains("Body text."));
    }

    #[test]
    fn markdown_headings_with_offsets() {
        let md = "# One\n\nalpha\n\n## Two\n\nbeta";
        let page = extract_page(PAGE_URL, md, ContentKind::Markdown);
        assert_eq!(page.headings.len(), 2);
        assert_eq!(page.headings[0].level, 1);
        assert_eq!(page.headings[1].text, "Two");
        assert!(page.content[page.headings[1].offset..].starts_with("## Two"));
    }

    #[test]
    fn markdown_links_filtered_like_html() {
        let md = "[a](/a) [b](https://docs.example.com/b#x) [c](https://other.io/c) ![img](/logo.png)";
        let page = extract_page(PAGE_URL, md, ContentKind::Markdown);
        assert_eq!(
            page.links,
            vec![
                "https://docs.example.com/a".to_string(),
                "https://docs.example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn markdown_whitespace_normalized() {
        let md = "line one\t\n\n\n\nline two   ";
        let page = extract_page(PAGE_URL, md, ContentKind::Markdown);
        assert_eq!(page.content, "line one\n\nline two");
    }
}
