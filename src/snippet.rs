//! Snippet formatting for retrieval results.
//!
//! Each returned result can carry a formatted snippet: a small header
//! (title, source URL, section breadcrumb) followed by the chunk content,
//! truncated at natural boundaries when a character budget applies.

use serde::Serialize;

/// A formatted, budget-aware rendering of one search result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    /// Header + content, ready to paste into a model prompt.
    pub formatted: String,
    /// Title line used in the header.
    pub title: String,
    /// Source URL.
    pub url: String,
    /// Human-readable section path, if one could be derived.
    pub breadcrumb: Option<String>,
    /// The (possibly truncated) chunk content.
    pub content: String,
    /// Length of `formatted` in characters; budget accounting uses this.
    pub char_count: usize,
}

/// Render a snippet whose content is truncated to `content_budget` bytes.
pub fn format_snippet(
    title: Option<&str>,
    url: &str,
    heading: Option<&str>,
    content: &str,
    content_budget: usize,
) -> Snippet {
    let title = title.filter(|t| !t.is_empty()).unwrap_or("Untitled");
    let breadcrumb = breadcrumb(heading, url);

    let mut header = format!("## {}\nSource: {}\n", title, url);
    if let Some(crumb) = &breadcrumb {
        header.push_str(&format!("[Section: {}]\n", crumb));
    }
    header.push('\n');

    let (body, truncated) = truncate_to_budget(content, content_budget);
    let mut formatted = header;
    formatted.push_str(&body);
    if truncated {
        formatted.push('…');
    }

    let char_count = formatted.len();
    Snippet {
        formatted,
        title: title.to_string(),
        url: url.to_string(),
        breadcrumb,
        content: body,
        char_count,
    }
}

/// Header overhead of a snippet for `(title, url, heading)`, used to size
/// the content budget before formatting.
pub fn header_overhead(title: Option<&str>, url: &str, heading: Option<&str>) -> usize {
    let title = title.filter(|t| !t.is_empty()).unwrap_or("Untitled");
    let mut len = "## ".len() + title.len() + 1 + "Source: ".len() + url.len() + 1;
    if let Some(crumb) = breadcrumb(heading, url) {
        len += "[Section: ".len() + crumb.len() + "]".len() + 1;
    }
    len + 1
}

/// Synthesise a section breadcrumb from the heading and URL path.
///
/// Takes up to the last two path segments (skipping the generic `docs` and
/// `api` segments), title-cases them, and joins with ` > `. When the last
/// segment already appears in the heading, the heading alone reads better
/// and wins.
pub fn breadcrumb(heading: Option<&str>, url: &str) -> Option<String> {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());

    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != "docs" && *s != "api")
        .collect();
    let last_two: Vec<&str> = segments.iter().rev().take(2).rev().copied().collect();

    if let Some(heading) = heading.filter(|h| !h.is_empty()) {
        if let Some(last) = last_two.last() {
            let last_words = title_case(last);
            if heading.to_lowercase().contains(&last_words.to_lowercase())
                || heading.to_lowercase().contains(&last.to_lowercase())
            {
                return Some(heading.to_string());
            }
        } else {
            return Some(heading.to_string());
        }
    }

    if last_two.is_empty() {
        return None;
    }
    Some(
        last_two
            .iter()
            .map(|s| title_case(s))
            .collect::<Vec<_>>()
            .join(" > "),
    )
}

/// `getting-started` → `Getting Started`.
fn title_case(segment: &str) -> String {
    segment
        .split(|c| c == '-' || c == '_')
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncate `content` to at most `budget` bytes, preferring a paragraph
/// boundary in the last half of the budget, then a sentence boundary in
/// the last half, then a word boundary in the last 30%, then a hard cut.
/// Returns the body and whether it was truncated.
pub fn truncate_to_budget(content: &str, budget: usize) -> (String, bool) {
    if content.len() <= budget {
        return (content.to_string(), false);
    }
    if budget == 0 {
        return (String::new(), true);
    }

    let cut = floor_char_boundary(content, budget);
    let window = &content[..cut];
    let half = cut / 2;

    if let Some(pos) = window.rfind("\n\n") {
        if pos >= half && pos > 0 {
            return (window[..pos].to_string(), true);
        }
    }

    let sentence_cut = [". ", "! ", "? "]
        .iter()
        .filter_map(|boundary| window.rfind(boundary).map(|pos| pos + 1))
        .max();
    if let Some(pos) = sentence_cut {
        if pos >= half {
            return (window[..pos].trim_end().to_string(), true);
        }
    }

    let word_floor = cut.saturating_mul(7) / 10;
    if let Some(pos) = window.rfind(' ') {
        if pos >= word_floor && pos > 0 {
            return (window[..pos].to_string(), true);
        }
    }

    (window.to_string(), true)
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
