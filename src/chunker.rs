//! Deterministic, size-and-heading-aware text chunker.
//!
//! Pages are partitioned into sections at heading boundaries, sections are
//! accumulated greedily from paragraphs up to `max_chunk_size`, and
//! paragraphs that are themselves oversize fall back to sentence and then
//! word splitting. A trailing `overlap` of the previous chunk is carried
//! into the next one so retrieval never loses context at a cut point.
//!
//! Offsets are approximate: a chunk's `start_offset` is its section start
//! plus the running total of previously emitted chunk text in that section.
//! They are diagnostic only.

use crate::models::Heading;

/// Tuning knobs for [`chunk_text`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkerOptions {
    /// Soft upper bound on chunk length in bytes.
    pub max_chunk_size: usize,
    /// Chunks below this length are merged or held back where possible.
    pub min_chunk_size: usize,
    /// Trailing characters of the previous chunk carried into the next.
    pub overlap: usize,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: 1500,
            min_chunk_size: 100,
            overlap: 100,
        }
    }
}

/// One emitted chunk, before it becomes a [`crate::models::ChunkRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    /// Chunk text.
    pub content: String,
    /// Heading of the section the chunk was cut from.
    pub heading: Option<String>,
    /// Approximate start offset into the page's plain text.
    pub start_offset: usize,
    /// Approximate exclusive end offset.
    pub end_offset: usize,
    /// Dense zero-based index; assigned in a final reindex pass.
    pub index: usize,
}

/// Split `content` into chunks. Headings partition the text into sections;
/// each section is chunked independently. Returns an empty vec for empty
/// input — zero chunks is a legal outcome.
pub fn chunk_text(content: &str, headings: &[Heading], opts: &ChunkerOptions) -> Vec<ChunkPiece> {
    let content = content.trim();
    if content.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();

    if content.len() <= opts.max_chunk_size {
        chunks.push(ChunkPiece {
            content: content.to_string(),
            heading: headings.first().map(|h| h.text.clone()),
            start_offset: 0,
            end_offset: content.len(),
            index: 0,
        });
        return chunks;
    }

    for section in split_sections(content, headings) {
        chunk_section(&section, opts, &mut chunks);
    }

    merge_trailing_small_chunk(&mut chunks, opts);

    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.index = i;
    }
    chunks
}

struct Section<'a> {
    heading: Option<String>,
    text: &'a str,
    start: usize,
}

/// Partition the text at the position of each heading's literal text.
fn split_sections<'a>(content: &'a str, headings: &[Heading]) -> Vec<Section<'a>> {
    let mut breaks: Vec<(usize, &Heading)> = Vec::new();
    let mut from = 0usize;
    for heading in headings {
        if heading.text.is_empty() {
            continue;
        }
        if let Some(pos) = content[from..].find(&heading.text) {
            let abs = from + pos;
            breaks.push((abs, heading));
            from = abs + heading.text.len();
        }
    }

    let mut sections = Vec::new();
    if breaks.is_empty() {
        sections.push(Section {
            heading: None,
            text: content,
            start: 0,
        });
        return sections;
    }

    let first_break = breaks[0].0;
    if !content[..first_break].trim().is_empty() {
        sections.push(Section {
            heading: None,
            text: &content[..first_break],
            start: 0,
        });
    }

    for (i, (pos, heading)) in breaks.iter().enumerate() {
        let end = breaks.get(i + 1).map(|(next, _)| *next).unwrap_or(content.len());
        sections.push(Section {
            heading: Some(heading.text.clone()),
            text: &content[*pos..end],
            start: *pos,
        });
    }
    sections
}

fn chunk_section(section: &Section<'_>, opts: &ChunkerOptions, chunks: &mut Vec<ChunkPiece>) {
    let text = section.text.trim();
    if text.is_empty() {
        return;
    }

    let mut emitted = SectionEmitter {
        heading: section.heading.clone(),
        section_start: section.start,
        emitted_len: 0,
        chunks,
    };

    if text.len() <= opts.max_chunk_size {
        emitted.emit(text.to_string());
        return;
    }

    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();

    let mut current = String::new();
    for paragraph in paragraphs {
        if paragraph.len() > opts.max_chunk_size {
            if !current.is_empty() {
                emitted.emit(std::mem::take(&mut current));
            }
            for piece in split_oversize_paragraph(paragraph, opts.max_chunk_size) {
                emitted.emit(piece);
            }
            continue;
        }

        if current.is_empty() {
            current = paragraph.to_string();
        } else if current.len() + 2 + paragraph.len() <= opts.max_chunk_size {
            current.push_str("\n\n");
            current.push_str(paragraph);
        } else if current.len() >= opts.min_chunk_size {
            let tail = emitted.flush(current, opts);
            current = if tail.is_empty() {
                paragraph.to_string()
            } else {
                format!("{}\n\n{}", tail, paragraph)
            };
        } else {
            // Below the minimum: keep accumulating even past the soft cap
            // rather than emitting a fragment.
            current.push_str("\n\n");
            current.push_str(paragraph);
        }
    }

    if !current.is_empty() {
        emitted.emit(current);
    }
}

struct SectionEmitter<'a> {
    heading: Option<String>,
    section_start: usize,
    emitted_len: usize,
    chunks: &'a mut Vec<ChunkPiece>,
}

impl SectionEmitter<'_> {
    fn emit(&mut self, content: String) {
        let start = self.section_start + self.emitted_len;
        let end = start + content.len();
        self.emitted_len += content.len();
        self.chunks.push(ChunkPiece {
            content,
            heading: self.heading.clone(),
            start_offset: start,
            end_offset: end,
            index: 0,
        });
    }

    /// Emit and return the overlap tail to seed the next accumulation.
    fn flush(&mut self, content: String, opts: &ChunkerOptions) -> String {
        let tail = if opts.overlap > 0 {
            tail_chars(&content, opts.overlap).to_string()
        } else {
            String::new()
        };
        self.emit(content);
        tail
    }
}

/// Sentence split, falling back to word split for sentences that are still
/// oversize. A single word longer than the limit is emitted whole.
fn split_oversize_paragraph(paragraph: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(paragraph) {
        if sentence.len() > max {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            split_words(&sentence, max, &mut pieces);
            continue;
        }
        if current.is_empty() {
            current = sentence;
        } else if current.len() + 1 + sentence.len() <= max {
            current.push(' ');
            current.push_str(&sentence);
        } else {
            pieces.push(std::mem::take(&mut current));
            current = sentence;
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Split on `[.!?]` followed by whitespace, keeping the terminator.
fn split_sentences(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?')
            && i + 1 < bytes.len()
            && bytes[i + 1].is_ascii_whitespace()
        {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            sentences.push(text[start..=i].to_string());
            start = j;
            i = j;
            continue;
        }
        i += 1;
    }
    if start < text.len() {
        let rest = text[start..].trim();
        if !rest.is_empty() {
            sentences.push(rest.to_string());
        }
    }
    sentences
}

fn split_words(text: &str, max: usize, pieces: &mut Vec<String>) {
    let mut current = String::new();
    for word in text.split_whitespace() {
        if current.is_empty() {
            current = word.to_string();
        } else if current.len() + 1 + word.len() <= max {
            current.push(' ');
            current.push_str(word);
        } else {
            pieces.push(std::mem::take(&mut current));
            current = word.to_string();
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
}

/// Merge a trailing fragment into its neighbour when the pair still fits.
fn merge_trailing_small_chunk(chunks: &mut Vec<ChunkPiece>, opts: &ChunkerOptions) {
    if chunks.len() < 2 {
        return;
    }
    let last = chunks.last().unwrap();
    let prev = &chunks[chunks.len() - 2];
    if last.content.len() < opts.min_chunk_size
        && prev.content.len() + 2 + last.content.len() <= opts.max_chunk_size
    {
        let last = chunks.pop().unwrap();
        let prev = chunks.last_mut().unwrap();
        prev.content.push_str("\n\n");
        prev.content.push_str(&last.content);
        prev.end_offset = last.end_offset;
    }
}

/// Last `n` characters of `s`, on a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    let start = s
        .char_indices()
        .nth(count - n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heading(level: u8, text: &str, offset: usize) -> Heading {
        Heading {
            level,
            text: text.to_string(),
            offset,
        }
    }

    fn opts(max: usize, min: usize, overlap: usize) -> ChunkerOptions {
        ChunkerOptions {
            max_chunk_size: max,
            min_chunk_size: min,
            overlap,
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", &[], &ChunkerOptions::default()).is_empty());
        assert!(chunk_text("   \n\n  ", &[], &ChunkerOptions::default()).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk_with_first_heading() {
        let headings = vec![heading(1, "Intro", 0)];
        let chunks = chunk_text("Intro\n\nSome body.", &headings, &ChunkerOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].heading.as_deref(), Some("Intro"));
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn sections_carry_their_headings() {
        let alpha = "alpha ".repeat(30);
        let beta = "beta ".repeat(30);
        let content = format!("One\n\n{}\n\nTwo\n\n{}", alpha.trim(), beta.trim());
        let headings = vec![heading(1, "One", 0), heading(1, "Two", 0)];
        let chunks = chunk_text(&content, &headings, &opts(200, 20, 0));

        assert!(chunks.len() >= 2);
        assert!(chunks.iter().any(|c| c.heading.as_deref() == Some("One")));
        assert!(chunks.iter().any(|c| c.heading.as_deref() == Some("Two")));
        let first_two = chunks
            .iter()
            .position(|c| c.heading.as_deref() == Some("Two"))
            .unwrap();
        for chunk in &chunks[first_two..] {
            assert_eq!(chunk.heading.as_deref(), Some("Two"));
        }
    }

    #[test]
    fn indices_are_dense() {
        let content = (0..40)
            .map(|i| format!("Paragraph number {} with some padding text.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&content, &[], &opts(120, 30, 0));
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }

    #[test]
    fn overlap_carries_previous_tail() {
        let content = (0..10)
            .map(|i| format!("Paragraph {} is here with filler words to pad it out.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&content, &[], &opts(150, 30, 20));
        assert!(chunks.len() > 1);

        let tail = tail_chars(&chunks[0].content, 20);
        assert!(chunks[1].content.starts_with(tail));
    }

    #[test]
    fn oversize_paragraph_falls_back_to_sentences() {
        let sentence = "This sentence repeats to build an oversize paragraph. ";
        let paragraph = sentence.repeat(10);
        let chunks = chunk_text(paragraph.trim(), &[], &opts(120, 20, 0));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= 120, "{}", chunk.content.len());
        }
    }

    #[test]
    fn word_fallback_only_exceeds_max_for_single_long_word() {
        let long_word = "x".repeat(200);
        let paragraph = format!("{} and some short words after it {}", long_word, long_word);
        let chunks = chunk_text(&paragraph, &[], &opts(100, 10, 0));
        for chunk in &chunks {
            if chunk.content.len() > 100 {
                assert!(!chunk.content.contains(' '), "oversize chunk must be one word");
            }
        }
    }

    #[test]
    fn trailing_fragment_merges_into_neighbour() {
        // The word-split tail (49 chars, below min) plus the final "tiny"
        // paragraph fit together, so the last two chunks merge.
        let big = "word ".repeat(50);
        let content = format!("{}\n\ntiny", big.trim());
        let chunks = chunk_text(&content, &[], &opts(200, 50, 0));
        assert_eq!(chunks.len(), 2);
        assert!(chunks.last().unwrap().content.ends_with("tiny"));
    }

    #[test]
    fn deterministic() {
        let content = (0..25)
            .map(|i| format!("Sentence {} of the deterministic test corpus.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let headings = vec![heading(2, "Sentence 5", 0)];
        let a = chunk_text(&content, &headings, &opts(140, 40, 25));
        let b = chunk_text(&content, &headings, &opts(140, 40, 25));
        assert_eq!(a, b);
    }

    #[test]
    fn heading_positions_split_sections() {
        let body_a = "alpha ".repeat(40);
        let body_b = "beta ".repeat(40);
        let content = format!("Setup\n\n{}\n\nUsage\n\n{}", body_a.trim(), body_b.trim());
        let headings = vec![heading(2, "Setup", 0), heading(2, "Usage", 0)];
        let chunks = chunk_text(&content, &headings, &opts(150, 20, 0));

        for chunk in &chunks {
            if chunk.content.contains("beta") {
                assert_eq!(chunk.heading.as_deref(), Some("Usage"));
            }
        }
    }
}
