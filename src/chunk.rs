//! Markdown chunkers for OCR output.
//!
//! Three strategies are available:
//!
//! | Strategy | Unit | Context added |
//! |----------|------|---------------|
//! | `headers` | one chunk per header section | ancestor header lines |
//! | `page-overlap` | one chunk per page | tail of previous page, head of next page |
//! | `header-overlap` | one chunk per page | last section of previous page, intro of next page |
//!
//! The header strategy does no length rebalancing: a long section stays one
//! chunk. The page strategies halve chunks that exceed `max_chars`.
//!
//! Every chunk gets a contiguous index starting at 0 and a SHA-256 hash of
//! its text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::config::ChunkingConfig;
use crate::models::Chunk;
use crate::ocr::{combined_markdown, OcrPage, OcrResponse};

/// Separator placed between text taken from neighbouring pages.
pub const PAGE_BREAK: &str = "\n\n<br>PAGE_BREAK<br>\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkStrategy {
    #[default]
    Headers,
    PageOverlap,
    HeaderOverlap,
}

fn header_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#+)\s+(.*)$").expect("valid header regex"))
}

fn header_in_page() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#{1,6} .*$").expect("valid header regex"))
}

/// Chunk an OCR result with the configured strategy.
pub fn chunk_document(
    ocr: &OcrResponse,
    strategy: ChunkStrategy,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    match strategy {
        ChunkStrategy::Headers => split_markdown_into_chunks(&combined_markdown(ocr)),
        ChunkStrategy::PageOverlap => {
            page_overlap_chunks(&ocr.pages, config.overlap_chars, config.max_chars)
        }
        ChunkStrategy::HeaderOverlap => header_overlap_chunks(&ocr.pages, config.max_chars),
    }
}

/// Split markdown into one chunk per header section.
///
/// A header line closes the current chunk. Headers at the same or deeper
/// level are popped from the header stack before the new one is pushed,
/// and the remaining ancestors are prefixed to the new chunk so each
/// section keeps its place in the outline. Blank lines are dropped.
pub fn split_markdown_into_chunks(markdown: &str) -> Vec<Chunk> {
    let mut texts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut stack: Vec<(usize, String)> = Vec::new();

    for line in markdown.split_inclusive('\n') {
        let bare = line.trim_end_matches(['\n', '\r']);

        if let Some(caps) = header_line().captures(bare) {
            flush(&mut texts, &mut current);

            let level = caps[1].len();
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            for (l, title) in &stack {
                current.push_str(&"#".repeat(*l));
                current.push(' ');
                current.push_str(title);
                current.push('\n');
            }
            stack.push((level, caps[2].to_string()));
        }

        if !bare.trim().is_empty() {
            current.push_str(line);
        }
    }
    flush(&mut texts, &mut current);

    number(texts)
}

/// One chunk per page, padded with the last `overlap_chars` characters of
/// the previous page and the first `overlap_chars` of the next one.
pub fn page_overlap_chunks(pages: &[OcrPage], overlap_chars: usize, max_chars: usize) -> Vec<Chunk> {
    let mut texts = Vec::new();

    for (i, page) in pages.iter().enumerate() {
        if page.markdown.trim().is_empty() {
            continue;
        }
        let mut text = String::new();

        if i > 0 {
            let prev = tail_chars(&pages[i - 1].markdown, overlap_chars);
            if !prev.trim().is_empty() {
                text.push_str("...");
                text.push_str(prev);
                text.push_str(PAGE_BREAK);
            }
        }

        text.push_str(&page.markdown);

        if let Some(next_page) = pages.get(i + 1) {
            let next = head_chars(&next_page.markdown, overlap_chars);
            if !next.trim().is_empty() {
                text.push_str(PAGE_BREAK);
                text.push_str(next);
                text.push_str("...");
            }
        }

        texts.extend(split_to_fit(&text, max_chars));
    }

    number(texts)
}

/// One chunk per page, prefixed with the section under the previous page's
/// last header and suffixed with the next page's text before its first
/// header, so sections cut by a page break are whole in at least one chunk.
pub fn header_overlap_chunks(pages: &[OcrPage], max_chars: usize) -> Vec<Chunk> {
    let mut texts = Vec::new();

    for (i, page) in pages.iter().enumerate() {
        if page.markdown.trim().is_empty() {
            continue;
        }
        let mut text = String::new();

        if i > 0 {
            if let Some(section) = last_header_section(&pages[i - 1].markdown) {
                text.push_str(section.trim_end());
                text.push_str(PAGE_BREAK);
            }
        }

        text.push_str(&page.markdown);

        if let Some(next_page) = pages.get(i + 1) {
            if let Some(intro) = text_before_first_header(&next_page.markdown) {
                text.push_str(PAGE_BREAK);
                text.push_str(intro.trim());
            }
        }

        texts.extend(split_to_fit(&text, max_chars));
    }

    number(texts)
}

/// The text from the last header line of `markdown` to its end.
fn last_header_section(markdown: &str) -> Option<&str> {
    header_in_page()
        .find_iter(markdown)
        .last()
        .map(|m| &markdown[m.start()..])
}

/// The text of `markdown` before its first header line, if there is a
/// header and the text before it is not blank.
fn text_before_first_header(markdown: &str) -> Option<&str> {
    let m = header_in_page().find(markdown)?;
    let intro = &markdown[..m.start()];
    (!intro.trim().is_empty()).then_some(intro)
}

fn tail_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if count <= n {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}

fn head_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

/// Halve `text` at a character boundary until every piece has at most
/// `max_chars` characters.
fn split_to_fit(text: &str, max_chars: usize) -> Vec<String> {
    let count = text.chars().count();
    if count <= max_chars || count < 2 {
        return vec![text.to_string()];
    }
    let mid = text
        .char_indices()
        .nth(count / 2)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let (left, right) = text.split_at(mid);
    let mut pieces = split_to_fit(left, max_chars);
    pieces.extend(split_to_fit(right, max_chars));
    pieces
}

fn flush(texts: &mut Vec<String>, current: &mut String) {
    if !current.trim().is_empty() {
        texts.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

fn number(texts: Vec<String>) -> Vec<Chunk> {
    texts
        .into_iter()
        .filter(|t| !t.trim().is_empty())
        .enumerate()
        .map(|(i, text)| make_chunk(i as u64, text))
        .collect()
}

/// SHA-256 of a chunk's text, hex encoded.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(id: u64, text: String) -> Chunk {
    Chunk {
        id,
        hash: text_hash(&text),
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(index: usize, markdown: &str) -> OcrPage {
        OcrPage {
            index,
            markdown: markdown.to_string(),
            images: Vec::new(),
            dimensions: None,
        }
    }

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn test_headers_prefix_ancestors() {
        let md = "# A\nintro\n\n## B\ntext b\n### C\ntext c\n## D\ntext d\n";
        let chunks = split_markdown_into_chunks(md);
        assert_eq!(
            texts(&chunks),
            vec![
                "# A\nintro\n",
                "# A\n## B\ntext b\n",
                "# A\n## B\n### C\ntext c\n",
                "# A\n## D\ntext d\n",
            ]
        );
    }

    #[test]
    fn test_headers_text_before_first_header() {
        let md = "preamble line\n\n# Title\nbody";
        let chunks = split_markdown_into_chunks(md);
        assert_eq!(texts(&chunks), vec!["preamble line\n", "# Title\nbody"]);
    }

    #[test]
    fn test_headers_sibling_at_top_level_has_no_prefix() {
        let md = "# One\na\n# Two\nb\n";
        let chunks = split_markdown_into_chunks(md);
        assert_eq!(texts(&chunks), vec!["# One\na\n", "# Two\nb\n"]);
    }

    #[test]
    fn test_headers_no_rebalancing() {
        let body = "word ".repeat(10_000);
        let md = format!("# Long\n{}\n", body);
        let chunks = split_markdown_into_chunks(&md);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_hashtag_is_not_a_header() {
        let chunks = split_markdown_into_chunks("#rust is fun\nmore\n");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_empty_markdown_has_no_chunks() {
        assert!(split_markdown_into_chunks("").is_empty());
        assert!(split_markdown_into_chunks("\n\n\r\n").is_empty());
    }

    #[test]
    fn test_ids_contiguous_and_hashed() {
        let md = (0..20)
            .map(|i| format!("## Section {}\ncontent {}\n", i, i))
            .collect::<String>();
        let chunks = split_markdown_into_chunks(&md);
        assert_eq!(chunks.len(), 20);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.id, i as u64);
            assert_eq!(c.hash, text_hash(&c.text));
        }
    }

    #[test]
    fn test_page_overlap() {
        let pages = vec![page(0, "first page"), page(1, "second page"), page(2, "third")];
        let chunks = page_overlap_chunks(&pages, 4, 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, format!("first page{}seco...", PAGE_BREAK));
        assert_eq!(
            chunks[1].text,
            format!("...page{}second page{}thir...", PAGE_BREAK, PAGE_BREAK)
        );
        assert_eq!(chunks[2].text, format!("...page{}third", PAGE_BREAK));
    }

    #[test]
    fn test_page_overlap_splits_long_pages_with_unique_ids() {
        let long = "x".repeat(250);
        let pages = vec![page(0, &long), page(1, "short")];
        let chunks = page_overlap_chunks(&pages, 0, 100);
        assert!(chunks.len() >= 4);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.id, i as u64);
            assert!(c.text.chars().count() <= 100);
        }
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "àèìòù".repeat(30);
        let pieces = split_to_fit(&text, 20);
        assert_eq!(pieces.concat(), text);
        assert!(pieces.iter().all(|p| p.chars().count() <= 20));
    }

    #[test]
    fn test_header_overlap() {
        let pages = vec![
            page(0, "# Intro\nhello\n## Rules\nrule one"),
            page(1, "rule two continues\n## Points\npoints text"),
        ];
        let chunks = header_overlap_chunks(&pages, 10_000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].text,
            format!(
                "# Intro\nhello\n## Rules\nrule one{}rule two continues",
                PAGE_BREAK
            )
        );
        assert_eq!(
            chunks[1].text,
            format!(
                "## Rules\nrule one{}rule two continues\n## Points\npoints text",
                PAGE_BREAK
            )
        );
    }

    #[test]
    fn test_chunk_document_dispatch() {
        let ocr = OcrResponse {
            pages: vec![page(0, "# A\none"), page(1, "# B\ntwo")],
            model: String::new(),
            usage_info: None,
        };
        let config = ChunkingConfig::default();
        let by_headers = chunk_document(&ocr, ChunkStrategy::Headers, &config);
        assert_eq!(texts(&by_headers), vec!["# A\none\n", "# B\ntwo"]);
        let by_page = chunk_document(&ocr, ChunkStrategy::PageOverlap, &config);
        assert_eq!(by_page.len(), 2);
    }
}
