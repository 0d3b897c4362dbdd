//! Heading-aware document chunker.
//!
//! Markdown/MDX/HTML/plain text is split into addressable chunks. The
//! `structural` strategy detects fenced code blocks, pipe tables, and list
//! runs inside each heading section and packs the segments toward a target
//! size; `heading` keeps one chunk per section; `fixed` ignores structure.
//! Chunk ids are SHA-256 over `(file, sectionPath, range, ordinal)`, so the
//! same input and options always produce the same ids. The separate content
//! hash drives summary and embedding invalidation.

use crate::storage::ChunkRow;
use crate::types::{content_hash, hex_prefix, SourceRange, SymbolRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    #[default]
    Structural,
    Heading,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkOptions {
    pub strategy: ChunkStrategy,
    /// Keep fenced code blocks as intact segments.
    pub include_code_blocks: bool,
    pub include_tables: bool,
    pub include_lists: bool,
    /// Sections smaller than this merge into their neighbor.
    pub min_section_chars: usize,
    /// Packing target for combined segments.
    pub target_chunk_chars: usize,
    /// Hard cap for any single block.
    pub max_block_chars: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        ChunkOptions {
            strategy: ChunkStrategy::Structural,
            include_code_blocks: true,
            include_tables: true,
            include_lists: true,
            min_section_chars: 80,
            target_chunk_chars: 1200,
            max_block_chars: 4000,
        }
    }
}

/// Document kind recorded on each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    Markdown,
    Mdx,
    Html,
    Text,
    CodeComment,
}

impl DocKind {
    pub fn label(&self) -> &'static str {
        match self {
            DocKind::Markdown => "markdown",
            DocKind::Mdx => "mdx",
            DocKind::Html => "html",
            DocKind::Text => "text",
            DocKind::CodeComment => "code_comment",
        }
    }

    pub fn from_path(path: &str) -> DocKind {
        match path.rsplit_once('.').map(|(_, e)| e).unwrap_or("") {
            "md" | "markdown" => DocKind::Markdown,
            "mdx" => DocKind::Mdx,
            "html" | "htm" => DocKind::Html,
            _ => DocKind::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Line offset table
// ---------------------------------------------------------------------------

/// O(1) line → byte and O(log n) byte → line mapping.
pub struct LineOffsets {
    /// Byte offset where each 1-based line starts.
    starts: Vec<usize>,
    total: usize,
}

impl LineOffsets {
    pub fn new(text: &str) -> LineOffsets {
        let mut starts = vec![0usize];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        LineOffsets { starts, total: text.len() }
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// Byte offset of the start of a 1-based line.
    pub fn line_to_byte(&self, line: usize) -> usize {
        self.starts
            .get(line.saturating_sub(1))
            .copied()
            .unwrap_or(self.total)
    }

    /// 1-based line containing a byte offset.
    pub fn byte_to_line(&self, byte: usize) -> usize {
        match self.starts.binary_search(&byte) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Byte one past the end of a 1-based line (excluding the newline).
    pub fn line_end_byte(&self, line: usize) -> usize {
        self.starts
            .get(line)
            .map(|next| next.saturating_sub(1))
            .unwrap_or(self.total)
    }
}

// ---------------------------------------------------------------------------
// MDX / HTML normalization
// ---------------------------------------------------------------------------

/// Blank out MDX JSX expressions and module lines, preserving every line
/// break and byte position so ranges still address the original file.
pub fn normalize_mdx(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("import ") || trimmed.starts_with("export ") {
            blank_line(line, &mut out);
            continue;
        }
        // Inline {expr} placeholders and JSX tags become spaces.
        let mut depth = 0usize;
        let mut in_tag = false;
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    out.push(' ');
                }
                '}' if depth > 0 => {
                    depth -= 1;
                    out.push(' ');
                }
                '<' if depth == 0 => {
                    in_tag = true;
                    out.push(' ');
                }
                '>' if in_tag => {
                    in_tag = false;
                    out.push(' ');
                }
                '\n' => out.push('\n'),
                _ if depth > 0 || in_tag => out.push(' '),
                c => out.push(c),
            }
        }
    }
    out
}

/// Strip HTML down to text, turning `<h1>`–`<h6>` into ATX headings while
/// keeping line positions stable.
pub fn html_to_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let mut replaced = line.to_string();
        for level in 1..=6u32 {
            // Match both casings literally; a lowercased copy would shift
            // byte positions on non-ASCII lines.
            for open in [format!("<h{level}>"), format!("<H{level}>")] {
                if let Some(pos) = replaced.find(&open) {
                    let hashes = "#".repeat(level as usize);
                    // Keep the byte count stable: the tag is at least as
                    // long as the replacement prefix.
                    let prefix = format!("{hashes} ");
                    let pad = open.len().saturating_sub(prefix.len());
                    replaced
                        .replace_range(pos..pos + open.len(), &format!("{prefix}{}", " ".repeat(pad)));
                }
            }
            for close in [format!("</h{level}>"), format!("</H{level}>")] {
                if let Some(pos) = replaced.find(&close) {
                    replaced.replace_range(pos..pos + close.len(), &" ".repeat(close.len()));
                }
            }
        }
        // Remaining tags become spaces.
        let mut in_tag = false;
        for c in replaced.chars() {
            match c {
                '<' => {
                    in_tag = true;
                    out.push(' ');
                }
                '>' if in_tag => {
                    in_tag = false;
                    out.push(' ');
                }
                '\n' => out.push('\n'),
                _ if in_tag => out.push(' '),
                c => out.push(c),
            }
        }
    }
    out
}

fn blank_line(line: &str, out: &mut String) {
    for c in line.chars() {
        out.push(if c == '\n' { '\n' } else { ' ' });
    }
}

// ---------------------------------------------------------------------------
// Head/tail sampling for oversized documents
// ---------------------------------------------------------------------------

/// Cut an oversized document to `head` + `tail` bytes on line boundaries.
/// Returns the sampled text and whether sampling happened.
pub fn sample_document(text: &str, max_bytes: usize, head: usize, tail: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let head_end = floor_line_boundary(text, head.min(text.len()));
    let tail_start = ceil_line_boundary(text, text.len().saturating_sub(tail));
    let mut out = String::with_capacity(head_end + (text.len() - tail_start) + 16);
    out.push_str(&text[..head_end]);
    out.push_str("\n…\n");
    out.push_str(&text[tail_start..]);
    (out, true)
}

fn floor_line_boundary(text: &str, at: usize) -> usize {
    text[..at].rfind('\n').map(|i| i + 1).unwrap_or(0)
}

fn ceil_line_boundary(text: &str, at: usize) -> usize {
    text[at..].find('\n').map(|i| at + i + 1).unwrap_or(text.len())
}

// ---------------------------------------------------------------------------
// Segment detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Fence,
    Table,
    List,
    Text,
}

#[derive(Debug, Clone)]
struct Segment {
    kind: SegmentKind,
    /// 1-based inclusive line span.
    start_line: usize,
    end_line: usize,
    chars: usize,
}

fn is_list_line(line: &str) -> bool {
    let t = line.trim_start();
    if t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ") {
        return true;
    }
    let digits: String = t.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return false;
    }
    let rest = &t[digits.len()..];
    rest.starts_with(". ") || rest.starts_with(") ")
}

fn is_table_line(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.matches('|').count() >= 2
}

fn is_fence_line(line: &str) -> Option<&'static str> {
    let t = line.trim_start();
    if t.starts_with("```") {
        Some("```")
    } else if t.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

/// Split a section body (1-based inclusive line span) into typed segments.
fn detect_segments(lines: &[&str], start_line: usize, end_line: usize) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut i = start_line;
    let mut text_start: Option<usize> = None;

    let flush_text = |segments: &mut Vec<Segment>, text_start: &mut Option<usize>, end: usize, lines: &[&str]| {
        if let Some(start) = text_start.take() {
            if end >= start {
                let chars: usize =
                    (start..=end).map(|l| lines[l - 1].len() + 1).sum();
                let has_content = (start..=end).any(|l| !lines[l - 1].trim().is_empty());
                if has_content {
                    segments.push(Segment {
                        kind: SegmentKind::Text,
                        start_line: start,
                        end_line: end,
                        chars,
                    });
                }
            }
        }
    };

    while i <= end_line {
        let line = lines[i - 1];

        if let Some(marker) = is_fence_line(line) {
            flush_text(&mut segments, &mut text_start, i - 1, lines);
            let fence_start = i;
            let mut j = i + 1;
            while j <= end_line && is_fence_line(lines[j - 1]) != Some(marker) {
                j += 1;
            }
            let fence_end = j.min(end_line);
            let chars: usize = (fence_start..=fence_end).map(|l| lines[l - 1].len() + 1).sum();
            segments.push(Segment {
                kind: SegmentKind::Fence,
                start_line: fence_start,
                end_line: fence_end,
                chars,
            });
            i = fence_end + 1;
            continue;
        }

        if is_table_line(line) && i < end_line && is_table_line(lines[i]) {
            flush_text(&mut segments, &mut text_start, i - 1, lines);
            let table_start = i;
            let mut j = i;
            while j <= end_line && is_table_line(lines[j - 1]) {
                j += 1;
            }
            let table_end = j - 1;
            let chars: usize = (table_start..=table_end).map(|l| lines[l - 1].len() + 1).sum();
            segments.push(Segment {
                kind: SegmentKind::Table,
                start_line: table_start,
                end_line: table_end,
                chars,
            });
            i = table_end + 1;
            continue;
        }

        if is_list_line(line) {
            flush_text(&mut segments, &mut text_start, i - 1, lines);
            let list_start = i;
            let mut j = i;
            while j <= end_line
                && (is_list_line(lines[j - 1]) || lines[j - 1].starts_with("  "))
                && !lines[j - 1].trim().is_empty()
            {
                j += 1;
            }
            let list_end = j - 1;
            let chars: usize = (list_start..=list_end).map(|l| lines[l - 1].len() + 1).sum();
            segments.push(Segment {
                kind: SegmentKind::List,
                start_line: list_start,
                end_line: list_end,
                chars,
            });
            i = list_end + 1;
            continue;
        }

        if text_start.is_none() {
            text_start = Some(i);
        }
        i += 1;
    }
    flush_text(&mut segments, &mut text_start, end_line, lines);
    segments
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Section {
    heading: Option<String>,
    level: u32,
    /// Heading trail, e.g. "Guide > Setup > Linux".
    path: String,
    body_start: usize,
    body_end: usize,
}

fn heading_of(line: &str) -> Option<(u32, String)> {
    let t = line.trim_start();
    let hashes = t.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &t[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    Some((hashes as u32, rest.trim().to_string()))
}

fn split_sections(lines: &[&str]) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut trail: Vec<(u32, String)> = Vec::new();
    let mut current_start = 1usize;
    let mut current: Option<(u32, String)> = None;

    let close = |sections: &mut Vec<Section>,
                     trail: &[(u32, String)],
                     current: &Option<(u32, String)>,
                     start: usize,
                     end: usize| {
        if end < start {
            return;
        }
        let path = if trail.is_empty() {
            String::new()
        } else {
            trail.iter().map(|(_, h)| h.as_str()).collect::<Vec<_>>().join(" > ")
        };
        sections.push(Section {
            heading: current.as_ref().map(|(_, h)| h.clone()),
            level: current.as_ref().map(|(l, _)| *l).unwrap_or(0),
            path,
            body_start: start,
            body_end: end,
        });
    };

    for (idx, line) in lines.iter().enumerate() {
        let lineno = idx + 1;
        if let Some((level, heading)) = heading_of(line) {
            close(&mut sections, &trail, &current, current_start, lineno - 1);
            while trail.last().map(|(l, _)| *l >= level).unwrap_or(false) {
                trail.pop();
            }
            trail.push((level, heading.clone()));
            current = Some((level, heading));
            current_start = lineno + 1;
        }
    }
    close(&mut sections, &trail, &current, current_start, lines.len());
    sections
}

// ---------------------------------------------------------------------------
// Chunk construction
// ---------------------------------------------------------------------------

fn chunk_id(file: &str, section_path: &str, range: &SourceRange, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file.as_bytes());
    hasher.update([0]);
    hasher.update(section_path.as_bytes());
    hasher.update([0]);
    hasher.update(range.start_line.to_le_bytes());
    hasher.update(range.end_line.to_le_bytes());
    hasher.update(ordinal.to_le_bytes());
    hex_prefix(&hasher.finalize(), 16)
}

fn build_chunk(
    file: &str,
    kind: DocKind,
    section: &Section,
    lines: &[&str],
    offsets: &LineOffsets,
    start_line: usize,
    end_line: usize,
    ordinal: usize,
) -> ChunkRow {
    let text: String = (start_line..=end_line)
        .map(|l| lines[l - 1])
        .collect::<Vec<_>>()
        .join("\n");
    let range = SourceRange {
        start_line,
        end_line,
        start_byte: offsets.line_to_byte(start_line),
        end_byte: offsets.line_end_byte(end_line),
    };
    ChunkRow {
        id: chunk_id(file, &section.path, &range, ordinal),
        file: file.to_string(),
        kind: kind.label().to_string(),
        section_path: section.path.clone(),
        heading: section.heading.clone(),
        heading_level: section.level,
        range,
        content_hash: content_hash(&text),
        text,
    }
}

/// Chunk a document. `text` must already be the raw file content; MDX and
/// HTML are normalized internally.
pub fn chunk_document(
    file: &str,
    raw: &str,
    kind: DocKind,
    options: &ChunkOptions,
) -> Vec<ChunkRow> {
    let normalized = match kind {
        DocKind::Mdx => normalize_mdx(raw),
        DocKind::Html => html_to_text(raw),
        _ => raw.to_string(),
    };
    let offsets = LineOffsets::new(&normalized);
    let lines: Vec<&str> = normalized.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    match options.strategy {
        ChunkStrategy::Fixed => chunk_fixed(file, kind, &lines, &offsets, options),
        ChunkStrategy::Heading => chunk_by_heading(file, kind, &lines, &offsets, options),
        ChunkStrategy::Structural => chunk_structural(file, kind, &lines, &offsets, options),
    }
}

fn chunk_fixed(
    file: &str,
    kind: DocKind,
    lines: &[&str],
    offsets: &LineOffsets,
    options: &ChunkOptions,
) -> Vec<ChunkRow> {
    let section = Section {
        heading: None,
        level: 0,
        path: String::new(),
        body_start: 1,
        body_end: lines.len(),
    };
    let mut chunks = Vec::new();
    let mut ordinal = 0usize;
    let mut start = 1usize;
    let mut chars = 0usize;
    for lineno in 1..=lines.len() {
        chars += lines[lineno - 1].len() + 1;
        let at_end = lineno == lines.len();
        if chars >= options.target_chunk_chars || at_end {
            if chars > 0 {
                chunks.push(build_chunk(file, kind, &section, lines, offsets, start, lineno, ordinal));
                ordinal += 1;
            }
            start = lineno + 1;
            chars = 0;
        }
    }
    retain_nonempty(chunks)
}

fn chunk_by_heading(
    file: &str,
    kind: DocKind,
    lines: &[&str],
    offsets: &LineOffsets,
    options: &ChunkOptions,
) -> Vec<ChunkRow> {
    let mut chunks = Vec::new();
    for section in split_sections(lines) {
        if section.body_end < section.body_start {
            continue;
        }
        // Oversized sections split at the block cap.
        let mut ordinal = 0usize;
        let mut start = section.body_start;
        let mut chars = 0usize;
        for lineno in section.body_start..=section.body_end {
            chars += lines[lineno - 1].len() + 1;
            let at_end = lineno == section.body_end;
            if chars >= options.max_block_chars || at_end {
                chunks.push(build_chunk(file, kind, &section, lines, offsets, start, lineno, ordinal));
                ordinal += 1;
                start = lineno + 1;
                chars = 0;
            }
        }
    }
    retain_nonempty(chunks)
}

fn chunk_structural(
    file: &str,
    kind: DocKind,
    lines: &[&str],
    offsets: &LineOffsets,
    options: &ChunkOptions,
) -> Vec<ChunkRow> {
    let mut chunks = Vec::new();
    for section in split_sections(lines) {
        if section.body_end < section.body_start {
            continue;
        }
        let segments: Vec<Segment> =
            detect_segments(lines, section.body_start, section.body_end)
                .into_iter()
                .filter(|s| match s.kind {
                    SegmentKind::Fence => options.include_code_blocks,
                    SegmentKind::Table => options.include_tables,
                    SegmentKind::List => options.include_lists,
                    SegmentKind::Text => true,
                })
                .collect();
        if segments.is_empty() {
            continue;
        }

        // Pack consecutive segments toward the target size. Fences never
        // merge with neighbors past the target; any run is cut at the cap.
        let mut ordinal = 0usize;
        let mut run: Option<(usize, usize, usize)> = None; // (start, end, chars)
        let flush = |run: &mut Option<(usize, usize, usize)>, chunks: &mut Vec<ChunkRow>, ordinal: &mut usize| {
            if let Some((start, end, _)) = run.take() {
                chunks.push(build_chunk(file, kind, &section, lines, offsets, start, end, *ordinal));
                *ordinal += 1;
            }
        };

        for segment in &segments {
            let fits = run
                .map(|(_, _, chars)| chars + segment.chars <= options.target_chunk_chars)
                .unwrap_or(true);
            let oversized = run
                .map(|(_, _, chars)| chars + segment.chars > options.max_block_chars)
                .unwrap_or(segment.chars > options.max_block_chars);
            // A run is built from its line range, so it may only bridge a
            // gap when the skipped lines are blank — an excluded segment in
            // between must not leak back in.
            let gap_dirty = run
                .map(|(_, end, _)| {
                    (end + 1..segment.start_line)
                        .any(|l| !lines[l - 1].trim().is_empty())
                })
                .unwrap_or(false);
            if !fits || oversized || gap_dirty {
                flush(&mut run, &mut chunks, &mut ordinal);
            }
            run = match run {
                None => Some((segment.start_line, segment.end_line, segment.chars)),
                Some((start, _, chars)) => {
                    Some((start, segment.end_line, chars + segment.chars))
                }
            };
        }
        flush(&mut run, &mut chunks, &mut ordinal);
    }

    merge_small_tails(retain_nonempty(chunks), options.min_section_chars)
}

fn retain_nonempty(chunks: Vec<ChunkRow>) -> Vec<ChunkRow> {
    chunks.into_iter().filter(|c| !c.text.trim().is_empty()).collect()
}

/// Merge a chunk smaller than `min_chars` into the previous chunk of the
/// same section.
fn merge_small_tails(chunks: Vec<ChunkRow>, min_chars: usize) -> Vec<ChunkRow> {
    let mut out: Vec<ChunkRow> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let mergeable = chunk.text.len() < min_chars
            && out
                .last()
                .map(|prev: &ChunkRow| prev.section_path == chunk.section_path)
                .unwrap_or(false);
        if mergeable {
            let prev = out.last_mut().unwrap();
            prev.text.push('\n');
            prev.text.push_str(&chunk.text);
            prev.range.end_line = chunk.range.end_line;
            prev.range.end_byte = chunk.range.end_byte;
            prev.content_hash = content_hash(&prev.text);
            // id stays the previous chunk's id: the merged range is an
            // extension of it, and ids must not depend on merge order.
        } else {
            out.push(chunk);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Code-comment chunks
// ---------------------------------------------------------------------------

/// Doc comments of indexed symbols, exposed to doc search as chunks.
pub fn comment_chunks(file: &str, symbols: &[SymbolRecord]) -> Vec<ChunkRow> {
    symbols
        .iter()
        .filter_map(|sym| {
            let doc = sym.doc.as_ref()?;
            if doc.trim().is_empty() {
                return None;
            }
            let text = format!("{} — {}", sym.signature, doc);
            let range = SourceRange {
                start_line: sym.range.start_line,
                end_line: sym.range.start_line,
                start_byte: sym.range.start_byte,
                end_byte: sym.range.start_byte,
            };
            Some(ChunkRow {
                id: chunk_id(file, &sym.name, &range, 0),
                file: file.to_string(),
                kind: DocKind::CodeComment.label().to_string(),
                section_path: sym.name.clone(),
                heading: Some(sym.name.clone()),
                heading_level: 0,
                range,
                content_hash: content_hash(&text),
                text,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Guide\n\nIntro paragraph with enough words to stand alone as a text segment here.\n\n## Setup\n\nInstall the thing first.\n\n```sh\ncargo install scopegraph\nscopegraph index\n```\n\n| flag | meaning |\n|------|---------|\n| -v   | verbose |\n\n- step one\n- step two\n- step three\n\nClosing remarks for the setup section, long enough not to be a tail merge.\n";

    #[test]
    fn test_line_offsets_round_trip() {
        let text = "alpha\nbeta\ngamma";
        let offsets = LineOffsets::new(text);
        assert_eq!(offsets.line_count(), 3);
        assert_eq!(offsets.line_to_byte(1), 0);
        assert_eq!(offsets.line_to_byte(2), 6);
        assert_eq!(offsets.byte_to_line(0), 1);
        assert_eq!(offsets.byte_to_line(7), 2);
        assert_eq!(offsets.byte_to_line(12), 3);
        assert_eq!(offsets.line_end_byte(1), 5);
        assert_eq!(offsets.line_end_byte(3), text.len());
    }

    #[test]
    fn test_sections_build_heading_trail() {
        let lines: Vec<&str> = DOC.lines().collect();
        let sections = split_sections(&lines);
        let setup = sections.iter().find(|s| s.heading.as_deref() == Some("Setup")).unwrap();
        assert_eq!(setup.path, "Guide > Setup");
        assert_eq!(setup.level, 2);
    }

    #[test]
    fn test_structural_chunking_detects_blocks() {
        let chunks =
            chunk_document("docs/guide.md", DOC, DocKind::Markdown, &ChunkOptions::default());
        assert!(!chunks.is_empty());
        let all_text: String = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n");
        assert!(all_text.contains("cargo install"), "fence kept");
        assert!(all_text.contains("| -v"), "table kept");
        assert!(all_text.contains("- step two"), "list kept");
        for c in &chunks {
            assert!(c.range.start_line >= 1 && c.range.end_line >= c.range.start_line);
        }
    }

    #[test]
    fn test_exclusion_flags_drop_segments() {
        let options = ChunkOptions {
            include_code_blocks: false,
            include_tables: false,
            include_lists: false,
            ..ChunkOptions::default()
        };
        let chunks = chunk_document("docs/guide.md", DOC, DocKind::Markdown, &options);
        let all_text: String = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("\n");
        assert!(!all_text.contains("cargo install"));
        assert!(!all_text.contains("| -v"));
        assert!(!all_text.contains("- step two"));
        assert!(all_text.contains("Install the thing first"));
    }

    #[test]
    fn test_chunk_ids_are_deterministic() {
        let options = ChunkOptions::default();
        let a = chunk_document("docs/guide.md", DOC, DocKind::Markdown, &options);
        let b = chunk_document("docs/guide.md", DOC, DocKind::Markdown, &options);
        assert_eq!(
            a.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
            b.iter().map(|c| c.id.clone()).collect::<Vec<_>>()
        );
        // ids differ per file
        let c = chunk_document("docs/other.md", DOC, DocKind::Markdown, &options);
        assert_ne!(a[0].id, c[0].id);
    }

    #[test]
    fn test_content_hash_tracks_text_only() {
        let a = chunk_document("docs/guide.md", DOC, DocKind::Markdown, &ChunkOptions::default());
        let changed = DOC.replace("Install the thing", "Install the other thing");
        let b =
            chunk_document("docs/guide.md", &changed, DocKind::Markdown, &ChunkOptions::default());
        let a_setup = a.iter().find(|c| c.text.contains("Install the")).unwrap();
        let b_setup = b.iter().find(|c| c.text.contains("Install the")).unwrap();
        assert_ne!(a_setup.content_hash, b_setup.content_hash);
    }

    #[test]
    fn test_fixed_strategy_ignores_structure() {
        let options = ChunkOptions {
            strategy: ChunkStrategy::Fixed,
            target_chunk_chars: 60,
            ..ChunkOptions::default()
        };
        let chunks = chunk_document("docs/guide.md", DOC, DocKind::Markdown, &options);
        assert!(chunks.len() > 3, "small fixed windows produce several chunks");
        for pair in chunks.windows(2) {
            assert!(pair[0].range.end_line < pair[1].range.start_line);
        }
    }

    #[test]
    fn test_heading_strategy_one_chunk_per_section() {
        let options = ChunkOptions { strategy: ChunkStrategy::Heading, ..ChunkOptions::default() };
        let chunks = chunk_document("docs/guide.md", DOC, DocKind::Markdown, &options);
        let paths: Vec<&str> = chunks.iter().map(|c| c.section_path.as_str()).collect();
        assert!(paths.contains(&"Guide"));
        assert!(paths.contains(&"Guide > Setup"));
    }

    #[test]
    fn test_small_tail_merges_into_previous() {
        let doc = "# A\n\nFirst segment that is comfortably long enough to stay on its own here.\n\n- a\n";
        let options = ChunkOptions {
            target_chunk_chars: 75,
            min_section_chars: 40,
            ..ChunkOptions::default()
        };
        let chunks = chunk_document("d.md", doc, DocKind::Markdown, &options);
        assert_eq!(chunks.len(), 1, "tiny list tail merged: {chunks:?}");
        assert!(chunks[0].text.contains("- a"));
    }

    #[test]
    fn test_mdx_normalization_preserves_lines() {
        let mdx = "import Widget from './w'\n\n# Title\n\nText with {props.value} inline.\n<Widget prop={1} />\n";
        let normalized = normalize_mdx(mdx);
        assert_eq!(normalized.lines().count(), mdx.lines().count());
        assert!(!normalized.contains("props.value"));
        assert!(!normalized.contains("import Widget"));
        assert!(normalized.contains("# Title"));

        let chunks = chunk_document("page.mdx", mdx, DocKind::Mdx, &ChunkOptions::default());
        assert!(chunks.iter().all(|c| c.kind == "mdx"));
    }

    #[test]
    fn test_html_headings_survive() {
        let html = "<h1>Overview</h1>\n<p>Some body text that describes the system at length.</p>\n";
        let text = html_to_text(html);
        assert!(text.starts_with("# Overview") || text.contains("# Overview"));
        let chunks = chunk_document("index.html", html, DocKind::Html, &ChunkOptions::default());
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].heading.as_deref(), Some("Overview"));
    }

    #[test]
    fn test_sample_document_head_tail() {
        let lines: Vec<String> = (0..1000).map(|i| format!("line {i:04}")).collect();
        let text = lines.join("\n");
        let (sampled, truncated) = sample_document(&text, 1000, 300, 300);
        assert!(truncated);
        assert!(sampled.len() < text.len());
        assert!(sampled.contains("line 0000"));
        assert!(sampled.contains("line 0999"));
        assert!(sampled.contains('…'));

        let (untouched, t2) = sample_document("short", 1000, 300, 300);
        assert!(!t2);
        assert_eq!(untouched, "short");
    }

    #[test]
    fn test_comment_chunks_from_symbols() {
        use crate::types::{SymbolKind, SymbolRecord};
        let symbols = vec![SymbolRecord {
            file: "src/a.rs".into(),
            name: "run".into(),
            container: None,
            kind: SymbolKind::Function,
            range: SourceRange { start_line: 10, end_line: 20, start_byte: 100, end_byte: 300 },
            signature: "pub fn run()".into(),
            doc: Some("Starts the engine.".into()),
            exported: true,
        }];
        let chunks = comment_chunks("src/a.rs", &symbols);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, "code_comment");
        assert!(chunks[0].text.contains("Starts the engine"));
        assert_eq!(chunks[0].range.start_line, 10);
    }
}
