//! Markdown parsing & chunking.
//!
//! Turns a raw note into anchored chunks plus extracted structure (title,
//! headers, tags, aliases, links). All chunk offsets index into the
//! *sanitised* full text, which is byte-for-byte the same length as the
//! original file, so downstream hydration can re-locate chunks without
//! re-deriving the frontmatter split.

use crate::config::{ANCHOR_HASH_PREFIX_BYTES, CHARS_PER_TOKEN_ESTIMATE};
use crate::model::ChunkMeta;
use sha2::{Digest, Sha256};

/// Where a link was found; carried onto graph edges as provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSource {
    Frontmatter,
    Body,
}

#[derive(Debug, Clone)]
pub struct LinkRef {
    /// Normalised target: alias stripped, anchor removed, percent-decoded,
    /// single leading slash removed. Not yet resolved against the vault.
    pub target: String,
    pub source: LinkSource,
}

#[derive(Debug, Clone)]
pub struct RawChunk {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Default)]
pub struct ParseResult {
    pub title_guess: Option<String>,
    pub headers: Vec<String>,
    pub tags: Vec<String>,
    pub aliases: Vec<String>,
    pub links: Vec<LinkRef>,
    pub chunks: Vec<RawChunk>,
    /// The whole file after sanitisation; same byte length as the input.
    pub sanitised: String,
    /// Offset of the first byte after the closing frontmatter fence
    /// (0 when there is no frontmatter).
    pub body_offset: usize,
    /// SHA-256 hex of the sanitised body, for change detection.
    pub content_hash: String,
}

impl ParseResult {
    pub fn chunk_text(&self, chunk: &RawChunk) -> &str {
        &self.sanitised[chunk.start..chunk.end]
    }

    pub fn chunk_metas(&self) -> Vec<ChunkMeta> {
        self.chunks
            .iter()
            .map(|c| ChunkMeta {
                start: c.start,
                end: c.end,
                anchor_hash: anchor_hash(self.chunk_text(c)),
                token_count: estimate_tokens(self.chunk_text(c)),
            })
            .collect()
    }
}

/// 32-bit DJB2-style fingerprint over at most the first 4096 bytes of a
/// chunk, whitespace included. Used to detect content drift.
pub fn anchor_hash(text: &str) -> u32 {
    let bytes = text.as_bytes();
    let take = bytes.len().min(ANCHOR_HASH_PREFIX_BYTES);
    let mut h: u32 = 5381;
    for &b in &bytes[..take] {
        h = h.wrapping_mul(33) ^ u32::from(b);
    }
    h
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN_ESTIMATE)
}

pub fn content_hash(sanitised_body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sanitised_body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse a complete note. Never fails: pathological inputs yield an empty
/// chunk list while links and metadata are still extracted.
pub fn parse(text: &str, max_chunk_chars: usize, overlap_ratio: f32) -> ParseResult {
    let (frontmatter, body_offset) = split_frontmatter(text);
    let sanitised = sanitise(text);
    let body = &sanitised[body_offset..];

    let mut result = ParseResult {
        body_offset,
        content_hash: content_hash(body),
        ..Default::default()
    };

    if let Some(fm) = frontmatter {
        extract_frontmatter_fields(fm, &mut result);
        // Frontmatter links (`up: "[[Parent]]"` and friends) carry their own
        // provenance so the graph can weight them separately.
        for target in scan_wiki_targets(fm) {
            result.links.push(LinkRef {
                target,
                source: LinkSource::Frontmatter,
            });
        }
    }

    let scan = scan_body(body);
    result.headers = scan.headers;
    for target in scan.links {
        result.links.push(LinkRef {
            target,
            source: LinkSource::Body,
        });
    }
    if result.title_guess.is_none() {
        result.title_guess = scan.first_h1;
    }

    let overlap = ((max_chunk_chars as f32) * overlap_ratio) as usize;
    let mut chunks = Vec::new();
    chunk_segment(body, body_offset, 0, max_chunk_chars.max(1), overlap, &mut chunks);
    // Whitespace-only spans embed to nothing useful; drop them but keep
    // verbatim whitespace inside retained spans.
    chunks.retain(|c: &RawChunk| !sanitised[c.start..c.end].trim().is_empty());
    result.chunks = chunks;
    result.sanitised = sanitised;
    result
}

/// Split the leading YAML frontmatter. A `---` opener without a closing
/// fence is treated as body, so a horizontal rule at the top of a note
/// never swallows the document.
pub fn split_frontmatter(text: &str) -> (Option<&str>, usize) {
    let after_open = if let Some(rest) = text.strip_prefix("---\n") {
        rest
    } else if let Some(rest) = text.strip_prefix("---\r\n") {
        rest
    } else {
        return (None, 0);
    };
    let open_len = text.len() - after_open.len();

    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "---" {
            let fm = &after_open[..offset];
            let body_offset = open_len + offset + line.len();
            return (Some(fm), body_offset);
        }
        offset += line.len();
    }
    (None, 0)
}

/// Replace the payload of every ```compressed-json fenced block (drawing
/// payloads) with spaces, newlines kept, so absolute offsets survive.
pub fn sanitise(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(open) = find_fence_open(rest, "compressed-json") else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..open.block_start]);
        let block_end = find_fence_close(&rest[open.content_start..])
            .map(|rel| open.content_start + rel)
            .unwrap_or(rest.len());
        for ch in rest[open.block_start..block_end].chars() {
            if ch == '\n' || ch == '\r' {
                out.push(ch);
            } else {
                // Multi-byte chars pad with one space per byte.
                for _ in 0..ch.len_utf8() {
                    out.push(' ');
                }
            }
        }
        rest = &rest[block_end..];
    }
    debug_assert_eq!(out.len(), text.len());
    out
}

struct FenceOpen {
    block_start: usize,
    content_start: usize,
}

fn find_fence_open(text: &str, lang: &str) -> Option<FenceOpen> {
    let mut line_start = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if let Some(info) = trimmed.strip_prefix("```") {
            if info.trim() == lang {
                return Some(FenceOpen {
                    block_start: line_start,
                    content_start: line_start + line.len(),
                });
            }
        }
        line_start += line.len();
    }
    None
}

/// Offset just past the closing fence line, relative to the given text.
fn find_fence_close(text: &str) -> Option<usize> {
    let mut line_start = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.starts_with("```") && trimmed.trim_end_matches('`').is_empty() {
            return Some(line_start + line.len());
        }
        line_start += line.len();
    }
    None
}

// ---------------------------------------------------------------------------
// Frontmatter fields
// ---------------------------------------------------------------------------

fn extract_frontmatter_fields(fm: &str, result: &mut ParseResult) {
    let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(fm) else {
        return;
    };
    let Some(map) = value.as_mapping() else {
        return;
    };

    if let Some(title) = map.get("title").and_then(|v| v.as_str()) {
        let title = title.trim();
        if !title.is_empty() {
            result.title_guess = Some(title.to_string());
        }
    }
    result.tags = yaml_string_list(map.get("tags"));
    result.aliases = yaml_string_list(map.get("aliases"));
}

fn yaml_string_list(value: Option<&serde_yaml::Value>) -> Vec<String> {
    match value {
        Some(serde_yaml::Value::String(s)) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Some(serde_yaml::Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Body scanner
// ---------------------------------------------------------------------------

struct BodyScan {
    headers: Vec<String>,
    first_h1: Option<String>,
    links: Vec<String>,
}

/// Stateful single-pass scan of the body: collects headers and link targets
/// while honouring escapes, inline code spans with matched backtick runs,
/// and fenced code blocks.
fn scan_body(body: &str) -> BodyScan {
    let bytes = body.as_bytes();
    let len = bytes.len();
    let mut scan = BodyScan {
        headers: Vec::new(),
        first_h1: None,
        links: Vec::new(),
    };

    let mut i = 0;
    let mut at_line_start = true;
    let mut fence_len: Option<usize> = None;

    while i < len {
        if at_line_start {
            let run = backtick_run(bytes, i);
            if run >= 3 {
                match fence_len {
                    Some(open) if run >= open => fence_len = None,
                    Some(_) => {}
                    None => fence_len = Some(run),
                }
                i = skip_to_next_line(bytes, i);
                continue;
            }
            if fence_len.is_none() && bytes[i] == b'#' {
                if let Some((text, next, level)) = parse_header_line(body, i) {
                    if level == 1 && scan.first_h1.is_none() {
                        scan.first_h1 = Some(text.clone());
                    }
                    scan.headers.push(text);
                    i = next;
                    at_line_start = true;
                    continue;
                }
            }
        }

        if fence_len.is_some() {
            i = skip_to_next_line(bytes, i);
            at_line_start = true;
            continue;
        }

        at_line_start = false;
        match bytes[i] {
            b'\n' => {
                i += 1;
                at_line_start = true;
            }
            b'\\' => {
                // Escape swallows exactly one following char.
                i += 1;
                i += body[i..].chars().next().map_or(0, char::len_utf8);
            }
            b'`' => {
                let run = backtick_run(bytes, i);
                match find_code_span_close(bytes, i + run, run) {
                    Some(close_end) => i = close_end,
                    None => i += run,
                }
            }
            b'[' if i + 1 < len && bytes[i + 1] == b'[' => {
                match parse_wiki_link(body, i) {
                    Some((target, next)) => {
                        if let Some(t) = normalise_link_target(&target) {
                            scan.links.push(t);
                        }
                        i = next;
                    }
                    None => i += 2,
                }
            }
            b'[' => match parse_markdown_link(body, i) {
                Some((url, next)) => {
                    if !is_external_url(&url) {
                        if let Some(t) = normalise_link_target(&url) {
                            scan.links.push(t);
                        }
                    }
                    i = next;
                }
                None => i += 1,
            },
            _ => {
                i += body[i..].chars().next().map_or(1, char::len_utf8);
            }
        }
    }
    scan
}

/// Wiki-link targets only, used for the frontmatter region where markdown
/// links and code spans do not occur.
fn scan_wiki_targets(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'[' && bytes[i + 1] == b'[' {
            match parse_wiki_link(text, i) {
                Some((target, next)) => {
                    if let Some(t) = normalise_link_target(&target) {
                        out.push(t);
                    }
                    i = next;
                }
                None => i += 2,
            }
        } else {
            i += 1;
        }
    }
    out
}

fn backtick_run(bytes: &[u8], i: usize) -> usize {
    bytes[i..].iter().take_while(|&&b| b == b'`').count()
}

fn skip_to_next_line(bytes: &[u8], i: usize) -> usize {
    match bytes[i..].iter().position(|&b| b == b'\n') {
        Some(pos) => i + pos + 1,
        None => bytes.len(),
    }
}

/// Find a closing backtick run of exactly `open` length. Returns the offset
/// just past the closing run.
fn find_code_span_close(bytes: &[u8], mut i: usize, open: usize) -> Option<usize> {
    while i < bytes.len() {
        if bytes[i] == b'`' {
            let run = backtick_run(bytes, i);
            if run == open {
                return Some(i + run);
            }
            i += run;
        } else {
            i += 1;
        }
    }
    None
}

fn parse_header_line(body: &str, start: usize) -> Option<(String, usize, usize)> {
    let bytes = body.as_bytes();
    let mut level = 0;
    let mut i = start;
    while i < bytes.len() && bytes[i] == b'#' && level < 6 {
        level += 1;
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b' ' {
        return None;
    }
    let line_end = skip_to_next_line(bytes, i);
    let text = body[i..line_end].trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some((text, line_end, level))
}

/// `[[Target|Alias]]`, alias dropped. A newline inside the brackets rejects
/// the link. Returns (raw target, offset past `]]`).
fn parse_wiki_link(body: &str, start: usize) -> Option<(String, usize)> {
    let inner_start = start + 2;
    let rest = &body[inner_start..];
    let close = rest.find("]]")?;
    let inner = &rest[..close];
    if inner.contains('\n') || inner.is_empty() {
        return None;
    }
    let target = inner.split('|').next().unwrap_or(inner);
    Some((target.to_string(), inner_start + close + 2))
}

/// `[text](url)`. Returns (raw url, offset past `)`), leaving external-URL
/// filtering to the caller.
fn parse_markdown_link(body: &str, start: usize) -> Option<(String, usize)> {
    let bytes = body.as_bytes();
    let mut i = start + 1;
    let mut depth = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
        i += 1;
    }
    if i >= bytes.len() || depth != 0 {
        return None;
    }
    let paren = i + 1;
    if paren >= bytes.len() || bytes[paren] != b'(' {
        return None;
    }
    let rest = &body[paren + 1..];
    let close = rest.find(')')?;
    Some((rest[..close].to_string(), paren + 1 + close + 1))
}

/// True for `scheme:`-prefixed targets (http, https, mailto, obsidian, ...).
fn is_external_url(url: &str) -> bool {
    let mut chars = url.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    for c in chars {
        if c == ':' {
            return true;
        }
        if !(c.is_ascii_alphanumeric() || c == '+' || c == '.' || c == '-') {
            return false;
        }
    }
    false
}

/// Normalise a raw link target: strip `#anchor`, percent-decode, strip a
/// single leading `/`. Returns None for empty or anchor-only targets.
fn normalise_link_target(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let without_anchor = raw.split('#').next().unwrap_or(raw);
    let decoded = percent_decode(without_anchor);
    let stripped = decoded.strip_prefix('/').unwrap_or(&decoded);
    let stripped = stripped.trim();
    if stripped.is_empty() {
        return None;
    }
    Some(stripped.to_string())
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &input[i + 1..i + 3];
            if let Ok(v) = u8::from_str_radix(hex, 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}

// ---------------------------------------------------------------------------
// Recursive chunking
// ---------------------------------------------------------------------------

/// Split levels tried in order: paragraphs, sentences, whitespace, chars.
const SPLIT_LEVELS: usize = 4;

/// Greedily pack same-level segments into windows of at most `max` bytes,
/// recursing one level down for any single segment that alone exceeds the
/// budget. Consecutive windows share roughly `overlap` bytes, realigned to
/// segment boundaries. Emitted spans are verbatim sub-slices of the body,
/// surrounding whitespace included.
fn chunk_segment(
    text: &str,
    base: usize,
    level: usize,
    max: usize,
    overlap: usize,
    out: &mut Vec<RawChunk>,
) {
    if text.is_empty() {
        return;
    }
    if text.len() <= max {
        out.push(RawChunk {
            start: base,
            end: base + text.len(),
        });
        return;
    }
    if level >= SPLIT_LEVELS - 1 {
        chunk_by_chars(text, base, max, overlap, out);
        return;
    }

    let segments = segment_ranges(text, level);
    if segments.len() <= 1 {
        chunk_segment(text, base, level + 1, max, overlap, out);
        return;
    }

    let mut window: Vec<(usize, usize)> = Vec::new();
    let mut window_len = 0usize;

    for (seg_start, seg_end) in segments {
        let seg_len = seg_end - seg_start;
        if seg_len > max {
            flush_window(&mut window, &mut window_len, base, out);
            chunk_segment(&text[seg_start..seg_end], base + seg_start, level + 1, max, overlap, out);
            continue;
        }
        if window_len + seg_len > max && !window.is_empty() {
            let flushed_start = window[0].0;
            let flushed_end = window.last().unwrap().1;
            out.push(RawChunk {
                start: base + flushed_start,
                end: base + flushed_end,
            });
            // Keep the trailing segments that cover the overlap budget.
            let mut kept = Vec::new();
            let mut kept_len = 0;
            for &(s, e) in window.iter().rev() {
                if kept_len >= overlap {
                    break;
                }
                kept_len += e - s;
                kept.push((s, e));
            }
            kept.reverse();
            // Overlap must leave room for the incoming segment.
            while kept_len + seg_len > max && !kept.is_empty() {
                let (s, e) = kept.remove(0);
                kept_len -= e - s;
            }
            window = kept;
            window_len = kept_len;
        }
        window.push((seg_start, seg_end));
        window_len += seg_len;
    }
    flush_window(&mut window, &mut window_len, base, out);
}

fn flush_window(
    window: &mut Vec<(usize, usize)>,
    window_len: &mut usize,
    base: usize,
    out: &mut Vec<RawChunk>,
) {
    if let (Some(&(start, _)), Some(&(_, end))) = (window.first(), window.last()) {
        out.push(RawChunk {
            start: base + start,
            end: base + end,
        });
    }
    window.clear();
    *window_len = 0;
}

/// Contiguous segment ranges at the given level; their concatenation is the
/// whole text, so no byte escapes the chunker.
fn segment_ranges(text: &str, level: usize) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut boundaries = Vec::new();
    match level {
        // Paragraphs: boundary after each blank-line run.
        0 => {
            let mut i = 0;
            while i + 1 < bytes.len() {
                if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
                    let mut j = i + 1;
                    while j < bytes.len() && bytes[j] == b'\n' {
                        j += 1;
                    }
                    boundaries.push(j);
                    i = j;
                } else {
                    i += 1;
                }
            }
        }
        // Sentences: boundary after `.`/`!`/`?` followed by whitespace.
        1 => {
            let mut i = 0;
            while i + 1 < bytes.len() {
                if matches!(bytes[i], b'.' | b'!' | b'?')
                    && matches!(bytes[i + 1], b' ' | b'\n' | b'\t')
                {
                    boundaries.push(i + 2);
                    i += 2;
                } else {
                    i += 1;
                }
            }
        }
        // Whitespace: boundary after each whitespace run.
        _ => {
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i].is_ascii_whitespace() {
                    let mut j = i;
                    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if j < bytes.len() {
                        boundaries.push(j);
                    }
                    i = j;
                } else {
                    i += 1;
                }
            }
        }
    }

    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0;
    for b in boundaries {
        if b > start && b < text.len() && text.is_char_boundary(b) {
            ranges.push((start, b));
            start = b;
        }
    }
    if start < text.len() {
        ranges.push((start, text.len()));
    }
    ranges
}

/// Last resort: fixed-size windows on char boundaries with a plain overlap
/// step.
fn chunk_by_chars(text: &str, base: usize, max: usize, overlap: usize, out: &mut Vec<RawChunk>) {
    let step = max.saturating_sub(overlap).max(1);
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + max).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        out.push(RawChunk {
            start: base + start,
            end: base + end,
        });
        if end == text.len() {
            break;
        }
        let mut next = start + step;
        while next < text.len() && !text.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_split_basic() {
        let text = "---\ntitle: Hello\n---\nBody starts here";
        let (fm, offset) = split_frontmatter(text);
        assert_eq!(fm, Some("title: Hello\n"));
        assert_eq!(&text[offset..], "Body starts here");
    }

    #[test]
    fn leading_rule_without_close_is_body() {
        let text = "---\njust a horizontal rule, never closed";
        let (fm, offset) = split_frontmatter(text);
        assert!(fm.is_none());
        assert_eq!(offset, 0);
    }

    #[test]
    fn sanitise_preserves_length_and_offsets() {
        let text = "before\n```compressed-json\n{\"big\":\"blob\"}\n```\nafter";
        let clean = sanitise(text);
        assert_eq!(clean.len(), text.len());
        assert!(clean.ends_with("after"));
        assert!(clean.starts_with("before\n"));
        assert!(!clean.contains("blob"));
        // Newlines survive so line structure is intact.
        assert_eq!(
            clean.matches('\n').count(),
            text.matches('\n').count()
        );
    }

    #[test]
    fn wiki_link_alias_dropped() {
        let result = parse("See [[Target Note|an alias]] here", 2000, 0.1);
        let targets: Vec<&str> = result.links.iter().map(|l| l.target.as_str()).collect();
        assert_eq!(targets, vec!["Target Note"]);
    }

    #[test]
    fn wiki_link_newline_rejected() {
        let result = parse("bad [[Tar\nget]] link", 2000, 0.1);
        assert!(result.links.is_empty());
    }

    #[test]
    fn wiki_link_anchor_and_percent() {
        let result = parse("[[/Sub%20dir/Note#Section]]", 2000, 0.1);
        assert_eq!(result.links[0].target, "Sub dir/Note");
    }

    #[test]
    fn markdown_link_external_skipped() {
        let result = parse(
            "[site](https://example.com) [mail](mailto:a@b.c) [local](notes/other.md)",
            2000,
            0.1,
        );
        let targets: Vec<&str> = result.links.iter().map(|l| l.target.as_str()).collect();
        assert_eq!(targets, vec!["notes/other.md"]);
    }

    #[test]
    fn links_inside_code_ignored() {
        let text = "`[[NotALink]]` and ``code with ` tick [[AlsoNot]]`` but [[Real]]\n```\n[[Fenced]]\n```\n";
        let result = parse(text, 2000, 0.1);
        let targets: Vec<&str> = result.links.iter().map(|l| l.target.as_str()).collect();
        assert_eq!(targets, vec!["Real"]);
    }

    #[test]
    fn escape_swallows_bracket() {
        let result = parse(r"\[[NotALink]] then [[Yes]]", 2000, 0.1);
        let targets: Vec<&str> = result.links.iter().map(|l| l.target.as_str()).collect();
        assert_eq!(targets, vec!["Yes"]);
    }

    #[test]
    fn frontmatter_links_carry_provenance() {
        let text = "---\nup: \"[[Parent]]\"\n---\nBody [[Child]]";
        let result = parse(text, 2000, 0.1);
        assert_eq!(result.links.len(), 2);
        assert_eq!(result.links[0].target, "Parent");
        assert_eq!(result.links[0].source, LinkSource::Frontmatter);
        assert_eq!(result.links[1].source, LinkSource::Body);
    }

    #[test]
    fn frontmatter_fields_extracted() {
        let text = "---\ntitle: My Note\ntags: [alpha, beta]\naliases:\n  - Other Name\n---\n# Heading\nBody";
        let result = parse(text, 2000, 0.1);
        assert_eq!(result.title_guess.as_deref(), Some("My Note"));
        assert_eq!(result.tags, vec!["alpha", "beta"]);
        assert_eq!(result.aliases, vec!["Other Name"]);
        assert_eq!(result.headers, vec!["Heading"]);
    }

    #[test]
    fn title_falls_back_to_first_h1() {
        let result = parse("# The Title\n\nBody text", 2000, 0.1);
        assert_eq!(result.title_guess.as_deref(), Some("The Title"));
    }

    #[test]
    fn chunk_offsets_are_file_relative() {
        let text = "---\ntitle: T\n---\nHello world body";
        let result = parse(text, 2000, 0.1);
        assert_eq!(result.chunks.len(), 1);
        let c = &result.chunks[0];
        assert_eq!(&result.sanitised[c.start..c.end], "Hello world body");
        assert_eq!(c.start, result.body_offset);
    }

    #[test]
    fn anchor_hash_matches_slice() {
        let text = "some body with a few words in it";
        let result = parse(text, 2000, 0.1);
        for (meta, raw) in result.chunk_metas().iter().zip(&result.chunks) {
            assert_eq!(meta.anchor_hash, anchor_hash(&result.sanitised[raw.start..raw.end]));
        }
    }

    #[test]
    fn chunks_sorted_and_bounded() {
        let para = "word ".repeat(200);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let result = parse(&text, 300, 0.1);
        assert!(result.chunks.len() > 1);
        let mut prev_start = 0;
        for c in &result.chunks {
            assert!(c.start >= prev_start || prev_start == 0);
            assert!(c.end - c.start <= 300);
            prev_start = c.start;
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "word ".repeat(400);
        let result = parse(&text, 200, 0.2);
        assert!(result.chunks.len() > 2);
        for pair in result.chunks.windows(2) {
            // Overlap means the next chunk starts before the previous ends.
            assert!(pair[1].start <= pair[0].end);
            assert!(pair[1].start > pair[0].start);
        }
    }

    #[test]
    fn empty_body_produces_no_chunks() {
        let result = parse("---\ntitle: Empty\n---\n", 2000, 0.1);
        assert!(result.chunks.is_empty());
        assert_eq!(result.title_guess.as_deref(), Some("Empty"));
    }

    #[test]
    fn oversized_sentence_falls_through_to_chars() {
        let text = "x".repeat(5000);
        let result = parse(&text, 1000, 0.1);
        assert!(!result.chunks.is_empty());
        for c in &result.chunks {
            assert!(c.end - c.start <= 1000);
        }
        assert_eq!(result.chunks.last().unwrap().end, 5000);
    }

    #[test]
    fn multibyte_content_keeps_char_boundaries() {
        let text = "héllo wörld ".repeat(300);
        let result = parse(&text, 100, 0.1);
        for c in &result.chunks {
            // Slicing must not panic.
            let _ = &result.sanitised[c.start..c.end];
        }
    }
}
