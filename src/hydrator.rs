//! Result hydration.
//!
//! Stored chunk offsets age: the note may have been edited since index
//! time. The hydrator re-reads the live file, applies the same
//! sanitisation as the chunker so offsets stay comparable, and verifies
//! the anchor hash before emitting an excerpt. A mismatch triggers a
//! bounded sliding-window search; beyond that the result is flagged as
//! drifted and the document queued for re-indexing. Ranking is never
//! altered here — only excerpts are rewritten.

use crate::config::HYDRATION_SEARCH_RANGE;
use crate::fsadapter::FsAdapter;
use crate::model::{HydrationStatus, ScoredRef};
use crate::parser::{anchor_hash, sanitise};
use std::collections::HashMap;

/// Display cap applied after trimming.
const EXCERPT_MAX_CHARS: usize = 500;

const DRIFT_PLACEHOLDER: &str = "[content changed since indexing]";

#[derive(Debug, Clone)]
pub struct HydratedChunk {
    pub path: String,
    pub score: f32,
    pub excerpt: String,
    pub start: usize,
    pub end: usize,
    pub status: HydrationStatus,
}

#[derive(Debug, Default)]
pub struct HydrationOutcome {
    pub chunks: Vec<HydratedChunk>,
    /// Paths whose anchors could not be located; callers enqueue these for
    /// background re-indexing.
    pub drifted_paths: Vec<String>,
}

pub fn hydrate(fs: &dyn FsAdapter, refs: &[ScoredRef]) -> HydrationOutcome {
    let mut outcome = HydrationOutcome::default();
    // One read + sanitise per distinct file, shared across its chunks.
    let mut cache: HashMap<String, Option<String>> = HashMap::new();

    for r in refs {
        let sanitised = cache
            .entry(r.path.clone())
            .or_insert_with(|| fs.read(&r.path).ok().map(|text| sanitise(&text)));

        let hydrated = match sanitised {
            Some(text) => hydrate_one(r, text),
            None => drifted(r),
        };
        if hydrated.status == HydrationStatus::Drifted
            && !outcome.drifted_paths.contains(&r.path)
        {
            outcome.drifted_paths.push(r.path.clone());
        }
        outcome.chunks.push(hydrated);
    }
    outcome
}

fn hydrate_one(r: &ScoredRef, sanitised: &str) -> HydratedChunk {
    if in_bounds(sanitised, r.start, r.end) {
        let slice = &sanitised[r.start..r.end];
        if anchor_hash(slice) == r.anchor_hash {
            return HydratedChunk {
                path: r.path.clone(),
                score: r.score,
                excerpt: display_excerpt(slice),
                start: r.start,
                end: r.end,
                status: HydrationStatus::Exact,
            };
        }
    }

    if let Some((start, end)) = heal(r, sanitised) {
        return HydratedChunk {
            path: r.path.clone(),
            score: r.score,
            excerpt: display_excerpt(&sanitised[start..end]),
            start,
            end,
            status: HydrationStatus::Healed,
        };
    }

    drifted(r)
}

/// Slides a window of the original chunk length over
/// `[start - RANGE, end + RANGE]` looking for bytes with the stored anchor.
fn heal(r: &ScoredRef, sanitised: &str) -> Option<(usize, usize)> {
    let window = r.end.checked_sub(r.start)?;
    if window == 0 || window > sanitised.len() {
        return None;
    }
    let lo = r.start.saturating_sub(HYDRATION_SEARCH_RANGE);
    let hi = (r.end + HYDRATION_SEARCH_RANGE)
        .min(sanitised.len())
        .checked_sub(window)?;
    for offset in lo..=hi {
        if !in_bounds(sanitised, offset, offset + window) {
            continue;
        }
        if anchor_hash(&sanitised[offset..offset + window]) == r.anchor_hash {
            return Some((offset, offset + window));
        }
    }
    None
}

fn in_bounds(text: &str, start: usize, end: usize) -> bool {
    start <= end && end <= text.len() && text.is_char_boundary(start) && text.is_char_boundary(end)
}

fn drifted(r: &ScoredRef) -> HydratedChunk {
    HydratedChunk {
        path: r.path.clone(),
        score: r.score,
        excerpt: DRIFT_PLACEHOLDER.to_string(),
        start: r.start,
        end: r.end,
        status: HydrationStatus::Drifted,
    }
}

fn display_excerpt(slice: &str) -> String {
    let trimmed = slice.trim();
    if trimmed.chars().count() <= EXCERPT_MAX_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(EXCERPT_MAX_CHARS).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsadapter::VaultFs;
    use crate::parser;
    use tempfile::TempDir;

    fn vault_with(files: &[(&str, &str)]) -> (TempDir, VaultFs) {
        let dir = TempDir::new().unwrap();
        let fs = VaultFs::new(dir.path());
        for (path, content) in files {
            fs.write(path, content.as_bytes()).unwrap();
        }
        (dir, fs)
    }

    fn scored(path: &str, start: usize, end: usize, text: &str) -> ScoredRef {
        ScoredRef {
            path: path.to_string(),
            start,
            end,
            anchor_hash: anchor_hash(text),
            score: 0.9,
        }
    }

    #[test]
    fn exact_anchor_hydrates_trimmed_excerpt() {
        let (_dir, fs) = vault_with(&[("b.md", "before  spaced  after")]);
        let r = scored("b.md", 6, 16, "  spaced  ");
        let outcome = hydrate(&fs, &[r]);
        assert_eq!(outcome.chunks[0].status, HydrationStatus::Exact);
        assert_eq!(outcome.chunks[0].excerpt, "spaced");
        assert!(outcome.drifted_paths.is_empty());
    }

    #[test]
    fn shifted_content_is_healed() {
        let original = "alpha beta gamma delta";
        let r = scored("c.md", 6, 16, &original[6..16]);
        // Insert a prefix so the chunk slides right but stays in range.
        let (_dir, fs) = vault_with(&[("c.md", "XX alpha beta gamma delta")]);
        let outcome = hydrate(&fs, &[r]);
        let chunk = &outcome.chunks[0];
        assert_eq!(chunk.status, HydrationStatus::Healed);
        assert_eq!(chunk.excerpt, "beta gamma");
        assert_eq!(chunk.start, 9);
        assert!(outcome.drifted_paths.is_empty());
    }

    #[test]
    fn rewritten_content_is_flagged_drifted() {
        let r = scored("d.md", 0, 10, "old conten");
        let (_dir, fs) = vault_with(&[("d.md", "entirely different words now")]);
        let outcome = hydrate(&fs, &[r]);
        assert_eq!(outcome.chunks[0].status, HydrationStatus::Drifted);
        assert_eq!(outcome.drifted_paths, vec!["d.md".to_string()]);
        // Ranking payload is untouched.
        assert_eq!(outcome.chunks[0].score, 0.9);
    }

    #[test]
    fn missing_file_is_drifted_not_error() {
        let (_dir, fs) = vault_with(&[]);
        let r = scored("gone.md", 0, 5, "hello");
        let outcome = hydrate(&fs, &[r]);
        assert_eq!(outcome.chunks[0].status, HydrationStatus::Drifted);
        assert_eq!(outcome.drifted_paths, vec!["gone.md".to_string()]);
    }

    #[test]
    fn frontmatter_title_collision_resolves_to_body() {
        let content = "---\ntitle: My Header\n---\n\n# My Header\nActual Body";
        let (_dir, fs) = vault_with(&[("c.md", content)]);
        let parsed = parser::parse(content, 2000, 0.1);
        // Anchor the chunk that contains the body heading.
        let chunk = parsed
            .chunks
            .iter()
            .find(|c| parsed.sanitised[c.start..c.end].contains("# My Header"))
            .expect("body chunk");
        let r = ScoredRef {
            path: "c.md".into(),
            start: chunk.start,
            end: chunk.end,
            anchor_hash: anchor_hash(&parsed.sanitised[chunk.start..chunk.end]),
            score: 1.0,
        };
        let outcome = hydrate(&fs, &[r]);
        let hydrated = &outcome.chunks[0];
        assert_eq!(hydrated.status, HydrationStatus::Exact);
        // The excerpt comes from the body occurrence, past the frontmatter.
        assert!(hydrated.start >= parsed.body_offset);
        assert!(hydrated.excerpt.contains("My Header"));
        assert!(hydrated.excerpt.contains("Actual Body"));
    }

    #[test]
    fn hydration_preserves_input_order() {
        let (_dir, fs) = vault_with(&[("a.md", "one two three")]);
        let refs = vec![
            scored("a.md", 8, 13, "three"),
            scored("a.md", 0, 3, "one"),
        ];
        let outcome = hydrate(&fs, &refs);
        assert_eq!(outcome.chunks[0].excerpt, "three");
        assert_eq!(outcome.chunks[1].excerpt, "one");
    }

    #[test]
    fn sanitised_drawing_block_keeps_offsets_valid() {
        let content = "intro\n```compressed-json\n{\"x\":1}\n```\ntail text";
        let (_dir, fs) = vault_with(&[("e.md", content)]);
        let parsed = parser::parse(content, 2000, 0.1);
        let refs: Vec<ScoredRef> = parsed
            .chunks
            .iter()
            .map(|c| ScoredRef {
                path: "e.md".into(),
                start: c.start,
                end: c.end,
                anchor_hash: anchor_hash(&parsed.sanitised[c.start..c.end]),
                score: 0.5,
            })
            .collect();
        let outcome = hydrate(&fs, &refs);
        assert!(outcome
            .chunks
            .iter()
            .all(|c| c.status == HydrationStatus::Exact));
    }
}
