//! Graph-augmented relevance scoring (GARS).
//!
//! Two query modes share the retrieval plumbing. Reflex is keyword-
//! dominant and never touches the graph; deep pools vector and keyword
//! candidates, expands one hop from the strongest seeds, then blends
//! similarity, centrality and spreading activation into one composite:
//!
//!   score = wσ·σ + wκ·κ + wα·α + B_hybrid·[vector ∧ keyword]
//!                               + B_title·[title match]
//!
//! A symmetric noise floor drops any candidate whose strongest signal is
//! below `VECTOR_MIN_RELEVANCE`; the caller's min-score cut-off only ever
//! sees the final composite.

use crate::config::{
    ABSOLUTE_MIN_EXPANSION_SCORE, ACTIVATION_DECAY, EXPANSION_THRESHOLD, FUZZY_HIT_MULTIPLIER,
    FUZZY_SCORE_CAP, HYBRID_BOOST, MAX_EXPANSION_SEEDS, MAX_NEIGHBORS_PER_NODE,
    SHORT_QUERY_BASE_SCORE, SHORT_QUERY_TOKEN_LIMIT, TITLE_MATCH_BOOST, VECTOR_MIN_RELEVANCE,
    WEIGHT_ACTIVATION, WEIGHT_CENTRALITY, WEIGHT_SIMILARITY,
};
use crate::error::{EngineError, EngineResult};
use crate::graph::GraphStore;
use crate::keyword::KeywordDocHits;
use crate::model::{DocumentMeta, NeighborDirection, NeighborMode};
use crate::vector::{VectorHit, VectorIndex};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

pub struct ScorerContext<'a> {
    pub vectors: &'a VectorIndex,
    pub graph: &'a GraphStore,
    pub docs: &'a HashMap<String, DocumentMeta>,
    pub ontology_folder: &'a str,
}

#[derive(Debug, Clone)]
pub struct ScoredDoc {
    pub path: String,
    pub score: f32,
    /// Chunk id backing the excerpt, when a vector hit supplied one.
    pub best_chunk: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct Candidate {
    similarity: f32,
    keyword: f32,
    activation: f32,
    centrality: f32,
    title_match: bool,
    best_chunk: Option<String>,
}

/// Maps keyword hit counts onto the fuzzy score: short queries get the
/// flat fuzzy base, long queries accumulate hits up to the cap.
fn keyword_score(hits: &KeywordDocHits, token_count: usize) -> f32 {
    if hits.hits == 0 && !hits.title_match {
        return 0.0;
    }
    if token_count < SHORT_QUERY_TOKEN_LIMIT {
        SHORT_QUERY_BASE_SCORE
    } else {
        (hits.hits as f32 * FUZZY_HIT_MULTIPLIER).min(FUZZY_SCORE_CAP)
    }
}

/// Fold chunk-level vector hits into per-document best scores.
fn fold_vector_hits(vector_hits: &[VectorHit]) -> HashMap<String, (f32, String)> {
    let mut best: HashMap<String, (f32, String)> = HashMap::new();
    for hit in vector_hits {
        match best.get(&hit.path) {
            Some((score, _)) if *score >= hit.score => {}
            _ => {
                best.insert(hit.path.clone(), (hit.score, hit.chunk_id.clone()));
            }
        }
    }
    best
}

/// Reflex mode: keyword matching plus the budgeted vector scan, no graph
/// work at all.
pub fn reflex_search(
    ctx: &ScorerContext,
    keyword_hits: &HashMap<String, KeywordDocHits>,
    vector_hits: &[VectorHit],
    token_count: usize,
    k: usize,
    min_score: f32,
) -> Vec<ScoredDoc> {
    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    for (path, hits) in keyword_hits {
        let entry = candidates.entry(path.clone()).or_default();
        entry.keyword = keyword_score(hits, token_count);
        entry.title_match = hits.title_match;
    }
    for (path, (score, chunk_id)) in fold_vector_hits(vector_hits) {
        let entry = candidates.entry(path).or_default();
        entry.similarity = score;
        entry.best_chunk = Some(chunk_id);
    }

    let mut scored: Vec<ScoredDoc> = candidates
        .into_iter()
        .filter(|(_, c)| c.similarity.max(c.keyword) >= VECTOR_MIN_RELEVANCE)
        .map(|(path, c)| {
            let mut score = c.similarity.max(c.keyword);
            if c.similarity > 0.0 && c.keyword > 0.0 {
                score += HYBRID_BOOST;
            }
            if c.title_match {
                score += TITLE_MATCH_BOOST;
            }
            ScoredDoc {
                path,
                score: score.min(1.0),
                best_chunk: c.best_chunk,
            }
        })
        .filter(|d| d.score >= min_score)
        .collect();
    rank(ctx, &mut scored);
    scored.truncate(k);
    scored
}

/// Deep mode. The cancellation token is observed between the pooling,
/// expansion and scoring phases.
pub fn deep_search(
    ctx: &ScorerContext,
    keyword_hits: &HashMap<String, KeywordDocHits>,
    vector_hits: &[VectorHit],
    token_count: usize,
    k: usize,
    min_score: f32,
    cancel: &CancellationToken,
) -> EngineResult<Vec<ScoredDoc>> {
    // Phase 1: pool candidates from both retrievers.
    let mut candidates: HashMap<String, Candidate> = HashMap::new();
    for (path, hits) in keyword_hits {
        let entry = candidates.entry(path.clone()).or_default();
        entry.keyword = keyword_score(hits, token_count);
        entry.title_match = hits.title_match;
    }
    for (path, (score, chunk_id)) in fold_vector_hits(vector_hits) {
        let entry = candidates.entry(path).or_default();
        entry.similarity = score;
        entry.best_chunk = Some(chunk_id);
    }
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    check_cancelled(cancel)?;

    // Phase 2: seed selection and one-hop expansion.
    let mut pooled: Vec<(String, f32)> = candidates
        .iter()
        .map(|(path, c)| (path.clone(), c.similarity.max(c.keyword)))
        .collect();
    pooled.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let top_score = pooled.first().map(|(_, s)| *s).unwrap_or(0.0);
    let seeds: Vec<(String, f32)> = pooled
        .into_iter()
        .filter(|(_, s)| {
            *s >= ABSOLUTE_MIN_EXPANSION_SCORE && *s >= EXPANSION_THRESHOLD * top_score
        })
        .take(MAX_EXPANSION_SEEDS)
        .collect();

    let seed_top = seeds.first().map(|(_, s)| *s).unwrap_or(0.0);
    for (seed_path, seed_score) in &seeds {
        let seed_activation = if seed_top > 0.0 {
            seed_score / seed_top
        } else {
            0.0
        };
        {
            let entry = candidates.entry(seed_path.clone()).or_default();
            entry.activation = entry.activation.max(seed_activation);
        }
        let neighbors = ctx.graph.neighbors(
            seed_path,
            NeighborDirection::Both,
            NeighborMode::Simple,
            ctx.ontology_folder,
            MAX_NEIGHBORS_PER_NODE,
        );
        for neighbor in neighbors {
            let spread = seed_activation * neighbor.score * ACTIVATION_DECAY;
            let entry = candidates.entry(neighbor.path).or_default();
            entry.activation = (entry.activation.max(spread)).clamp(0.0, 1.0);
        }
    }
    check_cancelled(cancel)?;

    // Phase 3: centrality, floor, composite.
    let paths: Vec<String> = candidates.keys().cloned().collect();
    let raw_centrality = ctx.graph.batch_centrality(&paths, ctx.ontology_folder);
    let max_centrality = raw_centrality.iter().copied().fold(0.0f32, f32::max);
    for (path, raw) in paths.iter().zip(raw_centrality) {
        if let Some(c) = candidates.get_mut(path) {
            c.centrality = if max_centrality > 0.0 {
                raw / max_centrality
            } else {
                0.0
            };
        }
    }

    let mut scored: Vec<ScoredDoc> = candidates
        .into_iter()
        .filter(|(_, c)| {
            c.similarity
                .max(c.centrality)
                .max(c.activation)
                .max(c.keyword)
                >= VECTOR_MIN_RELEVANCE
        })
        .map(|(path, c)| {
            let mut score = WEIGHT_SIMILARITY * c.similarity
                + WEIGHT_CENTRALITY * c.centrality
                + WEIGHT_ACTIVATION * c.activation;
            if c.similarity > 0.0 && c.keyword > 0.0 {
                score += HYBRID_BOOST;
            }
            if c.title_match {
                score += TITLE_MATCH_BOOST;
            }
            ScoredDoc {
                path,
                score: score.min(1.0),
                best_chunk: c.best_chunk,
            }
        })
        .filter(|d| d.score >= min_score)
        .collect();
    rank(ctx, &mut scored);
    scored.truncate(k);
    Ok(scored)
}

/// Graph-enhanced similar-to-seed: the vector top unioned with the seed's
/// one-hop neighbourhood. Overlap earns the hybrid boost; pure neighbours
/// ride on their edge weight and drop below the noise floor.
pub fn similar_to_seed(
    ctx: &ScorerContext,
    seed_path: &str,
    vector_hits: &[VectorHit],
    k: usize,
    min_score: f32,
) -> Vec<ScoredDoc> {
    let by_vector = fold_vector_hits(vector_hits);
    let neighbors = ctx.graph.neighbors(
        seed_path,
        NeighborDirection::Both,
        NeighborMode::Simple,
        ctx.ontology_folder,
        MAX_NEIGHBORS_PER_NODE * 2,
    );
    let neighbor_weight: HashMap<&str, f32> = neighbors
        .iter()
        .map(|n| (n.path.as_str(), n.score))
        .collect();

    let mut scored: Vec<ScoredDoc> = Vec::new();
    for (path, (similarity, chunk_id)) in &by_vector {
        if path == seed_path {
            continue;
        }
        let score = if neighbor_weight.contains_key(path.as_str()) {
            (similarity + HYBRID_BOOST).max(VECTOR_MIN_RELEVANCE)
        } else {
            *similarity
        };
        scored.push(ScoredDoc {
            path: path.clone(),
            score: score.min(1.0),
            best_chunk: Some(chunk_id.clone()),
        });
    }
    for neighbor in &neighbors {
        if neighbor.path == seed_path || by_vector.contains_key(&neighbor.path) {
            continue;
        }
        // Pure graph neighbours must clear the floor on their own.
        if neighbor.score < VECTOR_MIN_RELEVANCE {
            continue;
        }
        let best_chunk = ctx
            .vectors
            .chunk_ids_for_path(&neighbor.path)
            .first()
            .cloned();
        scored.push(ScoredDoc {
            path: neighbor.path.clone(),
            score: neighbor.score.min(1.0),
            best_chunk,
        });
    }

    scored.retain(|d| d.score >= min_score);
    rank(ctx, &mut scored);
    scored.truncate(k);
    scored
}

/// Composite desc, then mtime desc, then path asc.
fn rank(ctx: &ScorerContext, scored: &mut [ScoredDoc]) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let mtime_a = ctx.docs.get(&a.path).map_or(0, |d| d.mtime);
                let mtime_b = ctx.docs.get(&b.path).map_or(0, |d| d.mtime);
                mtime_b.cmp(&mtime_a)
            })
            .then_with(|| a.path.cmp(&b.path))
    });
}

fn check_cancelled(cancel: &CancellationToken) -> EngineResult<()> {
    if cancel.is_cancelled() {
        return Err(EngineError::Transient("query cancelled".into()));
    }
    Ok(())
}
