//! Dense vector store.
//!
//! One contiguous row-major `f32` buffer owned by the indexer worker.
//! Vectors are L2-normalised at insert time, so the scan scores by plain
//! dot product. Rows are kept dense: deleting a document swap-removes its
//! rows, which keeps every scan a single linear pass with no tombstones.

use crate::config::LATENCY_BUDGET_FACTOR;
use crate::error::{EngineError, EngineResult};
use crate::model::ChunkMeta;
use std::collections::{HashMap, HashSet};

/// Geometric growth factor for the backing buffer.
const GROWTH_FACTOR: f32 = 1.5;
/// Rows the buffer starts with on first insert.
const INITIAL_CAPACITY_ROWS: usize = 256;
/// Save cycles below 50% utilisation required before the buffer shrinks.
const SHRINK_CYCLES: u32 = 2;

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub path: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
struct RowMeta {
    chunk_id: String,
    path: String,
}

pub struct VectorIndex {
    dim: usize,
    buffer: Vec<f32>,
    rows: Vec<RowMeta>,
    by_chunk: HashMap<String, usize>,
    by_path: HashMap<String, Vec<String>>,
    low_util_cycles: u32,
}

impl VectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            buffer: Vec::new(),
            rows: Vec::new(),
            by_chunk: HashMap::new(),
            by_path: HashMap::new(),
            low_util_cycles: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity_rows(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.buffer.len() / self.dim
        }
    }

    pub fn chunk_ids_for_path(&self, path: &str) -> &[String] {
        self.by_path.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn vector_for_chunk(&self, chunk_id: &str) -> Option<&[f32]> {
        let row = *self.by_chunk.get(chunk_id)?;
        Some(&self.buffer[row * self.dim..(row + 1) * self.dim])
    }

    /// Replaces every row belonging to `path` with the given chunks.
    pub fn upsert_chunks(
        &mut self,
        path: &str,
        chunks: &[(ChunkMeta, Vec<f32>)],
    ) -> EngineResult<()> {
        for (_, vec) in chunks {
            if vec.len() != self.dim {
                return Err(EngineError::InvalidInput(format!(
                    "vector dimension {} does not match index dimension {}",
                    vec.len(),
                    self.dim
                )));
            }
        }
        self.delete_document(path);

        let mut ids = Vec::with_capacity(chunks.len());
        for (index, (_, vec)) in chunks.iter().enumerate() {
            let chunk_id = ChunkMeta::chunk_id(path, index);
            let row = self.rows.len();
            self.ensure_capacity(row + 1);
            let base = row * self.dim;
            self.buffer[base..base + self.dim].copy_from_slice(vec);
            self.rows.push(RowMeta {
                chunk_id: chunk_id.clone(),
                path: path.to_string(),
            });
            self.by_chunk.insert(chunk_id.clone(), row);
            ids.push(chunk_id);
        }
        if !ids.is_empty() {
            self.by_path.insert(path.to_string(), ids);
        }
        Ok(())
    }

    /// Frees all rows for `path`. Idempotent.
    pub fn delete_document(&mut self, path: &str) {
        let Some(ids) = self.by_path.remove(path) else {
            return;
        };
        for chunk_id in ids {
            if let Some(row) = self.by_chunk.remove(&chunk_id) {
                self.swap_remove_row(row);
            }
        }
    }

    fn swap_remove_row(&mut self, row: usize) {
        let last = self.rows.len() - 1;
        if row != last {
            let (src, dst) = (last * self.dim, row * self.dim);
            for j in 0..self.dim {
                self.buffer[dst + j] = self.buffer[src + j];
            }
            let moved = self.rows[last].clone();
            self.by_chunk.insert(moved.chunk_id.clone(), row);
            self.rows[row] = moved;
        }
        self.rows.pop();
    }

    fn ensure_capacity(&mut self, rows_needed: usize) {
        let needed = rows_needed * self.dim;
        if needed <= self.buffer.len() {
            return;
        }
        let grown = ((self.capacity_rows() as f32 * GROWTH_FACTOR) as usize)
            .max(INITIAL_CAPACITY_ROWS)
            .max(rows_needed);
        self.buffer.resize(grown * self.dim, 0.0);
    }

    /// Called once per save cycle; shrinks the buffer after utilisation has
    /// stayed below 50% for SHRINK_CYCLES cycles.
    pub fn note_save_cycle(&mut self) {
        let capacity = self.capacity_rows();
        if capacity > INITIAL_CAPACITY_ROWS && self.rows.len() * 2 < capacity {
            self.low_util_cycles += 1;
            if self.low_util_cycles >= SHRINK_CYCLES {
                self.buffer.truncate(self.rows.len().max(INITIAL_CAPACITY_ROWS) * self.dim);
                self.buffer.shrink_to_fit();
                self.low_util_cycles = 0;
            }
        } else {
            self.low_util_cycles = 0;
        }
    }

    /// Top-k scan. `budgeted` limits the rows visited to
    /// `LATENCY_BUDGET_FACTOR * k`; rows beyond the budget are sampled by
    /// stride so a reflex query stays flat-latency on a large index.
    pub fn similar_search(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
        only_paths: Option<&HashSet<String>>,
        budgeted: bool,
    ) -> EngineResult<Vec<VectorHit>> {
        if query.len() != self.dim {
            return Err(EngineError::InvalidInput(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dim
            )));
        }
        if k == 0 || self.rows.is_empty() {
            return Ok(Vec::new());
        }

        let total = self.rows.len();
        let budget = LATENCY_BUDGET_FACTOR.saturating_mul(k.max(1));
        let mut hits: Vec<VectorHit> = Vec::new();

        let mut visit = |row: usize, hits: &mut Vec<VectorHit>| {
            let meta = &self.rows[row];
            if let Some(allowed) = only_paths {
                if !allowed.contains(&meta.path) {
                    return;
                }
            }
            let base = row * self.dim;
            let mut score = 0.0f32;
            for j in 0..self.dim {
                score += query[j] * self.buffer[base + j];
            }
            if score >= min_score {
                hits.push(VectorHit {
                    chunk_id: meta.chunk_id.clone(),
                    path: meta.path.clone(),
                    score,
                });
            }
        };

        if !budgeted || total <= budget {
            for row in 0..total {
                visit(row, &mut hits);
            }
        } else {
            // Half the budget scans sequentially, the other half is spread
            // over the remainder by stride, keeping total visits <= budget.
            let seq = (budget / 2).max(1);
            for row in 0..seq {
                visit(row, &mut hits);
            }
            let remaining = total - seq;
            let sampled = (budget - seq).max(1);
            let stride = remaining.div_ceil(sampled).max(2);
            let mut row = seq;
            while row < total {
                visit(row, &mut hits);
                row += stride;
            }
        }

        hits.sort_unstable_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Mean of the document's chunk vectors, re-normalised. Used as the
    /// query vector for similar-to-seed.
    pub fn document_centroid(&self, path: &str) -> Option<Vec<f32>> {
        let ids = self.by_path.get(path)?;
        if ids.is_empty() {
            return None;
        }
        let mut centroid = vec![0.0f32; self.dim];
        for id in ids {
            let vec = self.vector_for_chunk(id)?;
            for (c, v) in centroid.iter_mut().zip(vec) {
                *c += v;
            }
        }
        let norm: f32 = centroid.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for c in &mut centroid {
                *c /= norm;
            }
        }
        Some(centroid)
    }

    /// Row-ordered export for persistence: (chunk path, packed vectors).
    pub fn export_rows(&self) -> (Vec<(String, usize)>, Vec<f32>) {
        let mut order = Vec::with_capacity(self.rows.len());
        let mut packed = Vec::with_capacity(self.rows.len() * self.dim);
        for (row, meta) in self.rows.iter().enumerate() {
            let index = meta
                .chunk_id
                .rsplit('#')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            order.push((meta.path.clone(), index));
            packed.extend_from_slice(&self.buffer[row * self.dim..(row + 1) * self.dim]);
        }
        (order, packed)
    }
}

pub fn l2_normalise(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn chunk(start: usize, end: usize) -> ChunkMeta {
        ChunkMeta {
            start,
            end,
            anchor_hash: 0,
            token_count: 1,
        }
    }

    #[test]
    fn upsert_then_search_finds_nearest() {
        let mut index = VectorIndex::new(4);
        index
            .upsert_chunks("a.md", &[(chunk(0, 4), unit(4, 0))])
            .unwrap();
        index
            .upsert_chunks("b.md", &[(chunk(0, 4), unit(4, 1))])
            .unwrap();

        let hits = index.similar_search(&unit(4, 0), 2, 0.0, None, false).unwrap();
        assert_eq!(hits[0].path, "a.md");
        assert!(hits[0].score > 0.99);
    }

    #[test]
    fn upsert_replaces_previous_rows() {
        let mut index = VectorIndex::new(4);
        index
            .upsert_chunks("a.md", &[(chunk(0, 4), unit(4, 0)), (chunk(4, 8), unit(4, 1))])
            .unwrap();
        assert_eq!(index.len(), 2);
        index
            .upsert_chunks("a.md", &[(chunk(0, 4), unit(4, 2))])
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.chunk_ids_for_path("a.md"), ["a.md#0"]);
    }

    #[test]
    fn upsert_twice_is_idempotent() {
        let mut index = VectorIndex::new(4);
        let rows = [(chunk(0, 4), unit(4, 0))];
        index.upsert_chunks("a.md", &rows).unwrap();
        index.upsert_chunks("a.md", &rows).unwrap();
        assert_eq!(index.len(), 1);
        let hits = index.similar_search(&unit(4, 0), 5, 0.0, None, false).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn delete_frees_rows_and_remaps_survivors() {
        let mut index = VectorIndex::new(4);
        index
            .upsert_chunks("a.md", &[(chunk(0, 4), unit(4, 0))])
            .unwrap();
        index
            .upsert_chunks("b.md", &[(chunk(0, 4), unit(4, 1))])
            .unwrap();
        index.delete_document("a.md");
        assert_eq!(index.len(), 1);
        let hits = index.similar_search(&unit(4, 1), 2, 0.0, None, false).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "b.md");
        // Deleting again is a no-op.
        index.delete_document("a.md");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = VectorIndex::new(4);
        let err = index.upsert_chunks("a.md", &[(chunk(0, 4), vec![1.0; 3])]);
        assert!(err.is_err());
        assert!(index.similar_search(&[1.0; 3], 1, 0.0, None, false).is_err());
    }

    #[test]
    fn only_paths_filter_skips_rows() {
        let mut index = VectorIndex::new(4);
        index
            .upsert_chunks("a.md", &[(chunk(0, 4), unit(4, 0))])
            .unwrap();
        index
            .upsert_chunks("b.md", &[(chunk(0, 4), unit(4, 0))])
            .unwrap();
        let only: HashSet<String> = ["b.md".to_string()].into();
        let hits = index
            .similar_search(&unit(4, 0), 10, 0.0, Some(&only), false)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "b.md");
    }

    #[test]
    fn ties_break_by_chunk_id() {
        let mut index = VectorIndex::new(4);
        index
            .upsert_chunks("b.md", &[(chunk(0, 4), unit(4, 0))])
            .unwrap();
        index
            .upsert_chunks("a.md", &[(chunk(0, 4), unit(4, 0))])
            .unwrap();
        let hits = index.similar_search(&unit(4, 0), 2, 0.0, None, false).unwrap();
        assert_eq!(hits[0].chunk_id, "a.md#0");
        assert_eq!(hits[1].chunk_id, "b.md#0");
    }

    #[test]
    fn buffer_grows_geometrically_and_shrinks_after_two_cycles() {
        let mut index = VectorIndex::new(2);
        for i in 0..600 {
            index
                .upsert_chunks(&format!("doc{i}.md"), &[(chunk(0, 2), unit(2, 0))])
                .unwrap();
        }
        let grown_capacity = index.capacity_rows();
        assert!(grown_capacity >= 600);

        for i in 0..580 {
            index.delete_document(&format!("doc{i}.md"));
        }
        index.note_save_cycle();
        assert_eq!(index.capacity_rows(), grown_capacity);
        index.note_save_cycle();
        assert!(index.capacity_rows() < grown_capacity);
        // The surviving rows still resolve.
        assert_eq!(index.len(), 20);
        let hits = index.similar_search(&unit(2, 0), 30, 0.0, None, false).unwrap();
        assert_eq!(hits.len(), 20);
    }

    #[test]
    fn budgeted_scan_still_returns_k() {
        let mut index = VectorIndex::new(2);
        for i in 0..2000 {
            index
                .upsert_chunks(&format!("doc{i:04}.md"), &[(chunk(0, 2), unit(2, 0))])
                .unwrap();
        }
        let hits = index.similar_search(&unit(2, 0), 5, 0.0, None, true).unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn centroid_is_normalised_mean() {
        let mut index = VectorIndex::new(2);
        index
            .upsert_chunks(
                "a.md",
                &[(chunk(0, 2), vec![1.0, 0.0]), (chunk(2, 4), vec![0.0, 1.0])],
            )
            .unwrap();
        let centroid = index.document_centroid("a.md").unwrap();
        let norm: f32 = centroid.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((centroid[0] - centroid[1]).abs() < 1e-5);
    }

    #[test]
    fn export_rows_packs_in_row_order() {
        let mut index = VectorIndex::new(2);
        index
            .upsert_chunks("a.md", &[(chunk(0, 2), vec![1.0, 0.0])])
            .unwrap();
        index
            .upsert_chunks("b.md", &[(chunk(0, 2), vec![0.0, 1.0])])
            .unwrap();
        let (order, packed) = index.export_rows();
        assert_eq!(order, vec![("a.md".to_string(), 0), ("b.md".to_string(), 0)]);
        assert_eq!(packed, vec![1.0, 0.0, 0.0, 1.0]);
    }
}
