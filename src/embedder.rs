//! Embedding capability.
//!
//! The worker only sees the `Embedder` trait; where the vectors come from
//! is opaque and no network availability is assumed. The production
//! implementation wraps Qwen3-Embedding-0.6B via fastembed's candle backend
//! (pure Rust, no ONNX), lazily initialised behind a mutex.

use crate::config::CHARS_PER_TOKEN_ESTIMATE;
use crate::error::{EngineError, EngineResult};
use candle_core::{DType, Device};
use fastembed::Qwen3TextEmbedding;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Maximum token length for the embedding model truncation. Qwen3 supports
/// 32768; notes rarely need more than this and CPU memory stays bounded.
const QWEN3_MAX_LENGTH: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedRole {
    Document,
    Query,
}

/// Opaque embedding capability required by the indexer worker.
pub trait Embedder: Send + Sync {
    fn initialize(&self) -> EngineResult<()>;

    /// Returns one L2-normalised vector of `dimension()` floats.
    fn embed(&self, text: &str, role: EmbedRole, title: Option<&str>) -> EngineResult<Vec<f32>>;

    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN_ESTIMATE)
}

/// Qwen3-Embedding via candle. `embed` is blocking; the worker wraps calls
/// in `spawn_blocking` with a timeout.
pub struct LocalEmbedder {
    model_id: String,
    dimension: usize,
    model: Arc<Mutex<Option<Qwen3TextEmbedding>>>,
    initialized: AtomicBool,
}

impl LocalEmbedder {
    pub fn new(model_id: String, dimension: usize) -> Self {
        Self {
            model_id,
            dimension,
            model: Arc::new(Mutex::new(None)),
            initialized: AtomicBool::new(false),
        }
    }

    fn ensure_model(&self) -> EngineResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut guard = self
            .model
            .lock()
            .map_err(|e| EngineError::Fatal(format!("Embedder lock poisoned: {e}")))?;
        if guard.is_some() {
            self.initialized.store(true, Ordering::Release);
            return Ok(());
        }

        info!(
            model = %self.model_id,
            dim = self.dimension,
            "Initializing embedding model"
        );
        let device = Device::Cpu;
        let model =
            Qwen3TextEmbedding::from_hf(&self.model_id, &device, DType::F32, QWEN3_MAX_LENGTH)
                .map_err(|e| {
                    EngineError::Transient(format!("Failed to init embedding model: {e}"))
                })?;

        let actual_dim = model.config().hidden_size;
        if actual_dim != self.dimension {
            return Err(EngineError::Fatal(format!(
                "Model dimension mismatch: expected {} but got {}",
                self.dimension, actual_dim
            )));
        }

        *guard = Some(model);
        self.initialized.store(true, Ordering::Release);
        info!(model = %self.model_id, "Embedding model ready");
        Ok(())
    }
}

impl Embedder for LocalEmbedder {
    fn initialize(&self) -> EngineResult<()> {
        self.ensure_model()
    }

    fn embed(&self, text: &str, role: EmbedRole, title: Option<&str>) -> EngineResult<Vec<f32>> {
        self.ensure_model()?;
        // Qwen3-Embedding is instruction-aware: queries carry an instruct
        // prefix, documents are embedded raw (optionally titled).
        let input = match role {
            EmbedRole::Query => format!(
                "Instruct: Retrieve notes relevant to the query\nQuery: {text}"
            ),
            EmbedRole::Document => match title {
                Some(title) => format!("{title}\n\n{text}"),
                None => text.to_string(),
            },
        };

        let guard = self
            .model
            .lock()
            .map_err(|e| EngineError::Fatal(format!("Embedder lock poisoned: {e}")))?;
        let model = guard
            .as_ref()
            .ok_or_else(|| EngineError::Fatal("Embedding model not initialized".into()))?;
        let mut vectors = model
            .embed(&[input])
            .map_err(|e| EngineError::Transient(format!("Embedding failed: {e}")))?;
        let mut vector = vectors
            .pop()
            .ok_or_else(|| EngineError::Transient("Embedder returned no vector".into()))?;
        crate::vector::l2_normalise(&mut vector);
        Ok(vector)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Deterministic embedder for tests: token hashes scattered over a
    /// fixed-dimension vector, L2-normalised. Similar texts get similar
    /// vectors, identical texts get identical ones.
    pub struct HashEmbedder {
        dim: usize,
        model_id: String,
    }

    impl HashEmbedder {
        pub fn new(dim: usize) -> Self {
            Self {
                dim,
                model_id: "test/hash-embedder".to_string(),
            }
        }

        pub fn with_model_id(dim: usize, model_id: &str) -> Self {
            Self {
                dim,
                model_id: model_id.to_string(),
            }
        }
    }

    impl Embedder for HashEmbedder {
        fn initialize(&self) -> EngineResult<()> {
            Ok(())
        }

        fn embed(
            &self,
            text: &str,
            _role: EmbedRole,
            _title: Option<&str>,
        ) -> EngineResult<Vec<f32>> {
            let mut vector = vec![0.0f32; self.dim];
            for token in text.split(|c: char| !c.is_alphanumeric()) {
                if token.is_empty() {
                    continue;
                }
                let token = token.to_lowercase();
                let mut h: u64 = 1469598103934665603;
                for b in token.bytes() {
                    h ^= u64::from(b);
                    h = h.wrapping_mul(1099511628211);
                }
                vector[(h % self.dim as u64) as usize] += 1.0;
            }
            crate::vector::l2_normalise(&mut vector);
            Ok(vector)
        }

        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn dimension(&self) -> usize {
            self.dim
        }
    }

    #[test]
    fn hash_embedder_is_deterministic_and_normalised() {
        let e = HashEmbedder::new(32);
        let a = e.embed("vector index engine", EmbedRole::Document, None).unwrap();
        let b = e.embed("vector index engine", EmbedRole::Document, None).unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn overlapping_texts_score_higher_than_disjoint() {
        let e = HashEmbedder::new(64);
        let a = e.embed("graph engine notes", EmbedRole::Document, None).unwrap();
        let b = e.embed("graph engine journal", EmbedRole::Document, None).unwrap();
        let c = e.embed("completely unrelated words", EmbedRole::Document, None).unwrap();
        let dot = |x: &[f32], y: &[f32]| x.iter().zip(y).map(|(a, b)| a * b).sum::<f32>();
        assert!(dot(&a, &b) > dot(&a, &c));
    }
}
