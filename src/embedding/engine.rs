//! Serialized access to a reusable inference context.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::config::{EmbeddingBackendKind, EmbeddingConfig};

use super::bert::{BertBackend, ModelCache};
use super::hashed::HashedBackend;
use super::pooling::{mean_pool, normalize};

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("embedding engine unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("model download failed: {0}")]
    Download(String),

    #[error("model file not found: {0}")]
    ModelNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tokenizer plus model producing one vector per token position.
pub trait InferenceBackend: Send {
    /// Width of each per-token output vector.
    fn dimensions(&self) -> usize;

    /// Write token ids and attention mask for `text` into the zeroed buffers,
    /// truncating to `ids.len()`. Returns the number of real tokens.
    fn tokenize(&self, text: &str, ids: &mut [u32], mask: &mut [u32])
        -> Result<usize, EmbeddingError>;

    /// Run the model over one padded sequence, filling `hidden` with
    /// `ids.len() * dimensions()` values.
    fn forward(
        &mut self,
        ids: &[u32],
        mask: &[u32],
        hidden: &mut [f32],
    ) -> Result<(), EmbeddingError>;
}

/// Backend plus its working buffers, reused across calls.
struct InferenceContext {
    backend: Box<dyn InferenceBackend>,
    input_ids: Vec<u32>,
    attention_mask: Vec<u32>,
    hidden: Vec<f32>,
}

/// Text -> unit vector.
///
/// Every call takes the same lock, so at most one inference runs at a time no
/// matter how many pipeline workers or feed queries call in. `close` releases
/// the backend; later calls fail with `ResourceUnavailable`.
pub struct EmbeddingEngine {
    context: Mutex<Option<InferenceContext>>,
    max_tokens: usize,
    dimensions: usize,
}

impl EmbeddingEngine {
    pub fn new(backend: Box<dyn InferenceBackend>, max_tokens: usize) -> Self {
        let dimensions = backend.dimensions();
        let context = InferenceContext {
            backend,
            input_ids: vec![0; max_tokens],
            attention_mask: vec![0; max_tokens],
            hidden: vec![0.0; max_tokens * dimensions],
        };

        Self {
            context: Mutex::new(Some(context)),
            max_tokens,
            dimensions,
        }
    }

    /// Build the backend selected in the config. The BERT model is downloaded
    /// into `models_dir` on first use.
    pub fn from_config(config: &EmbeddingConfig, models_dir: &Path) -> Result<Self, EmbeddingError> {
        let backend: Box<dyn InferenceBackend> = match config.backend {
            EmbeddingBackendKind::Bert => {
                let cache = ModelCache::new(models_dir, config.model_repo.clone());
                Box::new(BertBackend::load(&cache)?)
            }
            EmbeddingBackendKind::Hashed => Box::new(HashedBackend::new(config.dimensions)),
        };

        if backend.dimensions() != config.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: config.dimensions,
                actual: backend.dimensions(),
            });
        }

        log::info!(
            "embedding engine ready ({:?}, {} dims, {} tokens)",
            config.backend,
            config.dimensions,
            config.max_tokens
        );

        Ok(Self::new(backend, config.max_tokens))
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Embed free text. Deterministic for identical input and weights.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }

        let mut guard = self.lock();
        let ctx = guard.as_mut().ok_or_else(|| {
            EmbeddingError::ResourceUnavailable("engine already closed".to_string())
        })?;

        ctx.input_ids.fill(0);
        ctx.attention_mask.fill(0);

        ctx.backend
            .tokenize(text, &mut ctx.input_ids, &mut ctx.attention_mask)?;
        ctx.backend
            .forward(&ctx.input_ids, &ctx.attention_mask, &mut ctx.hidden)?;

        let mut embedding = mean_pool(&ctx.hidden, &ctx.attention_mask, self.dimensions)?;
        normalize(&mut embedding)?;

        Ok(embedding)
    }

    /// Embed a tag list as one space-joined text.
    pub fn embed_tags(&self, tags: &[String]) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(&tags.join(" "))
    }

    /// Release the backend. Safe to call any number of times from any thread;
    /// only the first call does the work.
    pub fn close(&self) {
        let mut guard = match self.context.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if guard.take().is_some() {
            log::info!("embedding engine released");
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.context.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    /// A backend that panicked mid-call leaves the mutex poisoned. The
    /// buffers are reset before every call, so the context is still usable.
    fn lock(&self) -> MutexGuard<'_, Option<InferenceContext>> {
        self.context.lock().unwrap_or_else(|poisoned| {
            log::warn!("embedding backend panicked during a previous call, reusing context");
            self.context.clear_poison();
            poisoned.into_inner()
        })
    }
}

impl Drop for EmbeddingEngine {
    fn drop(&mut self) {
        self.close();
    }
}
