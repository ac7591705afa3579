//! Text embedding engine.
//!
//! Turns tag text into a fixed-length unit vector:
//! tokenize -> run the model -> mean-pool real tokens -> L2 normalize.
//!
//! # Architecture
//!
//! - `engine`: owns the inference context behind a single lock
//! - `pooling`: mean pooling, normalization and cosine similarity
//! - `bert`: candle BERT backend with HuggingFace model download
//! - `hashed`: deterministic offline backend

mod bert;
mod engine;
mod hashed;
mod pooling;

pub use bert::{BertBackend, ModelCache};
pub use engine::{EmbeddingEngine, EmbeddingError, InferenceBackend};
pub use hashed::HashedBackend;
pub use pooling::{cosine_similarity, l2_norm, mean_pool, normalize};
