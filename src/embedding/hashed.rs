//! Offline backend with hash-derived token vectors.
//!
//! Words are lower-cased and mapped to a token id with CRC32; each id expands
//! into a fixed pseudo-random vector via SHA-256. No model download, fully
//! deterministic, and texts sharing words end up close after pooling.

use sha2::{Digest, Sha256};

use super::engine::{EmbeddingError, InferenceBackend};

/// Token id used for padding positions
const PAD_ID: u32 = 0;

pub struct HashedBackend {
    dimensions: usize,
}

impl HashedBackend {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn token_id(word: &str) -> u32 {
        // low bit set keeps real tokens distinct from PAD_ID
        crc32fast::hash(word.as_bytes()) | 1
    }

    fn token_vector(&self, id: u32, out: &mut [f32]) {
        for (block, chunk) in out.chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(id.to_le_bytes());
            hasher.update((block as u32).to_le_bytes());
            let digest = hasher.finalize();

            for (value, byte) in chunk.iter_mut().zip(digest.iter()) {
                *value = (*byte as f32 / 255.0) * 2.0 - 1.0;
            }
        }
    }
}

impl InferenceBackend for HashedBackend {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn tokenize(
        &self,
        text: &str,
        ids: &mut [u32],
        mask: &mut [u32],
    ) -> Result<usize, EmbeddingError> {
        let words = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase());

        let mut count = 0;
        for (slot, word) in words.take(ids.len()).enumerate() {
            ids[slot] = Self::token_id(&word);
            mask[slot] = 1;
            count += 1;
        }

        Ok(count)
    }

    fn forward(
        &mut self,
        ids: &[u32],
        _mask: &[u32],
        hidden: &mut [f32],
    ) -> Result<(), EmbeddingError> {
        if hidden.len() != ids.len() * self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: ids.len() * self.dimensions,
                actual: hidden.len(),
            });
        }

        // padding rows get the PAD_ID vector, pooling must skip them
        for (&id, row) in ids.iter().zip(hidden.chunks_exact_mut(self.dimensions)) {
            self.token_vector(id, row);
        }

        Ok(())
    }
}
