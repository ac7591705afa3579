//! Sentence pooling over per-token model output.

use super::EmbeddingError;

/// Average token vectors over unmasked positions.
///
/// `hidden` is row-major `[mask.len() x dimensions]`. Positions whose mask is 0
/// (padding) are skipped and the divisor is the number of real tokens, not the
/// sequence length.
pub fn mean_pool(hidden: &[f32], mask: &[u32], dimensions: usize) -> Result<Vec<f32>, EmbeddingError> {
    if hidden.len() != mask.len() * dimensions {
        return Err(EmbeddingError::DimensionMismatch {
            expected: mask.len() * dimensions,
            actual: hidden.len(),
        });
    }

    let mut pooled = vec![0f32; dimensions];
    let mut count = 0usize;

    for (row, &m) in hidden.chunks_exact(dimensions).zip(mask) {
        if m == 0 {
            continue;
        }
        count += 1;
        for (acc, value) in pooled.iter_mut().zip(row) {
            *acc += value;
        }
    }

    if count == 0 {
        return Err(EmbeddingError::InvalidInput(
            "no unmasked tokens to pool".to_string(),
        ));
    }

    let count = count as f32;
    for value in pooled.iter_mut() {
        *value /= count;
    }

    Ok(pooled)
}

/// L2 norm, accumulated in f64.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter()
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt() as f32
}

/// Scale `v` to unit length in place.
pub fn normalize(v: &mut [f32]) -> Result<(), EmbeddingError> {
    let norm = l2_norm(v);
    if norm == 0.0 {
        return Err(EmbeddingError::InvalidInput(
            "cannot normalize a zero-norm vector".to_string(),
        ));
    }

    for value in v.iter_mut() {
        *value /= norm;
    }

    Ok(())
}

/// Cosine similarity of two vectors. Zero-norm input scores 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (norm_a * norm_b)
}
