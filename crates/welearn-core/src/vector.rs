//! Embedding trait and vector arithmetic.
//!
//! Defines the [`EmbeddingProvider`] trait implemented by the app crate's
//! backends, plus the pure helpers the retrieval pipeline needs: cosine
//! similarity, subject "flavoring" of a query vector, and decoding of
//! embeddings stored as raw `f32` bytes in Postgres meta documents.

/// Metadata every embedding backend exposes.
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;
    /// Embedding dimensionality (e.g. `384`).
    fn dims(&self) -> usize;
}

/// Encode a float vector as little-endian `f32` bytes.
///
/// ```rust
/// use welearn_core::vector::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes. Trailing bytes that do not form a
/// whole `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Bias `base` towards `subject`: `base[i] + factor * subject[i]`.
///
/// When the lengths differ the shorter vector wins; the caller is expected
/// to pair vectors from the same model.
pub fn flavor_with_subject(base: &[f32], subject: &[f32], factor: f32) -> Vec<f32> {
    base.iter()
        .zip(subject.iter())
        .map(|(b, s)| b + factor * s)
        .collect()
}

/// Full pairwise cosine similarity matrix of `vectors`.
pub fn pairwise_cosine(vectors: &[&[f32]]) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let mut sim = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        for j in i..n {
            let s = cosine_similarity(vectors[i], vectors[j]);
            sim[i][j] = s;
            sim[j][i] = s;
        }
    }
    sim
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_ignores_trailing_bytes() {
        let mut blob = vec_to_blob(&[0.5, 1.5]);
        blob.push(7);
        assert_eq!(blob_to_vec(&blob), vec![0.5, 1.5]);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_or_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_flavor_with_subject() {
        let v = flavor_with_subject(&[1.0, 1.0], &[0.5, -1.0], 2.0);
        assert_eq!(v, vec![2.0, -1.0]);
    }

    #[test]
    fn test_pairwise_is_symmetric() {
        let a = [1.0f32, 0.0];
        let b = [1.0f32, 1.0];
        let sim = pairwise_cosine(&[&a, &b]);
        assert_eq!(sim[0][1], sim[1][0]);
        assert!((sim[0][0] - 1.0).abs() < 1e-6);
    }
}
