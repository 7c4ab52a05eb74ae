//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, plus pure helpers for building embedding inputs, normalizing,
//! serializing, and comparing vectors.
//!
//! Concrete providers (fastembed, OpenAI, Ollama) live in the `drive-index`
//! app crate.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::RecordProperties;

/// Trait for embedding providers.
///
/// Implementations must return one vector per input text, in input order.
/// Callers L2-normalize the output with [`normalize_l2`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"bge-base-en-v1.5"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed one text and normalize it to unit length.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let mut out = provider.embed_batch(&[text.to_string()]).await?;
    let mut vec = out
        .pop()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;
    normalize_l2(&mut vec);
    Ok(vec)
}

/// The text embedded for a record: the title alone for title-only records,
/// otherwise `title + "\n" + chunk`.
pub fn embedding_input(props: &RecordProperties) -> String {
    if props.chunk.is_empty() {
        props.title.clone()
    } else {
        format!("{}\n{}", props.title, props.chunk)
    }
}

/// Scale a vector to unit length in place. Zero vectors are left unchanged.
pub fn normalize_l2(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use drive_index_core::embedding::{vec_to_blob, blob_to_vec};
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

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
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
