use hopgraph_core::util::tokenize;
use hopgraph_core::{EngineError, Result};
use std::collections::HashMap;

/// Text embedding collaborator. A failure here is a hard error for vector search.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync + 'static {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Deterministic feature-hashing embedder for local runs and tests.
///
/// Terms are hashed (FNV-1a) into fixed buckets and weighted by frequency,
/// then L2-normalized. Not semantically rich, but needs no model.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn bucket(term: &str, dims: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h as usize) % dims
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return v;
        }
        let mut tf: HashMap<&str, f32> = HashMap::new();
        for t in &tokens {
            *tf.entry(t.as_str()).or_default() += 1.0;
        }
        let total = tokens.len() as f32;
        for (term, count) in tf {
            let idf = 1.0 + (term.len() as f32).ln();
            v[Self::bucket(term, self.dimensions)] += count / total * idf;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait::async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimensions == 0 {
            return Err(EngineError::Embedding("zero-dimension embedder".into()));
        }
        Ok(self.vector(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopgraph_core::util::cosine_sim;

    #[tokio::test]
    async fn deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.embed("revenue operations lead").await.unwrap();
        let b = e.embed("revenue operations lead").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn overlapping_texts_are_closer() {
        let e = HashingEmbedder::new(256);
        let a = e.vector("head of sales enablement");
        let b = e.vector("sales enablement manager");
        let c = e.vector("kubernetes cluster upgrade");
        assert!(cosine_sim(&a, &b) > cosine_sim(&a, &c));
    }

    #[tokio::test]
    async fn zero_dimensions_fail() {
        assert!(HashingEmbedder::new(0).embed("x").await.is_err());
    }
}
