//! The embedding model runtime, modeled as an opaque capability (§1, §9 "Dynamic typing").
//!
//! Grounded in the teacher's `embeddings::EmbeddingsClient` (`embeddings/mod.rs`):
//! a thin client the pipeline calls in batches. Here the model itself is a
//! black box behind the `Vectoriser` trait; this crate never loads weights or
//! runs inference.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
}

/// A single unit of content to embed, already resolved from raw input (§4.4.3, §4.4.4).
#[derive(Debug, Clone)]
pub enum EmbedInput {
    Text(String),
    /// Downloaded/preprocessed media bytes for the given modality.
    Media(Modality, Vec<u8>),
}

/// Black-box vectoriser (§1 "Vectoriser"). Implementations load model weights
/// out of process or behind an RPC boundary; this core only calls `embed_batch`.
#[async_trait]
pub trait Vectoriser: Send + Sync {
    fn supported_modalities(&self) -> &[Modality];
    fn dimension(&self) -> u32;

    /// Embeds a batch of inputs, returning one vector per input in order.
    ///
    /// The three batching strategies in `pipeline::embed` rely on this being a
    /// pure function of each individual input: grouping inputs differently
    /// across calls must not change any single input's resulting vector
    /// (§4.4.4, §8 "three batching strategies... numerically identical").
    async fn embed_batch(&self, inputs: &[EmbedInput]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic test double: hashes each input's content into a fixed-length
/// vector. Used by pipeline/search unit tests and the batching-equivalence
/// property test (§8).
pub struct DeterministicVectoriser {
    dim: u32,
    modalities: Vec<Modality>,
}

impl DeterministicVectoriser {
    pub fn new(dim: u32) -> Self {
        DeterministicVectoriser { dim, modalities: vec![Modality::Text, Modality::Image, Modality::Audio, Modality::Video] }
    }

    fn embed_one(&self, input: &EmbedInput) -> Vec<f32> {
        let bytes: Vec<u8> = match input {
            EmbedInput::Text(text) => text.as_bytes().to_vec(),
            EmbedInput::Media(modality, bytes) => {
                let mut v = vec![*modality as u8];
                v.extend_from_slice(bytes);
                v
            }
        };
        let mut out = Vec::with_capacity(self.dim as usize);
        let mut counter: u32 = 0;
        while out.len() < self.dim as usize {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks(4) {
                if out.len() >= self.dim as usize {
                    break;
                }
                let mut buf = [0u8; 4];
                buf[..chunk.len()].copy_from_slice(chunk);
                let as_u32 = u32::from_le_bytes(buf);
                out.push((as_u32 as f64 / u32::MAX as f64) as f32 - 0.5);
            }
            counter += 1;
        }
        out
    }
}

#[async_trait]
impl Vectoriser for DeterministicVectoriser {
    fn supported_modalities(&self) -> &[Modality] {
        &self.modalities
    }

    fn dimension(&self) -> u32 {
        self.dim
    }

    async fn embed_batch(&self, inputs: &[EmbedInput]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|i| self.embed_one(i)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_text_embeds_identically_regardless_of_batch_grouping() {
        let v = DeterministicVectoriser::new(16);
        let whole = v
            .embed_batch(&[EmbedInput::Text("dogs".into()), EmbedInput::Text("cats".into())])
            .await
            .unwrap();
        let split_a = v.embed_batch(&[EmbedInput::Text("dogs".into())]).await.unwrap();
        let split_b = v.embed_batch(&[EmbedInput::Text("cats".into())]).await.unwrap();
        assert_eq!(whole[0], split_a[0]);
        assert_eq!(whole[1], split_b[0]);
    }
}
