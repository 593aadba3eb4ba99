use crate::error::{CvddError, Result};
use crate::nn::uniform;
use crate::tensor::Tensor;
use ndarray::Array2;
use rand::Rng;

/// Turns padded token ids `(B, T)` into embeddings `(B, T, output_dim)`.
pub trait TextEmbedder: Send + Sync {
    fn output_dim(&self) -> usize;

    fn embed(&self, token_ids: &Array2<usize>) -> Result<Tensor>;

    fn parameters(&self) -> Vec<Tensor>;
}

/// A plain lookup table, one row per vocabulary entry.
#[derive(Clone)]
pub struct Embedding {
    pub weight: Tensor,
    trainable: bool,
}

impl Embedding {
    pub fn new(num_embeddings: usize, embedding_dim: usize, trainable: bool, rng: &mut impl Rng) -> Self {
        let weight = Tensor::new(uniform(&[num_embeddings, embedding_dim], 1.0, rng), trainable);
        Embedding { weight, trainable }
    }

    /// Wraps pretrained vectors of shape (V, E).
    pub fn from_pretrained(weight: Array2<f32>, trainable: bool) -> Self {
        Embedding {
            weight: Tensor::new(weight.into_dyn(), trainable),
            trainable,
        }
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl TextEmbedder for Embedding {
    fn output_dim(&self) -> usize {
        self.weight.shape()[1]
    }

    fn embed(&self, token_ids: &Array2<usize>) -> Result<Tensor> {
        let vocab = self.num_embeddings();
        if let Some(&bad) = token_ids.iter().find(|&&id| id >= vocab) {
            return Err(CvddError::invalid_input(format!(
                "token id {} outside embedding table of {} rows",
                bad, vocab
            )));
        }
        let ids = token_ids.mapv(|id| id as f32).into_dyn();
        Ok(Tensor::embedding_lookup(&self.weight, &Tensor::new(ids, false)))
    }

    fn parameters(&self) -> Vec<Tensor> {
        if self.trainable {
            vec![self.weight.clone()]
        } else {
            Vec::new()
        }
    }
}
