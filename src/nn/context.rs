//! Multi-head attention pooling and the learned context vector bank.

use crate::error::{CvddError, Result};
use crate::nn::encoder::SequenceEncoder;
use crate::nn::uniform;
use crate::tensor::Tensor;
use ndarray::{Array2, ArrayD};
use rand::Rng;

/// The learned reference vectors, one row per attention head.
///
/// Rows start uniform in `[-1, 1)` and only change through optimizer steps.
pub struct ContextVectorBank {
    vectors: Tensor,
}

impl ContextVectorBank {
    pub fn new(num_heads: usize, context_dim: usize, rng: &mut impl Rng) -> Self {
        ContextVectorBank {
            vectors: Tensor::new(uniform(&[num_heads, context_dim], 1.0, rng), true),
        }
    }

    /// Uses the given `(num_heads, context_dim)` values as the initial bank.
    pub fn from_array(vectors: Array2<f32>) -> Self {
        ContextVectorBank {
            vectors: Tensor::new(vectors.into_dyn(), true),
        }
    }

    pub fn num_heads(&self) -> usize {
        self.vectors.shape()[0]
    }

    pub fn context_dim(&self) -> usize {
        self.vectors.shape()[1]
    }

    /// The trainable `(num_heads, context_dim)` parameter.
    pub fn vectors(&self) -> &Tensor {
        &self.vectors
    }

    /// `mean((C · Cᵗ - I)²)`: zero for orthonormal rows, positive when rows overlap.
    pub fn orthogonality_penalty(&self) -> Result<Tensor> {
        let heads = self.num_heads();
        let gram = self.vectors.matmul(&self.vectors.transpose())?;
        let eye = Tensor::new(Array2::<f32>::eye(heads).into_dyn(), false);
        Ok(gram.sub(&eye).pow(2.0).mean())
    }
}

/// Output of [`ContextAggregator::aggregate`].
pub struct ContextAggregation {
    /// Attention weights `(B, T, H)`; zero on padding.
    pub attention: Tensor,
    /// Context matrix `(B, H, C)`.
    pub matrix: Tensor,
}

/// Turns token encodings into one attention-weighted context vector per head.
pub struct ContextAggregator {
    attention_encoder: Box<dyn SequenceEncoder>,
}

impl ContextAggregator {
    pub fn new(attention_encoder: Box<dyn SequenceEncoder>) -> Self {
        ContextAggregator { attention_encoder }
    }

    pub fn num_heads(&self) -> usize {
        self.attention_encoder.output_dim()
    }

    pub fn input_dim(&self) -> usize {
        self.attention_encoder.input_dim()
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        self.attention_encoder.parameters()
    }

    /// `encodings` is `(B, T, C)`, `mask` is `(B, T)` with 1.0 on real tokens.
    pub fn aggregate(&self, encodings: &Tensor, mask: &Tensor) -> Result<ContextAggregation> {
        let logits = self.attention_encoder.encode(encodings, mask)?;
        let attention = Self::attend(&logits, mask)?;
        // (B, H, T) x (B, T, C) -> (B, H, C)
        let matrix = attention.transpose().bmm(encodings)?;
        Ok(ContextAggregation { attention, matrix })
    }

    /// Masked softmax of `(B, T, H)` logits over the time axis.
    pub fn attend(logits: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (shape, mask_shape) = (logits.shape(), mask.shape());
        if shape.len() != 3 || mask_shape != shape[..2] {
            return Err(CvddError::shape(format!(
                "attention logits {:?} do not match mask {:?}",
                shape, mask_shape
            )));
        }
        let mask = mask.reshape(vec![shape[0], shape[1], 1])?;
        Ok(logits.masked_softmax(&mask, 1))
    }
}

/// Converts a boolean padding mask into the 0/1 tensor the ops expect.
pub fn mask_tensor(mask: &ndarray::Array2<bool>) -> Tensor {
    let values: ArrayD<f32> = mask.mapv(|m| if m { 1.0 } else { 0.0 }).into_dyn();
    Tensor::new(values, false)
}
