//! Sequence-to-sequence encoders used for the context and attention stages.
//!
//! Only the width contract matters to the model: an encoder maps padded
//! `(B, T, input_dim)` inputs plus a `(B, T)` mask to `(B, T, output_dim)`.

use crate::error::{CvddError, Result};
use crate::nn::{Linear, Module};
use crate::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Pluggable encoder capability.
pub trait SequenceEncoder: Send + Sync {
    fn input_dim(&self) -> usize;

    fn output_dim(&self) -> usize;

    /// Encodes `inputs` (B, T, input_dim); padded positions come out as zeros.
    fn encode(&self, inputs: &Tensor, mask: &Tensor) -> Result<Tensor>;

    fn parameters(&self) -> Vec<Tensor>;
}

// (B, T) -> (B, T, 1) so the mask broadcasts over features.
fn feature_mask(mask: &Tensor) -> Result<Tensor> {
    let mut shape = mask.shape();
    shape.push(1);
    mask.reshape(shape)
}

/// Identity encoder; only zeroes padded positions.
pub struct PassThroughEncoder {
    dim: usize,
}

impl PassThroughEncoder {
    pub fn new(dim: usize) -> Self {
        PassThroughEncoder { dim }
    }
}

impl SequenceEncoder for PassThroughEncoder {
    fn input_dim(&self) -> usize {
        self.dim
    }

    fn output_dim(&self) -> usize {
        self.dim
    }

    fn encode(&self, inputs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        Ok(inputs.mul(&feature_mask(mask)?))
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Tanh,
}

impl Activation {
    fn apply(self, t: &Tensor) -> Tensor {
        match self {
            Activation::Linear => t.clone(),
            Activation::Relu => t.relu(),
            Activation::Tanh => t.tanh(),
        }
    }
}

/// A stack of position-wise linear layers, each followed by its activation.
pub struct FeedForwardEncoder {
    layers: Vec<Linear>,
    activations: Vec<Activation>,
}

impl FeedForwardEncoder {
    /// `activations` is either one entry per layer or a single entry shared by all.
    pub fn new(
        input_dim: usize,
        hidden_dims: &[usize],
        activations: &[Activation],
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if hidden_dims.is_empty() {
            return Err(CvddError::config("feedforward encoder needs at least one layer"));
        }
        let activations = match activations.len() {
            0 => vec![Activation::Linear; hidden_dims.len()],
            1 => vec![activations[0]; hidden_dims.len()],
            n if n == hidden_dims.len() => activations.to_vec(),
            n => {
                return Err(CvddError::config(format!(
                    "feedforward encoder has {} layers but {} activations",
                    hidden_dims.len(),
                    n
                )))
            }
        };
        let mut layers = Vec::with_capacity(hidden_dims.len());
        let mut width = input_dim;
        for &out in hidden_dims {
            layers.push(Linear::new(width, out, true, rng));
            width = out;
        }
        Ok(FeedForwardEncoder {
            layers,
            activations,
        })
    }
}

impl SequenceEncoder for FeedForwardEncoder {
    fn input_dim(&self) -> usize {
        self.layers.first().map(Linear::in_features).unwrap_or(0)
    }

    fn output_dim(&self) -> usize {
        self.layers.last().map(Linear::out_features).unwrap_or(0)
    }

    fn encode(&self, inputs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mut hidden = inputs.clone();
        for (layer, activation) in self.layers.iter().zip(&self.activations) {
            hidden = activation.apply(&layer.forward(&hidden)?);
        }
        Ok(hidden.mul(&feature_mask(mask)?))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|layer| layer.parameters()).collect()
    }
}

/// Closed set of encoders selectable from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EncoderConfig {
    PassThrough {
        dim: usize,
    },
    #[serde(rename = "feedforward")]
    FeedForward {
        input_dim: usize,
        hidden_dims: Vec<usize>,
        #[serde(default)]
        activations: Vec<Activation>,
    },
}

impl EncoderConfig {
    pub fn input_dim(&self) -> usize {
        match self {
            EncoderConfig::PassThrough { dim } => *dim,
            EncoderConfig::FeedForward { input_dim, .. } => *input_dim,
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            EncoderConfig::PassThrough { dim } => *dim,
            EncoderConfig::FeedForward {
                input_dim,
                hidden_dims,
                ..
            } => hidden_dims.last().copied().unwrap_or(*input_dim),
        }
    }

    pub fn build(&self, rng: &mut impl Rng) -> Result<Box<dyn SequenceEncoder>> {
        if self.input_dim() == 0 || self.output_dim() == 0 {
            return Err(CvddError::config(format!("encoder widths must be positive: {:?}", self)));
        }
        let encoder: Box<dyn SequenceEncoder> = match self {
            EncoderConfig::PassThrough { dim } => Box::new(PassThroughEncoder::new(*dim)),
            EncoderConfig::FeedForward {
                input_dim,
                hidden_dims,
                activations,
            } => Box::new(FeedForwardEncoder::new(*input_dim, hidden_dims, activations, rng)?),
        };
        Ok(encoder)
    }
}
