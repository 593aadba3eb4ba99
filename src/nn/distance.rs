//! Pairwise metrics between equal-width vectors, reduced over the last axis.
//!
//! Both metrics broadcast over any leading (batch, head) axes and stay on the
//! autograd graph, so they can sit inside a trainable loss.

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Added to every norm before dividing, so zero vectors normalize to zero.
pub const TINY: f32 = 1e-13;

/// A differentiable metric over the last axis: `(..., D) x (..., D) -> (...)`.
pub trait Distance: Send + Sync {
    fn distance(&self, source: &Tensor, target: &Tensor) -> Tensor;
}

fn unit(t: &Tensor) -> Tensor {
    let last = t.shape().len().saturating_sub(1);
    t.div(&t.norm(last).add(&Tensor::scalar(TINY)))
}

fn cosine(source: &Tensor, target: &Tensor) -> Tensor {
    let last = source.shape().len().max(target.shape().len()).saturating_sub(1);
    unit(source).mul(&unit(target)).sum_axis(last)
}

/// `0.5 * (1 - cos)`: 0 for identical directions, 1 for opposite ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineDistance;

impl Distance for CosineDistance {
    fn distance(&self, source: &Tensor, target: &Tensor) -> Tensor {
        let sim = cosine(source, target);
        Tensor::scalar(1.0).sub(&sim).scale(0.5)
    }
}

/// The raw cosine of the angle, in `[-1, 1]`. Larger means closer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSimilarity;

impl Distance for CosineSimilarity {
    fn distance(&self, source: &Tensor, target: &Tensor) -> Tensor {
        cosine(source, target)
    }
}

/// Closed set of metrics selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceKind {
    #[default]
    Cosine,
    CosineSimilarity,
}

impl DistanceKind {
    pub fn build(self) -> Box<dyn Distance> {
        match self {
            DistanceKind::Cosine => Box::new(CosineDistance),
            DistanceKind::CosineSimilarity => Box::new(CosineSimilarity),
        }
    }
}
