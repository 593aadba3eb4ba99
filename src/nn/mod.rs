use crate::error::{CvddError, Result};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use std::collections::HashMap;

pub mod context;
pub mod cvdd;
pub mod distance;
pub mod embedding;
pub mod encoder;

pub use context::{ContextAggregation, ContextAggregator, ContextVectorBank};
pub use cvdd::{Cvdd, CvddOutput};
pub use distance::{CosineDistance, CosineSimilarity, Distance, DistanceKind};
pub use embedding::{Embedding, TextEmbedder};
pub use encoder::{Activation, EncoderConfig, FeedForwardEncoder, PassThroughEncoder, SequenceEncoder};

/// A trait for neural network modules.
pub trait Module {
    /// Performs a forward pass through the module.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Returns the parameters of the module.
    fn parameters(&self) -> Vec<Tensor>;

    /// Default: return a vector of (name, Tensor) pairs for module parameters
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("{}.param{}", prefix, i), p))
            .collect()
    }
}

/// Uniform initialization in `[-bound, bound)`.
pub(crate) fn uniform(shape: &[usize], bound: f32, rng: &mut impl Rng) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.random_range(-bound..bound))
}

/// A linear (fully connected) layer.
#[derive(Clone)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Creates a new linear layer with Xavier-uniform weights.
    ///
    /// # Arguments
    ///
    /// * `in_features` - The number of input features.
    /// * `out_features` - The number of output features.
    /// * `bias` - Whether to include a bias term.
    /// * `rng` - Source of the initial weights.
    pub fn new(in_features: usize, out_features: usize, bias: bool, rng: &mut impl Rng) -> Self {
        let bound = (6.0 / (in_features + out_features).max(1) as f32).sqrt();
        let weight = Tensor::new(uniform(&[in_features, out_features], bound, rng), true);

        let bias = if bias {
            Some(Tensor::new(ArrayD::zeros(IxDyn(&[out_features])), true))
        } else {
            None
        };

        Linear { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[1]
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let input_shape = input.shape();
        let ndim = input_shape.len();
        if ndim == 0 || input_shape[ndim - 1] != self.in_features() {
            return Err(CvddError::shape(format!(
                "Linear expects trailing dimension {}, got shape {:?}",
                self.in_features(),
                input_shape
            )));
        }
        let output = if ndim == 2 {
            input.matmul(&self.weight)?
        } else {
            // Collapse leading dims to 2D [batch, features]
            let batch = input_shape[..ndim - 1].iter().product::<usize>();
            let out2 = input
                .reshape(vec![batch, self.in_features()])?
                .matmul(&self.weight)?;
            let mut out_shape = input_shape.clone();
            out_shape[ndim - 1] = self.out_features();
            out2.reshape(out_shape)?
        };
        Ok(match &self.bias {
            Some(bias) => output.add(bias),
            None => output,
        })
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(bias) = &self.bias {
            params.push(bias.clone());
        }
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = vec![(format!("{}.weight", prefix), self.weight.clone())];
        if let Some(b) = &self.bias {
            out.push((format!("{}.bias", prefix), b.clone()));
        }
        out
    }
}

/// A trait for optimizers.
pub trait Optimizer {
    /// Performs a single optimization step.
    fn step(&mut self, parameters: &[Tensor]);

    /// Sets the gradients of all parameters to zero.
    fn zero_grad(&mut self, parameters: &[Tensor]) {
        for param in parameters {
            param.zero_grad();
        }
    }

    /// Clip gradients in-place using global norm. Returns the norm before clipping.
    fn clip_gradients(&mut self, parameters: &[Tensor], max_norm: f32) -> f32 {
        let mut total_sq = 0.0f32;
        for p in parameters {
            if let Some(g) = &p.lock().grad {
                total_sq += g.iter().map(|v| v * v).sum::<f32>();
            }
        }
        let total_norm = total_sq.sqrt();
        if max_norm <= 0.0 || total_norm <= max_norm {
            return total_norm;
        }
        let scale = max_norm / (total_norm + 1e-12);
        for p in parameters {
            if let Some(g) = &mut p.lock().grad {
                g.mapv_inplace(|v| v * scale);
            }
        }
        total_norm
    }

    /// Current learning rate.
    fn learning_rate(&self) -> f32;
}

/// Stochastic Gradient Descent optimizer.
pub struct SGD {
    lr: f32,
    momentum: f32,
    velocity: HashMap<Tensor, ArrayD<f32>>,
}

impl SGD {
    /// Creates a new SGD optimizer.
    ///
    /// # Arguments
    ///
    /// * `lr` - The learning rate.
    /// * `momentum` - The momentum factor.
    pub fn new(lr: f32, momentum: f32) -> Self {
        SGD {
            lr,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, parameters: &[Tensor]) {
        for param in parameters {
            let mut param_lock = param.lock();
            let Some(grad) = param_lock.grad.clone() else {
                continue;
            };
            let velocity = self
                .velocity
                .entry(param.clone())
                .or_insert_with(|| ArrayD::zeros(grad.dim()));
            *velocity = &*velocity * self.momentum + &grad * (1.0 - self.momentum);
            let update = velocity.mapv(|v| v * self.lr);
            param_lock.data -= &update;
        }
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }
}

/// Adam optimizer.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: usize,
    m: HashMap<Tensor, ArrayD<f32>>,
    v: HashMap<Tensor, ArrayD<f32>>,
}

impl Adam {
    /// Creates a new Adam optimizer.
    ///
    /// # Arguments
    ///
    /// * `lr` - The learning rate.
    /// * `beta1` - The exponential decay rate for the first moment estimates.
    /// * `beta2` - The exponential decay rate for the second moment estimates.
    /// * `eps` - A small constant for numerical stability.
    pub fn new(lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Adam {
            lr,
            beta1,
            beta2,
            eps,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    /// Adam with the usual `(0.9, 0.999, 1e-8)` moments.
    pub fn with_lr(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn step(&mut self, parameters: &[Tensor]) {
        self.t += 1;

        for param in parameters {
            let mut param_lock = param.lock();
            let Some(grad) = param_lock.grad.clone() else {
                continue;
            };
            let m = self
                .m
                .entry(param.clone())
                .or_insert_with(|| ArrayD::zeros(grad.dim()));
            *m = &*m * self.beta1 + &grad * (1.0 - self.beta1);
            let v = self
                .v
                .entry(param.clone())
                .or_insert_with(|| ArrayD::zeros(grad.dim()));
            *v = &*v * self.beta2 + &(&grad * &grad) * (1.0 - self.beta2);

            let m_hat = &*m / (1.0 - self.beta1.powi(self.t as i32));
            let v_hat = &*v / (1.0 - self.beta2.powi(self.t as i32));

            let update = (m_hat / (v_hat.mapv(|x| x.sqrt()) + self.eps)) * self.lr;
            param_lock.data -= &update;
        }
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }
}
