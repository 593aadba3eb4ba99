use crate::autograd::AutogradEngine;
use crate::error::{CvddError, Result};
use crate::ops::{
    Add, BatchMatMul, Div, EmbeddingLookup, L2Norm, MaskedSoftmax, MatMul, Mean, Mul, Operation,
    Pow, ReLU, Reshape, Softmax, Sub, Sum, SumAxis, SwapLastAxes, Tanh,
};
use ndarray::{ArrayD, IxDyn};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

/// `TensorData` contains the actual data of a tensor, along with metadata for automatic differentiation.
pub struct TensorData {
    /// The tensor's data, stored as a dynamically-dimensioned array.
    pub data: ArrayD<f32>,
    /// The gradient of the tensor, if it has one.
    pub grad: Option<ArrayD<f32>>,
    /// The operation that created this tensor, if any.
    pub creator: Option<Arc<dyn Operation>>,
    /// The input tensors that were used to create this tensor.
    pub inputs: Vec<Tensor>,
    /// Whether this tensor requires a gradient.
    pub requires_grad: bool,
}

/// A multi-dimensional array that supports reverse-mode automatic differentiation.
///
/// A `Tensor` is a cheap, clonable handle. Clones share storage, so an optimizer
/// holding a clone of a parameter updates the very tensor the model reads.
#[derive(Clone)]
pub struct Tensor(Arc<Mutex<TensorData>>);

impl Tensor {
    /// Creates a new leaf tensor.
    ///
    /// # Arguments
    ///
    /// * `data` - The tensor's data.
    /// * `requires_grad` - Whether this tensor should accumulate a gradient.
    pub fn new(data: ArrayD<f32>, requires_grad: bool) -> Self {
        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator: None,
            inputs: vec![],
            requires_grad,
        })))
    }

    /// Creates a zero-dimensional constant.
    pub fn scalar(value: f32) -> Self {
        Tensor::new(ArrayD::from_elem(IxDyn(&[]), value), false)
    }

    /// Applies an operation to a set of input tensors, recording it in the graph.
    pub fn apply(op: Arc<dyn Operation>, inputs: &[Tensor]) -> Tensor {
        let requires_grad = inputs.iter().any(|t| t.requires_grad());
        let mut data = ArrayD::zeros(IxDyn(&[]));
        op.forward(inputs, &mut data);

        Tensor(Arc::new(Mutex::new(TensorData {
            data,
            grad: None,
            creator: Some(op),
            inputs: inputs.to_vec(),
            requires_grad,
        })))
    }

    /// Adds two tensors (numpy broadcasting).
    pub fn add(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Add), &[self.clone(), other.clone()])
    }

    /// Multiplies two tensors element-wise (numpy broadcasting).
    pub fn mul(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Mul), &[self.clone(), other.clone()])
    }

    /// Subtracts two tensors (numpy broadcasting).
    pub fn sub(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Sub), &[self.clone(), other.clone()])
    }

    /// Divides two tensors (numpy broadcasting).
    pub fn div(&self, other: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(Div), &[self.clone(), other.clone()])
    }

    /// Multiplies every element by a constant.
    pub fn scale(&self, factor: f32) -> Tensor {
        self.mul(&Tensor::scalar(factor))
    }

    /// Raises a tensor to a power.
    pub fn pow(&self, power: f32) -> Tensor {
        Tensor::apply(Arc::new(Pow(power)), &[self.clone()])
    }

    /// Performs 2-D matrix multiplication.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let (a, b) = (self.shape(), other.shape());
        if a.len() != 2 || b.len() != 2 || a[1] != b[0] {
            return Err(CvddError::shape(format!(
                "matmul expects (m, k) x (k, n), got {:?} x {:?}",
                a, b
            )));
        }
        Ok(Tensor::apply(Arc::new(MatMul), &[self.clone(), other.clone()]))
    }

    /// Batched matrix multiplication: (B, M, K) x (B, K, N) -> (B, M, N).
    pub fn bmm(&self, other: &Tensor) -> Result<Tensor> {
        let (a, b) = (self.shape(), other.shape());
        if a.len() != 3 || b.len() != 3 || a[0] != b[0] || a[2] != b[1] {
            return Err(CvddError::shape(format!(
                "bmm expects (b, m, k) x (b, k, n), got {:?} x {:?}",
                a, b
            )));
        }
        Ok(Tensor::apply(Arc::new(BatchMatMul), &[self.clone(), other.clone()]))
    }

    /// Swaps the last two axes, e.g. (B, T, H) -> (B, H, T).
    pub fn transpose(&self) -> Tensor {
        Tensor::apply(Arc::new(SwapLastAxes), &[self.clone()])
    }

    /// Applies the ReLU activation function.
    pub fn relu(&self) -> Tensor {
        Tensor::apply(Arc::new(ReLU), &[self.clone()])
    }

    /// Applies the tanh activation function.
    pub fn tanh(&self) -> Tensor {
        Tensor::apply(Arc::new(Tanh), &[self.clone()])
    }

    /// Computes the sum of the tensor's elements.
    pub fn sum(&self) -> Tensor {
        Tensor::apply(Arc::new(Sum), &[self.clone()])
    }

    /// Computes the mean of the tensor's elements.
    pub fn mean(&self) -> Tensor {
        Tensor::apply(Arc::new(Mean), &[self.clone()])
    }

    /// Sums along `axis`, removing it.
    pub fn sum_axis(&self, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(SumAxis::new(axis)), &[self.clone()])
    }

    /// Averages along `axis`, removing it.
    pub fn mean_axis(&self, axis: usize) -> Tensor {
        let n = self.shape().get(axis).copied().unwrap_or(1).max(1);
        self.sum_axis(axis).scale(1.0 / n as f32)
    }

    /// L2 norm along `axis`, keeping the axis with length 1.
    pub fn norm(&self, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(L2Norm::new(axis)), &[self.clone()])
    }

    /// Numerically stable softmax along `axis`.
    pub fn softmax(&self, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(Softmax::new(axis)), &[self.clone()])
    }

    /// Softmax along `axis` restricted to positions where `mask` is non-zero.
    ///
    /// `mask` must broadcast to this tensor's shape. Masked positions receive
    /// exactly zero weight; a lane with no valid position is all zeros.
    pub fn masked_softmax(&self, mask: &Tensor, axis: usize) -> Tensor {
        Tensor::apply(Arc::new(MaskedSoftmax::new(axis)), &[self.clone(), mask.clone()])
    }

    /// Gathers rows of `weight` (V, E) for every id in `ids`, giving shape `ids.shape + [E]`.
    pub fn embedding_lookup(weight: &Tensor, ids: &Tensor) -> Tensor {
        Tensor::apply(Arc::new(EmbeddingLookup), &[weight.clone(), ids.clone()])
    }

    /// Reshapes the tensor.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Tensor> {
        let current = self.shape();
        if current.iter().product::<usize>() != shape.iter().product::<usize>() {
            return Err(CvddError::shape(format!(
                "Cannot reshape tensor from {:?} to {:?}",
                current, shape
            )));
        }
        Ok(Tensor::apply(Arc::new(Reshape::new(shape)), &[self.clone()]))
    }

    /// Locks the tensor's data for reading or writing.
    ///
    /// Never hold two guards of the same tensor; use [`Tensor::data`] when an
    /// operation may see one tensor as several inputs.
    pub fn lock(&self) -> MutexGuard<'_, TensorData> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns a copy of the tensor's values.
    pub fn data(&self) -> ArrayD<f32> {
        self.lock().data.clone()
    }

    /// Returns the tensor's shape.
    pub fn shape(&self) -> Vec<usize> {
        self.lock().data.shape().to_vec()
    }

    /// Returns the first element; intended for scalars such as losses.
    pub fn item(&self) -> f32 {
        self.lock().data.iter().next().copied().unwrap_or(0.0)
    }

    /// Returns a copy of the accumulated gradient.
    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.lock().grad.clone()
    }

    /// Clears the gradient of this tensor.
    pub fn zero_grad(&self) {
        self.lock().grad = None;
    }

    /// Returns whether this tensor requires gradients.
    pub fn requires_grad(&self) -> bool {
        self.lock().requires_grad
    }

    /// Performs backpropagation starting from this tensor.
    ///
    /// Gradients of every tensor in the graph with `requires_grad = true` are
    /// accumulated into their `grad` fields.
    pub fn backward(&self) {
        AutogradEngine::new().backward(self);
    }

    pub(crate) fn node_id(&self) -> *const Mutex<TensorData> {
        Arc::as_ptr(&self.0)
    }
}

impl Deref for Tensor {
    type Target = Arc<Mutex<TensorData>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Tensor {}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lock = self.lock();
        f.debug_struct("Tensor")
            .field("shape", &lock.data.shape())
            .field("requires_grad", &lock.requires_grad)
            .finish()
    }
}
