use crate::tensor::Tensor;
use ndarray::{Array2, ArrayD, ArrayView2, Axis, Ix2, Ix3, IxDyn};

// Helper: reduce `grad` to `target_shape` by summing over broadcasted axes.
fn reduce_grad_to_shape(grad: &ArrayD<f32>, target_shape: &[usize]) -> ArrayD<f32> {
    if grad.shape() == target_shape {
        return grad.clone();
    }

    let mut res = grad.clone();
    // Leading axes the target does not have are summed away first.
    while res.ndim() > target_shape.len() {
        res = res.sum_axis(Axis(0));
    }
    for (axis, &dim) in target_shape.iter().enumerate() {
        if dim == 1 && res.shape()[axis] != 1 {
            res = res.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    res
}

// Helper: permute axes so that `axis` becomes the last axis.
fn permute_to_last(a: &ArrayD<f32>, axis: usize) -> (ArrayD<f32>, Option<Vec<usize>>) {
    let ndim = a.ndim();
    if axis == ndim - 1 {
        return (a.clone(), None);
    }
    let mut perm: Vec<usize> = (0..ndim).collect();
    let axis_val = perm.remove(axis);
    perm.push(axis_val);
    let permuted = a
        .view()
        .permuted_axes(perm.clone())
        .as_standard_layout()
        .to_owned();
    (permuted, Some(perm))
}

fn permute_back(a: ArrayD<f32>, perm: &[usize]) -> ArrayD<f32> {
    let mut inv = vec![0usize; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    a.view().permuted_axes(inv).as_standard_layout().to_owned()
}

fn clamp_axis(axis: usize, ndim: usize) -> usize {
    if axis >= ndim {
        ndim.saturating_sub(1)
    } else {
        axis
    }
}

// Softmax over the last axis of `x`; positions where `valid` is false get 0.
// A lane without any valid position stays all zeros.
fn softmax_last_axis(x: &ArrayD<f32>, valid: Option<&ArrayD<bool>>) -> ArrayD<f32> {
    let mut out = x.clone();
    let last_axis = Axis(out.ndim() - 1);
    match valid {
        None => {
            for mut lane in out.lanes_mut(last_axis) {
                let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for v in lane.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                for v in lane.iter_mut() {
                    *v /= sum;
                }
            }
        }
        Some(valid) => {
            for (mut lane, valid_lane) in out.lanes_mut(last_axis).into_iter().zip(valid.lanes(last_axis)) {
                let mut max = f32::NEG_INFINITY;
                for (&v, &ok) in lane.iter().zip(valid_lane.iter()) {
                    if ok {
                        max = max.max(v);
                    }
                }
                let mut sum = 0.0f32;
                for (v, &ok) in lane.iter_mut().zip(valid_lane.iter()) {
                    *v = if ok { (*v - max).exp() } else { 0.0 };
                    sum += *v;
                }
                if sum > 0.0 {
                    for v in lane.iter_mut() {
                        *v /= sum;
                    }
                }
            }
        }
    }
    out
}

// grad_in = y * (grad_out - sum(grad_out * y)) along the last axis.
fn softmax_backward_last_axis(y: &ArrayD<f32>, output_grad: &ArrayD<f32>) -> ArrayD<f32> {
    let last_axis = Axis(y.ndim() - 1);
    let mut grad_in = output_grad.clone();
    for (mut g_lane, y_lane) in grad_in.lanes_mut(last_axis).into_iter().zip(y.lanes(last_axis)) {
        let s: f32 = g_lane.iter().zip(y_lane.iter()).map(|(g, yy)| g * yy).sum();
        for (gi, &yy) in g_lane.iter_mut().zip(y_lane.iter()) {
            *gi = yy * (*gi - s);
        }
    }
    grad_in
}

/// A trait for operations that can be performed on tensors.
pub trait Operation: Send + Sync {
    /// Performs the forward pass of the operation.
    ///
    /// # Arguments
    ///
    /// * `inputs` - The input tensors.
    /// * `output` - A mutable reference to the output tensor's data.
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>);

    /// Performs the backward pass of the operation.
    ///
    /// Returns one gradient per input, each shaped like that input.
    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>>;
}

/// Reshape operation: changes tensor shape but keeps elements order
pub struct Reshape {
    pub shape: Vec<usize>,
}

impl Reshape {
    pub fn new(shape: Vec<usize>) -> Self {
        Reshape { shape }
    }
}

impl Operation for Reshape {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let a = inputs[0].data();
        *output = a
            .to_shape(IxDyn(&self.shape))
            .expect("Reshape forward: element count checked by Tensor::reshape")
            .to_owned();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let in_shape = inputs[0].shape();
        let g = output_grad
            .to_shape(IxDyn(&in_shape))
            .expect("Reshape backward: element count is unchanged")
            .to_owned();
        vec![g]
    }
}

/// Sum operation: sums all elements to a scalar
pub struct Sum;

impl Operation for Sum {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let s = inputs[0].lock().data.sum();
        *output = ArrayD::from_elem(IxDyn(&[]), s);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].shape();
        let val = output_grad.iter().next().copied().unwrap_or(0.0);
        vec![ArrayD::from_elem(IxDyn(&a_shape), val)]
    }
}

/// Mean operation: computes mean over all elements to a scalar
pub struct Mean;

impl Operation for Mean {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let lock = inputs[0].lock();
        let mean = lock.data.sum() / (lock.data.len().max(1) as f32);
        *output = ArrayD::from_elem(IxDyn(&[]), mean);
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a_shape = inputs[0].shape();
        let n = a_shape.iter().product::<usize>().max(1);
        let val = output_grad.iter().next().copied().unwrap_or(0.0);
        vec![ArrayD::from_elem(IxDyn(&a_shape), val / n as f32)]
    }
}

/// Sum along one axis, removing it.
pub struct SumAxis {
    pub axis: usize,
}

impl SumAxis {
    pub fn new(axis: usize) -> Self {
        SumAxis { axis }
    }
}

impl Operation for SumAxis {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let lock = inputs[0].lock();
        let axis = clamp_axis(self.axis, lock.data.ndim());
        *output = lock.data.sum_axis(Axis(axis));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let in_shape = inputs[0].shape();
        let axis = clamp_axis(self.axis, in_shape.len());
        let grad = output_grad
            .view()
            .insert_axis(Axis(axis))
            .broadcast(IxDyn(&in_shape))
            .expect("SumAxis backward: reduced gradient broadcasts to input shape")
            .to_owned();
        vec![grad]
    }
}

/// L2 norm along one axis, keeping it with length 1.
///
/// The gradient at a zero vector is taken to be zero.
pub struct L2Norm {
    pub axis: usize,
}

impl L2Norm {
    pub fn new(axis: usize) -> Self {
        L2Norm { axis }
    }
}

impl Operation for L2Norm {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let lock = inputs[0].lock();
        let axis = clamp_axis(self.axis, lock.data.ndim());
        *output = lock
            .data
            .mapv(|v| v * v)
            .sum_axis(Axis(axis))
            .mapv(f32::sqrt)
            .insert_axis(Axis(axis));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let x = inputs[0].data();
        let axis = clamp_axis(self.axis, x.ndim());
        let norm = x
            .mapv(|v| v * v)
            .sum_axis(Axis(axis))
            .mapv(f32::sqrt)
            .insert_axis(Axis(axis));
        let inv = norm.mapv(|n| if n > 0.0 { 1.0 / n } else { 0.0 });
        vec![&x * &inv * output_grad]
    }
}

/// The addition operation.
pub struct Add;

impl Operation for Add {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        *output = &a + &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let grad_a = reduce_grad_to_shape(output_grad, &inputs[0].shape());
        let grad_b = reduce_grad_to_shape(output_grad, &inputs[1].shape());
        vec![grad_a, grad_b]
    }
}

/// The multiplication operation.
pub struct Mul;

impl Operation for Mul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        *output = &a * &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        let grad_a = reduce_grad_to_shape(&(&b * output_grad), a.shape());
        let grad_b = reduce_grad_to_shape(&(&a * output_grad), b.shape());
        vec![grad_a, grad_b]
    }
}

/// The subtraction operation.
pub struct Sub;

impl Operation for Sub {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        *output = &a - &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let grad_a = reduce_grad_to_shape(output_grad, &inputs[0].shape());
        let grad_b = reduce_grad_to_shape(&(-output_grad), &inputs[1].shape());
        vec![grad_a, grad_b]
    }
}

/// The division operation.
pub struct Div;

impl Operation for Div {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        *output = &a / &b;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        let grad_a = output_grad / &b;
        let grad_b = -(&a * output_grad) / (&b * &b);
        vec![
            reduce_grad_to_shape(&grad_a, a.shape()),
            reduce_grad_to_shape(&grad_b, b.shape()),
        ]
    }
}

/// The power operation.
pub struct Pow(pub f32);

impl Operation for Pow {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0].lock().data.mapv(|x| x.powf(self.0));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0].data();
        vec![output_grad * &a.mapv(|x| self.0 * x.powf(self.0 - 1.0))]
    }
}

/// The 2-D matrix multiplication operation.
pub struct MatMul;

fn as_matrix(a: &ArrayD<f32>) -> ArrayView2<'_, f32> {
    a.view()
        .into_dimensionality::<Ix2>()
        .expect("MatMul expects 2D operands")
}

impl Operation for MatMul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        *output = as_matrix(&a).dot(&as_matrix(&b)).into_dyn();
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        let g = as_matrix(output_grad);
        let grad_a = g.dot(&as_matrix(&b).t()).into_dyn();
        let grad_b = as_matrix(&a).t().dot(&g).into_dyn();
        vec![grad_a, grad_b]
    }
}

/// Batched matrix multiplication: (B, M, K) x (B, K, N) -> (B, M, N).
pub struct BatchMatMul;

fn batched(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(ArrayView2<'_, f32>, ArrayView2<'_, f32>) -> Array2<f32>,
) -> ArrayD<f32> {
    let a3 = a
        .view()
        .into_dimensionality::<Ix3>()
        .expect("BatchMatMul expects 3D operands");
    let b3 = b
        .view()
        .into_dimensionality::<Ix3>()
        .expect("BatchMatMul expects 3D operands");
    let products: Vec<Array2<f32>> = a3
        .outer_iter()
        .zip(b3.outer_iter())
        .map(|(x, y)| f(x, y))
        .collect();
    let (rows, cols) = products.first().map(|p| p.dim()).unwrap_or((0, 0));
    let mut out = ndarray::Array3::<f32>::zeros((products.len(), rows, cols));
    for (mut slot, p) in out.outer_iter_mut().zip(products.iter()) {
        slot.assign(p);
    }
    out.into_dyn()
}

impl Operation for BatchMatMul {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        *output = batched(&a, &b, |x, y| x.dot(&y));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let (a, b) = (inputs[0].data(), inputs[1].data());
        // dA = G · Bᵗ, dB = Aᵗ · G
        let grad_a = batched(output_grad, &b, |g, y| g.dot(&y.t()));
        let grad_b = batched(&a, output_grad, |x, g| x.t().dot(&g));
        vec![grad_a, grad_b]
    }
}

/// Swaps the last two axes.
pub struct SwapLastAxes;

fn swap_last(a: &ArrayD<f32>) -> ArrayD<f32> {
    let n = a.ndim();
    if n < 2 {
        return a.clone();
    }
    let mut v = a.view();
    v.swap_axes(n - 2, n - 1);
    v.as_standard_layout().to_owned()
}

impl Operation for SwapLastAxes {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = swap_last(&inputs[0].lock().data);
    }

    fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        vec![swap_last(output_grad)]
    }
}

/// The ReLU activation.
pub struct ReLU;

impl Operation for ReLU {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0].lock().data.mapv(|x| x.max(0.0));
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0].data();
        vec![output_grad * &a.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 })]
    }
}

/// The tanh activation.
pub struct Tanh;

impl Operation for Tanh {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        *output = inputs[0].lock().data.mapv(|x| x.tanh());
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let a = inputs[0].data();
        vec![output_grad * &a.mapv(|x| 1.0 - x.tanh().powi(2))]
    }
}

/// Softmax operation (numerically stable), forward and backward on axis
pub struct Softmax {
    pub axis: usize,
}

impl Softmax {
    pub fn new(axis: usize) -> Self {
        Softmax { axis }
    }
}

impl Operation for Softmax {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let x = inputs[0].data();
        let axis = clamp_axis(self.axis, x.ndim());
        let (px, perm) = permute_to_last(&x, axis);
        let y = softmax_last_axis(&px, None);
        *output = match perm {
            Some(ref perm) => permute_back(y, perm),
            None => y,
        };
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let x = inputs[0].data();
        let axis = clamp_axis(self.axis, x.ndim());
        let (px, perm) = permute_to_last(&x, axis);
        let y = softmax_last_axis(&px, None);
        let (pg, _) = permute_to_last(output_grad, axis);
        let grad_in = softmax_backward_last_axis(&y, &pg);
        match perm {
            Some(ref perm) => vec![permute_back(grad_in, perm)],
            None => vec![grad_in],
        }
    }
}

/// Softmax over `axis` where the second input is a 0/1 mask broadcastable to
/// the first. Masked positions get zero weight; fully masked lanes are zero.
pub struct MaskedSoftmax {
    pub axis: usize,
}

impl MaskedSoftmax {
    pub fn new(axis: usize) -> Self {
        MaskedSoftmax { axis }
    }

    // Returns the permuted softmax output plus the permutation used.
    fn compute(&self, inputs: &[Tensor]) -> (ArrayD<f32>, Option<Vec<usize>>, usize) {
        let x = inputs[0].data();
        let mask = inputs[1].data();
        let axis = clamp_axis(self.axis, x.ndim());
        let valid = mask
            .broadcast(x.raw_dim())
            .expect("MaskedSoftmax: mask must broadcast to logits")
            .mapv(|m| m > 0.5);
        let (px, perm) = permute_to_last(&x, axis);
        let pvalid = match perm {
            Some(ref p) => valid.view().permuted_axes(p.clone()).as_standard_layout().to_owned(),
            None => valid,
        };
        (softmax_last_axis(&px, Some(&pvalid)), perm, axis)
    }
}

impl Operation for MaskedSoftmax {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let (y, perm, _) = self.compute(inputs);
        *output = match perm {
            Some(ref perm) => permute_back(y, perm),
            None => y,
        };
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let (y, perm, axis) = self.compute(inputs);
        let (pg, _) = permute_to_last(output_grad, axis);
        let grad_in = softmax_backward_last_axis(&y, &pg);
        let grad_x = match perm {
            Some(ref perm) => permute_back(grad_in, perm),
            None => grad_in,
        };
        let mask_shape = inputs[1].shape();
        vec![grad_x, ArrayD::zeros(IxDyn(&mask_shape))]
    }
}

/// Row gather from an embedding matrix. Inputs: weight (V, E), ids (any shape, ids stored as f32).
///
/// Out-of-range ids produce zero rows and receive no gradient.
pub struct EmbeddingLookup;

impl Operation for EmbeddingLookup {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let weight = inputs[0].data();
        let ids = inputs[1].data();
        let (vocab, dim) = (weight.shape()[0], weight.shape()[1]);
        let mut out_shape = ids.shape().to_vec();
        out_shape.push(dim);
        let mut rows = Array2::<f32>::zeros((ids.len(), dim));
        for (mut row, &id) in rows.outer_iter_mut().zip(ids.iter()) {
            let idx = id as usize;
            if id >= 0.0 && idx < vocab {
                row.assign(&weight.index_axis(Axis(0), idx));
            }
        }
        let out = rows
            .into_shape_with_order(IxDyn(&out_shape))
            .expect("EmbeddingLookup: element count unchanged");
        *output = out;
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let weight_shape = inputs[0].shape();
        let ids = inputs[1].data();
        let (vocab, dim) = (weight_shape[0], weight_shape[1]);
        let mut grad_w = ArrayD::zeros(IxDyn(&weight_shape));
        let grads = output_grad
            .to_shape((ids.len(), dim))
            .expect("EmbeddingLookup backward: gradient matches output shape");
        for (row, &id) in grads.outer_iter().zip(ids.iter()) {
            let idx = id as usize;
            if id >= 0.0 && idx < vocab {
                let mut target = grad_w.index_axis_mut(Axis(0), idx);
                target += &row;
            }
        }
        vec![grad_w, ArrayD::zeros(ids.raw_dim())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn reduce_grad_sums_broadcast_axes() {
        let g = ArrayD::from_elem(IxDyn(&[2, 3, 4]), 1.0f32);
        let r = reduce_grad_to_shape(&g, &[3, 4]);
        assert_eq!(r.shape(), &[3, 4]);
        assert!(r.iter().all(|&v| (v - 2.0).abs() < 1e-6));
        let r = reduce_grad_to_shape(&g, &[2, 1, 4]);
        assert_eq!(r.shape(), &[2, 1, 4]);
        assert!(r.iter().all(|&v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn softmax_backward_sum_zero() {
        let x = array![[0.1f32, 0.2, -0.3], [0.0, 0.1, 0.2]].into_dyn();
        let t = Tensor::new(x, true);
        let soft = Softmax::new(1);
        let out_grad = ArrayD::from_elem(IxDyn(&[2, 3]), 1.0f32);
        let grads = soft.backward(&[t], &out_grad);
        for v in grads[0].iter() {
            assert!(v.abs() < 1e-6, "non-zero grad: {}", v);
        }
    }

    #[test]
    fn masked_softmax_zeroes_padding_and_empty_lanes() {
        let x = Tensor::new(array![[1.0f32, 2.0, 3.0], [1.0, 1.0, 1.0]].into_dyn(), false);
        let mask = Tensor::new(array![[1.0f32, 1.0, 0.0], [0.0, 0.0, 0.0]].into_dyn(), false);
        let op = MaskedSoftmax::new(1);
        let mut out = ArrayD::zeros(IxDyn(&[]));
        op.forward(&[x, mask], &mut out);
        assert_eq!(out[[0, 2]], 0.0);
        assert!((out[[0, 0]] + out[[0, 1]] - 1.0).abs() < 1e-6);
        assert!(out.index_axis(Axis(0), 1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn embedding_lookup_out_of_range_is_zero() {
        let emb = Tensor::new(ArrayD::from_elem(IxDyn(&[3, 2]), 1.0), true);
        let ids = Tensor::new(array![[0.0f32, 5.0]].into_dyn(), false);
        let mut out = ArrayD::zeros(IxDyn(&[]));
        EmbeddingLookup.forward(&[emb.clone(), ids.clone()], &mut out);
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert_eq!(out[[0, 0, 0]], 1.0);
        assert_eq!(out[[0, 1, 0]], 0.0);
        let g = EmbeddingLookup.backward(&[emb, ids], &ArrayD::from_elem(IxDyn(&[1, 2, 2]), 1.0));
        assert_eq!(g[0][[0, 0]], 1.0);
        assert_eq!(g[0][[1, 0]], 0.0);
    }
}
