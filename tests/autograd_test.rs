use cvdd::tensor::Tensor;
use ndarray::{arr1, arr2, array, ArrayD, IxDyn};

// Central finite differences of a scalar function.
fn numeric_gradient<F>(f: F, x: &ArrayD<f32>, h: f32) -> ArrayD<f32>
where
    F: Fn(&ArrayD<f32>) -> f32,
{
    let mut grad = ArrayD::zeros(x.dim());
    for i in 0..x.len() {
        let base = x.as_slice().unwrap()[i].abs();
        let h_local = h * (1.0 + base);
        let mut x_plus = x.clone();
        let mut x_minus = x.clone();
        x_plus.as_slice_mut().unwrap()[i] += h_local;
        x_minus.as_slice_mut().unwrap()[i] -= h_local;
        grad.as_slice_mut().unwrap()[i] = (f(&x_plus) - f(&x_minus)) / (2.0 * h_local);
    }
    grad
}

fn assert_close(a: &ArrayD<f32>, b: &ArrayD<f32>, tol: f32) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < tol, "{} vs {} (tol {})", x, y, tol);
    }
}

#[test]
fn test_simple_backward() {
    let a = Tensor::new(arr1(&[2.0]).into_dyn(), true);
    let b = Tensor::new(arr1(&[3.0]).into_dyn(), true);
    let c = a.add(&b);
    c.backward();

    assert_eq!(a.grad().unwrap(), arr1(&[1.0]).into_dyn());
    assert_eq!(b.grad().unwrap(), arr1(&[1.0]).into_dyn());
}

#[test]
fn test_diamond_graph_is_not_double_counted() {
    // y = (x * 2) * (x + 1) ; dy/dx = 4x + 2
    let x = Tensor::new(arr1(&[1.0f32, 3.0]).into_dyn(), true);
    let left = x.scale(2.0);
    let right = x.add(&Tensor::scalar(1.0));
    let y = left.mul(&right).sum();
    y.backward();
    assert_eq!(x.grad().unwrap(), arr1(&[6.0, 14.0]).into_dyn());
}

#[test]
fn test_same_tensor_twice_does_not_deadlock() {
    let x = Tensor::new(arr1(&[3.0f32]).into_dyn(), true);
    let y = x.mul(&x);
    y.backward();
    assert_eq!(y.data(), arr1(&[9.0]).into_dyn());
    assert_eq!(x.grad().unwrap(), arr1(&[6.0]).into_dyn());
}

#[test]
fn test_broadcast_gradient_is_reduced() {
    let a = Tensor::new(ArrayD::from_elem(IxDyn(&[2, 3]), 1.0), true);
    let b = Tensor::new(arr1(&[1.0f32, 2.0, 3.0]).into_dyn(), true);
    a.mul(&b).sum().backward();
    assert_eq!(b.grad().unwrap(), arr1(&[2.0, 2.0, 2.0]).into_dyn());
    assert_eq!(a.grad().unwrap(), arr2(&[[1.0, 2.0, 3.0], [1.0, 2.0, 3.0]]).into_dyn());
}

#[test]
fn test_div_and_pow_backward() {
    let x0 = arr1(&[0.5f32, 1.5, -2.0]).into_dyn();
    let x = Tensor::new(x0.clone(), true);
    let denom = Tensor::new(arr1(&[2.0f32, 4.0, 1.0]).into_dyn(), false);
    x.pow(3.0).div(&denom).sum().backward();
    let numeric = numeric_gradient(
        |v| {
            let t = Tensor::new(v.clone(), false);
            t.pow(3.0).div(&denom).sum().item()
        },
        &x0,
        1e-3,
    );
    assert_close(&x.grad().unwrap(), &numeric, 1e-2);
}

#[test]
fn test_bmm_and_transpose_backward() {
    let a0 = ArrayD::from_shape_fn(IxDyn(&[2, 3, 2]), |d| (d[0] + 2 * d[1]) as f32 * 0.1 - d[2] as f32);
    let b0 = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4]), |d| (d[0] * d[2]) as f32 * 0.2 + d[1] as f32);
    let a = Tensor::new(a0.clone(), true);
    let b = Tensor::new(b0.clone(), false);
    let out = a.transpose().bmm(&b).unwrap();
    assert_eq!(out.shape(), vec![2, 2, 4]);
    out.pow(2.0).mean().backward();

    let numeric = numeric_gradient(
        |v| {
            let t = Tensor::new(v.clone(), false);
            t.transpose().bmm(&b).unwrap().pow(2.0).mean().item()
        },
        &a0,
        1e-3,
    );
    assert_close(&a.grad().unwrap(), &numeric, 2e-2);
}

#[test]
fn test_masked_softmax_backward() {
    let x0 = array![[[0.2f32, -0.3], [1.0, 0.4], [0.0, 2.0]]].into_dyn();
    let mask = Tensor::new(array![[[1.0f32], [1.0], [0.0]]].into_dyn(), false);
    let weights = Tensor::new(array![[[1.0f32, -2.0], [0.5, 3.0], [4.0, 4.0]]].into_dyn(), false);
    let x = Tensor::new(x0.clone(), true);
    x.masked_softmax(&mask, 1).mul(&weights).sum().backward();
    let grad = x.grad().unwrap();
    assert_eq!(grad[[0, 2, 0]], 0.0);

    let numeric = numeric_gradient(
        |v| {
            Tensor::new(v.clone(), false)
                .masked_softmax(&mask, 1)
                .mul(&weights)
                .sum()
                .item()
        },
        &x0,
        1e-3,
    );
    assert_close(&grad, &numeric, 1e-2);
}

#[test]
fn test_norm_and_sum_axis() {
    let x = Tensor::new(arr2(&[[3.0f32, 4.0], [0.0, 0.0]]).into_dyn(), true);
    let n = x.norm(1);
    assert_eq!(n.shape(), vec![2, 1]);
    assert_eq!(n.data(), arr2(&[[5.0], [0.0]]).into_dyn());
    n.sum().backward();
    let g = x.grad().unwrap();
    assert!((g[[0, 0]] - 0.6).abs() < 1e-6);
    assert_eq!(g[[1, 1]], 0.0);

    let s = Tensor::new(arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn(), false).sum_axis(0);
    assert_eq!(s.data(), arr1(&[4.0, 6.0]).into_dyn());
}

#[test]
fn test_matmul_shape_is_checked() {
    let a = Tensor::new(ArrayD::zeros(IxDyn(&[2, 3])), false);
    let b = Tensor::new(ArrayD::zeros(IxDyn(&[2, 3])), false);
    assert!(a.matmul(&b).is_err());
    assert!(a.reshape(vec![4]).is_err());
}
