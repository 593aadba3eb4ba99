use cvdd::nn::{Adam, Linear, Module, Optimizer, SGD};
use cvdd::tensor::Tensor;
use ndarray::{arr1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn test_linear_forward() {
    let mut rng = StdRng::seed_from_u64(0);
    let linear = Linear::new(2, 3, true, &mut rng);
    let input = Tensor::new(
        Array2::from_shape_vec((1, 2), vec![1.0, 2.0])
            .unwrap()
            .into_dyn(),
        false,
    );
    let output = linear.forward(&input).unwrap();
    assert_eq!(output.shape(), vec![1, 3]);
    let names: Vec<String> = linear.named_parameters("proj").into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["proj.weight", "proj.bias"]);
}

#[test]
fn test_sgd_momentum_accumulates() {
    let param = Tensor::new(arr1(&[0.0f32]).into_dyn(), true);
    let mut sgd = SGD::new(1.0, 0.5);
    for _ in 0..2 {
        param.lock().grad = Some(arr1(&[1.0]).into_dyn());
        sgd.step(&[param.clone()]);
    }
    // velocities 0.5 then 0.75
    assert!((param.data()[0] + 1.25).abs() < 1e-6);
}

#[test]
fn test_step_skips_parameters_without_grad() {
    let param = Tensor::new(arr1(&[1.0f32, 2.0]).into_dyn(), true);
    let mut adam = Adam::with_lr(0.1);
    adam.step(&[param.clone()]);
    assert_eq!(param.data(), arr1(&[1.0, 2.0]).into_dyn());
}

#[test]
fn test_zero_grad_clears() {
    let param = Tensor::new(arr1(&[1.0f32]).into_dyn(), true);
    param.lock().grad = Some(arr1(&[1.0]).into_dyn());
    let mut sgd = SGD::new(0.1, 0.0);
    sgd.zero_grad(&[param.clone()]);
    assert!(param.grad().is_none());
}

#[test]
fn test_adam_minimizes_quadratic() {
    let x = Tensor::new(arr1(&[3.0f32, -2.0]).into_dyn(), true);
    let mut adam = Adam::with_lr(0.1);
    let start = x.pow(2.0).sum().item();
    for _ in 0..50 {
        adam.zero_grad(&[x.clone()]);
        x.pow(2.0).sum().backward();
        adam.step(&[x.clone()]);
    }
    assert!(x.pow(2.0).sum().item() < start * 0.5);
}
