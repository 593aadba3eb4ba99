use crate::tensor::Tensor;
use ndarray::ArrayD;
use std::collections::HashSet;

/// The `AutogradEngine` is responsible for orchestrating the backward pass.
///
/// Nodes are visited in reverse topological order, so each node hands its
/// fully accumulated gradient to its inputs exactly once, even when it feeds
/// several downstream operations.
pub struct AutogradEngine;

impl AutogradEngine {
    /// Creates a new `AutogradEngine`.
    pub fn new() -> Self {
        AutogradEngine
    }

    /// Starts the backpropagation process from a given tensor.
    ///
    /// The root gradient is seeded with ones when it is not already set.
    pub fn backward(&self, root: &Tensor) {
        {
            let mut lock = root.lock();
            if !lock.requires_grad {
                return;
            }
            if lock.grad.is_none() {
                lock.grad = Some(ArrayD::ones(lock.data.dim()));
            }
        }

        for node in Self::topological_order(root).iter().rev() {
            let (creator, inputs, output_grad) = {
                let lock = node.lock();
                match (&lock.creator, &lock.grad) {
                    (Some(creator), Some(grad)) => {
                        (creator.clone(), lock.inputs.clone(), grad.clone())
                    }
                    _ => continue,
                }
            };
            let input_grads = creator.backward(&inputs, &output_grad);
            for (input, grad) in inputs.iter().zip(input_grads) {
                let mut input_lock = input.lock();
                if !input_lock.requires_grad {
                    continue;
                }
                match &mut input_lock.grad {
                    Some(existing) => *existing += &grad,
                    None => input_lock.grad = Some(grad),
                }
            }
        }
    }

    /// Post-order over the nodes reachable from `root` that require gradients.
    fn topological_order(root: &Tensor) -> Vec<Tensor> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<(Tensor, bool)> = vec![(root.clone(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !visited.insert(node.node_id()) {
                continue;
            }
            let inputs = node.lock().inputs.clone();
            stack.push((node, true));
            for input in inputs {
                if input.requires_grad() && !visited.contains(&input.node_id()) {
                    stack.push((input, false));
                }
            }
        }
        order
    }
}

impl Default for AutogradEngine {
    fn default() -> Self {
        Self::new()
    }
}
