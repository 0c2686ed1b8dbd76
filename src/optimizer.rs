//! AdamW Optimizer Implementation
//!
//! AdamW (Adam with decoupled weight decay) for the graph propagation stack.
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # Weight decay (2-D weights only)
//! m = β₁ * m + (1 - β₁) * g        # First moment
//! v = β₂ * v + (1 - β₂) * g²       # Second moment
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)           # Bias correction
//! θ = θ - α * m_hat / (√v_hat + ε) # Parameter update
//! ```
//!
//! Defaults: β₁ = 0.9, β₂ = 0.95, ε = 1e-8.
//!
//! ## Selective Weight Decay
//!
//! Decay is applied to 2-D tensors (projection and feed-forward weights)
//! only. Layer norm scale/shift, biases and PReLU slopes are 1-D and skip it.
//!
//! ## Parameter Order
//!
//! Moment buffers are stored flat, in the order of
//! [`GraphTrans::parameters`]. Gradients are read in the order of
//! [`GraphTransGradients::tensors`], which lists the same tensors.
//!
//! ## Example
//!
//! ```rust
//! use graphtrans::optimizer::{adamw_update, AdamWOptimizer};
//! use graphtrans::{GraphTrans, ModelConfig};
//!
//! let model = GraphTrans::new(&ModelConfig::tiny()).unwrap();
//! let optimizer = AdamWOptimizer::new(&model);
//! assert_eq!(optimizer.step, 0);
//! # let _ = adamw_update;
//! ```
//!
//! ## References
//!
//! - Loshchilov & Hutter (2019): "Decoupled Weight Decay Regularization"
//! - Kingma & Ba (2014): "Adam: A Method for Stochastic Optimization"

use crate::graph_trans::{GraphTrans, GraphTransGradients};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// AdamW optimizer state
///
/// - `m`: first moment per parameter tensor
/// - `v`: second moment per parameter tensor
/// - `step`: number of updates applied so far (for bias correction)
pub struct AdamWOptimizer {
    pub m: Vec<Tensor>,
    pub v: Vec<Tensor>,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub step: usize,
}

impl AdamWOptimizer {
    /// Zeroed moments shaped like every parameter of `model`.
    pub fn new(model: &GraphTrans) -> Self {
        let params = model.parameters();
        Self {
            m: params.iter().map(|p| Tensor::zeros(p.shape.clone())).collect(),
            v: params.iter().map(|p| Tensor::zeros(p.shape.clone())).collect(),
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            step: 0,
        }
    }
}

/// Constants shared by every parameter within one step
struct StepParams {
    lr: f32,
    weight_decay: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    bias_correction1: f32,
    bias_correction2: f32,
}

impl StepParams {
    #[inline]
    fn apply(&self, param: &mut f32, grad: f32, m: &mut f32, v: &mut f32, decay: bool) {
        if decay {
            *param *= 1.0 - self.lr * self.weight_decay;
        }
        *m = self.beta1 * *m + (1.0 - self.beta1) * grad;
        *v = self.beta2 * *v + (1.0 - self.beta2) * grad * grad;
        let m_hat = *m / self.bias_correction1;
        let v_hat = *v / self.bias_correction2;
        *param -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
    }
}

/// Apply one AdamW step to every parameter of `model`.
///
/// # Arguments
///
/// * `model` - Stack to update in place
/// * `grads` - Gradients from [`GraphTrans::backward`]
/// * `optimizer` - Moment state, created for this model
/// * `lr` - Learning rate
/// * `weight_decay` - Decoupled decay coefficient
///
/// # Panics
///
/// Panics if `grads` or `optimizer` do not match the model's parameters.
pub fn adamw_update(
    model: &mut GraphTrans,
    grads: &GraphTransGradients,
    optimizer: &mut AdamWOptimizer,
    lr: f32,
    weight_decay: f32,
) {
    optimizer.step += 1;
    let step = optimizer.step as f32;
    let params = StepParams {
        lr,
        weight_decay,
        beta1: optimizer.beta1,
        beta2: optimizer.beta2,
        epsilon: optimizer.epsilon,
        bias_correction1: 1.0 - optimizer.beta1.powf(step),
        bias_correction2: 1.0 - optimizer.beta2.powf(step),
    };

    let grad_tensors = grads.tensors();
    let mut model_params = model.parameters_mut();
    assert_eq!(
        model_params.len(),
        grad_tensors.len(),
        "Gradient list does not match model parameters"
    );
    assert_eq!(
        model_params.len(),
        optimizer.m.len(),
        "Optimizer state does not match model parameters"
    );

    for ((param, grad), (m, v)) in model_params
        .iter_mut()
        .zip(grad_tensors)
        .zip(optimizer.m.iter_mut().zip(optimizer.v.iter_mut()))
    {
        assert_eq!(param.shape, grad.shape, "Gradient shape mismatch");
        let decay = param.ndim() == 2;
        if param.data.len() > 1000 {
            param
                .data
                .par_iter_mut()
                .zip(grad.data.par_iter())
                .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
                .for_each(|((p, &g), (m, v))| params.apply(p, g, m, v, decay));
        } else {
            for i in 0..param.data.len() {
                params.apply(&mut param.data[i], grad.data[i], &mut m.data[i], &mut v.data[i], decay);
            }
        }
    }
    log::trace!("AdamW step {} (lr {})", optimizer.step, lr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    #[test]
    fn test_state_matches_parameters() {
        let model = GraphTrans::new(&ModelConfig::tiny()).unwrap();
        let optimizer = AdamWOptimizer::new(&model);
        let params = model.parameters();
        assert_eq!(optimizer.m.len(), params.len());
        for (m, p) in optimizer.m.iter().zip(params) {
            assert_eq!(m.shape, p.shape);
        }
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        // With bias correction the first step is lr * sign(g)
        let params = StepParams {
            lr: 0.1,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            bias_correction1: 0.1,
            bias_correction2: 0.05,
        };
        let (mut p, mut m, mut v) = (1.0, 0.0, 0.0);
        params.apply(&mut p, -3.0, &mut m, &mut v, false);
        assert!((p - 1.1).abs() < 1e-5);
    }

    #[test]
    fn test_decay_only_on_matrices() {
        let params = StepParams {
            lr: 0.1,
            weight_decay: 0.5,
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            bias_correction1: 0.1,
            bias_correction2: 0.05,
        };
        let (mut a, mut b) = (2.0, 2.0);
        let (mut m, mut v) = (0.0, 0.0);
        params.apply(&mut a, 0.0, &mut m, &mut v, true);
        let (mut m, mut v) = (0.0, 0.0);
        params.apply(&mut b, 0.0, &mut m, &mut v, false);
        assert!((a - 1.9).abs() < 1e-6);
        assert_eq!(b, 2.0);
    }
}
