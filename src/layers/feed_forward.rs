//! Feed-Forward Block
//!
//! Two-layer network used inside the graph transformer layer:
//!
//! ```text
//! x → Linear(d, 4d) → PReLU(4d) → Linear(4d, d) → Dropout → y
//! ```
//!
//! Dropout sits at the very end of the block, after the contraction.

use super::activation::{PReLUCache, TrainablePReLU};
use super::dropout::{DropoutCache, TrainableDropout};
use super::linear::{LinearCache, TrainableLinear};
use crate::tensor::Tensor;
use crate::utils::child_seeds;

/// Expansion factor of the hidden layer
pub const FFN_EXPANSION: usize = 4;

pub struct TrainableFeedForward {
    pub fc1: TrainableLinear,
    pub act: TrainablePReLU,
    pub fc2: TrainableLinear,
    pub dropout: TrainableDropout,
}

impl TrainableFeedForward {
    pub fn new(n_embd: usize, dropout_rate: f32, seed: u64) -> Self {
        let hidden = n_embd * FFN_EXPANSION;
        let [fc1_seed, fc2_seed] = child_seeds(seed);
        Self {
            fc1: TrainableLinear::new(n_embd, hidden, fc1_seed),
            act: TrainablePReLU::new(hidden),
            fc2: TrainableLinear::new(hidden, n_embd, fc2_seed),
            dropout: TrainableDropout::new(dropout_rate),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, FeedForwardCache) {
        let (h, fc1_cache) = self.fc1.forward(x);
        let (h_act, act_cache) = self.act.forward(&h);
        let (y_proj, fc2_cache) = self.fc2.forward(&h_act);
        let (y, dropout_cache) = self.dropout.forward(&y_proj);

        let cache = FeedForwardCache {
            fc1_cache,
            act_cache,
            fc2_cache,
            dropout_cache,
        };
        (y, cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &FeedForwardCache) -> FeedForwardGradients {
        let grad_y_proj = self.dropout.backward(grad_out, &cache.dropout_cache);
        let fc2_grads = self.fc2.backward(&grad_y_proj, &cache.fc2_cache);
        let act_grads = self.act.backward(&fc2_grads.x, &cache.act_cache);
        let fc1_grads = self.fc1.backward(&act_grads.x, &cache.fc1_cache);

        FeedForwardGradients {
            fc1_weight: fc1_grads.weight,
            fc1_bias: fc1_grads.bias,
            act_weight: act_grads.weight,
            fc2_weight: fc2_grads.weight,
            fc2_bias: fc2_grads.bias,
            x: fc1_grads.x,
        }
    }

    /// Parameters in the order used by [`FeedForwardGradients::tensors`]
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = vec![&self.fc1.weight];
        params.extend(self.fc1.bias.as_ref());
        params.push(&self.act.weight);
        params.push(&self.fc2.weight);
        params.extend(self.fc2.bias.as_ref());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = vec![&mut self.fc1.weight];
        params.extend(self.fc1.bias.as_mut());
        params.push(&mut self.act.weight);
        params.push(&mut self.fc2.weight);
        params.extend(self.fc2.bias.as_mut());
        params
    }
}

pub struct FeedForwardCache {
    pub fc1_cache: LinearCache,
    pub act_cache: PReLUCache,
    pub fc2_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

pub struct FeedForwardGradients {
    pub fc1_weight: Tensor,
    pub fc1_bias: Option<Tensor>,
    pub act_weight: Tensor,
    pub fc2_weight: Tensor,
    pub fc2_bias: Option<Tensor>,
    pub x: Tensor,
}

impl FeedForwardGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut grads = vec![&self.fc1_weight];
        grads.extend(self.fc1_bias.as_ref());
        grads.push(&self.act_weight);
        grads.push(&self.fc2_weight);
        grads.extend(self.fc2_bias.as_ref());
        grads
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut grads = vec![&mut self.fc1_weight];
        grads.extend(self.fc1_bias.as_mut());
        grads.push(&mut self.act_weight);
        grads.push(&mut self.fc2_weight);
        grads.extend(self.fc2_bias.as_mut());
        grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes() {
        let ffn = TrainableFeedForward::new(8, 0.0, 3);
        let x = Tensor::full(vec![5, 8], 0.1);
        let (y, cache) = ffn.forward(&x);
        assert_eq!(y.shape, vec![5, 8]);
        let grads = ffn.backward(&Tensor::full(vec![5, 8], 1.0), &cache);
        assert_eq!(grads.fc1_weight.shape, vec![8, 32]);
        assert_eq!(grads.act_weight.shape, vec![32]);
        assert_eq!(grads.x.shape, vec![5, 8]);
    }

    #[test]
    fn test_parameters_align_with_gradients() {
        let mut ffn = TrainableFeedForward::new(4, 0.0, 1);
        let (_, cache) = ffn.forward(&Tensor::full(vec![2, 4], 0.5));
        let grads = ffn.backward(&Tensor::full(vec![2, 4], 1.0), &cache);
        let grad_shapes: Vec<Vec<usize>> = grads.tensors().iter().map(|t| t.shape.clone()).collect();
        let param_shapes: Vec<Vec<usize>> =
            ffn.parameters_mut().iter().map(|t| t.shape.clone()).collect();
        assert_eq!(grad_shapes, param_shapes);
    }
}
