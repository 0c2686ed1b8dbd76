//! PReLU Activation
//!
//! Parametric ReLU with one learnable slope per channel (last dimension):
//!
//! ```text
//! PReLU(x) = x        if x >= 0
//!          = a_c * x  otherwise
//! ```
//!
//! Slopes start at 0.25.

use crate::tensor::Tensor;
use rayon::prelude::*;

/// Parametric ReLU with per-channel slopes
pub struct TrainablePReLU {
    pub weight: Tensor, // [channels]
}

impl TrainablePReLU {
    pub fn new(channels: usize) -> Self {
        Self {
            weight: Tensor::full(vec![channels], 0.25),
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, PReLUCache) {
        let channels = self.weight.numel();
        assert_eq!(
            x.last_dim(),
            channels,
            "PReLU expects {} channels, got shape {:?}",
            channels,
            x.shape
        );
        let data = x
            .data
            .par_iter()
            .enumerate()
            .map(|(i, &v)| if v >= 0.0 { v } else { self.weight.data[i % channels] * v })
            .collect();
        (Tensor::new(data, x.shape.clone()), PReLUCache { x: x.clone() })
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &PReLUCache) -> PReLUGradients {
        let channels = self.weight.numel();
        let mut grad_weight = vec![0.0; channels];
        let mut grad_x = vec![0.0; grad_out.numel()];
        for (i, (&g, &v)) in grad_out.data.iter().zip(&cache.x.data).enumerate() {
            let c = i % channels;
            if v >= 0.0 {
                grad_x[i] = g;
            } else {
                grad_x[i] = g * self.weight.data[c];
                grad_weight[c] += g * v;
            }
        }
        PReLUGradients {
            weight: Tensor::new(grad_weight, vec![channels]),
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }
}

pub struct PReLUCache {
    pub x: Tensor,
}

pub struct PReLUGradients {
    pub weight: Tensor,
    pub x: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_backward() {
        let mut act = TrainablePReLU::new(2);
        act.weight = Tensor::new(vec![0.25, 0.5], vec![2]);
        let x = Tensor::new(vec![-4.0, -4.0, 3.0, 1.0], vec![2, 2]);
        let (y, cache) = act.forward(&x);
        assert_eq!(y.data, vec![-1.0, -2.0, 3.0, 1.0]);

        let grads = act.backward(&Tensor::full(vec![2, 2], 1.0), &cache);
        assert_eq!(grads.x.data, vec![0.25, 0.5, 1.0, 1.0]);
        assert_eq!(grads.weight.data, vec![-4.0, -4.0]);
    }
}
