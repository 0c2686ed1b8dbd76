//! Layer Normalization
//!
//! Normalizes every row (last dimension) to zero mean and unit variance,
//! then applies a learnable scale (gamma) and shift (beta).
//!
//! ```text
//! x_norm = (x - mean) / √(var + ε)
//! y = γ * x_norm + β
//! ```
//!
//! The backward pass has to account for every element feeding the row's
//! mean and variance:
//!
//! ```text
//! grad_x = (grad_x_norm - E[grad_x_norm] - x_norm * E[grad_x_norm * x_norm]) / √(var + ε)
//! ```

use crate::tensor::Tensor;

/// Layer normalization over the last dimension
pub struct TrainableLayerNorm {
    pub gamma: Tensor, // Scale parameter [features]
    pub beta: Tensor,  // Shift parameter [features]
    pub eps: f32,
}

impl TrainableLayerNorm {
    /// gamma = 1, beta = 0, eps = 1e-5
    pub fn new(normalized_shape: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![normalized_shape], 1.0),
            beta: Tensor::zeros(vec![normalized_shape]),
            eps: 1e-5,
        }
    }

    /// Forward pass for inputs of any rank
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let mean = x.mean(-1, true);
        let std = x.var(-1, true).add_scalar(self.eps).sqrt();
        let x_norm = x.sub(&mean).div(&std);
        let y = x_norm.mul(&self.gamma).add(&self.beta);

        let cache = LayerNormCache { x_norm, std };
        (y, cache)
    }

    /// Backward pass
    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let features = self.gamma.numel();
        let rows = grad_out.numel() / features.max(1);

        let mut grad_gamma = vec![0.0; features];
        let mut grad_beta = vec![0.0; features];
        for (g_row, n_row) in grad_out
            .data
            .chunks(features)
            .zip(cache.x_norm.data.chunks(features))
        {
            for j in 0..features {
                grad_gamma[j] += g_row[j] * n_row[j];
                grad_beta[j] += g_row[j];
            }
        }

        let grad_x_norm = grad_out.mul(&self.gamma);

        let mut grad_x = vec![0.0; rows * features];
        for i in 0..rows {
            let span = i * features..(i + 1) * features;
            let g_row = &grad_x_norm.data[span.clone()];
            let n_row = &cache.x_norm.data[span.clone()];
            let std = cache.std.data[i];

            let mean_grad: f32 = g_row.iter().sum::<f32>() / features as f32;
            let mean_grad_x: f32 =
                g_row.iter().zip(n_row).map(|(g, x)| g * x).sum::<f32>() / features as f32;

            for (j, out) in grad_x[span].iter_mut().enumerate() {
                *out = (g_row[j] - mean_grad - n_row[j] * mean_grad_x) / std;
            }
        }

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![features]),
            beta: Tensor::new(grad_beta, vec![features]),
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }
}

/// Cache for layer norm backward pass
pub struct LayerNormCache {
    pub x_norm: Tensor,
    pub std: Tensor,
}

/// Gradients for layer norm
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_normalized() {
        let ln = TrainableLayerNorm::new(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -5.0, 0.0, 5.0, 10.0], vec![2, 4]);
        let (y, _) = ln.forward(&x);
        for row in y.data.chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut ln = TrainableLayerNorm::new(3);
        ln.gamma = Tensor::new(vec![1.5, -0.5, 2.0], vec![3]);
        let x = Tensor::new(vec![0.2, -1.3, 0.7, 2.0, 0.5, -0.4], vec![2, 3]);
        let upstream = Tensor::new(vec![0.3, -1.0, 0.8, 1.2, 0.1, -0.6], vec![2, 3]);

        let (_, cache) = ln.forward(&x);
        let grads = ln.backward(&upstream, &cache);

        let loss = |input: &Tensor| -> f64 {
            ln.forward(input)
                .0
                .data
                .iter()
                .zip(&upstream.data)
                .map(|(y, g)| (*y as f64) * (*g as f64))
                .sum()
        };
        let eps = 1e-2;
        for i in 0..x.numel() {
            let mut plus = x.clone();
            plus.data[i] += eps;
            let mut minus = x.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps as f64);
            assert!(
                (numeric as f32 - grads.x.data[i]).abs() < 1e-2,
                "element {i}: {numeric} vs {}",
                grads.x.data[i]
            );
        }
    }
}
