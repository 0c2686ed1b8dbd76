//! Linear Layer (Fully Connected)
//!
//! Affine transformation over the last dimension: `y = x @ W + b`.
//! Inputs of any rank are accepted; leading dimensions are flattened into
//! rows for the matmul and restored afterwards.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y over rows)
//! grad_x = grad_y @ W^T
//! ```
//!
//! ## Initialization
//!
//! Weights and bias are drawn uniformly from `[-1/√in, 1/√in]`.
//! [`TrainableLinear::reset_xavier_normal`] re-draws the weight from
//! `N(0, gain² · 2 / (in + out))`.

use crate::tensor::Tensor;
use crate::utils::child_seeds;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Uniform initialization in `[-bound, bound]`, reproducible from `seed`.
pub fn uniform_init(size: usize, seed: u64, bound: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..size).map(|_| rng.random_range(-bound..=bound)).collect()
}

/// Linear layer
///
/// - `weight`: `[in_features, out_features]`
/// - `bias`: `[out_features]`, absent for bias-free projections
pub struct TrainableLinear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl TrainableLinear {
    /// Linear layer with bias
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let [weight_seed, bias_seed] = child_seeds(seed);
        Self {
            weight: Tensor::new(
                uniform_init(in_features * out_features, weight_seed, bound),
                vec![in_features, out_features],
            ),
            bias: Some(Tensor::new(
                uniform_init(out_features, bias_seed, bound),
                vec![out_features],
            )),
        }
    }

    /// Linear layer without bias
    pub fn without_bias(in_features: usize, out_features: usize, seed: u64) -> Self {
        Self {
            bias: None,
            ..Self::new(in_features, out_features, seed)
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    /// Re-draw the weight with Xavier (Glorot) normal initialization.
    pub fn reset_xavier_normal(&mut self, gain: f32, seed: u64) {
        let fan_in = self.in_features() as f32;
        let fan_out = self.out_features() as f32;
        let std = gain * (2.0 / (fan_in + fan_out)).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        for w in self.weight.data.iter_mut() {
            let z: f32 = StandardNormal.sample(&mut rng);
            *w = z * std;
        }
    }

    /// Apply the layer without keeping a cache
    pub fn project(&self, x: &Tensor) -> Tensor {
        let in_features = self.in_features();
        assert_eq!(
            x.last_dim(),
            in_features,
            "Linear expects last dimension {}, got shape {:?}",
            in_features,
            x.shape
        );
        let rows = x.numel() / in_features.max(1);
        let mut y = x.reshape(&[rows, in_features]).matmul(&self.weight);
        if let Some(bias) = &self.bias {
            y = y.add(bias);
        }
        let mut out_shape = x.shape.clone();
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }
        y.reshape(&out_shape)
    }

    /// Forward pass, caching the input for backward
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = self.project(x);
        (y, LinearCache { x: x.clone() })
    }

    /// Backward pass
    ///
    /// `grad_out` has the shape of the forward output.
    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        let in_features = self.in_features();
        let out_features = self.out_features();
        let rows = cache.x.numel() / in_features.max(1);

        let x2d = cache.x.reshape(&[rows, in_features]);
        let g2d = grad_out.reshape(&[rows, out_features]);

        let weight = x2d.transpose(0, 1).matmul(&g2d);
        let bias = self.bias.as_ref().map(|_| g2d.sum_rows());
        let x = g2d
            .matmul(&self.weight.transpose(0, 1))
            .reshape(&cache.x.shape);

        LinearGradients { weight, bias, x }
    }
}

/// Cache for linear layer backward pass
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients for linear layer
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub x: Tensor, // Gradient to pass to previous layer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_keeps_leading_dims() {
        let layer = TrainableLinear::new(3, 5, 1);
        let x = Tensor::zeros(vec![2, 4, 3]);
        let (y, _) = layer.forward(&x);
        assert_eq!(y.shape, vec![2, 4, 5]);
        // zero input leaves only the bias
        assert_eq!(&y.data[..5], &layer.bias.as_ref().unwrap().data[..]);
    }

    #[test]
    fn test_without_bias_maps_zero_to_zero() {
        let layer = TrainableLinear::without_bias(4, 2, 3);
        assert!(layer.project(&Tensor::zeros(vec![1, 4])).data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let layer = TrainableLinear::new(3, 2, 11);
        let x = Tensor::new(vec![0.5, -1.0, 2.0, 0.1, 0.2, -0.3], vec![2, 3]);
        let upstream = Tensor::new(vec![1.0, -2.0, 0.5, 1.5], vec![2, 2]);
        let (_, cache) = layer.forward(&x);
        let grads = layer.backward(&upstream, &cache);

        let loss = |input: &Tensor| -> f32 {
            layer
                .project(input)
                .data
                .iter()
                .zip(&upstream.data)
                .map(|(y, g)| y * g)
                .sum()
        };
        let eps = 1e-2;
        for i in 0..x.numel() {
            let mut plus = x.clone();
            plus.data[i] += eps;
            let mut minus = x.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!((numeric - grads.x.data[i]).abs() < 1e-3);
        }
        assert_eq!(grads.bias.unwrap().data, vec![1.5, -0.5]);
    }

    #[test]
    fn test_xavier_reset_changes_weight_scale() {
        let mut layer = TrainableLinear::without_bias(64, 64, 5);
        layer.reset_xavier_normal(2f32.sqrt(), 9);
        let n = layer.weight.numel() as f32;
        let var = layer.weight.data.iter().map(|w| w * w).sum::<f32>() / n;
        // expected variance: 2 * 2 / 128
        assert!((var - 0.03125).abs() < 0.006);
    }
}
