//! Dropout Layer
//!
//! Randomly zeros activations during training and rescales the survivors by
//! `1 / (1 - rate)`. In evaluation mode values pass through unchanged.

use crate::tensor::Tensor;

/// Trainable dropout layer
pub struct TrainableDropout {
    pub rate: f32,
    pub training: bool,
}

impl TrainableDropout {
    /// # Panics
    ///
    /// Panics if `rate` is outside `[0, 1]`. Rates coming from a validated
    /// [`ModelConfig`](crate::ModelConfig) are always in range.
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..=1.0).contains(&rate),
            "Dropout rate must be between 0.0 and 1.0"
        );
        Self {
            rate,
            training: true,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Forward pass with caching for backward
    pub fn forward(&self, x: &Tensor) -> (Tensor, DropoutCache) {
        if !self.training || self.rate == 0.0 {
            let cache = DropoutCache {
                mask: None,
                scale: 1.0,
            };
            return (x.clone(), cache);
        }

        if self.rate >= 1.0 {
            let cache = DropoutCache {
                mask: Some(vec![false; x.numel()]),
                scale: 1.0,
            };
            return (Tensor::zeros(x.shape.clone()), cache);
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mask: Vec<bool> = (0..x.numel())
            .map(|_| rand::random::<f32>() > self.rate)
            .collect();
        let data = x
            .data
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect();

        (
            Tensor::new(data, x.shape.clone()),
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    /// Backward pass: apply the forward mask to the gradient
    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let data = grad_output
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(data, grad_output.shape.clone())
            }
            None => grad_output.clone(),
        }
    }
}

/// Cache for dropout backward pass
pub struct DropoutCache {
    /// true = kept; `None` when dropout was a no-op
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_mode_is_identity() {
        let mut dropout = TrainableDropout::new(0.5);
        dropout.set_training(false);
        let x = Tensor::new(vec![1.0, 2.0, 3.0], vec![3]);
        let (y, cache) = dropout.forward(&x);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_gradient_follows_mask() {
        let dropout = TrainableDropout::new(0.5);
        let x = Tensor::full(vec![200], 1.0);
        let (y, cache) = dropout.forward(&x);
        let grad = dropout.backward(&Tensor::full(vec![200], 1.0), &cache);
        assert_eq!(y, grad);
        assert!(y.data.iter().all(|&v| v == 0.0 || v == 2.0));
    }
}
