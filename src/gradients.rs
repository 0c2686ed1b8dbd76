//! Gradient Utilities
//!
//! Helpers for monitoring and bounding the parameter gradients of the graph
//! stack between backward pass and optimizer step.
//!
//! ## Algorithm
//!
//! ```text
//! norm = √(Σ gradient²)
//! if norm > max_norm:
//!     gradients *= (max_norm / norm)
//! ```
//!
//! Every parameter gradient is scaled by the same factor, so the update keeps
//! its direction. Input gradients (`ent`, `rel`) are left alone.
//!
//! ## Example
//!
//! ```rust
//! use graphtrans::gradients::{clip_gradients, compute_grad_norm};
//! use graphtrans::{BatchedGraph, GraphTrans, ModelConfig, Tensor};
//!
//! let config = ModelConfig::tiny();
//! let model = GraphTrans::new(&config).unwrap();
//! let graph = BatchedGraph::from_relations(1, &[]).unwrap();
//! let ent = Tensor::full(vec![1, 1, config.nhid], 0.5);
//! let rel = Tensor::full(vec![1, 1, config.nhid], -0.5);
//! let mask = Tensor::zeros(vec![1, 1]);
//!
//! let (g_ent, g_root, cache) = model.forward(&ent, &mask, &[1], &rel, &mask, &graph).unwrap();
//! let mut grads = model
//!     .backward(&graph, &Tensor::full(g_ent.shape.clone(), 10.0), &g_root, &cache)
//!     .unwrap();
//!
//! clip_gradients(&mut grads, 1.0);
//! assert!(compute_grad_norm(&grads) <= 1.0 + 1e-4);
//! ```

use crate::graph_trans::GraphTransGradients;
use rayon::prelude::*;

/// L2 norm over all parameter gradients: √(Σ g²)
///
/// Each tensor's sum of squares is computed in parallel.
pub fn compute_grad_norm(grads: &GraphTransGradients) -> f32 {
    let sum_sq_parallel = |data: &[f32]| -> f32 { data.par_iter().map(|&val| val * val).sum() };

    grads
        .tensors()
        .iter()
        .map(|t| sum_sq_parallel(&t.data))
        .sum::<f32>()
        .sqrt()
}

/// Scale all parameter gradients so their joint norm is at most `max_norm`.
///
/// Does nothing when the norm is already within bounds.
pub fn clip_gradients(grads: &mut GraphTransGradients, max_norm: f32) {
    let norm = compute_grad_norm(grads);

    if norm > max_norm {
        let scale = max_norm / norm;
        log::debug!("clipping gradient norm {:.4} to {:.4}", norm, max_norm);
        for tensor in grads.tensors_mut() {
            tensor.data.par_iter_mut().for_each(|val| *val *= scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::gat::GatGradients;
    use crate::tensor::Tensor;

    fn grads(values: [f32; 3]) -> GraphTransGradients {
        GraphTransGradients {
            layers: vec![GatGradients {
                q_weight: Tensor::new(vec![values[0]], vec![1, 1]),
                k_weight: Tensor::new(vec![values[1]], vec![1, 1]),
                v_weight: Tensor::new(vec![values[2]], vec![1, 1]),
                ln_gamma: None,
                ln_beta: None,
                ffn: None,
                x: Tensor::full(vec![1, 1], 100.0),
            }],
            ent: Tensor::full(vec![1, 1, 1], 100.0),
            rel: Tensor::full(vec![1, 1, 1], 100.0),
        }
    }

    #[test]
    fn test_norm_ignores_input_gradients() {
        assert!((compute_grad_norm(&grads([3.0, 4.0, 0.0])) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_scales_uniformly() {
        let mut g = grads([3.0, 4.0, 0.0]);
        clip_gradients(&mut g, 1.0);
        assert!((g.layers[0].q_weight.data[0] - 0.6).abs() < 1e-6);
        assert!((g.layers[0].k_weight.data[0] - 0.8).abs() < 1e-6);
        assert_eq!(g.ent.data[0], 100.0);

        let mut small = grads([0.1, 0.0, 0.0]);
        clip_gradients(&mut small, 1.0);
        assert_eq!(small.layers[0].q_weight.data[0], 0.1);
    }
}
