//! Graph Attention Layer
//!
//! One round of message passing over a [`BatchedGraph`]. Every edge
//! `u -> v` gets a score per head/feature element from the key of its
//! source and the value of its destination:
//!
//! ```text
//! e(u→v) = √d_out * (k[u] + v[v])
//! a(u→v) = softmax over the incoming edges of v   (per element)
//! ft[v]  = Σ_{u→v} q[u] ⊙ a(u→v)
//! rst    = ft + feat
//! ```
//!
//! With `trans` the result goes through a transformer-style tail that reuses
//! a single layer norm:
//!
//! ```text
//! h   = ln(rst)
//! out = ln(h + FFN(h))
//! ```
//!
//! Keys and values are computed from a detached copy of the input: their
//! projection weights learn, but no gradient reaches `feat` through them.
//! The input gradient flows only through the residual and the queries.

use super::dropout::{DropoutCache, TrainableDropout};
use super::feed_forward::{FeedForwardCache, FeedForwardGradients, TrainableFeedForward};
use super::layer_norm::{LayerNormCache, TrainableLayerNorm};
use super::linear::{LinearCache, TrainableLinear};
use crate::error::{ModelError, Result};
use crate::graph::BatchedGraph;
use crate::tensor::Tensor;
use crate::utils::child_seeds;

/// Mixed into the layer seed so re-initialisation draws fresh streams
const RESET_SALT: u64 = 0x5851_f42d_4c95_7f2d;

pub struct GatLayer {
    pub q_proj: TrainableLinear,
    pub k_proj: TrainableLinear,
    pub v_proj: TrainableLinear,
    pub attn_drop: TrainableDropout,
    /// Shared layer norm of the transformer tail
    pub ln: Option<TrainableLayerNorm>,
    pub ffn: Option<TrainableFeedForward>,
    in_feats: usize,
    out_feats: usize,
    num_heads: usize,
    seed: u64,
}

impl GatLayer {
    /// # Errors
    ///
    /// [`ModelError::HeadMismatch`] unless `num_heads * out_feats == in_feats`.
    pub fn new(
        in_feats: usize,
        out_feats: usize,
        num_heads: usize,
        ffn_drop: f32,
        attn_drop: f32,
        trans: bool,
        seed: u64,
    ) -> Result<Self> {
        if num_heads * out_feats != in_feats || in_feats == 0 {
            return Err(ModelError::HeadMismatch {
                num_heads,
                out_feats,
                in_feats,
            });
        }
        for rate in [ffn_drop, attn_drop] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ModelError::InvalidConfig(format!(
                    "dropout rate {rate} must be in [0, 1)"
                )));
            }
        }
        let width = num_heads * out_feats;
        let [q_seed, k_seed, v_seed, ffn_seed] = child_seeds(seed);
        let (ln, ffn) = if trans {
            (
                Some(TrainableLayerNorm::new(in_feats)),
                Some(TrainableFeedForward::new(in_feats, ffn_drop, ffn_seed)),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            q_proj: TrainableLinear::without_bias(in_feats, width, q_seed),
            k_proj: TrainableLinear::without_bias(in_feats, width, k_seed),
            v_proj: TrainableLinear::without_bias(in_feats, width, v_seed),
            attn_drop: TrainableDropout::new(attn_drop),
            ln,
            ffn,
            in_feats,
            out_feats,
            num_heads,
            seed,
        })
    }

    pub fn in_feats(&self) -> usize {
        self.in_feats
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn is_trans(&self) -> bool {
        self.ffn.is_some()
    }

    pub fn set_training(&mut self, training: bool) {
        self.attn_drop.set_training(training);
        if let Some(ffn) = &mut self.ffn {
            ffn.set_training(training);
        }
    }

    /// Re-draw every 2-D weight with Xavier-normal init (ReLU gain).
    pub fn reset_parameters(&mut self) {
        let gain = 2f32.sqrt();
        let [q_seed, k_seed, v_seed, fc1_seed, fc2_seed] = child_seeds(self.seed ^ RESET_SALT);
        self.q_proj.reset_xavier_normal(gain, q_seed);
        self.k_proj.reset_xavier_normal(gain, k_seed);
        self.v_proj.reset_xavier_normal(gain, v_seed);
        if let Some(ffn) = &mut self.ffn {
            ffn.fc1.reset_xavier_normal(gain, fc1_seed);
            ffn.fc2.reset_xavier_normal(gain, fc2_seed);
        }
    }

    /// Forward pass over `feat [num_nodes, in_feats]`
    pub fn forward(&self, graph: &BatchedGraph, feat: &Tensor) -> Result<(Tensor, GatCache)> {
        self.propagate(graph, feat, feat)
    }

    /// Forward pass with keys and values taken from `kv_feat`.
    ///
    /// [`forward`](Self::forward) is `propagate(graph, feat, feat)`. Keeping
    /// the two inputs apart lets gradient checks hold the detached path fixed.
    fn propagate(&self, graph: &BatchedGraph, feat: &Tensor, kv_feat: &Tensor) -> Result<(Tensor, GatCache)> {
        let expected = [graph.num_nodes(), self.in_feats];
        if feat.shape != expected {
            return Err(ModelError::ShapeMismatch {
                context: "graph attention features",
                expected: expected.to_vec(),
                actual: feat.shape.clone(),
            });
        }
        let isolated = graph.isolated_destinations();
        if !isolated.is_empty() {
            log::debug!("{} isolated destinations keep their residual", isolated.len());
        }

        let (q, q_cache) = self.q_proj.forward(feat);
        let (k, k_cache) = self.k_proj.forward(kv_feat);
        let (v, v_cache) = self.v_proj.forward(kv_feat);

        let scale = (self.out_feats as f32).sqrt();
        let scores = k
            .index_select(graph.src())
            .add(&v.index_select(graph.dst()))
            .mul_scalar(scale);
        let attn = graph.edge_softmax(&scores);
        let (attn_dropped, drop_cache) = self.attn_drop.forward(&attn);

        let q_src = q.index_select(graph.src());
        let messages = q_src.mul(&attn_dropped);
        let mut ft = Tensor::zeros(vec![graph.num_nodes(), self.in_feats]);
        ft.index_add_rows(graph.dst(), &messages);
        let rst = ft.add(feat);

        let (out, trans) = match (&self.ln, &self.ffn) {
            (Some(ln), Some(ffn)) => {
                let (h, ln_first) = ln.forward(&rst);
                let (f, ffn_cache) = ffn.forward(&h);
                let (out, ln_second) = ln.forward(&h.add(&f));
                let cache = TransCache {
                    ln_first,
                    ffn_cache,
                    ln_second,
                };
                (out, Some(cache))
            }
            _ => (rst, None),
        };

        let cache = GatCache {
            q_cache,
            k_cache,
            v_cache,
            q_src,
            attn,
            attn_dropped,
            drop_cache,
            trans,
        };
        Ok((out, cache))
    }

    /// Backward pass
    ///
    /// `graph` must be the graph used in the forward pass.
    pub fn backward(&self, graph: &BatchedGraph, grad_out: &Tensor, cache: &GatCache) -> GatGradients {
        let (grad_rst, ln_gamma, ln_beta, ffn) = match (&self.ln, &self.ffn, &cache.trans) {
            (Some(ln), Some(ffn), Some(tc)) => {
                let second = ln.backward(grad_out, &tc.ln_second);
                let ffn_grads = ffn.backward(&second.x, &tc.ffn_cache);
                let grad_h = second.x.add(&ffn_grads.x);
                let first = ln.backward(&grad_h, &tc.ln_first);
                (
                    first.x,
                    Some(first.gamma.add(&second.gamma)),
                    Some(first.beta.add(&second.beta)),
                    Some(ffn_grads),
                )
            }
            _ => (grad_out.clone(), None, None, None),
        };

        let num_nodes = graph.num_nodes();
        let grad_messages = grad_rst.index_select(graph.dst());
        let grad_q_src = grad_messages.mul(&cache.attn_dropped);
        let grad_attn_dropped = grad_messages.mul(&cache.q_src);

        let mut grad_q = Tensor::zeros(vec![num_nodes, self.in_feats]);
        grad_q.index_add_rows(graph.src(), &grad_q_src);

        let grad_attn = self.attn_drop.backward(&grad_attn_dropped, &cache.drop_cache);
        let scale = (self.out_feats as f32).sqrt();
        let grad_scores = graph
            .edge_softmax_backward(&grad_attn, &cache.attn)
            .mul_scalar(scale);

        let mut grad_k = Tensor::zeros(vec![num_nodes, self.in_feats]);
        grad_k.index_add_rows(graph.src(), &grad_scores);
        let mut grad_v = Tensor::zeros(vec![num_nodes, self.in_feats]);
        grad_v.index_add_rows(graph.dst(), &grad_scores);

        let q = self.q_proj.backward(&grad_q, &cache.q_cache);
        // Detached: the k/v input gradients are dropped.
        let k = self.k_proj.backward(&grad_k, &cache.k_cache);
        let v = self.v_proj.backward(&grad_v, &cache.v_cache);

        GatGradients {
            q_weight: q.weight,
            k_weight: k.weight,
            v_weight: v.weight,
            ln_gamma,
            ln_beta,
            ffn,
            x: grad_rst.add(&q.x),
        }
    }

    /// Parameters in the order used by [`GatGradients::tensors`]
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = vec![&self.q_proj.weight, &self.k_proj.weight, &self.v_proj.weight];
        if let Some(ln) = &self.ln {
            params.push(&ln.gamma);
            params.push(&ln.beta);
        }
        if let Some(ffn) = &self.ffn {
            params.extend(ffn.parameters());
        }
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = vec![
            &mut self.q_proj.weight,
            &mut self.k_proj.weight,
            &mut self.v_proj.weight,
        ];
        if let Some(ln) = &mut self.ln {
            params.push(&mut ln.gamma);
            params.push(&mut ln.beta);
        }
        if let Some(ffn) = &mut self.ffn {
            params.extend(ffn.parameters_mut());
        }
        params
    }
}

/// Cache of the transformer tail
pub struct TransCache {
    pub ln_first: LayerNormCache,
    pub ffn_cache: FeedForwardCache,
    pub ln_second: LayerNormCache,
}

/// Cache for GAT backward pass
pub struct GatCache {
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    /// Queries gathered at edge sources `[num_edges, in_feats]`
    pub q_src: Tensor,
    /// Attention weights before dropout `[num_edges, in_feats]`; they sum to
    /// one over the incoming edges of every node
    pub attn: Tensor,
    pub attn_dropped: Tensor,
    pub drop_cache: DropoutCache,
    pub trans: Option<TransCache>,
}

/// Gradients for one GAT layer
pub struct GatGradients {
    pub q_weight: Tensor,
    pub k_weight: Tensor,
    pub v_weight: Tensor,
    pub ln_gamma: Option<Tensor>,
    pub ln_beta: Option<Tensor>,
    pub ffn: Option<FeedForwardGradients>,
    pub x: Tensor,
}

impl GatGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut grads = vec![&self.q_weight, &self.k_weight, &self.v_weight];
        grads.extend(self.ln_gamma.as_ref());
        grads.extend(self.ln_beta.as_ref());
        if let Some(ffn) = &self.ffn {
            grads.extend(ffn.tensors());
        }
        grads
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut grads = vec![&mut self.q_weight, &mut self.k_weight, &mut self.v_weight];
        grads.extend(self.ln_gamma.as_mut());
        grads.extend(self.ln_beta.as_mut());
        if let Some(ffn) = &mut self.ffn {
            grads.extend(ffn.tensors_mut());
        }
        grads
    }
}
