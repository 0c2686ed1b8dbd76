//! Graph Propagation Stack
//!
//! Turns encoded entities and relations into graph-contextualised node
//! states:
//!
//! ```text
//! ent [B, Le, H], rel [B, Lr, H]
//!   → gather valid rows, sample by sample: entities then relations
//!   → node features [N, H]
//!   → prop × GatLayer(H, H/4, 4 heads)
//!   → roots [B, H], entities regrouped by ent_len [B, max(ent_len), H]
//! ```
//!
//! Row `k` of the gathered features is node `k` of the batched graph, so the
//! relation inputs must start with the root token of each sample (see
//! [`crate::graph`] for the node layout).

use crate::config::{GraphEncoder, ModelConfig, SeedStream};
use crate::error::{check_shape, ModelError, Result};
use crate::graph::{BatchedGraph, NodeType};
use crate::layers::gat::{GatCache, GatGradients, GatLayer};
use crate::tensor::Tensor;
use crate::utils::{pad, seed_stream, valid_rows};

/// Heads per propagation layer
pub const GRAPH_HEADS: usize = 4;

pub struct GraphTrans {
    pub layers: Vec<GatLayer>,
    nhid: usize,
}

impl GraphTrans {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let trans = config.graph_enc == GraphEncoder::GraphTrans;
        let ffn_drop = if trans { config.drop } else { 0.0 };
        let layers = seed_stream(config.seed_for(SeedStream::GraphStack), config.prop)
            .into_iter()
            .map(|seed| {
                GatLayer::new(
                    config.nhid,
                    config.nhid / GRAPH_HEADS,
                    GRAPH_HEADS,
                    ffn_drop,
                    config.attn_drop,
                    trans,
                    seed,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "graph stack: {} {:?} layers, hidden {}",
            layers.len(),
            config.graph_enc,
            config.nhid
        );
        Ok(Self {
            layers,
            nhid: config.nhid,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    pub fn reset_parameters(&mut self) {
        for layer in &mut self.layers {
            layer.reset_parameters();
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `ent` / `ent_mask` - Entity encodings `[B, Le, H]`, mask `[B, Le]`
    /// * `ent_len` - Entities per sample
    /// * `rel` / `rel_mask` - Root + relation encodings `[B, Lr, H]`, mask `[B, Lr]`
    /// * `graph` - Batch of `B` sample graphs
    ///
    /// # Returns
    ///
    /// `(g_ent [B, max(ent_len), H], g_root [B, H], cache)`
    pub fn forward(
        &self,
        ent: &Tensor,
        ent_mask: &Tensor,
        ent_len: &[usize],
        rel: &Tensor,
        rel_mask: &Tensor,
        graph: &BatchedGraph,
    ) -> Result<(Tensor, Tensor, GraphTransCache)> {
        let batch = graph.batch_size();
        self.check_inputs(ent, ent_mask, ent_len, rel, rel_mask, graph)?;
        let (ent_slots, rel_slots) = (ent.shape[1], rel.shape[1]);

        let mut ent_nodes = Vec::new();
        let mut ent_rows = Vec::new();
        let mut rel_nodes = Vec::new();
        let mut rel_rows = Vec::new();
        for i in 0..batch {
            let ents = valid_rows(ent_mask, i);
            let rels = valid_rows(rel_mask, i);
            if ents.len() != ent_len[i] {
                return Err(ModelError::LengthMismatch {
                    context: "valid entities per sample",
                    expected: ent_len[i],
                    actual: ents.len(),
                });
            }
            let expected = graph.batch_num_nodes()[i];
            if ents.len() + rels.len() != expected {
                return Err(ModelError::GraphMismatch {
                    context: "sample node count",
                    expected,
                    actual: ents.len() + rels.len(),
                });
            }
            for p in ents {
                ent_nodes.push(ent_nodes.len() + rel_nodes.len());
                ent_rows.push(i * ent_slots + p);
            }
            for p in rels {
                rel_nodes.push(ent_nodes.len() + rel_nodes.len());
                rel_rows.push(i * rel_slots + p);
            }
        }

        let num_nodes = graph.num_nodes();
        let mut feats = Tensor::zeros(vec![num_nodes, self.nhid]);
        let ent_flat = ent.reshape(&[batch * ent_slots, self.nhid]);
        let rel_flat = rel.reshape(&[batch * rel_slots, self.nhid]);
        feats.index_add_rows(&ent_nodes, &ent_flat.index_select(&ent_rows));
        feats.index_add_rows(&rel_nodes, &rel_flat.index_select(&rel_rows));

        let isolated = graph.isolated_destinations();
        if !isolated.is_empty() && !self.layers.is_empty() {
            log::warn!(
                "{} nodes have no incoming edges and only keep their residual",
                isolated.len()
            );
        }
        log::debug!(
            "propagating {} nodes / {} edges through {} rounds",
            num_nodes,
            graph.num_edges(),
            self.layers.len()
        );

        let mut layer_caches = Vec::with_capacity(self.layers.len());
        for (round, layer) in self.layers.iter().enumerate() {
            let (next, cache) = layer.forward(graph, &feats)?;
            log::trace!(
                "round {}: mean |h| = {:.4}",
                round,
                next.data.iter().map(|v| v.abs()).sum::<f32>() / next.numel().max(1) as f32
            );
            feats = next;
            layer_caches.push(cache);
        }

        let root_ids = graph.filter_nodes(NodeType::Root);
        if root_ids.len() != batch {
            return Err(ModelError::GraphMismatch {
                context: "root nodes",
                expected: batch,
                actual: root_ids.len(),
            });
        }
        let entity_ids = graph.filter_nodes(NodeType::Entity);
        let g_root = feats.index_select(&root_ids);
        let g_ent = pad(&feats.index_select(&entity_ids).split_rows(ent_len));

        let cache = GraphTransCache {
            layers: layer_caches,
            ent_nodes,
            ent_rows,
            rel_nodes,
            rel_rows,
            root_ids,
            entity_ids,
            ent_len: ent_len.to_vec(),
            ent_shape: ent.shape.clone(),
            rel_shape: rel.shape.clone(),
            num_nodes,
        };
        Ok((g_ent, g_root, cache))
    }

    fn check_inputs(
        &self,
        ent: &Tensor,
        ent_mask: &Tensor,
        ent_len: &[usize],
        rel: &Tensor,
        rel_mask: &Tensor,
        graph: &BatchedGraph,
    ) -> Result<()> {
        let batch = graph.batch_size();
        if ent.ndim() != 3 || rel.ndim() != 3 {
            let bad = if ent.ndim() != 3 { ent } else { rel };
            return Err(ModelError::ShapeMismatch {
                context: "graph inputs",
                expected: vec![batch, 0, self.nhid],
                actual: bad.shape.clone(),
            });
        }
        if ent.shape[0] != batch {
            return Err(ModelError::GraphMismatch {
                context: "batch size",
                expected: batch,
                actual: ent.shape[0],
            });
        }
        check_shape("entity inputs", &[batch, ent.shape[1], self.nhid], &ent.shape)?;
        check_shape("relation inputs", &[batch, rel.shape[1], self.nhid], &rel.shape)?;
        check_shape("entity mask", &ent.shape[..2], &ent_mask.shape)?;
        check_shape("relation mask", &rel.shape[..2], &rel_mask.shape)?;

        if ent_len.len() != batch {
            return Err(ModelError::LengthMismatch {
                context: "entity lengths",
                expected: batch,
                actual: ent_len.len(),
            });
        }
        let mut offset = 0;
        for (i, &n) in graph.batch_num_nodes().iter().enumerate() {
            let tagged = graph.node_types()[offset..offset + n]
                .iter()
                .filter(|&&t| t == NodeType::Entity)
                .count();
            if tagged != ent_len[i] {
                return Err(ModelError::LengthMismatch {
                    context: "entity nodes per sample",
                    expected: tagged,
                    actual: ent_len[i],
                });
            }
            offset += n;
        }
        Ok(())
    }

    /// Backward pass
    ///
    /// `grad_ent` and `grad_root` have the shapes of the forward outputs.
    /// Input gradients are zero at padded positions.
    pub fn backward(
        &self,
        graph: &BatchedGraph,
        grad_ent: &Tensor,
        grad_root: &Tensor,
        cache: &GraphTransCache,
    ) -> Result<GraphTransGradients> {
        let batch = cache.ent_len.len();
        let max_ent = cache.ent_len.iter().copied().max().unwrap_or(0);
        check_shape("entity output gradient", &[batch, max_ent, self.nhid], &grad_ent.shape)?;
        check_shape("root output gradient", &[batch, self.nhid], &grad_root.shape)?;

        let slots: Vec<usize> = cache
            .ent_len
            .iter()
            .enumerate()
            .flat_map(|(i, &n)| (0..n).map(move |j| i * max_ent + j))
            .collect();
        let mut grad = Tensor::zeros(vec![cache.num_nodes, self.nhid]);
        grad.index_add_rows(
            &cache.entity_ids,
            &grad_ent.reshape(&[batch * max_ent, self.nhid]).index_select(&slots),
        );
        grad.index_add_rows(&cache.root_ids, grad_root);

        let mut layers = Vec::with_capacity(self.layers.len());
        for (layer, layer_cache) in self.layers.iter().zip(&cache.layers).rev() {
            let grads = layer.backward(graph, &grad, layer_cache);
            grad = grads.x.clone();
            layers.push(grads);
        }
        layers.reverse();

        let scatter = |nodes: &[usize], rows: &[usize], shape: &[usize]| {
            let mut out = Tensor::zeros(vec![shape[0] * shape[1], self.nhid]);
            out.index_add_rows(rows, &grad.index_select(nodes));
            out.reshape(shape)
        };
        let ent = scatter(&cache.ent_nodes, &cache.ent_rows, &cache.ent_shape);
        let rel = scatter(&cache.rel_nodes, &cache.rel_rows, &cache.rel_shape);

        Ok(GraphTransGradients { layers, ent, rel })
    }

    /// Parameters in the order used by [`GraphTransGradients::tensors`]
    pub fn parameters(&self) -> Vec<&Tensor> {
        self.layers.iter().flat_map(|layer| layer.parameters()).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.parameters_mut())
            .collect()
    }
}

/// Cache for the propagation stack backward pass
pub struct GraphTransCache {
    pub layers: Vec<GatCache>,
    /// Node id and flat input row of every gathered entity
    pub ent_nodes: Vec<usize>,
    pub ent_rows: Vec<usize>,
    pub rel_nodes: Vec<usize>,
    pub rel_rows: Vec<usize>,
    pub root_ids: Vec<usize>,
    pub entity_ids: Vec<usize>,
    pub ent_len: Vec<usize>,
    pub ent_shape: Vec<usize>,
    pub rel_shape: Vec<usize>,
    pub num_nodes: usize,
}

/// Gradients for the propagation stack
pub struct GraphTransGradients {
    /// One entry per layer, in forward order
    pub layers: Vec<GatGradients>,
    /// Gradient for `ent` (`[B, Le, H]`)
    pub ent: Tensor,
    /// Gradient for `rel` (`[B, Lr, H]`)
    pub rel: Tensor,
}

impl GraphTransGradients {
    /// Parameter gradients, excluding the input gradients
    pub fn tensors(&self) -> Vec<&Tensor> {
        self.layers.iter().flat_map(|g| g.tensors()).collect()
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers.iter_mut().flat_map(|g| g.tensors_mut()).collect()
    }
}
