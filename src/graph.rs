//! Batched Heterogeneous Graphs
//!
//! The graph encoder works on a batch of small knowledge graphs. Every
//! sample contributes entity nodes, one root node and a pair of nodes per
//! relation (forward and reverse direction). Samples are concatenated
//! node-wise into one [`BatchedGraph`] so a single message passing round
//! covers the whole batch.
//!
//! ## Sample Layout
//!
//! For `E` entities and `R` relations:
//!
//! ```text
//! nodes 0..E            entity
//! node  E               root
//! nodes E+1+2i, E+2+2i  relation i, reverse of relation i
//! ```
//!
//! Edges: root <-> every entity, a self loop on every node, and per relation
//! `head -> r -> tail` plus `tail -> r' -> head`.
//!
//! The relation token sequence fed to the encoder must follow the same order:
//! `[root, r0, r0', r1, r1', ...]`.
//!
//! ## Softmax Over Edges
//!
//! [`BatchedGraph::edge_softmax`] normalises edge scores per destination
//! node, so the weights on the incoming edges of every node sum to one.

use crate::error::{ModelError, Result};
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Node type tags used to filter nodes after propagation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Entity = 0,
    Root = 1,
    Relation = 2,
}

/// One or more graphs stored node-wise concatenated.
#[derive(Clone, Debug)]
pub struct BatchedGraph {
    node_types: Vec<NodeType>,
    src: Vec<usize>,
    dst: Vec<usize>,
    batch_num_nodes: Vec<usize>,
    /// Edge ids grouped by destination node
    in_edges: Vec<Vec<usize>>,
}

impl BatchedGraph {
    /// Build a single-sample graph from node types and an edge list.
    pub fn from_edges(node_types: Vec<NodeType>, edges: &[(usize, usize)]) -> Result<Self> {
        let num_nodes = node_types.len();
        for &(u, v) in edges {
            if u >= num_nodes || v >= num_nodes {
                return Err(ModelError::InvalidGraph(format!(
                    "edge ({u}, {v}) references a node outside 0..{num_nodes}"
                )));
            }
        }
        let (src, dst): (Vec<usize>, Vec<usize>) = edges.iter().copied().unzip();
        Ok(Self::assemble(node_types, src, dst, vec![num_nodes]))
    }

    fn assemble(
        node_types: Vec<NodeType>,
        src: Vec<usize>,
        dst: Vec<usize>,
        batch_num_nodes: Vec<usize>,
    ) -> Self {
        let mut in_edges = vec![Vec::new(); node_types.len()];
        for (eid, &v) in dst.iter().enumerate() {
            in_edges[v].push(eid);
        }
        Self {
            node_types,
            src,
            dst,
            batch_num_nodes,
            in_edges,
        }
    }

    /// Build the graph of one sample from its entity count and relation
    /// triples given as `(head, tail)` entity indices.
    pub fn from_relations(num_entities: usize, relations: &[(usize, usize)]) -> Result<Self> {
        let root = num_entities;
        let num_nodes = num_entities + 1 + 2 * relations.len();

        let mut node_types = vec![NodeType::Entity; num_entities];
        node_types.push(NodeType::Root);
        node_types.extend(std::iter::repeat_n(NodeType::Relation, 2 * relations.len()));

        let mut edges = Vec::with_capacity(2 * num_entities + num_nodes + 4 * relations.len());
        for ent in 0..num_entities {
            edges.push((root, ent));
            edges.push((ent, root));
        }
        for node in 0..num_nodes {
            edges.push((node, node));
        }
        for (i, &(head, tail)) in relations.iter().enumerate() {
            if head >= num_entities || tail >= num_entities {
                return Err(ModelError::InvalidGraph(format!(
                    "relation {i} ({head}, {tail}) references an entity outside 0..{num_entities}"
                )));
            }
            let forward = num_entities + 1 + 2 * i;
            let reverse = forward + 1;
            edges.push((head, forward));
            edges.push((forward, tail));
            edges.push((tail, reverse));
            edges.push((reverse, head));
        }

        Self::from_edges(node_types, &edges)
    }

    /// Concatenate graphs into one batch, offsetting node ids.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidGraph`] for an empty list.
    pub fn batch(graphs: &[BatchedGraph]) -> Result<Self> {
        if graphs.is_empty() {
            return Err(ModelError::InvalidGraph("cannot batch zero graphs".into()));
        }
        let mut node_types = Vec::new();
        let mut src = Vec::new();
        let mut dst = Vec::new();
        let mut batch_num_nodes = Vec::new();
        for g in graphs {
            let offset = node_types.len();
            node_types.extend_from_slice(&g.node_types);
            src.extend(g.src.iter().map(|&u| u + offset));
            dst.extend(g.dst.iter().map(|&v| v + offset));
            batch_num_nodes.extend_from_slice(&g.batch_num_nodes);
        }
        let graph = Self::assemble(node_types, src, dst, batch_num_nodes);
        log::debug!(
            "batched {} graphs: {} nodes, {} edges",
            graph.batch_size(),
            graph.num_nodes(),
            graph.num_edges()
        );
        Ok(graph)
    }

    pub fn num_nodes(&self) -> usize {
        self.node_types.len()
    }

    pub fn num_edges(&self) -> usize {
        self.src.len()
    }

    /// Number of samples in the batch
    pub fn batch_size(&self) -> usize {
        self.batch_num_nodes.len()
    }

    pub fn batch_num_nodes(&self) -> &[usize] {
        &self.batch_num_nodes
    }

    pub fn node_types(&self) -> &[NodeType] {
        &self.node_types
    }

    pub fn src(&self) -> &[usize] {
        &self.src
    }

    pub fn dst(&self) -> &[usize] {
        &self.dst
    }

    /// Ids of the edges ending at `node`
    pub fn in_edges(&self, node: usize) -> &[usize] {
        &self.in_edges[node]
    }

    /// Ids of all nodes of the given type, in node order
    pub fn filter_nodes(&self, node_type: NodeType) -> Vec<usize> {
        self.node_types
            .iter()
            .enumerate()
            .filter(|(_, &t)| t == node_type)
            .map(|(i, _)| i)
            .collect()
    }

    /// Nodes that receive no messages
    pub fn isolated_destinations(&self) -> Vec<usize> {
        (0..self.num_nodes())
            .filter(|&v| self.in_edges[v].is_empty())
            .collect()
    }

    /// Softmax of edge scores grouped by destination node.
    ///
    /// `scores` is `[num_edges, width]`; every column is normalised
    /// independently over the incoming edges of each node.
    pub fn edge_softmax(&self, scores: &Tensor) -> Tensor {
        assert_eq!(scores.shape[0], self.num_edges(), "One score row per edge");
        let width = scores.row_width();

        let per_node: Vec<(usize, Vec<f32>)> = (0..self.num_nodes())
            .into_par_iter()
            .filter(|&v| !self.in_edges[v].is_empty())
            .map(|v| {
                let edges = &self.in_edges[v];
                let mut weights = vec![0.0; edges.len() * width];
                for col in 0..width {
                    let max = edges
                        .iter()
                        .map(|&e| scores.data[e * width + col])
                        .fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0;
                    for (j, &e) in edges.iter().enumerate() {
                        let w = (scores.data[e * width + col] - max).exp();
                        weights[j * width + col] = w;
                        sum += w;
                    }
                    for j in 0..edges.len() {
                        weights[j * width + col] /= sum;
                    }
                }
                (v, weights)
            })
            .collect();

        let mut out = vec![0.0; scores.data.len()];
        for (v, weights) in per_node {
            for (j, &e) in self.in_edges[v].iter().enumerate() {
                out[e * width..(e + 1) * width].copy_from_slice(&weights[j * width..(j + 1) * width]);
            }
        }
        Tensor::new(out, scores.shape.clone())
    }

    /// Backward pass of [`edge_softmax`](Self::edge_softmax).
    ///
    /// ```text
    /// grad_score = a * (grad_a - sum_{edges into v}(grad_a * a))
    /// ```
    pub fn edge_softmax_backward(&self, grad: &Tensor, attn: &Tensor) -> Tensor {
        assert_eq!(grad.shape, attn.shape, "Gradient and attention shapes must match");
        let width = attn.row_width();
        let mut out = vec![0.0; attn.data.len()];
        for edges in &self.in_edges {
            for col in 0..width {
                let dot: f32 = edges
                    .iter()
                    .map(|&e| grad.data[e * width + col] * attn.data[e * width + col])
                    .sum();
                for &e in edges {
                    let idx = e * width + col;
                    out[idx] = attn.data[idx] * (grad.data[idx] - dot);
                }
            }
        }
        Tensor::new(out, attn.shape.clone())
    }
}
