//! graphtrans: Graph-Transformer Encoder Layers
//!
//! The encoder side of a knowledge-graph-to-text model, implemented from
//! scratch in Rust:
//!
//! - [`MultiHeadAttention`] - attention head with a normal (multi-head) and a
//!   copy (raw logits) mode
//! - [`BiLstmEncoder`] - bidirectional LSTM for titles and entity names
//! - [`GatLayer`] - graph attention with an optional transformer tail
//! - [`GraphTrans`] - stack of graph layers over a batch of sample graphs
//!
//! Trainable layers expose explicit `forward` / `backward` pairs; the
//! [`gradients`] and [`optimizer`] modules clip and apply the resulting
//! gradients.
//!
//! # Example
//!
//! ```rust
//! use graphtrans::{BatchedGraph, GraphTrans, ModelConfig, Tensor};
//!
//! let config = ModelConfig::tiny();
//! let model = GraphTrans::new(&config).unwrap();
//!
//! // One sample: two entities linked by one relation
//! let graph = BatchedGraph::batch(&[BatchedGraph::from_relations(2, &[(0, 1)]).unwrap()]).unwrap();
//! let ent = Tensor::full(vec![1, 2, config.nhid], 0.1);
//! let ent_mask = Tensor::zeros(vec![1, 2]);
//! // root token, relation, reverse relation
//! let rel = Tensor::full(vec![1, 3, config.nhid], -0.1);
//! let rel_mask = Tensor::zeros(vec![1, 3]);
//!
//! let (g_ent, g_root, _) = model
//!     .forward(&ent, &ent_mask, &[2], &rel, &rel_mask, &graph)
//!     .unwrap();
//! assert_eq!(g_ent.shape, vec![1, 2, config.nhid]);
//! assert_eq!(g_root.shape, vec![1, config.nhid]);
//! ```

pub mod config;
pub mod error;
pub mod gradients;
pub mod graph;
pub mod graph_trans;
pub mod layers;
pub mod optimizer;
pub mod tensor;
pub mod utils;

pub use config::{GraphEncoder, ModelConfig, SeedStream};
pub use error::{ModelError, Result};
pub use graph::{BatchedGraph, NodeType};
pub use graph_trans::{GraphTrans, GraphTransCache, GraphTransGradients};
pub use layers::{AttentionMode, BiLstmEncoder, EncoderMode, GatLayer, MultiHeadAttention};
pub use tensor::Tensor;
