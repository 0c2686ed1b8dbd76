//! Neural Network Layers
//!
//! Building blocks of the encoder. Trainable layers provide both a forward
//! and a backward pass; the BiLSTM encoder is forward only.
//!
//! ## Layers
//!
//! - **linear**: Fully connected layer
//! - **layer_norm**: Layer normalization
//! - **dropout**: Dropout regularization
//! - **activation**: PReLU with per-channel slopes
//! - **feed_forward**: Linear → PReLU → Linear → Dropout
//! - **attention**: Multi-head attention with normal and copy modes
//! - **lstm**: Stacked bidirectional LSTM over padded sequences
//! - **gat**: Graph attention layer with optional transformer tail
//!
//! ## Design Pattern
//!
//! Each trainable layer follows a consistent pattern:
//!
//! ```rust,ignore
//! pub struct TrainableLayer {
//!     // Parameters (weights, biases, etc.)
//! }
//!
//! impl TrainableLayer {
//!     pub fn new(...) -> Self { }
//!     pub fn forward(&self, x: &Tensor) -> (Tensor, Cache) { }
//!     pub fn backward(&self, grad: &Tensor, cache: &Cache) -> Gradients { }
//! }
//! ```
//!
//! Layers that validate caller bookkeeping (attention, gat, lstm) return
//! `Result` from `forward`.

pub mod activation;
pub mod attention;
pub mod dropout;
pub mod feed_forward;
pub mod gat;
pub mod layer_norm;
pub mod linear;
pub mod lstm;

pub use activation::{PReLUCache, PReLUGradients, TrainablePReLU};
pub use attention::{AttentionCache, AttentionGradients, AttentionMode, MultiHeadAttention};
pub use dropout::{DropoutCache, TrainableDropout};
pub use feed_forward::{FeedForwardCache, FeedForwardGradients, TrainableFeedForward};
pub use gat::{GatCache, GatGradients, GatLayer};
pub use layer_norm::{LayerNormCache, LayerNormGradients, TrainableLayerNorm};
pub use linear::{uniform_init, LinearCache, LinearGradients, TrainableLinear};
pub use lstm::{BiLstmEncoder, BiLstmLayer, EncoderMode, LstmCell};
