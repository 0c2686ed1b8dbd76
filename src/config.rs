//! Model Configuration
//!
//! Hyperparameters shared by every layer in the crate. The same struct is
//! handed to the attention head, the BiLSTM encoder and the graph stack, so
//! sizes stay consistent across the encoder.
//!
//! ## Example
//!
//! ```rust
//! use graphtrans::{GraphEncoder, ModelConfig};
//!
//! let mut config = ModelConfig::tiny();
//! config.graph_enc = GraphEncoder::Gat;
//! config.validate().unwrap();
//!
//! let json = config.to_json_string().unwrap();
//! let restored = ModelConfig::from_json_str(&json).unwrap();
//! assert_eq!(restored.nhid, config.nhid);
//! ```

use crate::error::{ModelError, Result};
use crate::utils::child_seeds;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which propagation block the graph stack is built from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphEncoder {
    /// Attention only: residual aggregation without layer norm or FFN.
    Gat,
    /// Attention followed by layer norm and a feed-forward block.
    #[default]
    GraphTrans,
}

/// Parts of the model that draw their initial weights from separate streams
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedStream {
    TitleEncoder,
    EntityEncoder,
    GraphStack,
    Attention,
}

/// Encoder configuration
///
/// # Fields
///
/// - `nhid`: hidden size shared by all layers
/// - `nhead` / `head_dim`: head layout of the normal attention head
/// - `dec_ninp`: query width of the copy attention head (decoder state size)
/// - `emb_drop`: dropout applied to BiLSTM inputs
/// - `attn_drop`: dropout on graph attention weights
/// - `drop`: dropout at the end of the graph feed-forward block
/// - `prop`: number of propagation rounds
/// - `enc_lstm_layers`: stacked BiLSTM layers
/// - `graph_enc`: graph block variant
/// - `seed`: base seed for weight initialisation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub nhid: usize,
    pub nhead: usize,
    pub head_dim: usize,
    pub dec_ninp: usize,
    pub emb_drop: f32,
    pub attn_drop: f32,
    pub drop: f32,
    pub prop: usize,
    pub enc_lstm_layers: usize,
    pub graph_enc: GraphEncoder,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            nhid: 500,
            nhead: 4,
            head_dim: 125,
            dec_ninp: 1500, // title + entity context + hidden
            emb_drop: 0.0,
            attn_drop: 0.1,
            drop: 0.1,
            prop: 6,
            enc_lstm_layers: 2,
            graph_enc: GraphEncoder::GraphTrans,
            seed: 1234,
        }
    }
}

impl ModelConfig {
    /// Very small model for unit tests. Dropout is disabled so forward
    /// passes are deterministic.
    pub fn tiny() -> Self {
        Self {
            nhid: 8,
            nhead: 2,
            head_dim: 4,
            dec_ninp: 12,
            emb_drop: 0.0,
            attn_drop: 0.0,
            drop: 0.0,
            prop: 2,
            enc_lstm_layers: 1,
            graph_enc: GraphEncoder::GraphTrans,
            seed: 7,
        }
    }

    /// Small model for quick experiments
    pub fn small() -> Self {
        Self {
            nhid: 64,
            nhead: 4,
            head_dim: 16,
            dec_ninp: 192,
            emb_drop: 0.0,
            attn_drop: 0.1,
            drop: 0.1,
            prop: 2,
            enc_lstm_layers: 2,
            graph_enc: GraphEncoder::GraphTrans,
            seed: 42,
        }
    }

    /// Base seed of one model part, derived from `seed`
    pub fn seed_for(&self, stream: SeedStream) -> u64 {
        child_seeds::<4>(self.seed)[stream as usize]
    }

    /// Check that every size is usable by the layers built from this config.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("nhid", self.nhid),
            ("nhead", self.nhead),
            ("head_dim", self.head_dim),
            ("dec_ninp", self.dec_ninp),
            ("enc_lstm_layers", self.enc_lstm_layers),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        // Graph layers split nhid over 4 heads; the BiLSTM over 2 directions.
        if self.nhid % 4 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "nhid ({}) must be divisible by 4",
                self.nhid
            )));
        }
        for (name, rate) in [
            ("emb_drop", self.emb_drop),
            ("attn_drop", self.attn_drop),
            ("drop", self.drop),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ModelError::InvalidConfig(format!(
                    "{name} ({rate}) must be in [0, 1)"
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration. Missing fields take their
    /// default values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}
