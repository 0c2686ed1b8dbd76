//! Bidirectional LSTM Encoder
//!
//! Encodes padded token sequences (titles, multi-token entity names) with a
//! stack of bidirectional LSTM layers. Each direction has `nhid / 2` units,
//! so concatenated outputs are `nhid` wide again.
//!
//! ## Cell
//!
//! ```text
//! [i, f, g, o] = x_t @ W_ih + b_ih + h_{t-1} @ W_hh + b_hh
//! c_t = σ(f) * c_{t-1} + σ(i) * tanh(g)
//! h_t = σ(o) * tanh(c_t)
//! ```
//!
//! ## Packed Rows
//!
//! Each row only runs over its first `len` timesteps, where `len` is the
//! number of valid positions in its mask row. Padding is expected at the
//! end of the row. Rows are independent, so they are encoded in parallel
//! and come back in the caller's order.
//!
//! The encoder is inference-only: no backward pass is provided.

use super::dropout::TrainableDropout;
use super::linear::{uniform_init, TrainableLinear};
use crate::config::{ModelConfig, SeedStream};
use crate::error::{check_shape, ModelError, Result};
use crate::tensor::Tensor;
use crate::utils::{child_seeds, lengths_from_mask, pad, seed_stream};
use rayon::prelude::*;

/// What the encoder returns
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderMode {
    /// Per-position outputs `[batch, len, nhid]`
    Title,
    /// One vector per sequence, regrouped per sample by `ent_len`
    Entity,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Single-direction LSTM with input-hidden and hidden-hidden projections
pub struct LstmCell {
    pub ih: TrainableLinear, // [input, 4 * hidden]
    pub hh: TrainableLinear, // [hidden, 4 * hidden]
    hidden: usize,
}

impl LstmCell {
    /// All weights and biases uniform in `[-1/√hidden, 1/√hidden]`
    pub fn new(input: usize, hidden: usize, seed: u64) -> Self {
        let bound = 1.0 / (hidden as f32).sqrt();
        let gates = 4 * hidden;
        let linear = |fan_in: usize, seed: u64| {
            let [weight_seed, bias_seed] = child_seeds(seed);
            TrainableLinear {
                weight: Tensor::new(
                    uniform_init(fan_in * gates, weight_seed, bound),
                    vec![fan_in, gates],
                ),
                bias: Some(Tensor::new(uniform_init(gates, bias_seed, bound), vec![gates])),
            }
        };
        let [ih_seed, hh_seed] = child_seeds(seed);
        Self {
            ih: linear(input, ih_seed),
            hh: linear(hidden, hh_seed),
            hidden,
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    /// Run over `seq [len, input]`, last step first when `reverse`.
    ///
    /// Returns the hidden state at every position `[len, hidden]` and the
    /// state after the last processed step.
    pub fn run(&self, seq: &Tensor, reverse: bool) -> (Tensor, Vec<f32>) {
        let len = seq.shape[0];
        let hidden = self.hidden;
        let width = 4 * hidden;
        let gates_x = self.ih.project(seq);

        let mut h = Tensor::zeros(vec![1, hidden]);
        let mut c = vec![0.0; hidden];
        let mut out = vec![0.0; len * hidden];

        for step in 0..len {
            let t = if reverse { len - 1 - step } else { step };
            let gates_h = self.hh.project(&h);
            let gates = &gates_x.data[t * width..(t + 1) * width];

            let mut next = vec![0.0; hidden];
            for j in 0..hidden {
                let pre = |k: usize| gates[k * hidden + j] + gates_h.data[k * hidden + j];
                let i = sigmoid(pre(0));
                let f = sigmoid(pre(1));
                let g = pre(2).tanh();
                let o = sigmoid(pre(3));
                c[j] = f * c[j] + i * g;
                next[j] = o * c[j].tanh();
            }
            out[t * hidden..(t + 1) * hidden].copy_from_slice(&next);
            h = Tensor::new(next, vec![1, hidden]);
        }

        (Tensor::new(out, vec![len, hidden]), h.data)
    }
}

/// One bidirectional layer
pub struct BiLstmLayer {
    pub forward: LstmCell,
    pub backward: LstmCell,
}

impl BiLstmLayer {
    pub fn new(input: usize, hidden: usize, seed: u64) -> Self {
        let [forward_seed, backward_seed] = child_seeds(seed);
        Self {
            forward: LstmCell::new(input, hidden, forward_seed),
            backward: LstmCell::new(input, hidden, backward_seed),
        }
    }

    /// Encode `seq [len, input]` into `[len, 2 * hidden]` plus the final
    /// forward and backward states concatenated (`[2 * hidden]`).
    pub fn run(&self, seq: &Tensor) -> (Tensor, Vec<f32>) {
        let (fwd, fwd_last) = self.forward.run(seq, false);
        let (bwd, bwd_last) = self.backward.run(seq, true);
        let hidden = self.forward.hidden_size();
        let len = seq.shape[0];

        let mut out = Vec::with_capacity(len * 2 * hidden);
        for t in 0..len {
            out.extend_from_slice(&fwd.data[t * hidden..(t + 1) * hidden]);
            out.extend_from_slice(&bwd.data[t * hidden..(t + 1) * hidden]);
        }
        let mut last = fwd_last;
        last.extend(bwd_last);
        (Tensor::new(out, vec![len, 2 * hidden]), last)
    }
}

/// Stacked bidirectional LSTM over padded batches
pub struct BiLstmEncoder {
    pub layers: Vec<BiLstmLayer>,
    pub dropout: TrainableDropout,
    pub mode: EncoderMode,
    nhid: usize,
}

impl BiLstmEncoder {
    pub fn new(config: &ModelConfig, mode: EncoderMode) -> Result<Self> {
        config.validate()?;
        let hidden = config.nhid / 2;
        let stream = match mode {
            EncoderMode::Title => SeedStream::TitleEncoder,
            EncoderMode::Entity => SeedStream::EntityEncoder,
        };
        let layers = seed_stream(config.seed_for(stream), config.enc_lstm_layers)
            .into_iter()
            .enumerate()
            .map(|(l, seed)| {
                let input = if l == 0 { config.nhid } else { 2 * hidden };
                BiLstmLayer::new(input, hidden, seed)
            })
            .collect();
        Ok(Self {
            layers,
            dropout: TrainableDropout::new(config.emb_drop),
            mode,
            nhid: config.nhid,
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Encode a padded batch
    ///
    /// # Arguments
    ///
    /// * `inp` - `[batch, len, nhid]`
    /// * `mask` - `[batch, len]`, non-zero at padded positions
    /// * `ent_len` - Entity mode only: sequences per sample, summing to `batch`
    ///
    /// # Returns
    ///
    /// Title mode: `[batch, len, nhid]`, zero beyond each row's length.
    /// Entity mode: `[ent_len.len(), max(ent_len), nhid]`.
    pub fn forward(&self, inp: &Tensor, mask: &Tensor, ent_len: Option<&[usize]>) -> Result<Tensor> {
        if inp.ndim() != 3 || inp.shape[2] != self.nhid {
            return Err(ModelError::ShapeMismatch {
                context: "encoder input",
                expected: vec![inp.shape.first().copied().unwrap_or(0), 0, self.nhid],
                actual: inp.shape.clone(),
            });
        }
        let (batch, max_len) = (inp.shape[0], inp.shape[1]);
        check_shape("encoder mask", &[batch, max_len], &mask.shape)?;

        let lens = lengths_from_mask(mask);
        if let Some(row) = lens.iter().position(|&n| n == 0) {
            return Err(ModelError::EmptySequence { row });
        }

        let ent_len = match self.mode {
            EncoderMode::Title => None,
            EncoderMode::Entity => {
                let ent_len = ent_len.ok_or(ModelError::LengthMismatch {
                    context: "entity lengths",
                    expected: batch,
                    actual: 0,
                })?;
                let total: usize = ent_len.iter().sum();
                if total != batch {
                    return Err(ModelError::LengthMismatch {
                        context: "entity lengths",
                        expected: batch,
                        actual: total,
                    });
                }
                Some(ent_len)
            }
        };

        let (x, _) = self.dropout.forward(inp);
        let rows: Vec<(Tensor, Vec<f32>)> = (0..batch)
            .into_par_iter()
            .map(|r| self.encode_row(&x, r, lens[r]))
            .collect();

        log::debug!(
            "encoded {} sequences ({:?} mode, {} layers, max len {})",
            batch,
            self.mode,
            self.layers.len(),
            max_len
        );

        match ent_len {
            None => {
                let mut out = Tensor::zeros(vec![batch, max_len, self.nhid]);
                let stride = max_len * self.nhid;
                for (r, (seq_out, _)) in rows.iter().enumerate() {
                    out.data[r * stride..r * stride + seq_out.numel()].copy_from_slice(&seq_out.data);
                }
                Ok(out)
            }
            Some(ent_len) => {
                if ent_len.is_empty() {
                    return Ok(Tensor::zeros(vec![0, 0, self.nhid]));
                }
                let finals: Vec<f32> = rows.into_iter().flat_map(|(_, last)| last).collect();
                let finals = Tensor::new(finals, vec![batch, self.nhid]);
                Ok(pad(&finals.split_rows(ent_len)))
            }
        }
    }

    /// Run every layer over the first `len` steps of row `row`
    fn encode_row(&self, x: &Tensor, row: usize, len: usize) -> (Tensor, Vec<f32>) {
        let max_len = x.shape[1];
        let mut seq = x
            .narrow_rows(row, 1)
            .reshape(&[max_len, self.nhid])
            .narrow_rows(0, len);
        let mut last = Vec::new();
        for layer in &self.layers {
            let (out, final_state) = layer.run(&seq);
            seq = out;
            last = final_state;
        }
        (seq, last)
    }
}
