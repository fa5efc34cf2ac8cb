//! Text encoder: three conv blocks followed by a bidirectional LSTM.
//!
//! ```text
//! [B, C, T] → 3× ConvBlock(C→C, k=5, relu) → [B, T, C]
//!           → BiLSTM(C → C/2 per direction) → [B, T, C]
//! ```
//!
//! In [`Encoder::forward`] each batch element only runs the LSTM over its valid
//! prefix, so padding never leaks into the recurrent state (the effect of
//! `pack_padded_sequence`). Padded output positions are zero.

use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;

use super::conv_block::{BlockActivation, ConvBlock};
use super::layers::LstmCell;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Encoder {
    convolutions: Vec<ConvBlock>,
    lstm_forward: LstmCell,
    lstm_backward: LstmCell,
    dim: usize,
}

impl Encoder {
    pub const NUM_CONVS: usize = 3;

    pub fn new(dim: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        if dim % 2 != 0 {
            return Err(Error::Config(format!(
                "encoder dim must be even, got {dim}"
            )));
        }
        let mut convolutions = Vec::with_capacity(Self::NUM_CONVS);
        for i in 0..Self::NUM_CONVS {
            convolutions.push(ConvBlock::new(
                dim,
                dim,
                kernel_size,
                BlockActivation::Relu,
                vb.pp(format!("convolutions.{i}")),
            )?);
        }
        let vb_lstm = vb.pp("lstm");
        let lstm_forward = LstmCell::new(dim, dim / 2, "_l0", vb_lstm.clone())?;
        let lstm_backward = LstmCell::new(dim, dim / 2, "_l0_reverse", vb_lstm)?;
        Ok(Self {
            convolutions,
            lstm_forward,
            lstm_backward,
            dim,
        })
    }

    fn convolve(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut o = x.clone();
        for layer in &self.convolutions {
            o = layer.forward(&o, train)?;
        }
        // [B, C, T] → [B, T, C]
        Ok(o.transpose(1, 2)?.contiguous()?)
    }

    /// `x`: `[B, C, T]`, `input_lengths[b]` in `1..=T` → `[B, T, C]`.
    pub fn forward(&self, x: &Tensor, input_lengths: &[usize], train: bool) -> Result<Tensor> {
        let o = self.convolve(x, train)?;
        let (batch, max_len, _) = o.dims3()?;
        if input_lengths.len() != batch {
            return Err(Error::Config(format!(
                "got {} input lengths for a batch of {batch}",
                input_lengths.len()
            )));
        }

        let mut rows = Vec::with_capacity(batch);
        for (b, &len) in input_lengths.iter().enumerate() {
            if len == 0 || len > max_len {
                return Err(Error::Config(format!(
                    "input length {len} of batch element {b} outside 1..={max_len}"
                )));
            }
            let valid = o.i((b..b + 1, ..len, ..))?;
            let encoded = self.bidirectional(&valid)?;
            let row = if len < max_len {
                let pad = Tensor::zeros((1, max_len - len, self.dim), o.dtype(), o.device())?;
                Tensor::cat(&[&encoded, &pad], 1)?
            } else {
                encoded
            };
            rows.push(row);
        }
        Ok(Tensor::cat(&rows, 0)?)
    }

    /// Unpacked variant for unpadded input (typically batch size 1).
    pub fn inference(&self, x: &Tensor) -> Result<Tensor> {
        let o = self.convolve(x, false)?;
        self.bidirectional(&o)
    }

    /// `x`: `[B, T, C]` → `[B, T, C]` (forward and backward halves concatenated).
    fn bidirectional(&self, x: &Tensor) -> Result<Tensor> {
        let (forward, _) = self.lstm_forward.run(x)?;
        let reversed = reverse_time(x)?;
        let (backward, _) = self.lstm_backward.run(&reversed)?;
        let backward = reverse_time(&backward)?;
        Ok(Tensor::cat(&[&forward, &backward], 2)?)
    }
}

/// Flip the time axis of a `[B, T, C]` tensor.
fn reverse_time(x: &Tensor) -> Result<Tensor> {
    let len = x.dim(1)?;
    let idx = reversed_indices(len, x.device())?;
    Ok(x.contiguous()?.index_select(&idx, 1)?)
}

fn reversed_indices(len: usize, device: &Device) -> Result<Tensor> {
    let idx: Vec<u32> = (0..len as u32).rev().collect();
    Ok(Tensor::from_vec(idx, len, device)?)
}
