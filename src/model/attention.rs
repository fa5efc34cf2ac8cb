//! Decoder attention over the encoder memory.
//!
//! Every variant scores encoder positions with additive attention
//!
//! ```text
//! e_j = v · tanh(W_q q + W_m m_j [+ W_loc f_j])
//! ```
//!
//! where `f_j` are optional location features (a conv over the previous and
//! cumulative alignments). Variants differ in how energies become weights:
//!
//! - [`location::LocationSensitiveAttention`] — softmax
//! - [`sigmoid::SigmoidAttention`] — `sigmoid(e) / Σ sigmoid(e)` (monotonic normalisation)
//! - [`windowed::WindowedAttention`] — softmax inside a window around the last peak
//! - [`forward::ForwardAttention`] — softmax followed by the forward-attention recursion
//!
//! The decoder only sees the [`Attention`] trait; [`build_attention`] picks the
//! implementation from [`AttentionConfig`].

pub mod forward;
pub mod location;
pub mod sigmoid;
pub mod windowed;

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Conv1d, VarBuilder};

use super::layers::{InitGain, Linear};
use crate::Result;
use crate::config::{AttentionConfig, AttentionKind};

/// Attention capability consumed by the decoder.
///
/// Implementations own their alignment-tracking state; the decoder resets it
/// with [`Attention::init_states`] once per run.
pub trait Attention: std::fmt::Debug {
    /// Project the encoder memory once per run: `[B, T, D_enc]` → `[B, T, D_attn]`.
    fn preprocess_inputs(&self, inputs: &Tensor) -> Result<Tensor>;

    /// Reset per-run state for a memory of shape `[B, T, D_enc]`.
    fn init_states(&mut self, inputs: &Tensor) -> Result<()>;

    /// Reset only the window position. No-op for unwindowed variants.
    fn init_win_idx(&mut self) {}

    /// One attention step.
    ///
    /// - `query`: `[B, D_query]`
    /// - `inputs`: `[B, T, D_enc]`
    /// - `processed_inputs`: output of [`Attention::preprocess_inputs`]
    /// - `mask`: optional `[B, T]` `u8`, 1 = valid
    ///
    /// Returns `(context [B, D_enc], weights [B, T])`.
    fn forward(
        &mut self,
        query: &Tensor,
        inputs: &Tensor,
        processed_inputs: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)>;

    /// Weights from the last [`Attention::forward`] call (zeros after init).
    fn attention_weights(&self) -> Option<&Tensor>;
}

/// Build the configured attention variant under `vb`.
pub fn build_attention(
    cfg: &AttentionConfig,
    query_dim: usize,
    embedding_dim: usize,
    attention_dim: usize,
    vb: VarBuilder,
) -> Result<Box<dyn Attention>> {
    let core = AttentionCore::new(cfg, query_dim, embedding_dim, attention_dim, vb.clone())?;
    let attention: Box<dyn Attention> = match cfg.kind {
        AttentionKind::LocationSensitive => Box::new(location::LocationSensitiveAttention::new(core)),
        AttentionKind::Sigmoid => Box::new(sigmoid::SigmoidAttention::new(core)),
        AttentionKind::Windowed => Box::new(windowed::WindowedAttention::new(core)),
        AttentionKind::Forward => Box::new(forward::ForwardAttention::new(
            core,
            cfg,
            query_dim,
            embedding_dim,
            vb,
        )?),
    };
    Ok(attention)
}

// ---------------------------------------------------------------------------
// Location features
// ---------------------------------------------------------------------------

/// Conv1d over `[previous, cumulative]` alignments followed by a projection.
#[derive(Debug, Clone)]
struct LocationLayer {
    location_conv1d: Conv1d,
    location_dense: Linear,
}

impl LocationLayer {
    fn new(
        attention_dim: usize,
        n_filters: usize,
        kernel_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = candle_nn::Conv1dConfig {
            padding: (kernel_size - 1) / 2,
            ..Default::default()
        };
        let location_conv1d =
            candle_nn::conv1d_no_bias(2, n_filters, kernel_size, cfg, vb.pp("location_conv1d"))?;
        let location_dense = Linear::new(
            n_filters,
            attention_dim,
            false,
            InitGain::Tanh,
            vb.pp("location_dense"),
        )?;
        Ok(Self {
            location_conv1d,
            location_dense,
        })
    }

    /// `[B, 2, T]` → `[B, T, D_attn]`.
    fn forward(&self, attention_cat: &Tensor) -> Result<Tensor> {
        let processed = self.location_conv1d.forward(attention_cat)?;
        let processed = processed.transpose(1, 2)?.contiguous()?;
        Ok(self.location_dense.forward(&processed)?)
    }
}

// ---------------------------------------------------------------------------
// Shared scoring core
// ---------------------------------------------------------------------------

/// Energy computation and the state every variant tracks: last weights and,
/// with location features, their running sum.
#[derive(Debug, Clone)]
pub struct AttentionCore {
    query_layer: Linear,
    inputs_layer: Linear,
    v: Linear,
    location_layer: Option<LocationLayer>,
    attention_weights: Option<Tensor>,
    attention_weights_cum: Option<Tensor>,
}

impl AttentionCore {
    pub fn new(
        cfg: &AttentionConfig,
        query_dim: usize,
        embedding_dim: usize,
        attention_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let query_layer = Linear::new(
            query_dim,
            attention_dim,
            false,
            InitGain::Tanh,
            vb.pp("query_layer"),
        )?;
        let inputs_layer = Linear::new(
            embedding_dim,
            attention_dim,
            false,
            InitGain::Tanh,
            vb.pp("inputs_layer"),
        )?;
        let v = Linear::new(attention_dim, 1, true, InitGain::Linear, vb.pp("v"))?;
        let location_layer = if cfg.location_attention {
            Some(LocationLayer::new(
                attention_dim,
                cfg.location_n_filters,
                cfg.location_kernel_size,
                vb.pp("location_layer"),
            )?)
        } else {
            None
        };
        Ok(Self {
            query_layer,
            inputs_layer,
            v,
            location_layer,
            attention_weights: None,
            attention_weights_cum: None,
        })
    }

    fn preprocess_inputs(&self, inputs: &Tensor) -> Result<Tensor> {
        Ok(self.inputs_layer.forward(inputs)?)
    }

    fn init_states(&mut self, inputs: &Tensor) -> Result<()> {
        let (b, t, _) = inputs.dims3()?;
        let zeros = Tensor::zeros((b, t), inputs.dtype(), inputs.device())?;
        self.attention_weights_cum = self.location_layer.as_ref().map(|_| zeros.clone());
        self.attention_weights = Some(zeros);
        Ok(())
    }

    /// Masked energies `[B, T]`; masked positions are `-inf`.
    fn energies(
        &self,
        query: &Tensor,
        processed_inputs: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        // [B, 1, D_attn]
        let processed_query = self.query_layer.forward(&query.unsqueeze(1)?)?;
        let mut hidden = processed_inputs.broadcast_add(&processed_query)?;
        if let Some(location_layer) = &self.location_layer {
            let (prev, cum) = match (&self.attention_weights, &self.attention_weights_cum) {
                (Some(prev), Some(cum)) => (prev, cum),
                _ => {
                    return Err(crate::Error::Config(
                        "attention used before init_states".into(),
                    ));
                }
            };
            let attention_cat = Tensor::stack(&[prev, cum], 1)?;
            hidden = (hidden + location_layer.forward(&attention_cat)?)?;
        }
        let energies = self.v.forward(&hidden.tanh()?)?.squeeze(D::Minus1)?;
        match mask {
            Some(mask) => masked_fill_neg_inf(&energies, mask),
            None => Ok(energies),
        }
    }

    /// Accumulate a freshly normalised alignment into the location features.
    fn update_location(&mut self, alignment: &Tensor) -> Result<()> {
        if let Some(cum) = self.attention_weights_cum.take() {
            self.attention_weights_cum = Some((cum + alignment)?);
        }
        Ok(())
    }

    fn set_weights(&mut self, weights: Tensor) {
        self.attention_weights = Some(weights);
    }

    fn weights(&self) -> Option<&Tensor> {
        self.attention_weights.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Replace positions where `mask == 0` with `-inf`.
pub(crate) fn masked_fill_neg_inf(energies: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let neg_inf = Tensor::full(f32::NEG_INFINITY, energies.dims(), energies.device())?
        .to_dtype(energies.dtype())?;
    let mask = mask.to_dtype(DType::U8)?;
    Ok(mask.where_cond(energies, &neg_inf)?)
}

pub(crate) fn softmax_norm(energies: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::softmax(energies, D::Minus1)?)
}

pub(crate) fn sigmoid_norm(energies: &Tensor) -> Result<Tensor> {
    let s = candle_nn::ops::sigmoid(energies)?;
    let total = s.sum_keepdim(D::Minus1)?;
    Ok(s.broadcast_div(&total)?)
}

/// `alignment [B, T]`, `inputs [B, T, D]` → context `[B, D]`.
pub(crate) fn context(alignment: &Tensor, inputs: &Tensor) -> Result<Tensor> {
    let ctx = alignment.unsqueeze(1)?.contiguous()?.matmul(&inputs.contiguous()?)?;
    Ok(ctx.squeeze(1)?)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use super::*;

    pub const QUERY_DIM: usize = 12;
    pub const EMBED_DIM: usize = 10;
    pub const ATTN_DIM: usize = 8;

    pub fn build(cfg: &AttentionConfig) -> (VarMap, Box<dyn Attention>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = build_attention(cfg, QUERY_DIM, EMBED_DIM, ATTN_DIM, vb).unwrap();
        (varmap, attn)
    }

    pub fn row_sums(weights: &Tensor) -> Vec<f32> {
        weights.sum(1).unwrap().to_vec1().unwrap()
    }

    /// Run `steps` attention steps and check every alignment is a
    /// distribution over the valid positions.
    pub fn check_distribution(cfg: &AttentionConfig, lengths: &[usize], steps: usize, train: bool) {
        let device = Device::Cpu;
        let (_varmap, mut attn) = build(cfg);
        let b = lengths.len();
        let t = *lengths.iter().max().unwrap();
        let inputs = Tensor::randn(0f32, 1.0, (b, t, EMBED_DIM), &device).unwrap();
        let mask = crate::model::mask::sequence_mask(lengths, Some(t), &device).unwrap();
        attn.init_states(&inputs).unwrap();
        let processed = attn.preprocess_inputs(&inputs).unwrap();
        for _ in 0..steps {
            let query = Tensor::randn(0f32, 1.0, (b, QUERY_DIM), &device).unwrap();
            let (ctx, w) = attn
                .forward(&query, &inputs, &processed, Some(&mask), train)
                .unwrap();
            assert_eq!(ctx.dims(), &[b, EMBED_DIM]);
            assert_eq!(w.dims(), &[b, t]);
            for s in row_sums(&w) {
                assert!((s - 1.0).abs() < 1e-4, "weights sum to {s}");
            }
            let rows: Vec<Vec<f32>> = w.to_vec2().unwrap();
            for (row, &len) in rows.iter().zip(lengths) {
                assert!(row.iter().all(|&x| x >= 0.0));
                assert!(row[len..].iter().all(|&x| x == 0.0), "masked weight non-zero");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use candle_core::Device;

    #[test]
    fn masked_fill_sets_neg_inf() {
        let device = Device::Cpu;
        let e = Tensor::new(&[[1f32, 2.0, 3.0]], &device).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 0]], &device).unwrap();
        let out: Vec<Vec<f32>> = masked_fill_neg_inf(&e, &mask).unwrap().to_vec2().unwrap();
        assert_eq!(out[0][..2], [1.0, 2.0]);
        assert!(out[0][2].is_infinite() && out[0][2] < 0.0);
    }

    #[test]
    fn sigmoid_norm_is_distribution() {
        let device = Device::Cpu;
        let e = Tensor::new(&[[0f32, 1.0, -2.0, f32::NEG_INFINITY]], &device).unwrap();
        let w: Vec<Vec<f32>> = sigmoid_norm(&e).unwrap().to_vec2().unwrap();
        let sum: f32 = w[0].iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(w[0][3], 0.0);
    }

    #[test]
    fn context_is_weighted_sum() {
        let device = Device::Cpu;
        let inputs = Tensor::new(&[[[1f32, 0.0], [0.0, 2.0]]], &device).unwrap();
        let alignment = Tensor::new(&[[0.25f32, 0.75]], &device).unwrap();
        let ctx: Vec<Vec<f32>> = context(&alignment, &inputs).unwrap().to_vec2().unwrap();
        assert_eq!(ctx, vec![vec![0.25, 1.5]]);
    }

    #[test]
    fn forward_before_init_is_an_error() {
        let (_varmap, mut attn) = build(&AttentionConfig::default());
        let device = Device::Cpu;
        let inputs = Tensor::randn(0f32, 1.0, (1, 4, EMBED_DIM), &device).unwrap();
        let processed = attn.preprocess_inputs(&inputs).unwrap();
        let query = Tensor::randn(0f32, 1.0, (1, QUERY_DIM), &device).unwrap();
        assert!(attn.forward(&query, &inputs, &processed, None, false).is_err());
    }

    #[test]
    fn every_variant_produces_distributions() {
        for kind in [
            AttentionKind::LocationSensitive,
            AttentionKind::Sigmoid,
            AttentionKind::Windowed,
            AttentionKind::Forward,
        ] {
            let cfg = AttentionConfig {
                kind,
                location_n_filters: 4,
                location_kernel_size: 5,
                ..Default::default()
            };
            for train in [true, false] {
                check_distribution(&cfg, &[7, 3, 5], 4, train);
                check_distribution(&cfg, &[1], 2, train);
            }
        }
    }
}
