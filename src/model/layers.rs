//! Shared building blocks for the encoder, decoder and attention.
//!
//! - [`Linear`] — dense layer with a Xavier-uniform init gain hint
//! - [`LstmCell`] — single LSTM cell with PyTorch `LSTMCell` weight names
//! - [`Prenet`] — bottleneck MLP applied to fed-back frames

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{BatchNorm, Init, RNN, VarBuilder};

use crate::config::{PrenetConfig, PrenetKind};

// ---------------------------------------------------------------------------
// Linear
// ---------------------------------------------------------------------------

/// Gain tag used to scale the Xavier-uniform bound of a [`Linear`] weight.
///
/// Only matters when the weights are freshly created (e.g. from a `VarMap`);
/// loaded checkpoints ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitGain {
    Linear,
    Relu,
    Tanh,
    Sigmoid,
}

impl InitGain {
    /// Same values as `torch.nn.init.calculate_gain`.
    pub fn gain(self) -> f64 {
        match self {
            InitGain::Linear | InitGain::Sigmoid => 1.0,
            InitGain::Relu => 2f64.sqrt(),
            InitGain::Tanh => 5.0 / 3.0,
        }
    }
}

/// Dense layer `y = x W^T + b`, accepting any number of leading dims.
///
/// Parameters live under `linear_layer.` to match checkpoints exported from
/// the PyTorch wrapper module.
#[derive(Debug, Clone)]
pub struct Linear {
    inner: candle_nn::Linear,
}

impl Linear {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        init_gain: InitGain,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("linear_layer");
        let bound = init_gain.gain() * (6.0 / (in_dim + out_dim) as f64).sqrt();
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = if bias {
            let b = 1.0 / (in_dim as f64).sqrt();
            Some(vb.get_with_hints(out_dim, "bias", Init::Uniform { lo: -b, up: b })?)
        } else {
            None
        };
        Ok(Self {
            inner: candle_nn::Linear::new(weight, bias),
        })
    }
}

impl Module for Linear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.inner.forward(xs)
    }
}

// ---------------------------------------------------------------------------
// LSTM cell
// ---------------------------------------------------------------------------

/// Hidden and cell state of an [`LstmCell`], both `[B, hidden]`.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

/// One LSTM cell.
///
/// Parameters are named `weight_ih{suffix}`, `weight_hh{suffix}`,
/// `bias_ih{suffix}` and `bias_hh{suffix}`, so the same type loads both
/// `nn.LSTMCell` (empty suffix) and one direction of `nn.LSTM`
/// (`_l0` / `_l0_reverse`).
#[derive(Debug, Clone)]
pub struct LstmCell {
    w_ih: Tensor,
    w_hh: Tensor,
    b_ih: Tensor,
    b_hh: Tensor,
    hidden_dim: usize,
}

impl LstmCell {
    pub fn new(in_dim: usize, hidden_dim: usize, suffix: &str, vb: VarBuilder) -> Result<Self> {
        let k = 1.0 / (hidden_dim as f64).sqrt();
        let init = Init::Uniform { lo: -k, up: k };
        let gates = 4 * hidden_dim;
        Ok(Self {
            w_ih: vb.get_with_hints((gates, in_dim), &format!("weight_ih{suffix}"), init)?,
            w_hh: vb.get_with_hints((gates, hidden_dim), &format!("weight_hh{suffix}"), init)?,
            b_ih: vb.get_with_hints(gates, &format!("bias_ih{suffix}"), init)?,
            b_hh: vb.get_with_hints(gates, &format!("bias_hh{suffix}"), init)?,
            hidden_dim,
        })
    }

    fn device(&self) -> &Device {
        self.w_ih.device()
    }

    fn dtype(&self) -> DType {
        self.w_ih.dtype()
    }
}

impl RNN for LstmCell {
    type State = LstmState;

    fn zero_state(&self, batch_dim: usize) -> Result<Self::State> {
        let zeros = Tensor::zeros((batch_dim, self.hidden_dim), self.dtype(), self.device())?;
        Ok(LstmState {
            h: zeros.clone(),
            c: zeros,
        })
    }

    fn step(&self, input: &Tensor, state: &Self::State) -> Result<Self::State> {
        // gates: [B, 4H] in PyTorch order (input, forget, cell, output)
        let gates = input
            .matmul(&self.w_ih.t()?)?
            .broadcast_add(&self.b_ih)?
            .add(&state.h.matmul(&self.w_hh.t()?)?.broadcast_add(&self.b_hh)?)?;
        let chunks = gates.chunk(4, 1)?;
        let in_gate = candle_nn::ops::sigmoid(&chunks[0])?;
        let forget_gate = candle_nn::ops::sigmoid(&chunks[1])?;
        let cell_gate = chunks[2].tanh()?;
        let out_gate = candle_nn::ops::sigmoid(&chunks[3])?;

        let c = ((forget_gate * &state.c)? + (in_gate * cell_gate)?)?;
        let h = (out_gate * c.tanh()?)?;
        Ok(LstmState { h, c })
    }

    /// Hidden states `[B, T, H]`.
    fn states_to_tensor(&self, states: &[Self::State]) -> Result<Tensor> {
        let hs: Vec<&Tensor> = states.iter().map(|s| &s.h).collect();
        Tensor::stack(&hs, 1)
    }
}

impl LstmCell {
    /// Run over `input` `[B, T, F]` from the zero state.
    ///
    /// Returns the hidden states `[B, T, H]` and the final state.
    pub fn run(&self, input: &Tensor) -> Result<(Tensor, LstmState)> {
        let (b, seq_len, _) = input.dims3()?;
        if seq_len == 0 {
            let empty = Tensor::zeros((b, 0, self.hidden_dim), self.dtype(), self.device())?;
            return Ok((empty, self.zero_state(b)?));
        }
        let states = self.seq(&input.contiguous()?)?;
        let outputs = self.states_to_tensor(&states)?;
        let last = states[states.len() - 1].clone();
        Ok((outputs, last))
    }
}

// ---------------------------------------------------------------------------
// Prenet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PrenetLayer {
    linear: Linear,
    norm: Option<BatchNorm>,
}

/// Two-layer bottleneck applied to the decoder's frame input.
///
/// Dropout (p=0.5) stays on at inference when enabled; it is the only source
/// of output variation in Tacotron2 synthesis.
#[derive(Debug, Clone)]
pub struct Prenet {
    layers: Vec<PrenetLayer>,
    dropout: bool,
}

impl Prenet {
    pub const DROPOUT: f32 = 0.5;

    pub fn new(
        in_dim: usize,
        cfg: &PrenetConfig,
        out_dims: &[usize],
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(out_dims.len());
        let mut dim = in_dim;
        for (i, &out) in out_dims.iter().enumerate() {
            let vb = vb.pp(format!("linear_layers.{i}"));
            let layer = match cfg.kind {
                PrenetKind::Original => PrenetLayer {
                    linear: Linear::new(dim, out, bias, InitGain::Relu, vb.clone())?,
                    norm: None,
                },
                PrenetKind::Bn => PrenetLayer {
                    linear: Linear::new(dim, out, bias, InitGain::Relu, vb.clone())?,
                    norm: Some(candle_nn::batch_norm(
                        out,
                        candle_nn::BatchNormConfig {
                            eps: 1e-5,
                            momentum: 0.1,
                            ..Default::default()
                        },
                        vb.pp("batch_normalization"),
                    )?),
                },
            };
            layers.push(layer);
            dim = out;
        }
        Ok(Self {
            layers,
            dropout: cfg.dropout,
        })
    }

    /// `x`: `[..., in_dim]` → `[..., out_dims.last()]`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.linear.forward(&x)?;
            if let Some(norm) = &layer.norm {
                // BatchNorm1d wants [N, C]; fold every leading axis into N.
                let dims = x.dims().to_vec();
                let channels = dims[dims.len() - 1];
                let n = x.elem_count() / channels;
                x = x
                    .reshape((n, channels))?
                    .apply_t(norm, train)?
                    .reshape(dims)?;
            }
            x = x.relu()?;
            if self.dropout {
                x = candle_nn::ops::dropout(&x, Self::DROPOUT)?;
            }
        }
        Ok(x)
    }
}
