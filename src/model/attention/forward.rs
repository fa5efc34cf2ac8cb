//! Forward attention (Zhang et al., 2018).
//!
//! The softmax alignment is combined with the previous forward variable so the
//! attended position can only stay or advance by one per step:
//!
//! ```text
//! α'_t(j) = ((1 - u) α_{t-1}(j) + u α_{t-1}(j-1) + 1e-8) · y_t(j)
//! α_t     = α'_t / Σ_j α'_t(j)
//! ```
//!
//! `u` is fixed at 0.5 unless the transition agent is enabled, in which case
//! it is predicted from `[context, query]` after every step.

use candle_core::{D, Module, Tensor};
use candle_nn::VarBuilder;

use super::{Attention, AttentionCore, context, softmax_norm};
use crate::Result;
use crate::config::AttentionConfig;

#[derive(Debug, Clone)]
pub struct ForwardAttention {
    core: AttentionCore,
    /// Transition agent: `[context, query]` → transition logit.
    ta: Option<candle_nn::Linear>,
    forward_attn_mask: bool,
    /// Forward variable `[B, T]`.
    alpha: Option<Tensor>,
    /// Transition probability `[B, 1]`.
    u: Option<Tensor>,
}

impl ForwardAttention {
    pub fn new(
        core: AttentionCore,
        cfg: &AttentionConfig,
        query_dim: usize,
        embedding_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let ta = if cfg.trans_agent {
            Some(candle_nn::linear(query_dim + embedding_dim, 1, vb.pp("ta"))?)
        } else {
            None
        };
        Ok(Self {
            core,
            ta,
            forward_attn_mask: cfg.forward_attn_mask,
            alpha: None,
            u: None,
        })
    }

    fn init_forward_attn(&mut self, inputs: &Tensor) -> Result<()> {
        let (b, t, _) = inputs.dims3()?;
        let mut alpha = vec![1e-7f32; b * t];
        for row in alpha.chunks_mut(t) {
            row[0] = 1.0;
        }
        let alpha = Tensor::from_vec(alpha, (b, t), inputs.device())?.to_dtype(inputs.dtype())?;
        self.alpha = Some(alpha);
        self.u = Some((Tensor::ones((b, 1), inputs.dtype(), inputs.device())? * 0.5)?);
        Ok(())
    }

    fn apply_forward_attention(&self, alignment: &Tensor, train: bool) -> Result<Tensor> {
        let (alpha, u) = match (&self.alpha, &self.u) {
            (Some(alpha), Some(u)) => (alpha, u),
            _ => {
                return Err(crate::Error::Config(
                    "forward attention used before init_states".into(),
                ));
            }
        };
        let (b, t) = alpha.dims2()?;
        // α_{t-1}(j-1), zero at j = 0.
        let zero_col = Tensor::zeros((b, 1), alpha.dtype(), alpha.device())?;
        let fwd_shifted_alpha = if t > 1 {
            Tensor::cat(&[&zero_col, &alpha.narrow(1, 0, t - 1)?], 1)?
        } else {
            zero_col
        };
        let stay = alpha.broadcast_mul(&u.affine(-1.0, 1.0)?)?;
        let advance = fwd_shifted_alpha.broadcast_mul(u)?;
        let mut new_alpha = (((stay + advance)? + 1e-8)? * alignment)?;

        if !train && self.forward_attn_mask {
            new_alpha = force_incremental(&fwd_shifted_alpha, &new_alpha)?;
        }

        let total = new_alpha.sum_keepdim(D::Minus1)?;
        Ok(new_alpha.broadcast_div(&total)?)
    }
}

/// Keep only the neighbourhood of the previous peak `n`: positions `n-1..n+3`
/// survive, `n-2` keeps a 1% trace of the current max, the rest is zeroed.
fn force_incremental(fwd_shifted_alpha: &Tensor, alpha: &Tensor) -> Result<Tensor> {
    let peaks: Vec<u32> = fwd_shifted_alpha.argmax(D::Minus1)?.to_vec1()?;
    let mut rows: Vec<Vec<f32>> = alpha.to_dtype(candle_core::DType::F32)?.to_vec2()?;
    for (row, &n) in rows.iter_mut().zip(&peaks) {
        let n = n as usize;
        let val = row.iter().copied().fold(f32::MIN, f32::max);
        for x in row.iter_mut().skip(n + 3) {
            *x = 0.0;
        }
        for x in row.iter_mut().take(n.saturating_sub(1)) {
            *x = 0.0;
        }
        if n >= 2 {
            row[n - 2] = 0.01 * val;
        }
    }
    let (b, t) = alpha.dims2()?;
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (b, t), alpha.device())?.to_dtype(alpha.dtype())?)
}

impl Attention for ForwardAttention {
    fn preprocess_inputs(&self, inputs: &Tensor) -> Result<Tensor> {
        self.core.preprocess_inputs(inputs)
    }

    fn init_states(&mut self, inputs: &Tensor) -> Result<()> {
        self.core.init_states(inputs)?;
        self.init_forward_attn(inputs)
    }

    fn forward(
        &mut self,
        query: &Tensor,
        inputs: &Tensor,
        processed_inputs: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let energies = self.core.energies(query, processed_inputs, mask)?;
        let alignment = softmax_norm(&energies)?;
        self.core.update_location(&alignment)?;

        let alignment = self.apply_forward_attention(&alignment, train)?;
        self.alpha = Some(alignment.clone());

        let ctx = context(&alignment, inputs)?;
        self.core.set_weights(alignment.clone());

        if let Some(ta) = &self.ta {
            let ta_input = Tensor::cat(&[&ctx, query], D::Minus1)?;
            self.u = Some(candle_nn::ops::sigmoid(&ta.forward(&ta_input)?)?);
        }
        Ok((ctx, alignment))
    }

    fn attention_weights(&self) -> Option<&Tensor> {
        self.core.weights()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::*;
    use super::*;
    use crate::config::AttentionKind;
    use candle_core::Device;

    #[test]
    fn force_incremental_keeps_neighbourhood() {
        let device = Device::Cpu;
        // Previous peak (shifted) at n = 4.
        let shifted = Tensor::new(&[[0f32, 0.0, 0.0, 0.1, 0.8, 0.1, 0.0, 0.0, 0.0]], &device).unwrap();
        let alpha = Tensor::new(&[[0.1f32, 0.1, 0.1, 0.1, 0.2, 0.1, 0.1, 0.1, 0.1]], &device).unwrap();
        let out: Vec<Vec<f32>> = force_incremental(&shifted, &alpha).unwrap().to_vec2().unwrap();
        let row = &out[0];
        assert_eq!(row[0], 0.0);
        assert_eq!(row[1], 0.0);
        assert!((row[2] - 0.002).abs() < 1e-7); // n-2 = 1% of max
        assert_eq!(row[3], 0.1);
        assert_eq!(row[6], 0.1);
        assert_eq!(row[7], 0.0);
        assert_eq!(row[8], 0.0);
    }

    #[test]
    fn forward_attention_with_agent_and_mask() {
        let cfg = AttentionConfig {
            kind: AttentionKind::Forward,
            trans_agent: true,
            forward_attn_mask: true,
            location_attention: false,
            ..Default::default()
        };
        check_distribution(&cfg, &[9, 6], 5, false);
        check_distribution(&cfg, &[9, 6], 5, true);
    }

    #[test]
    fn first_step_cannot_jump() {
        // With α_0 concentrated on position 0, step 1 can only put
        // significant mass on positions 0 and 1.
        let device = Device::Cpu;
        let cfg = AttentionConfig {
            kind: AttentionKind::Forward,
            location_attention: false,
            ..Default::default()
        };
        let (_varmap, mut attn) = build(&cfg);
        let inputs = Tensor::randn(0f32, 1.0, (1, 8, EMBED_DIM), &device).unwrap();
        attn.init_states(&inputs).unwrap();
        let processed = attn.preprocess_inputs(&inputs).unwrap();
        let query = Tensor::randn(0f32, 1.0, (1, QUERY_DIM), &device).unwrap();
        let (_, w) = attn.forward(&query, &inputs, &processed, None, false).unwrap();
        let row: Vec<Vec<f32>> = w.to_vec2().unwrap();
        let head: f32 = row[0][..2].iter().sum();
        assert!(head > 0.99, "mass on first two positions: {head}");
    }
}
