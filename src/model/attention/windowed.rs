//! Windowed attention.
//!
//! At inference, energies outside `[win_idx - 2, win_idx + 6)` are masked,
//! where `win_idx` is the argmax of the previous step. The window index is
//! tracked per batch element. During training it behaves like plain softmax
//! attention.

use candle_core::{D, DType, Tensor};

use super::{Attention, AttentionCore, context, softmax_norm};
use crate::Result;

const WIN_BACK: i64 = 2;
const WIN_FRONT: i64 = 6;

#[derive(Debug, Clone)]
pub struct WindowedAttention {
    core: AttentionCore,
    /// `None` until the first windowed step after a reset.
    win_idx: Option<Vec<i64>>,
}

impl WindowedAttention {
    pub fn new(core: AttentionCore) -> Self {
        Self {
            core,
            win_idx: None,
        }
    }

    /// Current window centre per batch element (`-1` before the first step).
    pub fn win_idx(&self) -> Option<&[i64]> {
        self.win_idx.as_deref()
    }

    fn apply_windowing(&mut self, energies: &Tensor) -> Result<Tensor> {
        let (b, t) = energies.dims2()?;
        let win_idx = self.win_idx.take().unwrap_or_else(|| vec![-1; b]);

        let mut keep = Vec::with_capacity(b * t);
        for &idx in &win_idx {
            let back = idx - WIN_BACK;
            let front = idx + WIN_FRONT;
            keep.extend((0..t as i64).map(|j| u8::from(!(back > 0 && j < back) && j < front)));
        }
        let keep = Tensor::from_vec(keep, (b, t), energies.device())?;
        let mut energies = super::masked_fill_neg_inf(energies, &keep)?;

        // First step: pin position 0 to the row maximum so the window starts there.
        let mut first = Vec::with_capacity(b * t);
        for &idx in &win_idx {
            first.extend((0..t).map(|j| u8::from(idx == -1 && j == 0)));
        }
        let first = Tensor::from_vec(first, (b, t), energies.device())?;
        let row_max = energies.max_keepdim(D::Minus1)?.broadcast_as((b, t))?.contiguous()?;
        energies = first.where_cond(&row_max, &energies)?;

        let peaks: Vec<u32> = energies.argmax(D::Minus1)?.to_dtype(DType::U32)?.to_vec1()?;
        self.win_idx = Some(peaks.into_iter().map(i64::from).collect());
        Ok(energies)
    }
}

impl Attention for WindowedAttention {
    fn preprocess_inputs(&self, inputs: &Tensor) -> Result<Tensor> {
        self.core.preprocess_inputs(inputs)
    }

    fn init_states(&mut self, inputs: &Tensor) -> Result<()> {
        self.init_win_idx();
        self.core.init_states(inputs)
    }

    fn init_win_idx(&mut self) {
        self.win_idx = None;
    }

    fn forward(
        &mut self,
        query: &Tensor,
        inputs: &Tensor,
        processed_inputs: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let mut energies = self.core.energies(query, processed_inputs, mask)?;
        if !train {
            energies = self.apply_windowing(&energies)?;
        }
        let alignment = softmax_norm(&energies)?;
        self.core.update_location(&alignment)?;
        let ctx = context(&alignment, inputs)?;
        self.core.set_weights(alignment.clone());
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
    use crate::config::{AttentionConfig, AttentionKind};
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn windowed() -> (VarMap, WindowedAttention) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = AttentionConfig {
            kind: AttentionKind::Windowed,
            location_attention: false,
            ..Default::default()
        };
        let core = AttentionCore::new(&cfg, QUERY_DIM, EMBED_DIM, ATTN_DIM, vb).unwrap();
        (varmap, WindowedAttention::new(core))
    }

    #[test]
    fn first_step_window_covers_prefix() {
        let (_varmap, mut attn) = windowed();
        let device = Device::Cpu;
        // Peak far outside the initial window [0, 5).
        let energies = Tensor::new(&[[0f32, 0.5, 0.2, 0.1, 0.3, 0.0, 0.0, 0.0, 9.0, 0.0]], &device)
            .unwrap();
        let out: Vec<Vec<f32>> = attn.apply_windowing(&energies).unwrap().to_vec2().unwrap();
        assert!(out[0][5..].iter().all(|x| x.is_infinite()));
        // Position 0 is pinned to the windowed row max, tying with position 1.
        assert_eq!(out[0][0], 0.5);
        assert!(attn.win_idx().unwrap()[0] <= 1);
    }

    #[test]
    fn window_follows_peak() {
        let (_varmap, mut attn) = windowed();
        let device = Device::Cpu;
        attn.win_idx = Some(vec![5]);
        let energies = Tensor::new(&[[0f32, 0.0, 9.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]], &device)
            .unwrap();
        let out: Vec<Vec<f32>> = attn.apply_windowing(&energies).unwrap().to_vec2().unwrap();
        // back = 3 → positions 0..3 masked; front = 11 → position 11 masked.
        assert!(out[0][..3].iter().all(|x| x.is_infinite()));
        assert!(out[0][11].is_infinite());
        assert!(out[0][3..11].iter().all(|x| x.is_finite()));
        assert_eq!(attn.win_idx().unwrap(), &[6]);
    }

    #[test]
    fn init_win_idx_resets() {
        let (_varmap, mut attn) = windowed();
        attn.win_idx = Some(vec![4]);
        attn.init_win_idx();
        assert!(attn.win_idx().is_none());
    }

    #[test]
    fn windowed_eval_distributions() {
        let cfg = AttentionConfig {
            kind: AttentionKind::Windowed,
            location_n_filters: 4,
            location_kernel_size: 3,
            ..Default::default()
        };
        check_distribution(&cfg, &[12, 2], 6, false);
    }
}
