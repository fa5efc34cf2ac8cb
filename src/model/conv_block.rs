//! Conv1d → BatchNorm1d → activation → dropout, the unit the encoder and
//! postnet are stacked from.

use candle_core::{Module, Tensor};
use candle_nn::{BatchNorm, Conv1d, VarBuilder};

use crate::{Error, Result};

/// Activation applied after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockActivation {
    None,
    Relu,
    Tanh,
}

/// One convolution block.
///
/// ```text
/// [B, C_in, T] → Conv1d(k, pad=(k-1)/2) → BatchNorm1d → act → Dropout(0.5) → [B, C_out, T]
/// ```
#[derive(Debug, Clone)]
pub struct ConvBlock {
    convolution1d: Conv1d,
    batch_normalization: BatchNorm,
    activation: BlockActivation,
}

impl ConvBlock {
    pub const DROPOUT: f32 = 0.5;

    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        activation: BlockActivation,
        vb: VarBuilder,
    ) -> Result<Self> {
        if kernel_size % 2 == 0 {
            return Err(Error::Config(format!(
                "conv block kernel size must be odd to preserve length, got {kernel_size}"
            )));
        }
        let cfg = candle_nn::Conv1dConfig {
            padding: (kernel_size - 1) / 2,
            ..Default::default()
        };
        let convolution1d = candle_nn::conv1d(
            in_channels,
            out_channels,
            kernel_size,
            cfg,
            vb.pp("convolution1d"),
        )?;
        let batch_normalization = candle_nn::batch_norm(
            out_channels,
            candle_nn::BatchNormConfig {
                eps: 1e-5,
                momentum: 0.1,
                ..Default::default()
            },
            vb.pp("batch_normalization"),
        )?;
        Ok(Self {
            convolution1d,
            batch_normalization,
            activation,
        })
    }

    /// `x`: `[B, C_in, T]` → `[B, C_out, T]`. Dropout only when `train`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let o = self.convolution1d.forward(x)?;
        let o = o.apply_t(&self.batch_normalization, train)?;
        let o = match self.activation {
            BlockActivation::None => o,
            BlockActivation::Relu => o.relu()?,
            BlockActivation::Tanh => o.tanh()?,
        };
        let o = if train {
            candle_nn::ops::dropout(&o, Self::DROPOUT)?
        } else {
            o
        };
        Ok(o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn conv_block_preserves_length() {
        let device = Device::Cpu;
        for k in [1, 3, 5, 31] {
            let (_varmap, vb) = make_vb(&device);
            let block = ConvBlock::new(4, 6, k, BlockActivation::Relu, vb).unwrap();
            let x = Tensor::randn(0f32, 1.0, (2, 4, 13), &device).unwrap();
            let y = block.forward(&x, false).unwrap();
            assert_eq!(y.dims(), &[2, 6, 13], "kernel {k}");
        }
    }

    #[test]
    fn conv_block_rejects_even_kernel() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let err = ConvBlock::new(4, 4, 4, BlockActivation::None, vb).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn conv_block_activation_ranges() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 3.0, (1, 3, 20), &device).unwrap();

        let (_varmap, vb) = make_vb(&device);
        let relu = ConvBlock::new(3, 8, 5, BlockActivation::Relu, vb).unwrap();
        let min: f32 = relu
            .forward(&x, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .min(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(min >= 0.0);

        let (_varmap, vb) = make_vb(&device);
        let tanh = ConvBlock::new(3, 8, 5, BlockActivation::Tanh, vb).unwrap();
        let max: f32 = tanh
            .forward(&x, false)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(max <= 1.0);
    }

    #[test]
    fn conv_block_eval_is_deterministic() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let block = ConvBlock::new(3, 3, 3, BlockActivation::Tanh, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 7), &device).unwrap();
        let a: Vec<f32> = block.forward(&x, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = block.forward(&x, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
