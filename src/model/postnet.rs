//! Postnet: five conv blocks predicting a residual on top of the decoder frames.
//!
//! ```text
//! [B, out, T] → ConvBlock(out→512, tanh) → 3× ConvBlock(512→512, tanh)
//!             → ConvBlock(512→out, none) → [B, out, T]
//! ```

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::conv_block::{BlockActivation, ConvBlock};
use crate::Result;

pub const POSTNET_CHANNELS: usize = 512;

#[derive(Debug, Clone)]
pub struct Postnet {
    convolutions: Vec<ConvBlock>,
}

impl Postnet {
    pub fn new(output_dim: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        Self::with_convs(output_dim, kernel_size, 5, vb)
    }

    /// `num_convs` must be at least 2 (first and last block).
    pub fn with_convs(
        output_dim: usize,
        kernel_size: usize,
        num_convs: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb = vb.pp("convolutions");
        let mut convolutions = Vec::with_capacity(num_convs);
        convolutions.push(ConvBlock::new(
            output_dim,
            POSTNET_CHANNELS,
            kernel_size,
            BlockActivation::Tanh,
            vb.pp(0),
        )?);
        for i in 1..num_convs.saturating_sub(1) {
            convolutions.push(ConvBlock::new(
                POSTNET_CHANNELS,
                POSTNET_CHANNELS,
                kernel_size,
                BlockActivation::Tanh,
                vb.pp(i),
            )?);
        }
        convolutions.push(ConvBlock::new(
            POSTNET_CHANNELS,
            output_dim,
            kernel_size,
            BlockActivation::None,
            vb.pp(num_convs.max(2) - 1),
        )?);
        Ok(Self { convolutions })
    }

    /// Returns the residual only; callers add it to the decoder output.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut o = x.clone();
        for layer in &self.convolutions {
            o = layer.forward(&o, train)?;
        }
        Ok(o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn postnet_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let postnet = Postnet::new(80, 5, vb).unwrap();
        assert_eq!(postnet.convolutions.len(), 5);
        let x = Tensor::randn(0f32, 1.0, (2, 80, 17), &device).unwrap();
        let y = postnet.forward(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 80, 17]);
    }

    #[test]
    fn postnet_parameter_names() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        Postnet::new(8, 5, vb.pp("postnet")).unwrap();
        let data = varmap.data().lock().unwrap();
        assert_eq!(
            data["postnet.convolutions.0.convolution1d.weight"].dims(),
            &[512, 8, 5]
        );
        assert_eq!(
            data["postnet.convolutions.4.convolution1d.weight"].dims(),
            &[8, 512, 5]
        );
        assert!(data.contains_key("postnet.convolutions.2.batch_normalization.running_var"));
    }
}
