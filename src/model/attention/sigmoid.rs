//! Monotonic-normalised attention: weights are `sigmoid(e_j) / Σ_k sigmoid(e_k)`.
//!
//! Unlike softmax, a sigmoid saturates, so a single very peaked energy cannot
//! swallow all the mass. Masked positions get `sigmoid(-inf) = 0`.

use candle_core::Tensor;

use super::{Attention, AttentionCore, context, sigmoid_norm};
use crate::Result;

#[derive(Debug, Clone)]
pub struct SigmoidAttention {
    core: AttentionCore,
}

impl SigmoidAttention {
    pub fn new(core: AttentionCore) -> Self {
        Self { core }
    }
}

impl Attention for SigmoidAttention {
    fn preprocess_inputs(&self, inputs: &Tensor) -> Result<Tensor> {
        self.core.preprocess_inputs(inputs)
    }

    fn init_states(&mut self, inputs: &Tensor) -> Result<()> {
        self.core.init_states(inputs)
    }

    fn forward(
        &mut self,
        query: &Tensor,
        inputs: &Tensor,
        processed_inputs: &Tensor,
        mask: Option<&Tensor>,
        _train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let energies = self.core.energies(query, processed_inputs, mask)?;
        let alignment = sigmoid_norm(&energies)?;
        self.core.update_location(&alignment)?;
        let ctx = context(&alignment, inputs)?;
        self.core.set_weights(alignment.clone());
        Ok((ctx, alignment))
    }

    fn attention_weights(&self) -> Option<&Tensor> {
        self.core.weights()
    }
}
