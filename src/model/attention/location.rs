//! Location-sensitive attention (softmax-normalised).

use candle_core::Tensor;

use super::{Attention, AttentionCore, context, softmax_norm};
use crate::Result;

#[derive(Debug, Clone)]
pub struct LocationSensitiveAttention {
    core: AttentionCore,
}

impl LocationSensitiveAttention {
    pub fn new(core: AttentionCore) -> Self {
        Self { core }
    }
}

impl Attention for LocationSensitiveAttention {
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
