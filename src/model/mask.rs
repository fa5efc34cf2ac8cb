//! Validity masks from sequence lengths.

use candle_core::{Device, Tensor};

use crate::Result;

/// `[B, max_len]` `u8` mask with 1 at positions `< lengths[b]` and 0 after.
///
/// `max_len` defaults to the largest length.
pub fn sequence_mask(lengths: &[usize], max_len: Option<usize>, device: &Device) -> Result<Tensor> {
    let max_len = max_len.unwrap_or_else(|| lengths.iter().copied().max().unwrap_or(0));
    let mut data = Vec::with_capacity(lengths.len() * max_len);
    for &len in lengths {
        data.extend((0..max_len).map(|t| u8::from(t < len)));
    }
    Ok(Tensor::from_vec(data, (lengths.len(), max_len), device)?)
}
