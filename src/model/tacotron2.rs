//! Full Tacotron2 acoustic model.
//!
//! `Tacotron2` wires the components together:
//! - Character embedding (`num_chars × encoder_dim`)
//! - Encoder (conv stack + BiLSTM), plus an optional per-speaker vector added
//!   to every encoder frame
//! - Decoder (attention + autoregressive frame generation)
//! - Postnet residual on top of the decoder frames

use candle_core::{D, Tensor};
use candle_nn::{Embedding, Init, Module, VarBuilder};

use super::decoder::{Decoder, DecoderOutput};
use super::encoder::Encoder;
use super::mask::sequence_mask;
use super::postnet::Postnet;
use crate::config::Tacotron2Config;
use crate::{Error, Result};

/// Output of a full model pass. Frame tensors are `[B, T_out, frame_dim]`.
#[derive(Debug, Clone)]
pub struct Tacotron2Output {
    /// Raw decoder frames.
    pub decoder_outputs: Tensor,
    /// Decoder frames plus the postnet residual.
    pub postnet_outputs: Tensor,
    /// `[B, steps, T_in]`.
    pub alignments: Tensor,
    /// `[B, steps]`.
    pub stop_tokens: Tensor,
}

#[derive(Debug)]
pub struct Tacotron2 {
    embedding: Embedding,
    speaker_embedding: Option<Embedding>,
    encoder: Encoder,
    decoder: Decoder,
    postnet: Postnet,
}

impl Tacotron2 {
    pub fn new(cfg: &Tacotron2Config, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let embedding = lookup_table(cfg.num_chars, cfg.encoder_dim, vb.pp("embedding"))?;
        let speaker_embedding = if cfg.num_speakers > 1 {
            Some(lookup_table(
                cfg.num_speakers,
                cfg.encoder_dim,
                vb.pp("speaker_embedding"),
            )?)
        } else {
            None
        };
        let encoder = Encoder::new(cfg.encoder_dim, cfg.encoder_kernel_size, vb.pp("encoder"))?;
        let decoder = Decoder::new(
            cfg.encoder_dim,
            cfg.frame_dim,
            cfg.r,
            cfg.max_r,
            &cfg.decoder,
            vb.pp("decoder"),
        )?;
        let postnet = Postnet::new(
            cfg.postnet_output_dim,
            cfg.postnet_kernel_size,
            vb.pp("postnet"),
        )?;
        tracing::debug!(
            num_chars = cfg.num_chars,
            num_speakers = cfg.num_speakers,
            r = cfg.r,
            attention = ?cfg.decoder.attention.kind,
            "built tacotron2"
        );
        Ok(Self {
            embedding,
            speaker_embedding,
            encoder,
            decoder,
            postnet,
        })
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn set_r(&mut self, r: usize) -> Result<()> {
        self.decoder.set_r(r)
    }

    pub fn reset_truncated(&mut self) {
        self.decoder.reset_truncated();
    }

    /// `[B, T]` ids → `[B, encoder_dim, T]`.
    fn embed(&self, text: &Tensor) -> Result<Tensor> {
        Ok(self.embedding.forward(text)?.transpose(1, 2)?)
    }

    fn add_speaker_embedding(
        &self,
        encoder_outputs: Tensor,
        speaker_ids: Option<&Tensor>,
    ) -> Result<Tensor> {
        match (&self.speaker_embedding, speaker_ids) {
            (Some(table), Some(ids)) => {
                // [B] → [B, 1, D], broadcast over time.
                let spk = table.forward(ids)?.unsqueeze(1)?;
                Ok(encoder_outputs.broadcast_add(&spk)?)
            }
            (Some(_), None) => Err(Error::Config(
                "multi-speaker model needs speaker ids".into(),
            )),
            (None, _) => Ok(encoder_outputs),
        }
    }

    /// Decoder frames `[B, frame_dim, T]` → both frame tensors as `[B, T, C]`.
    fn refine(&self, decoder_outputs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let residual = self.postnet.forward(decoder_outputs, train)?;
        let postnet_outputs = (decoder_outputs + residual)?;
        Ok((
            decoder_outputs.transpose(1, 2)?.contiguous()?,
            postnet_outputs.transpose(1, 2)?.contiguous()?,
        ))
    }

    fn finish(&self, out: DecoderOutput, train: bool) -> Result<Tacotron2Output> {
        let (decoder_outputs, postnet_outputs) = self.refine(&out.outputs, train)?;
        Ok(Tacotron2Output {
            decoder_outputs,
            postnet_outputs,
            alignments: out.alignments,
            stop_tokens: out.stop_tokens,
        })
    }

    /// Teacher-forced pass.
    ///
    /// - `text`: `[B, T_in]` u32 ids
    /// - `text_lengths`: valid length per batch element
    /// - `mel_specs`: `[B, T_out, frame_dim]`
    /// - `speaker_ids`: `[B]` u32, required for multi-speaker models
    pub fn forward(
        &mut self,
        text: &Tensor,
        text_lengths: &[usize],
        mel_specs: &Tensor,
        speaker_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<Tacotron2Output> {
        let (_, max_len) = text.dims2()?;
        let mask = sequence_mask(text_lengths, Some(max_len), text.device())?;
        let embedded = self.embed(text)?;
        let encoder_outputs = self.encoder.forward(&embedded, text_lengths, train)?;
        let encoder_outputs = self.add_speaker_embedding(encoder_outputs, speaker_ids)?;
        let out = self
            .decoder
            .forward(&encoder_outputs, mel_specs, Some(&mask), None, train)?;
        self.finish(out, train)
    }

    /// Free-running synthesis.
    pub fn inference(&mut self, text: &Tensor, speaker_ids: Option<&Tensor>) -> Result<Tacotron2Output> {
        let embedded = self.embed(text)?;
        let encoder_outputs = self.encoder.inference(&embedded)?;
        let encoder_outputs = self.add_speaker_embedding(encoder_outputs, speaker_ids)?;
        let out = self.decoder.inference(&encoder_outputs, None)?;
        self.finish(out, false)
    }

    /// Streaming synthesis over successive text chunks of one utterance.
    pub fn inference_truncated(
        &mut self,
        text: &Tensor,
        speaker_ids: Option<&Tensor>,
    ) -> Result<Tacotron2Output> {
        let embedded = self.embed(text)?;
        let encoder_outputs = self.encoder.inference(&embedded)?;
        let encoder_outputs = self.add_speaker_embedding(encoder_outputs, speaker_ids)?;
        let out = self.decoder.inference_truncated(&encoder_outputs)?;
        self.finish(out, false)
    }

    /// Number of mel frames per output, i.e. the time axis of `postnet_outputs`.
    pub fn num_frames(out: &Tacotron2Output) -> Result<usize> {
        Ok(out.postnet_outputs.dim(D::Minus2)?)
    }
}

/// Lookup table stored as `weight`, the name PyTorch checkpoints use.
fn lookup_table(num: usize, dim: usize, vb: VarBuilder) -> Result<Embedding> {
    let weight = vb.get_with_hints(
        (num, dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        },
    )?;
    Ok(Embedding::new(weight, dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> Tacotron2Config {
        let mut cfg = Tacotron2Config {
            num_chars: 20,
            r: 2,
            max_r: 3,
            frame_dim: 6,
            postnet_output_dim: 6,
            encoder_dim: 8,
            encoder_kernel_size: 3,
            postnet_kernel_size: 3,
            decoder: DecoderConfig {
                query_dim: 10,
                decoder_rnn_dim: 10,
                prenet_dim: 4,
                attention_dim: 6,
                max_decoder_steps: 6,
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.decoder.attention.location_n_filters = 4;
        cfg.decoder.attention.location_kernel_size = 3;
        cfg
    }

    fn build(cfg: &Tacotron2Config) -> (VarMap, Tacotron2) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Tacotron2::new(cfg, vb).unwrap();
        (varmap, model)
    }

    fn text(batch: usize, len: usize) -> Tensor {
        let ids: Vec<u32> = (0..batch * len).map(|i| (i % 19) as u32 + 1).collect();
        Tensor::from_vec(ids, (batch, len), &Device::Cpu).unwrap()
    }

    #[test]
    fn forward_shapes() {
        let cfg = tiny_config();
        let (_varmap, mut model) = build(&cfg);
        let mels = Tensor::randn(0f32, 1.0, (2, 8, 6), &Device::Cpu).unwrap();
        let out = model.forward(&text(2, 7), &[7, 4], &mels, None, true).unwrap();
        assert_eq!(out.decoder_outputs.dims(), &[2, 8, 6]);
        assert_eq!(out.postnet_outputs.dims(), &[2, 8, 6]);
        assert_eq!(out.alignments.dims(), &[2, 4, 7]);
        assert_eq!(out.stop_tokens.dims(), &[2, 4]);
        assert_eq!(Tacotron2::num_frames(&out).unwrap(), 8);
    }

    #[test]
    fn inference_is_bounded() {
        let cfg = tiny_config();
        let (_varmap, mut model) = build(&cfg);
        let out = model.inference(&text(1, 5), None).unwrap();
        let steps = out.stop_tokens.dim(1).unwrap();
        assert!((1..=6).contains(&steps));
        assert_eq!(out.postnet_outputs.dims(), &[1, steps * 2, 6]);
    }

    #[test]
    fn truncated_inference_chunks() {
        let mut cfg = tiny_config();
        cfg.r = 1;
        let (_varmap, mut model) = build(&cfg);
        let first = model.inference_truncated(&text(1, 4), None).unwrap();
        let second = model.inference_truncated(&text(1, 3), None).unwrap();
        assert_eq!(first.alignments.dim(2).unwrap(), 4);
        assert_eq!(second.alignments.dim(2).unwrap(), 3);
        model.reset_truncated();
        model.set_r(2).unwrap();
        assert!(model.inference_truncated(&text(1, 3), None).is_err());
    }

    #[test]
    fn multi_speaker_requires_ids() {
        let mut cfg = tiny_config();
        cfg.num_speakers = 3;
        let (varmap, mut model) = build(&cfg);
        assert_eq!(
            varmap.data().lock().unwrap()["speaker_embedding.weight"].dims(),
            &[3, 8]
        );
        assert!(model.inference(&text(1, 4), None).is_err());
        let ids = Tensor::new(&[2u32], &Device::Cpu).unwrap();
        let out = model.inference(&text(1, 4), Some(&ids)).unwrap();
        assert_eq!(out.postnet_outputs.dim(2).unwrap(), 6);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = tiny_config();
        cfg.r = 4;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(Tacotron2::new(&cfg, vb), Err(Error::Config(_))));
    }
}
