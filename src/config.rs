//! Configuration for the Tacotron2 acoustic model.
//!
//! Defaults match the reference LJSpeech setup: 80-bin mel frames, 512-dim
//! encoder, 1024-dim recurrent cells and location-sensitive attention.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prenet layer flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrenetKind {
    /// Linear → ReLU → dropout.
    #[default]
    Original,
    /// Linear → BatchNorm → ReLU → dropout.
    Bn,
}

/// Prenet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrenetConfig {
    pub kind: PrenetKind,
    /// Apply dropout (p=0.5) in every mode, inference included.
    pub dropout: bool,
}

impl Default for PrenetConfig {
    fn default() -> Self {
        Self {
            kind: PrenetKind::Original,
            dropout: true,
        }
    }
}

/// Attention mechanism used by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// Additive attention with location features, softmax normalised.
    #[default]
    LocationSensitive,
    /// Forward attention: alignments can only stay or move one step ahead.
    Forward,
    /// Softmax attention restricted to a window around the last peak at inference.
    Windowed,
    /// Monotonic-normalised attention: `sigmoid(e) / sum(sigmoid(e))`.
    Sigmoid,
}

/// Attention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub kind: AttentionKind,
    /// Add location features (conv over previous + cumulative weights) to the energies.
    pub location_attention: bool,
    pub location_n_filters: usize,
    pub location_kernel_size: usize,
    /// Forward attention only: learn the transition probability `u`.
    pub trans_agent: bool,
    /// Forward attention only: force incremental alignment at inference.
    pub forward_attn_mask: bool,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            kind: AttentionKind::LocationSensitive,
            location_attention: true,
            location_n_filters: 32,
            location_kernel_size: 31,
            trans_agent: false,
            forward_attn_mask: false,
        }
    }
}

/// Decoder hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub query_dim: usize,
    pub decoder_rnn_dim: usize,
    pub prenet_dim: usize,
    pub attention_dim: usize,
    pub p_attention_dropout: f32,
    pub p_decoder_dropout: f32,
    /// `sigmoid(stop_logit)` above this ends an inference run.
    pub stop_threshold: f64,
    /// Hard ceiling on inference steps.
    pub max_decoder_steps: usize,
    /// Detach the stopnet input from the decoding graph.
    pub separate_stopnet: bool,
    /// Width of the per-step speaker vector fed next to the frames (0 = none).
    pub speaker_embedding_dim: usize,
    pub prenet: PrenetConfig,
    pub attention: AttentionConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            query_dim: 1024,
            decoder_rnn_dim: 1024,
            prenet_dim: 256,
            attention_dim: 128,
            p_attention_dropout: 0.1,
            p_decoder_dropout: 0.1,
            stop_threshold: 0.7,
            max_decoder_steps: 1_000_000,
            separate_stopnet: true,
            speaker_embedding_dim: 0,
            prenet: PrenetConfig::default(),
            attention: AttentionConfig::default(),
        }
    }
}

/// Top-level model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tacotron2Config {
    pub num_chars: usize,
    /// More than one speaker enables the speaker embedding table.
    pub num_speakers: usize,
    /// Initial reduction factor.
    pub r: usize,
    /// Largest reduction factor the frame projection is sized for.
    pub max_r: usize,
    /// Mel bins per frame produced by the decoder.
    pub frame_dim: usize,
    pub postnet_output_dim: usize,
    pub encoder_dim: usize,
    pub encoder_kernel_size: usize,
    pub postnet_kernel_size: usize,
    pub decoder: DecoderConfig,
}

impl Default for Tacotron2Config {
    fn default() -> Self {
        Self {
            num_chars: 61,
            num_speakers: 1,
            r: 1,
            max_r: 7,
            frame_dim: 80,
            postnet_output_dim: 80,
            encoder_dim: 512,
            encoder_kernel_size: 5,
            postnet_kernel_size: 5,
            decoder: DecoderConfig::default(),
        }
    }
}

impl Tacotron2Config {
    /// Load a (possibly partial) JSON config; missing keys fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the model cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.r == 0 || self.r > self.max_r {
            return Err(Error::Config(format!(
                "r must be in 1..={}, got {}",
                self.max_r, self.r
            )));
        }
        for (name, k) in [
            ("encoder_kernel_size", self.encoder_kernel_size),
            ("postnet_kernel_size", self.postnet_kernel_size),
            (
                "attention.location_kernel_size",
                self.decoder.attention.location_kernel_size,
            ),
        ] {
            if k % 2 == 0 {
                return Err(Error::Config(format!("{name} must be odd, got {k}")));
            }
        }
        if self.encoder_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "encoder_dim must be even (split across LSTM directions), got {}",
                self.encoder_dim
            )));
        }
        if self.frame_dim != self.postnet_output_dim {
            return Err(Error::Config(format!(
                "postnet_output_dim ({}) must equal frame_dim ({})",
                self.postnet_output_dim, self.frame_dim
            )));
        }
        if !(0.0..=1.0).contains(&self.decoder.stop_threshold) {
            return Err(Error::Config(format!(
                "stop_threshold must be a probability, got {}",
                self.decoder.stop_threshold
            )));
        }
        if self.decoder.max_decoder_steps == 0 {
            return Err(Error::Config("max_decoder_steps must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Tacotron2Config::default();
        assert_eq!(cfg.frame_dim, 80);
        assert_eq!(cfg.decoder.query_dim, 1024);
        assert_eq!(cfg.decoder.max_decoder_steps, 1_000_000);
        assert!((cfg.decoder.stop_threshold - 0.7).abs() < 1e-12);
        assert_eq!(cfg.decoder.attention.kind, AttentionKind::LocationSensitive);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "r": 2,
            "decoder": { "attention": { "kind": "forward", "trans_agent": true } }
        }"#;
        let cfg = Tacotron2Config::from_json_str(json).unwrap();
        assert_eq!(cfg.r, 2);
        assert_eq!(cfg.encoder_dim, 512);
        assert_eq!(cfg.decoder.attention.kind, AttentionKind::Forward);
        assert!(cfg.decoder.attention.trans_agent);
        assert_eq!(cfg.decoder.attention.location_kernel_size, 31);
        assert_eq!(cfg.decoder.prenet.kind, PrenetKind::Original);
    }

    #[test]
    fn test_rejects_bad_r() {
        let cfg = Tacotron2Config {
            r: 8,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        let cfg = Tacotron2Config {
            r: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_even_kernel() {
        let cfg = Tacotron2Config {
            postnet_kernel_size: 4,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_prenet_kind_serde() {
        let kind: PrenetKind = serde_json::from_str("\"bn\"").unwrap();
        assert_eq!(kind, PrenetKind::Bn);
        let s = serde_json::to_string(&AttentionKind::Sigmoid).unwrap();
        assert_eq!(s, "\"sigmoid\"");
    }
}
