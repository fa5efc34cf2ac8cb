//! Tacotron2 spectrogram prediction in pure Rust.
//!
//! A candle-based implementation of the Tacotron2 sequence-to-sequence
//! acoustic model: phoneme ids in, mel spectrogram frames out. Weights load
//! from safetensors files with the usual parameter names.
//!
//! ## Architecture
//!
//! ```text
//! phoneme ids → embedding → Encoder (3× conv + BiLSTM)
//!                               ↓ encoder memory
//!               Decoder (prenet → attention LSTM → attention → decoder LSTM)
//!                               ↓ r frames per step, stop logit
//!               Postnet (5× conv, residual)
//!                               ↓
//!                         mel spectrogram
//! ```
//!
//! ## Modules
//!
//! - [`config`] — serde model configuration
//! - [`model`] — encoder, attention, decoder, postnet and the assembled model

pub mod config;
pub mod model;

mod error;

pub use error::{Error, Result};
