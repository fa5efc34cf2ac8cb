//! Model components for Tacotron2.
//!
//! ## Components
//!
//! - [`conv_block`] — Conv1d + BatchNorm + activation + dropout, the shared building block
//! - [`encoder`] — conv stack + bidirectional LSTM over phoneme embeddings
//! - [`attention`] — location-sensitive, forward, windowed and sigmoid attention
//! - [`decoder`] — autoregressive frame decoder (teacher forcing, inference, streaming)
//! - [`postnet`] — residual refinement of the decoder frames
//! - [`tacotron2`] — the assembled model

pub mod attention;
pub mod conv_block;
pub mod decoder;
pub mod encoder;
pub mod layers;
pub mod mask;
pub mod postnet;
pub mod tacotron2;

pub use decoder::{Decoder, DecoderOutput, DecoderState};
pub use tacotron2::{Tacotron2, Tacotron2Output};
