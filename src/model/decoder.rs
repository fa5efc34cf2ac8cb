//! Attention-coupled autoregressive decoder.
//!
//! ## One decoding step
//!
//! ```text
//! memory [B, prenet] ─┬─ cat(context) ─→ attention LSTM ─→ query
//!                     │                         │
//!                     │        attention(query, encoder memory) ─→ context, alignment
//!                     │                         │
//!                     └──── cat(query, context) ─→ decoder LSTM ─→ hidden
//!                                                  │
//!                   cat(hidden, context) ─→ linear_projection ─→ frames [B, frame_dim·max_r]
//!                   cat(hidden, frames)  ─→ stopnet ─→ stop logit [B, 1]
//! ```
//!
//! Only the first `frame_dim · r` projected values are kept, so `r` can change
//! between runs without touching the projection weights.
//!
//! ## Entry points
//!
//! - [`Decoder::forward`] — teacher forcing over ground-truth frames
//! - [`Decoder::inference`] — free running until the stop gate fires
//! - [`Decoder::inference_truncated`] — free running, state kept across calls
//! - [`Decoder::inference_step`] — a single externally driven step
//!
//! All of them go through [`Decoder::decode`], which takes the recurrent state
//! by value and returns the next one.

use candle_core::{D, DType, Device, IndexOp, Module, Tensor};
use candle_nn::{RNN, VarBuilder};

use super::attention::{Attention, build_attention};
use super::layers::{InitGain, Linear, LstmCell, LstmState, Prenet};
use crate::config::DecoderConfig;
use crate::{Error, Result};

const STOPNET_DROPOUT: f32 = 0.1;

// ---------------------------------------------------------------------------
// State records
// ---------------------------------------------------------------------------

/// Recurrent state carried from one step to the next.
#[derive(Debug, Clone)]
pub struct DecoderState {
    /// Attention LSTM hidden state `[B, query_dim]`.
    pub query: Tensor,
    pub attention_rnn_cell_state: Tensor,
    /// Decoder LSTM state `[B, decoder_rnn_dim]`.
    pub decoder_hidden: Tensor,
    pub decoder_cell: Tensor,
    /// Last attention context `[B, D_enc]`.
    pub context: Tensor,
}

impl DecoderState {
    pub fn zeros(
        batch: usize,
        query_dim: usize,
        decoder_rnn_dim: usize,
        embedding_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let query = Tensor::zeros((batch, query_dim), dtype, device)?;
        let decoder_hidden = Tensor::zeros((batch, decoder_rnn_dim), dtype, device)?;
        Ok(Self {
            attention_rnn_cell_state: query.clone(),
            query,
            decoder_cell: decoder_hidden.clone(),
            decoder_hidden,
            context: Tensor::zeros((batch, embedding_dim), dtype, device)?,
        })
    }
}

/// Encoder memory as seen by every step of one run.
#[derive(Debug, Clone)]
pub struct MemoryView {
    pub inputs: Tensor,
    pub processed_inputs: Tensor,
    pub mask: Option<Tensor>,
}

/// Result of a single [`Decoder::decode`] call.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `[B, frame_dim · r]`.
    pub decoder_output: Tensor,
    /// `[B, T_in]`.
    pub alignment: Tensor,
    /// `[B, 1]`: a logit from `decode`, a probability from `inference_step`.
    pub stop_token: Tensor,
}

impl StepOutput {
    /// `(decoder_output, stop_token, alignment)`, the order `inference_step`
    /// callers have always received.
    pub fn into_tuple(self) -> (Tensor, Tensor, Tensor) {
        (self.decoder_output, self.stop_token, self.alignment)
    }
}

/// Stacked outputs of a decoding run.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[B, frame_dim, steps · r]`.
    pub outputs: Tensor,
    /// `[B, steps, T_in]`.
    pub alignments: Tensor,
    /// `[B, steps]`: logits from [`Decoder::forward`], sigmoid probabilities
    /// from the inference entry points.
    pub stop_tokens: Tensor,
}

impl DecoderOutput {
    pub fn num_steps(&self) -> Result<usize> {
        Ok(self.stop_tokens.dim(1)?)
    }
}

/// State retained between [`Decoder::inference_truncated`] calls.
#[derive(Debug, Clone)]
struct TruncatedState {
    memory: Tensor,
    state: DecoderState,
}

/// State of an externally driven [`Decoder::inference_step`] sequence.
#[derive(Debug, Clone)]
struct StepperState {
    state: DecoderState,
    view: MemoryView,
}

// ---------------------------------------------------------------------------
// Step loop parameters
// ---------------------------------------------------------------------------

/// Where each step's (pre-prenet or prenet-processed) input comes from.
enum StepInput<'a> {
    /// Prenet output for every step, `[steps, B, prenet_dim]`.
    Teacher(Tensor),
    /// Previous output fed back through the prenet.
    Feedback {
        memory: Tensor,
        speaker_embeddings: Option<&'a Tensor>,
        /// Feed only the last frame of each group back.
        keep_last_frame: bool,
    },
}

/// When a run ends.
enum StopRule {
    /// Run until the teacher sequence is exhausted.
    Exhaust,
    /// `sigmoid(stop) > threshold` (for every batch element), optionally only
    /// once the step index exceeds `min_step`; always at `max_steps`.
    Gate {
        threshold: f64,
        min_step: Option<f64>,
        max_steps: usize,
    },
}

struct RunResult {
    state: DecoderState,
    steps: Vec<StepOutput>,
    /// Last memory fed to the prenet (feedback runs only).
    memory: Option<Tensor>,
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Decoder {
    prenet: Prenet,
    attention_rnn: LstmCell,
    attention: Box<dyn Attention>,
    decoder_rnn: LstmCell,
    linear_projection: Linear,
    stopnet: Linear,
    frame_dim: usize,
    r: usize,
    max_r: usize,
    embedding_dim: usize,
    cfg: DecoderConfig,
    truncated: Option<TruncatedState>,
    stepper: Option<StepperState>,
}

impl Decoder {
    /// - `embedding_dim`: encoder output width
    /// - `frame_dim`: mel bins per frame
    /// - `r`: initial reduction factor, `1 <= r <= max_r`
    pub fn new(
        embedding_dim: usize,
        frame_dim: usize,
        r: usize,
        max_r: usize,
        cfg: &DecoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if r == 0 || r > max_r {
            return Err(Error::Config(format!("r must be in 1..={max_r}, got {r}")));
        }
        if cfg.max_decoder_steps == 0 {
            return Err(Error::Config("max_decoder_steps must be > 0".into()));
        }
        let prenet = Prenet::new(
            frame_dim + cfg.speaker_embedding_dim,
            &cfg.prenet,
            &[cfg.prenet_dim, cfg.prenet_dim],
            false,
            vb.pp("prenet"),
        )?;
        let attention_rnn = LstmCell::new(
            cfg.prenet_dim + embedding_dim,
            cfg.query_dim,
            "",
            vb.pp("attention_rnn"),
        )?;
        let attention = build_attention(
            &cfg.attention,
            cfg.query_dim,
            embedding_dim,
            cfg.attention_dim,
            vb.pp("attention"),
        )?;
        let decoder_rnn = LstmCell::new(
            cfg.query_dim + embedding_dim,
            cfg.decoder_rnn_dim,
            "",
            vb.pp("decoder_rnn"),
        )?;
        let linear_projection = Linear::new(
            cfg.decoder_rnn_dim + embedding_dim,
            frame_dim * max_r,
            true,
            InitGain::Linear,
            vb.pp("linear_projection"),
        )?;
        // Index 1 of the (Dropout, Linear) sequential in exported checkpoints.
        let stopnet = Linear::new(
            cfg.decoder_rnn_dim + frame_dim * max_r,
            1,
            true,
            InitGain::Sigmoid,
            vb.pp("stopnet.1"),
        )?;
        Ok(Self {
            prenet,
            attention_rnn,
            attention,
            decoder_rnn,
            linear_projection,
            stopnet,
            frame_dim,
            r,
            max_r,
            embedding_dim,
            cfg: cfg.clone(),
            truncated: None,
            stepper: None,
        })
    }

    pub fn r(&self) -> usize {
        self.r
    }

    pub fn frame_dim(&self) -> usize {
        self.frame_dim
    }

    /// Change the reduction factor for subsequent runs.
    pub fn set_r(&mut self, new_r: usize) -> Result<()> {
        if new_r == 0 || new_r > self.max_r {
            return Err(Error::Config(format!(
                "r must be in 1..={}, got {new_r}",
                self.max_r
            )));
        }
        self.r = new_r;
        Ok(())
    }

    /// Forget the streaming state kept by [`Decoder::inference_truncated`].
    pub fn reset_truncated(&mut self) {
        self.truncated = None;
    }

    /// Zero "go" frame group `[B, frame_dim · r]`.
    pub fn go_frame(&self, inputs: &Tensor) -> Result<Tensor> {
        let batch = inputs.dim(0)?;
        Ok(Tensor::zeros(
            (batch, self.frame_dim * self.r),
            inputs.dtype(),
            inputs.device(),
        )?)
    }

    fn zero_state(&self, inputs: &Tensor) -> Result<DecoderState> {
        DecoderState::zeros(
            inputs.dim(0)?,
            self.cfg.query_dim,
            self.cfg.decoder_rnn_dim,
            self.embedding_dim,
            inputs.dtype(),
            inputs.device(),
        )
    }

    fn memory_view(&self, inputs: &Tensor, mask: Option<&Tensor>) -> Result<MemoryView> {
        Ok(MemoryView {
            inputs: inputs.clone(),
            processed_inputs: self.attention.preprocess_inputs(inputs)?,
            mask: mask.cloned(),
        })
    }

    /// Group ground-truth frames `[B, T, frame_dim]` into time-major steps
    /// `[ceil(T / r), B, frame_dim · r]`. Already grouped input
    /// (`[B, T / r, frame_dim · r]`) is only transposed. A trailing partial
    /// group is zero padded.
    pub fn reshape_memory(&self, memory: &Tensor) -> Result<Tensor> {
        let (batch, frames, width) = memory.dims3()?;
        let grouped = if width == self.frame_dim {
            let groups = frames.div_ceil(self.r);
            let padded = if groups * self.r != frames {
                let pad = Tensor::zeros(
                    (batch, groups * self.r - frames, width),
                    memory.dtype(),
                    memory.device(),
                )?;
                Tensor::cat(&[memory, &pad], 1)?
            } else {
                memory.clone()
            };
            padded.reshape((batch, groups, self.frame_dim * self.r))?
        } else if width == self.frame_dim * self.r {
            memory.clone()
        } else {
            return Err(Error::Config(format!(
                "frame width {width} is neither frame_dim ({}) nor frame_dim * r ({})",
                self.frame_dim,
                self.frame_dim * self.r
            )));
        };
        Ok(grouped.transpose(0, 1)?.contiguous()?)
    }

    /// Keep the trailing `frame_dim` values of the last axis: the last frame of
    /// each group is what conditions the next step.
    pub fn update_memory(&self, memory: &Tensor) -> Result<Tensor> {
        let width = memory.dim(D::Minus1)?;
        if width < self.frame_dim {
            return Err(Error::Config(format!(
                "memory width {width} is smaller than frame_dim {}",
                self.frame_dim
            )));
        }
        let last = memory.rank() - 1;
        Ok(memory.narrow(last, width - self.frame_dim, self.frame_dim)?)
    }

    /// Stack per-step results into batch-major tensors.
    ///
    /// Frames `[steps][B, frame_dim · r]` become `[B, frame_dim, steps · r]`,
    /// stop tokens `[steps][B, 1]` become `[B, steps]` and alignments
    /// `[steps][B, T_in]` become `[B, steps, T_in]`.
    pub fn parse_outputs(
        &self,
        outputs: &[Tensor],
        stop_tokens: &[Tensor],
        alignments: &[Tensor],
    ) -> Result<DecoderOutput> {
        if outputs.is_empty() {
            return Err(Error::Config("decoder produced no steps".into()));
        }
        let alignments = Tensor::stack(alignments, 1)?;
        let stop_tokens = Tensor::stack(stop_tokens, 1)?;
        let stop_tokens = if stop_tokens.rank() == 3 {
            stop_tokens.squeeze(2)?
        } else {
            stop_tokens
        };
        let outputs = Tensor::stack(outputs, 1)?;
        let batch = outputs.dim(0)?;
        let outputs = outputs
            .reshape((batch, (), self.frame_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(DecoderOutput {
            outputs,
            alignments,
            stop_tokens,
        })
    }

    /// One decoding step.
    ///
    /// `memory` is the prenet output for this step, `[B, prenet_dim]`.
    pub fn decode(
        &mut self,
        state: DecoderState,
        view: &MemoryView,
        memory: &Tensor,
        train: bool,
    ) -> Result<(DecoderState, StepOutput)> {
        let query_input = Tensor::cat(&[memory, &state.context], D::Minus1)?;
        let attention_rnn_state = self.attention_rnn.step(
            &query_input,
            &LstmState {
                h: state.query,
                c: state.attention_rnn_cell_state,
            },
        )?;
        let query = dropout(&attention_rnn_state.h, self.cfg.p_attention_dropout, train)?;
        let attention_rnn_cell_state =
            dropout(&attention_rnn_state.c, self.cfg.p_attention_dropout, train)?;

        let (context, alignment) = self.attention.forward(
            &query,
            &view.inputs,
            &view.processed_inputs,
            view.mask.as_ref(),
            train,
        )?;

        let decoder_rnn_input = Tensor::cat(&[&query, &context], D::Minus1)?;
        let decoder_rnn_state = self.decoder_rnn.step(
            &decoder_rnn_input,
            &LstmState {
                h: state.decoder_hidden,
                c: state.decoder_cell,
            },
        )?;
        let decoder_hidden = dropout(&decoder_rnn_state.h, self.cfg.p_decoder_dropout, train)?;
        let decoder_cell = decoder_rnn_state.c;

        let decoder_hidden_context = Tensor::cat(&[&decoder_hidden, &context], D::Minus1)?;
        let decoder_output = self.linear_projection.forward(&decoder_hidden_context)?;

        let stopnet_input = Tensor::cat(&[&decoder_hidden, &decoder_output], D::Minus1)?;
        let stopnet_input = if self.cfg.separate_stopnet {
            stopnet_input.detach()
        } else {
            stopnet_input
        };
        let stopnet_input = dropout(&stopnet_input, STOPNET_DROPOUT, train)?;
        let stop_token = self.stopnet.forward(&stopnet_input)?;

        let decoder_output = decoder_output.narrow(1, 0, self.r * self.frame_dim)?;

        let next = DecoderState {
            query,
            attention_rnn_cell_state,
            decoder_hidden,
            decoder_cell,
            context,
        };
        Ok((
            next,
            StepOutput {
                decoder_output,
                alignment,
                stop_token,
            },
        ))
    }

    /// Prenet input for a fed-back memory, with optional speaker conditioning.
    fn feedback_input(
        &self,
        memory: &Tensor,
        speaker_embeddings: Option<&Tensor>,
    ) -> Result<Tensor> {
        let memory = match speaker_embeddings {
            Some(spk) => Tensor::cat(&[memory, spk], D::Minus1)?,
            None => memory.clone(),
        };
        Ok(self.prenet.forward(&memory, false)?)
    }

    /// Shared driving loop behind every multi-step entry point.
    fn run_steps(
        &mut self,
        mut state: DecoderState,
        view: &MemoryView,
        mut source: StepInput<'_>,
        stop: StopRule,
        train: bool,
    ) -> Result<RunResult> {
        let mut steps: Vec<StepOutput> = Vec::new();
        let mut t = 0usize;
        loop {
            let input = match &source {
                StepInput::Teacher(memories) => {
                    if t >= memories.dim(0)? {
                        break;
                    }
                    memories.i(t)?
                }
                StepInput::Feedback {
                    memory,
                    speaker_embeddings,
                    ..
                } => self.feedback_input(memory, *speaker_embeddings)?,
            };

            let (next, mut step) = self.decode(state, view, &input, train)?;
            state = next;

            match &stop {
                StopRule::Exhaust => steps.push(step),
                StopRule::Gate {
                    threshold,
                    min_step,
                    max_steps,
                } => {
                    step.stop_token = candle_nn::ops::sigmoid(&step.stop_token.detach())?;
                    let stop_prob: f32 = step
                        .stop_token
                        .flatten_all()?
                        .min(0)?
                        .to_dtype(DType::F32)?
                        .to_scalar()?;
                    let frames = step.decoder_output.clone();
                    steps.push(step);

                    let past_guard = min_step.is_none_or(|m| t as f64 > m);
                    if f64::from(stop_prob) > *threshold && past_guard {
                        break;
                    }
                    if steps.len() >= *max_steps {
                        tracing::warn!(
                            max_decoder_steps = *max_steps,
                            "decoder stopped with max_decoder_steps"
                        );
                        break;
                    }

                    if let StepInput::Feedback {
                        memory,
                        keep_last_frame,
                        ..
                    } = &mut source
                    {
                        *memory = if *keep_last_frame {
                            self.update_memory(&frames)?
                        } else {
                            frames
                        };
                    }
                }
            }
            t += 1;
        }

        let memory = match source {
            StepInput::Feedback { memory, .. } => Some(memory),
            StepInput::Teacher(_) => None,
        };
        Ok(RunResult {
            state,
            steps,
            memory,
        })
    }

    fn finish(&self, steps: Vec<StepOutput>) -> Result<DecoderOutput> {
        let mut outputs = Vec::with_capacity(steps.len());
        let mut stop_tokens = Vec::with_capacity(steps.len());
        let mut alignments = Vec::with_capacity(steps.len());
        for step in steps {
            outputs.push(step.decoder_output);
            stop_tokens.push(step.stop_token);
            alignments.push(step.alignment);
        }
        self.parse_outputs(&outputs, &stop_tokens, &alignments)
    }

    /// Teacher-forced run.
    ///
    /// - `inputs`: encoder memory `[B, T_in, D_enc]`
    /// - `memories`: ground truth `[B, T_out, frame_dim]` (or pre-grouped
    ///   `[B, T_out / r, frame_dim · r]`)
    /// - `mask`: `[B, T_in]` validity mask
    /// - `speaker_embeddings`: `[B, speaker_embedding_dim]`
    ///
    /// Runs exactly `ceil(T_out / r)` steps.
    pub fn forward(
        &mut self,
        inputs: &Tensor,
        memories: &Tensor,
        mask: Option<&Tensor>,
        speaker_embeddings: Option<&Tensor>,
        train: bool,
    ) -> Result<DecoderOutput> {
        let go = self.go_frame(inputs)?.unsqueeze(0)?;
        let memories = self.reshape_memory(memories)?;
        // Step i consumes group i-1; the go frame feeds step 0 and the last
        // ground-truth group is never an input.
        let groups = memories.dim(0)?;
        if groups == 0 {
            return Err(Error::Config(
                "teacher forcing needs at least one ground-truth frame".into(),
            ));
        }
        let memories = if groups > 1 {
            Tensor::cat(&[&go, &memories.narrow(0, 0, groups - 1)?], 0)?
        } else {
            go
        };
        let mut memories = self.update_memory(&memories)?;
        if let Some(spk) = speaker_embeddings {
            let (steps, batch, _) = memories.dims3()?;
            let spk = spk
                .unsqueeze(0)?
                .broadcast_as((steps, batch, spk.dim(D::Minus1)?))?
                .contiguous()?;
            memories = Tensor::cat(&[&memories, &spk], D::Minus1)?;
        }
        let memories = self.prenet.forward(&memories, train)?;

        let state = self.zero_state(inputs)?;
        let view = self.memory_view(inputs, mask)?;
        self.attention.init_states(inputs)?;

        let run = self.run_steps(state, &view, StepInput::Teacher(memories), StopRule::Exhaust, train)?;
        tracing::debug!(steps = run.steps.len(), r = self.r, "teacher-forced decoding done");
        self.finish(run.steps)
    }

    /// Free-running inference from the go frame.
    ///
    /// Stops once `sigmoid(stop) > stop_threshold` and the step index exceeds
    /// half the encoder length, or at `max_decoder_steps`.
    pub fn inference(
        &mut self,
        inputs: &Tensor,
        speaker_embeddings: Option<&Tensor>,
    ) -> Result<DecoderOutput> {
        let memory = self.update_memory(&self.go_frame(inputs)?)?;
        let state = self.zero_state(inputs)?;
        let view = self.memory_view(inputs, None)?;
        self.attention.init_states(inputs)?;

        let input_len = inputs.dim(1)?;
        let run = self.run_steps(
            state,
            &view,
            StepInput::Feedback {
                memory,
                speaker_embeddings,
                keep_last_frame: true,
            },
            StopRule::Gate {
                threshold: self.cfg.stop_threshold,
                min_step: Some(input_len as f64 / 2.0),
                max_steps: self.cfg.max_decoder_steps,
            },
            false,
        )?;
        tracing::debug!(steps = run.steps.len(), input_len, "inference done");
        self.finish(run.steps)
    }

    /// Streaming inference: recurrent state and the fed-back frame survive
    /// between calls, so consecutive chunks of text continue one utterance.
    ///
    /// Whole output groups are fed back, which requires `r == 1`; speaker
    /// conditioning is not supported.
    pub fn inference_truncated(&mut self, inputs: &Tensor) -> Result<DecoderOutput> {
        if self.cfg.speaker_embedding_dim > 0 {
            return Err(Error::Config(
                "truncated inference has no speaker conditioning; speaker_embedding_dim must be 0"
                    .into(),
            ));
        }
        if self.r != 1 {
            return Err(Error::Config(format!(
                "truncated inference feeds whole frame groups back and needs r == 1, got {}",
                self.r
            )));
        }

        // Kept state is only replaced once a chunk decodes successfully.
        let (memory, state) = match self.truncated.clone() {
            Some(kept) => (kept.memory, kept.state),
            None => (self.go_frame(inputs)?, self.zero_state(inputs)?),
        };
        let view = self.memory_view(inputs, None)?;
        self.attention.init_win_idx();
        self.attention.init_states(inputs)?;

        let run = self.run_steps(
            state,
            &view,
            StepInput::Feedback {
                memory,
                speaker_embeddings: None,
                keep_last_frame: false,
            },
            StopRule::Gate {
                threshold: self.cfg.stop_threshold,
                min_step: None,
                max_steps: self.cfg.max_decoder_steps,
            },
            false,
        )?;
        let memory = run
            .memory
            .ok_or_else(|| Error::Config("feedback run lost its memory".into()))?;
        self.truncated = Some(TruncatedState {
            memory,
            state: run.state,
        });
        tracing::debug!(steps = run.steps.len(), "truncated inference chunk done");
        self.finish(run.steps)
    }

    /// Run exactly one step, for external step-by-step driving.
    ///
    /// At `t == 0` the state is reset and the go frame is used; afterwards
    /// `memory` must be the previous step's `decoder_output`. The stop token is
    /// returned as a probability.
    pub fn inference_step(
        &mut self,
        inputs: &Tensor,
        t: usize,
        memory: Option<&Tensor>,
    ) -> Result<StepOutput> {
        let memory = if t == 0 {
            let state = self.zero_state(inputs)?;
            let view = self.memory_view(inputs, None)?;
            self.attention.init_states(inputs)?;
            self.stepper = Some(StepperState { state, view });
            self.go_frame(inputs)?
        } else {
            memory
                .cloned()
                .ok_or_else(|| Error::Config(format!("inference_step({t}) needs a memory")))?
        };
        let StepperState { state, view } = self
            .stepper
            .clone()
            .ok_or_else(|| Error::Config("inference_step must start at t = 0".into()))?;

        let input = self.feedback_input(&self.update_memory(&memory)?, None)?;
        let (state, mut step) = self.decode(state, &view, &input, false)?;
        step.stop_token = candle_nn::ops::sigmoid(&step.stop_token.detach())?;
        self.stepper = Some(StepperState { state, view });
        Ok(step)
    }
}

fn dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        Ok(candle_nn::ops::dropout(x, p)?)
    } else {
        Ok(x.clone())
    }
}
