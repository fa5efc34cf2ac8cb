//! Tacotron2 CLI: phoneme ids to mel spectrogram.
//!
//! Loads a JSON model config and safetensors weights, decodes the given
//! phoneme ids and writes the predicted mel spectrogram (`[frames, mel_bins]`,
//! f32) as a `.npy` file.
//!
//! # Output
//!
//! Also prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/mel.npy","frames":412,"mel_bins":80,"decoder_steps":412}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use tacotron2_rs::config::Tacotron2Config;
use tacotron2_rs::model::Tacotron2;

#[derive(Parser, Debug)]
#[command(
    name = "tacotron2",
    about = "Tacotron2 mel spectrogram prediction",
    long_about = "Predict a mel spectrogram from comma-separated phoneme ids.\n\
                  The spectrogram is written to --output as .npy; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Model config (JSON). Missing keys use the default hyper-parameters.
    #[arg(long)]
    config: Option<String>,

    /// Model weights (.safetensors). Omit to run with random weights.
    #[arg(long, short = 'w')]
    weights: Option<String>,

    /// Comma-separated phoneme ids, e.g. "12,5,33,7".
    #[arg(long, short = 'i')]
    ids: String,

    /// Speaker id for multi-speaker models.
    #[arg(long)]
    speaker: Option<u32>,

    /// Reduction factor override (frames per decoder step).
    #[arg(long, short = 'r')]
    r: Option<usize>,

    /// Override the decoder step ceiling.
    #[arg(long)]
    max_decoder_steps: Option<usize>,

    /// Output path for the mel spectrogram (.npy).
    #[arg(long, short = 'o')]
    output: String,

    /// Run on CPU even when a GPU is available.
    #[arg(long)]
    cpu: bool,
}

fn parse_ids(ids: &str) -> anyhow::Result<Vec<u32>> {
    let ids = ids
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|e| anyhow::anyhow!("invalid phoneme id '{s}': {e}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    if ids.is_empty() {
        anyhow::bail!("no phoneme ids given");
    }
    Ok(ids)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => Tacotron2Config::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load config {path}: {e}"))?,
        None => Tacotron2Config::default(),
    };
    if let Some(steps) = args.max_decoder_steps {
        cfg.decoder.max_decoder_steps = steps;
    }
    cfg.validate()?;

    let ids = parse_ids(&args.ids)?;
    if let Some(&bad) = ids.iter().find(|&&id| id as usize >= cfg.num_chars) {
        anyhow::bail!("phoneme id {bad} out of range (num_chars = {})", cfg.num_chars);
    }

    let output_path = std::path::Path::new(&args.output);
    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    tracing::info!("Using device: {:?}", device);

    // Keeps random weights alive for the lifetime of the model.
    let varmap = VarMap::new();
    let vb = match &args.weights {
        Some(path) => {
            tracing::info!("Loading weights from {path}");
            // SAFETY: the weights file is not modified while mapped.
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? }
        }
        None => {
            tracing::warn!("No --weights given, using randomly initialised weights");
            VarBuilder::from_varmap(&varmap, DType::F32, &device)
        }
    };
    let mut model = Tacotron2::new(&cfg, vb)
        .map_err(|e| anyhow::anyhow!("failed to build model: {e}"))?;
    if let Some(r) = args.r {
        model.set_r(r)?;
    }

    let num_ids = ids.len();
    let text = Tensor::from_vec(ids, (1, num_ids), &device)?;
    let speaker = args
        .speaker
        .map(|id| Tensor::new(&[id], &device))
        .transpose()?;

    tracing::info!("Decoding {num_ids} phonemes (r = {})...", model.decoder().r());
    let out = model
        .inference(&text, speaker.as_ref())
        .map_err(|e| anyhow::anyhow!("inference failed: {e}"))?;

    let mel = out.postnet_outputs.i(0)?;
    let (frames, mel_bins) = mel.dims2()?;
    let steps = out.stop_tokens.dim(1)?;
    mel.to_device(&Device::Cpu)?.write_npy(output_path)?;

    println!(
        r#"{{"path":"{path}","frames":{frames},"mel_bins":{mel_bins},"decoder_steps":{steps}}}"#,
        path = args.output,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ids_accepts_spaces_and_trailing_comma() {
        assert_eq!(parse_ids("1, 2,3,").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn parse_ids_rejects_garbage() {
        assert!(parse_ids("1,x").is_err());
        assert!(parse_ids(" , ").is_err());
    }
}
