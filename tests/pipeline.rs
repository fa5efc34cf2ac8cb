//! End-to-end checks through the public API: config → model → mel file.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tacotron2_rs::config::Tacotron2Config;
use tacotron2_rs::model::Tacotron2;

const CONFIG: &str = r#"{
    "num_chars": 30,
    "r": 2,
    "max_r": 2,
    "frame_dim": 8,
    "postnet_output_dim": 8,
    "encoder_dim": 16,
    "decoder": {
        "query_dim": 16,
        "decoder_rnn_dim": 16,
        "prenet_dim": 8,
        "attention_dim": 8,
        "max_decoder_steps": 12,
        "attention": { "kind": "forward", "trans_agent": true, "forward_attn_mask": true }
    }
}"#;

fn model() -> (VarMap, Tacotron2) {
    let cfg = Tacotron2Config::from_json_str(CONFIG).unwrap();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = Tacotron2::new(&cfg, vb).unwrap();
    (varmap, model)
}

#[test]
fn partial_json_keeps_defaults() {
    let cfg = Tacotron2Config::from_json_str(CONFIG).unwrap();
    assert_eq!(cfg.decoder.stop_threshold, 0.7);
    assert_eq!(cfg.decoder.attention.location_n_filters, 32);
    assert_eq!(cfg.encoder_kernel_size, 5);
}

#[test]
fn train_then_infer_then_write_npy() {
    let (_varmap, mut model) = model();
    let device = Device::Cpu;

    let text = Tensor::new(&[[3u32, 7, 1, 9, 4, 0], [5, 2, 8, 0, 0, 0]], &device).unwrap();
    let mels = Tensor::randn(0f32, 1.0, (2, 10, 8), &device).unwrap();
    let out = model.forward(&text, &[6, 3], &mels, None, true).unwrap();
    assert_eq!(out.postnet_outputs.dims(), &[2, 10, 8]);
    assert_eq!(out.alignments.dims(), &[2, 5, 6]);

    let out = model
        .inference(&Tensor::new(&[[3u32, 7, 1, 9]], &device).unwrap(), None)
        .unwrap();
    let steps = out.stop_tokens.dim(1).unwrap();
    assert!((1..=12).contains(&steps));

    let mel = out.postnet_outputs.squeeze(0).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mel.npy");
    mel.write_npy(&path).unwrap();
    let loaded = Tensor::read_npy(&path).unwrap();
    assert_eq!(loaded.dims(), &[steps * 2, 8]);
}

#[test]
fn changing_r_between_runs() {
    let (_varmap, mut model) = model();
    let device = Device::Cpu;
    let text = Tensor::new(&[[1u32, 2, 3, 4, 5]], &device).unwrap();
    let mels = Tensor::randn(0f32, 1.0, (1, 6, 8), &device).unwrap();

    let out = model.forward(&text, &[5], &mels, None, false).unwrap();
    assert_eq!(out.stop_tokens.dim(1).unwrap(), 3);

    model.set_r(1).unwrap();
    let out = model.forward(&text, &[5], &mels, None, false).unwrap();
    assert_eq!(out.stop_tokens.dim(1).unwrap(), 6);
    assert_eq!(out.decoder_outputs.dims(), &[1, 6, 8]);
}
