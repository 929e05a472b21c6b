use std::path::{Path, PathBuf};

use codegeex_modeling::{
    AttentionImplementation, CausalLM, CodeGeexConfig, CodeGeexForCausalLM,
    LoadCodeGeexForCausalLMError, LoadSafetensorsError,
};
use pretty_assertions::assert_eq;
use tch::{Device, Tensor};

fn tiny_config() -> CodeGeexConfig {
    CodeGeexConfig {
        vocab_size: 32,
        hidden_size: 16,
        num_layers: 2,
        num_attention_heads: 4,
        max_position_embeddings: 24,
        layernorm_epsilon: 1e-5,
        init_method_std: 0.02,
        bos_token_id: Some(0),
        eos_token_id: Some(1),
    }
}

fn build(config: CodeGeexConfig) -> CodeGeexForCausalLM {
    CodeGeexForCausalLM::from_config(
        config,
        None,
        Some(AttentionImplementation::Eager),
        Some(Device::Cpu),
        None,
        false,
        false,
    )
    .expect("tiny model builds")
}

fn reload(dir: &Path) -> CodeGeexForCausalLM {
    CodeGeexForCausalLM::from_pretrained(
        &repo_files(dir),
        None,
        Some(AttentionImplementation::Eager),
        Some(Device::Cpu),
        None,
        None,
        false,
        false,
    )
    .expect("checkpoint loads")
}

fn repo_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect()
}

fn token_batch() -> Tensor {
    Tensor::from_slice(&[5i64, 9, 2, 14, 7, 3, 21, 0]).view([2, 4])
}

#[test]
fn saved_checkpoints_reload_identically() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = build(tiny_config());
    let input = token_batch();
    let (logits, _) = model.forward(&input, None, None);

    let written = model.save_pretrained(dir.path()).unwrap();
    assert!(written.iter().any(|path| path.ends_with("config.json")));
    assert!(written
        .iter()
        .any(|path| path.extension().is_some_and(|ext| ext == "safetensors")));

    let saved_config: CodeGeexConfig = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(saved_config.vocab_size, 32);
    assert_eq!(saved_config.eos_token_id, Some(1));

    let mut reloaded = reload(dir.path());
    let (reloaded_logits, _) = reloaded.forward(&input, None, None);
    assert!(logits.allclose(&reloaded_logits, 1e-5, 1e-7, false));
}

#[test]
fn checkpoints_without_the_language_model_prefix_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = build(tiny_config());
    let input = token_batch();
    let (logits, _) = model.forward(&input, None, None);

    // Megatron checkpoints sometimes drop the outer module name.
    let tensors: Vec<(String, Tensor)> = model
        .unsharded_variables()
        .unwrap()
        .into_iter()
        .map(|(name, tensor)| {
            let name = name.strip_prefix("language_model.").unwrap().to_owned();
            (name, tensor)
        })
        .collect();
    Tensor::write_safetensors(&tensors, dir.path().join("model.safetensors")).unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&tiny_config()).unwrap(),
    )
    .unwrap();

    let mut reloaded = reload(dir.path());
    let (reloaded_logits, _) = reloaded.forward(&input, None, None);
    assert!(logits.allclose(&reloaded_logits, 1e-5, 1e-7, false));
}

#[test]
fn incomplete_checkpoints_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let model = build(tiny_config());

    let mut tensors: Vec<(String, Tensor)> =
        model.unsharded_variables().unwrap().into_iter().collect();
    tensors.retain(|(name, _)| !name.ends_with("final_layernorm.weight"));
    Tensor::write_safetensors(&tensors, dir.path().join("model.safetensors")).unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&tiny_config()).unwrap(),
    )
    .unwrap();

    let err = CodeGeexForCausalLM::from_pretrained(
        &repo_files(dir.path()),
        None,
        Some(AttentionImplementation::Eager),
        Some(Device::Cpu),
        None,
        None,
        false,
        false,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        LoadCodeGeexForCausalLMError::LoadSafetensorsError(LoadSafetensorsError::MissingVariables(
            _
        ))
    ));
}

#[test]
fn context_override_must_fit_the_stored_position_table() {
    let dir = tempfile::tempdir().unwrap();
    let model = build(tiny_config());
    model.save_pretrained(dir.path()).unwrap();

    // The checkpoint holds 24 learned positions, the override asks for 48.
    let err = CodeGeexForCausalLM::from_pretrained(
        &repo_files(dir.path()),
        None,
        Some(AttentionImplementation::Eager),
        Some(Device::Cpu),
        None,
        Some(48),
        false,
        false,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        LoadCodeGeexForCausalLMError::LoadSafetensorsError(_)
    ));
}
