use crate::{
    codegeex::{sharded_variables, Cache, CodeGeex, Config},
    safetensor_utils::load_safetensors_into_variables,
    tensor_parallelism::{
        parallel_lm_logits, unsharded_cpu_variables, vocab_parallel_cross_entropy, AllReduce,
        Communicator, ModelParallelRegion, ReduceType, Shard,
    },
    save_tensors_into_safetensors, CausalLM, CommunicatorError, CommunicatorId, ConcreteCausalLM,
    LoadSafetensorsError,
};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tch::{nn::VarStore, Device, Kind, Tensor};
use thiserror::Error;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct CodeGeexConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_layernorm_epsilon")]
    pub layernorm_epsilon: f64,
    #[serde(default = "default_init_method_std")]
    pub init_method_std: f64,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

#[derive(serde::Deserialize)]
pub enum AttentionImplementation {
    #[serde(rename = "eager")]
    Eager,
    #[serde(rename = "sdpa")]
    Sdpa,
    #[serde(rename = "flash_attention_2")]
    FlashAttention2,
}

impl CodeGeexConfig {
    pub fn into_config(self, use_sdpa: bool) -> Config {
        Config {
            vocab_size: self.vocab_size,
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            num_attention_heads: self.num_attention_heads,
            max_position_embeddings: self.max_position_embeddings,
            layernorm_epsilon: self.layernorm_epsilon,
            init_method_std: self.init_method_std,
            bos_token_id: self.bos_token_id,
            eos_token_id: self.eos_token_id,
            use_sdpa,
        }
    }
}

impl From<Config> for CodeGeexConfig {
    fn from(value: Config) -> Self {
        Self {
            vocab_size: value.vocab_size,
            hidden_size: value.hidden_size,
            num_layers: value.num_layers,
            num_attention_heads: value.num_attention_heads,
            max_position_embeddings: value.max_position_embeddings,
            layernorm_epsilon: value.layernorm_epsilon,
            init_method_std: value.init_method_std,
            bos_token_id: value.bos_token_id,
            eos_token_id: value.eos_token_id,
        }
    }
}

fn default_layernorm_epsilon() -> f64 {
    1e-5
}

fn default_init_method_std() -> f64 {
    0.02
}

/// The CodeGeeX language model with its tied-embedding logits head and the
/// machinery around it: variable store, kv cache, tensor-parallel group and
/// the shard map used for checkpoint slicing and gradient handling.
#[derive(Debug)]
pub struct CodeGeexForCausalLM {
    pub model: CodeGeex,
    pub config: Config,
    pub variables: VarStore,
    pub device: Device,
    pub cache: Cache,
    pub comm: Option<Arc<Communicator>>,
    pub shards: HashMap<String, Shard>,
    parallel_output: bool,
    fp16_lm_cross_entropy: bool,
}

#[derive(Debug, Error)]
pub enum LoadCodeGeexForCausalLMError {
    #[error("missing config.json")]
    MissingConfigJSON,

    #[error("failed to read file config.json")]
    FailedToReadConfig(#[from] io::Error),

    #[error("could not parse config.json")]
    FailedToParseConfig(#[from] serde_json::Error),

    #[error(
        "Directly setting attention implementation to FlashAttention-2 is unsupported for now"
    )]
    ModelExplicitlyUsesFA2,

    #[error("Failed to join the tensor parallelism group: {0}")]
    TensorParallelismFailedInit(#[from] CommunicatorError),

    #[error("Variables cannot be stored as {0:?}")]
    UnsupportedKind(Kind),

    #[error("Failed to load safetensors from disk: {0}")]
    LoadSafetensorsError(#[from] LoadSafetensorsError),
}

impl CodeGeexForCausalLM {
    /// Build a freshly initialized model. Weights follow the Megatron pair of
    /// init distributions: `init_method_std` for inputs, scaled down by the
    /// residual depth for output-facing projections.
    pub fn from_config(
        codegeex_config: CodeGeexConfig,
        kind: Option<Kind>,
        attn_implementation: Option<AttentionImplementation>,
        device: Option<Device>,
        tensor_parallelism_world: Option<(Arc<CommunicatorId>, usize, usize)>,
        parallel_output: bool,
        fp16_lm_cross_entropy: bool,
    ) -> Result<Self, LoadCodeGeexForCausalLMError> {
        let config = codegeex_config.into_config(
            match attn_implementation.unwrap_or(AttentionImplementation::Sdpa) {
                AttentionImplementation::Eager => false,
                AttentionImplementation::Sdpa => true,
                AttentionImplementation::FlashAttention2 => {
                    return Err(LoadCodeGeexForCausalLMError::ModelExplicitlyUsesFA2)
                }
            },
        );

        let device = device.unwrap_or(Device::cuda_if_available());
        let comm = match tensor_parallelism_world {
            Some((id, rank, world_size)) => Some(Arc::new(Communicator::new(
                id,
                rank as i64,
                world_size as i64,
                device,
            )?)),
            None => None,
        };
        let (world_size, rank) = comm.as_ref().map(|c| (c.size(), c.rank())).unwrap_or((1, 0));
        let shards = sharded_variables(&config, world_size, rank);

        let mut variables = VarStore::new(device);
        let model = {
            let _no_grad = tch::no_grad_guard();
            CodeGeex::new(variables.root(), &config, comm.clone())
        };
        if let Some(kind) = kind {
            match kind {
                Kind::Float => variables.float(),
                Kind::Double => variables.double(),
                Kind::Half => variables.half(),
                Kind::BFloat16 => variables.bfloat16(),
                _ => return Err(LoadCodeGeexForCausalLMError::UnsupportedKind(kind)),
            }
        }
        let cache = Cache::new(false, &config);
        Ok(Self {
            model,
            config,
            variables,
            device,
            cache,
            comm,
            shards,
            parallel_output,
            fp16_lm_cross_entropy,
        })
    }

    pub fn from_pretrained(
        repo_files: &[PathBuf],
        kind: Option<Kind>,
        attn_implementation: Option<AttentionImplementation>,
        device: Option<Device>,
        tensor_parallelism_world: Option<(Arc<CommunicatorId>, usize, usize)>,
        override_max_position_embeddings: Option<usize>,
        parallel_output: bool,
        fp16_lm_cross_entropy: bool,
    ) -> Result<Self, LoadCodeGeexForCausalLMError> {
        let config_file = std::fs::read_to_string(
            repo_files
                .iter()
                .find(|x| x.ends_with("config.json"))
                .ok_or(LoadCodeGeexForCausalLMError::MissingConfigJSON)?
                .as_path(),
        )?;
        let mut codegeex_config: CodeGeexConfig = serde_json::from_str(&config_file)?;
        if let Some(max_position_embeddings) = override_max_position_embeddings {
            codegeex_config.max_position_embeddings = max_position_embeddings;
        }

        let mut model = Self::from_config(
            codegeex_config,
            kind,
            attn_implementation,
            device,
            tensor_parallelism_world,
            parallel_output,
            fp16_lm_cross_entropy,
        )?;
        load_safetensors_into_variables(&mut model.variables, &model.shards, repo_files)?;
        tracing::info!(files = repo_files.len(), "loaded pretrained weights");
        Ok(model)
    }

    /// Like `CausalLM::forward`, with a per-call override of the logits mode.
    /// `None` falls back to the mode the model was constructed with.
    ///
    /// The loss, when requested, is always computed from this rank's
    /// vocabulary shard of the logits, independent of the override.
    pub fn forward_with_parallel_output(
        &mut self,
        x: &Tensor,
        labels: Option<&Tensor>,
        num_logits_to_keep: Option<i64>,
        parallel_output: Option<bool>,
    ) -> (Tensor, Option<Tensor>) {
        let parallel_output = parallel_output.unwrap_or(self.parallel_output);
        let (_, t) = x.size2().unwrap();
        let mut hidden = self.model.forward(x, None, &mut self.cache);
        if let Some(num_logits_to_keep) = num_logits_to_keep {
            // Only project the positions whose logits are actually consumed
            hidden = hidden.slice(1, t - num_logits_to_keep, t, 1);
        }
        let mut logits =
            parallel_lm_logits(&hidden, self.model.word_embeddings_weight(), true, &self.comm);
        let loss = match labels {
            Some(labels) => {
                if self.fp16_lm_cross_entropy {
                    debug_assert_eq!(logits.kind(), Kind::Half);
                } else {
                    logits = logits.to_kind(Kind::Float);
                }
                // Shift so that tokens < n predict n
                let shift_logits = logits.slice(1, 0, -1, 1).contiguous();
                let shift_labels = labels.slice(1, 1, None, 1).contiguous();
                let local_vocab = *shift_logits.size().last().unwrap();
                let shift_logits = shift_logits.view([-1i64, local_vocab]);
                let shift_targets = shift_labels.view(-1).to_kind(Kind::Int64);
                Some(vocab_parallel_cross_entropy(
                    &shift_logits,
                    &shift_targets,
                    -100,
                    &self.comm,
                ))
            }
            None => None,
        };
        let logits = if parallel_output {
            logits
        } else {
            logits.gather_from_model_parallel_region(&self.comm)
        };
        (logits, loss)
    }

    /// Toggle incremental decoding. Turning it off also drops cached state.
    pub fn set_use_kv_cache(&mut self, use_kv_cache: bool) {
        self.cache.set_use_kv_cache(use_kv_cache);
    }

    pub fn clear_kv_cache(&mut self) {
        self.cache.clear();
    }

    /// Sum gradients of replicated variables across the group after backward.
    /// Sharded variables already hold exact local gradients and are skipped.
    /// A no-op without tensor parallelism.
    pub fn reduce_replicated_gradients(&mut self) {
        if self.comm.is_none() {
            return;
        }
        let _no_grad = tch::no_grad_guard();
        let mut variables = self.variables.variables().into_iter().collect::<Vec<_>>();
        // sorted so every rank issues the reduces in the same order
        variables.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, var) in variables {
            if self.shards.contains_key(&name) {
                continue;
            }
            let mut grad = var.grad();
            if grad.defined() {
                grad.all_reduce_(&self.comm, ReduceType::Sum);
            }
        }
    }

    /// Clip gradients to a global norm computed over the whole group:
    /// sharded gradients contribute from every rank, replicated gradients
    /// are identical everywhere and counted once. Returns the pre-clip norm.
    pub fn clip_grad_norm(&mut self, max_grad_norm: f64) -> f64 {
        let _no_grad = tch::no_grad_guard();
        let rank = self.comm.as_ref().map(|c| c.rank()).unwrap_or(0);
        let mut variables = self.variables.variables().into_iter().collect::<Vec<_>>();
        variables.sort_by(|a, b| a.0.cmp(&b.0));
        let mut total_sq = Tensor::zeros([], (Kind::Float, self.device));
        let mut grads = Vec::new();
        for (name, var) in variables {
            let grad = var.grad();
            if !grad.defined() {
                continue;
            }
            if self.shards.contains_key(&name) || rank == 0 {
                total_sq = total_sq + grad.square().sum(Kind::Float);
            }
            grads.push(grad);
        }
        total_sq.all_reduce_(&self.comm, ReduceType::Sum);
        let total_norm = total_sq.double_value(&[]).sqrt();
        let clip_coef = max_grad_norm / (total_norm + 1e-6);
        if clip_coef < 1.0 {
            for mut grad in grads {
                let clipped = &grad * clip_coef;
                grad.copy_(&clipped);
            }
        }
        total_norm
    }

    /// Full CPU state dict. Under tensor parallelism every rank must call
    /// this; shards are gathered and only rank 0 gets a non-empty map.
    pub fn unsharded_variables(&self) -> anyhow::Result<HashMap<String, Tensor>> {
        unsharded_cpu_variables(&self.variables, self.comm.clone(), &self.shards)
    }

    /// Write `config.json` and the full state dict as safetensors under
    /// `dir`. Ranks other than 0 participate in the gathers and return an
    /// empty list.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> anyhow::Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let tensors = self.unsharded_variables()?;
        if tensors.is_empty() {
            return Ok(vec![]);
        }
        let mut paths = save_tensors_into_safetensors(tensors, dir.to_path_buf())?;
        let config_path = dir.join("config.json");
        std::fs::write(
            &config_path,
            serde_json::to_string_pretty(&CodeGeexConfig::from(self.config.clone()))?,
        )?;
        paths.push(config_path);
        tracing::info!(dir = %dir.display(), "saved checkpoint");
        Ok(paths)
    }
}

impl CausalLM for CodeGeexForCausalLM {
    fn forward(
        &mut self,
        x: &Tensor,
        labels: Option<&Tensor>,
        num_logits_to_keep: Option<i64>,
    ) -> (Tensor, Option<Tensor>) {
        self.forward_with_parallel_output(x, labels, num_logits_to_keep, None)
    }

    fn bos_token_id(&self) -> Option<i64> {
        self.config.bos_token_id.map(|x| x as i64)
    }

    fn device(&self) -> Device {
        self.device
    }
}

impl ConcreteCausalLM for CodeGeexForCausalLM {
    fn variables(&self) -> &VarStore {
        &self.variables
    }

    fn communicator(&self) -> Option<Arc<Communicator>> {
        self.comm.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> CodeGeexConfig {
        CodeGeexConfig {
            vocab_size: 32,
            hidden_size: 16,
            num_layers: 2,
            num_attention_heads: 4,
            max_position_embeddings: 24,
            layernorm_epsilon: 1e-5,
            init_method_std: 0.02,
            bos_token_id: Some(1),
            eos_token_id: Some(2),
        }
    }

    fn build(parallel_output: bool) -> CodeGeexForCausalLM {
        CodeGeexForCausalLM::from_config(
            tiny_config(),
            None,
            Some(AttentionImplementation::Eager),
            Some(Device::Cpu),
            None,
            parallel_output,
            false,
        )
        .unwrap()
    }

    #[test]
    fn forward_returns_logits_and_loss() {
        let mut model = build(false);
        let tokens = Tensor::from_slice(&[5i64, 9, 1, 3, 7, 2, 8, 4]).reshape([1, 8]);
        let (logits, loss) = model.forward(&tokens, Some(&tokens), None);
        assert_eq!(logits.size(), vec![1, 8, 32]);

        let reference = logits
            .slice(1, 0, -1, 1)
            .contiguous()
            .view([-1i64, 32])
            .cross_entropy_loss::<Tensor>(
                &tokens.slice(1, 1, None, 1).contiguous().view(-1),
                None,
                tch::Reduction::Mean,
                -100,
                0.0,
            );
        assert!(loss.unwrap().allclose(&reference, 1e-5, 1e-6, false));
    }

    #[test]
    fn num_logits_to_keep_truncates_projection() {
        let mut model = build(false);
        let tokens = Tensor::from_slice(&[5i64, 9, 1, 3]).reshape([1, 4]);
        let (all_logits, _) = model.forward(&tokens, None, None);
        let (last, _) = model.forward(&tokens, None, Some(1));
        assert_eq!(last.size(), vec![1, 1, 32]);
        assert!(last.allclose(&all_logits.slice(1, 3, 4, 1), 1e-5, 1e-6, false));
    }

    #[test]
    fn kv_cache_decode_matches_full_context() {
        let mut model = build(false);
        let tokens = Tensor::from_slice(&[3i64, 1, 4, 1, 5, 9]).reshape([1, 6]);
        let (full, _) = model.forward(&tokens, None, Some(1));

        model.set_use_kv_cache(true);
        let _ = model.forward(&tokens.narrow(1, 0, 5), None, Some(1));
        assert_eq!(model.cache.current_seq_len(), 5);
        let (step, _) = model.forward(&tokens.narrow(1, 5, 1), None, Some(1));
        assert!(step.allclose(&full, 1e-4, 1e-5, false));

        model.set_use_kv_cache(false);
        assert_eq!(model.cache.current_seq_len(), 0);
    }

    #[test]
    fn parallel_output_override_is_gather_at_single_rank() {
        let mut model = build(true);
        let tokens = Tensor::from_slice(&[5i64, 9, 1, 3]).reshape([1, 4]);
        let (default_logits, _) = model.forward_with_parallel_output(&tokens, None, None, None);
        let (gathered, _) = model.forward_with_parallel_output(&tokens, None, None, Some(false));
        assert_eq!(default_logits.size(), gathered.size());
        assert!(default_logits.allclose(&gathered, 1e-5, 1e-6, false));
    }

    #[test]
    fn config_defaults_apply_to_sparse_json() {
        let sparse: CodeGeexConfig = serde_json::from_str(
            r#"{"vocab_size":8,"hidden_size":4,"num_layers":1,"num_attention_heads":2,"max_position_embeddings":8}"#,
        )
        .unwrap();
        assert_eq!(sparse.layernorm_epsilon, 1e-5);
        assert_eq!(sparse.init_method_std, 0.02);
        assert_eq!(sparse.eos_token_id, None);
    }

    #[test]
    fn from_config_casts_variables() {
        let model = CodeGeexForCausalLM::from_config(
            tiny_config(),
            Some(Kind::Half),
            Some(AttentionImplementation::Eager),
            Some(Device::Cpu),
            None,
            true,
            false,
        )
        .unwrap();
        for (_, var) in model.variables.variables() {
            assert_eq!(var.kind(), Kind::Half);
        }

        assert!(matches!(
            CodeGeexForCausalLM::from_config(
                tiny_config(),
                Some(Kind::Int64),
                Some(AttentionImplementation::Eager),
                Some(Device::Cpu),
                None,
                true,
                false,
            ),
            Err(LoadCodeGeexForCausalLMError::UnsupportedKind(Kind::Int64))
        ));
    }
}
