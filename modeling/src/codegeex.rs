use crate::{ColumnParallelLinear, Communicator, RowParallelLinear, Shard, VocabParallelEmbedding};

use std::{collections::HashMap, sync::Arc};
use tch::nn::{self, Module};
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone)]
pub struct Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    pub layernorm_epsilon: f64,
    pub init_method_std: f64,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub use_sdpa: bool,
}

/// Per-layer key/value state for incremental decoding. Slot `num_layers`
/// belongs to the top query layer.
#[derive(Debug)]
pub struct Cache {
    kvs: Vec<Option<(Tensor, Tensor)>>,
    use_kv_cache: bool,
}

impl Cache {
    pub fn new(use_kv_cache: bool, config: &Config) -> Self {
        Self {
            kvs: (0..config.num_layers + 1).map(|_| None).collect(),
            use_kv_cache,
        }
    }

    pub fn clear(&mut self) {
        for kv in self.kvs.iter_mut() {
            *kv = None;
        }
    }

    pub fn set_use_kv_cache(&mut self, use_kv_cache: bool) {
        self.use_kv_cache = use_kv_cache;
        if !use_kv_cache {
            self.clear();
        }
    }

    pub fn use_kv_cache(&self) -> bool {
        self.use_kv_cache
    }

    /// Number of positions already cached, 0 when the cache is cold.
    pub fn current_seq_len(&self) -> i64 {
        self.kvs
            .first()
            .and_then(|kv| kv.as_ref())
            .map(|(k, _)| k.size()[2])
            .unwrap_or(0)
    }

    fn take(&mut self, layer_idx: usize) -> Option<(Tensor, Tensor)> {
        self.kvs[layer_idx].take()
    }

    fn store(&mut self, layer_idx: usize, kv: (Tensor, Tensor)) {
        if self.use_kv_cache {
            self.kvs[layer_idx] = Some(kv);
        }
    }
}

fn init_normal(std: f64) -> nn::Init {
    nn::Init::Randn {
        mean: 0.,
        stdev: std,
    }
}

/// Output-facing projections are drawn tighter, scaled by the residual depth.
fn scaled_init_normal(std: f64, num_layers: usize) -> nn::Init {
    nn::Init::Randn {
        mean: 0.,
        stdev: std / ((2 * num_layers) as f64).sqrt(),
    }
}

fn layer_norm(vs: nn::Path, size: i64, eps: f64) -> nn::LayerNorm {
    nn::layer_norm(
        vs,
        vec![size],
        nn::LayerNormConfig {
            eps,
            ..Default::default()
        },
    )
}

fn attention_scores(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    head_dim: i64,
    use_sdpa: bool,
    kind: Kind,
    device: Device,
) -> Tensor {
    let t = q.size()[2];
    let t_k = k.size()[2];
    let past_len = t_k - t;
    let scale = 1.0 / (head_dim as f64).sqrt();

    if use_sdpa && (past_len == 0 || t == 1) {
        Tensor::scaled_dot_product_attention::<Tensor>(q, k, v, None, 0.0, t > 1, Some(scale))
    } else {
        // lower triangular mask shifted right by the cached prefix
        let att = q.matmul(&k.transpose(-2, -1)) * scale;
        let mask = Tensor::ones([t, t_k], (kind, device))
            .tril(past_len)
            .reshape([1, 1, t, t_k]);
        let att = att.masked_fill(&mask.eq(0.), f64::NEG_INFINITY);
        att.softmax(-1, kind).matmul(v)
    }
}

#[derive(Debug)]
struct Mlp {
    dense_h_to_4h: ColumnParallelLinear,
    dense_4h_to_h: RowParallelLinear,
}

impl Mlp {
    fn new(vs: nn::Path, config: &Config, comm: Option<Arc<Communicator>>) -> Self {
        let n_embd = config.hidden_size as i64;
        let n_hidden = 4 * n_embd;

        let dense_h_to_4h = ColumnParallelLinear::new(
            &vs / "dense_h_to_4h",
            n_embd,
            n_hidden,
            true,
            false,
            init_normal(config.init_method_std),
            comm.clone(),
        );
        let dense_4h_to_h = RowParallelLinear::new(
            &vs / "dense_4h_to_h",
            n_hidden,
            n_embd,
            true,
            true,
            scaled_init_normal(config.init_method_std, config.num_layers),
            comm,
        );
        Self {
            dense_h_to_4h,
            dense_4h_to_h,
        }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        self.dense_4h_to_h
            .forward(&self.dense_h_to_4h.forward(xs).gelu("tanh"))
    }
}

#[derive(Debug)]
struct CausalSelfAttention {
    query_key_value: ColumnParallelLinear,
    dense: RowParallelLinear,
    n_head: i64,
    head_dim: i64,
    device: Device,
    use_sdpa: bool,
    tp_size: i64,
}

impl CausalSelfAttention {
    fn new(vs: nn::Path, config: &Config, comm: Option<Arc<Communicator>>) -> Self {
        let tp_size = comm.as_ref().map(|x| x.size()).unwrap_or(1);
        let n_head = config.num_attention_heads as i64;
        let n_embd = config.hidden_size as i64;
        assert_eq!(
            n_head % tp_size,
            0,
            "num_attention_heads must be divisible by tp_size"
        );
        let head_dim = n_embd / n_head;

        let query_key_value = ColumnParallelLinear::new(
            &vs / "query_key_value",
            n_embd,
            3 * n_embd,
            true,
            false,
            init_normal(config.init_method_std),
            comm.clone(),
        );
        let dense = RowParallelLinear::new(
            &vs / "dense",
            n_embd,
            n_embd,
            true,
            true,
            scaled_init_normal(config.init_method_std, config.num_layers),
            comm,
        );

        Self {
            query_key_value,
            dense,
            n_head,
            head_dim,
            device: vs.device(),
            use_sdpa: config.use_sdpa,
            tp_size,
        }
    }

    fn forward(&self, x: &Tensor, layer_idx: usize, cache: &mut Cache) -> Tensor {
        let (b, t, _c) = x.size3().unwrap();
        let kind = x.kind();
        let local_n_head = self.n_head / self.tp_size;

        // the fused projection packs [q k v] per head along the last dim
        let mixed = self
            .query_key_value
            .forward(x)
            .reshape([b, t, local_n_head, 3 * self.head_dim]);
        let qkv = mixed.split(self.head_dim, -1);
        let q = qkv[0].transpose(1, 2);
        let k = qkv[1].transpose(1, 2);
        let v = qkv[2].transpose(1, 2);

        let (k, v) = match cache.take(layer_idx) {
            Some((past_k, past_v)) => (
                Tensor::cat(&[&past_k, &k], 2),
                Tensor::cat(&[&past_v, &v], 2),
            ),
            None => (k, v),
        };
        cache.store(layer_idx, (k.shallow_clone(), v.shallow_clone()));

        let y = attention_scores(&q, &k, &v, self.head_dim, self.use_sdpa, kind, self.device);
        let y = y
            .transpose(1, 2)
            .contiguous()
            .reshape([b, t, local_n_head * self.head_dim]);
        self.dense.forward(&y)
    }
}

/// Attention of the top query layer. Queries come from the top query
/// embedding, keys and values from the transformer output.
#[derive(Debug)]
struct TopQueryAttention {
    query: ColumnParallelLinear,
    key_value: ColumnParallelLinear,
    dense: RowParallelLinear,
    n_head: i64,
    head_dim: i64,
    device: Device,
    use_sdpa: bool,
    tp_size: i64,
}

impl TopQueryAttention {
    fn new(vs: nn::Path, config: &Config, comm: Option<Arc<Communicator>>) -> Self {
        let tp_size = comm.as_ref().map(|x| x.size()).unwrap_or(1);
        let n_head = config.num_attention_heads as i64;
        let n_embd = config.hidden_size as i64;
        let head_dim = n_embd / n_head;

        let query = ColumnParallelLinear::new(
            &vs / "query",
            n_embd,
            n_embd,
            true,
            false,
            init_normal(config.init_method_std),
            comm.clone(),
        );
        let key_value = ColumnParallelLinear::new(
            &vs / "key_value",
            n_embd,
            2 * n_embd,
            true,
            false,
            init_normal(config.init_method_std),
            comm.clone(),
        );
        let dense = RowParallelLinear::new(
            &vs / "dense",
            n_embd,
            n_embd,
            true,
            true,
            scaled_init_normal(config.init_method_std, config.num_layers),
            comm,
        );

        Self {
            query,
            key_value,
            dense,
            n_head,
            head_dim,
            device: vs.device(),
            use_sdpa: config.use_sdpa,
            tp_size,
        }
    }

    fn forward(
        &self,
        x: &Tensor,
        query_embed: &Tensor,
        layer_idx: usize,
        cache: &mut Cache,
    ) -> Tensor {
        let (b, t, _c) = x.size3().unwrap();
        let kind = x.kind();
        let local_n_head = self.n_head / self.tp_size;

        let q = self
            .query
            .forward(query_embed)
            .reshape([b, t, local_n_head, self.head_dim])
            .transpose(1, 2);
        let mixed = self
            .key_value
            .forward(x)
            .reshape([b, t, local_n_head, 2 * self.head_dim]);
        let kv = mixed.split(self.head_dim, -1);
        let k = kv[0].transpose(1, 2);
        let v = kv[1].transpose(1, 2);

        let (k, v) = match cache.take(layer_idx) {
            Some((past_k, past_v)) => (
                Tensor::cat(&[&past_k, &k], 2),
                Tensor::cat(&[&past_v, &v], 2),
            ),
            None => (k, v),
        };
        cache.store(layer_idx, (k.shallow_clone(), v.shallow_clone()));

        let y = attention_scores(&q, &k, &v, self.head_dim, self.use_sdpa, kind, self.device);
        let y = y
            .transpose(1, 2)
            .contiguous()
            .reshape([b, t, local_n_head * self.head_dim]);
        self.dense.forward(&y)
    }
}

#[derive(Debug)]
struct Block {
    input_layernorm: nn::LayerNorm,
    attention: CausalSelfAttention,
    post_attention_layernorm: nn::LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(vs: nn::Path, config: &Config, comm: Option<Arc<Communicator>>) -> Self {
        let input_layernorm = layer_norm(
            &vs / "input_layernorm",
            config.hidden_size as i64,
            config.layernorm_epsilon,
        );
        let attention = CausalSelfAttention::new(&vs / "attention", config, comm.clone());
        let post_attention_layernorm = layer_norm(
            &vs / "post_attention_layernorm",
            config.hidden_size as i64,
            config.layernorm_epsilon,
        );
        let mlp = Mlp::new(&vs / "mlp", config, comm);
        Self {
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
        }
    }

    fn forward(&self, x: &Tensor, layer_idx: usize, cache: &mut Cache) -> Tensor {
        let x = self
            .attention
            .forward(&self.input_layernorm.forward(x), layer_idx, cache)
            + x;
        self.mlp.forward(&self.post_attention_layernorm.forward(&x)) + x
    }
}

#[derive(Debug)]
struct TopQueryLayer {
    input_layernorm: nn::LayerNorm,
    attention: TopQueryAttention,
    post_attention_layernorm: nn::LayerNorm,
    mlp: Mlp,
}

impl TopQueryLayer {
    fn new(vs: nn::Path, config: &Config, comm: Option<Arc<Communicator>>) -> Self {
        let input_layernorm = layer_norm(
            &vs / "input_layernorm",
            config.hidden_size as i64,
            config.layernorm_epsilon,
        );
        let attention = TopQueryAttention::new(&vs / "attention", config, comm.clone());
        let post_attention_layernorm = layer_norm(
            &vs / "post_attention_layernorm",
            config.hidden_size as i64,
            config.layernorm_epsilon,
        );
        let mlp = Mlp::new(&vs / "mlp", config, comm);
        Self {
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
        }
    }

    fn forward(
        &self,
        x: &Tensor,
        query_embed: &Tensor,
        layer_idx: usize,
        cache: &mut Cache,
    ) -> Tensor {
        let x = self.attention.forward(
            &self.input_layernorm.forward(x),
            query_embed,
            layer_idx,
            cache,
        ) + x;
        self.mlp.forward(&self.post_attention_layernorm.forward(&x)) + x
    }
}

#[derive(Debug)]
struct Embedding {
    word_embeddings: VocabParallelEmbedding,
    position_embeddings: nn::Embedding,
}

impl Embedding {
    fn new(vs: nn::Path, config: &Config, comm: Option<Arc<Communicator>>) -> Self {
        let word_embeddings = VocabParallelEmbedding::new(
            &vs / "word_embeddings",
            config.vocab_size as i64,
            config.hidden_size as i64,
            init_normal(config.init_method_std),
            comm,
        );
        let position_embeddings = nn::embedding(
            &vs / "position_embeddings",
            config.max_position_embeddings as i64,
            config.hidden_size as i64,
            nn::EmbeddingConfig {
                ws_init: init_normal(config.init_method_std),
                ..Default::default()
            },
        );
        Self {
            word_embeddings,
            position_embeddings,
        }
    }

    fn forward(&self, input_ids: &Tensor, position_ids: &Tensor) -> Tensor {
        self.word_embeddings.forward(input_ids) + self.position_embeddings.forward(position_ids)
    }
}

/// The CodeGeeX language model: learned absolute position embeddings, a stack
/// of causal transformer layers and the extra top query layer that runs after
/// the final layernorm.
#[derive(Debug)]
pub struct CodeGeex {
    embedding: Embedding,
    top_query_embeddings: nn::Embedding,
    blocks: Vec<Block>,
    final_layernorm: nn::LayerNorm,
    top_query_layer: TopQueryLayer,
}

impl CodeGeex {
    pub fn new(vs: nn::Path, config: &Config, comm: Option<Arc<Communicator>>) -> Self {
        let lm = &vs / "language_model";
        let embedding = Embedding::new(&lm / "embedding", config, comm.clone());
        let top_query_embeddings = nn::embedding(
            &lm / "topQueryEmbedding" / "top_query_embeddings",
            config.max_position_embeddings as i64,
            config.hidden_size as i64,
            nn::EmbeddingConfig {
                ws_init: init_normal(config.init_method_std),
                ..Default::default()
            },
        );
        let transformer = &lm / "transformer";
        let blocks = (0..config.num_layers)
            .map(|i| Block::new(&transformer / "layers" / i, config, comm.clone()))
            .collect::<Vec<_>>();
        let final_layernorm = layer_norm(
            &transformer / "final_layernorm",
            config.hidden_size as i64,
            config.layernorm_epsilon,
        );
        let top_query_layer = TopQueryLayer::new(&transformer / "topQueryLayer", config, comm);
        Self {
            embedding,
            top_query_embeddings,
            blocks,
            final_layernorm,
            top_query_layer,
        }
    }

    /// Hidden states for a batch of token ids. When `position_ids` is `None`
    /// positions continue from the cached prefix.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        position_ids: Option<&Tensor>,
        cache: &mut Cache,
    ) -> Tensor {
        let (_b, t) = input_ids.size2().unwrap();
        let index_pos = cache.current_seq_len();
        let position_ids = match position_ids {
            Some(ids) => ids.shallow_clone(),
            None => Tensor::arange_start(
                index_pos,
                index_pos + t,
                (Kind::Int64, input_ids.device()),
            )
            .unsqueeze(0),
        };

        let mut x = self.embedding.forward(input_ids, &position_ids);
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(&x, i, cache);
        }
        let x = self.final_layernorm.forward(&x);

        let query_embed = self.top_query_embeddings.forward(&position_ids);
        self.top_query_layer
            .forward(&x, &query_embed, self.blocks.len(), cache)
    }

    pub fn word_embeddings_weight(&self) -> &Tensor {
        self.embedding.word_embeddings.weight()
    }
}

/// Which variables are sharded across the tensor-parallel group, keyed by
/// their store name. Empty for a single-rank world.
pub fn sharded_variables(config: &Config, world_size: i64, rank: i64) -> HashMap<String, Shard> {
    let mut shards = HashMap::new();
    if world_size <= 1 {
        return shards;
    }
    let col = Shard {
        dim: 0,
        rank: rank as usize,
        world_size: world_size as usize,
    };
    let row = Shard {
        dim: 1,
        rank: rank as usize,
        world_size: world_size as usize,
    };

    shards.insert(
        "language_model.embedding.word_embeddings.weight".to_string(),
        col,
    );
    for i in 0..config.num_layers {
        let layer = format!("language_model.transformer.layers.{i}");
        shards.insert(format!("{layer}.attention.query_key_value.weight"), col);
        shards.insert(format!("{layer}.attention.query_key_value.bias"), col);
        shards.insert(format!("{layer}.attention.dense.weight"), row);
        shards.insert(format!("{layer}.mlp.dense_h_to_4h.weight"), col);
        shards.insert(format!("{layer}.mlp.dense_h_to_4h.bias"), col);
        shards.insert(format!("{layer}.mlp.dense_4h_to_h.weight"), row);
    }
    let top = "language_model.transformer.topQueryLayer";
    shards.insert(format!("{top}.attention.query.weight"), col);
    shards.insert(format!("{top}.attention.query.bias"), col);
    shards.insert(format!("{top}.attention.key_value.weight"), col);
    shards.insert(format!("{top}.attention.key_value.bias"), col);
    shards.insert(format!("{top}.attention.dense.weight"), row);
    shards.insert(format!("{top}.mlp.dense_h_to_4h.weight"), col);
    shards.insert(format!("{top}.mlp.dense_h_to_4h.bias"), col);
    shards.insert(format!("{top}.mlp.dense_4h_to_h.weight"), row);

    shards
}
