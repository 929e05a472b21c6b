mod auto_tokenizer;
mod batcher;
mod codegeex;
mod codegeex_for_causal_lm;
mod dummy;
mod safetensor_utils;
mod sampling;
mod tensor_parallelism;
mod token_dataset;
mod token_output_stream;
mod traits;

pub use auto_tokenizer::{auto_tokenizer, AutoTokenizerError};
pub use batcher::Batcher;
pub use codegeex::{sharded_variables, Cache, CodeGeex, Config};
pub use codegeex_for_causal_lm::{
    AttentionImplementation, CodeGeexConfig, CodeGeexForCausalLM, LoadCodeGeexForCausalLMError,
};
pub use dummy::DummyModel;
pub use safetensor_utils::{
    load_safetensors_into_variables, save_tensors_into_safetensors, LoadSafetensorsError,
    SaveSafetensorsError,
};
pub use sampling::{LogitsProcessor, Sampling};
pub use tensor_parallelism::{
    parallel_lm_logits, tensor_shard, unshard_tensor, unsharded_cpu_variables,
    unsharded_tensor_size, vocab_parallel_cross_entropy, AllReduce, ColumnParallelLinear,
    Communicator, CommunicatorError, CommunicatorId, CudaSynchronize, ModelParallelRegion,
    ReduceType, RowParallelLinear, Shard, VocabParallelEmbedding,
};
pub use token_dataset::{Shuffle, TokenSize, TokenizedDataset, TokenizedDatasetIter};
pub use token_output_stream::TokenOutputStream;
pub use traits::{CausalLM, ConcreteCausalLM};
