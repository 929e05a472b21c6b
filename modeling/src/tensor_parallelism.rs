use anyhow::{anyhow, Result};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
};
use tch::{
    nn::{self, Module, VarStore},
    Device, Kind, Tensor,
};
use thiserror::Error;

/// Rendezvous point shared by every rank of a tensor-parallel group.
///
/// One `CommunicatorId` is created per group and handed to each rank's
/// `Communicator::new`. The first rank to attach fixes the world size.
#[derive(Debug, Default)]
pub struct CommunicatorId {
    state: Mutex<Rendezvous>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct Rendezvous {
    world_size: Option<i64>,
    attached: Vec<i64>,
    round: u64,
    slots: Vec<Option<Tensor>>,
    deposited: i64,
    taken: i64,
}

impl CommunicatorId {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Error)]
pub enum CommunicatorError {
    #[error("world size must be positive, got {0}")]
    InvalidWorldSize(i64),

    #[error("rank {rank} out of range for world size {world_size}")]
    RankOutOfRange { rank: i64, world_size: i64 },

    #[error("communicator id already attached with world size {existing}, got {requested}")]
    WorldSizeMismatch { existing: i64, requested: i64 },

    #[error("rank {0} already attached to this communicator id")]
    DuplicateRank(i64),
}

/// In-process tensor-parallel group member. Each rank runs on its own thread
/// and drives its own device; collectives exchange detached tensor snapshots
/// through the shared `CommunicatorId`.
///
/// Every rank must issue the same sequence of collective calls, the standard
/// SPMD invariant. A rank that skips one deadlocks the group.
#[derive(Debug)]
pub struct Communicator {
    id: Arc<CommunicatorId>,
    rank: i64,
    world_size: i64,
    device: Device,
    round: AtomicU64,
}

impl Communicator {
    pub fn new(
        id: Arc<CommunicatorId>,
        rank: i64,
        world_size: i64,
        device: Device,
    ) -> Result<Self, CommunicatorError> {
        if world_size <= 0 {
            return Err(CommunicatorError::InvalidWorldSize(world_size));
        }
        if rank < 0 || rank >= world_size {
            return Err(CommunicatorError::RankOutOfRange { rank, world_size });
        }
        {
            let mut state = id.state.lock().unwrap();
            match state.world_size {
                None => {
                    state.world_size = Some(world_size);
                    state.slots = (0..world_size).map(|_| None).collect();
                }
                Some(existing) if existing != world_size => {
                    return Err(CommunicatorError::WorldSizeMismatch {
                        existing,
                        requested: world_size,
                    });
                }
                Some(_) => {}
            }
            if state.attached.contains(&rank) {
                return Err(CommunicatorError::DuplicateRank(rank));
            }
            state.attached.push(rank);
        }
        tracing::debug!(rank, world_size, "attached to tensor parallel group");
        Ok(Self {
            id,
            rank,
            world_size,
            device,
            round: AtomicU64::new(0),
        })
    }

    pub fn size(&self) -> i64 {
        self.world_size
    }

    pub fn rank(&self) -> i64 {
        self.rank
    }

    /// All-gather of detached snapshots, one entry per rank, moved onto this
    /// rank's device. Blocks until every rank has deposited its tensor for
    /// the current round.
    fn exchange(&self, tensor: &Tensor) -> Vec<Tensor> {
        let round = self.round.fetch_add(1, Ordering::SeqCst);
        let snapshot = tensor.detach().copy();
        if let Device::Cuda(_) = tensor.device() {
            tensor.device().cuda_synchronize();
        }
        let mut state = self.id.state.lock().unwrap();
        while state.round != round {
            state = self.id.cond.wait(state).unwrap();
        }
        state.slots[self.rank as usize] = Some(snapshot);
        state.deposited += 1;
        self.id.cond.notify_all();
        while state.deposited < self.world_size {
            state = self.id.cond.wait(state).unwrap();
        }
        let parts = state
            .slots
            .iter()
            .map(|slot| slot.as_ref().unwrap().shallow_clone())
            .collect::<Vec<_>>();
        state.taken += 1;
        if state.taken == self.world_size {
            for slot in state.slots.iter_mut() {
                *slot = None;
            }
            state.deposited = 0;
            state.taken = 0;
            state.round += 1;
        }
        self.id.cond.notify_all();
        drop(state);
        parts
            .into_iter()
            .map(|part| part.to_device(self.device))
            .collect()
    }

    pub fn all_gather(&self, tensor: &Tensor) -> Vec<Tensor> {
        self.exchange(tensor)
    }

    /// Reduction over detached snapshots; the result carries no gradient.
    pub fn all_reduce(&self, tensor: &Tensor, op: ReduceType) -> Tensor {
        let parts = self.exchange(tensor);
        match op {
            ReduceType::Sum => parts.into_iter().reduce(|a, b| a + b).unwrap(),
            ReduceType::Max => parts.into_iter().reduce(|a, b| a.maximum(&b)).unwrap(),
        }
    }

    /// Sum across the group keeping this rank's term live in the autograd
    /// graph. Peer terms enter as constants, so backward produces exactly the
    /// local partial that a reduce backward would hand this rank.
    pub fn sum_with_peers(&self, tensor: &Tensor) -> Tensor {
        let parts = self.exchange(tensor);
        let mut output = tensor.shallow_clone();
        for (rank, part) in parts.into_iter().enumerate() {
            if rank as i64 != self.rank {
                output = output + part;
            }
        }
        output
    }

    /// Last-dim concatenation across the group, this rank's slice live, peer
    /// slices constant.
    pub fn concat_with_peers(&self, tensor: &Tensor) -> Tensor {
        let parts = self
            .exchange(tensor)
            .into_iter()
            .enumerate()
            .map(|(rank, part)| {
                if rank as i64 == self.rank {
                    tensor.shallow_clone()
                } else {
                    part
                }
            })
            .collect::<Vec<_>>();
        Tensor::cat(&parts, -1)
    }
}

pub enum ReduceType {
    Sum,
    Max,
}

pub trait AllReduce {
    fn all_reduce_(&mut self, comm: &Option<Arc<Communicator>>, op: ReduceType);
}

pub trait CudaSynchronize {
    fn cuda_synchronize(&self);
}

impl AllReduce for Tensor {
    fn all_reduce_(&mut self, comm: &Option<Arc<Communicator>>, op: ReduceType) {
        if let Some(comm) = comm {
            let reduced = comm.all_reduce(self, op);
            self.copy_(&reduced);
        }
    }
}

impl CudaSynchronize for Device {
    fn cuda_synchronize(&self) {
        match &self {
            Device::Cuda(rank) => tch::Cuda::synchronize(*rank as i64),
            _ => panic!("Cannot CUDA synchronize non-CUDA device"),
        }
    }
}

pub trait ModelParallelRegion {
    fn copy_to_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor;
    fn reduce_from_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor;
    fn scatter_to_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor;
    fn gather_from_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor;
}

impl ModelParallelRegion for Tensor {
    // identity in forward; the peer gradient contributions this drops are
    // restored by summing replicated-parameter gradients after backward
    fn copy_to_model_parallel_region(&self, _comm: &Option<Arc<Communicator>>) -> Tensor {
        self.shallow_clone()
    }

    fn reduce_from_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor {
        match comm {
            Some(comm) => comm.sum_with_peers(self),
            None => self.shallow_clone(),
        }
    }

    fn scatter_to_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor {
        match comm {
            Some(comm) => {
                let last_dim = *self.size().last().unwrap();
                let chunk = last_dim / comm.size();
                self.narrow(-1, comm.rank() * chunk, chunk)
            }
            None => self.shallow_clone(),
        }
    }

    fn gather_from_model_parallel_region(&self, comm: &Option<Arc<Communicator>>) -> Tensor {
        match comm {
            Some(comm) => comm.concat_with_peers(self),
            None => self.shallow_clone(),
        }
    }
}

#[derive(Debug)]
pub struct ColumnParallelLinear {
    ws: Tensor,
    bs: Option<Tensor>,
    comm: Option<Arc<Communicator>>,
    gather_output: bool,
}

#[derive(Debug)]
pub struct RowParallelLinear {
    ws: Tensor,
    bs: Option<Tensor>,
    comm: Option<Arc<Communicator>>,
    input_is_parallel: bool,
}

impl ColumnParallelLinear {
    pub fn new(
        vs: nn::Path,
        in_features: i64,
        out_features: i64,
        bias: bool,
        gather_output: bool,
        ws_init: nn::Init,
        comm: Option<Arc<Communicator>>,
    ) -> Self {
        let world_size = comm.as_ref().map(|c| c.size()).unwrap_or(1);
        assert_eq!(
            out_features % world_size,
            0,
            "out_features must be divisible by world_size"
        );
        let local_out = out_features / world_size;
        let ws = vs.var("weight", &[local_out, in_features], ws_init);
        let bs = bias.then(|| vs.var("bias", &[local_out], nn::Init::Const(0.)));
        Self {
            ws,
            bs,
            comm,
            gather_output,
        }
    }
}

impl Module for ColumnParallelLinear {
    fn forward(&self, input: &Tensor) -> Tensor {
        let input_parallel = input.copy_to_model_parallel_region(&self.comm);
        let output_parallel = input_parallel.linear(&self.ws, self.bs.as_ref());
        if self.gather_output {
            output_parallel.gather_from_model_parallel_region(&self.comm)
        } else {
            output_parallel
        }
    }
}

impl RowParallelLinear {
    pub fn new(
        vs: nn::Path,
        in_features: i64,
        out_features: i64,
        bias: bool,
        input_is_parallel: bool,
        ws_init: nn::Init,
        comm: Option<Arc<Communicator>>,
    ) -> Self {
        let world_size = comm.as_ref().map(|c| c.size()).unwrap_or(1);
        assert_eq!(
            in_features % world_size,
            0,
            "in_features must be divisible by world_size"
        );
        let local_in = in_features / world_size;
        let ws = vs.var("weight", &[out_features, local_in], ws_init);
        // the bias is replicated and applied after the reduce
        let bs = bias.then(|| vs.var("bias", &[out_features], nn::Init::Const(0.)));
        Self {
            ws,
            bs,
            comm,
            input_is_parallel,
        }
    }
}

impl Module for RowParallelLinear {
    fn forward(&self, input: &Tensor) -> Tensor {
        let input_parallel = if self.input_is_parallel {
            input.shallow_clone()
        } else {
            input.scatter_to_model_parallel_region(&self.comm)
        };
        let output_parallel = input_parallel.linear::<Tensor>(&self.ws, None);
        let output = output_parallel.reduce_from_model_parallel_region(&self.comm);
        match &self.bs {
            Some(bs) => output + bs,
            None => output,
        }
    }
}

/// Embedding table partitioned over the vocabulary dimension. Lookups for ids
/// outside this rank's range produce zero rows, restored by the reduce.
#[derive(Debug)]
pub struct VocabParallelEmbedding {
    ws: Tensor,
    vocab_start: i64,
    vocab_end: i64,
    comm: Option<Arc<Communicator>>,
}

impl VocabParallelEmbedding {
    pub fn new(
        vs: nn::Path,
        num_embeddings: i64,
        embedding_dim: i64,
        ws_init: nn::Init,
        comm: Option<Arc<Communicator>>,
    ) -> Self {
        let world_size = comm.as_ref().map(|c| c.size()).unwrap_or(1);
        let rank = comm.as_ref().map(|c| c.rank()).unwrap_or(0);
        assert_eq!(
            num_embeddings % world_size,
            0,
            "num_embeddings must be divisible by world_size"
        );
        let per_partition = num_embeddings / world_size;
        let ws = vs.var("weight", &[per_partition, embedding_dim], ws_init);
        Self {
            ws,
            vocab_start: rank * per_partition,
            vocab_end: (rank + 1) * per_partition,
            comm,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.ws
    }
}

impl Module for VocabParallelEmbedding {
    fn forward(&self, input: &Tensor) -> Tensor {
        match &self.comm {
            Some(_) => {
                let mask = input
                    .lt(self.vocab_start)
                    .logical_or(&input.ge(self.vocab_end));
                let masked_input = (input - self.vocab_start).masked_fill(&mask, 0);
                let output = Tensor::embedding(&self.ws, &masked_input, -1, false, false);
                let output = output.masked_fill(&mask.unsqueeze(-1), 0.);
                output.reduce_from_model_parallel_region(&self.comm)
            }
            None => Tensor::embedding(&self.ws, input, -1, false, false),
        }
    }
}

/// Project hidden states to vocabulary logits through the (vocab-parallel)
/// word embedding weight. With `parallel_output` each rank keeps its own
/// vocabulary shard, otherwise the shards are gathered.
pub fn parallel_lm_logits(
    hidden_states: &Tensor,
    word_embeddings_weight: &Tensor,
    parallel_output: bool,
    comm: &Option<Arc<Communicator>>,
) -> Tensor {
    let input_parallel = hidden_states.copy_to_model_parallel_region(comm);
    let logits_parallel = input_parallel.linear::<Tensor>(word_embeddings_weight, None);
    if parallel_output {
        logits_parallel
    } else {
        logits_parallel.gather_from_model_parallel_region(comm)
    }
}

/// Cross entropy over vocabulary-sharded logits. Each rank holds
/// `[.., vocab/world_size]` logits; targets are full-vocabulary ids. Returns
/// the mean loss over targets not equal to `ignore_index`. Without a
/// communicator this reduces to plain cross entropy.
pub fn vocab_parallel_cross_entropy(
    vocab_parallel_logits: &Tensor,
    target: &Tensor,
    ignore_index: i64,
    comm: &Option<Arc<Communicator>>,
) -> Tensor {
    let rank = comm.as_ref().map(|c| c.rank()).unwrap_or(0);
    let partition_size = *vocab_parallel_logits.size().last().unwrap();
    let vocab_start = rank * partition_size;
    let vocab_end = vocab_start + partition_size;

    // softmax is shift invariant, so the max is a constant wrt autograd
    let mut logits_max = tch::no_grad(|| {
        let (max, _) = vocab_parallel_logits.max_dim(-1, true);
        max
    });
    logits_max.all_reduce_(comm, ReduceType::Max);
    let logits = vocab_parallel_logits - &logits_max;

    let ignored = target.eq(ignore_index);
    let masked = target
        .lt(vocab_start)
        .logical_or(&target.ge(vocab_end))
        .logical_or(&ignored);
    let local_target = (target - vocab_start).masked_fill(&masked, 0);

    let predicted_logits = logits
        .gather(-1, &local_target.unsqueeze(-1), false)
        .squeeze_dim(-1)
        .masked_fill(&masked, 0.);
    let predicted_logits = match comm {
        Some(comm) => comm.sum_with_peers(&predicted_logits),
        None => predicted_logits,
    };

    let sum_exp_logits = logits.exp().sum_dim_intlist(-1, false, Kind::Float);
    let sum_exp_logits = match comm {
        Some(comm) => comm.sum_with_peers(&sum_exp_logits),
        None => sum_exp_logits,
    };

    let token_loss = (sum_exp_logits.log() - predicted_logits).masked_fill(&ignored, 0.);
    let token_count = ignored.logical_not().sum(Kind::Float).clamp_min(1.0);
    token_loss.sum(Kind::Float) / token_count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub dim: usize,
    pub rank: usize,
    pub world_size: usize,
}

pub fn tensor_shard(full_tensor: &Tensor, shard: &Shard) -> Tensor {
    let Shard {
        dim,
        world_size,
        rank,
    } = *shard;

    let full_shape = full_tensor.size();
    let total_size = full_shape[dim];

    let shard_size = total_size / (world_size as i64);
    let start = (rank as i64) * shard_size;
    let end = ((rank + 1) as i64) * shard_size;

    full_tensor.slice(dim as i64, start, Some(end), 1)
}

/// Size of the reassembled tensor given the size of one shard.
pub fn unsharded_tensor_size(sharded_size: &[i64], shard: &Shard) -> Vec<i64> {
    let mut full_shape = sharded_size.to_vec();
    full_shape[shard.dim] *= shard.world_size as i64;
    full_shape
}

pub fn unshard_tensor(sharded_tensors: Vec<Tensor>, shard: &Shard) -> Tensor {
    let Shard { dim, .. } = *shard;

    let shard_size = sharded_tensors[0].size()[dim];
    let full_shape = unsharded_tensor_size(&sharded_tensors[0].size(), shard);

    let full_tensor = Tensor::empty(
        &full_shape,
        (sharded_tensors[0].kind(), sharded_tensors[0].device()),
    );

    for (rank, shard_tensor) in sharded_tensors.into_iter().enumerate() {
        let start = (rank as i64) * shard_size;
        let end = ((rank + 1) as i64) * shard_size;

        let mut slice = full_tensor.slice(dim as i64, start, Some(end), 1);
        slice.copy_(&shard_tensor);
    }

    full_tensor
}

/// Reassemble a full CPU state dict. Every rank participates in the gathers;
/// only rank 0 keeps the result, the other ranks get an empty map.
pub fn unsharded_cpu_variables(
    vs: &VarStore,
    comm: Option<Arc<Communicator>>,
    shards: &HashMap<String, Shard>,
) -> Result<HashMap<String, Tensor>> {
    let _no_grad = tch::no_grad_guard();
    let mut ret = match comm.as_ref().map(|x| x.rank() == 0).unwrap_or(true) {
        true => Some(HashMap::new()),
        false => None,
    };
    let mut variables = vs.variables().into_iter().collect::<Vec<_>>();
    // sorted so every rank issues the gathers in the same order
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, var) in variables {
        let var = match shards.get(&name) {
            Some(shard) => {
                let comm = comm
                    .as_ref()
                    .ok_or_else(|| anyhow!("found sharded tensor {name} but no communicator"))?;
                let parts = comm.all_gather(&var);
                unshard_tensor(parts, shard)
            }
            None => var.shallow_clone(),
        };
        let var = var.to_device(Device::Cpu);
        if let Some(ret) = ret.as_mut() {
            ret.insert(name, var);
        }
    }
    Ok(ret.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_group<F, T>(world_size: i64, f: F) -> Vec<T>
    where
        F: Fn(Arc<Communicator>) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let id = Arc::new(CommunicatorId::new());
        let f = Arc::new(f);
        let threads = (0..world_size)
            .map(|rank| {
                let id = id.clone();
                let f = f.clone();
                std::thread::spawn(move || {
                    let comm =
                        Arc::new(Communicator::new(id, rank, world_size, Device::Cpu).unwrap());
                    f(comm)
                })
            })
            .collect::<Vec<_>>();
        threads.into_iter().map(|t| t.join().unwrap()).collect()
    }

    #[test]
    fn all_reduce_sum_and_max() {
        let results = spawn_group(4, |comm| {
            let rank = comm.rank();
            let mut sum = Tensor::from_slice(&[rank as f32, 1.0]);
            sum.all_reduce_(&Some(comm.clone()), ReduceType::Sum);
            let mut max = Tensor::from_slice(&[rank as f32]);
            max.all_reduce_(&Some(comm), ReduceType::Max);
            (
                sum.iter::<f64>().unwrap().collect::<Vec<_>>(),
                max.double_value(&[0]),
            )
        });
        for (sum, max) in results {
            assert_eq!(sum, vec![6.0, 4.0]);
            assert_eq!(max, 3.0);
        }
    }

    #[test]
    fn gather_concatenates_in_rank_order() {
        let results = spawn_group(3, |comm| {
            let shard = Tensor::from_slice(&[comm.rank() as f32]).unsqueeze(0);
            let gathered = shard.gather_from_model_parallel_region(&Some(comm));
            gathered.squeeze().iter::<f64>().unwrap().collect::<Vec<_>>()
        });
        for gathered in results {
            assert_eq!(gathered, vec![0.0, 1.0, 2.0]);
        }
    }

    #[test]
    fn duplicate_rank_rejected() {
        let id = Arc::new(CommunicatorId::new());
        let _first = Communicator::new(id.clone(), 0, 2, Device::Cpu).unwrap();
        assert!(matches!(
            Communicator::new(id, 0, 2, Device::Cpu),
            Err(CommunicatorError::DuplicateRank(0))
        ));
    }

    fn deterministic(numel: i64, offset: f64) -> Tensor {
        (Tensor::arange(numel, (Kind::Float, Device::Cpu)) * 0.1 + offset).cos()
    }

    #[test]
    fn column_parallel_matches_plain_linear() {
        let (in_f, out_f) = (6, 8);
        let full_ws = deterministic(out_f * in_f, 0.3).reshape([out_f, in_f]);
        let full_bs = deterministic(out_f, 1.7);
        let input = deterministic(2 * in_f, 0.9).reshape([2, in_f]);

        let reference = input.linear(&full_ws, Some(&full_bs));

        // tensors are rebuilt per thread, Tensor is not Sync
        let results = spawn_group(2, move |comm| {
            let ws = deterministic(out_f * in_f, 0.3).reshape([out_f, in_f]);
            let bs = deterministic(out_f, 1.7);
            let inp = deterministic(2 * in_f, 0.9).reshape([2, in_f]);
            let vs = VarStore::new(Device::Cpu);
            let layer = ColumnParallelLinear::new(
                vs.root(),
                in_f,
                out_f,
                true,
                true,
                nn::Init::Const(0.),
                Some(comm.clone()),
            );
            tch::no_grad(|| {
                let local_out = out_f / comm.size();
                let start = comm.rank() * local_out;
                let mut vars = vs.variables();
                vars.get_mut("weight")
                    .unwrap()
                    .copy_(&ws.narrow(0, start, local_out));
                vars.get_mut("bias")
                    .unwrap()
                    .copy_(&bs.narrow(0, start, local_out));
            });
            let output = layer.forward(&inp);
            // the shard's weight gradient must match the same rows of the
            // full layer's weight gradient
            output.sum(Kind::Float).backward();
            let grad = vs.variables().get("weight").unwrap().grad().copy();
            (output.detach().copy(), grad, comm.rank())
        });

        let grad_reference = {
            let ws = full_ws.copy().set_requires_grad(true);
            input
                .linear(&ws, Some(&full_bs))
                .sum(Kind::Float)
                .backward();
            ws.grad().copy()
        };
        for (output, grad, rank) in results {
            assert!(output.allclose(&reference, 1e-5, 1e-6, false));
            let local_out = out_f / 2;
            let expected = grad_reference.narrow(0, rank * local_out, local_out);
            assert!(grad.allclose(&expected, 1e-5, 1e-6, false));
        }
    }

    #[test]
    fn row_parallel_matches_plain_linear() {
        let (in_f, out_f) = (8, 6);
        let full_ws = deterministic(out_f * in_f, 0.5).reshape([out_f, in_f]);
        let full_bs = deterministic(out_f, 0.2);
        let input = deterministic(2 * in_f, 1.1).reshape([2, in_f]);

        let reference = input.linear(&full_ws, Some(&full_bs));

        let results = spawn_group(2, move |comm| {
            let ws = deterministic(out_f * in_f, 0.5).reshape([out_f, in_f]);
            let bs = deterministic(out_f, 0.2);
            let inp = deterministic(2 * in_f, 1.1).reshape([2, in_f]);
            let vs = VarStore::new(Device::Cpu);
            let layer = RowParallelLinear::new(
                vs.root(),
                in_f,
                out_f,
                true,
                false,
                nn::Init::Const(0.),
                Some(comm.clone()),
            );
            tch::no_grad(|| {
                let local_in = in_f / comm.size();
                let start = comm.rank() * local_in;
                let mut vars = vs.variables();
                vars.get_mut("weight")
                    .unwrap()
                    .copy_(&ws.narrow(1, start, local_in));
                vars.get_mut("bias").unwrap().copy_(&bs);
            });
            layer.forward(&inp)
        });
        for output in results {
            assert!(output.allclose(&reference, 1e-5, 1e-6, false));
        }
    }

    #[test]
    fn vocab_parallel_embedding_matches_plain_lookup() {
        let (vocab, dim) = (8, 4);
        let table = deterministic(vocab * dim, 0.7).reshape([vocab, dim]);
        let ids = Tensor::from_slice(&[0i64, 3, 7, 5]).reshape([1, 4]);

        let reference = Tensor::embedding(&table, &ids, -1, false, false);

        let results = spawn_group(2, move |comm| {
            let table = deterministic(vocab * dim, 0.7).reshape([vocab, dim]);
            let ids = Tensor::from_slice(&[0i64, 3, 7, 5]).reshape([1, 4]);
            let vs = VarStore::new(Device::Cpu);
            let embedding = VocabParallelEmbedding::new(
                vs.root(),
                vocab,
                dim,
                nn::Init::Const(0.),
                Some(comm.clone()),
            );
            tch::no_grad(|| {
                let rows = vocab / comm.size();
                let mut vars = vs.variables();
                vars.get_mut("weight")
                    .unwrap()
                    .copy_(&table.narrow(0, comm.rank() * rows, rows));
            });
            embedding.forward(&ids)
        });
        for output in results {
            assert!(output.allclose(&reference, 1e-5, 1e-6, false));
        }
    }

    #[test]
    fn single_rank_cross_entropy_matches_tch() {
        let logits = deterministic(4 * 10, 0.4).reshape([4, 10]);
        let target = Tensor::from_slice(&[1i64, -100, 9, 4]);

        let reference =
            logits.cross_entropy_loss::<Tensor>(&target, None, tch::Reduction::Mean, -100, 0.0);
        let loss = vocab_parallel_cross_entropy(&logits, &target, -100, &None);
        assert!(loss.allclose(&reference, 1e-5, 1e-6, false));
    }

    #[test]
    fn sharded_cross_entropy_matches_full_vocab() {
        let logits = deterministic(4 * 8, 0.8).reshape([4, 8]);
        let target = Tensor::from_slice(&[0i64, 7, -100, 3]);
        let reference =
            logits.cross_entropy_loss::<Tensor>(&target, None, tch::Reduction::Mean, -100, 0.0);

        let results = spawn_group(2, move |comm| {
            let logits = deterministic(4 * 8, 0.8).reshape([4, 8]);
            let target = Tensor::from_slice(&[0i64, 7, -100, 3]);
            let shard = logits.narrow(-1, comm.rank() * 4, 4);
            vocab_parallel_cross_entropy(&shard, &target, -100, &Some(comm))
        });
        for loss in results {
            assert!(loss.allclose(&reference, 1e-5, 1e-6, false));
        }
    }
}
