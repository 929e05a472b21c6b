use std::sync::Arc;

use tch::{nn::VarStore, Device, Tensor};

use crate::Communicator;

/// A causal language model that can run forward passes, so gradients can be
/// computed through it. Implementations may hide arbitrary structure behind
/// this, including wrappers that fan out over multiple devices.
pub trait CausalLM: Send + std::fmt::Debug {
    /// Returns logits and, when `labels` is given, the language modeling
    /// loss. `num_logits_to_keep` restricts the projection to the trailing
    /// positions.
    fn forward(
        &mut self,
        x: &Tensor,
        labels: Option<&Tensor>,
        num_logits_to_keep: Option<i64>,
    ) -> (Tensor, Option<Tensor>);
    fn bos_token_id(&self) -> Option<i64>;
    fn device(&self) -> Device;
}

/// A causal language model backed by actual parameters: it owns a `VarStore`
/// and, when running tensor parallel, a `Communicator` for its group.
pub trait ConcreteCausalLM: CausalLM {
    fn variables(&self) -> &VarStore;
    fn communicator(&self) -> Option<Arc<Communicator>>;
}
