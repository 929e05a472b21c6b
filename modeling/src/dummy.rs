use tch::{nn::VarStore, Device, Kind, Tensor};

use crate::{CausalLM, ConcreteCausalLM};

/// A weightless `CausalLM` for code that only needs the trait surface:
/// zero logits of the right shape and a constant loss of 1 that gradients
/// can flow through.
#[derive(Debug)]
pub struct DummyModel {
    var_store: VarStore,
    vocab_size: i64,
}

impl Default for DummyModel {
    fn default() -> Self {
        Self::new(1)
    }
}

impl DummyModel {
    pub fn new(vocab_size: i64) -> Self {
        Self {
            var_store: VarStore::new(Device::Cpu),
            vocab_size,
        }
    }
}

impl CausalLM for DummyModel {
    fn forward(
        &mut self,
        x: &Tensor,
        labels: Option<&Tensor>,
        num_logits_to_keep: Option<i64>,
    ) -> (Tensor, Option<Tensor>) {
        let (b, t) = x.size2().unwrap();
        let t = num_logits_to_keep.unwrap_or(t);
        let logits = Tensor::zeros([b, t, self.vocab_size], (Kind::Float, x.device()));
        let loss = labels.map(|_| {
            let loss = Tensor::zeros([], (Kind::Float, x.device()));
            loss.set_requires_grad(true).g_add_scalar(1.0)
        });
        (logits, loss)
    }

    fn bos_token_id(&self) -> Option<i64> {
        None
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

impl ConcreteCausalLM for DummyModel {
    fn variables(&self) -> &VarStore {
        &self.var_store
    }

    fn communicator(&self) -> Option<std::sync::Arc<crate::Communicator>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_through_the_trait_object() {
        let mut model: Box<dyn CausalLM> = Box::new(DummyModel::new(16));
        let tokens = Tensor::from_slice(&[1i64, 2, 3]).reshape([1, 3]);
        let (logits, loss) = model.forward(&tokens, Some(&tokens), Some(1));
        assert_eq!(logits.size(), vec![1, 1, 16]);
        let loss = loss.unwrap();
        assert!(loss.requires_grad());
        loss.backward();
    }
}
