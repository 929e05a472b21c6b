use codegeex_modeling::{AttentionImplementation, CausalLM, CodeGeexConfig, CodeGeexForCausalLM};
use tch::{
    nn::{self, OptimizerConfig},
    Device, Tensor,
};

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

fn build() -> CodeGeexForCausalLM {
    CodeGeexForCausalLM::from_config(
        tiny_config(),
        None,
        Some(AttentionImplementation::Eager),
        Some(Device::Cpu),
        None,
        false,
        false,
    )
    .expect("tiny model builds")
}

fn token_batch() -> Tensor {
    Tensor::from_slice(&[5i64, 9, 2, 14, 7, 3, 21, 0, 11, 30, 4, 16]).view([2, 6])
}

#[test]
fn every_variable_receives_a_gradient() {
    let mut model = build();
    let ids = token_batch();
    let (_, loss) = model.forward(&ids, Some(&ids), None);
    loss.unwrap().backward();
    for (name, variable) in model.variables.variables() {
        assert!(variable.grad().defined(), "no gradient reached {name}");
    }
}

#[test]
fn adamw_steps_drive_the_loss_down() {
    let mut model = build();
    let mut adamw = nn::AdamW {
        beta1: 0.9,
        beta2: 0.95,
        wd: 0.1,
        eps: 1e-8,
        amsgrad: false,
    }
    .build(&model.variables, 1e-2)
    .expect("optimizer builds");

    let ids = token_batch();
    let mut first_loss = None;
    let mut last_loss = f64::MAX;
    for _ in 0..30 {
        let (_, loss) = model.forward(&ids, Some(&ids), None);
        let loss = loss.unwrap();
        loss.backward();
        model.reduce_replicated_gradients();
        model.clip_grad_norm(1.0);
        adamw.step();
        adamw.zero_grad();
        let loss_value = loss.double_value(&[]);
        first_loss.get_or_insert(loss_value);
        last_loss = loss_value;
    }

    let first_loss = first_loss.unwrap();
    assert!(
        last_loss < first_loss * 0.5,
        "memorizing one batch should collapse the loss, went {first_loss:.4} -> {last_loss:.4}"
    );
}
