use anyhow::Result;
use clap::Parser;
use codegeex_modeling::{
    Batcher, CausalLM, CodeGeexForCausalLM, CommunicatorId, Shuffle, TokenizedDataset,
};
use std::{
    path::PathBuf,
    sync::{Arc, Barrier},
    time::SystemTime,
};
use tch::{
    nn::{self, OptimizerConfig},
    Device, Kind, Tensor,
};

#[derive(Parser, Debug, Clone)]
struct Args {
    #[arg(long, default_value = "THUDM/codegeex-13b")]
    model: String,

    #[arg(long, default_value = "data")]
    data_path: String,

    #[arg(long, default_value_t = 2048)]
    sequence_length: usize,

    #[arg(long, default_value_t = 2)]
    token_size: usize,

    #[arg(long, default_value_t = 4)]
    micro_batch: usize,

    #[arg(long, default_value_t = 128)]
    total_batch: usize,

    #[arg(long, default_value_t = 0.9)]
    beta1: f64,

    #[arg(long, default_value_t = 0.95)]
    beta2: f64,

    #[arg(long, default_value_t = 0.1)]
    weight_decay: f64,

    #[arg(long, default_value_t = 1e-8)]
    eps: f64,

    #[arg(long, default_value_t = 2e-4)]
    learning_rate: f64,

    #[arg(long, default_value_t = 1000)]
    warmup_steps: u32,

    #[arg(long, default_value_t = 100000)]
    total_steps: u32,

    #[arg(long, default_value_t = 1.0)]
    max_grad_norm: f64,

    #[arg(long)]
    shuffle_seed: Option<u64>,

    #[arg(long)]
    tensor_parallelism: Option<usize>,

    #[arg(long, default_value_t = false)]
    cpu: bool,

    #[arg(long)]
    save_to: Option<PathBuf>,
}

fn model_repo_files(model: &str) -> Result<Vec<PathBuf>> {
    if std::fs::exists(model).unwrap_or_default() {
        return Ok(std::fs::read_dir(model)?
            .map(|entry| Ok(entry?.path()))
            .collect::<Result<Vec<_>, std::io::Error>>()?);
    }
    let repo = hf_hub::api::sync::Api::new()?.model(model.to_owned());
    let mut files = Vec::new();
    for sibling in repo.info()?.siblings {
        let name = sibling.rfilename;
        if name.ends_with(".safetensors") || name == "config.json" {
            files.push(repo.get(&name)?);
        }
    }
    Ok(files)
}

/// Linear warmup into a cosine decay that bottoms out at a tenth of the base rate.
fn learning_rate_at(step: u32, base_lr: f64, warmup_steps: u32, total_steps: u32) -> f64 {
    if step < warmup_steps {
        return base_lr * (step + 1) as f64 / warmup_steps as f64;
    }
    let min_lr = base_lr / 10.0;
    let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
    let progress = ((step - warmup_steps) as f64 / decay_steps as f64).min(1.0);
    min_lr + 0.5 * (base_lr - min_lr) * (1.0 + (std::f64::consts::PI * progress).cos())
}

fn train(
    repo_files: Vec<PathBuf>,
    tensor_parallelism: Option<(Arc<CommunicatorId>, usize, usize, Arc<Barrier>)>,
    args: Args,
) -> Result<()> {
    let rank = tensor_parallelism
        .as_ref()
        .map(|(_, rank, _, _)| *rank)
        .unwrap_or_default();
    if rank == 0 {
        println!(
            "starting training run: model {}, data_path {}, sequence_length {}, micro_batch {}, total_batch {}, learning_rate {:.1e}, warmup_steps {}, total_steps {}, max_grad_norm {}",
            args.model,
            args.data_path,
            args.sequence_length,
            args.micro_batch,
            args.total_batch,
            args.learning_rate,
            args.warmup_steps,
            args.total_steps,
            args.max_grad_norm,
        );
    }

    let shuffle = match args.shuffle_seed {
        Some(seed) => Shuffle::Seeded(seed),
        None => Shuffle::DontShuffle,
    };
    let dataset = TokenizedDataset::new_from_directory(
        &args.data_path,
        args.token_size.try_into()?,
        args.sequence_length,
        shuffle,
    )?;

    let mut model = CodeGeexForCausalLM::from_pretrained(
        &repo_files,
        Some(Kind::BFloat16),
        None,
        args.cpu
            .then_some(Device::Cpu)
            .or_else(|| tensor_parallelism.as_ref().map(|_| Device::Cuda(rank))),
        tensor_parallelism
            .as_ref()
            .map(|(id, rank, size, _)| (id.clone(), *rank, *size)),
        None,
        true,
        false,
    )?;
    let device = model.device();

    // Every rank walks the same batches; the model splits the work over
    // its sharded weights, so the inputs themselves are not partitioned.
    // The label shift happens inside the model, so inputs and targets are
    // the same sequence.
    let iter = dataset.into_iter().map(|tokens| {
        let sequence = Tensor::from_slice(&tokens).to(device);
        Ok((sequence.shallow_clone(), sequence))
    });
    let mut batch_iter = Batcher::new_r2(iter).batch_size(args.micro_batch);

    let adamw = nn::AdamW {
        beta1: args.beta1,
        beta2: args.beta2,
        wd: args.weight_decay,
        eps: args.eps,
        amsgrad: false,
    };
    let mut adamw = adamw.build(&model.variables, args.learning_rate)?;

    if rank == 0 {
        println!("Done loading, starting training.");
    }
    let grad_accum_steps = args.total_batch / args.micro_batch;
    let grad_accum_divisor = grad_accum_steps as f64;
    'training: for step in 0..args.total_steps {
        let start_time = SystemTime::now();
        let lr = learning_rate_at(step, args.learning_rate, args.warmup_steps, args.total_steps);
        adamw.set_lr(lr);

        let mut avg_loss: f32 = 0.0;
        for _ in 0..grad_accum_steps {
            let Some(batch) = batch_iter.next() else {
                if rank == 0 {
                    println!("ran out of training data at step {step}");
                }
                break 'training;
            };
            let (inputs, targets) = batch?;
            if let Some((_, _, _, barrier)) = tensor_parallelism.as_ref() {
                barrier.wait();
            }
            let (_, loss) = model.forward(&inputs, Some(&targets), None);
            let loss = loss.expect("forward with labels must produce a loss") / grad_accum_divisor;
            if let Some((_, _, _, barrier)) = tensor_parallelism.as_ref() {
                barrier.wait();
            }
            loss.backward();
            if let Some((_, _, _, barrier)) = tensor_parallelism.as_ref() {
                barrier.wait();
            }
            let loss_value: f32 = loss.try_into()?;
            avg_loss += loss_value;
        }

        model.reduce_replicated_gradients();
        model.clip_grad_norm(args.max_grad_norm);
        adamw.step();
        adamw.zero_grad();

        let duration = SystemTime::now()
            .duration_since(start_time)
            .unwrap()
            .as_secs_f32();
        let tokens_per_second = (args.total_batch * args.sequence_length) as f32 / duration;
        if rank == 0 {
            println!(
                "step: {}, duration: {:.1}s, lr: {:.1e}, loss: {:.4}, tok/s: {:.0}",
                step, duration, lr, avg_loss, tokens_per_second
            );
        }
    }

    if let Some(save_to) = &args.save_to {
        let saved = model.save_pretrained(save_to)?;
        if !saved.is_empty() {
            println!("saved checkpoint to {}", save_to.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let repo_files = model_repo_files(&args.model)?;

    match args.tensor_parallelism {
        Some(0) | Some(1) | None => train(repo_files, None, args),
        Some(world_size) => {
            let id = Arc::new(CommunicatorId::default());
            let barrier = Arc::new(Barrier::new(world_size));
            let handles: Vec<_> = (0..world_size)
                .map(|rank| {
                    let repo_files = repo_files.clone();
                    let args = args.clone();
                    let parallelism = Some((id.clone(), rank, world_size, barrier.clone()));
                    std::thread::spawn(move || train(repo_files, parallelism, args))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap()?;
            }
            Ok(())
        }
    }
}
