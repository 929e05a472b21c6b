use anyhow::{Error, Result};
use clap::Parser;
use codegeex_modeling::{
    auto_tokenizer, CausalLM, CodeGeexForCausalLM, CommunicatorId, LogitsProcessor, Sampling,
    TokenOutputStream,
};
use std::{
    io::Write,
    path::PathBuf,
    sync::{Arc, Barrier},
};
use tch::{Device, Kind, Tensor};
use tokenizers::Tokenizer;

const DEFAULT_PROMPT: &str =
    "# language: Python\n# write a bubble sort function\ndef bubble_sort(arr):\n";

#[derive(Parser, Debug, Clone)]
struct Args {
    #[arg(long, default_value = "THUDM/codegeex-13b")]
    model: String,

    #[arg(long, default_value_t = 0.2)]
    temperature: f64,

    #[arg(long)]
    top_p: Option<f64>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long, default_value_t = 256)]
    max_tokens: usize,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    tensor_parallelism: Option<usize>,

    #[arg(default_value = DEFAULT_PROMPT)]
    prompt: String,
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
        if name.ends_with(".safetensors") || name == "config.json" || name == "tokenizer.json" {
            files.push(repo.get(&name)?);
        }
    }
    Ok(files)
}

fn inference(
    repo_files: Vec<PathBuf>,
    tensor_parallelism: Option<(Arc<CommunicatorId>, usize, usize, Arc<Barrier>)>,
    args: Args,
    seed: u64,
    mut tokens: Vec<i64>,
    tokenizer: Tokenizer,
) -> Result<()> {
    let rank = tensor_parallelism
        .as_ref()
        .map(|(_, rank, _, _)| *rank)
        .unwrap_or_default();
    let device = match tensor_parallelism.as_ref() {
        Some((_, rank, _, _)) => Device::Cuda(*rank),
        None => Device::cuda_if_available(),
    };
    let kind = match device {
        Device::Cuda(_) => Kind::Half,
        _ => Kind::Float,
    };

    let mut model = CodeGeexForCausalLM::from_pretrained(
        &repo_files,
        Some(kind),
        None,
        Some(device),
        tensor_parallelism
            .as_ref()
            .map(|(id, rank, size, _)| (id.clone(), *rank, *size)),
        None,
        false,
        false,
    )?;
    model.set_use_kv_cache(true);

    let mut logits_processor = {
        let sampling = if args.temperature <= 0. {
            Sampling::ArgMax
        } else {
            match (args.top_k, args.top_p) {
                (None, None) => Sampling::All {
                    temperature: args.temperature,
                },
                (Some(k), None) => Sampling::TopK {
                    k,
                    temperature: args.temperature,
                },
                (None, Some(p)) => Sampling::TopP {
                    p,
                    temperature: args.temperature,
                },
                (Some(k), Some(p)) => Sampling::TopKThenTopP {
                    k,
                    p,
                    temperature: args.temperature,
                },
            }
        };
        LogitsProcessor::from_sampling(seed, sampling)
    };

    let mut token_stream = TokenOutputStream::new(tokenizer);
    let eos_token_id = model
        .config
        .eos_token_id
        .or_else(|| token_stream.get_token("<|endoftext|>"));

    // The prompt goes through in one shot, every step after that feeds a
    // single token back through the kv cache.
    let mut input = Tensor::from_slice(&tokens).to(device).unsqueeze(0);
    let mut tokens_generated = 0;
    while tokens_generated < args.max_tokens {
        if let Some((_, _, _, barrier)) = tensor_parallelism.as_ref() {
            barrier.wait();
        }
        let (logits, _) = model.forward(&input, None, Some(1));
        if let Some((_, _, _, barrier)) = tensor_parallelism.as_ref() {
            barrier.wait();
        }
        let logits = logits.squeeze();
        let next_token = logits_processor.sample(&logits)?;
        tokens_generated += 1;
        tokens.push(next_token as i64);

        if Some(next_token) == eos_token_id {
            break;
        }
        if let Some(text) = token_stream.next_token(next_token)? {
            if rank == 0 {
                print!("{text}");
                std::io::stdout().flush()?;
            }
        }
        input = Tensor::from_slice(&[next_token as i64]).to(device).unsqueeze(0);
    }
    if rank == 0 {
        if let Some(rest) = token_stream.decode_rest()? {
            print!("{rest}");
        }
        println!();
    }
    Ok(())
}

fn main() -> Result<()> {
    let _no_grad = tch::no_grad_guard();
    let args = Args::parse();

    let repo_files = model_repo_files(&args.model)?;
    let tokenizer = auto_tokenizer(&repo_files)?;
    let tokens: Vec<i64> = tokenizer
        .encode(args.prompt.as_str(), true)
        .map_err(Error::msg)?
        .get_ids()
        .iter()
        .map(|token| *token as i64)
        .collect();
    let seed = args.seed.unwrap_or_else(rand::random);

    print!("{}", args.prompt);
    std::io::stdout().flush()?;

    match args.tensor_parallelism {
        Some(0) | Some(1) | None => inference(repo_files, None, args, seed, tokens, tokenizer),
        Some(world_size) => {
            let id = Arc::new(CommunicatorId::default());
            let barrier = Arc::new(Barrier::new(world_size));
            let handles: Vec<_> = (0..world_size)
                .map(|rank| {
                    let repo_files = repo_files.clone();
                    let args = args.clone();
                    let tokens = tokens.clone();
                    let tokenizer = tokenizer.clone();
                    let parallelism = Some((id.clone(), rank, world_size, barrier.clone()));
                    std::thread::spawn(move || {
                        inference(repo_files, parallelism, args, seed, tokens, tokenizer)
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap()?;
            }
            Ok(())
        }
    }
}
