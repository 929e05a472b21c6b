use crate::Shard;
use safetensors::{slice::TensorIndexer, tensor::TensorView, SafeTensors};
use serde_json::json;
use std::{
    collections::{HashMap, HashSet},
    io,
    ops::Bound,
    path::PathBuf,
};
use tch::{nn::VarStore, Device, Kind, Tensor};
use thiserror::Error;

const MAX_SAFETENSOR_PART_SIZE: usize = 1024 * 1024 * 1024 * 5;

#[derive(Error, Debug)]
pub enum LoadSafetensorsError {
    #[error("Failed to open safetensors file: {0}")]
    OpenFile(#[from] io::Error),

    #[error("Failed to deserialize safetensors: {0}")]
    Deserialize(#[from] safetensors::SafeTensorError),

    #[error("failed to perform tensor operation: {0}")]
    TchError(#[from] tch::TchError),

    #[error("Checkpoint dtype {0} has no torch equivalent")]
    UnsupportedDtype(String),

    #[error("Cannot split tensor {name} of shape {size:?} into {world_size} parts along dimension {dim}")]
    CantShard {
        name: String,
        size: Vec<i64>,
        dim: usize,
        world_size: usize,
    },

    #[error("Failed to slice tensor {0}")]
    FailedToSlice(String),

    #[error("Checkpoint missing the following variables: {0:?}")]
    MissingVariables(HashSet<String>),
}

fn checkpoint_kind(dtype: safetensors::Dtype) -> Result<Kind, LoadSafetensorsError> {
    use safetensors::Dtype;
    Ok(match dtype {
        Dtype::BOOL => Kind::Bool,
        Dtype::U8 => Kind::Uint8,
        Dtype::I8 => Kind::Int8,
        Dtype::I16 => Kind::Int16,
        Dtype::I32 => Kind::Int,
        Dtype::I64 => Kind::Int64,
        Dtype::F16 => Kind::Half,
        Dtype::BF16 => Kind::BFloat16,
        Dtype::F32 => Kind::Float,
        Dtype::F64 => Kind::Double,
        other => return Err(LoadSafetensorsError::UnsupportedDtype(format!("{other:?}"))),
    })
}

fn copy_shard_into_variable(
    view: TensorView,
    name: &str,
    shard: &Shard,
    var: &mut Tensor,
) -> Result<(), LoadSafetensorsError> {
    let Shard {
        dim,
        rank,
        world_size,
    } = *shard;
    let mut size: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
    if size[dim] % (world_size as i64) != 0 {
        return Err(LoadSafetensorsError::CantShard {
            name: name.to_owned(),
            size,
            dim,
            world_size,
        });
    }
    let block_size = size[dim] / (world_size as i64);
    let start = block_size * rank as i64;

    let slices: Vec<TensorIndexer> = (0..view.shape().len())
        .map(|i| match i == dim {
            true => TensorIndexer::Narrow(
                Bound::Included(start as usize),
                Bound::Excluded((start + block_size) as usize),
            ),
            false => TensorIndexer::Narrow(Bound::Unbounded, Bound::Unbounded),
        })
        .collect();
    let data: Vec<u8> = view
        .sliced_data(&slices)
        .map_err(|_| LoadSafetensorsError::FailedToSlice(name.to_owned()))?
        .flatten()
        .cloned()
        .collect();
    size[dim] = block_size;
    let kind = checkpoint_kind(view.dtype())?;
    let source = unsafe { Tensor::from_blob(data.as_ptr(), &size, &[], kind, Device::Cpu) };
    var.f_copy_(&source)?;
    Ok(())
}

/// Copy checkpoint tensors into a var store, slicing out this rank's part of
/// every variable listed in `shards`. Variable names are tried as stored and
/// with the `language_model.` prefix stripped, since raw Megatron checkpoints
/// save the inner state dict without it.
pub fn load_safetensors_into_variables(
    vs: &mut VarStore,
    shards: &HashMap<String, Shard>,
    repo_files: &[PathBuf],
) -> Result<(), LoadSafetensorsError> {
    let _no_grad = tch::no_grad_guard();
    let mut unmatched = vs.variables().keys().cloned().collect::<HashSet<_>>();
    for path in repo_files.iter().filter(|x| {
        x.extension()
            .is_some_and(|y| y.eq_ignore_ascii_case("safetensors"))
    }) {
        let file = std::fs::File::open(path)?;
        let content = unsafe { memmap2::MmapOptions::new().map(&file)? };
        let safetensors = SafeTensors::deserialize(&content)?;
        let mut variables = vs.variables_.lock().unwrap();
        for (name, var) in variables.named_variables.iter_mut() {
            let view = safetensors.tensor(name).or_else(|_| {
                safetensors.tensor(name.strip_prefix("language_model.").unwrap_or(name))
            });
            let Ok(view) = view else {
                continue;
            };
            match shards.get(name) {
                Some(shard) => copy_shard_into_variable(view, name, shard, var)?,
                None => {
                    let size: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
                    let kind = checkpoint_kind(view.dtype())?;
                    let source = unsafe {
                        Tensor::from_blob(view.data().as_ptr(), &size, &[], kind, Device::Cpu)
                    };
                    var.f_copy_(&source)?;
                }
            }
            unmatched.remove(name);
        }
    }
    if !unmatched.is_empty() {
        return Err(LoadSafetensorsError::MissingVariables(unmatched));
    }
    Ok(())
}

#[derive(Default)]
struct FilePart {
    tensors: Vec<(String, Tensor)>,
    size: usize,
}

#[derive(Error, Debug)]
pub enum SaveSafetensorsError {
    #[error("No tensors to save")]
    NoTensors,

    #[error("Failed to create directory {0}: {1}")]
    CreateDir(PathBuf, io::Error),

    #[error("Tensor {name} is {size} bytes, larger than the {MAX_SAFETENSOR_PART_SIZE} byte part limit")]
    TensorTooBig { name: String, size: usize },

    #[error("Torch error: {0}")]
    TchError(#[from] tch::TchError),

    #[error("Failed to write: {0}")]
    Write(#[from] io::Error),
}

/// Write a state dict to `dir`, splitting into numbered parts with an index
/// file once the total passes the part size limit.
pub fn save_tensors_into_safetensors(
    tensors: HashMap<String, Tensor>,
    dir: PathBuf,
) -> Result<Vec<PathBuf>, SaveSafetensorsError> {
    if tensors.is_empty() {
        return Err(SaveSafetensorsError::NoTensors);
    }
    std::fs::create_dir_all(&dir).map_err(|e| SaveSafetensorsError::CreateDir(dir.clone(), e))?;

    let mut sorted = tensors.into_iter().collect::<Vec<_>>();
    // stable name order keeps the part layout reproducible
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut parts = vec![FilePart::default()];
    for (name, tensor) in sorted {
        let bytes = tensor.numel() * tensor.kind().elt_size_in_bytes();
        if bytes > MAX_SAFETENSOR_PART_SIZE {
            return Err(SaveSafetensorsError::TensorTooBig { name, size: bytes });
        }
        if parts.last().unwrap().size + bytes > MAX_SAFETENSOR_PART_SIZE {
            parts.push(FilePart::default());
        }
        let part = parts.last_mut().unwrap();
        part.tensors.push((name, tensor));
        part.size += bytes;
    }

    if parts.len() == 1 {
        let path = dir.join("model.safetensors");
        Tensor::write_safetensors(&parts[0].tensors, path.clone())?;
        return Ok(vec![path]);
    }

    let len = parts.len();
    let filenames: Vec<String> = (1..=len)
        .map(|index| format!("model-{index:05}-of-{len:05}.safetensors"))
        .collect();
    let mut weight_map = serde_json::Map::new();
    for (part, filename) in parts.iter().zip(&filenames) {
        for (name, _) in &part.tensors {
            weight_map.insert(name.clone(), filename.clone().into());
        }
    }
    let index = json!({
        "metadata": {
            "total_size": parts.iter().fold(0, |acc, part| acc + part.size),
        },
        "weight_map": weight_map,
    });

    let mut paths: Vec<PathBuf> = parts
        .into_iter()
        .zip(filenames)
        .map(|(part, filename)| {
            let path = dir.join(filename);
            std::thread::spawn(move || {
                Tensor::write_safetensors(&part.tensors, path.clone()).and(Ok(path))
            })
        })
        .map(|handle| handle.join().unwrap())
        .collect::<Result<_, _>>()?;
    let index_path = dir.join("model.safetensors.index.json");
    std::fs::write(&index_path, index.to_string())?;
    paths.push(index_path);
    Ok(paths)
}
