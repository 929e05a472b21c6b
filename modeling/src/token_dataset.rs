use anyhow::{anyhow, bail, Result};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::info;

const DATA_FILE_EXTENSIONS: [&str; 2] = ["ds", "bin"];

/// Width of one token in a flat little-endian token file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSize {
    TwoBytes,
    FourBytes,
}

impl From<TokenSize> for usize {
    fn from(value: TokenSize) -> Self {
        match value {
            TokenSize::TwoBytes => 2,
            TokenSize::FourBytes => 4,
        }
    }
}

impl TryFrom<usize> for TokenSize {
    type Error = anyhow::Error;

    fn try_from(value: usize) -> Result<Self> {
        match value {
            2 => Ok(Self::TwoBytes),
            4 => Ok(Self::FourBytes),
            other => bail!("unsupported token size {other}, expected 2 or 4"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Shuffle {
    DontShuffle,
    Seeded(u64),
}

fn mmap_file(path: &std::path::Path) -> Result<memmap2::Mmap> {
    let file = std::fs::File::open(path)?;
    let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
    Ok(mmap)
}

struct SequencePointer {
    file_index: usize,
    byte_offset: usize,
}

/// Fixed-length training sequences over a directory of flat token files.
/// Every sequence carries one lookahead token beyond `seq_len`, so callers
/// can split it into shifted (input, target) pairs.
pub struct TokenizedDataset {
    data_files: Vec<memmap2::Mmap>,
    sequences: Vec<SequencePointer>,
    seq_len: usize,
    token_size_in_bytes: TokenSize,
}

impl TokenizedDataset {
    pub fn new_from_directory(
        dir: impl AsRef<std::path::Path>,
        token_size_in_bytes: TokenSize,
        num_tokens_per_sequence: usize,
        shuffle: Shuffle,
    ) -> Result<Self> {
        let dir = std::fs::canonicalize(&dir)
            .map_err(|e| anyhow!("Failed to open token directory {:?}: {e}", dir.as_ref()))?;
        let mut token_files: Vec<std::path::PathBuf> = std::fs::read_dir(&dir)
            .map_err(|e| anyhow!("couldn't list token files in {}: {e}", dir.display()))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|extension| DATA_FILE_EXTENSIONS.contains(&extension))
            })
            .collect();
        // directory order is OS dependent, a stable order keeps seeded
        // shuffles reproducible across machines
        token_files.sort();
        let data_files = token_files
            .iter()
            .map(|path| mmap_file(path))
            .collect::<Result<Vec<_>>>()?;

        if data_files.is_empty() {
            bail!("No token files in directory {:?}", dir);
        }

        info!(
            "Loaded {} files ({} bytes) of token data from {}",
            data_files.len(),
            data_files.iter().map(|f| f.len() as u64).sum::<u64>(),
            dir.display()
        );

        let seq_len_in_bytes = num_tokens_per_sequence * usize::from(token_size_in_bytes);
        let mut sequences: Vec<SequencePointer> = data_files
            .iter()
            .enumerate()
            .flat_map(|(file_index, tokens)| {
                // one lookahead token has to fit past every sequence
                let usable = tokens
                    .len()
                    .saturating_sub(seq_len_in_bytes + usize::from(token_size_in_bytes));
                (0..usable)
                    .step_by(seq_len_in_bytes)
                    .map(move |byte_offset| SequencePointer {
                        file_index,
                        byte_offset,
                    })
            })
            .collect();
        // shuffle the whole collection, to avoid bias from a specific file
        if let Shuffle::Seeded(seed) = shuffle {
            sequences.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        Ok(Self {
            data_files,
            sequences,
            seq_len: num_tokens_per_sequence,
            token_size_in_bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// The `seq_len + 1` tokens of one sequence.
    pub fn get(&self, index: usize) -> Result<Vec<i32>> {
        let SequencePointer {
            byte_offset,
            file_index,
        } = self.sequences.get(index).ok_or_else(|| {
            anyhow!(
                "index {index} is out of bounds, we only have {} sequences",
                self.sequences.len()
            )
        })?;

        let file = &self.data_files[*file_index];
        let data_len = usize::from(self.token_size_in_bytes) * (self.seq_len + 1);
        let data = &file[*byte_offset..*byte_offset + data_len];

        let tokens: Vec<i32> = data
            .chunks(self.token_size_in_bytes.into())
            .map(|t| match self.token_size_in_bytes {
                TokenSize::TwoBytes => u16::from_le_bytes(t.try_into().unwrap()) as i32,
                TokenSize::FourBytes => u32::from_le_bytes(t.try_into().unwrap()) as i32,
            })
            .collect();
        Ok(tokens)
    }
}

pub struct TokenizedDatasetIter {
    dataset: TokenizedDataset,
    current_index: usize,
}

impl Iterator for TokenizedDatasetIter {
    type Item = Vec<i32>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.dataset.get(self.current_index).ok()?;
        self.current_index += 1;
        Some(result)
    }
}

impl IntoIterator for TokenizedDataset {
    type Item = Vec<i32>;
    type IntoIter = TokenizedDatasetIter;

    fn into_iter(self) -> Self::IntoIter {
        TokenizedDatasetIter {
            dataset: self,
            current_index: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tokens(dir: &std::path::Path, name: &str, tokens: std::ops::Range<u16>) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        for token in tokens {
            file.write_all(&token.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn sequences_carry_one_lookahead_token() {
        let dir = tempfile::tempdir().unwrap();
        write_tokens(dir.path(), "train.ds", 0..100);
        let dataset = TokenizedDataset::new_from_directory(
            dir.path(),
            TokenSize::TwoBytes,
            8,
            Shuffle::DontShuffle,
        )
        .unwrap();
        assert_eq!(dataset.len(), 12);
        assert_eq!(dataset.get(0).unwrap(), (0..9).collect::<Vec<i32>>());
        let second = dataset.get(1).unwrap();
        assert_eq!(second.len(), 9);
        assert_eq!(second[0], 8);
    }

    #[test]
    fn ignores_files_with_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        write_tokens(dir.path(), "train.ds", 0..100);
        std::fs::write(dir.path().join("README.md"), "not tokens").unwrap();
        let dataset = TokenizedDataset::new_from_directory(
            dir.path(),
            TokenSize::TwoBytes,
            8,
            Shuffle::DontShuffle,
        )
        .unwrap();
        assert_eq!(dataset.len(), 12);
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TokenizedDataset::new_from_directory(
            dir.path(),
            TokenSize::TwoBytes,
            8,
            Shuffle::DontShuffle,
        )
        .is_err());
    }

    #[test]
    fn seeded_shuffle_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_tokens(dir.path(), "train.ds", 0..200);
        let a = TokenizedDataset::new_from_directory(
            dir.path(),
            TokenSize::TwoBytes,
            8,
            Shuffle::Seeded(7),
        )
        .unwrap();
        let b = TokenizedDataset::new_from_directory(
            dir.path(),
            TokenSize::TwoBytes,
            8,
            Shuffle::Seeded(7),
        )
        .unwrap();
        assert_eq!(
            a.into_iter().collect::<Vec<_>>(),
            b.into_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn four_byte_tokens_decode_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("big.bin")).unwrap();
        for token in 0u32..40 {
            file.write_all(&(token * 1000).to_le_bytes()).unwrap();
        }
        drop(file);
        let dataset = TokenizedDataset::new_from_directory(
            dir.path(),
            TokenSize::FourBytes,
            4,
            Shuffle::DontShuffle,
        )
        .unwrap();
        assert_eq!(
            dataset.get(0).unwrap(),
            vec![0, 1000, 2000, 3000, 4000]
        );
    }
}
