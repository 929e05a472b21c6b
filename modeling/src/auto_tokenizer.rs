use std::path::PathBuf;
use thiserror::Error;
use tokenizers::Tokenizer;

#[derive(Error, Debug)]
pub enum AutoTokenizerError {
    #[error("Failed to parse tokenizer.json")]
    CouldntLoadTokenizer(#[from] tokenizers::Error),

    #[error("No tokenizer.json among the model files")]
    FileNotFound,
}

/// Load the tokenizer shipped next to the model weights.
pub fn auto_tokenizer(repo_files: &[PathBuf]) -> Result<Tokenizer, AutoTokenizerError> {
    let path = repo_files
        .iter()
        .find(|x| x.ends_with("tokenizer.json"))
        .ok_or(AutoTokenizerError::FileNotFound)?;
    Ok(Tokenizer::from_file(path.as_path())?)
}
