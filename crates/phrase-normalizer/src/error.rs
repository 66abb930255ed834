use std::path::PathBuf;
use thiserror::Error;

pub type NormalizeResult<T> = std::result::Result<T, NormalizeError>;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid phrase pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}
