use std::path::PathBuf;
use thiserror::Error;

pub type BatchResult<T> = std::result::Result<T, BatchError>;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("failed to create output directory {path}: {source}")]
    CreateOutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start caption session: {0:#}")]
    Session(#[from] anyhow::Error),
}
