use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("package registry not found: {0}")]
    RegistryNotFound(PathBuf),

    #[error("failed to read package registry {path}: {source}")]
    RegistryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
