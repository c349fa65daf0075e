use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BouncerError {
    #[error("config does not contain LAPI key or certificate")]
    MissingCredential,
    #[error("bin_path is not set")]
    BinPathNotSet,
    #[error("binary '{}' doesn't exist", .0.display())]
    BinaryNotFound(PathBuf),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
}
