use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("required file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("cannot read {}: {source}", path.display())]
    Npy {
        path: PathBuf,
        #[source]
        source: ndarray_npy::ReadNpyError,
    },

    #[error("malformed {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("AIC cutoff {index} of {run} is outside the cepstral range 0..{len}")]
    AicOutOfRange { run: String, index: usize, len: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("no usable input runs")]
    EmptyEnsemble,

    #[error("PDF output failed: {0}")]
    Pdf(String),
}

impl EnsembleError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        EnsembleError::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
