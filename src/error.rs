//! Error types for dataset decoding and the labeling pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while decoding a dataset archive into a scene graph.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a torch zip archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("archive has no data.pkl entry")]
    MissingPickle,

    #[error("archive has no storage blob for key {0:?}")]
    MissingStorage(String),

    #[error("unsupported pickle opcode 0x{opcode:02x} at offset {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },

    #[error("pickle ended unexpectedly at offset {0}")]
    Truncated(usize),

    #[error("malformed pickle: {0}")]
    Malformed(String),

    #[error("unsupported tensor dtype: {0}")]
    UnsupportedDtype(String),

    #[error("tensor view out of bounds: {0}")]
    TensorBounds(String),

    #[error("missing node store {0:?}")]
    MissingNodeStore(String),

    #[error("invalid attribute {key:?}: {reason}")]
    InvalidAttribute { key: String, reason: String },
}

/// Errors surfaced by the labeling pipeline.
#[derive(Error, Debug)]
pub enum LabelError {
    #[error("no .pt files found in: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to load {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("unsupported class count {0}: only 2 or 3 classes are supported")]
    Config(u8),

    #[error("invalid config file {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl LabelError {
    pub fn load(path: impl Into<PathBuf>, source: DecodeError) -> Self {
        LabelError::Load {
            path: path.into(),
            source,
        }
    }
}

/// Result type for labeling operations.
pub type Result<T> = std::result::Result<T, LabelError>;
