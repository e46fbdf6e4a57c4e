pub mod types;
pub mod core;

use std::path::{Path, PathBuf};

pub use crate::core::config::{ConfigError, Env};
pub use crate::types::FailurePolicy;

/// Creates the parent directory of `path` if it has one and it is missing.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("required resource {} does not exist", path.display())]
    MissingResource { path: PathBuf },

    #[error("required resource {} is empty", path.display())]
    EmptyResource { path: PathBuf },

    #[error("malformed record at {}:{line}: {source}", path.display())]
    CorruptRecord {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate record id {id} in {}", path.display())]
    DuplicateId { path: PathBuf, id: u64 },

    #[error("sequence {} is already being written by another process", path.display())]
    SequenceLocked { path: PathBuf },

    #[error("remote service kept failing: {0}")]
    TransientService(String),

    #[error("request rejected as too long: {0}")]
    OversizedRequest(String),

    #[error("remote service error: {0}")]
    Service(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("vector index error: {0}")]
    Index(String),

    #[error("cannot read document {}: {reason}", path.display())]
    Document { path: PathBuf, reason: String },

    #[error("stage {stage}: item {id} failed, batch not written")]
    PartialBatch {
        stage: &'static str,
        id: u64,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Configuration and precondition failures: the operator has to fix
    /// something before a rerun can succeed.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::MissingResource { .. }
                | Self::EmptyResource { .. }
                | Self::SequenceLocked { .. }
        )
    }

    /// Process exit status for a fatal error.
    pub fn exit_code(&self) -> u8 {
        if self.is_precondition() {
            2
        } else {
            1
        }
    }
}
