use std::{path::PathBuf, time::Duration};
use thiserror::Error;

use crate::export::Phase;

pub type StatementSource = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while deriving, creating, indexing or writing an export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Style or export configuration is unusable. Raised before any DDL runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// A column type could not be mapped to a native store type.
    #[error("schema error: {0}")]
    Schema(String),

    /// The style file could not be read or parsed.
    #[error("failed to load style {path:?}")]
    Style {
        path: PathBuf,
        #[source]
        source: StatementSource,
    },

    /// A statement was rejected by the store. Earlier statements of the batch stay applied.
    #[error("statement {position} of batch {batch} failed after {elapsed:.1?}: {statement}")]
    Statement {
        batch: String,
        position: usize,
        statement: String,
        elapsed: Duration,
        #[source]
        source: StatementSource,
    },

    /// Writing a batch file failed. Fatal to the export.
    #[error("failed to write {path:?}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] postgres::Error),

    /// A pipeline step ran before its preconditions held.
    #[error("export is in phase {actual}, expected {expected}")]
    Phase { expected: Phase, actual: Phase },
}

pub type Result<T> = std::result::Result<T, ExportError>;
