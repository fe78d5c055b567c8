use thiserror::Error;

/// A specialized `Result` type for persisted state machine operations.
pub type StmResult<T> = Result<T, StmError>;

/// Structured error type used throughout the stm package.
#[derive(Error, Debug)]
pub enum StmError {
    // Startup could not load an existing snapshot. Callers must treat this
    // as unrecoverable: continuing with derived state we cannot trust would
    // silently corrupt it.
    #[error("Failed to load snapshot from {path}: {source}")]
    Hydration {
        path: String,
        #[source]
        source: Box<StmError>,
    },

    #[error("Snapshot format version {0} is newer than this build understands")]
    UnsupportedSnapshotFormat(i8),

    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("State machine rejected snapshot: {0}")]
    RestoreRejected(String),

    #[error("Timed out waiting for offset {0}")]
    WaitTimeout(i64),

    #[error("Wait for offset {0} was abandoned")]
    WaitAbandoned(i64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
