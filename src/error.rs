use std::error::Error as StdError;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shardpack's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Shardpack's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
///
/// The variants follow the packaging failure taxonomy:
/// - `SourceIo` is transient (network hiccups while pulling samples). We never retry it
///   ourselves; the caller decides.
/// - `WriteIo` is a local disk failure while archiving.
/// - `Schema` is a declared group member that does not exist. Keyed packaging counts and
///   skips these instead of failing the run.
/// - `Model` is a transcription collaborator failure.
///
/// End of stream is not an error: sources return `Ok(None)`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("source I/O failed: {context}")]
    SourceIo {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed sample record at line {line}: {message}")]
    Malformed { line: u64, message: String },

    #[error("write failed for {}: {source}", path.display())]
    WriteIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("group '{group}': {message}")]
    Schema { group: String, message: String },

    #[error("model error: {0}")]
    Model(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("sample {index} arrived after sample {previous}; indexes must strictly increase")]
    OutOfOrder { previous: u64, index: u64 },

    #[error(
        "resume check failed at sample {index}: upstream metadata differs from {}",
        archive.display()
    )]
    ResumeMismatch { index: u64, archive: PathBuf },

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Build a `map_err` adapter that tags an I/O failure as a source failure.
    pub(crate) fn source_io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::SourceIo { context, source }
    }

    /// Build a `map_err` adapter that tags an I/O failure as a local write failure.
    pub(crate) fn write_io(path: &Path) -> impl FnOnce(io::Error) -> Self + use<> {
        let path = path.to_path_buf();
        move |source| Self::WriteIo { path, source }
    }

    /// Whether retrying the failed operation on a fresh connection could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceIo { .. })
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Self::Other(Box::new(err))
    }
}
