use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced while reading or writing RAC containers.
///
/// The type is `Clone` so that readers and writers can keep the first error
/// they hit and hand it back from every later call.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("invalid index node")]
    InvalidIndexNode,
    #[error("invalid chunk: {0}")]
    InvalidChunk(&'static str),
    #[error("invalid dictionary: {0}")]
    InvalidDictionary(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported codec: {0:#018x}")]
    UnsupportedCodec(u64),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid codec")]
    InvalidCodec,
    #[error("inconsistent codec")]
    InconsistentCodec,
    #[error("too much input")]
    TooMuchInput,
    #[error("too many chunks")]
    TooManyChunks,
    #[error("too many resources")]
    TooManyResources,
    #[error("closed")]
    Closed,
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(err) => io::Error::new(err.kind(), Error::Io(err)),
            Error::InvalidArgument(_) => io::Error::new(io::ErrorKind::InvalidInput, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
