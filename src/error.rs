//! Error types for file reader operations

use crate::protocol::FileRef;
use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FileReaderError>;

/// Failures surfaced to callers of open/read/dispose
///
/// Stale callbacks never show up here: a resolution for an id that is no
/// longer registered is dropped by the registry and only logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileReaderError {
    /// The file reference was never opened or has already been disposed
    InvalidReference(FileRef),
    /// The element has no file collection attached
    NoFileCollection,
    /// The element's file collection has no file at this index
    IndexOutOfRange { index: usize, count: usize },
    /// The script-side read primitive reported an error
    TransferFailure(String),
    /// The read was cancelled locally before its completion arrived
    Cancelled,
    /// Caller passed an offset/count that does not fit the buffer or protocol
    InvalidArgument(String),
    /// A marshalled payload could not be decoded into the destination buffer
    Decode(String),
    /// The transport failed to carry an ordinary call or its result
    Host(String),
}

impl FileReaderError {
    /// Wrap a transport failure
    pub fn host(err: impl std::fmt::Display) -> Self {
        FileReaderError::Host(err.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FileReaderError::Cancelled)
    }
}

impl std::fmt::Display for FileReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileReaderError::InvalidReference(file_ref) => {
                write!(f, "Invalid or disposed file reference: {file_ref}")
            }
            FileReaderError::NoFileCollection => write!(f, "No file list available"),
            FileReaderError::IndexOutOfRange { index, count } => {
                write!(f, "No file with index {index} available ({count} files)")
            }
            FileReaderError::TransferFailure(msg) => write!(f, "Script read failed: {msg}"),
            FileReaderError::Cancelled => write!(f, "Read cancelled"),
            FileReaderError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            FileReaderError::Decode(msg) => write!(f, "Decode error: {msg}"),
            FileReaderError::Host(msg) => write!(f, "Script host error: {msg}"),
        }
    }
}

impl std::error::Error for FileReaderError {}

impl From<FileReaderError> for io::Error {
    fn from(err: FileReaderError) -> Self {
        let kind = match &err {
            FileReaderError::Cancelled => io::ErrorKind::Interrupted,
            FileReaderError::InvalidReference(_) => io::ErrorKind::NotFound,
            FileReaderError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            FileReaderError::Decode(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
