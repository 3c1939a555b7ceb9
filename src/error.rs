//! Errors raised while setting up or running a transfer.

use crate::protocol::FrameError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Transfer errors.
///
/// Setup and file-open failures carry the address or path involved;
/// streaming failures name the operation that failed.
#[derive(Debug)]
pub enum TransferError {
    Bind(String, io::Error),
    Accept(io::Error),
    Connect(String, io::Error),
    OpenSource(PathBuf, io::Error),
    OpenDestination(PathBuf, io::Error),
    Io(&'static str, io::Error),
    Timeout(&'static str, Duration),
    Frame(FrameError),
    LengthMismatch { expected: u64, received: u64 },
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Bind(addr, e) => write!(f, "Failed to listen on {addr}: {e}"),
            TransferError::Accept(e) => write!(f, "Failed to accept connection: {e}"),
            TransferError::Connect(addr, e) => write!(f, "Failed to connect to {addr}: {e}"),
            TransferError::OpenSource(path, e) => {
                write!(f, "Failed to open source file '{}': {}", path.display(), e)
            }
            TransferError::OpenDestination(path, e) => {
                write!(
                    f,
                    "Failed to open destination file '{}': {}",
                    path.display(),
                    e
                )
            }
            TransferError::Io(op, e) => write!(f, "Failed to {op}: {e}"),
            TransferError::Timeout(op, after) => {
                write!(f, "Timed out after {after:?} waiting to {op}")
            }
            TransferError::Frame(e) => write!(f, "Malformed stream: {e}"),
            TransferError::LengthMismatch { expected, received } => write!(
                f,
                "Sender announced {expected} bytes but {received} were received"
            ),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Bind(_, e)
            | TransferError::Accept(e)
            | TransferError::Connect(_, e)
            | TransferError::OpenSource(_, e)
            | TransferError::OpenDestination(_, e)
            | TransferError::Io(_, e) => Some(e),
            TransferError::Frame(e) => Some(e),
            TransferError::Timeout(..) | TransferError::LengthMismatch { .. } => None,
        }
    }
}

impl From<FrameError> for TransferError {
    fn from(e: FrameError) -> Self {
        TransferError::Frame(e)
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
