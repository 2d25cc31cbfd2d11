use thiserror::Error;

use crate::path::{PathBuf, PathComponentError};
use crate::provider::ProviderKey;

/// Errors returned by the content database and the file tree.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(std::io::Error),

    /// Misuse of the tree, like attaching a node that already has a parent.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The primary write succeeded, but writing to the auxiliary sink failed.
    #[error("secondary stream failed: {0}")]
    SecondaryStream(std::io::Error),

    #[error("writing to {path} of provider {provider} is not allowed")]
    WriteForbidden { provider: ProviderKey, path: PathBuf },

    #[error("invalid file type: {0}")]
    InvalidFileType(String),

    #[error("synchronization failed with {} error(s): {}", .0.len(), .0.first().map(|e| e.to_string()).unwrap_or_default())]
    SynchronizationFailed(Vec<Error>),
}

impl Error {
    /// Returns true if this error was caused by a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::InvalidInput {
            Error::InvalidArgument(value.to_string())
        } else {
            Error::Io(value)
        }
    }
}

impl From<PathComponentError> for Error {
    fn from(value: PathComponentError) -> Self {
        Error::InvalidArgument(value.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            Error::SecondaryStream(e) => e,
            Error::InvalidArgument(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            e @ Error::WriteForbidden { .. } => {
                Self::new(std::io::ErrorKind::PermissionDenied, e.to_string())
            }
            e => Self::new(std::io::ErrorKind::Other, e.to_string()),
        }
    }
}
