use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Transport-level failure: connection refused, timeout, TLS.
    #[error("request to {url} failed: {message}")]
    Communication { url: String, message: String },

    /// The archive rejected the configured identity.
    #[error("archive rejected credentials for {url} (HTTP {status})")]
    Authentication { url: String, status: u16 },

    #[error("local I/O failed for {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid event kind '{0}'")]
    InvalidEventKind(String),

    #[error("{0}")]
    Configuration(String),
}

impl ArchiveError {
    pub(crate) fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn communication(url: &str, message: impl ToString) -> Self {
        Self::Communication {
            url: url.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
