use std::path::PathBuf;

use thiserror::Error;

/// Why an edit, load, save or histogram computation did not produce a result.
///
/// Cloneable so a finished task can hand the same failure to every poll site.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditError {
    /// A collaborator reported failure (e.g. a filter rejected its input).
    #[error("{0}")]
    Failed(String),

    /// The worker observed a cancellation request and stopped early.
    #[error("operation cancelled")]
    Cancelled,

    /// The worker panicked; the message is the panic payload.
    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error("cannot access '{}': {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("cannot decode '{}': {message}", path.display())]
    Decode { path: PathBuf, message: String },

    #[error("cannot write '{}': {message}", path.display())]
    Encode { path: PathBuf, message: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The operation needs pixels but the image is 0×0.
    #[error("image is empty")]
    EmptyImage,
}

impl EditError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EditError::Cancelled)
    }
}
