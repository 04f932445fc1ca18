use std::fmt;

/// The failure categories of a launch. Every fallible operation in this crate
/// returns one of these, callers that only care about the category can match
/// on [LaunchError::kind].
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Malformed mount manifest, unknown task, or invalid arguments. Raised
    /// before any container exists.
    #[error("configuration error: {0}")]
    Config(String),
    /// A mount source is missing on the host, or the image could not be
    /// located at its registry
    #[error("not found: {0}")]
    NotFound(String),
    /// The engine rejected the image pull
    #[error("image pull failed: {0}")]
    Pull(String),
    /// The engine could not be reached, or a container could not be created
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    /// Ctrl-C arrived while the task command was running
    #[error("interrupted while the task command was running")]
    Interrupted,
}

/// Fieldless mirror of [LaunchError] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    NotFound,
    Pull,
    RuntimeUnavailable,
    Interrupted,
}

impl LaunchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LaunchError::Config(_) => ErrorKind::Config,
            LaunchError::NotFound(_) => ErrorKind::NotFound,
            LaunchError::Pull(_) => ErrorKind::Pull,
            LaunchError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            LaunchError::Interrupted => ErrorKind::Interrupted,
        }
    }

    pub(crate) fn config(msg: impl fmt::Display) -> Self {
        LaunchError::Config(msg.to_string())
    }

    pub(crate) fn not_found(msg: impl fmt::Display) -> Self {
        LaunchError::NotFound(msg.to_string())
    }

    pub(crate) fn runtime(msg: impl fmt::Display) -> Self {
        LaunchError::RuntimeUnavailable(msg.to_string())
    }
}

pub type Result<T, E = LaunchError> = std::result::Result<T, E>;
