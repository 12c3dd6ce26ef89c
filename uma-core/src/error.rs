use crate::engine::RuntimeError;

/// Daemon-level failures that abort startup or the event loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
