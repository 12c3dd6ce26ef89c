use std::ffi::NulError;
use std::str::Utf8Error;

/// Errors surfaced by the runtime bindings.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    /// The shared library could not be opened or a symbol is missing.
    #[error("failed to open runtime library: {0}")]
    LibraryOpen(#[from] libloading::Error),

    /// A null byte was found in a caller-provided string.
    #[error("null byte in caller-provided string: {0}")]
    NullByteInString(#[from] NulError),

    /// The runtime produced bytes that are not valid UTF-8.
    #[error("invalid UTF-8 from runtime: {0}")]
    InvalidUtf8(#[from] Utf8Error),

    /// Model loading returned a null handle.
    #[error("failed to load model")]
    ModelLoadFailed,

    /// Context creation returned a null handle.
    #[error("failed to create decoding context")]
    ContextCreateFailed,

    /// Tokenization reported a negative token count.
    #[error("tokenization failed with code {0}")]
    TokenizeFailed(i32),

    /// `decode` returned a non-zero status.
    #[error("decode failed with status {0}")]
    DecodeFailed(i32),

    /// Token-to-piece rendering failed.
    #[error("token to piece conversion failed with code {0}")]
    TokenToPieceFailed(i32),

    /// The batch is at capacity.
    #[error("batch is full")]
    BatchFull,
}
