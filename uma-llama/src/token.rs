/// A token identifier in the runtime vocabulary.
pub type LlamaToken = crate::sys::llama_token;

/// A position within a sequence.
pub type LlamaPos = crate::sys::llama_pos;

/// A sequence identifier partitioning the KV cache.
pub type LlamaSeqId = crate::sys::llama_seq_id;

/// Sentinel the runtime returns for vocabulary entries it does not have.
pub const LLAMA_TOKEN_NULL: LlamaToken = -1;
