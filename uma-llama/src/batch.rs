use crate::error::LlamaError;
use crate::sys;
use crate::token::{LlamaPos, LlamaSeqId, LlamaToken};

/// Owned token batch in the runtime's parallel-array layout.
///
/// All component vectors advance together, one push per token, so the arrays
/// can never fall out of lockstep. The raw view handed to `llama_decode`
/// borrows these buffers; pointers into the per-token sequence-id lists are
/// refreshed immediately before each decode because the owning vectors may
/// have reallocated since the last call.
pub struct LlamaBatch {
    tokens: Vec<LlamaToken>,
    pos: Vec<LlamaPos>,
    seq_ids: Vec<Vec<LlamaSeqId>>,
    seq_id_ptrs: Vec<*mut LlamaSeqId>,
    n_seq_id: Vec<i32>,
    logits: Vec<i8>,
    capacity: usize,
}

unsafe impl Send for LlamaBatch {}

impl LlamaBatch {
    /// Create an empty batch holding at most `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            pos: Vec::with_capacity(capacity),
            seq_ids: Vec::with_capacity(capacity),
            seq_id_ptrs: Vec::with_capacity(capacity),
            n_seq_id: Vec::with_capacity(capacity),
            logits: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of tokens queued in the batch.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Maximum number of tokens this batch accepts.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue one token at `pos` for the given sequences, optionally
    /// requesting logits for it.
    pub fn push(
        &mut self,
        token: LlamaToken,
        pos: LlamaPos,
        seq_ids: &[LlamaSeqId],
        wants_logits: bool,
    ) -> Result<(), LlamaError> {
        if self.tokens.len() >= self.capacity {
            return Err(LlamaError::BatchFull);
        }
        self.tokens.push(token);
        self.pos.push(pos);
        self.seq_ids.push(seq_ids.to_vec());
        self.seq_id_ptrs.push(std::ptr::null_mut());
        self.n_seq_id.push(seq_ids.len() as i32);
        self.logits.push(i8::from(wants_logits));
        Ok(())
    }

    /// Drop all queued tokens so the allocation can be reused next tick.
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.pos.clear();
        self.seq_ids.clear();
        self.seq_id_ptrs.clear();
        self.n_seq_id.clear();
        self.logits.clear();
    }

    /// Build the raw view for `llama_decode`.
    ///
    /// The result borrows `self` and must not outlive it; `self` must not be
    /// mutated while the view is in flight.
    pub(crate) fn as_raw(&mut self) -> sys::llama_batch {
        for (ptr, ids) in self.seq_id_ptrs.iter_mut().zip(self.seq_ids.iter_mut()) {
            *ptr = ids.as_mut_ptr();
        }
        sys::llama_batch {
            n_tokens: self.tokens.len() as i32,
            token: self.tokens.as_mut_ptr(),
            embd: std::ptr::null_mut(),
            pos: self.pos.as_mut_ptr(),
            n_seq_id: self.n_seq_id.as_mut_ptr(),
            seq_id: self.seq_id_ptrs.as_mut_ptr(),
            logits: self.logits.as_mut_ptr(),
        }
    }
}
