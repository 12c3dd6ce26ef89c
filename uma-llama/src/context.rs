use std::sync::Arc;

use crate::batch::LlamaBatch;
use crate::error::LlamaError;
use crate::model::ModelInner;
use crate::sys;
use crate::token::{LlamaPos, LlamaSeqId};

/// A decoding context: KV cache plus compute state for one model.
///
/// One context is shared by every concurrent sequence through disjoint
/// sequence ids; only the thread that owns it may call [`Self::decode`].
pub struct LlamaContext {
    pub(crate) raw: *mut sys::llama_context,
    pub(crate) model: Arc<ModelInner>,
}

unsafe impl Send for LlamaContext {}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        unsafe { (self.model.lib.llama_free)(self.raw) };
    }
}

impl LlamaContext {
    /// Resolved context window size.
    pub fn n_ctx(&self) -> u32 {
        unsafe { (self.model.lib.llama_n_ctx)(self.raw) }
    }

    /// Logical batch capacity.
    pub fn n_batch(&self) -> u32 {
        unsafe { (self.model.lib.llama_n_batch)(self.raw) }
    }

    /// Physical micro-batch capacity.
    pub fn n_ubatch(&self) -> u32 {
        unsafe { (self.model.lib.llama_n_ubatch)(self.raw) }
    }

    /// Maximum concurrent sequences.
    pub fn n_seq_max(&self) -> u32 {
        unsafe { (self.model.lib.llama_n_seq_max)(self.raw) }
    }

    /// Run one batched decode step.
    pub fn decode(&mut self, batch: &mut LlamaBatch) -> Result<(), LlamaError> {
        let raw_batch = batch.as_raw();
        let status = unsafe { (self.model.lib.llama_decode)(self.raw, raw_batch) };
        if status != 0 {
            return Err(LlamaError::DecodeFailed(status));
        }
        Ok(())
    }

    /// Block until all queued compute for this context has finished.
    pub fn synchronize(&mut self) {
        unsafe { (self.model.lib.llama_synchronize)(self.raw) }
    }

    /// Logits row for the `i`-th batch token of the last decode.
    ///
    /// # Panics
    /// Panics when `i` did not request logits in that batch, mirroring the
    /// runtime's null return.
    pub fn logits_ith(&self, i: i32) -> &[f32] {
        let n_vocab = unsafe {
            (self.model.lib.llama_vocab_n_tokens)(
                (self.model.lib.llama_model_get_vocab)(self.model.raw),
            )
        } as usize;
        let ptr = unsafe { (self.model.lib.llama_get_logits_ith)(self.raw, i) };
        assert!(!ptr.is_null(), "no logits were computed for batch index {i}");
        unsafe { std::slice::from_raw_parts(ptr, n_vocab) }
    }

    /// Remove positions `[p0, p1)` of `seq` from the KV cache; negative
    /// bounds mean the whole range.
    pub fn memory_seq_rm(&mut self, seq: LlamaSeqId, p0: LlamaPos, p1: LlamaPos) -> bool {
        let mem = unsafe { (self.model.lib.llama_get_memory)(self.raw) };
        if mem.is_null() {
            return false;
        }
        unsafe { (self.model.lib.llama_memory_seq_rm)(mem, seq, p0, p1) }
    }
}

impl std::fmt::Debug for LlamaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaContext").finish()
    }
}
