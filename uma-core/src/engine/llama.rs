//! Adapter from the [`Runtime`] trait to the native bindings.

use uma_llama::{LlamaBatch, LlamaContext, LlamaError, LlamaModel};

use super::{Batch, Runtime, RuntimeError, SeqId, Token};

/// The native runtime behind one model and one shared decoding context.
pub struct LlamaRuntime {
    model: LlamaModel,
    ctx: LlamaContext,
    /// Reused across ticks; cleared and refilled on every decode.
    scratch: LlamaBatch,
}

impl LlamaRuntime {
    pub fn new(model: LlamaModel, ctx: LlamaContext) -> Self {
        let capacity = ctx.n_batch() as usize;
        Self {
            model,
            ctx,
            scratch: LlamaBatch::new(capacity),
        }
    }

    pub fn context(&self) -> &LlamaContext {
        &self.ctx
    }
}

impl Runtime for LlamaRuntime {
    fn batch_capacity(&self) -> usize {
        self.ctx.n_batch() as usize
    }

    fn vocab_size(&self) -> usize {
        self.model.n_vocab() as usize
    }

    fn bos_token(&self) -> Option<Token> {
        self.model.token_bos()
    }

    fn is_eog(&self, token: Token) -> bool {
        self.model.token_is_eog(token)
    }

    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, RuntimeError> {
        self.model
            .tokenize(text, add_bos, parse_special)
            .map_err(|e| RuntimeError::Tokenize(e.to_string()))
    }

    fn token_to_piece(&self, token: Token) -> Result<String, RuntimeError> {
        self.model
            .token_to_piece(token, true)
            .map_err(|e| RuntimeError::Piece(e.to_string()))
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), RuntimeError> {
        self.scratch.clear();
        for i in 0..batch.len() {
            self.scratch
                .push(
                    batch.token(i),
                    batch.pos(i),
                    &[batch.seq_id(i)],
                    batch.wants_logits(i),
                )
                .map_err(|e| match e {
                    LlamaError::BatchFull => RuntimeError::Decode(-1),
                    other => RuntimeError::Decode(other_to_status(&other)),
                })?;
        }
        self.ctx.decode(&mut self.scratch).map_err(|e| match e {
            LlamaError::DecodeFailed(status) => RuntimeError::Decode(status),
            other => RuntimeError::Decode(other_to_status(&other)),
        })
    }

    fn synchronize(&mut self) {
        self.ctx.synchronize();
    }

    fn logits_ith(&self, i: usize) -> &[f32] {
        self.ctx.logits_ith(i as i32)
    }

    fn seq_remove(&mut self, seq: SeqId) {
        self.ctx.memory_seq_rm(seq, -1, -1);
    }
}

fn other_to_status(_e: &LlamaError) -> i32 {
    1
}
