//! The narrow waist between the scheduler and the model runtime.
//!
//! Everything above this trait works the same against the real native
//! runtime and against [`MockRuntime`]; the scheduler, the parser, and the
//! whole test suite depend on runtime *behavior*, not on the binding layer.

mod llama;
mod mock;

pub use llama::LlamaRuntime;
pub use mock::MockRuntime;

/// Token id (i32 for FFI compatibility; logically non-negative).
pub type Token = i32;

/// Position of a token within its sequence.
pub type Pos = i32;

/// Sequence id partitioning the KV cache among sessions.
pub type SeqId = i32;

/// Errors crossing the runtime seam.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("tokenization failed: {0}")]
    Tokenize(String),
    #[error("decode failed with status {0}")]
    Decode(i32),
    #[error("token render failed: {0}")]
    Piece(String),
}

/// One tick's fused work: parallel arrays over every queued token.
///
/// A single [`Batch::push`] advances all four arrays, so they cannot fall
/// out of lockstep; [`Batch::assert_coherent`] re-checks that in debug
/// builds before the batch is handed to the runtime.
#[derive(Debug, Default)]
pub struct Batch {
    tokens: Vec<Token>,
    pos: Vec<Pos>,
    seq: Vec<SeqId>,
    logits: Vec<bool>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            pos: Vec::with_capacity(capacity),
            seq: Vec::with_capacity(capacity),
            logits: Vec::with_capacity(capacity),
        }
    }

    /// Queue one token; returns its index within the batch.
    pub fn push(&mut self, token: Token, pos: Pos, seq: SeqId, wants_logits: bool) -> usize {
        self.tokens.push(token);
        self.pos.push(pos);
        self.seq.push(seq);
        self.logits.push(wants_logits);
        self.tokens.len() - 1
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Number of positions for which logits were requested.
    pub fn n_logits(&self) -> usize {
        self.logits.iter().filter(|&&l| l).count()
    }

    pub fn token(&self, i: usize) -> Token {
        self.tokens[i]
    }

    pub fn pos(&self, i: usize) -> Pos {
        self.pos[i]
    }

    pub fn seq_id(&self, i: usize) -> SeqId {
        self.seq[i]
    }

    pub fn wants_logits(&self, i: usize) -> bool {
        self.logits[i]
    }

    /// Debug-build check that the parallel arrays are still in lockstep.
    pub fn assert_coherent(&self) {
        debug_assert_eq!(self.tokens.len(), self.pos.len());
        debug_assert_eq!(self.tokens.len(), self.seq.len());
        debug_assert_eq!(self.tokens.len(), self.logits.len());
    }
}

/// The model runtime as the daemon consumes it.
pub trait Runtime {
    /// Physical micro-batch capacity: the hard cap on tokens per decode.
    fn batch_capacity(&self) -> usize;

    /// Vocabulary size (length of every logits row).
    fn vocab_size(&self) -> usize;

    /// BOS token when the vocabulary defines one.
    fn bos_token(&self) -> Option<Token>;

    /// Whether `token` ends generation.
    fn is_eog(&self, token: Token) -> bool;

    /// Tokenize text, optionally BOS-prefixed, special tokens allowed.
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, RuntimeError>;

    /// Render one token as its UTF-8 piece.
    fn token_to_piece(&self, token: Token) -> Result<String, RuntimeError>;

    /// Run one batched decode step over the fused batch.
    fn decode(&mut self, batch: &Batch) -> Result<(), RuntimeError>;

    /// Block until the decode's compute has actually finished, so wall time
    /// measured around it reflects real cost.
    fn synchronize(&mut self);

    /// Logits row for batch index `i` of the last successful decode.
    ///
    /// `i` must have requested logits in that batch.
    fn logits_ith(&self, i: usize) -> &[f32];

    /// Release every KV position owned by `seq`.
    fn seq_remove(&mut self, seq: SeqId);
}
