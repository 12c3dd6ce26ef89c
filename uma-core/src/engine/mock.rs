//! Deterministic stand-in runtime for the test suite.
//!
//! The vocabulary is the 256 byte values plus one end-of-generation token.
//! Tokenization maps text to its UTF-8 bytes; after a decode, the logits
//! row for a sampled position peaks at `'a' + pos % 26`, or at EOG once the
//! position reaches `eog_after`. Two identical requests therefore stream
//! identical token sequences, which is what the end-to-end tests lean on.

use std::collections::HashMap;

use super::{Batch, Pos, Runtime, RuntimeError, SeqId, Token};

const BYTE_VOCAB: usize = 256;

/// End-of-generation token id of the mock vocabulary.
pub const MOCK_EOG: Token = BYTE_VOCAB as Token;

pub struct MockRuntime {
    batch_capacity: usize,
    /// Positions at or beyond this peak at EOG.
    eog_after: Pos,
    /// 1-based decode call that fails with a non-zero status, once.
    fail_on_call: Option<u64>,
    /// Tokenize everything to an empty sequence.
    tokenize_empty: bool,
    calls: u64,
    /// Per-sequence positions accepted so far (the mock's "KV cache").
    seqs: HashMap<SeqId, Vec<Pos>>,
    /// Logits rows of the last decode, keyed by batch index.
    rows: HashMap<usize, Vec<f32>>,
}

impl MockRuntime {
    pub fn new(batch_capacity: usize) -> Self {
        Self {
            batch_capacity,
            eog_after: Pos::MAX,
            fail_on_call: None,
            tokenize_empty: false,
            calls: 0,
            seqs: HashMap::new(),
            rows: HashMap::new(),
        }
    }

    /// Peak at EOG once a sampled position reaches `pos`.
    pub fn eog_after(mut self, pos: Pos) -> Self {
        self.eog_after = pos;
        self
    }

    /// Make the `n`-th decode call (1-based) fail.
    pub fn fail_on_call(mut self, n: u64) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    /// Tokenize every prompt to nothing, as a tokenizer with an
    /// all-special vocabulary would.
    pub fn tokenize_nothing(mut self) -> Self {
        self.tokenize_empty = true;
        self
    }

    /// Decode calls observed so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Positions currently held for `seq`, empty after release.
    pub fn seq_len(&self, seq: SeqId) -> usize {
        self.seqs.get(&seq).map_or(0, Vec::len)
    }

    fn row_for(&self, pos: Pos) -> Vec<f32> {
        let peak = if pos >= self.eog_after {
            MOCK_EOG
        } else {
            Token::from(b'a') + pos % 26
        };
        let mut row = vec![0.0f32; self.vocab_size()];
        row[peak as usize] = 1.0;
        row
    }
}

impl Runtime for MockRuntime {
    fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    fn vocab_size(&self) -> usize {
        BYTE_VOCAB + 1
    }

    fn bos_token(&self) -> Option<Token> {
        None
    }

    fn is_eog(&self, token: Token) -> bool {
        token == MOCK_EOG
    }

    fn tokenize(
        &self,
        text: &str,
        _add_bos: bool,
        _parse_special: bool,
    ) -> Result<Vec<Token>, RuntimeError> {
        if self.tokenize_empty {
            return Ok(Vec::new());
        }
        Ok(text.bytes().map(Token::from).collect())
    }

    fn token_to_piece(&self, token: Token) -> Result<String, RuntimeError> {
        if !(0..=BYTE_VOCAB as Token).contains(&token) {
            return Err(RuntimeError::Piece(format!("token {token} out of range")));
        }
        if token == MOCK_EOG {
            return Ok(String::new());
        }
        Ok((token as u8 as char).to_string())
    }

    fn decode(&mut self, batch: &Batch) -> Result<(), RuntimeError> {
        self.calls += 1;
        if self.fail_on_call == Some(self.calls) {
            return Err(RuntimeError::Decode(1));
        }
        batch.assert_coherent();
        assert!(batch.len() <= self.batch_capacity, "batch exceeds capacity");
        self.rows.clear();
        for i in 0..batch.len() {
            self.seqs.entry(batch.seq_id(i)).or_default().push(batch.pos(i));
            if batch.wants_logits(i) {
                let row = self.row_for(batch.pos(i));
                self.rows.insert(i, row);
            }
        }
        Ok(())
    }

    fn synchronize(&mut self) {}

    fn logits_ith(&self, i: usize) -> &[f32] {
        self.rows
            .get(&i)
            .unwrap_or_else(|| panic!("no logits were computed for batch index {i}"))
    }

    fn seq_remove(&mut self, seq: SeqId) {
        self.seqs.remove(&seq);
    }
}
