use std::ffi::CString;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Arc;

use crate::context::LlamaContext;
use crate::error::LlamaError;
use crate::params::{LlamaContextParams, LlamaModelParams};
use crate::sys;
use crate::token::{LlamaToken, LLAMA_TOKEN_NULL};
use crate::Llama;

/// Non-clonable inner model handle. Contexts keep this alive through an
/// `Arc` so the raw pointer outlives every context created from it.
pub(crate) struct ModelInner {
    pub(crate) raw: *mut sys::llama_model,
    pub(crate) lib: Arc<sys::LlamaLib>,
}

unsafe impl Send for ModelInner {}
unsafe impl Sync for ModelInner {}

impl Drop for ModelInner {
    fn drop(&mut self) {
        unsafe { (self.lib.llama_model_free)(self.raw) };
    }
}

/// A loaded model. Cheap to clone; the weights are freed with the last clone.
#[derive(Clone)]
pub struct LlamaModel {
    pub(crate) inner: Arc<ModelInner>,
}

impl Llama {
    /// Load model weights from a GGUF file.
    pub fn load_model(
        &self,
        path: &Path,
        params: LlamaModelParams,
    ) -> Result<LlamaModel, LlamaError> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())?;
        let c_params = params.to_c(&self.lib);
        let raw = unsafe { (self.lib.llama_model_load_from_file)(c_path.as_ptr(), c_params) };
        if raw.is_null() {
            return Err(LlamaError::ModelLoadFailed);
        }
        Ok(LlamaModel {
            inner: Arc::new(ModelInner {
                raw,
                lib: Arc::clone(&self.lib),
            }),
        })
    }
}

impl LlamaModel {
    fn vocab(&self) -> *const sys::llama_vocab {
        unsafe { (self.inner.lib.llama_model_get_vocab)(self.inner.raw) }
    }

    /// Create a decoding context bound to this model.
    pub fn new_context(&self, params: LlamaContextParams) -> Result<LlamaContext, LlamaError> {
        let c_params = params.to_c(&self.inner.lib);
        let raw = unsafe { (self.inner.lib.llama_init_from_model)(self.inner.raw, c_params) };
        if raw.is_null() {
            return Err(LlamaError::ContextCreateFailed);
        }
        Ok(LlamaContext {
            raw,
            model: Arc::clone(&self.inner),
        })
    }

    /// Tokenize UTF-8 text.
    ///
    /// `add_special` prefixes the vocabulary's BOS when the model defines
    /// one; `parse_special` lets special-token text through.
    pub fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<LlamaToken>, LlamaError> {
        let vocab = self.vocab();
        let bytes = text.as_bytes();
        // First call sizes the buffer: a negative count is the required size.
        let n = unsafe {
            (self.inner.lib.llama_tokenize)(
                vocab,
                bytes.as_ptr() as *const c_char,
                bytes.len() as i32,
                std::ptr::null_mut(),
                0,
                add_special,
                parse_special,
            )
        };
        let required = n.unsigned_abs() as usize;
        if required == 0 {
            return Ok(Vec::new());
        }
        let mut tokens: Vec<LlamaToken> = vec![0; required];
        let written = unsafe {
            (self.inner.lib.llama_tokenize)(
                vocab,
                bytes.as_ptr() as *const c_char,
                bytes.len() as i32,
                tokens.as_mut_ptr(),
                required as i32,
                add_special,
                parse_special,
            )
        };
        if written < 0 {
            return Err(LlamaError::TokenizeFailed(written));
        }
        tokens.truncate(written as usize);
        Ok(tokens)
    }

    /// Render one token as its UTF-8 piece.
    pub fn token_to_piece(&self, token: LlamaToken, special: bool) -> Result<String, LlamaError> {
        let vocab = self.vocab();
        let len = unsafe {
            (self.inner.lib.llama_token_to_piece)(vocab, token, std::ptr::null_mut(), 0, 0, special)
        };
        if len < 0 {
            return Err(LlamaError::TokenToPieceFailed(len));
        }
        if len == 0 {
            return Ok(String::new());
        }
        let mut buf = vec![0u8; len as usize];
        let written = unsafe {
            (self.inner.lib.llama_token_to_piece)(
                vocab,
                token,
                buf.as_mut_ptr() as *mut c_char,
                len,
                0,
                special,
            )
        };
        if written < 0 {
            return Err(LlamaError::TokenToPieceFailed(written));
        }
        buf.truncate(written as usize);
        String::from_utf8(buf).map_err(|e| LlamaError::from(e.utf8_error()))
    }

    /// Vocabulary size.
    pub fn n_vocab(&self) -> i32 {
        unsafe { (self.inner.lib.llama_vocab_n_tokens)(self.vocab()) }
    }

    /// BOS token, when the vocabulary defines one.
    pub fn token_bos(&self) -> Option<LlamaToken> {
        let t = unsafe { (self.inner.lib.llama_vocab_bos)(self.vocab()) };
        (t != LLAMA_TOKEN_NULL).then_some(t)
    }

    /// Whether `token` ends generation.
    pub fn token_is_eog(&self, token: LlamaToken) -> bool {
        unsafe { (self.inner.lib.llama_vocab_is_eog)(self.vocab(), token) }
    }
}

impl std::fmt::Debug for LlamaModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaModel").finish()
    }
}
