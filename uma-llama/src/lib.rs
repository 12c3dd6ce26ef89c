//! Dynamic bindings to the native model runtime (llama.cpp C API).
//!
//! The runtime is opened as a shared library at startup rather than linked,
//! so one daemon binary runs against whatever build of the runtime the host
//! provides (CPU, Metal, CUDA).
//!
//! ```rust,no_run
//! use uma_llama::{Llama, LlamaBatch, LlamaContextParams, LlamaModelParams};
//! use std::path::Path;
//!
//! let llama = Llama::open(Path::new("libllama.so")).unwrap();
//! let _backend = llama.init_backend();
//!
//! let model = llama
//!     .load_model(Path::new("model.gguf"), LlamaModelParams::default())
//!     .unwrap();
//! let mut ctx = model
//!     .new_context(LlamaContextParams::default().n_seq_max(8))
//!     .unwrap();
//!
//! let tokens = model.tokenize("Hello", true, true).unwrap();
//! let mut batch = LlamaBatch::new(tokens.len());
//! for (i, &tok) in tokens.iter().enumerate() {
//!     batch.push(tok, i as i32, &[0], i + 1 == tokens.len()).unwrap();
//! }
//! ctx.decode(&mut batch).unwrap();
//! let logits = ctx.logits_ith(tokens.len() as i32 - 1);
//! assert_eq!(logits.len(), model.n_vocab() as usize);
//! ```

use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

mod batch;
mod context;
mod error;
mod model;
mod params;
pub mod sys;
mod token;

pub use batch::LlamaBatch;
pub use context::LlamaContext;
pub use error::LlamaError;
pub use model::LlamaModel;
pub use params::{LlamaContextParams, LlamaModelParams};
pub use token::{LlamaPos, LlamaSeqId, LlamaToken, LLAMA_TOKEN_NULL};

/// Entry point: the loaded runtime library.
#[derive(Clone)]
pub struct Llama {
    pub(crate) lib: Arc<sys::LlamaLib>,
}

impl Llama {
    /// Open the runtime shared library and resolve its symbols.
    pub fn open(path: &Path) -> Result<Self, LlamaError> {
        let lib = unsafe { sys::LlamaLib::open(path)? };
        Ok(Self { lib: Arc::new(lib) })
    }

    /// Initialise the runtime backend, returning a guard that frees it.
    ///
    /// Call once per process, before loading any model, and keep the guard
    /// alive until every model and context has been dropped.
    pub fn init_backend(&self) -> BackendGuard {
        unsafe { (self.lib.llama_backend_init)() };
        BackendGuard {
            lib: Arc::clone(&self.lib),
        }
    }

    /// Human-readable description of the runtime build (CPU features, BLAS).
    pub fn system_info(&self) -> String {
        let ptr = unsafe { (self.lib.llama_print_system_info)() };
        if ptr.is_null() {
            return String::new();
        }
        unsafe { CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned()
    }
}

impl std::fmt::Debug for Llama {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Llama").finish()
    }
}

/// Process-wide backend lifecycle guard; frees the backend on drop.
pub struct BackendGuard {
    lib: Arc<sys::LlamaLib>,
}

impl Drop for BackendGuard {
    fn drop(&mut self) {
        unsafe { (self.lib.llama_backend_free)() };
    }
}
