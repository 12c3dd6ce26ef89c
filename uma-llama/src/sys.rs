//! Raw FFI surface of the llama.cpp shared library.
//!
//! Symbols are resolved once at startup into a plain function table instead
//! of being linked, so the daemon binary builds and starts without the
//! native runtime present. Struct layouts match `llama.h` for the pinned
//! upstream revision; fields this crate never touches are kept so the
//! by-value ABI of the `*_default_params` calls stays intact.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;

pub type llama_token = i32;
pub type llama_pos = i32;
pub type llama_seq_id = i32;

#[repr(C)]
pub struct llama_model {
    _opaque: [u8; 0],
}

#[repr(C)]
pub struct llama_context {
    _opaque: [u8; 0],
}

#[repr(C)]
pub struct llama_vocab {
    _opaque: [u8; 0],
}

pub type llama_memory_t = *mut c_void;

pub type llama_progress_callback =
    Option<unsafe extern "C" fn(progress: f32, user_data: *mut c_void) -> bool>;
pub type llama_abort_callback =
    Option<unsafe extern "C" fn(user_data: *mut c_void) -> bool>;
pub type ggml_backend_sched_eval_callback =
    Option<unsafe extern "C" fn(t: *mut c_void, ask: bool, user_data: *mut c_void) -> bool>;

/// Parallel-array token batch handed to `llama_decode`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct llama_batch {
    pub n_tokens: i32,
    pub token: *mut llama_token,
    pub embd: *mut f32,
    pub pos: *mut llama_pos,
    pub n_seq_id: *mut i32,
    pub seq_id: *mut *mut llama_seq_id,
    pub logits: *mut i8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct llama_model_params {
    pub devices: *mut c_void,
    pub tensor_buft_overrides: *const c_void,
    pub n_gpu_layers: i32,
    pub split_mode: c_int,
    pub main_gpu: i32,
    pub tensor_split: *const f32,
    pub progress_callback: llama_progress_callback,
    pub progress_callback_user_data: *mut c_void,
    pub kv_overrides: *const c_void,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub check_tensors: bool,
    pub use_extra_bufts: bool,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct llama_context_params {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_seq_max: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
    pub rope_scaling_type: c_int,
    pub pooling_type: c_int,
    pub attention_type: c_int,
    pub flash_attn_type: c_int,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub yarn_ext_factor: f32,
    pub yarn_attn_factor: f32,
    pub yarn_beta_fast: f32,
    pub yarn_beta_slow: f32,
    pub yarn_orig_ctx: u32,
    pub defrag_thold: f32,
    pub cb_eval: ggml_backend_sched_eval_callback,
    pub cb_eval_user_data: *mut c_void,
    pub type_k: c_int,
    pub type_v: c_int,
    pub abort_callback: llama_abort_callback,
    pub abort_callback_data: *mut c_void,
    pub embeddings: bool,
    pub offload_kqv: bool,
    pub no_perf: bool,
    pub op_offload: bool,
    pub swa_full: bool,
    pub kv_unified: bool,
}

/// Function table over the loaded shared library.
///
/// Keeping the `Library` alive alongside the raw pointers is what makes the
/// pointers valid; never move the symbols out of this struct.
pub struct LlamaLib {
    _lib: libloading::Library,

    pub llama_backend_init: unsafe extern "C" fn(),
    pub llama_backend_free: unsafe extern "C" fn(),
    pub llama_print_system_info: unsafe extern "C" fn() -> *const c_char,

    pub llama_model_default_params: unsafe extern "C" fn() -> llama_model_params,
    pub llama_model_load_from_file:
        unsafe extern "C" fn(*const c_char, llama_model_params) -> *mut llama_model,
    pub llama_model_free: unsafe extern "C" fn(*mut llama_model),
    pub llama_model_get_vocab: unsafe extern "C" fn(*const llama_model) -> *const llama_vocab,

    pub llama_context_default_params: unsafe extern "C" fn() -> llama_context_params,
    pub llama_init_from_model:
        unsafe extern "C" fn(*mut llama_model, llama_context_params) -> *mut llama_context,
    pub llama_free: unsafe extern "C" fn(*mut llama_context),

    pub llama_n_ctx: unsafe extern "C" fn(*const llama_context) -> u32,
    pub llama_n_batch: unsafe extern "C" fn(*const llama_context) -> u32,
    pub llama_n_ubatch: unsafe extern "C" fn(*const llama_context) -> u32,
    pub llama_n_seq_max: unsafe extern "C" fn(*const llama_context) -> u32,

    pub llama_decode: unsafe extern "C" fn(*mut llama_context, llama_batch) -> i32,
    pub llama_synchronize: unsafe extern "C" fn(*mut llama_context),
    pub llama_get_logits_ith: unsafe extern "C" fn(*mut llama_context, i32) -> *mut f32,

    pub llama_get_memory: unsafe extern "C" fn(*const llama_context) -> llama_memory_t,
    pub llama_memory_seq_rm:
        unsafe extern "C" fn(llama_memory_t, llama_seq_id, llama_pos, llama_pos) -> bool,

    pub llama_tokenize: unsafe extern "C" fn(
        *const llama_vocab,
        *const c_char,
        i32,
        *mut llama_token,
        i32,
        bool,
        bool,
    ) -> i32,
    pub llama_token_to_piece:
        unsafe extern "C" fn(*const llama_vocab, llama_token, *mut c_char, i32, i32, bool) -> i32,

    pub llama_vocab_n_tokens: unsafe extern "C" fn(*const llama_vocab) -> i32,
    pub llama_vocab_bos: unsafe extern "C" fn(*const llama_vocab) -> llama_token,
    pub llama_vocab_is_eog: unsafe extern "C" fn(*const llama_vocab, llama_token) -> bool,
}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {
        *$lib.get(concat!($name, "\0").as_bytes())?
    };
}

impl LlamaLib {
    /// Open the shared library and resolve every symbol the daemon uses.
    ///
    /// # Safety
    /// The library at `path` must export the llama.cpp C API with the
    /// layouts declared in this module.
    pub unsafe fn open(path: &Path) -> Result<Self, libloading::Error> {
        let lib = libloading::Library::new(path)?;
        Ok(Self {
            llama_backend_init: resolve!(lib, "llama_backend_init"),
            llama_backend_free: resolve!(lib, "llama_backend_free"),
            llama_print_system_info: resolve!(lib, "llama_print_system_info"),
            llama_model_default_params: resolve!(lib, "llama_model_default_params"),
            llama_model_load_from_file: resolve!(lib, "llama_model_load_from_file"),
            llama_model_free: resolve!(lib, "llama_model_free"),
            llama_model_get_vocab: resolve!(lib, "llama_model_get_vocab"),
            llama_context_default_params: resolve!(lib, "llama_context_default_params"),
            llama_init_from_model: resolve!(lib, "llama_init_from_model"),
            llama_free: resolve!(lib, "llama_free"),
            llama_n_ctx: resolve!(lib, "llama_n_ctx"),
            llama_n_batch: resolve!(lib, "llama_n_batch"),
            llama_n_ubatch: resolve!(lib, "llama_n_ubatch"),
            llama_n_seq_max: resolve!(lib, "llama_n_seq_max"),
            llama_decode: resolve!(lib, "llama_decode"),
            llama_synchronize: resolve!(lib, "llama_synchronize"),
            llama_get_logits_ith: resolve!(lib, "llama_get_logits_ith"),
            llama_get_memory: resolve!(lib, "llama_get_memory"),
            llama_memory_seq_rm: resolve!(lib, "llama_memory_seq_rm"),
            llama_tokenize: resolve!(lib, "llama_tokenize"),
            llama_token_to_piece: resolve!(lib, "llama_token_to_piece"),
            llama_vocab_n_tokens: resolve!(lib, "llama_vocab_n_tokens"),
            llama_vocab_bos: resolve!(lib, "llama_vocab_bos"),
            llama_vocab_is_eog: resolve!(lib, "llama_vocab_is_eog"),
            _lib: lib,
        })
    }
}
