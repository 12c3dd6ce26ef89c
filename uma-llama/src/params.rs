use crate::sys;

/// Parameters for loading model weights.
#[derive(Debug, Clone)]
pub struct LlamaModelParams {
    /// Memory-map the weights file instead of reading it.
    pub use_mmap: bool,
    /// Lock the weights in RAM.
    pub use_mlock: bool,
    /// Layers to offload to an accelerator (0 = CPU only).
    pub n_gpu_layers: i32,
}

impl Default for LlamaModelParams {
    fn default() -> Self {
        Self {
            use_mmap: true,
            use_mlock: false,
            n_gpu_layers: 0,
        }
    }
}

impl LlamaModelParams {
    pub fn use_mmap(mut self, v: bool) -> Self {
        self.use_mmap = v;
        self
    }

    pub fn use_mlock(mut self, v: bool) -> Self {
        self.use_mlock = v;
        self
    }

    pub fn n_gpu_layers(mut self, v: i32) -> Self {
        self.n_gpu_layers = v;
        self
    }

    pub(crate) fn to_c(&self, lib: &sys::LlamaLib) -> sys::llama_model_params {
        let mut p = unsafe { (lib.llama_model_default_params)() };
        p.use_mmap = self.use_mmap;
        p.use_mlock = self.use_mlock;
        p.n_gpu_layers = self.n_gpu_layers;
        p
    }
}

/// Parameters for creating a decoding context.
#[derive(Debug, Clone)]
pub struct LlamaContextParams {
    /// Aggregate KV window in tokens (0 = model default).
    pub n_ctx: u32,
    /// Logical batch size for decoding.
    pub n_batch: u32,
    /// Physical micro-batch size (0 = same as `n_batch`).
    pub n_ubatch: u32,
    /// Maximum concurrent sequences in the KV cache.
    pub n_seq_max: u32,
    /// Compute threads (0 = runtime default).
    pub n_threads: i32,
    /// Offload the KV cache alongside the weights.
    pub offload_kqv: bool,
    /// Use one unified KV buffer shared by all sequences.
    pub kv_unified: bool,
    /// Keep the full-size sliding-window cache resident.
    pub swa_full: bool,
}

impl Default for LlamaContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 2048,
            n_ubatch: 0,
            n_seq_max: 1,
            n_threads: 0,
            offload_kqv: true,
            kv_unified: true,
            swa_full: true,
        }
    }
}

impl LlamaContextParams {
    pub fn n_ctx(mut self, v: u32) -> Self {
        self.n_ctx = v;
        self
    }

    pub fn n_batch(mut self, v: u32) -> Self {
        self.n_batch = v;
        self
    }

    pub fn n_ubatch(mut self, v: u32) -> Self {
        self.n_ubatch = v;
        self
    }

    pub fn n_seq_max(mut self, v: u32) -> Self {
        self.n_seq_max = v;
        self
    }

    pub fn n_threads(mut self, v: i32) -> Self {
        self.n_threads = v;
        self
    }

    pub fn offload_kqv(mut self, v: bool) -> Self {
        self.offload_kqv = v;
        self
    }

    pub fn kv_unified(mut self, v: bool) -> Self {
        self.kv_unified = v;
        self
    }

    pub fn swa_full(mut self, v: bool) -> Self {
        self.swa_full = v;
        self
    }

    pub(crate) fn to_c(&self, lib: &sys::LlamaLib) -> sys::llama_context_params {
        let mut p = unsafe { (lib.llama_context_default_params)() };
        p.n_ctx = self.n_ctx;
        p.n_batch = self.n_batch;
        if self.n_ubatch > 0 {
            p.n_ubatch = self.n_ubatch;
        }
        p.n_seq_max = self.n_seq_max;
        if self.n_threads > 0 {
            p.n_threads = self.n_threads;
            p.n_threads_batch = self.n_threads;
        }
        p.offload_kqv = self.offload_kqv;
        p.kv_unified = self.kv_unified;
        p.swa_full = self.swa_full;
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_params_builder_overrides_defaults() {
        let p = LlamaModelParams::default().use_mmap(false).use_mlock(true);
        assert!(!p.use_mmap);
        assert!(p.use_mlock);
        assert_eq!(p.n_gpu_layers, 0);
    }

    #[test]
    fn context_params_builder_chains() {
        let p = LlamaContextParams::default()
            .n_ctx(8192)
            .n_batch(1024)
            .n_ubatch(256)
            .n_seq_max(16)
            .n_threads(8);
        assert_eq!(p.n_ctx, 8192);
        assert_eq!(p.n_batch, 1024);
        assert_eq!(p.n_ubatch, 256);
        assert_eq!(p.n_seq_max, 16);
        assert_eq!(p.n_threads, 8);
        assert!(p.kv_unified);
        assert!(p.swa_full);
    }
}
