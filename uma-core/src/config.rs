//! Daemon configuration, from flags with environment fallbacks.
//!
//! Every option has an `UMA_*` environment mirror; flags win. Unknown flags
//! are rejected by the parser (exit code 2).

use std::path::PathBuf;

use clap::{ArgAction, Parser};

fn parse_octal_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|e| format!("not an octal file mode: {e}"))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "umad", about = "UMA Serve inference daemon", version)]
pub struct Config {
    /// Path to the model weights (.gguf).
    #[arg(long = "model", env = "UMA_MODEL")]
    pub model_path: Option<PathBuf>,

    /// Shared library exporting the model runtime.
    #[arg(long = "runtime-lib", env = "UMA_RUNTIME_LIB", default_value = "libllama.so")]
    pub runtime_lib: PathBuf,

    /// KV context window in tokens.
    #[arg(long = "n-ctx", env = "UMA_N_CTX", default_value_t = 4096)]
    pub n_ctx: u32,

    /// Compute threads (0 = runtime default).
    #[arg(long = "threads", env = "UMA_THREADS", default_value_t = 0)]
    pub n_threads: i32,

    /// Logical batch size.
    #[arg(long = "n-batch", env = "UMA_N_BATCH", default_value_t = 2048)]
    pub n_batch: u32,

    /// Physical micro-batch size (0 = same as n-batch).
    #[arg(long = "n-ubatch", env = "UMA_N_UBATCH", default_value_t = 512)]
    pub n_ubatch: u32,

    /// Maximum concurrent KV sequences.
    #[arg(long = "n-seq-max", env = "UMA_N_SEQ_MAX", default_value_t = 64)]
    pub n_seq_max: u32,

    /// Unix-domain socket path.
    #[arg(long = "socket", env = "UMA_SOCK", default_value = "/tmp/uma.sock")]
    pub socket_path: PathBuf,

    /// Socket file mode, octal.
    #[arg(long = "socket-mode", env = "UMA_SOCK_MODE", default_value = "600", value_parser = parse_octal_mode)]
    pub socket_mode: u32,

    /// Connection cap; further clients are rejected at accept.
    #[arg(long = "max-sessions", env = "UMA_MAX_SESSIONS", default_value_t = 32)]
    pub max_sessions: usize,

    /// Per-request prompt byte limit.
    #[arg(long = "max-prompt-bytes", env = "UMA_MAX_PROMPT_BYTES", default_value_t = 128 * 1024)]
    pub max_prompt_bytes: usize,

    /// Per-request generated-token cap (requests may ask for less).
    #[arg(long = "max-tokens", env = "UMA_MAX_TOKENS", default_value_t = 512)]
    pub max_tokens: u32,

    /// Frame payload ceiling in bytes.
    #[arg(long = "max-frame-bytes", env = "UMA_MAX_FRAME_BYTES", default_value_t = 1024 * 1024)]
    pub max_frame_bytes: usize,

    /// Reap sessions idle longer than this (0 disables the sweep).
    #[arg(long = "idle-timeout-sec", env = "UMA_IDLE_TIMEOUT_SEC", default_value_t = 300)]
    pub idle_timeout_sec: u64,

    /// Time-to-first-token target, observability only.
    #[arg(long = "slo-ttft-ms", env = "UMA_SLO_TTFT_MS", default_value_t = 500)]
    pub slo_ttft_ms: u32,

    /// Time-between-tokens target, observability only.
    #[arg(long = "slo-tbt-ms", env = "UMA_SLO_TBT_MS", default_value_t = 100)]
    pub slo_tbt_ms: u32,

    /// Memory-map model weights.
    #[arg(long = "use-mmap", env = "UMA_USE_MMAP", default_value_t = true, action = ArgAction::Set)]
    pub use_mmap: bool,

    /// Lock model weights in RAM.
    #[arg(long = "use-mlock", env = "UMA_USE_MLOCK", default_value_t = false, action = ArgAction::Set)]
    pub use_mlock: bool,

    /// Offload the KV cache alongside the weights.
    #[arg(long = "offload-kqv", env = "UMA_OFFLOAD_KQV", default_value_t = true, action = ArgAction::Set)]
    pub offload_kqv: bool,

    /// Unified KV buffer across sequences.
    #[arg(long = "kv-unified", env = "UMA_KV_UNIFIED", default_value_t = true, action = ArgAction::Set)]
    pub kv_unified: bool,

    /// Keep the full sliding-window cache resident.
    #[arg(long = "swa-full", env = "UMA_SWA_FULL", default_value_t = true, action = ArgAction::Set)]
    pub swa_full: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut full = vec!["umad"];
        full.extend_from_slice(args);
        Config::parse_from(full)
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = parse(&[]);
        assert!(cfg.model_path.is_none());
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/uma.sock"));
        assert_eq!(cfg.socket_mode, 0o600);
        assert_eq!(cfg.n_ctx, 4096);
        assert_eq!(cfg.max_frame_bytes, 1024 * 1024);
        assert!(cfg.use_mmap);
        assert!(!cfg.use_mlock);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = parse(&[
            "--model",
            "/models/tiny.gguf",
            "--n-ctx",
            "8192",
            "--socket",
            "/run/uma/u.sock",
            "--socket-mode",
            "660",
            "--use-mmap",
            "false",
        ]);
        assert_eq!(cfg.model_path, Some(PathBuf::from("/models/tiny.gguf")));
        assert_eq!(cfg.n_ctx, 8192);
        assert_eq!(cfg.socket_mode, 0o660);
        assert!(!cfg.use_mmap);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let result = Config::try_parse_from(["umad", "--definitely-not-a-flag"]);
        assert!(result.is_err());
    }

    #[test]
    fn socket_mode_must_be_octal() {
        let result = Config::try_parse_from(["umad", "--socket-mode", "9x9"]);
        assert!(result.is_err());
    }
}
