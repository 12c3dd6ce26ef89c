//! umad – daemon entry point.
//!
//! Startup order:
//! 1. Parse configuration (flags, `UMA_*` environment fallbacks).
//! 2. Initialise tracing.
//! 3. Install the signal-driven shutdown flag.
//! 4. Open the runtime shared library; init the backend.
//! 5. Load the model once; create the shared decoding context.
//! 6. Run the event loop until shutdown.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use uma_core::engine::LlamaRuntime;
use uma_core::server::Server;
use uma_core::Config;
use uma_llama::{Llama, LlamaContextParams, LlamaModelParams};

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_sig: libc::c_int) {
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

fn install_signal_handlers(flag: Arc<AtomicBool>) {
    let _ = SHUTDOWN.set(flag);
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn main() -> ExitCode {
    // Config errors exit 2 (clap does the same for unknown flags).
    let cfg = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let Some(model_path) = cfg.model_path.clone() else {
        eprintln!("error: --model (or UMA_MODEL) is required");
        return ExitCode::from(2);
    };
    if !model_path.exists() {
        eprintln!("error: model file not found: {}", model_path.display());
        return ExitCode::from(2);
    }

    match serve(cfg, model_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal");
            ExitCode::FAILURE
        }
    }
}

fn serve(cfg: Config, model_path: std::path::PathBuf) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "UMA Serve daemon starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(Arc::clone(&shutdown));

    let llama = Llama::open(&cfg.runtime_lib)
        .with_context(|| format!("opening runtime library {}", cfg.runtime_lib.display()))?;
    debug!(system_info = %llama.system_info(), "runtime loaded");
    let _backend = llama.init_backend();

    let model = llama
        .load_model(
            &model_path,
            LlamaModelParams::default()
                .use_mmap(cfg.use_mmap)
                .use_mlock(cfg.use_mlock),
        )
        .with_context(|| format!("loading model {}", model_path.display()))?;
    info!(
        model = %model_path.display(),
        n_ctx = cfg.n_ctx,
        threads = cfg.n_threads,
        mmap = cfg.use_mmap,
        mlock = cfg.use_mlock,
        kv_unified = cfg.kv_unified,
        "model loaded"
    );

    // One decoding context shared by all sessions via disjoint sequence ids.
    let ctx = model
        .new_context(
            LlamaContextParams::default()
                .n_ctx(cfg.n_ctx)
                .n_batch(cfg.n_batch)
                .n_ubatch(cfg.n_ubatch)
                .n_seq_max(cfg.n_seq_max)
                .n_threads(cfg.n_threads)
                .offload_kqv(cfg.offload_kqv)
                .kv_unified(cfg.kv_unified)
                .swa_full(cfg.swa_full),
        )
        .context("creating decoding context")?;
    info!(
        n_ctx_resolved = ctx.n_ctx(),
        n_batch_resolved = ctx.n_batch(),
        n_seq_max = ctx.n_seq_max(),
        "context ready"
    );

    let runtime = LlamaRuntime::new(model, ctx);
    let mut server = Server::new(cfg.clone(), runtime, shutdown)?;
    info!(socket = %cfg.socket_path.display(), "ready; connect with uma-cli --socket");
    server.run()?;

    info!("goodbye");
    Ok(())
}
