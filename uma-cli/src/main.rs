//! uma-cli – one framed request over the daemon socket, events to stdout.
//!
//! Exit codes: 0 on eos/metrics, 1 when the server streams an error event,
//! 2 on usage errors, 3 on connect/transport failures.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde::Serialize;

use uma_core::ipc::protocol;

#[derive(Debug, Parser)]
#[command(name = "uma-cli", about = "UMA Serve client (framed JSON over UDS)", version)]
struct Cli {
    /// Daemon socket path.
    #[arg(long = "socket", env = "UMA_SOCK", default_value = "/tmp/uma.sock")]
    socket: PathBuf,

    /// Request id echoed back in events (default: req-<pid>-<unix-ts>).
    #[arg(long)]
    id: Option<String>,

    /// Prompt text (required unless --metrics).
    #[arg(long)]
    prompt: Option<String>,

    /// Generated-token cap for this request.
    #[arg(long = "max-tokens")]
    max_tokens: Option<u32>,

    /// Sampling temperature (0 = greedy).
    #[arg(long = "temp", default_value_t = 0.0)]
    temperature: f32,

    /// Nucleus mass.
    #[arg(long = "top-p", default_value_t = 1.0)]
    top_p: f32,

    /// Collect the full response instead of streaming (server-side hint).
    #[arg(long = "no-stream", action = clap::ArgAction::SetTrue)]
    no_stream: bool,

    /// Fetch the one-shot metrics snapshot instead of generating.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    metrics: bool,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    id: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    top_p: f32,
}

fn default_id() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("req-{}-{}", std::process::id(), ts)
}

fn read_frame(stream: &mut UnixStream) -> anyhow::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if !cli.metrics && cli.prompt.as_deref().unwrap_or("").is_empty() {
        eprintln!("error: --prompt is required (or use --metrics)");
        return ExitCode::from(2);
    }

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(3)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let mut stream = UnixStream::connect(&cli.socket)?;

    let payload = if cli.metrics {
        br#"{"type":"metrics"}"#.to_vec()
    } else {
        let id = cli.id.clone().unwrap_or_else(default_id);
        let request = WireRequest {
            id: &id,
            prompt: cli.prompt.as_deref().unwrap_or(""),
            stream: !cli.no_stream,
            max_tokens: cli.max_tokens,
            temperature: cli.temperature,
            top_p: cli.top_p,
        };
        serde_json::to_vec(&request)?
    };

    let mut framed = Vec::new();
    protocol::write_frame(&mut framed, &payload);
    stream.write_all(&framed)?;

    while let Some(body) = read_frame(&mut stream)? {
        if cli.metrics {
            println!("{}", String::from_utf8_lossy(&body));
            return Ok(ExitCode::SUCCESS);
        }

        let event: serde_json::Value = serde_json::from_slice(&body)?;
        match event["event"].as_str().unwrap_or("") {
            "token" => {
                if let Some(text) = event["text"].as_str() {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
            }
            "eos" => {
                println!();
                return Ok(ExitCode::SUCCESS);
            }
            "error" => {
                let message = event["message"].as_str().unwrap_or("server error");
                let code = event["code"].as_str().unwrap_or("E_UNKNOWN");
                eprintln!("{code}: {message}");
                return Ok(ExitCode::FAILURE);
            }
            _ => println!("{}", String::from_utf8_lossy(&body)),
        }
    }

    Ok(ExitCode::SUCCESS)
}
