//! codescan - resolve barcodes and QR codes from photos and live cameras.

#[cfg(feature = "camera")]
mod scan;
mod server;

use clap::{Parser, Subcommand};
use codescan_core::{AttemptOutcome, DecodeReport, DecodeRequest, ServiceConfig, load_config};
use codescan_decode::DecodeOrchestrator;
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// codescan - decode barcodes and QR codes with a local-first fallback chain.
#[derive(Parser, Debug)]
#[command(name = "codescan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file (defaults, then this file, then CODESCAN_* env vars)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for per-request scratch files
    #[arg(long, global = true)]
    scratch_dir: Option<PathBuf>,

    /// Overall per-request time budget in seconds
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    /// Vision service timeout in seconds
    #[arg(long, global = true)]
    vision_timeout_secs: Option<u64>,

    /// Never call the vision service, even when an API key is configured
    #[arg(long, global = true)]
    no_vision: bool,

    /// Log every decode attempt
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP upload endpoint
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1", env = "CODESCAN_HOST")]
        host: String,

        /// Port to bind
        #[arg(short, long, default_value_t = 8080, env = "CODESCAN_PORT")]
        port: u16,

        /// Largest accepted upload in bytes
        #[arg(long)]
        max_upload_bytes: Option<usize>,
    },

    /// Decode a single image file
    Decode {
        /// Image to decode
        file: PathBuf,

        /// Print the response JSON and attempt trail
        #[arg(long)]
        json: bool,
    },

    /// Scan codes from a live camera
    #[cfg(feature = "camera")]
    Scan {
        /// List cameras and exit
        #[arg(long)]
        list: bool,

        /// Camera to use instead of the auto-selected one
        #[arg(long)]
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    color_eyre::install()?;

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("codescan=info".parse()?)
        .add_directive("codescan_core=info".parse()?)
        .add_directive("codescan_decode=info".parse()?)
        .add_directive("codescan_capture=info".parse()?);
    if args.verbose {
        env_filter = env_filter.add_directive("codescan_decode=debug".parse()?);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = load_config(args.config.as_deref()).wrap_err("Failed to load configuration")?;
    apply_args(&mut config, &args);
    if let Command::Serve {
        max_upload_bytes: Some(max),
        ..
    } = &args.command
    {
        config.max_upload_bytes = *max;
    }
    config.validate().wrap_err("Invalid configuration")?;

    match args.command {
        Command::Serve { host, port, .. } => {
            let orchestrator = DecodeOrchestrator::from_config(&config)?;
            server::run_server(orchestrator, config.max_upload_bytes, &host, port).await
        }
        Command::Decode { file, json } => run_decode(&config, &file, json).await,
        #[cfg(feature = "camera")]
        Command::Scan { list, device } => {
            tokio::task::block_in_place(|| scan::run_scan(list, device.as_deref()))
        }
    }
}

/// Command-line flags override file and environment settings.
fn apply_args(config: &mut ServiceConfig, args: &Args) {
    if let Some(dir) = &args.scratch_dir {
        config.scratch_dir = dir.clone();
    }
    if let Some(secs) = args.deadline_secs {
        config.request_deadline_secs = Some(secs);
    }
    if let Some(secs) = args.vision_timeout_secs {
        config.vision.timeout_secs = secs;
    }
    if args.no_vision {
        config.vision.api_key = None;
    }
}

async fn run_decode(config: &ServiceConfig, file: &Path, json: bool) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
    let orchestrator = DecodeOrchestrator::from_config(config)?;

    let request = DecodeRequest::new(bytes, content_type_for(file));
    let report = orchestrator.decode(&request).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
    } else {
        for (strategy, outcome) in report.trail() {
            eprintln!("  {:<16} {}", strategy.label(), describe(outcome));
        }
        match report.result.text() {
            Some(text) => println!("{}", text),
            None => {
                if let Some(kind) = report.result.error_kind() {
                    eprintln!("{}", kind.user_message());
                }
            }
        }
    }

    if !report.result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn report_json(report: &DecodeReport) -> serde_json::Value {
    let attempts: Vec<_> = report
        .attempts
        .iter()
        .map(|a| {
            serde_json::json!({
                "strategy": a.strategy.label(),
                "outcome": describe(&a.outcome),
                "usedOriginal": a.used_original,
            })
        })
        .collect();
    serde_json::json!({
        "token": report.token.to_string(),
        "response": report.result.to_response(),
        "attempts": attempts,
    })
}

fn describe(outcome: &AttemptOutcome) -> String {
    match outcome {
        AttemptOutcome::Decoded(text) => format!("decoded {:?}", text),
        AttemptOutcome::NoCodeFound => "no code".to_string(),
        AttemptOutcome::ProcessingError(e) => format!("error: {}", e),
        AttemptOutcome::ServiceFailure { kind, message } => format!("{}: {}", kind, message),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("heic") | Some("heif") => "image/heic",
        _ => "application/octet-stream",
    }
}
