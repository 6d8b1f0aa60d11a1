//! Standalone bridge process: speaks the host protocol on stdin/stdout and
//! logs to stderr.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use appletd::{APPLETD_VERSION, BridgeConfig, ExitReason, HeadlessHost, run_stdio};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: appletd [--help] [--version]

Serves one document host over stdin/stdout until it sends ShutdownServer
or closes the stream.

Environment:
  APPLETD_LOG                       debug, info, warn or error (default info)
  RUST_LOG                          full filter, overrides APPLETD_LOG
  LOG_FORMAT                        set to json for JSON log lines
  APPLETD_EVAL_TIMEOUT_SECS         script eval reply timeout
  APPLETD_CALL_TIMEOUT_SECS         ticketed call reply timeout
  APPLETD_CONNECT_TIMEOUT_SECS      stream connect timeout
  APPLETD_FLUSH_TIMEOUT_SECS        forced flush timeout
  APPLETD_WRITE_CHUNK               outbound stream chunk size in bytes
";

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("APPLETD_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("appletd={level},appletd_server={level}"))
    };

    // stdout carries frames; logs must never land there.
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn run() -> anyhow::Result<ExitReason> {
    let config = BridgeConfig::from_env().context("invalid configuration")?;
    tracing::debug!(?config, "Configuration loaded");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("appletd")
        .build()
        .context("failed to start runtime")?;
    let result = runtime.block_on(run_stdio(Arc::new(HeadlessHost::new()), config));
    // The stdin reader may still be parked in a blocking read.
    runtime.shutdown_timeout(Duration::from_millis(200));
    Ok(result?)
}

fn main() -> ExitCode {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                print!("{USAGE}");
                return ExitCode::SUCCESS;
            }
            "-V" | "--version" => {
                println!("appletd {APPLETD_VERSION}");
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("appletd: unknown argument {other:?}\n\n{USAGE}");
                return ExitCode::from(2);
            }
        }
    }

    init_tracing();
    tracing::info!(version = APPLETD_VERSION, "Starting appletd");

    match run() {
        Ok(reason) => {
            tracing::info!(?reason, "Bridge stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Bridge failed");
            ExitCode::FAILURE
        }
    }
}
