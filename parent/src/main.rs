// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use caisson_common::manifest::{self, Manifest};
use caisson_common::transport::Transport;
use caisson_parent::constants::{DEFAULT_CPU_COUNT, DEFAULT_MEMORY_MB};
use caisson_parent::controller::{Controller, ControllerOpts, RunOutcome};
use caisson_parent::nitro_cli::NitroCli;

/// Exit codes surfaced to the init system.
const EXIT_OK: u8 = 0;
const EXIT_LAUNCH_FAILED: u8 = 2;
const EXIT_DISAPPEARED: u8 = 3;
const EXIT_SIGINT: u8 = 130;
const EXIT_SIGTERM: u8 = 143;

#[derive(Debug, Parser)]
#[command(name = "caisson", about = "Run a caisson enclave image", version)]
struct Options {
    /// Path to the enclave image file.
    #[arg(long, env = "CAISSON_EIF_PATH")]
    eif_path: PathBuf,

    /// Path to the application manifest.
    #[arg(long, env = "CAISSON_MANIFEST_PATH")]
    manifest_path: PathBuf,

    /// vCPUs for the enclave; falls back to the manifest defaults.
    #[arg(long)]
    cpu_count: Option<i32>,

    /// Memory (MiB) for the enclave; falls back to the manifest defaults.
    #[arg(long)]
    memory_mb: Option<i32>,

    /// Address ingress listeners bind on.
    #[arg(long, default_value = "0.0.0.0", env = "CAISSON_LISTEN_HOST")]
    listen_host: String,

    /// Launch in debug mode and stream the enclave console.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    debug_mode: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with_target(false)
        .init();

    let options = Options::parse();

    match run(options).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("[parent] {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(options: Options) -> anyhow::Result<u8> {
    let manifest = manifest::load_manifest(&options.manifest_path).await?;

    tracing::info!(
        "[parent] loaded manifest for {} ({} ingress ports)",
        manifest.name,
        manifest.ingress.len()
    );

    let cpu_count = pick(options.cpu_count, &manifest, |d| d.cpu_count, DEFAULT_CPU_COUNT);
    let memory_mb = pick(options.memory_mb, &manifest, |d| d.memory_mb, DEFAULT_MEMORY_MB);

    let mut opts = ControllerOpts::new(options.eif_path, cpu_count, memory_mb);
    opts.listen_host = options.listen_host;
    opts.debug_mode = options.debug_mode;

    let cancel = CancellationToken::new();
    let mut signalled = spawn_signal_handler(cancel.clone())?;

    let controller = Controller::new(
        Arc::new(NitroCli::new()),
        Transport::detected(),
        manifest,
        opts,
    );

    let outcome = controller.run(cancel).await?;

    let code = match outcome {
        RunOutcome::Exited => EXIT_OK,
        RunOutcome::LaunchFailed(reason) => {
            tracing::error!("[parent] enclave failed to launch: {reason}");
            EXIT_LAUNCH_FAILED
        }
        RunOutcome::Disappeared => EXIT_DISAPPEARED,
        RunOutcome::Cancelled => match signalled.try_recv() {
            Ok(Signal::Terminate) => EXIT_SIGTERM,
            _ => EXIT_SIGINT,
        },
    };

    Ok(code)
}

fn pick(
    flag: Option<i32>,
    manifest: &Manifest,
    field: impl Fn(&caisson_common::manifest::Defaults) -> Option<i32>,
    fallback: i32,
) -> i32 {
    flag.or_else(|| manifest.defaults.as_ref().and_then(field))
        .unwrap_or(fallback)
}

enum Signal {
    Interrupt,
    Terminate,
}

/// Cancels the token on SIGINT/SIGTERM and records which signal fired.
fn spawn_signal_handler(
    cancel: CancellationToken,
) -> anyhow::Result<tokio::sync::oneshot::Receiver<Signal>> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        let signal = tokio::select! {
            _ = sigint.recv() => Signal::Interrupt,
            _ = sigterm.recv() => Signal::Terminate,
        };
        tracing::info!("[parent] shutdown signal received");
        let _ = tx.send(signal);
        cancel.cancel();
    });

    Ok(rx)
}
