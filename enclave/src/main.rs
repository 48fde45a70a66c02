// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The inside supervisor, PID 1 of the enclave.
//!
//! Bring-up is strictly sequential: status/log channels, loopback, entropy,
//! KMS proxy, egress proxy, ingress forwarders, then the workload's original
//! entrypoint. Nothing may serve a request before the entropy pool is seeded.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use caisson_common::constants::{EGRESS_PORT, ENCLAVE_CONFIG_DIR};
use caisson_common::policy::EgressPolicy;
use caisson_common::transport::{Backend, Transport};

use caisson_enclave::attestation::{Attester, UnavailableAttester};
use caisson_enclave::bootstrap;
use caisson_enclave::config::Configuration;
use caisson_enclave::console::{LogChannel, StatusChannel};
use caisson_enclave::constants::PROXY_DRAIN_GRACE;
use caisson_enclave::credentials::ImdsCredentials;
use caisson_enclave::egress::{EgressDialer, HttpProxy, ParentTunnelDialer};
use caisson_enclave::ingress::IngressService;
use caisson_enclave::keyholder::EphemeralKey;
use caisson_enclave::kms::{KmsProxy, KmsProxyConfig, RegionalEndpoints};
use caisson_enclave::launcher::{self, ExitStatus};
use caisson_enclave::upstream::TlsTunnelClient;

#[derive(Debug, Parser)]
#[command(name = "caisson-init", about = "In-enclave supervisor", version)]
struct Options {
    /// Directory holding the baked-in manifest.
    #[arg(long, default_value = ENCLAVE_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Skip loopback and entropy bootstrap (development hosts).
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_bootstrap: bool,

    /// Keep stdio local instead of redirecting it to the log channel.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_console: bool,

    /// The workload's original entrypoint and arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    entrypoint: Vec<OsString>,
}

#[tokio::main]
async fn main() {
    let options = Options::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with_target(false)
        .with_ansi(false)
        .init();

    let transport = Transport::detected();
    let shutdown = CancellationToken::new();

    // Channels come up before anything that can fail, so the parent can
    // observe a failed bring-up instead of a silent death.
    let status = StatusChannel::new();
    let status_task = status.start_serving(transport, shutdown.clone());

    let mut log_task = None;
    if !options.no_console {
        match LogChannel::with_stdio_redirect() {
            Ok(channel) => log_task = Some(channel.start_serving(transport, shutdown.clone())),
            Err(err) => tracing::warn!("[enclave] stdio redirect failed: {err}"),
        }
    }

    let code = match supervise(&options, transport, &shutdown).await {
        Ok(exit) => {
            tracing::info!("[enclave] entrypoint {exit}");
            status.exited(&exit);
            exit.exit_code()
        }
        Err(err) => {
            tracing::error!("[enclave] fatal: {err:#}");
            status.fatal(format!("{err:#}"));
            1
        }
    };

    // Give connected status/log clients a moment to drain the final lines.
    tokio::time::sleep(Duration::from_millis(250)).await;
    shutdown.cancel();
    let _ = status_task.await;
    if let Some(task) = log_task {
        let _ = task.await;
    }

    std::process::exit(code);
}

async fn supervise(
    options: &Options,
    transport: Transport,
    shutdown: &CancellationToken,
) -> anyhow::Result<ExitStatus> {
    let config = Configuration::load(&options.config_dir).await?;
    tracing::info!(
        "[enclave] manifest loaded for {} ({} ingress ports)",
        config.manifest.name,
        config.manifest.ingress.len()
    );

    let attester = open_attester(transport)?;

    if options.no_bootstrap {
        tracing::info!("[enclave] bootstrap skipped by flag");
    } else {
        bootstrap::bring_up(&transport, attester.as_ref()).await?;
        tracing::info!("[enclave] initialized");
    }

    let keys = Arc::new(EphemeralKey::new());

    // The KMS proxy binds before the egress proxy; its credentials are
    // fetched lazily on first use, after egress is up.
    if let Some(kms) = &config.manifest.kms_proxy {
        if !config.has_egress() {
            anyhow::bail!(
                "kms_proxy is configured but egress is not; allow the KMS endpoint \
                 and 169.254.169.254 in egress.allow"
            );
        }

        let dialer: Arc<dyn EgressDialer> = Arc::new(ParentTunnelDialer {
            transport,
            egress_port: EGRESS_PORT,
        });

        let proxy = KmsProxy::bind(
            kms.listen_port,
            KmsProxyConfig {
                client: Arc::new(TlsTunnelClient::new(dialer.clone())),
                keys: keys.clone(),
                attester: attester.clone(),
                credentials: Arc::new(ImdsCredentials::new(dialer)),
                endpoints: Arc::new(RegionalEndpoints),
                policy: Arc::new(EgressPolicy::compile(&config.manifest.egress)?),
            },
        )
        .await?;

        tracing::info!("[enclave] KMS proxy on 127.0.0.1:{}", kms.listen_port);
        tokio::spawn(proxy.serve(shutdown.child_token(), PROXY_DRAIN_GRACE));

        std::env::set_var(
            "AWS_KMS_ENDPOINT",
            format!("http://127.0.0.1:{}", kms.listen_port),
        );
    }

    if config.has_egress() {
        let policy = Arc::new(EgressPolicy::compile(&config.manifest.egress)?);
        let dialer: Arc<dyn EgressDialer> = Arc::new(ParentTunnelDialer {
            transport,
            egress_port: EGRESS_PORT,
        });

        let proxy = HttpProxy::bind(EGRESS_PORT as u16, policy, dialer).await?;
        tracing::info!("[enclave] egress proxy on 127.0.0.1:{EGRESS_PORT}");
        tokio::spawn(proxy.serve(shutdown.child_token(), PROXY_DRAIN_GRACE));

        export_proxy_env(EGRESS_PORT as u16);

        // On the real transport the outside may also reach the proxy over a
        // host socket; the simulation's port space cannot host both sides.
        if transport.backend() == Backend::Vsock {
            IngressService::start_egress_companion(
                transport,
                EGRESS_PORT as u16,
                shutdown.child_token(),
            )
            .await?;
        }
    } else {
        tracing::info!("[enclave] no egress rules, egress proxy not started");
    }

    let _ingress =
        IngressService::start(transport, &config.manifest.ingress, shutdown.child_token()).await?;

    tracing::info!("[enclave] starting entrypoint {:?}", options.entrypoint);
    let exit = launcher::run_entrypoint(options.entrypoint.clone()).await?;

    Ok(exit)
}

fn open_attester(transport: Transport) -> anyhow::Result<Arc<dyn Attester>> {
    #[cfg(target_os = "linux")]
    if transport.backend() == Backend::Vsock {
        use caisson_enclave::attestation::NsmDevice;
        let device = NsmDevice::open()
            .map_err(|err| anyhow::anyhow!("attestation device open failed: {err}"))?;
        return Ok(Arc::new(device));
    }

    let _ = transport;
    tracing::warn!("[enclave] no attestation device; attested KMS calls will fail");
    Ok(Arc::new(UnavailableAttester))
}

fn export_proxy_env(port: u16) {
    let proxy_uri = format!("http://127.0.0.1:{port}");
    for name in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
        std::env::set_var(name, &proxy_uri);
    }

    const NO_PROXY: &str = "localhost,127.0.0.1";
    std::env::set_var("NO_PROXY", NO_PROXY);
    std::env::set_var("no_proxy", NO_PROXY);
}
