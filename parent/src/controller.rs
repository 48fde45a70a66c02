// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Lifecycle of a single enclave run.
//!
//! ```text
//! Idle -> Launching -> Running -> Exited
//!             |           |
//!             v           v (cancellation)
//!          Failed      Draining -> Exited
//! ```
//!
//! While `Running`, liveness is established by polling `describe-enclaves`;
//! an enclave that stops being reported has exited (or was torn down behind
//! our back), and the controller's only recovery is a controlled shutdown.
//! It never restarts the enclave.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use caisson_common::constants::{APP_LOG_PORT, STATUS_PORT};
use caisson_common::manifest::Manifest;
use caisson_common::transport::Transport;
use caisson_common::Error;

use crate::constants::{
    DRAIN_GRACE, LOG_LINE_MAX_LEN, LOG_RETRY_INTERVAL, POLL_INTERVAL, STATUS_RETRY_INTERVAL,
    STATUS_RETRY_LIMIT,
};
use crate::egress::EgressConnector;
use crate::forwarder::ParentForwarder;
use crate::nitro_cli::{RunEnclaveArgs, VendorCli};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnclaveState {
    Idle,
    Launching,
    Running,
    Draining,
    Exited,
    Failed,
}

/// Descriptor of the running enclave, owned by the controller for the span of
/// one run.
#[derive(Debug)]
pub struct EnclaveDescriptor {
    pub enclave_id: String,
    pub name: String,
    pub process_id: i32,
    pub cid: u32,
    pub ingress: Vec<u16>,
    pub state: EnclaveState,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The enclave was observed gone after a clean run in debug mode.
    Exited,
    /// Liveness polling stopped finding the enclave.
    Disappeared,
    /// `run-enclave` failed; the enclave never came up.
    LaunchFailed(String),
    /// The caller (usually a signal) asked for shutdown.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ControllerOpts {
    pub eif_path: PathBuf,
    pub cpu_count: i32,
    pub memory_mb: i32,
    pub listen_host: String,
    pub debug_mode: bool,
    pub poll_interval: Duration,
    pub drain_grace: Duration,
    pub egress_port: u32,
}

impl ControllerOpts {
    pub fn new(eif_path: PathBuf, cpu_count: i32, memory_mb: i32) -> Self {
        Self {
            eif_path,
            cpu_count,
            memory_mb,
            listen_host: "0.0.0.0".to_string(),
            debug_mode: false,
            poll_interval: POLL_INTERVAL,
            drain_grace: DRAIN_GRACE,
            egress_port: caisson_common::constants::EGRESS_PORT,
        }
    }
}

pub struct Controller {
    cli: Arc<dyn VendorCli>,
    transport: Transport,
    manifest: Manifest,
    opts: ControllerOpts,
}

impl Controller {
    pub fn new(
        cli: Arc<dyn VendorCli>,
        transport: Transport,
        manifest: Manifest,
        opts: ControllerOpts,
    ) -> Self {
        Self {
            cli,
            transport,
            manifest,
            opts,
        }
    }

    /// Launches the enclave and supervises it until it exits, disappears, or
    /// the token fires. The enclave is terminated (best effort, bounded by
    /// the drain grace) before this returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunOutcome, Error> {
        let services = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // The connector must be up before anything inside the enclave can
        // attempt egress, so it starts ahead of run-enclave.
        if self.wants_egress() {
            let connector =
                EgressConnector::bind_port(self.transport, self.opts.egress_port).await?;
            tasks.push(tokio::spawn(connector.serve(services.clone())));
        }

        tracing::info!("[parent] launching enclave from {}", self.opts.eif_path.display());

        let cid = random_cid();

        let launched = self
            .cli
            .run_enclave(RunEnclaveArgs {
                cpu_count: self.opts.cpu_count,
                memory_mb: self.opts.memory_mb,
                eif_path: self.opts.eif_path.clone(),
                cid: Some(cid),
                debug_mode: self.opts.debug_mode,
            })
            .await;

        let info = match launched {
            Ok(info) => info,
            Err(err) => {
                // Terminal: Launching -> Failed.
                tracing::error!("[parent] launch failed: {err}");
                services.cancel();
                join_all(tasks).await;
                return Ok(RunOutcome::LaunchFailed(err.to_string()));
            }
        };

        let mut descriptor = EnclaveDescriptor {
            enclave_id: info.id.clone(),
            name: info.name.clone(),
            process_id: info.process_id,
            cid,
            ingress: self
                .manifest
                .ingress
                .iter()
                .map(|i| i.listen_port)
                .collect(),
            state: EnclaveState::Running,
        };

        tracing::info!(
            "[parent] enclave {} running (pid {}, cid {})",
            descriptor.enclave_id,
            descriptor.process_id,
            descriptor.cid
        );

        let forwarder = ParentForwarder::new(self.transport, &self.opts.listen_host, cid);
        match forwarder
            .spawn_all(&self.manifest.ingress, services.clone())
            .await
        {
            Ok(mut spawned) => tasks.append(&mut spawned),
            Err(err) => {
                // Port conflicts at startup are fatal; take the enclave down.
                self.drain(&mut descriptor, &services).await;
                join_all(tasks).await;
                return Err(err);
            }
        }

        tasks.push(self.spawn_log_stream(descriptor.cid, services.clone()));
        tasks.push(self.spawn_status_watch(descriptor.cid, services.clone()));

        let outcome = if self.opts.debug_mode {
            self.supervise_debug(&descriptor, &cancel).await
        } else {
            self.supervise_polling(&descriptor.enclave_id, &cancel).await
        };

        match outcome {
            RunOutcome::Cancelled => {
                self.drain(&mut descriptor, &services).await;
            }
            _ => {
                descriptor.state = EnclaveState::Exited;
                services.cancel();
            }
        }

        join_all(tasks).await;

        tracing::info!("[parent] enclave {} finished: {outcome:?}", descriptor.enclave_id);
        Ok(outcome)
    }

    fn wants_egress(&self) -> bool {
        !self.manifest.egress.allow.is_empty()
            || !self.manifest.egress.deny.is_empty()
            || self.manifest.kms_proxy.is_some()
    }

    /// Liveness polling; returns when the enclave is gone or we are asked to
    /// stop.
    async fn supervise_polling(&self, enclave_id: &str, cancel: &CancellationToken) -> RunOutcome {
        let mut ticks = tokio::time::interval(self.opts.poll_interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Swallow the immediate first tick; the enclave was just launched.
        ticks.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RunOutcome::Cancelled,
                _ = ticks.tick() => {}
            }

            match self.cli.describe_enclaves().await {
                Ok(running) => {
                    if !running.iter().any(|e| e.id == enclave_id) {
                        tracing::warn!("[parent] enclave {enclave_id} disappeared");
                        return RunOutcome::Disappeared;
                    }
                }
                Err(err) => {
                    // One flaky describe is not a death sentence.
                    tracing::warn!("[parent] describe-enclaves failed: {err}");
                }
            }
        }
    }

    /// Debug mode: attach the vendor console and stream it; no polling.
    async fn supervise_debug(
        &self,
        descriptor: &EnclaveDescriptor,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let console = match self.cli.console(&descriptor.enclave_id).await {
            Ok(console) => console,
            Err(err) => {
                tracing::error!("[parent] console attach failed: {err}");
                return RunOutcome::Exited;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => RunOutcome::Cancelled,
            _ = stream_lines("console", console) => RunOutcome::Exited,
        }
    }

    async fn drain(&self, descriptor: &mut EnclaveDescriptor, services: &CancellationToken) {
        descriptor.state = EnclaveState::Draining;
        tracing::info!("[parent] draining enclave {}", descriptor.enclave_id);

        services.cancel();

        let terminate = self.cli.terminate_enclave(&descriptor.enclave_id);
        match tokio::time::timeout(self.opts.drain_grace, terminate).await {
            Ok(Ok(())) => tracing::info!("[parent] enclave terminated"),
            Ok(Err(err)) => tracing::warn!("[parent] terminate-enclave failed: {err}"),
            Err(_) => tracing::warn!(
                "[parent] terminate-enclave did not finish within {:?}",
                self.opts.drain_grace
            ),
        }

        descriptor.state = EnclaveState::Exited;
    }

    /// Streams the enclave's application log once its channel comes up.
    fn spawn_log_stream(&self, cid: u32, shutdown: CancellationToken) -> JoinHandle<()> {
        let transport = self.transport;

        tokio::spawn(async move {
            let conn = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    dialed = transport.dial_peer(cid, APP_LOG_PORT) => {
                        match dialed {
                            Ok(conn) => break conn,
                            Err(_) => tokio::time::sleep(LOG_RETRY_INTERVAL).await,
                        }
                    }
                }
            };

            tracing::debug!("[parent] connected to enclave log channel");
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = stream_lines("enclave", conn) => {}
            }
        })
    }

    /// Watches the enclave's status channel and logs the reported exit.
    fn spawn_status_watch(&self, cid: u32, shutdown: CancellationToken) -> JoinHandle<()> {
        let transport = self.transport;

        tokio::spawn(async move {
            let mut attempts = 0u32;
            let conn = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    dialed = transport.dial_peer(cid, STATUS_PORT) => {
                        match dialed {
                            Ok(conn) => break conn,
                            Err(_) => {
                                attempts += 1;
                                if attempts >= STATUS_RETRY_LIMIT {
                                    tracing::warn!("[parent] never reached the enclave status channel");
                                    return;
                                }
                                tokio::time::sleep(STATUS_RETRY_INTERVAL).await;
                            }
                        }
                    }
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = watch_status(conn) => {}
            }
        })
    }
}

fn random_cid() -> u32 {
    // 0..=2 are reserved on the host-socket family; enclaves live in [4, 2^32).
    rand::thread_rng().gen_range(4..=u32::MAX)
}

async fn stream_lines<R>(target: &str, stream: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use futures::StreamExt;
    use tokio_util::codec::{FramedRead, LinesCodec};

    let mut framed = FramedRead::new(stream, LinesCodec::new_with_max_length(LOG_LINE_MAX_LEN));
    while let Some(line) = framed.next().await {
        match line {
            Ok(line) => tracing::info!("[{target}] {line}"),
            Err(err) => {
                tracing::warn!("[{target}] log stream error: {err}");
                break;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ReportedStatus {
    Running,
    Exited { code: i32 },
    Signaled { signal: i32 },
    Fatal { error: String },
}

async fn watch_status<R>(stream: R)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use futures::StreamExt;
    use tokio_util::codec::{FramedRead, LinesCodec};

    let mut framed = FramedRead::new(stream, LinesCodec::new_with_max_length(1024));
    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(_) => return,
        };

        match serde_json::from_str::<ReportedStatus>(&line) {
            Ok(ReportedStatus::Running) => {}
            Ok(ReportedStatus::Exited { code }) => {
                tracing::info!("[parent] entrypoint exited with code {code}");
                return;
            }
            Ok(ReportedStatus::Signaled { signal }) => {
                tracing::info!("[parent] entrypoint terminated by signal {signal}");
                return;
            }
            Ok(ReportedStatus::Fatal { error }) => {
                tracing::error!("[parent] enclave reported fatal error: {error}");
                return;
            }
            Err(err) => tracing::warn!("[parent] bad status line: {err}"),
        }
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}
