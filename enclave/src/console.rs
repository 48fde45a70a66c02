// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Status and log channels toward the parent.
//!
//! The status channel publishes one JSON line per state change (`running`,
//! `exited`, `signaled`, `fatal`) to every connected host-socket client. The
//! log channel captures the process's own stdout/stderr (which the workload
//! inherits) through a pipe and fans the bytes out to host-socket clients;
//! clients that fall behind miss bytes rather than stalling the enclave.

use std::os::fd::{AsRawFd, OwnedFd};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use caisson_common::constants::{APP_LOG_PORT, STATUS_PORT};
use caisson_common::transport::Transport;
use caisson_common::Error;

use crate::launcher::ExitStatus;

const LOG_CHUNK: usize = 16 * 1024;
const LOG_BACKLOG: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum EntrypointStatus {
    Running,
    Exited { code: i32 },
    Signaled { signal: i32 },
    Fatal { error: String },
}

/// Publishes the entrypoint's lifecycle to host-socket clients.
#[derive(Clone)]
pub struct StatusChannel {
    tx: watch::Sender<EntrypointStatus>,
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusChannel {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(EntrypointStatus::Running);
        Self { tx }
    }

    pub fn exited(&self, status: &ExitStatus) {
        let update = match status {
            ExitStatus::Exited(code) => EntrypointStatus::Exited { code: *code },
            ExitStatus::Signaled(signal) => EntrypointStatus::Signaled { signal: *signal },
        };
        let _ = self.tx.send(update);
    }

    pub fn fatal(&self, error: String) {
        let _ = self.tx.send(EntrypointStatus::Fatal { error });
    }

    /// Serves the status stream on the host-socket status port.
    pub fn start_serving(
        &self,
        transport: Transport,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<(), Error>> {
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let mut listener = transport.listen(STATUS_PORT).await?;
            tracing::debug!("[enclave] status channel on host-socket {STATUS_PORT}");

            loop {
                let conn = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    conn = listener.accept() => conn,
                };

                match conn {
                    Ok(mut stream) => {
                        let mut rx = tx.subscribe();
                        let token = shutdown.clone();

                        tokio::spawn(async move {
                            loop {
                                let line = {
                                    let status = rx.borrow_and_update();
                                    match serde_json::to_string(&*status) {
                                        Ok(line) => line,
                                        Err(_) => break,
                                    }
                                };

                                if stream.write_all(line.as_bytes()).await.is_err() {
                                    break;
                                }
                                if stream.write_all(b"\n").await.is_err() {
                                    break;
                                }

                                tokio::select! {
                                    _ = token.cancelled() => break,
                                    changed = rx.changed() => {
                                        if changed.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                    Err(err) => tracing::warn!("[enclave] status accept failed: {err}"),
                }
            }

            Ok(())
        })
    }
}

/// Captures process stdio into a pipe and streams it to host-socket clients.
pub struct LogChannel {
    tx: broadcast::Sender<Bytes>,
    // Keeps the write end of the pipe open for the life of the process.
    _write_end: OwnedFd,
}

impl LogChannel {
    /// Redirects this process's stdout and stderr into the channel. The
    /// workload inherits the redirected descriptors.
    pub fn with_stdio_redirect() -> Result<Self, Error> {
        let (read_end, write_end) = nix::unistd::pipe()
            .map_err(|err| Error::Io(std::io::Error::from(err)))?;

        nix::unistd::dup2(write_end.as_raw_fd(), libc::STDOUT_FILENO)
            .map_err(|err| Error::Io(std::io::Error::from(err)))?;
        nix::unistd::dup2(write_end.as_raw_fd(), libc::STDERR_FILENO)
            .map_err(|err| Error::Io(std::io::Error::from(err)))?;

        let (tx, _rx) = broadcast::channel(LOG_BACKLOG);

        let reader = std::fs::File::from(read_end);
        let pump_tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = tokio::fs::File::from_std(reader);
            let mut buf = vec![0u8; LOG_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        // No receivers is fine; bytes just fall on the floor.
                        let _ = pump_tx.send(Bytes::copy_from_slice(&buf[..n]));
                    }
                }
            }
        });

        Ok(Self {
            tx,
            _write_end: write_end,
        })
    }

    /// Serves the log stream on the host-socket log port.
    pub fn start_serving(
        &self,
        transport: Transport,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<(), Error>> {
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let mut listener = transport.listen(APP_LOG_PORT).await?;

            loop {
                let conn = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    conn = listener.accept() => conn,
                };

                match conn {
                    Ok(mut stream) => {
                        let mut rx = tx.subscribe();
                        let token = shutdown.clone();

                        tokio::spawn(async move {
                            loop {
                                let chunk = tokio::select! {
                                    _ = token.cancelled() => break,
                                    chunk = rx.recv() => chunk,
                                };

                                match chunk {
                                    Ok(bytes) => {
                                        if stream.write_all(&bytes).await.is_err() {
                                            break;
                                        }
                                    }
                                    // A slow client skips what it missed.
                                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                    Err(broadcast::error::RecvError::Closed) => break,
                                }
                            }
                        });
                    }
                    Err(err) => tracing::warn!("[enclave] log accept failed: {err}"),
                }
            }

            Ok(())
        })
    }
}
