// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The accept-dial-pump building block behind every straight TCP forward.
//!
//! Listeners and downstream dialers are injected as capabilities so the same
//! loop serves TCP-to-host-socket, host-socket-to-TCP and test wiring alike.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::pump::pump;
use crate::transport::{HostListener, Transport};

/// Object-safe duplex byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxStream = Box<dyn ByteStream>;

/// Capability to open the downstream side of a forwarded connection.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxStream>;
}

/// Capability to accept the upstream side of a forwarded connection.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> io::Result<BoxStream>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<BoxStream> {
        let (stream, _addr) = TcpListener::accept(self).await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Acceptor for HostListener {
    async fn accept(&mut self) -> io::Result<BoxStream> {
        let stream = HostListener::accept(self).await?;
        Ok(Box::new(stream))
    }
}

/// Dials a fixed TCP address.
pub struct TcpDialer {
    pub addr: SocketAddr,
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxStream> {
        Ok(Box::new(TcpStream::connect(self.addr).await?))
    }
}

/// Dials a fixed `(cid, port)` over the host-socket transport.
pub struct HostDialer {
    pub transport: Transport,
    pub cid: u32,
    pub port: u32,
}

#[async_trait]
impl Dialer for HostDialer {
    async fn dial(&self) -> io::Result<BoxStream> {
        let stream = self
            .transport
            .dial_peer(self.cid, self.port)
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::ConnectionRefused, err.to_string()))?;
        Ok(Box::new(stream))
    }
}

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Accept loop that pumps every accepted connection into a freshly dialed
/// downstream.
pub struct StreamForwarder {
    label: String,
    dialer: Arc<dyn Dialer>,
}

impl StreamForwarder {
    pub fn new(label: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            label: label.into(),
            dialer,
        }
    }

    /// Runs until the token fires. Accept failures back off and retry rather
    /// than killing the listener; per-connection failures are logged only.
    pub async fn serve<A: Acceptor>(self, mut acceptor: A, shutdown: CancellationToken) {
        let mut backoff = ACCEPT_BACKOFF_INITIAL;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };

            let conn = match accepted {
                Ok(conn) => {
                    backoff = ACCEPT_BACKOFF_INITIAL;
                    conn
                }
                Err(err) => {
                    tracing::warn!("[{}] accept failed: {err}, backing off", self.label);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
            };

            tracing::debug!("[{}] accepted connection", self.label);

            let dialer = self.dialer.clone();
            let label = self.label.clone();
            let token = shutdown.clone();

            tokio::spawn(async move {
                let downstream = match dialer.dial().await {
                    Ok(downstream) => downstream,
                    Err(err) => {
                        tracing::warn!("[{label}] downstream dial failed: {err}");
                        return;
                    }
                };

                tokio::select! {
                    res = pump(conn, downstream) => {
                        match res {
                            Ok(totals) => tracing::debug!(
                                "[{label}] connection done ({} out, {} back)",
                                totals.a_to_b,
                                totals.b_to_a
                            ),
                            Err(err) => tracing::warn!("[{label}] pump failed: {err}"),
                        }
                    }
                    // Dropping both streams closes them outright.
                    _ = token.cancelled() => {}
                }
            });
        }
    }
}
