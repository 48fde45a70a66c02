// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Parent-side egress connector.
//!
//! The enclave cannot open network connections itself, so its HTTP proxy
//! tunnels every approved destination through here: one dial-request frame,
//! one reply frame, then raw bytes. Policy was already enforced inside the
//! enclave; this side only resolves the special `host` literal and dials.

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use caisson_common::constants::{EGRESS_PORT, PARENT_HOST_LITERAL};
use caisson_common::frame::{recv_frame, send_frame};
use caisson_common::pump::pump;
use caisson_common::transport::{HostListener, HostStream, Transport};
use caisson_common::tunnel::{DialReply, DialRequest};
use caisson_common::Error;

pub struct EgressConnector {
    listener: HostListener,
}

impl EgressConnector {
    /// Binds the host-socket egress port. Failure here is fatal at startup.
    pub async fn bind(transport: Transport) -> Result<Self, Error> {
        Self::bind_port(transport, EGRESS_PORT).await
    }

    pub async fn bind_port(transport: Transport, port: u32) -> Result<Self, Error> {
        let listener = transport.listen(port).await?;
        tracing::info!("[parent] egress connector listening on host-socket {port}");
        Ok(Self { listener })
    }

    /// Serves tunnels until cancelled. Per-connection failures are logged.
    pub async fn serve(mut self, shutdown: CancellationToken) {
        loop {
            let conn = tokio::select! {
                _ = shutdown.cancelled() => break,
                conn = self.listener.accept() => conn,
            };

            match conn {
                Ok(stream) => {
                    let token = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = service_tunnel(stream, token).await {
                            tracing::warn!("[parent] egress tunnel failed: {err}");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!("[parent] egress accept failed: {err}");
                }
            }
        }
    }
}

async fn service_tunnel(mut stream: HostStream, shutdown: CancellationToken) -> Result<(), Error> {
    let request: DialRequest = recv_frame(&mut stream).await?;

    let host = if request.host.eq_ignore_ascii_case(PARENT_HOST_LITERAL) {
        "127.0.0.1"
    } else {
        request.host.as_str()
    };

    match TcpStream::connect((host, request.port)).await {
        Ok(upstream) => {
            send_frame(&mut stream, &DialReply::Connected).await?;
            tracing::debug!("[parent] egress connected to {host}:{}", request.port);

            tokio::select! {
                res = pump(stream, upstream) => {
                    if let Err(err) = res {
                        tracing::debug!("[parent] egress pump ended: {err}");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        }
        Err(err) => {
            tracing::debug!(
                "[parent] egress dial to {host}:{} failed: {err}",
                request.port
            );
            send_frame(&mut stream, &DialReply::refused(&err)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use caisson_common::transport::{Backend, Transport};
    use caisson_common::tunnel::open_tunnel;
    use caisson_common::Error;

    use super::EgressConnector;

    async fn start_connector(port: u32) -> (Transport, CancellationToken) {
        let transport = Transport::new(Backend::Simulated);
        let shutdown = CancellationToken::new();
        let connector = EgressConnector::bind_port(transport, port).await.unwrap();
        tokio::spawn(connector.serve(shutdown.clone()));
        (transport, shutdown)
    }

    #[tokio::test]
    async fn tunnels_to_a_reachable_destination() {
        let (transport, shutdown) = start_connector(18701).await;

        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = upstream.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut tunnel = open_tunnel(&transport, 18701, "127.0.0.1", port)
            .await
            .unwrap();
        tunnel.write_all(b"tunnel vision").await.unwrap();
        tunnel.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        tunnel.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"tunnel vision");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn refused_destination_reports_upstream_unavailable() {
        let (transport, shutdown) = start_connector(18702).await;

        // Grab a port and close it so nothing listens there.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = dead.local_addr().unwrap().port();
        drop(dead);

        let err = open_tunnel(&transport, 18702, "127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn host_literal_resolves_to_parent_loopback() {
        let (transport, shutdown) = start_connector(18703).await;

        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = upstream.accept().await.unwrap();
            sock.write_all(b"local").await.unwrap();
        });

        let mut tunnel = open_tunnel(&transport, 18703, "host", port).await.unwrap();
        let mut buf = Vec::new();
        tunnel.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"local");

        shutdown.cancel();
    }
}
