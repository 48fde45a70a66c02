// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Ingress forwarding on the parent: host TCP port `p` to host-socket port
//! `p` on the enclave, one stream-forwarder per manifest ingress entry.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use caisson_common::forward::{HostDialer, StreamForwarder};
use caisson_common::manifest::Ingress;
use caisson_common::transport::Transport;
use caisson_common::Error;

pub struct ParentForwarder {
    transport: Transport,
    listen_host: String,
    cid: u32,
}

impl ParentForwarder {
    pub fn new(transport: Transport, listen_host: impl Into<String>, cid: u32) -> Self {
        Self {
            transport,
            listen_host: listen_host.into(),
            cid,
        }
    }

    /// Binds every ingress port and spawns its forwarder. A port that cannot
    /// be bound fails the whole startup; nothing is left half-wired because
    /// the caller cancels the token on error.
    pub async fn spawn_all(
        &self,
        ingress: &[Ingress],
        shutdown: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, Error> {
        let mut tasks = Vec::with_capacity(ingress.len());

        for item in ingress {
            let port = item.listen_port;
            let addr = format!("{}:{port}", self.listen_host);

            let listener = TcpListener::bind(&addr).await.map_err(|err| {
                Error::TransportUnavailable(format!("failed to bind ingress {addr}: {err}"))
            })?;

            tracing::info!("[parent] ingress listening on {addr}");

            let forwarder = StreamForwarder::new(
                format!("ingress:{port}"),
                Arc::new(HostDialer {
                    transport: self.transport,
                    cid: self.cid,
                    port: port as u32,
                }),
            );

            tasks.push(tokio::spawn(forwarder.serve(listener, shutdown.clone())));
        }

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_util::sync::CancellationToken;

    use caisson_common::manifest::Ingress;
    use caisson_common::transport::{Backend, Transport};

    use super::ParentForwarder;

    #[tokio::test]
    async fn bind_conflict_is_fatal() {
        let transport = Transport::new(Backend::Simulated);
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let forwarder = ParentForwarder::new(transport, "127.0.0.1", 16);
        let err = forwarder
            .spawn_all(&[Ingress { listen_port: port }], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to bind"));
    }

    #[tokio::test]
    async fn forwards_tcp_to_the_enclave_side_listener() {
        let transport = Transport::new(Backend::Simulated);

        // Stand in for the enclave side of the transport on port 18543.
        let mut enclave_side = transport.listen(18543).await.unwrap();
        tokio::spawn(async move {
            let mut conn = enclave_side.accept().await.unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let shutdown = CancellationToken::new();
        let forwarder = ParentForwarder::new(transport, "127.0.0.1", 16);
        let tasks = forwarder
            .spawn_all(&[Ingress { listen_port: 18543 }], shutdown.clone())
            .await
            .unwrap();

        let mut client = TcpStream::connect("127.0.0.1:18543").await.unwrap();
        client.write_all(b"through the wall").await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"through the wall");

        shutdown.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
