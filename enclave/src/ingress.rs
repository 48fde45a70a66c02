// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Ingress forwarding inside the enclave: host-socket port `p` to the
//! workload's loopback listener on the same port.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use caisson_common::constants::EGRESS_PORT;
use caisson_common::forward::{StreamForwarder, TcpDialer};
use caisson_common::manifest::Ingress;
use caisson_common::transport::Transport;
use caisson_common::Error;

pub struct IngressService {
    tasks: Vec<JoinHandle<()>>,
}

impl IngressService {
    /// Binds one host-socket listener per ingress port. Binding failures are
    /// fatal at startup.
    pub async fn start(
        transport: Transport,
        ingress: &[Ingress],
        shutdown: CancellationToken,
    ) -> Result<Self, Error> {
        let mut tasks = Vec::with_capacity(ingress.len());

        for item in ingress {
            let port = item.listen_port;
            let listener = transport.listen(port as u32).await?;
            tracing::info!("[enclave] ingress listening on host-socket {port}");

            let forwarder = StreamForwarder::new(
                format!("ingress:{port}"),
                Arc::new(TcpDialer {
                    addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
                }),
            );
            tasks.push(tokio::spawn(forwarder.serve(listener, shutdown.clone())));
        }

        Ok(Self { tasks })
    }

    /// Accepts host-socket connections on the egress port and hands them to
    /// the local HTTP proxy. Covers deployments where the outside reaches the
    /// proxy over the transport instead of the loopback path.
    pub async fn start_egress_companion(
        transport: Transport,
        proxy_port: u16,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, Error> {
        let listener = transport.listen(EGRESS_PORT).await?;

        let forwarder = StreamForwarder::new(
            "egress-companion",
            Arc::new(TcpDialer {
                addr: SocketAddr::from((Ipv4Addr::LOCALHOST, proxy_port)),
            }),
        );

        Ok(tokio::spawn(forwarder.serve(listener, shutdown)))
    }

    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
