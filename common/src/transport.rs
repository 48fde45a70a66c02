// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Typed dial/listen over the enclave's host-socket family.
//!
//! Two backends sit behind [`Transport`]: the real vsock device, and a
//! TCP-on-loopback simulation for development hosts without enclave hardware.
//! The simulation maps `(cid, port)` onto `127.0.0.1:(port + 3573)`; the cid
//! is ignored because a host runs at most one enclave.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(target_os = "linux")]
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

use crate::error::Error;

/// Context id of the parent instance on the host-socket family.
pub const PARENT_CID: u32 = 3;

/// Wildcard context id used when listening inside the enclave.
pub const CID_ANY: u32 = 0xFFFF_FFFF;

/// Port offset applied by the simulation backend to reduce the likelihood of
/// collisions with real services on the development host.
const SIM_PORT_OFFSET: u32 = 3573;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The real host-socket device.
    Vsock,
    /// TCP on loopback with a fixed port offset.
    Simulated,
}

impl Backend {
    /// Picks the vsock backend when the device node is present, otherwise
    /// falls back to the simulation.
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") && Path::new("/dev/vsock").exists() {
            Backend::Vsock
        } else {
            Backend::Simulated
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Transport {
    backend: Backend,
}

impl Transport {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn detected() -> Self {
        Self::new(Backend::detect())
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Dials the parent side of the transport on the given port.
    pub async fn dial_parent(&self, port: u32) -> Result<HostStream, Error> {
        self.dial_peer(PARENT_CID, port).await
    }

    /// Dials an arbitrary `(cid, port)` peer.
    pub async fn dial_peer(&self, cid: u32, port: u32) -> Result<HostStream, Error> {
        match self.backend {
            #[cfg(target_os = "linux")]
            Backend::Vsock => {
                let stream = VsockStream::connect(VsockAddr::new(cid, port))
                    .await
                    .map_err(|err| unavailable("dial", cid, port, &err))?;
                Ok(HostStream::Vsock(stream))
            }
            #[cfg(not(target_os = "linux"))]
            Backend::Vsock => Err(Error::TransportUnavailable(
                "vsock is only available on linux".to_string(),
            )),
            Backend::Simulated => {
                let stream = TcpStream::connect(sim_addr(port))
                    .await
                    .map_err(|err| unavailable("dial", cid, port, &err))?;
                Ok(HostStream::Tcp(stream))
            }
        }
    }

    /// Binds a listener on the given port. The enclave side listens on the
    /// wildcard context id.
    pub async fn listen(&self, port: u32) -> Result<HostListener, Error> {
        match self.backend {
            #[cfg(target_os = "linux")]
            Backend::Vsock => {
                let listener = VsockListener::bind(VsockAddr::new(CID_ANY, port))
                    .map_err(|err| unavailable("listen", CID_ANY, port, &err))?;
                Ok(HostListener::Vsock(listener))
            }
            #[cfg(not(target_os = "linux"))]
            Backend::Vsock => Err(Error::TransportUnavailable(
                "vsock is only available on linux".to_string(),
            )),
            Backend::Simulated => {
                let listener = TcpListener::bind(sim_addr(port))
                    .await
                    .map_err(|err| unavailable("listen", CID_ANY, port, &err))?;
                Ok(HostListener::Tcp(listener))
            }
        }
    }
}

fn sim_addr(port: u32) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::LOCALHOST,
        (port + SIM_PORT_OFFSET) as u16,
    ))
}

fn unavailable(op: &str, cid: u32, port: u32, err: &io::Error) -> Error {
    Error::TransportUnavailable(format!("{op} cid={cid} port={port}: {err}"))
}

/// A connected host-socket byte stream from either backend.
#[derive(Debug)]
pub enum HostStream {
    #[cfg(target_os = "linux")]
    Vsock(VsockStream),
    Tcp(TcpStream),
}

pub enum HostListener {
    #[cfg(target_os = "linux")]
    Vsock(VsockListener),
    Tcp(TcpListener),
}

impl HostListener {
    pub async fn accept(&mut self) -> io::Result<HostStream> {
        match self {
            #[cfg(target_os = "linux")]
            HostListener::Vsock(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(HostStream::Vsock(stream))
            }
            HostListener::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(HostStream::Tcp(stream))
            }
        }
    }
}

impl AsyncRead for HostStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(target_os = "linux")]
            HostStream::Vsock(s) => Pin::new(s).poll_read(cx, buf),
            HostStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HostStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(target_os = "linux")]
            HostStream::Vsock(s) => Pin::new(s).poll_write(cx, buf),
            HostStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(target_os = "linux")]
            HostStream::Vsock(s) => Pin::new(s).poll_flush(cx),
            HostStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(target_os = "linux")]
            HostStream::Vsock(s) => Pin::new(s).poll_shutdown(cx),
            HostStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{Backend, Transport};

    #[tokio::test]
    async fn simulated_dial_reaches_simulated_listener() {
        let transport = Transport::new(Backend::Simulated);
        let mut listener = transport.listen(18231).await.unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut conn = transport.dial_peer(16, 18231).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn simulated_dial_without_listener_is_unavailable() {
        let transport = Transport::new(Backend::Simulated);
        let err = transport.dial_parent(18977).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::TransportUnavailable(_)
        ));
    }
}
