// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The in-enclave HTTP egress proxy.
//!
//! The workload's only road out is `HTTP_PROXY`/`HTTPS_PROXY` pointing here.
//! Exactly two shapes are served: `CONNECT host:port`, which is hijacked and
//! pumped raw after a policy check, and plain absolute-form HTTP requests,
//! which are round-tripped. Every destination is resolved through an injected
//! [`EgressDialer`] because the enclave has no network of its own; production
//! uses the parent tunnel, tests dial directly.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as http1_client;
use hyper::server::conn::http1 as http1_server;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use caisson_common::forward::BoxStream;
use caisson_common::policy::{EgressPolicy, Verdict};
use caisson_common::pump::pump;
use caisson_common::transport::Transport;
use caisson_common::tunnel::open_tunnel;
use caisson_common::Error;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Capability to reach a destination outside the enclave.
#[async_trait]
pub trait EgressDialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxStream, Error>;
}

/// Production dialer: a framed connect handshake with the parent-side
/// connector, then raw bytes.
pub struct ParentTunnelDialer {
    pub transport: Transport,
    pub egress_port: u32,
}

#[async_trait]
impl EgressDialer for ParentTunnelDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxStream, Error> {
        let stream = open_tunnel(&self.transport, self.egress_port, host, port).await?;
        Ok(Box::new(stream))
    }
}

/// Dials destinations directly over TCP. For tests and development hosts.
pub struct DirectDialer;

#[async_trait]
impl EgressDialer for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxStream, Error> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|err| Error::UpstreamUnavailable(format!("{host}:{port}: {err}")))?;
        Ok(Box::new(stream))
    }
}

pub struct HttpProxy {
    listener: TcpListener,
    policy: Arc<EgressPolicy>,
    dialer: Arc<dyn EgressDialer>,
}

impl HttpProxy {
    /// Binds the proxy on loopback. Binding failure is fatal at startup.
    pub async fn bind(
        port: u16,
        policy: Arc<EgressPolicy>,
        dialer: Arc<dyn EgressDialer>,
    ) -> Result<Self, Error> {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let listener = TcpListener::bind(addr).await.map_err(|err| {
            Error::TransportUnavailable(format!("failed to bind egress proxy on {addr}: {err}"))
        })?;

        Ok(Self {
            listener,
            policy,
            dialer,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Serves until cancelled, then drains: no new connections are accepted,
    /// and in-flight requests get up to `drain_grace` to finish before their
    /// connections are aborted. Hijacked tunnels are not drained.
    pub async fn serve(self, shutdown: CancellationToken, drain_grace: Duration) {
        let mut connections = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("[egress] connection from {peer}");

                    let policy = self.policy.clone();
                    let dialer = self.dialer.clone();

                    connections.spawn(async move {
                        let service = service_fn(move |req| {
                            let policy = policy.clone();
                            let dialer = dialer.clone();
                            async move {
                                Ok::<_, Infallible>(proxy_request(req, policy, dialer).await)
                            }
                        });

                        if let Err(err) = http1_server::Builder::new()
                            .preserve_header_case(true)
                            .title_case_headers(true)
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await
                        {
                            tracing::debug!("[egress] connection ended: {err}");
                        }
                    });
                }
                Err(err) => tracing::warn!("[egress] accept failed: {err}"),
            }

            // Reap connections that already finished.
            while connections.try_join_next().is_some() {}
        }

        // Stop accepting, then drain within the deadline.
        drop(self.listener);

        let deadline = tokio::time::sleep(drain_grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::debug!("[egress] drain deadline reached, aborting connections");
                    connections.abort_all();
                    break;
                }
                joined = connections.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }

        while connections.join_next().await.is_some() {}
    }
}

async fn proxy_request(
    req: Request<Incoming>,
    policy: Arc<EgressPolicy>,
    dialer: Arc<dyn EgressDialer>,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        handle_connect(req, &policy, dialer).await
    } else {
        match handle_forward(req, &policy, dialer).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!("[egress] forward failed: {err}");
                status_response(StatusCode::BAD_GATEWAY, "upstream unavailable")
            }
        }
    }
}

async fn handle_connect(
    req: Request<Incoming>,
    policy: &EgressPolicy,
    dialer: Arc<dyn EgressDialer>,
) -> Response<ProxyBody> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.clone(),
        None => return status_response(StatusCode::BAD_REQUEST, "CONNECT target is not host:port"),
    };

    let host = authority.host().to_string();
    let port = match authority.port_u16() {
        Some(port) => port,
        None => return status_response(StatusCode::BAD_REQUEST, "CONNECT target is missing a port"),
    };

    if policy.resolve(&host, port) == Verdict::Deny {
        tracing::info!("[egress] CONNECT {host}:{port} denied by policy");
        return blocked_response();
    }

    // Dial before answering so a failure can still become a status code.
    let upstream = match dialer.dial(&host, port).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::debug!("[egress] CONNECT dial {host}:{port} failed: {err}");
            return status_response(StatusCode::BAD_GATEWAY, "upstream unavailable");
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                if let Err(err) = pump(client, upstream).await {
                    tracing::debug!("[egress] tunnel {host}:{port} ended: {err}");
                }
            }
            Err(err) => tracing::warn!("[egress] upgrade failed: {err}"),
        }
    });

    Response::new(empty_body())
}

async fn handle_forward(
    mut req: Request<Incoming>,
    policy: &EgressPolicy,
    dialer: Arc<dyn EgressDialer>,
) -> Result<Response<ProxyBody>, Error> {
    let host = match req.uri().host() {
        Some(host) => host.to_string(),
        None => {
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "proxy requests must use an absolute URI",
            ))
        }
    };
    let port = req.uri().port_u16().unwrap_or(80);

    if policy.resolve(&host, port) == Verdict::Deny {
        tracing::info!("[egress] {} {host}:{port} denied by policy", req.method());
        return Ok(blocked_response());
    }

    let upstream = dialer.dial(&host, port).await?;

    // The upstream sees an origin-form request with a faithful Host header.
    let host_header = match req.uri().port() {
        Some(port) => format!("{host}:{port}"),
        None => host.clone(),
    };
    req.headers_mut().insert(
        http::header::HOST,
        HeaderValue::from_str(&host_header)
            .map_err(|err| Error::UpstreamUnavailable(err.to_string()))?,
    );

    strip_hop_headers(req.headers_mut());

    // An OPTIONS request for the whole server forwards as "*".
    let path_and_query = if req.method() == Method::OPTIONS && is_empty_path(req.uri()) {
        PathAndQuery::from_static("*")
    } else {
        req.uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"))
    };

    *req.uri_mut() = Uri::builder()
        .path_and_query(path_and_query)
        .build()
        .map_err(|err| Error::UpstreamUnavailable(err.to_string()))?;

    let (mut sender, conn) = http1_client::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(upstream))
        .await
        .map_err(|err| Error::UpstreamUnavailable(err.to_string()))?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut response = sender
        .send_request(req)
        .await
        .map_err(|err| Error::UpstreamUnavailable(err.to_string()))?;

    strip_hop_headers(response.headers_mut());

    Ok(response.map(|body| body.boxed()))
}

/// Headers that belong to one hop, never forwarded in either direction.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

fn strip_hop_headers(headers: &mut http::HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn is_empty_path(uri: &Uri) -> bool {
    match uri.path_and_query() {
        Some(pq) => pq.path() == "/" && pq.query().unwrap_or("").is_empty(),
        None => true,
    }
}

fn empty_body() -> ProxyBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::copy_from_slice(message.as_bytes()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

fn blocked_response() -> Response<ProxyBody> {
    status_response(StatusCode::FORBIDDEN, "blocked by egress policy")
}
