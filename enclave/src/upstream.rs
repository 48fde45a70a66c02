// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Buffered HTTPS client used by the KMS proxy.
//!
//! KMS bodies are small and must be inspected and rewritten whole, so the
//! client trades streaming for simplicity: one fully-buffered request in, one
//! fully-buffered response out. TLS terminates here, inside the enclave; the
//! parent only ever sees ciphertext through the tunnel.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full, Limited};
use hyper::client::conn::http1 as http1_client;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use caisson_common::Error;

use crate::constants::KMS_BODY_LIMIT;
use crate::egress::EgressDialer;

/// One buffered HTTPS round trip.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error>;
}

pub struct TlsTunnelClient {
    dialer: Arc<dyn EgressDialer>,
    tls: TlsConnector,
}

impl TlsTunnelClient {
    pub fn new(dialer: Arc<dyn EgressDialer>) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            dialer,
            tls: TlsConnector::from(Arc::new(config)),
        }
    }
}

#[async_trait]
impl UpstreamClient for TlsTunnelClient {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        let host = req
            .uri()
            .host()
            .ok_or_else(|| Error::UpstreamUnavailable("request has no host".to_string()))?
            .to_string();
        let port = req.uri().port_u16().unwrap_or(443);

        let stream = self.dialer.dial(&host, port).await?;

        let server_name = ServerName::try_from(host.clone())
            .map_err(|err| Error::UpstreamUnavailable(format!("bad server name: {err}")))?;
        let tls_stream = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|err| Error::UpstreamUnavailable(format!("TLS to {host}: {err}")))?;

        let (mut sender, conn) = http1_client::Builder::new()
            .handshake(TokioIo::new(tls_stream))
            .await
            .map_err(|err| Error::UpstreamUnavailable(format!("handshake with {host}: {err}")))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = into_origin_form(req, &host, port)?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| Error::UpstreamUnavailable(format!("request to {host}: {err}")))?;

        let (parts, body) = response.into_parts();
        let collected = Limited::new(body, KMS_BODY_LIMIT)
            .collect()
            .await
            .map_err(|err| Error::UpstreamUnavailable(format!("response from {host}: {err}")))?;

        Ok(Response::from_parts(parts, collected.to_bytes()))
    }
}

/// Converts an absolute-form request into the origin-form + Host header shape
/// an HTTP/1.1 origin server expects.
fn into_origin_form(req: Request<Bytes>, host: &str, port: u16) -> Result<Request<Full<Bytes>>, Error> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::builder()
        .path_and_query(path_and_query)
        .build()
        .map_err(|err| Error::UpstreamUnavailable(err.to_string()))?;

    let host_header = if port == 443 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    parts.headers.insert(
        http::header::HOST,
        HeaderValue::from_str(&host_header)
            .map_err(|err| Error::UpstreamUnavailable(err.to_string()))?,
    );

    Ok(Request::from_parts(parts, Full::new(body)))
}
