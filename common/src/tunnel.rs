// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The connect protocol spoken between the in-enclave egress proxy and the
//! parent-side connector.
//!
//! The enclave opens a host-socket stream to the parent's egress port, sends
//! one [`DialRequest`] frame naming the destination, and waits for a
//! [`DialReply`]. On success the same stream then carries raw bytes to and
//! from the destination.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::frame::{recv_frame, send_frame};
use crate::transport::{HostStream, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialRequest {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialReply {
    Connected,
    Refused { os_code: i32, message: String },
}

impl DialReply {
    pub fn refused(err: &std::io::Error) -> Self {
        Self::Refused {
            os_code: err.raw_os_error().unwrap_or(0),
            message: err.to_string(),
        }
    }
}

/// Opens a tunnel to `host:port` through the parent-side connector listening
/// on the given host-socket port.
pub async fn open_tunnel(
    transport: &Transport,
    egress_port: u32,
    host: &str,
    port: u16,
) -> Result<HostStream, Error> {
    let mut stream = transport.dial_parent(egress_port).await?;

    send_frame(
        &mut stream,
        &DialRequest {
            host: host.to_string(),
            port,
        },
    )
    .await?;

    match recv_frame::<_, DialReply>(&mut stream).await? {
        DialReply::Connected => Ok(stream),
        DialReply::Refused { os_code, message } => Err(Error::UpstreamUnavailable(format!(
            "{host}:{port}: {message} (os error {os_code})"
        ))),
    }
}
