// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Error kinds shared across the parent and enclave sides.
//!
//! Startup errors (`ConfigInvalid`, `TransportUnavailable`, `VendorCli`,
//! `EntropyUnavailable`) are fatal to the process that hits them.
//! Per-connection errors are logged where they occur and never escalate.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("host-socket transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("vendor CLI error: {0}")]
    VendorCli(String),

    #[error("enclave no longer reported by the vendor CLI")]
    EnclaveDisappeared,

    #[error("egress to {host}:{port} denied by policy")]
    PolicyDenied { host: String, port: u16 },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("attestation unavailable: {0}")]
    AttestationUnavailable(String),

    #[error("recipient envelope decode failed: {0}")]
    EnvelopeDecode(String),

    #[error("recipient envelope decrypt failed")]
    Decrypt,

    #[error("entropy unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
