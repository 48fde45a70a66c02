// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Configuration constants for the inside supervisor.

use std::time::Duration;

/// Bytes of device entropy written into the kernel pool during bootstrap.
pub const ENTROPY_SEED_BYTES: usize = 1024;

/// Where the entropy seed is written.
pub const DEV_RANDOM: &str = "/dev/random";

/// Nonce length attached to every attestation request.
pub const ATTESTATION_NONCE_BYTES: usize = 32;

/// Largest request or response body the KMS proxy will buffer.
pub const KMS_BODY_LIMIT: usize = 1024 * 1024;

/// How long in-flight proxy requests get to finish during shutdown.
pub const PROXY_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Time-to-live requested for IMDSv2 session tokens.
pub const IMDS_TOKEN_TTL_SECONDS: u32 = 300;

/// Credentials are refreshed this long before they would expire.
pub const CREDENTIAL_REFRESH_BUFFER: Duration = Duration::from_secs(60);

/// Link-local address of the instance metadata service, reached through the
/// parent.
pub const IMDS_HOST: &str = "169.254.169.254";
