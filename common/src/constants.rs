// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Port assignments and paths shared by both sides of the host-socket link.

/// Host-socket port carrying egress connect requests from the enclave to the
/// parent, and the loopback TCP port of the in-enclave HTTP proxy. The same
/// number is used on both sides of the transport.
pub const EGRESS_PORT: u32 = 3128;

/// Host-socket port on which the in-enclave supervisor publishes entrypoint
/// status lines. Kept above the 16-bit range so it can never collide with a
/// proxied TCP port.
pub const STATUS_PORT: u32 = 17000;

/// Host-socket port streaming the application log out of the enclave.
pub const APP_LOG_PORT: u32 = 17001;

/// File name of the manifest baked into the enclave image.
pub const MANIFEST_FILE_NAME: &str = "caisson.yaml";

/// Directory inside the enclave image holding the manifest.
pub const ENCLAVE_CONFIG_DIR: &str = "/etc/caisson";

/// Special egress host literal that refers to the loopback interface of the
/// parent instance rather than a routable name.
pub const PARENT_HOST_LITERAL: &str = "host";
