// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Timing and resource defaults for the outside supervisor.

use std::time::Duration;

/// Interval between `describe-enclaves` liveness polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long a draining enclave gets before termination is abandoned.
pub const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Retry interval while waiting for the enclave's log channel to come up.
pub const LOG_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Retry interval and cap while waiting for the enclave's status channel.
pub const STATUS_RETRY_INTERVAL: Duration = Duration::from_millis(250);
pub const STATUS_RETRY_LIMIT: u32 = 100;

/// vCPUs handed to the enclave when neither the CLI nor the manifest says.
pub const DEFAULT_CPU_COUNT: i32 = 2;

/// Memory handed to the enclave when neither the CLI nor the manifest says.
pub const DEFAULT_MEMORY_MB: i32 = 4096;

/// Longest log line accepted from the enclave's log channel.
pub const LOG_LINE_MAX_LEN: usize = 4 * 1024;
