// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Runs the workload's original entrypoint and collects its exit status.
//!
//! Waiting happens on the blocking tier with `waitpid`, not through tokio's
//! process machinery, because as PID 1 this process must also reap every
//! orphaned descendant in the enclave and the two reapers would race.

use std::ffi::OsString;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Command;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use caisson_common::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    /// The code this supervisor should itself exit with.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + signal,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {code}"),
            ExitStatus::Signaled(signal) => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// Spawns the entrypoint in its own process group and waits for it.
pub async fn run_entrypoint(argv: Vec<OsString>) -> Result<ExitStatus, Error> {
    tokio::task::spawn_blocking(move || supervise(&argv))
        .await
        .map_err(|err| {
            Error::Io(std::io::Error::other(format!("entrypoint task failed: {err}")))
        })?
}

fn supervise(argv: &[OsString]) -> Result<ExitStatus, Error> {
    let (program, args) = argv.split_first().ok_or_else(|| {
        Error::ConfigInvalid("entrypoint command is empty".to_string())
    })?;

    let child = Command::new(program)
        .args(args)
        .process_group(0)
        .spawn()
        .map_err(Error::Io)?;

    let child_pid = Pid::from_raw(child.id() as i32);
    tracing::debug!("[enclave] entrypoint started as pid {child_pid}");

    if nix::unistd::getpid().as_raw() == 1 {
        reap_descendants(child_pid)
    } else {
        wait_direct(child)
    }
}

/// Non-PID-1 case: wait on the direct child only.
fn wait_direct(mut child: std::process::Child) -> Result<ExitStatus, Error> {
    let status = child.wait().map_err(Error::Io)?;

    if let Some(code) = status.code() {
        Ok(ExitStatus::Exited(code))
    } else {
        Ok(ExitStatus::Signaled(status.signal().unwrap_or(0)))
    }
}

/// PID-1 case: reap every zombie until the sentinel child is collected.
fn reap_descendants(sentinel: Pid) -> Result<ExitStatus, Error> {
    loop {
        let status = waitpid(None, None).map_err(|err| {
            Error::Io(std::io::Error::other(format!("waitpid failed: {err}")))
        })?;

        match status {
            WaitStatus::Exited(pid, code) => {
                tracing::debug!("[enclave] reaped pid {pid}");
                if pid == sentinel {
                    return Ok(ExitStatus::Exited(code));
                }
            }
            WaitStatus::Signaled(pid, signal, _core) => {
                tracing::debug!("[enclave] reaped pid {pid}");
                if pid == sentinel {
                    return Ok(ExitStatus::Signaled(signal as i32));
                }
            }
            _ => {}
        }
    }
}
