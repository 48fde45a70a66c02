// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Wrapper around the vendor `nitro-cli` binary.
//!
//! Every interaction with the hypervisor goes through this CLI as a child
//! process with JSON output. The [`VendorCli`] trait exists so the controller
//! can be exercised against a scripted stand-in.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::Command;

use caisson_common::Error;

/// One enclave as reported by `run-enclave` / `describe-enclaves`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveInfo {
    #[serde(rename = "EnclaveName")]
    pub name: String,

    #[serde(rename = "EnclaveID")]
    pub id: String,

    #[serde(rename = "ProcessID")]
    pub process_id: i32,

    #[serde(rename = "EnclaveCID", default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RunEnclaveArgs {
    pub cpu_count: i32,
    pub memory_mb: i32,
    pub eif_path: PathBuf,
    pub cid: Option<u32>,
    pub debug_mode: bool,
}

impl RunEnclaveArgs {
    fn to_args(&self) -> Result<Vec<OsString>, Error> {
        if self.cpu_count < 1 {
            return Err(Error::ConfigInvalid(format!(
                "at least 1 CPU is required, got {}",
                self.cpu_count
            )));
        }

        if self.memory_mb < 64 {
            return Err(Error::ConfigInvalid(format!(
                "at least 64 MiB of memory is required, got {}",
                self.memory_mb
            )));
        }

        if self.eif_path.as_os_str().is_empty() {
            return Err(Error::ConfigInvalid("EIF path must not be empty".to_string()));
        }

        if self.cid == Some(0) {
            return Err(Error::ConfigInvalid("enclave CID must be nonzero".to_string()));
        }

        let mut args = vec![
            OsString::from("run-enclave"),
            OsString::from("--cpu-count"),
            OsString::from(self.cpu_count.to_string()),
            OsString::from("--memory"),
            OsString::from(self.memory_mb.to_string()),
            OsString::from("--eif-path"),
            self.eif_path.clone().into_os_string(),
        ];

        if let Some(cid) = self.cid {
            args.push("--enclave-cid".into());
            args.push(cid.to_string().into());
        }

        if self.debug_mode {
            args.push("--debug-mode".into());
        }

        Ok(args)
    }
}

/// The subset of the vendor CLI the controller needs.
#[async_trait]
pub trait VendorCli: Send + Sync {
    async fn run_enclave(&self, args: RunEnclaveArgs) -> Result<EnclaveInfo, Error>;

    async fn describe_enclaves(&self) -> Result<Vec<EnclaveInfo>, Error>;

    async fn terminate_enclave(&self, enclave_id: &str) -> Result<(), Error>;

    /// Attaches to the enclave's debug console and returns its output stream.
    async fn console(&self, enclave_id: &str)
        -> Result<Box<dyn AsyncRead + Send + Unpin>, Error>;
}

pub struct NitroCli {
    program: String,
}

impl Default for NitroCli {
    fn default() -> Self {
        Self::new()
    }
}

impl NitroCli {
    pub fn new() -> Self {
        Self {
            program: "nitro-cli".to_string(),
        }
    }

    async fn run_and_parse<T>(&self, args: Vec<OsString>) -> Result<T, Error>
    where
        T: serde::de::DeserializeOwned,
    {
        tracing::debug!("[parent] executing {} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| Error::VendorCli(format!("failed to execute {}: {err}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("[parent] {} failed ({}): {stderr}", self.program, output.status);
            return Err(Error::VendorCli(format!(
                "{} {:?} failed with {}",
                self.program,
                args.first().cloned().unwrap_or_default(),
                output.status
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| Error::VendorCli(format!("unparseable {} output: {err}", self.program)))
    }
}

#[derive(Debug, Deserialize)]
struct TerminationStatus {
    #[serde(rename = "Terminated")]
    terminated: bool,
}

#[async_trait]
impl VendorCli for NitroCli {
    async fn run_enclave(&self, args: RunEnclaveArgs) -> Result<EnclaveInfo, Error> {
        self.run_and_parse(args.to_args()?).await
    }

    async fn describe_enclaves(&self) -> Result<Vec<EnclaveInfo>, Error> {
        self.run_and_parse(vec![OsString::from("describe-enclaves")])
            .await
    }

    async fn terminate_enclave(&self, enclave_id: &str) -> Result<(), Error> {
        let status: TerminationStatus = self
            .run_and_parse(vec![
                OsString::from("terminate-enclave"),
                OsString::from("--enclave-id"),
                OsString::from(enclave_id),
            ])
            .await?;

        if status.terminated {
            Ok(())
        } else {
            Err(Error::VendorCli(format!(
                "{} did not terminate enclave {enclave_id}",
                self.program
            )))
        }
    }

    async fn console(
        &self,
        enclave_id: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, Error> {
        tracing::debug!("[parent] attaching console for {enclave_id}");

        let mut child = Command::new(&self.program)
            .args(["console", "--enclave-id", enclave_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| Error::VendorCli(format!("failed to execute {}: {err}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::VendorCli("console produced no stdout".to_string()))?;

        Ok(Box::new(stdout))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::RunEnclaveArgs;

    fn args() -> RunEnclaveArgs {
        RunEnclaveArgs {
            cpu_count: 2,
            memory_mb: 512,
            eif_path: PathBuf::from("/opt/app.eif"),
            cid: Some(17),
            debug_mode: false,
        }
    }

    #[test]
    fn well_formed_args_render_the_full_command_line() {
        let rendered = args().to_args().unwrap();
        let rendered: Vec<_> = rendered.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            rendered,
            vec![
                "run-enclave",
                "--cpu-count",
                "2",
                "--memory",
                "512",
                "--eif-path",
                "/opt/app.eif",
                "--enclave-cid",
                "17",
            ]
        );
    }

    #[test]
    fn debug_mode_appends_the_flag() {
        let mut a = args();
        a.debug_mode = true;
        let rendered = a.to_args().unwrap();
        assert_eq!(rendered.last().unwrap().to_str().unwrap(), "--debug-mode");
    }

    #[test]
    fn resource_floors_are_enforced() {
        let mut a = args();
        a.cpu_count = 0;
        assert!(a.to_args().is_err());

        let mut a = args();
        a.memory_mb = 63;
        assert!(a.to_args().is_err());

        let mut a = args();
        a.eif_path = PathBuf::new();
        assert!(a.to_args().is_err());

        let mut a = args();
        a.cid = Some(0);
        assert!(a.to_args().is_err());
    }

    #[test]
    fn enclave_info_parses_vendor_json() {
        let raw = r#"[{"EnclaveName": "echo", "EnclaveID": "i-abc-enc1", "ProcessID": 4242, "EnclaveCID": 16}]"#;
        let parsed: Vec<super::EnclaveInfo> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "i-abc-enc1");
        assert_eq!(parsed[0].cid, Some(16));
    }
}
