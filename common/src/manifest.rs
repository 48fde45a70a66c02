// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The application manifest baked into every enclave image.
//!
//! Loaded exactly once per process and validated eagerly; a manifest that
//! violates the schema or its invariants is fatal at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::policy::EgressPolicy;

/// The only manifest version this build understands.
pub const SUPPORTED_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: String,
    pub name: String,
    /// Source container reference. Consumed by the image build pipeline only;
    /// carried here because the manifest is a single document.
    pub image: String,
    #[serde(default)]
    pub ingress: Vec<Ingress>,
    #[serde(default)]
    pub egress: EgressRules,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_proxy: Option<KmsProxy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Defaults>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ingress {
    pub listen_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EgressRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KmsProxy {
    pub listen_port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i32>,
}

impl Manifest {
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let manifest: Manifest = serde_yaml::from_slice(raw)
            .map_err(|err| Error::ConfigInvalid(format!("manifest does not parse: {err}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.version != SUPPORTED_VERSION {
            return Err(Error::ConfigInvalid(format!(
                "unsupported manifest version {:?} (only {SUPPORTED_VERSION} is supported)",
                self.version
            )));
        }

        if !is_valid_name(&self.name) {
            return Err(Error::ConfigInvalid(
                "name must consist of alphanumeric characters, '-', '_' or '.' \
                 and start and end with an alphanumeric character"
                    .to_string(),
            ));
        }

        if self.image.is_empty() {
            return Err(Error::ConfigInvalid("image is required".to_string()));
        }

        let mut seen_ports = Vec::new();
        for ingress in &self.ingress {
            if ingress.listen_port == 0 {
                return Err(Error::ConfigInvalid("ingress port must be nonzero".to_string()));
            }
            if seen_ports.contains(&ingress.listen_port) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate ingress port {}",
                    ingress.listen_port
                )));
            }
            seen_ports.push(ingress.listen_port);
        }

        if let Some(kms) = &self.kms_proxy {
            if kms.listen_port == 0 {
                return Err(Error::ConfigInvalid(
                    "kms_proxy.listen_port must be nonzero".to_string(),
                ));
            }
            // Exposing the KMS proxy as ingress would hand its decryption
            // oracle to anyone who can reach the parent.
            if seen_ports.contains(&kms.listen_port) {
                return Err(Error::ConfigInvalid(format!(
                    "kms_proxy.listen_port {} collides with an ingress port",
                    kms.listen_port
                )));
            }
        }

        if let Some(defaults) = &self.defaults {
            if let Some(cpu_count) = defaults.cpu_count {
                if cpu_count < 1 {
                    return Err(Error::ConfigInvalid(format!(
                        "defaults.cpu_count must be at least 1, got {cpu_count}"
                    )));
                }
            }
            if let Some(memory_mb) = defaults.memory_mb {
                if memory_mb < 128 {
                    return Err(Error::ConfigInvalid(format!(
                        "defaults.memory_mb must be at least 128, got {memory_mb}"
                    )));
                }
            }
        }

        // Every egress pattern must compile.
        EgressPolicy::compile(&self.egress)?;

        Ok(())
    }
}

pub async fn load_manifest(path: impl AsRef<Path>) -> Result<Manifest, Error> {
    let path = path.as_ref();
    let raw = tokio::fs::read(path).await.map_err(|err| {
        Error::ConfigInvalid(format!("failed to read {}: {err}", path.display()))
    })?;
    Manifest::parse(&raw)
}

fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return false;
    };
    let Some((&last, middle)) = rest.split_last() else {
        // Single-character names are fine if alphanumeric.
        return first.is_ascii_alphanumeric();
    };

    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && middle
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::{Manifest, SUPPORTED_VERSION};

    const BASIC: &str = r#"
version: v1
name: echo-server
image: registry.example.com/echo:latest
ingress:
  - listen_port: 8000
egress:
  allow:
    - example.com
    - "**.amazonaws.com"
kms_proxy:
  listen_port: 9100
defaults:
  cpu_count: 2
  memory_mb: 512
"#;

    #[test]
    fn parses_a_full_manifest() {
        let manifest = Manifest::parse(BASIC.as_bytes()).unwrap();
        assert_eq!(manifest.version, SUPPORTED_VERSION);
        assert_eq!(manifest.name, "echo-server");
        assert_eq!(manifest.ingress.len(), 1);
        assert_eq!(manifest.ingress[0].listen_port, 8000);
        assert_eq!(manifest.kms_proxy.unwrap().listen_port, 9100);
        assert_eq!(manifest.defaults.unwrap().memory_mb, Some(512));
    }

    #[test]
    fn rejects_unknown_version() {
        let raw = BASIC.replace("version: v1", "version: v2");
        assert!(Manifest::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn rejects_bad_names() {
        for bad in ["", "-leading", "trailing-", "sp ace", "uh$oh"] {
            let raw = BASIC.replace("name: echo-server", &format!("name: \"{bad}\""));
            assert!(Manifest::parse(raw.as_bytes()).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn rejects_kms_port_that_is_also_ingress() {
        let raw = BASIC.replace("listen_port: 9100", "listen_port: 8000");
        let err = Manifest::parse(raw.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn rejects_undersized_resources() {
        let raw = BASIC.replace("memory_mb: 512", "memory_mb: 64");
        assert!(Manifest::parse(raw.as_bytes()).is_err());

        let raw = BASIC.replace("cpu_count: 2", "cpu_count: 0");
        assert!(Manifest::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn rejects_duplicate_ingress_ports() {
        let raw = BASIC.replace(
            "  - listen_port: 8000",
            "  - listen_port: 8000\n  - listen_port: 8000",
        );
        assert!(Manifest::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = format!("{BASIC}\nmystery: true\n");
        assert!(Manifest::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn rejects_bad_egress_patterns() {
        let raw = BASIC.replace("- example.com", "- bad_host");
        assert!(Manifest::parse(raw.as_bytes()).is_err());
    }
}
