// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Enclave-side configuration: the manifest baked into the image.

use std::path::{Path, PathBuf};

use caisson_common::constants::MANIFEST_FILE_NAME;
use caisson_common::manifest::{load_manifest, Manifest};
use caisson_common::Error;

#[derive(Debug)]
pub struct Configuration {
    pub config_dir: PathBuf,
    pub manifest: Manifest,
}

impl Configuration {
    pub async fn load(config_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let manifest = load_manifest(config_dir.join(MANIFEST_FILE_NAME)).await?;

        Ok(Self {
            config_dir,
            manifest,
        })
    }

    pub fn has_egress(&self) -> bool {
        !self.manifest.egress.allow.is_empty() || !self.manifest.egress.deny.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::Configuration;

    #[tokio::test]
    async fn loads_the_manifest_from_the_config_dir() {
        let dir = std::env::temp_dir().join(format!("caisson-config-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join(caisson_common::constants::MANIFEST_FILE_NAME),
            "version: v1\nname: probe\nimage: registry.example.com/probe\n",
        )
        .await
        .unwrap();

        let config = Configuration::load(&dir).await.unwrap();
        assert_eq!(config.manifest.name, "probe");
        assert!(!config.has_egress());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_manifest_is_a_config_error() {
        let err = Configuration::load("/definitely/not/a/dir").await.unwrap_err();
        assert!(matches!(err, caisson_common::Error::ConfigInvalid(_)));
    }
}
