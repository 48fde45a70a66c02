// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The ephemeral RSA keypair used as the recipient identity in attested KMS
//! calls.
//!
//! The pair is generated at most once per process, on first demand. Callers
//! that race the first use all observe the same key; if generation fails, the
//! original error is returned to every subsequent caller as well.

use std::sync::Arc;

use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::OnceCell;

const RSA_KEY_BITS: usize = 2048;

#[derive(thiserror::Error, Debug, Clone)]
#[error("ephemeral key generation failed: {0}")]
pub struct KeyInitError(String);

/// The generated pair plus its serialized public half.
pub struct KeyMaterial {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    spki_der: Vec<u8>,
}

impl KeyMaterial {
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// SubjectPublicKeyInfo DER encoding of the public half, the form the
    /// attestation document embeds.
    pub fn public_key_der(&self) -> &[u8] {
        &self.spki_der
    }
}

/// Lazily-initialized process-lifetime keyholder.
#[derive(Default)]
pub struct EphemeralKey {
    cell: OnceCell<Result<Arc<KeyMaterial>, KeyInitError>>,
}

impl EphemeralKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the key material, generating it on first call. Concurrent
    /// first callers are serialized; exactly one generation attempt is made.
    pub async fn material(&self) -> Result<Arc<KeyMaterial>, KeyInitError> {
        self.cell
            .get_or_init(|| async {
                tracing::info!("[enclave] generating ephemeral RSA-{RSA_KEY_BITS} keypair");
                tokio::task::spawn_blocking(generate)
                    .await
                    .unwrap_or_else(|err| Err(KeyInitError(format!("generation task failed: {err}"))))
            })
            .await
            .clone()
    }
}

fn generate() -> Result<Arc<KeyMaterial>, KeyInitError> {
    let mut rng = rand::thread_rng();

    let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|err| KeyInitError(err.to_string()))?;
    let public = RsaPublicKey::from(&private);

    let spki_der = public
        .to_public_key_der()
        .map_err(|err| KeyInitError(err.to_string()))?
        .into_vec();

    Ok(Arc::new(KeyMaterial {
        private,
        public,
        spki_der,
    }))
}
