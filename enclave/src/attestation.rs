// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Attestation device access.
//!
//! The device speaks a synchronous ioctl protocol with bounded request and
//! response buffers, so every exchange is serialized behind one session and
//! delegated to the blocking tier. Components consume the [`Attester`] trait;
//! production wires in [`NsmDevice`], tests substitute their own.

use async_trait::async_trait;

/// Errors surfaced by the attestation device.
#[derive(thiserror::Error, Debug, Clone)]
pub enum AttestError {
    #[error("attestation device unavailable: {0}")]
    Unavailable(String),

    #[error("attestation device error: {0}")]
    Device(String),

    #[error("attestation reply carried no document")]
    EmptyDocument,

    #[error("entropy unavailable: {0}")]
    Entropy(String),
}

/// Synchronous attestation operations, callable from any task.
#[async_trait]
pub trait Attester: Send + Sync {
    /// Produces a signed attestation document over `(nonce, user_data,
    /// public_key)`. The public key, when present, is SubjectPublicKeyInfo
    /// DER.
    async fn attest(
        &self,
        nonce: Option<Vec<u8>>,
        user_data: Option<Vec<u8>>,
        public_key: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, AttestError>;

    /// Accumulates exactly `n` bytes of device entropy.
    async fn read_entropy(&self, n: usize) -> Result<Vec<u8>, AttestError>;
}

#[cfg(target_os = "linux")]
pub use device::NsmDevice;

#[cfg(target_os = "linux")]
mod device {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use aws_nitro_enclaves_nsm_api::api::{Request, Response};
    use aws_nitro_enclaves_nsm_api::driver;
    use serde_bytes::ByteBuf;

    use super::{AttestError, Attester};

    /// One open session against the attestation device. Cloning shares the
    /// session; the internal lock serializes ioctls.
    #[derive(Clone)]
    pub struct NsmDevice {
        session: Arc<Session>,
    }

    struct Session {
        fd: i32,
        lock: Mutex<()>,
    }

    impl Drop for Session {
        fn drop(&mut self) {
            driver::nsm_exit(self.fd);
        }
    }

    impl NsmDevice {
        pub fn open() -> Result<Self, AttestError> {
            let fd = driver::nsm_init();
            if fd < 0 {
                return Err(AttestError::Unavailable(format!(
                    "device open failed (fd {fd})"
                )));
            }

            Ok(Self {
                session: Arc::new(Session { fd, lock: Mutex::new(()) }),
            })
        }

        fn process(&self, request: Request) -> Result<Response, AttestError> {
            let _serialized = self.session.lock.lock().unwrap_or_else(|e| e.into_inner());
            match driver::nsm_process_request(self.session.fd, request) {
                Response::Error(code) => Err(AttestError::Device(format!("{code:?}"))),
                response => Ok(response),
            }
        }
    }

    #[async_trait]
    impl Attester for NsmDevice {
        async fn attest(
            &self,
            nonce: Option<Vec<u8>>,
            user_data: Option<Vec<u8>>,
            public_key: Option<Vec<u8>>,
        ) -> Result<Vec<u8>, AttestError> {
            let device = self.clone();

            let document = tokio::task::spawn_blocking(move || {
                let request = Request::Attestation {
                    nonce: nonce.map(ByteBuf::from),
                    user_data: user_data.map(ByteBuf::from),
                    public_key: public_key.map(ByteBuf::from),
                };

                match device.process(request)? {
                    Response::Attestation { document } => Ok(document),
                    other => Err(AttestError::Device(format!(
                        "unexpected reply to Attestation: {other:?}"
                    ))),
                }
            })
            .await
            .map_err(|err| AttestError::Device(format!("attestation task failed: {err}")))??;

            if document.is_empty() {
                return Err(AttestError::EmptyDocument);
            }

            Ok(document)
        }

        async fn read_entropy(&self, n: usize) -> Result<Vec<u8>, AttestError> {
            let device = self.clone();

            tokio::task::spawn_blocking(move || {
                let mut collected = Vec::with_capacity(n);

                while collected.len() < n {
                    let response = device
                        .process(Request::GetRandom)
                        .map_err(|err| AttestError::Entropy(err.to_string()))?;

                    match response {
                        Response::GetRandom { random } if !random.is_empty() => {
                            collected.extend_from_slice(&random);
                        }
                        Response::GetRandom { .. } => {
                            return Err(AttestError::Entropy(
                                "device returned zero bytes".to_string(),
                            ));
                        }
                        other => {
                            return Err(AttestError::Entropy(format!(
                                "unexpected reply to GetRandom: {other:?}"
                            )));
                        }
                    }
                }

                collected.truncate(n);
                Ok(collected)
            })
            .await
            .map_err(|err| AttestError::Entropy(format!("entropy task failed: {err}")))?
        }
    }
}

/// Stand-in for builds and environments without the attestation device. Every
/// operation fails; callers surface that as `503` or a fatal startup error.
pub struct UnavailableAttester;

#[async_trait]
impl Attester for UnavailableAttester {
    async fn attest(
        &self,
        _nonce: Option<Vec<u8>>,
        _user_data: Option<Vec<u8>>,
        _public_key: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, AttestError> {
        Err(AttestError::Unavailable(
            "no attestation device in this environment".to_string(),
        ))
    }

    async fn read_entropy(&self, _n: usize) -> Result<Vec<u8>, AttestError> {
        Err(AttestError::Entropy(
            "no attestation device in this environment".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{AttestError, Attester, UnavailableAttester};

    #[tokio::test]
    async fn unavailable_attester_fails_both_operations() {
        let attester = UnavailableAttester;

        let err = attester.attest(None, None, None).await.unwrap_err();
        assert!(matches!(err, AttestError::Unavailable(_)));

        let err = attester.read_entropy(16).await.unwrap_err();
        assert!(matches!(err, AttestError::Entropy(_)));
    }
}
