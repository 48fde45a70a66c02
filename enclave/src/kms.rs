// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The attestation-injecting KMS proxy.
//!
//! Recipient-capable KMS actions are intercepted: the request body gains a
//! `Recipient` object carrying a fresh attestation document over our
//! ephemeral public key, the request is re-signed from its final bytes, and
//! the `CiphertextForRecipient` field of the response is decrypted locally
//! and replaced with plaintext. Everything else is forwarded as-is, though
//! still re-signed, because the caller signed for this proxy's authority
//! rather than the real endpoint.
//!
//! Decryption always happens inside the enclave; neither the parent nor the
//! network ever sees the unwrapped key material.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1 as http1_server;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rand::RngCore;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use caisson_common::policy::{EgressPolicy, Verdict};
use caisson_common::Error;

use crate::attestation::Attester;
use crate::constants::{ATTESTATION_NONCE_BYTES, KMS_BODY_LIMIT};
use crate::credentials::CredentialsSource;
use crate::envelope::RecipientEnvelope;
use crate::keyholder::{EphemeralKey, KeyMaterial};
use crate::upstream::UpstreamClient;

/// Actions whose responses can be encrypted to a recipient key. Additions
/// follow the same injection pattern; one entry here is the whole change.
pub const INTERCEPTED_ACTIONS: [&str; 3] = ["Decrypt", "GenerateDataKey", "GenerateRandom"];

const TARGET_PREFIX: &str = "TrentService.";
const X_AMZ_TARGET: &str = "x-amz-target";
const AMZ_JSON: &str = "application/x-amz-json-1.1";
const KMS_SERVICE: &str = "kms";
const KEY_ENCRYPTION_ALGORITHM: &str = "RSAES_OAEP_SHA_256";

/// Maps a signing region to the KMS endpoint host.
pub trait EndpointResolver: Send + Sync {
    fn endpoint(&self, region: &str) -> String;
}

pub struct RegionalEndpoints;

impl EndpointResolver for RegionalEndpoints {
    fn endpoint(&self, region: &str) -> String {
        format!("kms.{region}.amazonaws.com")
    }
}

pub struct KmsProxyConfig {
    pub client: Arc<dyn UpstreamClient>,
    pub keys: Arc<EphemeralKey>,
    pub attester: Arc<dyn Attester>,
    pub credentials: Arc<dyn CredentialsSource>,
    pub endpoints: Arc<dyn EndpointResolver>,
    pub policy: Arc<EgressPolicy>,
}

pub struct KmsProxy {
    listener: TcpListener,
    handler: Arc<KmsHandler>,
}

impl KmsProxy {
    pub async fn bind(port: u16, config: KmsProxyConfig) -> Result<Self, Error> {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let listener = TcpListener::bind(addr).await.map_err(|err| {
            Error::TransportUnavailable(format!("failed to bind KMS proxy on {addr}: {err}"))
        })?;

        Ok(Self {
            listener,
            handler: Arc::new(KmsHandler { config }),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    pub async fn serve(self, shutdown: CancellationToken, drain_grace: Duration) {
        let mut connections = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _peer)) => {
                    let handler = self.handler.clone();
                    connections.spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let handler = handler.clone();
                            async move {
                                Ok::<_, Infallible>(handler.serve_request(req).await)
                            }
                        });

                        if let Err(err) = http1_server::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            tracing::debug!("[kms-proxy] connection ended: {err}");
                        }
                    });
                }
                Err(err) => tracing::warn!("[kms-proxy] accept failed: {err}"),
            }

            while connections.try_join_next().is_some() {}
        }

        drop(self.listener);

        let deadline = tokio::time::sleep(drain_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    connections.abort_all();
                    break;
                }
                joined = connections.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }
        while connections.join_next().await.is_some() {}
    }
}

pub struct KmsHandler {
    config: KmsProxyConfig,
}

impl KmsHandler {
    pub fn new(config: KmsProxyConfig) -> Self {
        Self { config }
    }

    async fn serve_request(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();

        let body = match Limited::new(body, KMS_BODY_LIMIT).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => {
                return into_full(status_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "request body too large",
                ))
            }
        };

        into_full(self.handle(Request::from_parts(parts, body)).await)
    }

    /// Fully-buffered request in, fully-buffered response out.
    pub async fn handle(&self, req: Request<Bytes>) -> Response<Bytes> {
        match self.dispatch(req).await {
            Ok(response) => response,
            Err(err) => error_response(&err),
        }
    }

    async fn dispatch(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        let (parts, body) = req.into_parts();

        let scope = match CredentialScope::from_parts(&parts) {
            Ok(scope) => scope,
            Err(msg) => return Ok(bad_request(&msg)),
        };
        if scope.service != KMS_SERVICE {
            return Ok(bad_request(&format!(
                "request is signed for {:?}, not KMS",
                scope.service
            )));
        }

        let authority = self.config.endpoints.endpoint(&scope.region);

        // The KMS endpoint rides the same egress path as everything else and
        // is subject to the same manifest policy.
        if self.config.policy.resolve(&authority, 443) == Verdict::Deny {
            return Err(Error::PolicyDenied {
                host: authority,
                port: 443,
            });
        }

        match intercepted_action(&parts) {
            Some(action) => {
                tracing::debug!("[kms-proxy] intercepting {action}");
                self.attested_call(parts, body, &scope.region, authority)
                    .await
            }
            None => self.forward_call(parts, body, &scope.region, authority).await,
        }
    }

    async fn attested_call(
        &self,
        parts: http::request::Parts,
        body: Bytes,
        region: &str,
        authority: String,
    ) -> Result<Response<Bytes>, Error> {
        let mut fields = match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(fields)) => fields,
            _ => return Ok(bad_request("KMS request body is not a JSON object")),
        };

        if fields.contains_key("Recipient") {
            // Only this proxy may speak for the enclave's recipient key.
            return Ok(bad_request("request already carries a Recipient"));
        }

        let material = self
            .config
            .keys
            .material()
            .await
            .map_err(|err| Error::AttestationUnavailable(err.to_string()))?;

        let mut nonce = vec![0u8; ATTESTATION_NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);

        let document = self
            .config
            .attester
            .attest(Some(nonce), None, Some(material.public_key_der().to_vec()))
            .await
            .map_err(|err| Error::AttestationUnavailable(err.to_string()))?;

        fields.insert(
            "Recipient".to_string(),
            json!({
                "AttestationDocument": BASE64.encode(&document),
                "KeyEncryptionAlgorithm": KEY_ENCRYPTION_ALGORITHM,
            }),
        );

        let mutated = serde_json::to_vec(&Value::Object(fields))
            .map_err(|err| Error::UpstreamUnavailable(format!("body rebuild failed: {err}")))?;

        let response = self
            .send(&parts, Bytes::from(mutated), region, &authority)
            .await?;

        self.unwrap_recipient(response, &material)
    }

    async fn forward_call(
        &self,
        parts: http::request::Parts,
        body: Bytes,
        region: &str,
        authority: String,
    ) -> Result<Response<Bytes>, Error> {
        self.send(&parts, body, region, &authority).await
    }

    /// Builds the outgoing request against the real endpoint, signs it over
    /// the final body bytes, and performs the round trip.
    async fn send(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
        region: &str,
        authority: &str,
    ) -> Result<Response<Bytes>, Error> {
        let uri = Uri::builder()
            .scheme("https")
            .authority(authority)
            .path_and_query(parts.uri.path())
            .build()
            .map_err(|err| Error::UpstreamUnavailable(format!("bad endpoint: {err}")))?;

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        if let Some(target) = parts.headers.get(X_AMZ_TARGET) {
            builder = builder.header(X_AMZ_TARGET, target);
        }
        let content_type = parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(AMZ_JSON));
        builder = builder.header(http::header::CONTENT_TYPE, content_type);

        let mut request = builder
            .body(body)
            .map_err(|err| Error::UpstreamUnavailable(format!("request rebuild failed: {err}")))?;

        let credentials = self.config.credentials.credentials().await?;
        sign_request(&mut request, &credentials, region)?;

        self.config.client.send(request).await
    }

    /// Replaces `CiphertextForRecipient` with locally-decrypted `Plaintext`.
    fn unwrap_recipient(
        &self,
        response: Response<Bytes>,
        material: &KeyMaterial,
    ) -> Result<Response<Bytes>, Error> {
        let (mut parts, body) = response.into_parts();

        if !parts.status.is_success() {
            return Ok(Response::from_parts(parts, body));
        }

        let mut fields = match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(fields)) => fields,
            _ => {
                return Err(Error::EnvelopeDecode(
                    "KMS response body is not a JSON object".to_string(),
                ))
            }
        };

        let wrapped = match fields.remove("CiphertextForRecipient") {
            Some(wrapped) => wrapped,
            // Nothing to unwrap; hand the response through untouched.
            None => return Ok(Response::from_parts(parts, body)),
        };

        let wrapped = wrapped.as_str().ok_or_else(|| {
            Error::EnvelopeDecode("CiphertextForRecipient is not a string".to_string())
        })?;
        let ciphertext = BASE64
            .decode(wrapped)
            .map_err(|err| Error::EnvelopeDecode(format!("bad base64: {err}")))?;

        let envelope = RecipientEnvelope::parse(&ciphertext)?;
        let plaintext = envelope.open(material.private_key())?;

        fields.insert("Plaintext".to_string(), Value::String(BASE64.encode(&plaintext)));

        let rebuilt = serde_json::to_vec(&Value::Object(fields))
            .map_err(|_| Error::Decrypt)?;

        parts.headers.remove(http::header::CONTENT_LENGTH);
        Ok(Response::from_parts(parts, Bytes::from(rebuilt)))
    }
}

/// The region and service a SigV4 request was signed for, from either the
/// `Authorization` header or presigned query parameters.
struct CredentialScope {
    region: String,
    service: String,
}

impl CredentialScope {
    fn from_parts(parts: &http::request::Parts) -> Result<Self, String> {
        let credential = if let Some(authorization) = parts.headers.get(http::header::AUTHORIZATION)
        {
            let authorization = authorization
                .to_str()
                .map_err(|_| "Authorization header is not valid UTF-8".to_string())?;
            let after = authorization
                .split_once("Credential=")
                .ok_or_else(|| "Authorization header carries no Credential".to_string())?
                .1;
            after
                .split([',', ' '])
                .next()
                .unwrap_or_default()
                .to_string()
        } else {
            query_credential(&parts.uri)
                .ok_or_else(|| "request carries no SigV4 credential".to_string())?
        };

        // AKID/date/region/service/aws4_request
        let segments: Vec<&str> = credential.split('/').collect();
        if segments.len() < 5 || segments[segments.len() - 1] != "aws4_request" {
            return Err(format!("malformed credential scope: {credential:?}"));
        }

        Ok(Self {
            region: segments[2].to_string(),
            service: segments[3].to_string(),
        })
    }
}

fn query_credential(uri: &Uri) -> Option<String> {
    let query = uri.path_and_query()?.query()?;

    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        if key.eq_ignore_ascii_case("X-Amz-Credential") {
            return Some(percent_decode(value));
        }
    }

    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let decoded = bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Is this one of the recipient-capable calls?
fn intercepted_action(parts: &http::request::Parts) -> Option<&'static str> {
    if parts.method != Method::POST || parts.uri.path() != "/" {
        return None;
    }

    let target = parts.headers.get(X_AMZ_TARGET)?.to_str().ok()?;

    INTERCEPTED_ACTIONS.iter().copied().find(|action| {
        target.len() == TARGET_PREFIX.len() + action.len()
            && target[..TARGET_PREFIX.len()].eq_ignore_ascii_case(TARGET_PREFIX)
            && target[TARGET_PREFIX.len()..].eq_ignore_ascii_case(action)
    })
}

/// SigV4-signs the request over its final byte representation. The canonical
/// request hashes the body as passed here, so any mutation must happen before
/// this call.
fn sign_request(
    request: &mut Request<Bytes>,
    credentials: &Credentials,
    region: &str,
) -> Result<(), Error> {
    let sign_err = |err: String| Error::UpstreamUnavailable(format!("signing failed: {err}"));

    let identity = credentials.clone().into();
    let params = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(KMS_SERVICE)
        .time(SystemTime::now())
        .settings(SigningSettings::default())
        .build()
        .map_err(|err| sign_err(err.to_string()))?
        .into();

    let instructions = {
        let uri = request.uri().to_string();
        let headers = request
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str(), std::str::from_utf8(value.as_bytes()).unwrap_or("")));
        let signable = SignableRequest::new(
            request.method().as_str(),
            uri.as_str(),
            headers,
            SignableBody::Bytes(request.body()),
        )
        .map_err(|err| sign_err(err.to_string()))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|err| sign_err(err.to_string()))?
            .into_parts();
        instructions
    };

    instructions.apply_to_request_http1x(request);
    Ok(())
}

fn into_full(response: Response<Bytes>) -> Response<Full<Bytes>> {
    let (mut parts, body) = response.into_parts();
    // The body may have been rewritten; let the connection recompute framing.
    parts.headers.remove(http::header::CONTENT_LENGTH);
    parts.headers.remove(http::header::TRANSFER_ENCODING);
    Response::from_parts(parts, Full::new(body))
}

fn status_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::copy_from_slice(message.as_bytes()));
    *response.status_mut() = status;
    response
}

fn bad_request(message: &str) -> Response<Bytes> {
    status_response(StatusCode::BAD_REQUEST, message)
}

fn error_response(err: &Error) -> Response<Bytes> {
    match err {
        Error::PolicyDenied { .. } => {
            status_response(StatusCode::FORBIDDEN, "blocked by egress policy")
        }
        Error::AttestationUnavailable(_) => {
            status_response(StatusCode::SERVICE_UNAVAILABLE, "attestation unavailable")
        }
        // Never echo anything derived from the envelope or key material.
        Error::EnvelopeDecode(_) | Error::Decrypt => status_response(
            StatusCode::BAD_GATEWAY,
            "unable to process recipient-encrypted response",
        ),
        Error::UpstreamUnavailable(_) | Error::TransportUnavailable(_) => {
            status_response(StatusCode::BAD_GATEWAY, "upstream unavailable")
        }
        _ => status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use aws_credential_types::Credentials;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use bytes::Bytes;
    use http::{Method, Request, Response, StatusCode};
    use rand::RngCore;
    use serde_json::{json, Value};

    use caisson_common::policy::EgressPolicy;
    use caisson_common::Error;

    use crate::attestation::{AttestError, Attester};
    use crate::credentials::StaticCredentials;
    use crate::envelope::tests::encode_envelope;
    use crate::keyholder::EphemeralKey;
    use crate::upstream::UpstreamClient;

    use super::{EndpointResolver, KmsHandler, KmsProxyConfig};

    const ATTESTATION_DOC: &[u8] = b"opaque-signed-attestation-document";

    struct StubAttester {
        fail: bool,
    }

    #[async_trait]
    impl Attester for StubAttester {
        async fn attest(
            &self,
            nonce: Option<Vec<u8>>,
            user_data: Option<Vec<u8>>,
            public_key: Option<Vec<u8>>,
        ) -> Result<Vec<u8>, AttestError> {
            if self.fail {
                return Err(AttestError::Unavailable("device gone".to_string()));
            }
            assert_eq!(nonce.map(|n| n.len()), Some(32));
            assert!(user_data.is_none());
            // SubjectPublicKeyInfo DER starts with a SEQUENCE tag.
            assert_eq!(public_key.unwrap()[0], 0x30);
            Ok(ATTESTATION_DOC.to_vec())
        }

        async fn read_entropy(&self, _n: usize) -> Result<Vec<u8>, AttestError> {
            unreachable!("the KMS proxy never reads entropy")
        }
    }

    type Responder = Box<dyn Fn(&Request<Bytes>) -> Response<Bytes> + Send + Sync>;

    struct StubUpstream {
        seen: Mutex<Vec<Request<Bytes>>>,
        respond: Responder,
    }

    #[async_trait]
    impl UpstreamClient for StubUpstream {
        async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error> {
            let authorization = req
                .headers()
                .get(http::header::AUTHORIZATION)
                .expect("outgoing request must be signed")
                .to_str()
                .unwrap()
                .to_string();
            assert!(
                authorization.starts_with("AWS4-HMAC-SHA256 Credential="),
                "unexpected authorization: {authorization}"
            );
            assert_eq!(req.uri().scheme_str(), Some("https"));

            let response = (self.respond)(&req);
            self.seen.lock().unwrap().push(req);
            Ok(response)
        }
    }

    struct FixedEndpoint;

    impl EndpointResolver for FixedEndpoint {
        fn endpoint(&self, region: &str) -> String {
            format!("kms.{region}.example.com")
        }
    }

    fn handler_with(
        keys: Arc<EphemeralKey>,
        respond: Responder,
        failing_attester: bool,
    ) -> (KmsHandler, Arc<StubUpstream>) {
        let upstream = Arc::new(StubUpstream {
            seen: Mutex::new(Vec::new()),
            respond,
        });

        let handler = KmsHandler::new(KmsProxyConfig {
            client: upstream.clone(),
            keys,
            attester: Arc::new(StubAttester {
                fail: failing_attester,
            }),
            credentials: Arc::new(StaticCredentials(Credentials::new(
                "AKIDTEST",
                "SECRETTEST",
                None,
                None,
                "test",
            ))),
            endpoints: Arc::new(FixedEndpoint),
            policy: Arc::new(EgressPolicy::allow_all()),
        });

        (handler, upstream)
    }

    fn kms_request(action: &str, body: Value) -> Request<Bytes> {
        Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(super::X_AMZ_TARGET, format!("TrentService.{action}"))
            .header(http::header::CONTENT_TYPE, super::AMZ_JSON)
            .header(
                http::header::AUTHORIZATION,
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/kms/aws4_request, \
                 SignedHeaders=host, Signature=f00",
            )
            .body(Bytes::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn body_json(response: &Response<Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[tokio::test]
    async fn decrypt_injects_recipient_and_unwraps_the_response() {
        let keys = Arc::new(EphemeralKey::new());
        let material = keys.material().await.unwrap();

        let mut payload = vec![0x3b, 0xe8];
        payload.extend(std::iter::repeat(0x41).take(30));
        let expected = payload.clone();

        let mut content_key = [0u8; 32];
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut content_key);
        rand::thread_rng().fill_bytes(&mut iv);
        let envelope = encode_envelope(
            material.public_key(),
            &content_key,
            &iv,
            &payload,
            &Default::default(),
        );

        let (handler, upstream) = handler_with(
            keys,
            Box::new(move |req| {
                let body: Value = serde_json::from_slice(req.body()).unwrap();
                assert_eq!(
                    body["Recipient"]["AttestationDocument"],
                    BASE64.encode(ATTESTATION_DOC)
                );
                assert_eq!(
                    body["Recipient"]["KeyEncryptionAlgorithm"],
                    "RSAES_OAEP_SHA_256"
                );

                let reply = json!({
                    "KeyId": "arn:aws:kms:us-east-1:000000000000:key/abc",
                    "EncryptionAlgorithm": "SYMMETRIC_DEFAULT",
                    "CiphertextForRecipient": BASE64.encode(&envelope),
                });
                Response::new(Bytes::from(serde_json::to_vec(&reply).unwrap()))
            }),
            false,
        );

        let request = kms_request("Decrypt", json!({ "CiphertextBlob": "aGVsbG8=" }));
        let response = handler.handle(request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(&response);
        assert_eq!(body["Plaintext"], BASE64.encode(&expected));
        assert!(body.get("CiphertextForRecipient").is_none());
        assert_eq!(body["KeyId"], "arn:aws:kms:us-east-1:000000000000:key/abc");

        // The upstream saw the real endpoint for the signed region.
        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen[0].uri().host(), Some("kms.us-east-1.example.com"));
    }

    #[tokio::test]
    async fn other_actions_are_forwarded_re_signed_but_unmodified() {
        let keys = Arc::new(EphemeralKey::new());

        let (handler, upstream) = handler_with(
            keys,
            Box::new(|req| {
                let body: Value = serde_json::from_slice(req.body()).unwrap();
                assert!(body.get("Recipient").is_none());
                Response::new(Bytes::from(
                    serde_json::to_vec(&json!({ "Keys": [] })).unwrap(),
                ))
            }),
            false,
        );

        let request = kms_request("ListKeys", json!({}));
        let response = handler.handle(request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(&response), json!({ "Keys": [] }));
        assert_eq!(upstream.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn a_caller_supplied_recipient_is_rejected() {
        let keys = Arc::new(EphemeralKey::new());
        let (handler, upstream) = handler_with(
            keys,
            Box::new(|_| unreachable!("conflicting requests never reach upstream")),
            false,
        );

        let request = kms_request(
            "Decrypt",
            json!({ "CiphertextBlob": "aGVsbG8=", "Recipient": { "AttestationDocument": "x" } }),
        );
        let response = handler.handle(request).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn attestation_failure_is_503() {
        let keys = Arc::new(EphemeralKey::new());
        let (handler, _upstream) = handler_with(
            keys,
            Box::new(|_| unreachable!("unattested requests never reach upstream")),
            true,
        );

        let request = kms_request("GenerateDataKey", json!({ "KeyId": "k" }));
        let response = handler.handle(request).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn an_undecodable_envelope_is_502_without_detail() {
        let keys = Arc::new(EphemeralKey::new());
        let (handler, _upstream) = handler_with(
            keys,
            Box::new(|_| {
                let reply = json!({
                    "CiphertextForRecipient": BASE64.encode(b"not an envelope"),
                });
                Response::new(Bytes::from(serde_json::to_vec(&reply).unwrap()))
            }),
            false,
        );

        let request = kms_request("GenerateRandom", json!({ "NumberOfBytes": 32 }));
        let response = handler.handle(request).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let text = std::str::from_utf8(response.body()).unwrap();
        assert!(!text.contains("envelope does not parse"));
    }

    #[tokio::test]
    async fn upstream_errors_pass_through_with_their_status() {
        let keys = Arc::new(EphemeralKey::new());
        let (handler, _upstream) = handler_with(
            keys,
            Box::new(|_| {
                let mut response = Response::new(Bytes::from_static(
                    br#"{"__type":"AccessDeniedException"}"#,
                ));
                *response.status_mut() = StatusCode::FORBIDDEN;
                response
            }),
            false,
        );

        let request = kms_request("Decrypt", json!({ "CiphertextBlob": "aGVsbG8=" }));
        let response = handler.handle(request).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(&response)["__type"], "AccessDeniedException");
    }

    #[tokio::test]
    async fn non_kms_signatures_are_rejected() {
        let keys = Arc::new(EphemeralKey::new());
        let (handler, upstream) = handler_with(
            keys,
            Box::new(|_| unreachable!("never reaches upstream")),
            false,
        );

        let request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(super::X_AMZ_TARGET, "TrentService.Decrypt")
            .header(
                http::header::AUTHORIZATION,
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/s3/aws4_request, ",
            )
            .body(Bytes::from_static(b"{}"))
            .unwrap();

        let response = handler.handle(request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn credential_scope_parses_presigned_queries() {
        let request = Request::builder()
            .uri("/?X-Amz-Credential=AKIDEXAMPLE%2F20150830%2Feu-west-2%2Fkms%2Faws4_request")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();

        let scope = super::CredentialScope::from_parts(&parts).unwrap();
        assert_eq!(scope.region, "eu-west-2");
        assert_eq!(scope.service, "kms");
    }

    #[test]
    fn intercept_table_matches_case_insensitively() {
        let parts = |target: &str| {
            let req = Request::builder()
                .method(Method::POST)
                .uri("/")
                .header(super::X_AMZ_TARGET, target)
                .body(())
                .unwrap();
            req.into_parts().0
        };

        assert_eq!(
            super::intercepted_action(&parts("TrentService.Decrypt")),
            Some("Decrypt")
        );
        assert_eq!(
            super::intercepted_action(&parts("trentservice.generaterandom")),
            Some("GenerateRandom")
        );
        assert_eq!(super::intercepted_action(&parts("TrentService.ListKeys")), None);
    }
}
