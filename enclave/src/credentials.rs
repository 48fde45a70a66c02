// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Instance credentials for re-signing KMS requests.
//!
//! The enclave has no instance role of its own; credentials come from the
//! parent's metadata service, reached through the egress path like any other
//! destination. Fetched credentials are cached and refreshed shortly before
//! they expire.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_credential_types::Credentials;
use bytes::Bytes;
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1 as http1_client;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::sync::RwLock;

use caisson_common::Error;

use crate::constants::{CREDENTIAL_REFRESH_BUFFER, IMDS_HOST, IMDS_TOKEN_TTL_SECONDS};
use crate::egress::EgressDialer;

#[async_trait]
pub trait CredentialsSource: Send + Sync {
    async fn credentials(&self) -> Result<Credentials, Error>;
}

/// Fixed credentials, for tests.
pub struct StaticCredentials(pub Credentials);

#[async_trait]
impl CredentialsSource for StaticCredentials {
    async fn credentials(&self) -> Result<Credentials, Error> {
        Ok(self.0.clone())
    }
}

struct Cached {
    credentials: Credentials,
    expires_at: Option<SystemTime>,
}

/// IMDSv2 credential fetcher with an expiry-buffered cache.
pub struct ImdsCredentials {
    dialer: Arc<dyn EgressDialer>,
    cached: RwLock<Option<Cached>>,
}

impl ImdsCredentials {
    pub fn new(dialer: Arc<dyn EgressDialer>) -> Self {
        Self {
            dialer,
            cached: RwLock::new(None),
        }
    }

    fn is_valid(cached: &Cached) -> bool {
        match cached.expires_at {
            Some(expires_at) => match SystemTime::now().checked_add(CREDENTIAL_REFRESH_BUFFER) {
                Some(threshold) => threshold < expires_at,
                None => false,
            },
            None => true,
        }
    }

    async fn refresh(&self) -> Result<Credentials, Error> {
        let mut cache = self.cached.write().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = cache.as_ref() {
            if Self::is_valid(cached) {
                return Ok(cached.credentials.clone());
            }
        }

        let (credentials, expires_at) = self.fetch().await?;
        tracing::debug!("[enclave] refreshed IMDS credentials, expires_at: {expires_at:?}");

        *cache = Some(Cached {
            credentials: credentials.clone(),
            expires_at,
        });

        Ok(credentials)
    }

    async fn fetch(&self) -> Result<(Credentials, Option<SystemTime>), Error> {
        let ttl = IMDS_TOKEN_TTL_SECONDS.to_string();
        let token = self
            .request(
                Method::PUT,
                "/latest/api/token",
                &[("x-aws-ec2-metadata-token-ttl-seconds", ttl.as_str())],
            )
            .await?;
        let token = String::from_utf8(token.to_vec())
            .map_err(|_| Error::UpstreamUnavailable("IMDS token is not UTF-8".to_string()))?;

        let roles = self
            .request(
                Method::GET,
                "/latest/meta-data/iam/security-credentials/",
                &[("x-aws-ec2-metadata-token", token.as_str())],
            )
            .await?;
        let roles = String::from_utf8(roles.to_vec())
            .map_err(|_| Error::UpstreamUnavailable("IMDS role list is not UTF-8".to_string()))?;
        let role = roles
            .lines()
            .next()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::UpstreamUnavailable("no instance role is attached".to_string())
            })?;

        let doc = self
            .request(
                Method::GET,
                &format!("/latest/meta-data/iam/security-credentials/{role}"),
                &[("x-aws-ec2-metadata-token", token.as_str())],
            )
            .await?;

        let doc: SecurityCredentials = serde_json::from_slice(&doc)
            .map_err(|err| Error::UpstreamUnavailable(format!("bad IMDS credentials: {err}")))?;

        let expires_at = doc.expiration.as_deref().and_then(parse_utc_timestamp);

        let credentials = Credentials::new(
            doc.access_key_id,
            doc.secret_access_key,
            Some(doc.token),
            expires_at,
            "imds-via-parent",
        );

        Ok((credentials, expires_at))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<Bytes, Error> {
        let stream = self.dialer.dial(IMDS_HOST, 80).await?;

        let (mut sender, conn) = http1_client::Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|err| Error::UpstreamUnavailable(format!("IMDS handshake: {err}")))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, IMDS_HOST);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|err| Error::UpstreamUnavailable(err.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| Error::UpstreamUnavailable(format!("IMDS request: {err}")))?;

        if !response.status().is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "IMDS returned {} for {path}",
                response.status()
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| Error::UpstreamUnavailable(format!("IMDS body: {err}")))?;

        Ok(body.to_bytes())
    }
}

#[async_trait]
impl CredentialsSource for ImdsCredentials {
    async fn credentials(&self) -> Result<Credentials, Error> {
        {
            let cache = self.cached.read().await;
            if let Some(cached) = cache.as_ref() {
                if Self::is_valid(cached) {
                    return Ok(cached.credentials.clone());
                }
            }
        }

        self.refresh().await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: String,
    #[serde(default)]
    expiration: Option<String>,
}

/// Parses the `YYYY-MM-DDTHH:MM:SSZ` timestamps IMDS emits. Anything else
/// yields `None` and the cache falls back to always-refresh-on-demand.
fn parse_utc_timestamp(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    let bytes = value.as_bytes();
    if bytes.len() < 20 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[10] != b'T' {
        return None;
    }
    if bytes[13] != b':' || bytes[16] != b':' || bytes[bytes.len() - 1] != b'Z' {
        return None;
    }

    let year: i64 = value.get(0..4)?.parse().ok()?;
    let month: i64 = value.get(5..7)?.parse().ok()?;
    let day: i64 = value.get(8..10)?.parse().ok()?;
    let hour: u64 = value.get(11..13)?.parse().ok()?;
    let minute: u64 = value.get(14..16)?.parse().ok()?;
    let second: u64 = value.get(17..19)?.parse().ok()?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 {
        return None;
    }

    let days = days_from_civil(year, month, day);
    if days < 0 {
        return None;
    }

    let seconds = days as u64 * 86_400 + hour * 3_600 + minute * 60 + second;
    SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(seconds))
}

/// Days since the Unix epoch for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = if year >= 0 { year } else { year - 399 } / 400;
    let yoe = year - era * 400;
    let doy = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::parse_utc_timestamp;

    fn unix(ts: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(ts)
    }

    #[test]
    fn parses_imds_expiration_timestamps() {
        assert_eq!(
            parse_utc_timestamp("1970-01-01T00:00:00Z"),
            Some(unix(0))
        );
        assert_eq!(
            parse_utc_timestamp("2024-02-29T12:30:45Z"),
            Some(unix(1_709_209_845))
        );
        assert_eq!(
            parse_utc_timestamp("2030-01-01T00:00:00Z"),
            Some(unix(1_893_456_000))
        );
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert_eq!(parse_utc_timestamp(""), None);
        assert_eq!(parse_utc_timestamp("not a timestamp"), None);
        assert_eq!(parse_utc_timestamp("2024-13-01T00:00:00Z"), None);
        assert_eq!(parse_utc_timestamp("2024-01-01 00:00:00"), None);
    }
}
