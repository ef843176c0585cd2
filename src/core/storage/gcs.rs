//! Google Cloud Storage through the JSON API, authenticated as a service
//! account.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{Instrument, debug, info, info_span};

use super::{
    StorageBackend, StorageTarget, TransferRequest, TransferState, UploadError, destination_key,
    enter, finish_save,
};
use crate::error::{Error, Result};

const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Refresh this many seconds before the token expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct GcsConfig {
    pub bucket: String,
    #[serde(default)]
    pub dir: String,
    /// Service account key file (JSON) downloaded from the console.
    pub credentials_file: PathBuf,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct AccessToken {
    token: String,
    expires_at: i64,
}

pub struct GcsBackend {
    name: String,
    config: GcsConfig,
    endpoint: String,
    http: reqwest::Client,
    token: Mutex<Option<AccessToken>>,
}

impl GcsBackend {
    pub fn new(name: impl Into<String>, config: GcsConfig) -> Self {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            name: name.into(),
            config,
            endpoint,
            http: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    pub fn from_target(target: &StorageTarget) -> Result<Arc<dyn StorageBackend>> {
        Ok(Arc::new(Self::new(&target.name, target.settings()?)))
    }

    /// Bearer token, exchanged for a fresh one when close to expiry.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now().timestamp() < token.expires_at - EXPIRY_MARGIN_SECS {
                return Ok(token.token.clone());
            }
        }

        let raw = tokio::fs::read_to_string(&self.config.credentials_file)
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "reading {}: {e}",
                    self.config.credentials_file.display()
                ))
            })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!(
                "{} is not a service account key: {e}",
                self.config.credentials_file.display()
            ))
        })?;

        let token = self.exchange(&key).await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn exchange(&self, key: &ServiceAccountKey) -> Result<AccessToken> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &key.client_email,
            scope: SCOPE,
            aud: &key.token_uri,
            exp: now + 3600,
            iat: now,
        };
        let header = Header {
            alg: Algorithm::RS256,
            kid: key.private_key_id.clone(),
            ..Default::default()
        };
        let pem = key.private_key.replace("\\n", "\n");
        let signing_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| Error::Config(format!("service account private key: {e}")))?;
        let assertion = encode(&header, &claims, &signing_key)
            .map_err(|e| Error::Config(format!("signing token request: {e}")))?;

        let response = self
            .http
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let response = check(response, "token exchange").await?;
        let body: TokenResponse = response.json().await?;

        debug!(account = %key.client_email, "Obtained access token");
        Ok(AccessToken {
            token: body.access_token,
            expires_at: now + body.expires_in.unwrap_or(3600),
        })
    }

    async fn transfer(&self, req: &TransferRequest) -> Result<u64> {
        enter(&self.name, TransferState::Authenticating);
        let token = self.access_token().await?;

        enter(&self.name, TransferState::VerifyingDestination);
        let bucket = utf8_percent_encode(&self.config.bucket, NON_ALPHANUMERIC).to_string();
        let response = self
            .http
            .get(format!("{}/storage/v1/b/{bucket}", self.endpoint))
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .send()
            .await?;
        check(response, &format!("bucket {}", self.config.bucket)).await?;

        enter(&self.name, TransferState::Streaming);
        let key = destination_key(&self.config.dir, &req.artifact);
        let url = format!(
            "{}/upload/storage/v1/b/{bucket}/o?uploadType=media&name={}",
            self.endpoint,
            utf8_percent_encode(&key, NON_ALPHANUMERIC)
        );
        let start = Instant::now();
        let (reader, closer) = req.source.open(&req.artifact, &req.ctx).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));

        let sent = self
            .http
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, req.artifact.size)
            .body(body)
            .send()
            .await;
        let copied = match sent {
            Ok(response) => check(response, &format!("upload {key}"))
                .await
                .map(|_| req.artifact.size),
            Err(e) => Err(e.into()),
        };

        let bytes = closer.settle(copied).await?;
        info!(
            bucket = %self.config.bucket,
            object = %key,
            bytes,
            duration_ms = start.elapsed().as_millis() as u64,
            "Artifact uploaded"
        );
        Ok(bytes)
    }
}

async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(Error::ObjectStore(format!("{what}: {status} {}", detail.trim())))
}

#[async_trait]
impl StorageBackend for GcsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, req: &TransferRequest) -> Result<u64, UploadError> {
        let span = info_span!("gcs_save", target = %self.name, artifact = %req.artifact.file_name());
        finish_save(&self.name, self.transfer(req)).instrument(span).await
    }
}
