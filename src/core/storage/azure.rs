//! Azure Blob Storage over the REST API.
//!
//! Authenticates with either the account's Shared Key (requests are signed
//! with HMAC-SHA256) or a SAS token appended to every URL. Artifacts are
//! staged as fixed-size blocks and committed with a block list.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use sha2::Sha256;
use tokio::io::AsyncRead;
use tracing::{Instrument, debug, info, info_span};

use super::{
    StorageBackend, StorageTarget, TransferRequest, TransferState, UploadError, destination_key,
    enter, finish_save, read_part,
};
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2021-08-06";

/// Staged block size.
const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Characters left unescaped in blob paths.
const PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone, Deserialize)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    #[serde(default)]
    pub dir: String,
    /// Base64 account key for Shared Key signing.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub sas_token: Option<String>,
    /// Defaults to `https://<account>.blob.core.windows.net`.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConfig")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("dir", &self.dir)
            .field("key", &self.key.as_ref().map(|_| crate::mask::MASK))
            .field("sas_token", &self.sas_token.as_ref().map(|_| crate::mask::MASK))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

enum Auth {
    SharedKey(Vec<u8>),
    Sas(String),
}

pub struct AzureBackend {
    name: String,
    config: AzureConfig,
    base: Url,
    auth: Auth,
    http: reqwest::Client,
}

impl AzureBackend {
    pub fn new(name: impl Into<String>, config: AzureConfig) -> Result<Self> {
        let auth = match (&config.key, &config.sas_token) {
            (Some(key), _) => Auth::SharedKey(
                STANDARD
                    .decode(key.trim())
                    .map_err(|e| Error::Config(format!("azure account key: {e}")))?,
            ),
            (None, Some(sas)) => Auth::Sas(sas.trim_start_matches('?').to_string()),
            (None, None) => {
                return Err(Error::Config(
                    "azure storage needs key or sas_token".to_string(),
                ));
            }
        };

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", config.account));
        let base = Url::parse(endpoint.trim_end_matches('/'))
            .map_err(|e| Error::Config(format!("azure endpoint {endpoint}: {e}")))?;

        Ok(Self {
            name: name.into(),
            config,
            base,
            auth,
            http: reqwest::Client::new(),
        })
    }

    pub fn from_target(target: &StorageTarget) -> Result<Arc<dyn StorageBackend>> {
        Ok(Arc::new(Self::new(&target.name, target.settings()?)?))
    }

    fn container_path(&self) -> String {
        format!("/{}", utf8_percent_encode(&self.config.container, PATH))
    }

    fn blob_path(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.container_path(),
            utf8_percent_encode(key, PATH)
        )
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        content_type: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let base_path = self.base.path().trim_end_matches('/');
        let mut url = self.base.clone();
        url.set_path(&format!("{base_path}{path}"));
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        if let Auth::Sas(sas) = &self.auth {
            let joined = match url.query() {
                Some(q) if !q.is_empty() => format!("{q}&{sas}"),
                _ => sas.clone(),
            };
            url.set_query(Some(&joined));
        }

        let content_length = body.as_ref().map_or(0, Vec::len);
        let mut headers = BTreeMap::new();
        headers.insert(
            "x-ms-date".to_string(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        headers.insert("x-ms-version".to_string(), API_VERSION.to_string());

        let mut request = self.http.request(method.clone(), url.clone());
        if let Auth::SharedKey(key) = &self.auth {
            let resource = format!("/{}{}{}", self.config.account, base_path, path);
            let to_sign = string_to_sign(
                method.as_str(),
                content_length,
                content_type,
                &headers,
                &resource,
                query,
            );
            request = request.header(
                "Authorization",
                format!("SharedKey {}:{}", self.config.account, sign(key, &to_sign)),
            );
        }
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if let Some(content_type) = content_type {
            request = request.header("Content-Type", content_type);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response.text().await.unwrap_or_default();
        let message = format!("{method} {path}: {status} {}", detail.trim());
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            Err(Error::ObjectStore(format!("authentication rejected: {message}")))
        } else {
            Err(Error::ObjectStore(message))
        }
    }

    async fn transfer(&self, req: &TransferRequest) -> Result<u64> {
        enter(&self.name, TransferState::Authenticating);

        enter(&self.name, TransferState::VerifyingDestination);
        self.send(
            Method::GET,
            &self.container_path(),
            &[("restype", "container")],
            None,
            None,
        )
        .await?;

        enter(&self.name, TransferState::Streaming);
        let key = destination_key(&self.config.dir, &req.artifact);
        let start = Instant::now();
        let (mut reader, closer) = req.source.open(&req.artifact, &req.ctx).await?;
        let copied = self.upload_blocks(&key, &mut reader).await;
        drop(reader);

        let bytes = closer.settle(copied).await?;
        info!(
            container = %self.config.container,
            blob = %key,
            bytes,
            duration_ms = start.elapsed().as_millis() as u64,
            "Artifact uploaded"
        );
        Ok(bytes)
    }

    async fn upload_blocks<R>(&self, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let path = self.blob_path(key);
        let mut block_ids = Vec::new();
        let mut total = 0u64;

        loop {
            let block = read_part(reader, BLOCK_SIZE).await?;
            if block.is_empty() {
                break;
            }
            total += block.len() as u64;

            let id = block_id(block_ids.len());
            self.send(
                Method::PUT,
                &path,
                &[("comp", "block"), ("blockid", id.as_str())],
                None,
                Some(block),
            )
            .await?;
            debug!(blob = key, block = block_ids.len(), "Block staged");
            block_ids.push(id);
        }

        self.send(
            Method::PUT,
            &path,
            &[("comp", "blocklist")],
            Some("application/xml"),
            Some(block_list(&block_ids).into_bytes()),
        )
        .await?;
        Ok(total)
    }
}

/// Block ids within a blob must all have the same length.
fn block_id(index: usize) -> String {
    STANDARD.encode(format!("{index:08}"))
}

fn block_list(ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Shared Key string-to-sign for the Blob service.
fn string_to_sign(
    method: &str,
    content_length: usize,
    content_type: Option<&str>,
    ms_headers: &BTreeMap<String, String>,
    resource: &str,
    query: &[(&str, &str)],
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut out = format!(
        "{method}\n\n\n{length}\n\n{}\n\n\n\n\n\n\n",
        content_type.unwrap_or("")
    );
    for (name, value) in ms_headers {
        out.push_str(&format!("{}:{}\n", name.to_lowercase(), value.trim()));
    }
    out.push_str(resource);

    let mut params: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, value) in query {
        params.entry(name.to_lowercase()).or_default().push(value);
    }
    for (name, mut values) in params {
        values.sort_unstable();
        out.push_str(&format!("\n{name}:{}", values.join(",")));
    }
    out
}

fn sign(key: &[u8], to_sign: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(to_sign.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

#[async_trait]
impl StorageBackend for AzureBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, req: &TransferRequest) -> Result<u64, UploadError> {
        let span = info_span!("azure_save", target = %self.name, artifact = %req.artifact.file_name());
        finish_save(&self.name, self.transfer(req)).instrument(span).await
    }
}
