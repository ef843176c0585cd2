//! S3 and S3-compatible object stores.
//!
//! One backend implementation serves every provider; a provider only
//! contributes defaults (endpoint template, region, addressing style) which
//! explicit settings override.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::Client;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::sync::OnceCell;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{
    StorageBackend, StorageTarget, TransferRequest, TransferState, UploadError, destination_key,
    enter, finish_save, read_part,
};
use crate::error::{Error, Result};

/// Multipart part size. Artifacts smaller than one part go up in a single PUT.
const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Provider {
    Aws,
    Minio,
    R2,
    B2,
    Spaces,
    Yandex,
}

struct Preset {
    endpoint: Option<&'static str>,
    region: &'static str,
    path_style: bool,
}

impl S3Provider {
    pub const ALL: [S3Provider; 6] = [
        S3Provider::Aws,
        S3Provider::Minio,
        S3Provider::R2,
        S3Provider::B2,
        S3Provider::Spaces,
        S3Provider::Yandex,
    ];

    /// Storage type tag in the configuration.
    pub fn tag(self) -> &'static str {
        match self {
            S3Provider::Aws => "s3",
            S3Provider::Minio => "minio",
            S3Provider::R2 => "r2",
            S3Provider::B2 => "b2",
            S3Provider::Spaces => "spaces",
            S3Provider::Yandex => "yandex",
        }
    }

    fn preset(self) -> Preset {
        match self {
            S3Provider::Aws => Preset {
                endpoint: None,
                region: "us-east-1",
                path_style: false,
            },
            S3Provider::Minio => Preset {
                endpoint: Some("http://localhost:9000"),
                region: "us-east-1",
                path_style: true,
            },
            S3Provider::R2 => Preset {
                endpoint: Some("https://{account_id}.r2.cloudflarestorage.com"),
                region: "auto",
                path_style: true,
            },
            S3Provider::B2 => Preset {
                endpoint: Some("https://s3.{region}.backblazeb2.com"),
                region: "us-west-004",
                path_style: false,
            },
            S3Provider::Spaces => Preset {
                endpoint: Some("https://{region}.digitaloceanspaces.com"),
                region: "nyc3",
                path_style: false,
            },
            S3Provider::Yandex => Preset {
                endpoint: Some("https://storage.yandexcloud.net"),
                region: "ru-central1",
                path_style: false,
            },
        }
    }
}

impl fmt::Display for S3Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Clone, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, alias = "key_id")]
    pub access_key_id: Option<String>,
    #[serde(default, alias = "application_key", alias = "secret_key")]
    pub secret_access_key: Option<String>,
    /// Cloudflare account, fills the R2 endpoint template.
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub path_style: Option<bool>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("dir", &self.dir)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| crate::mask::MASK),
            )
            .field("account_id", &self.account_id)
            .field("path_style", &self.path_style)
            .finish()
    }
}

/// Where and how to address the bucket once provider defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub endpoint: Option<String>,
    pub region: String,
    pub path_style: bool,
}

pub fn resolve(provider: S3Provider, config: &S3Config) -> Result<ResolvedEndpoint> {
    let preset = provider.preset();
    let region = config
        .region
        .clone()
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| preset.region.to_string());

    let endpoint = match config.endpoint.as_deref().filter(|e| !e.is_empty()) {
        Some(explicit) => Some(explicit.to_string()),
        None => match preset.endpoint {
            Some(template) => Some(fill_template(provider, template, &region, config)?),
            None => None,
        },
    };

    Ok(ResolvedEndpoint {
        endpoint,
        region,
        path_style: config.path_style.unwrap_or(preset.path_style),
    })
}

fn fill_template(
    provider: S3Provider,
    template: &str,
    region: &str,
    config: &S3Config,
) -> Result<String> {
    let mut endpoint = template.replace("{region}", region);
    if endpoint.contains("{account_id}") {
        let account = config.account_id.as_deref().ok_or_else(|| {
            Error::Config(format!("{provider} storage needs account_id or endpoint"))
        })?;
        endpoint = endpoint.replace("{account_id}", account);
    }
    Ok(endpoint)
}

pub struct S3Backend {
    name: String,
    provider: S3Provider,
    config: S3Config,
    endpoint: ResolvedEndpoint,
    client: OnceCell<Client>,
}

impl S3Backend {
    pub fn new(name: impl Into<String>, provider: S3Provider, config: S3Config) -> Result<Self> {
        if config.access_key_id.is_some() != config.secret_access_key.is_some() {
            return Err(Error::Config(format!(
                "{provider} storage needs both access_key_id and secret_access_key"
            )));
        }
        let endpoint = resolve(provider, &config)?;
        Ok(Self {
            name: name.into(),
            provider,
            config,
            endpoint,
            client: OnceCell::new(),
        })
    }

    pub fn from_target(
        provider: S3Provider,
        target: &StorageTarget,
    ) -> Result<Arc<dyn StorageBackend>> {
        Ok(Arc::new(Self::new(&target.name, provider, target.settings()?)?))
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.endpoint.region.clone()));
                if let (Some(id), Some(secret)) =
                    (&self.config.access_key_id, &self.config.secret_access_key)
                {
                    loader = loader
                        .credentials_provider(Credentials::new(id, secret, None, None, "sshdump"));
                }
                if let Some(endpoint) = &self.endpoint.endpoint {
                    loader = loader.endpoint_url(endpoint);
                }
                let sdk_config = loader.load().await;

                let s3_config = s3::config::Builder::from(&sdk_config)
                    .force_path_style(self.endpoint.path_style)
                    .build();
                debug!(provider = %self.provider, endpoint = ?self.endpoint, "S3 client ready");
                Client::from_conf(s3_config)
            })
            .await
    }

    async fn transfer(&self, req: &TransferRequest) -> Result<u64> {
        enter(&self.name, TransferState::Authenticating);
        let client = self.client().await;

        enter(&self.name, TransferState::VerifyingDestination);
        client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|e| store_error(&format!("bucket {}", self.config.bucket), e))?;

        enter(&self.name, TransferState::Streaming);
        let key = destination_key(&self.config.dir, &req.artifact);
        let start = Instant::now();
        let (mut reader, closer) = req.source.open(&req.artifact, &req.ctx).await?;
        let copied = self.upload(client, &key, &mut reader).await;
        drop(reader);

        let bytes = closer.settle(copied).await?;
        info!(
            bucket = %self.config.bucket,
            key = %key,
            bytes,
            duration_ms = start.elapsed().as_millis() as u64,
            "Artifact uploaded"
        );
        Ok(bytes)
    }

    async fn upload<R>(&self, client: &Client, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let first = read_part(reader, PART_SIZE).await?;
        if first.len() < PART_SIZE {
            let len = first.len() as u64;
            client
                .put_object()
                .bucket(&self.config.bucket)
                .key(key)
                .content_length(len as i64)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(|e| store_error(&format!("put {key}"), e))?;
            return Ok(len);
        }

        let created = client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error(&format!("create multipart upload {key}"), e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::ObjectStore(format!("no upload id returned for {key}")))?
            .to_string();

        match self.upload_parts(client, key, &upload_id, first, reader).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                if let Err(abort_err) = client
                    .abort_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %DisplayErrorContext(&abort_err), "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        client: &Client,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        reader: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut parts = Vec::new();
        let mut part = first;
        let mut part_number = 1;
        let mut total = 0u64;

        while !part.is_empty() {
            total += part.len() as u64;
            let uploaded = client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| store_error(&format!("upload part {part_number} of {key}"), e))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
            debug!(key, part_number, "Part uploaded");

            part_number += 1;
            part = read_part(reader, PART_SIZE).await?;
        }

        client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| store_error(&format!("complete multipart upload {key}"), e))?;

        Ok(total)
    }
}

fn store_error<E>(what: &str, err: E) -> Error
where
    E: std::error::Error + 'static,
{
    Error::ObjectStore(format!("{what}: {}", DisplayErrorContext(&err)))
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, req: &TransferRequest) -> Result<u64, UploadError> {
        let span = info_span!(
            "s3_save",
            target = %self.name,
            provider = %self.provider,
            artifact = %req.artifact.file_name()
        );
        finish_save(&self.name, self.transfer(req)).instrument(span).await
    }
}
