//! Payload packaging and submission to the ingestion gateway.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, instrument};

use pipecheck_common::{Error, Result};

use crate::auth::Token;
use crate::config::GatewayConfig;
use crate::context::ScenarioContext;
use crate::http;
use crate::sample::{ReportFile, ReportKind, ReportWindow};

/// Header carrying the per-upload request id
pub const REQUEST_ID_HEADER: &str = "x-rh-insights-request-id";

/// Name of the manifest inside the archive
pub const MANIFEST_NAME: &str = "manifest.json";

/// Version string written into generated manifests
const MANIFEST_VERSION: &str = concat!("pipecheck-", env!("CARGO_PKG_VERSION"));

/// Manifest describing an uploaded payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportManifest {
    /// Payload id
    pub uuid: String,
    /// Correlation key
    pub cluster_id: String,
    /// Producer version
    pub version: String,
    /// When the payload was built
    pub date: DateTime<Utc>,
    /// Cost report file names
    pub files: Vec<String>,
    /// Resource optimization report file names
    #[serde(default)]
    pub resource_optimization_files: Vec<String>,
    /// Start of the reporting window
    pub start: DateTime<Utc>,
    /// End of the reporting window
    pub end: DateTime<Utc>,
    /// Whether the payload comes from a certified producer
    pub certified: bool,
}

impl ReportManifest {
    /// Describe `files` as one payload for `correlation_key`
    pub fn new(
        uuid: impl Into<String>,
        correlation_key: impl Into<String>,
        files: &[ReportFile],
        window: ReportWindow,
        now: DateTime<Utc>,
    ) -> Self {
        let names = |kind: ReportKind| {
            files
                .iter()
                .filter(|f| f.kind == kind)
                .map(|f| f.name.clone())
                .collect::<Vec<_>>()
        };
        Self {
            uuid: uuid.into(),
            cluster_id: correlation_key.into(),
            version: MANIFEST_VERSION.to_string(),
            date: now,
            files: names(ReportKind::Cost),
            resource_optimization_files: names(ReportKind::ResourceOptimization),
            start: window.start,
            end: window.end,
            certified: true,
        }
    }
}

/// A gzipped tarball of a manifest and its report files
///
/// Backed by a temporary file that is removed when the artifact is dropped,
/// whatever the upload outcome.
#[derive(Debug)]
pub struct UploadArtifact {
    file: NamedTempFile,
    manifest: ReportManifest,
}

impl UploadArtifact {
    /// Write the archive into a new temporary file under `dir`
    pub fn build(dir: &Path, manifest: ReportManifest, files: &[ReportFile]) -> Result<Self> {
        if files.is_empty() {
            return Err(Error::config("an upload needs at least one report file"));
        }

        let file = tempfile::Builder::new()
            .prefix("pipecheck-")
            .suffix(".tar.gz")
            .tempfile_in(dir)?;

        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let mtime = manifest.date.timestamp().max(0) as u64;

        let encoder = GzEncoder::new(file.as_file(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append(&mut builder, MANIFEST_NAME, &manifest_json, mtime)?;
        for report in files {
            append(&mut builder, &report.name, &report.contents, mtime)?;
        }
        builder.into_inner()?.finish()?.flush()?;

        Ok(Self { file, manifest })
    }

    /// Path of the archive on disk
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Manifest packed into the archive
    pub fn manifest(&self) -> &ReportManifest {
        &self.manifest
    }

    /// File name presented to the gateway
    pub fn file_name(&self) -> String {
        format!("{}.tar.gz", self.manifest.uuid)
    }
}

fn append<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    mtime: u64,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// What the gateway accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Request id sent with the upload
    pub request_id: String,
    /// Payload id from the manifest
    pub payload_id: String,
    /// Gateway status (200 or 202)
    pub status: u16,
}

/// Packages report files and posts them to the ingestion gateway
#[derive(Debug, Clone)]
pub struct PayloadUploader {
    client: reqwest::Client,
    upload_url: String,
    content_type: String,
    temp_dir: PathBuf,
}

impl PayloadUploader {
    /// Create an uploader posting to `upload_url`
    pub fn new(
        client: reqwest::Client,
        upload_url: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            client,
            upload_url: upload_url.into(),
            content_type: content_type.into(),
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Create an uploader from the gateway section of the config
    pub fn from_config(config: &GatewayConfig, timeout: Duration) -> Result<Self> {
        let url = config
            .upload_url()
            .ok_or_else(|| Error::config("gateway.base_url is required"))?;
        Ok(Self::new(
            http::build_client(timeout, config.insecure_tls)?,
            url,
            &config.content_type,
        ))
    }

    /// Build archives under `dir` instead of the system temp directory
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Upload `files` for the context's correlation key
    ///
    /// When `files` is empty a sample report for the current hour is
    /// generated. Only HTTP 200 and 202 count as success; nothing is retried.
    #[instrument(
        skip(self, ctx, token, files),
        fields(correlation_key = %ctx.correlation_key())
    )]
    pub async fn upload(
        &self,
        ctx: &ScenarioContext,
        token: &Token,
        files: &[ReportFile],
    ) -> Result<UploadReceipt> {
        let now = Utc::now();
        let payload_id = uuid::Uuid::new_v4().to_string();
        let window = ReportWindow::hour_of(now);

        let generated;
        let files = if files.is_empty() {
            generated = crate::sample::generate(&payload_id, window)?;
            generated.as_slice()
        } else {
            files
        };

        let manifest = ReportManifest::new(&payload_id, ctx.correlation_key(), files, window, now);
        let artifact = UploadArtifact::build(&self.temp_dir, manifest, files)?;
        ctx.guard("upload", self.send(ctx, token, &artifact)).await
    }

    async fn send(
        &self,
        ctx: &ScenarioContext,
        token: &Token,
        artifact: &UploadArtifact,
    ) -> Result<UploadReceipt> {
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let mut log = ctx.diagnostics().begin("upload")?;
        log.record(format_args!(
            "POST {} request_id={} payload={} files={:?} ros_files={:?}",
            self.upload_url,
            request_id,
            artifact.manifest().uuid,
            artifact.manifest().files,
            artifact.manifest().resource_optimization_files,
        ));

        let bytes = tokio::fs::read(artifact.path()).await?;
        let part = Part::bytes(bytes)
            .file_name(artifact.file_name())
            .mime_str(&self.content_type)
            .map_err(|e| Error::config(format!("invalid content type: {}", e)))?;
        let form = Form::new().part("file", part);

        let response = match self
            .client
            .post(&self.upload_url)
            .bearer_auth(token.secret())
            .header(REQUEST_ID_HEADER, &request_id)
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                log.fail(&e);
                return Err(Error::http("upload", &e));
            }
        };

        let status = response.status().as_u16();
        if status != 200 && status != 202 {
            let body = http::error_body(response, &[token.secret()]).await;
            log.fail(format_args!("HTTP {}: {}", status, body));
            return Err(Error::upload(status, body));
        }

        log.record(format_args!("HTTP {}", status));
        log.succeed();
        info!(status, request_id = %request_id, "Gateway accepted payload");

        Ok(UploadReceipt {
            request_id,
            payload_id: artifact.manifest().uuid.clone(),
            status,
        })
    }
}
