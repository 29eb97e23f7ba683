//! Adapters to the raster transcoding service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::TranscoderConfig;
use crate::error::TranscodeError;

/// Converts a source raster into a cloud-optimized GeoTIFF.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Transcode `source_uri` for `collection` and return the output URI.
    async fn transcode(&self, collection: &str, source_uri: &str) -> Result<String, TranscodeError>;
}

/// Scheme and file name of a source URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile<'a> {
    pub scheme: &'a str,
    pub file_name: &'a str,
    /// Lowercased extension without the dot.
    pub extension: String,
}

impl<'a> SourceFile<'a> {
    pub fn parse(uri: &'a str) -> Result<Self, TranscodeError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| TranscodeError::InvalidSource(format!("{} has no scheme", uri)))?;
        if !matches!(scheme, "s3" | "http" | "https") {
            return Err(TranscodeError::InvalidSource(format!(
                "unsupported scheme '{}' in {}",
                scheme, uri
            )));
        }

        let path = rest.split(['?', '#']).next().unwrap_or_default();
        let (host, path) = path.split_once('/').unwrap_or((path, ""));
        let file_name = path.rsplit('/').next().unwrap_or_default();
        if host.is_empty() || file_name.is_empty() {
            return Err(TranscodeError::InvalidSource(format!("{} has no file name", uri)));
        }

        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        Ok(Self {
            scheme,
            file_name,
            extension,
        })
    }

    /// File name without its final extension.
    pub fn stem(&self) -> &'a str {
        self.file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .filter(|stem| !stem.is_empty())
            .unwrap_or(self.file_name)
    }

    pub fn is_geotiff(&self) -> bool {
        matches!(self.extension.as_str(), "tif" | "tiff")
    }
}

/// Deterministic output location: `{output_prefix}/{collection}/{stem}.tif`.
pub fn output_uri_for(output_prefix: &str, collection: &str, source: &SourceFile<'_>) -> String {
    format!(
        "{}/{}/{}.tif",
        output_prefix.trim_end_matches('/'),
        collection,
        source.stem()
    )
}

#[derive(Debug, Serialize)]
struct TranscodeRequest<'a> {
    source_uri: &'a str,
    output_uri: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranscodeResponse {
    #[serde(default)]
    output_uri: Option<String>,
}

/// Calls an HTTP transcoding service.
pub struct HttpTranscoder {
    client: reqwest::Client,
    endpoint: String,
    output_prefix: String,
    allowed_extensions: Vec<String>,
    timeout: Duration,
}

impl HttpTranscoder {
    pub fn new(endpoint: impl Into<String>, config: &TranscoderConfig) -> Result<Self, TranscodeError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TranscodeError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            output_prefix: config.output_prefix.clone(),
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            timeout: config.timeout(),
        })
    }

    async fn request(&self, source_uri: &str, output_uri: &str) -> Result<String, TranscodeError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&TranscodeRequest {
                source_uri,
                output_uri,
            })
            .send()
            .await
            .map_err(|e| TranscodeError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                415 | 422 => TranscodeError::UnsupportedFormat(format!("{}: {}", source_uri, message)),
                code => TranscodeError::Service {
                    status: code,
                    message,
                },
            });
        }

        // Services that reply without a body wrote to the requested location.
        let body = response
            .bytes()
            .await
            .map_err(|e| TranscodeError::Request(e.to_string()))?;
        let returned = serde_json::from_slice::<TranscodeResponse>(&body)
            .ok()
            .and_then(|r| r.output_uri);
        Ok(returned.unwrap_or_else(|| output_uri.to_string()))
    }
}

#[async_trait]
impl Transcoder for HttpTranscoder {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn transcode(&self, collection: &str, source_uri: &str) -> Result<String, TranscodeError> {
        let source = SourceFile::parse(source_uri)?;
        if !self.allowed_extensions.iter().any(|ext| ext == &source.extension) {
            return Err(TranscodeError::UnsupportedFormat(source_uri.to_string()));
        }

        let output_uri = output_uri_for(&self.output_prefix, collection, &source);
        let result = tokio::time::timeout(self.timeout, self.request(source_uri, &output_uri))
            .await
            .map_err(|_| TranscodeError::Timeout(self.timeout))??;

        debug!(output = %result, "Transcoded");
        Ok(result)
    }
}

/// For sources that are already GeoTIFFs: returns the source unchanged.
#[derive(Debug, Default)]
pub struct PassthroughTranscoder;

#[async_trait]
impl Transcoder for PassthroughTranscoder {
    async fn transcode(&self, _collection: &str, source_uri: &str) -> Result<String, TranscodeError> {
        let source = SourceFile::parse(source_uri)?;
        if !source.is_geotiff() {
            return Err(TranscodeError::UnsupportedFormat(source_uri.to_string()));
        }
        Ok(source_uri.to_string())
    }
}
