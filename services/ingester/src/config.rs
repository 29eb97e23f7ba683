//! Ingester configuration.
//!
//! Loaded from a single YAML file. `${VAR}` and `${VAR:-default}` are expanded
//! before parsing, then a fixed set of environment variables override the
//! connection settings.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use granule_common::TimeRange;
use ingestion::{
    BuilderConfig, CmrConfig, DiscoveryRequest, LinkSelector, ListingSource, LoaderConfig,
    MessageTemplate, PipelineConfig, TranscoderConfig,
};
use storage::{ObjectStorageConfig, QueueConfig};

/// Largest batch the queue backends will hand out.
const MAX_BATCH_SIZE: usize = 10_000;

/// Top-level ingester configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngesterConfig {
    pub queue: QueueSection,
    pub catalog: CatalogSection,
    /// Bucket the transcoder writes to; raster headers are read from here.
    pub output_storage: ObjectStorageConfig,
    #[serde(default)]
    pub cmr: CmrConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub discovery: Option<DiscoverySection>,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    pub redis_url: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(flatten)]
    pub settings: QueueConfig,
}

fn default_stream() -> String {
    "granule-ingest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSection {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// What the `discover` subcommand enumerates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    pub collection: String,
    /// Both ends are required; discovery never runs open-ended.
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub link_selector: LinkSelector,
    pub source: SourceSection,
    #[serde(default)]
    pub template: MessageTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSection {
    /// Search the granule catalog.
    Cmr,
    /// List a bucket, optionally in another account.
    Listing {
        #[serde(flatten)]
        listing: ListingSource,
        #[serde(default)]
        role_arn: Option<String>,
        #[serde(default)]
        external_id: Option<String>,
    },
}

impl DiscoverySection {
    pub fn time_range(&self) -> Result<TimeRange> {
        TimeRange::parse(&self.start, &self.end)
            .with_context(|| format!("Invalid discovery time range {} / {}", self.start, self.end))
    }

    pub fn request(&self) -> Result<DiscoveryRequest> {
        Ok(DiscoveryRequest {
            collection: self.collection.clone(),
            time_range: self.time_range()?,
            link_selector: self.link_selector.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Batch summaries kept for `/status`.
    #[serde(default = "default_recent_batches")]
    pub recent_batches: usize,
}

fn default_port() -> u16 {
    8082
}

fn default_recent_batches() -> usize {
    50
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            recent_batches: default_recent_batches(),
        }
    }
}

impl IngesterConfig {
    /// Read, expand, override from the process environment and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;
        serde_yaml::from_str(&expanded).context("Failed to parse ingester config")
    }

    /// Connection settings that deployments inject through the environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.catalog.database_url = url;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.queue.redis_url = url;
        }
        if let Some(endpoint) = lookup("TRANSCODER_URL") {
            self.transcoder.endpoint = Some(endpoint);
        }

        let store = &mut self.output_storage;
        if let Some(endpoint) = lookup("S3_ENDPOINT") {
            store.endpoint = Some(endpoint);
        }
        if let Some(bucket) = lookup("S3_BUCKET") {
            store.bucket = bucket;
        }
        if let Some(region) = lookup("S3_REGION") {
            store.region = region;
        }
        if let Some(key) = lookup("S3_ACCESS_KEY") {
            store.access_key_id = Some(key);
        }
        if let Some(secret) = lookup("S3_SECRET_KEY") {
            store.secret_access_key = Some(secret);
        }
        if let Some(allow) = lookup("S3_ALLOW_HTTP") {
            store.allow_http = allow == "true";
        }
    }

    pub fn validate(&self) -> Result<()> {
        let queue = &self.queue.settings;
        anyhow::ensure!(
            (1..=MAX_BATCH_SIZE).contains(&queue.max_batch_size),
            "max_batch_size must be between 1 and {}, got {}",
            MAX_BATCH_SIZE,
            queue.max_batch_size
        );
        anyhow::ensure!(queue.max_receive_count >= 1, "max_receive_count must be at least 1");
        anyhow::ensure!(
            self.pipeline.concurrency_limit >= 1,
            "concurrency_limit must be at least 1"
        );
        anyhow::ensure!(
            self.pipeline.item_timeout_secs >= 1,
            "item_timeout_secs must be at least 1"
        );

        // A message must stay hidden until its whole batch could have finished.
        let budget = self.pipeline.batch_budget(queue.max_batch_size);
        anyhow::ensure!(
            queue.visibility_timeout() >= budget,
            "visibility_timeout_secs ({}) is shorter than the worst-case batch time ({}s)",
            queue.visibility_timeout_secs,
            budget.as_secs()
        );

        if let Some(discovery) = &self.discovery {
            anyhow::ensure!(!discovery.collection.is_empty(), "discovery.collection cannot be empty");
            discovery.time_range()?;
            if let SourceSection::Listing { listing, .. } = &discovery.source {
                anyhow::ensure!(
                    !listing.store.bucket.is_empty(),
                    "discovery.source.store.bucket cannot be empty"
                );
            }
        }

        Ok(())
    }
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}` and `${VAR:-default}` in YAML content.
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::with_capacity(content.len());
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();

            let mut var_expr = String::new();
            let mut depth = 1;
            while depth > 0 {
                match chars.next() {
                    Some('{') => {
                        depth += 1;
                        var_expr.push('{');
                    }
                    Some('}') => {
                        depth -= 1;
                        if depth > 0 {
                            var_expr.push('}');
                        }
                    }
                    Some(c) => var_expr.push(c),
                    None => anyhow::bail!("Unclosed variable substitution: ${{{}", var_expr),
                }
            }

            result.push_str(&resolve_var_expr(&var_expr)?);
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

fn resolve_var_expr(expr: &str) -> Result<String> {
    if let Some((var_name, default)) = expr.split_once(":-") {
        match std::env::var(var_name.trim()) {
            Ok(val) if !val.is_empty() => Ok(val),
            _ => Ok(default.to_string()),
        }
    } else {
        std::env::var(expr.trim()).with_context(|| format!("Environment variable {} not set", expr))
    }
}
