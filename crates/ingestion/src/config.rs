//! Tuning for the per-item pipeline stages.
//!
//! Each component receives its own section; nothing here is global.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Granule catalog (CMR) access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmrConfig {
    #[serde(default = "default_cmr_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Stop discovery after this many granules.
    #[serde(default)]
    pub max_granules: Option<usize>,
    #[serde(default = "default_cmr_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_cmr_url() -> String {
    "https://cmr.earthdata.nasa.gov".to_string()
}

fn default_page_size() -> usize {
    200
}

fn default_cmr_timeout_secs() -> u64 {
    30
}

impl Default for CmrConfig {
    fn default() -> Self {
        Self {
            base_url: default_cmr_url(),
            page_size: default_page_size(),
            max_granules: None,
            timeout_secs: default_cmr_timeout_secs(),
        }
    }
}

impl CmrConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// HTTP transcoding service. Without one, only GeoTIFF sources are accepted.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Prefix for transcoded outputs, e.g. `s3://bucket/cogs`.
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    #[serde(default = "default_transcode_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_output_prefix() -> String {
    "s3://granule-outputs/cogs".to_string()
}

fn default_transcode_timeout_secs() -> u64 {
    120
}

fn default_allowed_extensions() -> Vec<String> {
    [".he5", ".h5", ".hdf", ".nc", ".nc4", ".tif", ".tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            output_prefix: default_output_prefix(),
            timeout_secs: default_transcode_timeout_secs(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl TranscoderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Granule links with these suffixes become source assets.
    #[serde(default = "default_source_suffixes")]
    pub source_asset_suffixes: Vec<String>,
    /// Name of the transcoded output asset unless the event overrides it.
    #[serde(default = "default_output_asset_name")]
    pub output_asset_name: String,
    /// Read the whole output to add per-band statistics.
    #[serde(default)]
    pub compute_statistics: bool,
    /// Initial byte range fetched to parse the GeoTIFF header.
    #[serde(default = "default_header_bytes")]
    pub header_bytes: usize,
}

fn default_source_suffixes() -> Vec<String> {
    [".he5", ".h5", ".hdf", ".nc", ".nc4"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_output_asset_name() -> String {
    "cog".to_string()
}

fn default_header_bytes() -> usize {
    64 * 1024
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            source_asset_suffixes: default_source_suffixes(),
            output_asset_name: default_output_asset_name(),
            compute_statistics: false,
            header_bytes: default_header_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directory for NDJSON staging files; the system temp dir when unset.
    #[serde(default)]
    pub staging_dir: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Most item pipelines running at once within a batch.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Budget for transcode + build + load of one item.
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
}

fn default_concurrency_limit() -> usize {
    8
}

fn default_item_timeout_secs() -> u64 {
    300
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            item_timeout_secs: default_item_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    /// Worst-case wall time for one batch of `batch_size` items.
    pub fn batch_budget(&self, batch_size: usize) -> Duration {
        let waves = batch_size.div_ceil(self.concurrency_limit.max(1)) as u32;
        self.item_timeout() * waves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_budget_rounds_waves_up() {
        let config = PipelineConfig {
            concurrency_limit: 8,
            item_timeout_secs: 100,
        };
        assert_eq!(config.batch_budget(10), Duration::from_secs(200));
        assert_eq!(config.batch_budget(8), Duration::from_secs(100));
        assert_eq!(config.batch_budget(0), Duration::ZERO);
    }

    #[test]
    fn test_sections_deserialize_from_empty_yaml() {
        let builder: BuilderConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(builder.output_asset_name, "cog");
        assert!(builder.source_asset_suffixes.contains(&".he5".to_string()));

        let transcoder: TranscoderConfig = serde_yaml::from_str("timeout_secs: 5").unwrap();
        assert_eq!(transcoder.timeout(), Duration::from_secs(5));
        assert!(transcoder.endpoint.is_none());
    }
}
