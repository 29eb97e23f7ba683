//! Raster metadata for transcoded outputs: footprint, projection and bands.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use granule_common::BoundingBox;
use storage::{parse_object_uri, ObjectStorage};

use crate::config::BuilderConfig;
use crate::error::BuildError;
use crate::geotiff::{BandStatistics, GeoTiff, GeoTiffHeader, TiffError};

const EPSG_WGS84: u32 = 4326;
const EPSG_WEB_MERCATOR: u32 = 3857;

/// Headers larger than this are treated as corrupt.
const MAX_HEADER_BYTES: usize = 16 * 1024 * 1024;

/// What the catalog record needs to know about a raster.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub header: GeoTiffHeader,
    /// Per band; `None` when statistics were not requested or not computable.
    pub statistics: Option<Vec<Option<BandStatistics>>>,
}

impl RasterInfo {
    /// Footprint in WGS84 longitude/latitude.
    pub fn footprint(&self) -> Result<BoundingBox, BuildError> {
        match self.header.epsg {
            Some(EPSG_WGS84) => Ok(self.header.bbox),
            Some(EPSG_WEB_MERCATOR) => Ok(self.header.bbox.from_web_mercator()),
            Some(code) => Err(BuildError::UnsupportedProjection(format!("EPSG:{}", code))),
            None => Err(BuildError::UnsupportedProjection(
                "no EPSG code in GeoKeyDirectory".into(),
            )),
        }
    }

    /// `proj:*` item properties.
    pub fn projection_properties(&self) -> Map<String, Value> {
        let h = &self.header;
        let mut props = Map::new();
        props.insert("proj:epsg".into(), json!(h.epsg));
        props.insert("proj:shape".into(), json!([h.height, h.width]));
        props.insert("proj:transform".into(), json!(h.transform));
        props.insert("proj:bbox".into(), json!(h.bbox.to_array()));
        props
    }

    /// `raster:bands` asset field.
    pub fn raster_bands(&self) -> Value {
        let h = &self.header;
        let bands: Vec<Value> = (0..h.bands as usize)
            .map(|i| {
                let mut band = Map::new();
                band.insert("data_type".into(), json!(h.data_type.as_str()));
                if let Some(nodata) = h.nodata {
                    band.insert("nodata".into(), nodata_value(nodata));
                }
                if let Some(stats) = self.statistics.as_ref().and_then(|s| s.get(i).copied().flatten()) {
                    band.insert(
                        "statistics".into(),
                        json!({
                            "minimum": stats.minimum,
                            "maximum": stats.maximum,
                            "mean": stats.mean,
                            "stddev": stats.stddev,
                            "valid_percent": stats.valid_percent,
                        }),
                    );
                }
                Value::Object(band)
            })
            .collect();
        Value::Array(bands)
    }
}

/// JSON has no NaN or infinity; the raster extension spells them as strings.
fn nodata_value(nodata: f64) -> Value {
    if nodata.is_nan() {
        json!("nan")
    } else if nodata.is_infinite() {
        json!(if nodata > 0.0 { "inf" } else { "-inf" })
    } else {
        json!(nodata)
    }
}

/// Reads raster metadata from a stored output.
#[async_trait]
pub trait RasterInspector: Send + Sync {
    async fn inspect(&self, uri: &str) -> Result<RasterInfo, BuildError>;
}

/// Reads GeoTIFF headers from object storage with ranged reads.
pub struct GeoTiffInspector {
    stores: Vec<ObjectStorage>,
    header_bytes: usize,
    compute_statistics: bool,
}

impl GeoTiffInspector {
    pub fn new(store: ObjectStorage, config: &BuilderConfig) -> Self {
        Self {
            stores: vec![store],
            header_bytes: config.header_bytes.max(16),
            compute_statistics: config.compute_statistics,
        }
    }

    /// Also resolve URIs in another bucket (e.g. passthrough sources).
    pub fn with_store(mut self, store: ObjectStorage) -> Self {
        self.stores.push(store);
        self
    }

    fn resolve(&self, uri: &str) -> Result<(&ObjectStorage, String), BuildError> {
        let raster_err = |reason: String| BuildError::Raster {
            uri: uri.to_string(),
            reason,
        };
        let (bucket, key) = parse_object_uri(uri).map_err(|e| raster_err(e.to_string()))?;
        let store = self
            .stores
            .iter()
            .find(|s| s.bucket() == bucket)
            .ok_or_else(|| raster_err(format!("no store configured for bucket {}", bucket)))?;
        Ok((store, key))
    }

    async fn read_header(&self, store: &ObjectStorage, key: &str) -> Result<RasterInfo, TiffError> {
        let mut want = self.header_bytes;
        loop {
            let data = store
                .get_range(key, 0, want)
                .await
                .map_err(|e| TiffError::Malformed(e.to_string()))?;
            match GeoTiff::parse(&data) {
                Ok(tiff) => {
                    return Ok(RasterInfo {
                        header: tiff.header,
                        statistics: None,
                    })
                }
                Err(TiffError::Truncated { needed }) if data.len() == want && want < MAX_HEADER_BYTES => {
                    want = needed.max(want * 2).min(MAX_HEADER_BYTES);
                    debug!(key, want, "Header exceeds initial range; refetching");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_full(&self, store: &ObjectStorage, key: &str) -> Result<RasterInfo, TiffError> {
        let data = store
            .get(key)
            .await
            .map_err(|e| TiffError::Malformed(e.to_string()))?;

        // Inflating and scanning every pixel is CPU-bound; keep it off the
        // executor so sibling items and their timeouts keep running.
        tokio::task::spawn_blocking(move || -> Result<RasterInfo, TiffError> {
            let tiff = GeoTiff::parse(&data)?;
            let statistics = tiff.statistics()?;
            Ok(RasterInfo {
                header: tiff.header.clone(),
                statistics,
            })
        })
        .await
        .map_err(|e| TiffError::Malformed(format!("statistics task failed: {}", e)))?
    }
}

#[async_trait]
impl RasterInspector for GeoTiffInspector {
    #[instrument(skip(self))]
    async fn inspect(&self, uri: &str) -> Result<RasterInfo, BuildError> {
        let (store, key) = self.resolve(uri)?;
        let result = if self.compute_statistics {
            self.read_full(store, &key).await
        } else {
            self.read_header(store, &key).await
        };
        result.map_err(|e| BuildError::Raster {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
    }
}
