//! Turns a validated ingest event plus its transcoded output into a catalog record.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use granule_common::parse_datetime_flexible;

use crate::cmr::{CmrClient, Granule};
use crate::config::BuilderConfig;
use crate::error::BuildError;
use crate::event::{AssetOverrides, IngestEvent, IngestMessage, PatternEvent};
use crate::raster::RasterInspector;
use crate::record::{Asset, CatalogRecord, Link, Temporal, PROJECTION_EXTENSION, RASTER_EXTENSION};
use crate::transcode::SourceFile;

pub const COG_MEDIA_TYPE: &str = "image/tiff; application=geotiff";

/// Media type for a source file, by extension.
fn media_type_for(href: &str) -> &'static str {
    let lower = href.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or_default();
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("he5" | "h5" | "hdf") => "application/x-hdf5",
        Some("nc" | "nc4") => "application/netcdf",
        Some("tif" | "tiff") => COG_MEDIA_TYPE,
        _ => "application/octet-stream",
    }
}

fn parse_at(key: &str, field: &str, value: &str) -> Result<DateTime<Utc>, BuildError> {
    parse_datetime_flexible(value).map_err(|e| BuildError::DatetimeParse {
        key: key.to_string(),
        reason: format!("{} '{}': {}", field, value, e),
    })
}

/// Temporal extent for a pattern event: explicit overrides first, then the key.
pub fn pattern_temporal(event: &PatternEvent) -> Result<Temporal, BuildError> {
    let key = event.object_key.as_str();

    if let Some(single) = &event.single_datetime {
        return Ok(Temporal::Instant(parse_at(key, "single_datetime", single)?));
    }

    match (&event.start_datetime, &event.end_datetime) {
        (Some(start), Some(end)) => {
            let start = parse_at(key, "start_datetime", start)?;
            let end = parse_at(key, "end_datetime", end)?;
            if start > end {
                return Err(BuildError::DatetimeParse {
                    key: key.to_string(),
                    reason: format!("start_datetime {} is after end_datetime {}", start, end),
                });
            }
            return Ok(Temporal::Range { start, end });
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(BuildError::DatetimeParse {
                key: key.to_string(),
                reason: "start_datetime and end_datetime must be given together".into(),
            });
        }
        (None, None) => {}
    }

    let captured = event.pattern.capture(key)?;
    let instant = parse_at(key, "captured value", &captured)?;
    match event.datetime_range {
        Some(interval) => {
            let (start, end) = interval.expand(instant).map_err(|e| BuildError::DatetimeParse {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Temporal::Range { start, end })
        }
        None => Ok(Temporal::Instant(instant)),
    }
}

/// Metadata gathered before the raster is inspected.
struct Described {
    temporal: Temporal,
    properties: Map<String, Value>,
    source_assets: BTreeMap<String, Asset>,
}

pub struct CatalogItemBuilder {
    cmr: Arc<dyn CmrClient>,
    inspector: Arc<dyn RasterInspector>,
    config: BuilderConfig,
}

impl CatalogItemBuilder {
    pub fn new(cmr: Arc<dyn CmrClient>, inspector: Arc<dyn RasterInspector>, config: BuilderConfig) -> Self {
        Self { cmr, inspector, config }
    }

    /// Validate a raw message and build its record. Shape errors are returned
    /// before any catalog or storage call.
    pub async fn build_message(&self, message: IngestMessage, output_uri: &str) -> Result<CatalogRecord, BuildError> {
        let event = IngestEvent::try_from(message)?;
        self.build(&event, output_uri).await
    }

    #[instrument(skip(self, event), fields(collection = event.collection(), key = event.object_key()))]
    pub async fn build(&self, event: &IngestEvent, output_uri: &str) -> Result<CatalogRecord, BuildError> {
        let described = match event {
            IngestEvent::CatalogLinked { granule_id, .. } => self.describe_granule(granule_id).await?,
            IngestEvent::Pattern(pattern) => Described {
                temporal: pattern_temporal(pattern)?,
                properties: pattern.properties.clone(),
                source_assets: BTreeMap::new(),
            },
        };

        let id = SourceFile::parse(output_uri)
            .map(|f| f.stem().to_string())
            .map_err(|e| BuildError::InvalidRecord(e.to_string()))?;

        let raster = self.inspector.inspect(output_uri).await?;
        let bbox = raster.footprint()?;

        let mut properties = described.properties;
        properties.extend(raster.projection_properties());

        let (name, mut output) = self.output_asset(output_uri, event.assets());
        output.extra.insert("raster:bands".into(), raster.raster_bands());

        let mut assets = described.source_assets;
        assets.insert(name, output);

        let record = CatalogRecord {
            id,
            collection: event.collection().to_string(),
            geometry: bbox.to_geojson_polygon(),
            bbox,
            temporal: described.temporal,
            properties,
            assets,
            links: vec![Link {
                rel: "derived_from".into(),
                href: event.object_key().to_string(),
            }],
            stac_extensions: vec![PROJECTION_EXTENSION.to_string(), RASTER_EXTENSION.to_string()],
        };
        record.validate(event.collection())?;

        debug!(id = %record.id, "Built catalog record");
        Ok(record)
    }

    async fn describe_granule(&self, granule_id: &str) -> Result<Described, BuildError> {
        let granule = self
            .cmr
            .granule(granule_id)
            .await
            .map_err(|e| BuildError::Catalog(e.to_string()))?
            .ok_or_else(|| BuildError::GranuleNotFound(granule_id.to_string()))?;

        let time_start = granule.time_start.as_deref().ok_or_else(|| BuildError::DatetimeParse {
            key: granule_id.to_string(),
            reason: "granule has no time_start".into(),
        })?;
        let temporal = Temporal::Instant(parse_at(granule_id, "time_start", time_start)?);

        let mut properties = granule.metadata();
        properties.remove("links");

        Ok(Described {
            temporal,
            properties,
            source_assets: self.source_assets(&granule),
        })
    }

    fn source_assets(&self, granule: &Granule) -> BTreeMap<String, Asset> {
        granule
            .links
            .iter()
            .filter(|link| {
                let href = link.href.to_ascii_lowercase();
                self.config
                    .source_asset_suffixes
                    .iter()
                    .any(|suffix| href.ends_with(&suffix.to_ascii_lowercase()))
            })
            .map(|link| {
                let name = link.title.clone().unwrap_or_else(|| {
                    link.href.rsplit('/').next().unwrap_or(&link.href).to_string()
                });
                let mut asset = Asset::new(link.href.clone())
                    .with_media_type(media_type_for(&link.href))
                    .with_roles(["data"]);
                if let Some(title) = &link.title {
                    asset = asset.with_title(title.clone());
                }
                (name, asset)
            })
            .collect()
    }

    fn output_asset(&self, output_uri: &str, overrides: &AssetOverrides) -> (String, Asset) {
        let name = overrides
            .name
            .clone()
            .unwrap_or_else(|| self.config.output_asset_name.clone());
        let roles = overrides.roles.clone().unwrap_or_else(|| vec!["data".to_string()]);
        let media_type = overrides
            .media_type
            .clone()
            .unwrap_or_else(|| COG_MEDIA_TYPE.to_string());

        let asset = Asset::new(output_uri)
            .with_media_type(media_type)
            .with_roles(roles)
            .with_title("COG");
        (name, asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FilenamePattern;
    use chrono::TimeZone;
    use granule_common::DatetimeInterval;

    fn pattern_event(key: &str) -> PatternEvent {
        PatternEvent {
            collection: "OMSO2PCA".into(),
            object_key: key.into(),
            pattern: FilenamePattern::new(r"^(.*?)(_)([0-9][0-9][0-9][0-9])(.tif)$", 3),
            start_datetime: None,
            end_datetime: None,
            single_datetime: None,
            datetime_range: None,
            properties: Map::new(),
            assets: AssetOverrides::default(),
        }
    }

    #[test]
    fn test_year_from_key_expands_to_range() {
        let mut event = pattern_event("OMSO2PCA_LUT_SCD_2005.tif");
        event.datetime_range = Some(DatetimeInterval::Year);
        let temporal = pattern_temporal(&event).unwrap();
        assert_eq!(
            temporal,
            Temporal::Range {
                start: Utc.with_ymd_and_hms(2005, 1, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2005, 12, 31, 23, 59, 59).unwrap(),
            }
        );
    }

    #[test]
    fn test_overrides_win_over_key() {
        let mut event = pattern_event("no-date-here.tif");
        event.single_datetime = Some("2010-06-01T12:00:00Z".into());
        assert_eq!(
            pattern_temporal(&event).unwrap(),
            Temporal::Instant(Utc.with_ymd_and_hms(2010, 6, 1, 12, 0, 0).unwrap())
        );

        let mut half = pattern_event("OMSO2PCA_LUT_SCD_2005.tif");
        half.start_datetime = Some("2005-01-01".into());
        assert!(matches!(pattern_temporal(&half), Err(BuildError::DatetimeParse { .. })));
    }

    #[test]
    fn test_inverted_override_range_is_datetime_error() {
        let mut event = pattern_event("OMSO2PCA_LUT_SCD_2005.tif");
        event.start_datetime = Some("2006-01-01T00:00:00Z".into());
        event.end_datetime = Some("2005-01-01T00:00:00Z".into());
        let err = pattern_temporal(&event).unwrap_err();
        assert!(matches!(err, BuildError::DatetimeParse { .. }));
        assert!(!err.kind().is_retryable());

        event.end_datetime = Some("2006-01-01T00:00:00Z".into());
        assert!(matches!(pattern_temporal(&event), Ok(Temporal::Range { .. })));
    }

    #[test]
    fn test_non_matching_key_is_datetime_error() {
        let event = pattern_event("OMSO2PCA_LUT_SCD.tif");
        assert!(matches!(pattern_temporal(&event), Err(BuildError::DatetimeParse { .. })));
    }

    #[test]
    fn test_media_types() {
        assert_eq!(media_type_for("https://x/a.HE5"), "application/x-hdf5");
        assert_eq!(media_type_for("s3://b/a.nc4?x=1"), "application/netcdf");
        assert_eq!(media_type_for("s3://b/a"), "application/octet-stream");
    }
}
