//! Catalog record model and its STAC 1.0.0 item serialization.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use granule_common::BoundingBox;

use crate::error::BuildError;

pub const STAC_VERSION: &str = "1.0.0";
pub const PROJECTION_EXTENSION: &str = "https://stac-extensions.github.io/projection/v1.1.0/schema.json";
pub const RASTER_EXTENSION: &str = "https://stac-extensions.github.io/raster/v1.1.0/schema.json";

/// Temporal extent of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporal {
    Instant(DateTime<Utc>),
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl Temporal {
    fn write_properties(&self, properties: &mut Map<String, Value>) {
        let fmt = |dt: &DateTime<Utc>| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true));
        match self {
            Temporal::Instant(dt) => {
                properties.insert("datetime".into(), fmt(dt));
            }
            Temporal::Range { start, end } => {
                properties.insert("datetime".into(), Value::Null);
                properties.insert("start_datetime".into(), fmt(start));
                properties.insert("end_datetime".into(), fmt(end));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub href: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Extension fields such as `raster:bands`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Asset {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            media_type: None,
            roles: Vec::new(),
            title: None,
            extra: Map::new(),
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

/// A catalog entry for one transcoded granule.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRecord {
    pub id: String,
    pub collection: String,
    pub geometry: Value,
    pub bbox: BoundingBox,
    pub temporal: Temporal,
    pub properties: Map<String, Value>,
    pub assets: BTreeMap<String, Asset>,
    pub links: Vec<Link>,
    pub stac_extensions: Vec<String>,
}

impl CatalogRecord {
    /// Check the invariants every loadable record must hold.
    pub fn validate(&self, expected_collection: &str) -> Result<(), BuildError> {
        if self.id.is_empty() {
            return Err(BuildError::InvalidRecord("empty id".into()));
        }
        if self.collection != expected_collection {
            return Err(BuildError::InvalidRecord(format!(
                "collection {} does not match event collection {}",
                self.collection, expected_collection
            )));
        }
        if self.assets.is_empty() {
            return Err(BuildError::InvalidRecord(format!("{} has no assets", self.id)));
        }
        if let Temporal::Range { start, end } = self.temporal {
            if start > end {
                return Err(BuildError::InvalidRecord(format!(
                    "{} has start {} after end {}",
                    self.id, start, end
                )));
            }
        }
        if !self.bbox.is_valid() {
            return Err(BuildError::InvalidRecord(format!("{} has invalid bbox {}", self.id, self.bbox)));
        }
        Ok(())
    }

    /// Render as a STAC item document.
    pub fn to_stac_item(&self) -> Value {
        let mut properties = self.properties.clone();
        self.temporal.write_properties(&mut properties);

        json!({
            "type": "Feature",
            "stac_version": STAC_VERSION,
            "stac_extensions": self.stac_extensions,
            "id": self.id,
            "collection": self.collection,
            "geometry": self.geometry,
            "bbox": self.bbox.to_array(),
            "properties": properties,
            "assets": self.assets,
            "links": self.links,
        })
    }

    /// One NDJSON line (no trailing newline).
    pub fn to_ndjson_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_stac_item())
    }
}
