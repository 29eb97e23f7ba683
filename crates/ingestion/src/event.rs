//! Queue message wire format and the validated event it becomes.
//!
//! The wire shape is a flat JSON object. A message must carry exactly one
//! discriminator: `granule_id` (metadata comes from the granule catalog) or
//! `filename_pattern` (the datetime is derived from the object key). Both or
//! neither is rejected before any external call is made.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use granule_common::DatetimeInterval;

use crate::error::BuildError;

/// Regex applied to an object key; capture group `target_group` holds the date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilenamePattern {
    pub regex: String,
    pub target_group: usize,
}

impl FilenamePattern {
    pub fn new(regex: impl Into<String>, target_group: usize) -> Self {
        Self {
            regex: regex.into(),
            target_group,
        }
    }

    fn compile(&self) -> Result<Regex, BuildError> {
        Regex::new(&self.regex)
            .map_err(|e| BuildError::Malformed(format!("invalid filename pattern: {}", e)))
    }

    /// Return the text captured by `target_group` in `key`.
    pub fn capture(&self, key: &str) -> Result<String, BuildError> {
        let regex = self.compile()?;
        let captures = regex.captures(key).ok_or_else(|| BuildError::DatetimeParse {
            key: key.to_string(),
            reason: format!("does not match pattern {}", self.regex),
        })?;
        captures
            .get(self.target_group)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| BuildError::DatetimeParse {
                key: key.to_string(),
                reason: format!("capture group {} did not participate in the match", self.target_group),
            })
    }
}

/// Optional overrides for the transcoded output asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetOverrides {
    pub name: Option<String>,
    pub roles: Option<Vec<String>>,
    pub media_type: Option<String>,
}

/// Queue message body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestMessage {
    pub collection: String,
    #[serde(alias = "s3_filename")]
    pub object_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granule_id: Option<String>,
    #[serde(default, alias = "datetime_regex", skip_serializing_if = "Option::is_none")]
    pub filename_pattern: Option<FilenamePattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_datetime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_datetime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_datetime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime_range: Option<DatetimeInterval>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_media_type: Option<String>,
}

impl IngestMessage {
    /// Parse a queue body. Any JSON or shape error is reported as malformed.
    pub fn from_json(body: &str) -> Result<Self, BuildError> {
        serde_json::from_str(body).map_err(|e| BuildError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn asset_overrides(&self) -> AssetOverrides {
        AssetOverrides {
            name: self.asset_name.clone(),
            roles: self.asset_roles.clone(),
            media_type: self.asset_media_type.clone(),
        }
    }
}

/// Pattern-derived event details.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternEvent {
    pub collection: String,
    pub object_key: String,
    pub pattern: FilenamePattern,
    pub start_datetime: Option<String>,
    pub end_datetime: Option<String>,
    pub single_datetime: Option<String>,
    pub datetime_range: Option<DatetimeInterval>,
    pub properties: Map<String, Value>,
    pub assets: AssetOverrides,
}

/// A validated ingestion event.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// Metadata comes from the granule catalog entry `granule_id`.
    CatalogLinked {
        collection: String,
        object_key: String,
        granule_id: String,
        assets: AssetOverrides,
    },
    /// Datetime comes from overrides or from the object key.
    Pattern(PatternEvent),
}

impl IngestEvent {
    pub fn collection(&self) -> &str {
        match self {
            IngestEvent::CatalogLinked { collection, .. } => collection,
            IngestEvent::Pattern(p) => &p.collection,
        }
    }

    pub fn object_key(&self) -> &str {
        match self {
            IngestEvent::CatalogLinked { object_key, .. } => object_key,
            IngestEvent::Pattern(p) => &p.object_key,
        }
    }

    pub fn assets(&self) -> &AssetOverrides {
        match self {
            IngestEvent::CatalogLinked { assets, .. } => assets,
            IngestEvent::Pattern(p) => &p.assets,
        }
    }
}

impl TryFrom<IngestMessage> for IngestEvent {
    type Error = BuildError;

    fn try_from(message: IngestMessage) -> Result<Self, Self::Error> {
        if message.collection.trim().is_empty() {
            return Err(BuildError::Malformed("collection is empty".into()));
        }
        if message.object_key.trim().is_empty() {
            return Err(BuildError::Malformed("object_key is empty".into()));
        }

        let assets = message.asset_overrides();
        match (message.granule_id, message.filename_pattern) {
            (Some(_), Some(_)) => Err(BuildError::AmbiguousEventShape(format!(
                "{} has both granule_id and filename_pattern",
                message.object_key
            ))),
            (None, None) => Err(BuildError::AmbiguousEventShape(format!(
                "{} has neither granule_id nor filename_pattern",
                message.object_key
            ))),
            (Some(granule_id), None) => Ok(IngestEvent::CatalogLinked {
                collection: message.collection,
                object_key: message.object_key,
                granule_id,
                assets,
            }),
            (None, Some(pattern)) => {
                pattern.compile()?;
                Ok(IngestEvent::Pattern(PatternEvent {
                    collection: message.collection,
                    object_key: message.object_key,
                    pattern,
                    start_datetime: message.start_datetime,
                    end_datetime: message.end_datetime,
                    single_datetime: message.single_datetime,
                    datetime_range: message.datetime_range,
                    properties: message.properties,
                    assets,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_legacy_field_aliases() {
        let body = r#"{
            "collection": "OMSO2PCA",
            "s3_filename": "s3://bucket/OMSO2PCA_LUT_SCD_2005.tif",
            "datetime_regex": {"regex": "^(.*?)(_)([0-9][0-9][0-9][0-9])(.tif)$", "target_group": 3},
            "datetime_range": "year"
        }"#;
        let message = IngestMessage::from_json(body).unwrap();
        assert_eq!(message.object_key, "s3://bucket/OMSO2PCA_LUT_SCD_2005.tif");
        assert_eq!(message.datetime_range, Some(DatetimeInterval::Year));

        let event = IngestEvent::try_from(message).unwrap();
        assert!(matches!(event, IngestEvent::Pattern(_)));
    }

    #[test]
    fn test_missing_collection_is_malformed() {
        let err = IngestMessage::from_json(r#"{"object_key": "a.tif"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    #[test]
    fn test_capture_reports_non_participating_group() {
        let pattern = FilenamePattern::new("^(a)|(b)$", 2);
        let err = pattern.capture("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatetimeParseError);
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let message = IngestMessage {
            collection: "OMDOAO3e".into(),
            object_key: "https://data.example/OMI.he5".into(),
            granule_id: Some("G123-GES_DISC".into()),
            ..Default::default()
        };
        let json: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 3);
    }
}
