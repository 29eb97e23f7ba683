//! Common test fixtures: queue message bodies and CMR search responses.

use serde_json::{json, Value};

/// Collection used by the filename-pattern examples.
pub const PATTERN_COLLECTION: &str = "OMSO2PCA";

/// Collection used by the catalog-linked examples.
pub const CMR_COLLECTION: &str = "OMDOAO3e";

/// Matches `..._YYYY.tif`; group 3 is the year.
pub const YEAR_REGEX: &str = r"^(.*?)(_)([0-9][0-9][0-9][0-9])(.tif)$";

/// Message body for a file whose year is taken from its key.
pub fn pattern_message(object_key: &str) -> String {
    json!({
        "collection": PATTERN_COLLECTION,
        "object_key": object_key,
        "filename_pattern": {"regex": YEAR_REGEX, "target_group": 3},
        "datetime_range": "year",
    })
    .to_string()
}

/// Message body for a CMR granule.
pub fn granule_message(object_key: &str, granule_id: &str) -> String {
    json!({
        "collection": CMR_COLLECTION,
        "object_key": object_key,
        "granule_id": granule_id,
    })
    .to_string()
}

/// Message body carrying both discriminators.
pub fn ambiguous_message(object_key: &str) -> String {
    json!({
        "collection": PATTERN_COLLECTION,
        "object_key": object_key,
        "granule_id": "G0-GES_DISC",
        "filename_pattern": {"regex": YEAR_REGEX, "target_group": 3},
    })
    .to_string()
}

/// One CMR granule entry with a data link and a metadata link.
pub fn cmr_granule(id: &str, data_href: &str, time_start: &str) -> Value {
    let file_name = data_href.rsplit('/').next().unwrap_or(data_href);
    json!({
        "id": id,
        "title": file_name,
        "time_start": time_start,
        "dataset_id": "OMI/Aura Ozone (O3) DOAS Total Column L3 1-day 0.25deg x 0.25deg V3",
        "producer_granule_id": file_name,
        "links": [
            {
                "rel": "http://esipfed.org/ns/fedsearch/1.1/data#",
                "title": format!("Download {}", file_name),
                "href": data_href,
            },
            {
                "rel": "http://esipfed.org/ns/fedsearch/1.1/metadata#",
                "title": "(METADATA)",
                "href": format!("{}.xml", data_href),
            }
        ],
    })
}

/// A CMR `granules.json` feed.
pub fn cmr_feed(entries: Vec<Value>) -> Value {
    json!({"feed": {"entry": entries}})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_message_shape() {
        let body: Value = serde_json::from_str(&pattern_message("s3://b/a_2005.tif")).unwrap();
        assert_eq!(body["filename_pattern"]["target_group"], 3);
        assert!(body.get("granule_id").is_none());
    }

    #[test]
    fn test_cmr_granule_links() {
        let granule = cmr_granule("G1-GES_DISC", "https://data.example/a.he5", "2004-10-01T00:00:00Z");
        assert_eq!(granule["links"][0]["title"], "Download a.he5");
        assert_eq!(cmr_feed(vec![granule])["feed"]["entry"].as_array().unwrap().len(), 1);
    }
}
