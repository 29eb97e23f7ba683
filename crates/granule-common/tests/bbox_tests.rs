//! Tests for BoundingBox operations used when building catalog footprints.

use granule_common::bbox::BoundingBox;

// ============================================================================
// Constructor tests
// ============================================================================

#[test]
fn test_bbox_new() {
    let bbox = BoundingBox::new(-180.0, -90.0, 180.0, 90.0);
    assert_eq!(bbox.min_x, -180.0);
    assert_eq!(bbox.min_y, -90.0);
    assert_eq!(bbox.max_x, 180.0);
    assert_eq!(bbox.max_y, 90.0);
}

#[test]
fn test_bbox_dimensions() {
    let bbox = BoundingBox::new(-10.0, 20.0, 30.0, 25.0);
    assert_eq!(bbox.width(), 40.0);
    assert_eq!(bbox.height(), 5.0);
}

// ============================================================================
// Validity tests
// ============================================================================

#[test]
fn test_bbox_inverted_is_invalid() {
    assert!(!BoundingBox::new(10.0, 0.0, 0.0, 10.0).is_valid());
    assert!(!BoundingBox::new(0.0, 10.0, 10.0, 0.0).is_valid());
}

#[test]
fn test_bbox_nan_is_invalid() {
    assert!(!BoundingBox::new(f64::NAN, 0.0, 1.0, 1.0).is_valid());
}

#[test]
fn test_bbox_geographic_domain() {
    assert!(BoundingBox::new(-180.0, -90.0, 180.0, 90.0).is_geographic());
    assert!(!BoundingBox::new(-20037508.0, -20037508.0, 20037508.0, 20037508.0).is_geographic());
}

// ============================================================================
// Web mercator conversion tests
// ============================================================================

#[test]
fn test_web_mercator_world_extent() {
    let merc = BoundingBox::new(
        -20037508.342789244,
        -20037508.342789244,
        20037508.342789244,
        20037508.342789244,
    );
    let geo = merc.from_web_mercator();
    assert!((geo.min_x - (-180.0)).abs() < 1e-6);
    assert!((geo.max_x - 180.0).abs() < 1e-6);
    assert!((geo.max_y - 85.0511287798).abs() < 1e-6);
    assert!((geo.min_y + 85.0511287798).abs() < 1e-6);
}

// ============================================================================
// GeoJSON output tests
// ============================================================================

#[test]
fn test_geojson_polygon_is_closed() {
    let bbox = BoundingBox::new(0.0, 0.0, 2.0, 1.0);
    let polygon = bbox.to_geojson_polygon();
    assert_eq!(polygon["type"], "Polygon");

    let ring = polygon["coordinates"][0].as_array().unwrap();
    assert_eq!(ring.len(), 5);
    assert_eq!(ring[0], ring[4]);
    assert_eq!(ring[2][0], 2.0);
    assert_eq!(ring[2][1], 1.0);
}

#[test]
fn test_to_array_order() {
    let bbox = BoundingBox::new(1.0, 2.0, 3.0, 4.0);
    assert_eq!(bbox.to_array(), [1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_union() {
    let a = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
    let b = BoundingBox::new(-1.0, 0.5, 0.5, 3.0);
    assert_eq!(a.union(&b), BoundingBox::new(-1.0, 0.0, 1.0, 3.0));
}
