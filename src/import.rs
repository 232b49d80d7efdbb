//! GeoJSON ingestion: attribute key discovery, then key mapping into marker shapes.
//!
//! Import happens in two steps because the host lets the user pick which attribute
//! becomes the display name. [`GeoJsonImport::analyze`] parses the file and lists the
//! keys; [`GeoJsonImport::apply`] turns it into shapes once a key is chosen.

use geojson::{FeatureCollection, GeoJson, Value};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

use crate::MapError;
use crate::geometry::LngLat;
use crate::store::Properties;

/// Parses GeoJSON text that must hold a feature collection.
pub fn parse_feature_collection(text: &str) -> Result<FeatureCollection, MapError> {
    match text.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(collection) => Ok(collection),
        GeoJson::Feature(_) | GeoJson::Geometry(_) => Err(MapError::NotAFeatureCollection),
    }
}

/// The distinct property keys of all point features, sorted.
pub fn point_property_keys(collection: &FeatureCollection) -> Vec<String> {
    let keys: BTreeSet<&String> = collection
        .features
        .iter()
        .filter(|feature| {
            matches!(
                feature.geometry.as_ref().map(|g| &g.value),
                Some(Value::Point(_))
            )
        })
        .filter_map(|feature| feature.properties.as_ref())
        .flat_map(|properties| properties.keys())
        .collect();
    keys.into_iter().cloned().collect()
}

/// A parsed GeoJSON file waiting for the user to choose a name key.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoJsonImport {
    collection: FeatureCollection,
    keys: Vec<String>,
}

/// A point feature to add as a marker shape.
#[derive(Clone, Debug, PartialEq)]
pub struct ImportedMarker {
    /// Marker position.
    pub position: LngLat,
    /// The feature's properties, with `name` set from the chosen key.
    pub properties: Properties,
}

/// A polygon collection kept for statistical extrusion.
#[derive(Clone, Debug, PartialEq)]
pub struct Extrusion {
    /// The whole imported collection.
    pub collection: FeatureCollection,
    /// Numeric attribute that drives the extrusion height.
    pub key: String,
}

/// What an import adds to the map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImportPlan {
    /// Marker shapes to add.
    pub markers: Vec<ImportedMarker>,
    /// Set when the file contains polygons.
    pub extrusion: Option<Extrusion>,
    /// Features that were neither usable points nor polygons.
    pub skipped: usize,
}

impl GeoJsonImport {
    /// Parses `text` and collects the keys of its point features.
    pub fn analyze(text: &str) -> Result<Self, MapError> {
        let collection = parse_feature_collection(text)?;
        let keys = point_property_keys(&collection);
        Ok(Self { collection, keys })
    }

    /// The discovered keys, sorted.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The parsed collection.
    pub fn collection(&self) -> &FeatureCollection {
        &self.collection
    }

    /// Maps `key` into the display name of every point feature.
    pub fn apply(self, key: &str) -> ImportPlan {
        let mut plan = ImportPlan::default();
        let mut has_polygons = false;

        for feature in &self.collection.features {
            match feature.geometry.as_ref().map(|g| &g.value) {
                Some(Value::Point(position)) => {
                    let Some(position) =
                        LngLat::from_position(position).filter(LngLat::is_finite)
                    else {
                        plan.skipped += 1;
                        continue;
                    };
                    let mut properties = feature.properties.clone().unwrap_or_default();
                    if let Some(name) = properties.get(key).and_then(display_name) {
                        properties.insert("name".to_string(), JsonValue::String(name));
                    }
                    plan.markers.push(ImportedMarker {
                        position,
                        properties,
                    });
                }
                Some(Value::Polygon(_) | Value::MultiPolygon(_)) => has_polygons = true,
                _ => plan.skipped += 1,
            }
        }

        if has_polygons {
            plan.extrusion = Some(Extrusion {
                collection: self.collection,
                key: key.to_string(),
            });
        }
        plan
    }
}

fn display_name(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
