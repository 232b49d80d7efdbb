//! The single source of truth for everything the map displays.

use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::geometry::{Geometry, GeometryError, LatLng, ShapeKind};
use crate::style::{AreaStyle, MarkerStyle, Style, StyleConfig};

/// Free form shape attributes, carried opaquely.
pub type Properties = Map<String, JsonValue>;

/// Weight of a heatmap point that does not carry one.
pub const DEFAULT_HEAT_WEIGHT: f64 = 50.0;

/// A persisted user annotation.
///
/// The shape kind is implied by the geometry variant, so the two cannot disagree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "ShapeRecord", try_from = "ShapeRecord")]
pub struct Shape {
    /// Unique id, stable across sessions.
    pub id: String,
    /// Geometry in longitude first order.
    pub geometry: Geometry,
    /// Arbitrary attributes such as a display name.
    pub properties: Properties,
    /// Visual parameters.
    pub style: Style,
}

impl Shape {
    /// The kind of the shape.
    pub fn kind(&self) -> ShapeKind {
        self.geometry.kind()
    }

    /// The display name stored under the `name` property.
    pub fn name(&self) -> Option<&str> {
        self.properties.get("name").and_then(JsonValue::as_str)
    }
}

/// The `{id, type, geometry, properties, style}` record exchanged with the host.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct ShapeRecord {
    id: String,
    #[serde(rename = "type")]
    kind: ShapeKind,
    geometry: Geometry,
    #[serde(default)]
    properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    style: Option<Style>,
}

impl From<Shape> for ShapeRecord {
    fn from(shape: Shape) -> Self {
        Self {
            id: shape.id,
            kind: shape.geometry.kind(),
            geometry: shape.geometry,
            properties: shape.properties,
            style: Some(shape.style),
        }
    }
}

impl TryFrom<ShapeRecord> for Shape {
    type Error = GeometryError;

    fn try_from(record: ShapeRecord) -> Result<Self, Self::Error> {
        let actual = record.geometry.kind();
        if actual != record.kind {
            return Err(GeometryError::KindMismatch {
                declared: record.kind,
                actual,
            });
        }
        Ok(Self {
            id: record.id,
            style: record
                .style
                .unwrap_or_else(|| StyleConfig::default().default_for(actual)),
            geometry: record.geometry,
            properties: record.properties,
        })
    }
}

/// Shapes read back from a saved list, record by record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoredShapes {
    /// Records that could be used.
    pub shapes: Vec<Shape>,
    /// Records dropped because their geometry could not be read.
    pub skipped: usize,
}

/// Reads a saved `[{id, type, geometry, properties, style}]` list.
///
/// Only a list that is not a JSON array fails as a whole. A record whose geometry
/// cannot be read is skipped. A missing or unreadable style falls back to the default
/// of `styles` for the kind, and the kind always follows the geometry.
pub fn restore_shapes(
    json: &str,
    styles: &StyleConfig,
) -> Result<RestoredShapes, serde_json::Error> {
    let records: Vec<JsonValue> = serde_json::from_str(json)?;
    let mut restored = RestoredShapes::default();
    for (index, record) in records.into_iter().enumerate() {
        match restore_record(index, record, styles) {
            Some(shape) => restored.shapes.push(shape),
            None => restored.skipped += 1,
        }
    }
    Ok(restored)
}

fn restore_record(index: usize, record: JsonValue, styles: &StyleConfig) -> Option<Shape> {
    let JsonValue::Object(mut record) = record else {
        warn!("Skipping saved shape #{index}: not an object");
        return None;
    };
    let mut field = |name: &str| record.remove(name).unwrap_or(JsonValue::Null);

    let geometry = match serde_json::from_value::<Geometry>(field("geometry")) {
        Ok(geometry) => geometry,
        Err(e) => {
            warn!("Skipping saved shape #{index}: unreadable geometry: {e}");
            return None;
        }
    };
    let kind = geometry.kind();
    let id = match field("id") {
        JsonValue::String(id) => id,
        _ => {
            warn!("Saved shape #{index} has no id");
            format!("shape-restored-{index}")
        }
    };
    if let JsonValue::String(declared) = field("type")
        && declared != kind.as_str()
    {
        warn!("Saved shape {id} declares `{declared}` but has {kind} geometry");
    }
    let properties = match field("properties") {
        JsonValue::Object(properties) => properties,
        _ => Properties::new(),
    };
    let style = record_style(&id, kind, field("style"), styles);
    Some(Shape {
        id,
        geometry,
        properties,
        style,
    })
}

fn record_style(id: &str, kind: ShapeKind, value: JsonValue, styles: &StyleConfig) -> Style {
    if value.is_null() {
        return styles.default_for(kind);
    }
    let style = match kind {
        ShapeKind::Marker => serde_json::from_value::<MarkerStyle>(value).map(Style::Marker),
        _ => serde_json::from_value::<AreaStyle>(value).map(Style::Area),
    };
    style.unwrap_or_else(|e| {
        warn!("Saved shape {id} has an unreadable style, using the default: {e}");
        styles.default_for(kind)
    })
}

/// A weighted heatmap sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeatPoint {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Weight, `DEFAULT_HEAT_WEIGHT` when absent.
    #[serde(default = "default_weight", deserialize_with = "weight_or_default")]
    pub weight: f64,
}

impl HeatPoint {
    /// Creates a point with the default weight.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            weight: DEFAULT_HEAT_WEIGHT,
        }
    }
}

fn default_weight() -> f64 {
    DEFAULT_HEAT_WEIGHT
}

fn weight_or_default<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(DEFAULT_HEAT_WEIGHT))
}

/// Read-only view of the store handed to engine adapters.
#[derive(Clone, Copy, Debug)]
pub struct Snapshot<'a> {
    /// Persisted shapes.
    pub shapes: &'a [Shape],
    /// Current live entity positions by id.
    pub live_entities: &'a BTreeMap<String, LatLng>,
    /// Position history by live entity id.
    pub paths: &'a BTreeMap<String, Vec<LatLng>>,
    /// Current heatmap samples.
    pub heatmap: &'a [HeatPoint],
}

/// Owner of shapes, live entities, paths and the heatmap.
///
/// The store knows nothing about rendering and never rejects geometry: degenerate shapes
/// are kept and left for the adapters to skip.
#[derive(Clone, Debug, Default)]
pub struct ShapeStore {
    shapes: Vec<Shape>,
    live_entities: BTreeMap<String, LatLng>,
    paths: BTreeMap<String, Vec<LatLng>>,
    heatmap: Vec<HeatPoint>,
    styles: StyleConfig,
    next_id: u64,
}

impl ShapeStore {
    /// Creates an empty store filling missing styles from `styles`.
    pub fn new(styles: StyleConfig) -> Self {
        Self {
            styles,
            next_id: 1,
            ..Default::default()
        }
    }

    /// Appends a new shape and returns it.
    pub fn add_shape(
        &mut self,
        geometry: Geometry,
        properties: Properties,
        style: Option<Style>,
    ) -> &Shape {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let id = format!("shape-{millis}-{}", self.next_id);
        self.next_id += 1;

        let style = style.unwrap_or_else(|| self.styles.default_for(geometry.kind()));
        self.shapes.push(Shape {
            id,
            geometry,
            properties,
            style,
        });
        &self.shapes[self.shapes.len() - 1]
    }

    /// Moves the live entity `id` and extends its path.
    ///
    /// A position that is not a finite number is ignored.
    pub fn update_live_entity(&mut self, id: &str, lat: f64, lng: f64) {
        if !lat.is_finite() || !lng.is_finite() {
            warn!("Ignoring non-finite position {lat},{lng} for {id}");
            return;
        }
        let pos = LatLng::new(lat, lng);
        self.live_entities.insert(id.to_string(), pos);
        self.paths.entry(id.to_string()).or_default().push(pos);
    }

    /// Replaces the heatmap samples.
    ///
    /// Points at a non-finite position are dropped and a non-finite weight becomes
    /// [`DEFAULT_HEAT_WEIGHT`].
    pub fn set_heatmap(&mut self, points: Vec<HeatPoint>) {
        let total = points.len();
        self.heatmap = points
            .into_iter()
            .filter(|p| p.lat.is_finite() && p.lng.is_finite())
            .map(|p| HeatPoint {
                weight: if p.weight.is_finite() {
                    p.weight
                } else {
                    DEFAULT_HEAT_WEIGHT
                },
                ..p
            })
            .collect();
        let dropped = total - self.heatmap.len();
        if dropped > 0 {
            warn!("Dropped {dropped} heatmap points at non-finite positions");
        }
    }

    /// Removes all heatmap samples.
    pub fn clear_heatmap(&mut self) {
        self.heatmap.clear();
    }

    /// Overwrites the shape list with restored shapes. Live data is left alone.
    pub fn replace_shapes(&mut self, shapes: Vec<Shape>) {
        self.shapes = shapes;
    }

    /// Removes every shape.
    pub fn clear_shapes(&mut self) {
        self.shapes.clear();
    }

    /// Drops all state, including live entities and their paths.
    pub fn reset(&mut self) {
        self.shapes.clear();
        self.live_entities.clear();
        self.paths.clear();
        self.heatmap.clear();
    }

    /// The persisted shapes.
    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// The style defaults used by [`ShapeStore::add_shape`].
    pub fn styles(&self) -> &StyleConfig {
        &self.styles
    }

    /// Everything an adapter needs to draw.
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            shapes: &self.shapes,
            live_entities: &self.live_entities,
            paths: &self.paths,
            heatmap: &self.heatmap,
        }
    }
}
