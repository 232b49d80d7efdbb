//! Engine independent shape geometry.
//!
//! Every coordinate stored by the crate is longitude first. Engines that work latitude
//! first convert at their own boundary through [`LatLng`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Mean earth radius in meters, as used by the haversine helpers.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Number of segments used when a circle is approximated by a ring.
pub const CIRCLE_STEPS: usize = 64;

/// A `[longitude, latitude]` pair. Serializes as a two element array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LngLat(pub f64, pub f64);

impl LngLat {
    /// Creates a new position from longitude and latitude.
    pub fn new(lng: f64, lat: f64) -> Self {
        Self(lng, lat)
    }

    /// The longitude.
    pub fn lng(&self) -> f64 {
        self.0
    }

    /// The latitude.
    pub fn lat(&self) -> f64 {
        self.1
    }

    /// Whether both components are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.0.is_finite() && self.1.is_finite()
    }

    /// The position as a GeoJSON position vector.
    pub fn to_position(&self) -> Vec<f64> {
        vec![self.0, self.1]
    }

    /// Reads a GeoJSON position vector. Returns `None` when it has fewer than two values.
    pub fn from_position(pos: &[f64]) -> Option<Self> {
        match pos {
            [lng, lat, ..] => Some(Self(*lng, *lat)),
            _ => None,
        }
    }
}

impl From<LatLng> for LngLat {
    fn from(p: LatLng) -> Self {
        Self(p.lng, p.lat)
    }
}

impl From<(f64, f64)> for LngLat {
    fn from((lng, lat): (f64, f64)) -> Self {
        Self(lng, lat)
    }
}

/// A `{lat, lng}` object, the latitude first convention of live entities, paths and the
/// regional engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

impl LatLng {
    /// Creates a new position from latitude and longitude.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

impl From<LngLat> for LatLng {
    fn from(p: LngLat) -> Self {
        Self {
            lat: p.lat(),
            lng: p.lng(),
        }
    }
}

/// An axis aligned bounding box `[minLng, minLat, maxLng, maxLat]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox(pub [f64; 4]);

impl BBox {
    /// Builds the box spanned by two opposite corners, in whatever order they were given.
    pub fn from_corners(a: LngLat, b: LngLat) -> Self {
        Self([
            a.lng().min(b.lng()),
            a.lat().min(b.lat()),
            a.lng().max(b.lng()),
            a.lat().max(b.lat()),
        ])
    }

    /// South west corner.
    pub fn min(&self) -> LngLat {
        LngLat(self.0[0], self.0[1])
    }

    /// North east corner.
    pub fn max(&self) -> LngLat {
        LngLat(self.0[2], self.0[3])
    }

    /// Whether the box covers no area.
    pub fn is_empty(&self) -> bool {
        !(self.0[0] < self.0[2] && self.0[1] < self.0[3])
    }

    /// The closed ring `sw, se, ne, nw, sw`.
    pub fn ring(&self) -> Vec<LngLat> {
        let [w, s, e, n] = self.0;
        vec![
            LngLat(w, s),
            LngLat(e, s),
            LngLat(e, n),
            LngLat(w, n),
            LngLat(w, s),
        ]
    }
}

/// The kinds of shapes a user can draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    /// A single point with an icon and an optional label.
    Marker,
    /// A center and a radius in meters.
    Circle,
    /// An axis aligned box.
    Rectangle,
    /// An ordered ring of vertices.
    Polygon,
}

impl ShapeKind {
    /// All drawable kinds.
    pub const ALL: [ShapeKind; 4] = [
        ShapeKind::Marker,
        ShapeKind::Circle,
        ShapeKind::Rectangle,
        ShapeKind::Polygon,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Marker => "marker",
            ShapeKind::Circle => "circle",
            ShapeKind::Rectangle => "rectangle",
            ShapeKind::Polygon => "polygon",
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ShapeKind {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShapeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| GeometryError::UnknownKind(s.to_string()))
    }
}

/// Geometry of a shape. The variant decides the shape kind.
///
/// On the wire the variants are told apart by their fields, so the geometry object of a
/// persisted shape is exactly `{coordinates}`, `{center, radius}`, `{bbox}` or
/// `{coordinates: [...]}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Geometry {
    /// A single `[lng, lat]` position.
    Marker {
        /// The marker position.
        coordinates: LngLat,
    },
    /// A circle around `center`.
    Circle {
        /// The center position.
        center: LngLat,
        /// Radius in meters.
        radius: f64,
    },
    /// A normalized bounding box.
    Rectangle {
        /// `[minLng, minLat, maxLng, maxLat]`
        bbox: BBox,
    },
    /// A ring of vertices, not necessarily closed.
    Polygon {
        /// The ring.
        coordinates: Vec<LngLat>,
    },
}

impl Geometry {
    /// The shape kind this geometry belongs to.
    pub fn kind(&self) -> ShapeKind {
        match self {
            Geometry::Marker { .. } => ShapeKind::Marker,
            Geometry::Circle { .. } => ShapeKind::Circle,
            Geometry::Rectangle { .. } => ShapeKind::Rectangle,
            Geometry::Polygon { .. } => ShapeKind::Polygon,
        }
    }

    /// A rectangle from two corners in any order.
    pub fn rectangle(a: LngLat, b: LngLat) -> Self {
        Geometry::Rectangle {
            bbox: BBox::from_corners(a, b),
        }
    }

    /// Checks that the geometry can be rendered.
    ///
    /// The shape store accepts anything; adapters call this before drawing and skip the
    /// shapes that fail.
    pub fn validate(&self) -> Result<(), GeometryError> {
        match self {
            Geometry::Marker { coordinates } => finite(coordinates),
            Geometry::Circle { center, radius } => {
                finite(center)?;
                if radius.is_finite() && *radius > 0.0 {
                    Ok(())
                } else {
                    Err(GeometryError::InvalidRadius(*radius))
                }
            }
            Geometry::Rectangle { bbox } => {
                if bbox.0.iter().any(|v| !v.is_finite()) {
                    Err(GeometryError::NonFinite)
                } else if bbox.is_empty() {
                    Err(GeometryError::EmptyBBox(bbox.0))
                } else {
                    Ok(())
                }
            }
            Geometry::Polygon { coordinates } => {
                coordinates.iter().try_for_each(finite)?;
                let distinct = open_ring(coordinates).len();
                if distinct < 3 {
                    Err(GeometryError::TooFewVertices(distinct))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn finite(p: &LngLat) -> Result<(), GeometryError> {
    if p.is_finite() {
        Ok(())
    } else {
        Err(GeometryError::NonFinite)
    }
}

/// Degenerate or inconsistent geometry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// A coordinate is NaN or infinite.
    #[error("coordinate is not a finite number")]
    NonFinite,

    /// A circle radius that is zero, negative or not finite.
    #[error("invalid circle radius `{0}`")]
    InvalidRadius(f64),

    /// A bounding box without area.
    #[error("bounding box {0:?} is empty")]
    EmptyBBox([f64; 4]),

    /// A ring with fewer than three distinct vertices.
    #[error("ring has {0} vertices, at least 3 are needed")]
    TooFewVertices(usize),

    /// The declared shape type does not match the geometry fields.
    #[error("shape type `{declared}` does not match `{actual}` geometry")]
    KindMismatch {
        /// The `type` field of the record.
        declared: ShapeKind,
        /// The kind implied by the geometry fields.
        actual: ShapeKind,
    },

    /// An unknown shape type name.
    #[error("unknown shape type `{0}`")]
    UnknownKind(String),
}

/// The ring without its closing vertex, if it has one.
pub fn open_ring(ring: &[LngLat]) -> &[LngLat] {
    match ring {
        [first, .., last] if ring.len() > 1 && first == last => &ring[..ring.len() - 1],
        _ => ring,
    }
}

/// The ring with its first vertex repeated at the end, if it is not closed yet.
pub fn closed_ring(ring: &[LngLat]) -> Vec<LngLat> {
    let mut closed = ring.to_vec();
    if let (Some(first), Some(last)) = (ring.first(), ring.last()) {
        if first != last {
            closed.push(*first);
        }
    }
    closed
}

/// Great circle distance between two positions in meters.
pub fn haversine_distance(a: LngLat, b: LngLat) -> f64 {
    let (lat1, lat2) = (a.lat().to_radians(), b.lat().to_radians());
    let d_lat = lat2 - lat1;
    let d_lng = (b.lng() - a.lng()).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// The position reached from `origin` after `distance` meters on the given bearing
/// (degrees clockwise from north).
pub fn destination(origin: LngLat, distance: f64, bearing_deg: f64) -> LngLat {
    let lat1 = origin.lat().to_radians();
    let lng1 = origin.lng().to_radians();
    let bearing = bearing_deg.to_radians();
    let delta = distance / EARTH_RADIUS_M;

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * bearing.cos()).asin();
    let lng2 = lng1
        + (bearing.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    LngLat(lng2.to_degrees(), lat2.to_degrees())
}

/// Approximates a geodesic circle by a closed ring of `steps` segments.
pub fn circle_ring(center: LngLat, radius: f64, steps: usize) -> Vec<LngLat> {
    let steps = steps.max(3);
    let mut ring: Vec<LngLat> = (0..steps)
        .map(|i| destination(center, radius, -(i as f64) * 360.0 / steps as f64))
        .collect();
    ring.push(ring[0]);
    ring
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const EPSILON: f64 = 1e-6;

    #[test]
    fn rectangle_is_normalized_regardless_of_drag_direction() {
        let a = LngLat(10.0, 10.0);
        let b = LngLat(2.0, 6.0);

        let forward = Geometry::rectangle(a, b);
        let backward = Geometry::rectangle(b, a);

        assert_eq!(forward, backward);
        assert_eq!(
            forward,
            Geometry::Rectangle {
                bbox: BBox([2.0, 6.0, 10.0, 10.0])
            }
        );

        // Mixed corners: north west to south east.
        let mixed = Geometry::rectangle(LngLat(2.0, 10.0), LngLat(10.0, 6.0));
        assert_eq!(mixed, forward);
    }

    #[test]
    fn geometry_wire_format() {
        let circle = Geometry::Circle {
            center: LngLat(127.0, 37.5),
            radius: 500.0,
        };
        assert_eq!(
            serde_json::to_value(&circle).unwrap(),
            json!({"center": [127.0, 37.5], "radius": 500.0})
        );

        let marker: Geometry = serde_json::from_value(json!({"coordinates": [1.0, 2.0]})).unwrap();
        assert_eq!(marker.kind(), ShapeKind::Marker);

        let polygon: Geometry =
            serde_json::from_value(json!({"coordinates": [[1.0, 2.0], [3.0, 4.0]]})).unwrap();
        assert_eq!(polygon.kind(), ShapeKind::Polygon);

        let empty: Geometry = serde_json::from_value(json!({"coordinates": []})).unwrap();
        assert_eq!(empty.kind(), ShapeKind::Polygon);

        let rect: Geometry = serde_json::from_value(json!({"bbox": [1, 2, 3, 4]})).unwrap();
        assert_eq!(rect.kind(), ShapeKind::Rectangle);
    }

    #[test]
    fn validate_flags_degenerate_shapes() {
        let zero_circle = Geometry::Circle {
            center: LngLat(0.0, 0.0),
            radius: 0.0,
        };
        assert_eq!(zero_circle.validate(), Err(GeometryError::InvalidRadius(0.0)));

        let flat_box = Geometry::Rectangle {
            bbox: BBox([1.0, 1.0, 1.0, 5.0]),
        };
        assert!(matches!(flat_box.validate(), Err(GeometryError::EmptyBBox(_))));

        // A closed triangle with only two distinct vertices.
        let sliver = Geometry::Polygon {
            coordinates: vec![LngLat(0.0, 0.0), LngLat(1.0, 1.0), LngLat(0.0, 0.0)],
        };
        assert_eq!(sliver.validate(), Err(GeometryError::TooFewVertices(2)));

        let nan_marker = Geometry::Marker {
            coordinates: LngLat(f64::NAN, 0.0),
        };
        assert_eq!(nan_marker.validate(), Err(GeometryError::NonFinite));

        let triangle = Geometry::Polygon {
            coordinates: vec![LngLat(0.0, 0.0), LngLat(1.0, 0.0), LngLat(0.0, 1.0)],
        };
        assert!(triangle.validate().is_ok());
    }

    #[test]
    fn ring_closing() {
        let open = vec![LngLat(0.0, 0.0), LngLat(1.0, 0.0), LngLat(0.0, 1.0)];
        let closed = closed_ring(&open);
        assert_eq!(closed.len(), 4);
        assert_eq!(closed.first(), closed.last());
        assert_eq!(closed_ring(&closed), closed);
        assert_eq!(open_ring(&closed), open.as_slice());
    }

    #[test]
    fn haversine_and_destination_agree() {
        let seoul = LngLat(126.9706, 37.5546);
        for bearing in [0.0, 45.0, 90.0, 200.0] {
            let p = destination(seoul, 1_000.0, bearing);
            assert!((haversine_distance(seoul, p) - 1_000.0).abs() < 1e-3);
        }

        // One degree of latitude is about 111.2 km.
        let d = haversine_distance(LngLat(0.0, 0.0), LngLat(0.0, 1.0));
        assert!((d - 111_195.0).abs() < 10.0);
    }

    #[test]
    fn circle_ring_is_closed_and_on_radius() {
        let center = LngLat(127.0, 37.5);
        let ring = circle_ring(center, 500.0, CIRCLE_STEPS);
        assert_eq!(ring.len(), CIRCLE_STEPS + 1);
        assert_eq!(ring.first(), ring.last());
        for p in &ring {
            assert!((haversine_distance(center, *p) - 500.0).abs() < EPSILON * 1_000.0);
        }
    }

    #[test]
    fn shape_kind_parses_wire_names() {
        assert_eq!("polygon".parse::<ShapeKind>(), Ok(ShapeKind::Polygon));
        assert!("hexagon".parse::<ShapeKind>().is_err());
        assert_eq!(ShapeKind::Rectangle.to_string(), "rectangle");
    }
}
