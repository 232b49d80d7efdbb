//! Camera state, zoom scales and Web-Mercator projection.

use egui::{Pos2, Rect};
use serde::{Deserialize, Serialize};

use crate::geometry::LatLng;

// The size of a map tile in pixels.
pub(crate) const TILE_SIZE: f64 = 256.0;

/// Smallest native level of the regional engine.
pub const MIN_REGIONAL_LEVEL: u8 = 1;
/// Largest native level of the regional engine.
pub const MAX_REGIONAL_LEVEL: u8 = 14;

// Canonical zoom of regional level 0; level L sits at `REGIONAL_LEVEL_BASE - L`.
const REGIONAL_LEVEL_BASE: f64 = 18.0;

/// Camera position in canonical zoom.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    /// Camera center.
    pub center: LatLng,
    /// Canonical (Web-Mercator) zoom.
    pub zoom: f64,
}

impl ViewState {
    /// Creates a new view state.
    pub fn new(center: LatLng, zoom: f64) -> Self {
        Self { center, zoom }
    }

    /// The same view with the zoom rounded to the nearest half step.
    pub fn rounded(self) -> Self {
        Self {
            zoom: (self.zoom * 2.0).round() / 2.0,
            ..self
        }
    }
}

/// Canonical zoom of a regional engine level.
pub fn regional_level_to_zoom(level: u8) -> f64 {
    REGIONAL_LEVEL_BASE - f64::from(level.clamp(MIN_REGIONAL_LEVEL, MAX_REGIONAL_LEVEL))
}

/// The regional engine level closest to a canonical zoom.
pub fn zoom_to_regional_level(zoom: f64) -> u8 {
    if !zoom.is_finite() {
        return MAX_REGIONAL_LEVEL;
    }
    (REGIONAL_LEVEL_BASE - zoom).round().clamp(
        f64::from(MIN_REGIONAL_LEVEL),
        f64::from(MAX_REGIONAL_LEVEL),
    ) as u8
}

/// Converts longitude to the x-coordinate in tiles at a given zoom.
pub(crate) fn lon_to_x(lon: f64, zoom: f64) -> f64 {
    (lon + 180.0) / 360.0 * 2.0_f64.powf(zoom)
}

/// Converts latitude to the y-coordinate in tiles at a given zoom.
pub(crate) fn lat_to_y(lat: f64, zoom: f64) -> f64 {
    (1.0 - lat.to_radians().tan().asinh() / std::f64::consts::PI) / 2.0 * 2.0_f64.powf(zoom)
}

/// Converts the x-coordinate in tiles to longitude at a given zoom.
pub(crate) fn x_to_lon(x: f64, zoom: f64) -> f64 {
    x / 2.0_f64.powf(zoom) * 360.0 - 180.0
}

/// Converts the y-coordinate in tiles to latitude at a given zoom.
pub(crate) fn y_to_lat(y: f64, zoom: f64) -> f64 {
    let n = std::f64::consts::PI - 2.0 * std::f64::consts::PI * y / 2.0_f64.powf(zoom);
    n.sinh().atan().to_degrees()
}

/// A helper for converting between geographical and container pixel coordinates.
pub struct MapProjection {
    view: ViewState,
    container: Rect,
}

impl MapProjection {
    /// Creates a projection for `view` drawn into `container`.
    pub fn new(view: ViewState, container: Rect) -> Self {
        Self { view, container }
    }

    /// Projects a geographical coordinate to a container pixel.
    pub fn project(&self, pos: LatLng) -> Pos2 {
        let zoom = self.view.zoom;
        let dx = (lon_to_x(pos.lng, zoom) - lon_to_x(self.view.center.lng, zoom)) * TILE_SIZE;
        let dy = (lat_to_y(pos.lat, zoom) - lat_to_y(self.view.center.lat, zoom)) * TILE_SIZE;

        self.container.center() + egui::vec2(dx as f32, dy as f32)
    }

    /// Un-projects a container pixel to a geographical coordinate.
    pub fn unproject(&self, pixel: Pos2) -> LatLng {
        let zoom = self.view.zoom;
        let rel = pixel - self.container.center();
        let x = lon_to_x(self.view.center.lng, zoom) + rel.x as f64 / TILE_SIZE;
        let y = lat_to_y(self.view.center.lat, zoom) + rel.y as f64 / TILE_SIZE;

        LatLng::new(y_to_lat(y, zoom), x_to_lon(x, zoom))
    }

    /// Whether a coordinate falls inside the container.
    pub fn contains(&self, pos: LatLng) -> bool {
        self.container.contains(self.project(pos))
    }
}
