//! Map engines that draw the store and turn user gestures back into shapes.
//!
//! Every engine is an [`EngineAdapter`]. The SDK of each engine sits behind a surface
//! trait ([`mapbox::GlobalSurface`], [`kakao::RegionalSurface`]); adapters only decide
//! *what* to draw and convert coordinates, the surface does the drawing.

use geojson::FeatureCollection;
use std::collections::BTreeMap;

use crate::config::{KakaoConfig, MapboxConfig};
use crate::geometry::{Geometry, GeometryError, LatLng, LngLat, ShapeKind};
use crate::projection::ViewState;
use crate::store::{HeatPoint, Shape, Snapshot};
use crate::style::StyleConfig;
use crate::{EngineKind, MapError};

pub mod drawing;

/// Recording surfaces for running without a browser.
pub mod headless;

/// Regional raster basemap engine.
pub mod kakao;

/// Global vector basemap engine.
pub mod mapbox;

pub mod simulation;

pub use kakao::KakaoAdapter;
pub use mapbox::MapboxAdapter;

/// Identifies the DOM element an engine renders into.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub String);

impl From<&str> for ContainerHandle {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Life cycle of an adapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadState {
    /// Constructed, `initialize` not called yet.
    #[default]
    Created,
    /// The engine is loading its scripts and style.
    Loading,
    /// Layers and drawing tools are set up.
    Ready,
    /// Resources were released.
    Destroyed,
}

/// Raw drawing-manager output of the regional engine.
///
/// `x` is the longitude and `y` the latitude, except for the circle center which the
/// engine reports latitude first.
#[derive(Clone, Debug, PartialEq)]
pub enum DrawEnd {
    /// A placed marker.
    Marker {
        /// Marker position.
        position: crate::geometry::LatLng,
    },
    /// A finished circle.
    Circle {
        /// Circle center.
        center: crate::geometry::LatLng,
        /// Radius in meters.
        radius: f64,
    },
    /// A finished rectangle, from the corner where the drag started to where it ended.
    Rectangle {
        /// Drag start `(x, y)`.
        s_point: (f64, f64),
        /// Drag end `(x, y)`.
        e_point: (f64, f64),
    },
    /// A finished polygon.
    Polygon {
        /// Vertices as `(x, y)`.
        points: Vec<(f64, f64)>,
    },
}

/// Native events an engine reports to its adapter.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// Scripts and style finished loading.
    Loaded,
    /// Loading failed.
    LoadFailed(String),
    /// Primary click on the map.
    Click(LngLat),
    /// Double click on the map.
    DoubleClick(LngLat),
    /// Pointer moved over the map.
    PointerMove(LngLat),
    /// Secondary click.
    ContextMenu,
    /// The engine's own drawing manager completed a gesture.
    DrawEnd(DrawEnd),
    /// The camera moved or zoomed.
    CameraChanged,
    /// A zoom animation started.
    ZoomStart,
    /// An animation frame is due.
    AnimationFrame,
}

/// What an adapter asks of the coordinator after handling an event.
#[derive(Clone, Debug, PartialEq)]
pub enum AdapterEvent {
    /// The engine is fully set up; a full redraw is due.
    Ready,
    /// The user completed a drawing gesture.
    ShapeDrawn(Geometry),
    /// The engine could not be brought up.
    Failed(String),
}

/// How polygon cells are laid out by the grid capability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GridKind {
    /// Hexagonal cells.
    #[default]
    Hex,
    /// Square cells.
    Square,
}

impl std::str::FromStr for GridKind {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hex" => Ok(GridKind::Hex),
            "square" => Ok(GridKind::Square),
            other => Err(MapError::UnknownValue(other.to_string())),
        }
    }
}

/// What an adapter last drew, split by how often each part changes.
///
/// Shapes and paths, the heatmap and the live entities are compared independently so a
/// moving vehicle does not force the shape layers to be rebuilt.
#[derive(Clone, Debug, Default)]
pub(crate) struct RenderCache {
    shapes: Option<Vec<Shape>>,
    paths: Option<BTreeMap<String, Vec<LatLng>>>,
    heatmap: Option<Vec<HeatPoint>>,
    live: Option<BTreeMap<String, LatLng>>,
}

impl RenderCache {
    /// Returns `true` and remembers the snapshot if shapes or paths differ from the last call.
    pub(crate) fn static_changed(&mut self, snapshot: &Snapshot<'_>) -> bool {
        let changed = self.shapes.as_deref() != Some(snapshot.shapes)
            || self.paths.as_ref() != Some(snapshot.paths);
        if changed {
            self.shapes = Some(snapshot.shapes.to_vec());
            self.paths = Some(snapshot.paths.clone());
        }
        changed
    }

    /// Returns `true` and remembers the snapshot if the heatmap differs from the last call.
    pub(crate) fn heatmap_changed(&mut self, snapshot: &Snapshot<'_>) -> bool {
        let changed = self.heatmap.as_deref() != Some(snapshot.heatmap);
        if changed {
            self.heatmap = Some(snapshot.heatmap.to_vec());
        }
        changed
    }

    /// Returns `true` and remembers the snapshot if live entities differ from the last call.
    pub(crate) fn live_changed(&mut self, snapshot: &Snapshot<'_>) -> bool {
        let changed = self.live.as_ref() != Some(snapshot.live_entities);
        if changed {
            self.live = Some(snapshot.live_entities.clone());
        }
        changed
    }

    /// The heatmap drawn last.
    pub(crate) fn heatmap(&self) -> &[HeatPoint] {
        self.heatmap.as_deref().unwrap_or_default()
    }

    /// Forgets everything, forcing the next render to draw all parts.
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Conversion between store shapes and an engine's native drawables.
pub trait DrawableConversion {
    /// What the engine draws for one shape.
    type Drawable;

    /// What the engine reports for one completed drawing gesture.
    type RawDraw;

    /// Converts a shape into the engine's format, flipping coordinate order where needed.
    fn to_engine_drawable(
        shape: &Shape,
        styles: &StyleConfig,
    ) -> Result<Self::Drawable, GeometryError>;

    /// Normalizes a completed gesture into longitude first geometry.
    fn from_engine_draw_event(raw: Self::RawDraw) -> Option<Geometry>;
}

/// A map engine.
pub trait EngineAdapter {
    /// Which engine this is.
    fn kind(&self) -> EngineKind;

    /// Starts loading the engine into `container` with the camera at `view`.
    ///
    /// Readiness is reported later through [`EngineAdapter::handle_event`].
    fn initialize(&mut self, container: &ContainerHandle, view: ViewState)
    -> Result<(), MapError>;

    /// Handles a native engine event.
    fn handle_event(&mut self, event: EngineEvent) -> Option<AdapterEvent>;

    /// Whether layers and drawing tools are set up.
    fn is_ready(&self) -> bool;

    /// Redraws everything from the snapshot. A no-op before the adapter is ready.
    fn render_all(&mut self, snapshot: &Snapshot<'_>);

    /// Enters drawing mode for `kind`, discarding any unfinished gesture.
    fn start_drawing(&mut self, kind: ShapeKind);

    /// Leaves drawing mode, discarding any unfinished gesture.
    fn stop_drawing(&mut self);

    /// The kind currently being drawn.
    fn drawing(&self) -> Option<ShapeKind>;

    /// The camera in canonical zoom.
    fn view_state(&self) -> ViewState;

    /// Releases all engine resources. Safe to call at any point.
    fn destroy(&mut self);

    /// Tilts the camera and shows extruded buildings.
    fn set_3d_mode(&mut self, _enabled: bool) -> Result<(), MapError> {
        Err(self.unsupported("3D mode"))
    }

    /// Extrudes the polygons of `collection` by the numeric attribute `key`.
    fn render_extrusion(
        &mut self,
        _collection: &FeatureCollection,
        _key: &str,
    ) -> Result<(), MapError> {
        Err(self.unsupported("statistical extrusion"))
    }

    /// Shows simulated vehicle trips, or removes them for [`simulation::SimLayerKind::None`].
    fn show_simulation_flow(
        &mut self,
        _trips: Vec<simulation::Trip>,
        _layer: simulation::SimLayerKind,
    ) -> Result<(), MapError> {
        Err(self.unsupported("simulation flow"))
    }

    /// Pauses or resumes the trips animation.
    fn set_animation_paused(&mut self, _paused: bool) -> Result<(), MapError> {
        Err(self.unsupported("trip animation"))
    }

    /// Readout for the animated trip at `index`, as picked under the pointer.
    fn trip_hover(&self, _index: usize) -> Option<simulation::TripHover> {
        None
    }

    /// Fills a polygon with grid cells. Returns the number of cells.
    fn create_grid_in_polygon(
        &mut self,
        _rings: &[Vec<LngLat>],
        _cell_size_km: f64,
        _kind: GridKind,
    ) -> Result<usize, MapError> {
        Err(self.unsupported("grid generation"))
    }

    /// Merges the cells of a grid source by demand level. Returns the number of zones.
    fn merge_grid_by_condition(&mut self, _source_id: &str) -> Result<usize, MapError> {
        Err(self.unsupported("grid merging"))
    }

    /// The error returned by capabilities this engine lacks.
    fn unsupported(&self, capability: &'static str) -> MapError {
        MapError::Unsupported {
            engine: self.kind(),
            capability,
        }
    }
}

/// Creates the SDK surfaces engines draw on.
pub trait SurfaceProvider {
    /// A fresh surface for the global engine, or an error if its SDK is not loaded.
    fn mapbox_surface(&mut self) -> Result<Box<dyn mapbox::GlobalSurface>, MapError>;

    /// A fresh surface for the regional engine, or an error if its SDK is not loaded.
    fn kakao_surface(&mut self) -> Result<Box<dyn kakao::RegionalSurface>, MapError>;
}

/// The active engine, one variant per engine kind.
pub enum Engine {
    /// Global vector basemap.
    Mapbox(MapboxAdapter),
    /// Regional raster basemap.
    Kakao(KakaoAdapter),
}

impl Engine {
    /// Builds the adapter for `kind` on a surface from `provider`.
    pub fn create(
        kind: EngineKind,
        provider: &mut dyn SurfaceProvider,
        mapbox: &MapboxConfig,
        kakao: &KakaoConfig,
        styles: &StyleConfig,
    ) -> Result<Self, MapError> {
        Ok(match kind {
            EngineKind::Mapbox => Engine::Mapbox(MapboxAdapter::new(
                provider.mapbox_surface()?,
                mapbox.clone(),
                styles.clone(),
            )),
            EngineKind::Kakao => Engine::Kakao(KakaoAdapter::new(
                provider.kakao_surface()?,
                kakao.clone(),
                styles.clone(),
            )),
        })
    }

    fn inner(&self) -> &dyn EngineAdapter {
        match self {
            Engine::Mapbox(adapter) => adapter,
            Engine::Kakao(adapter) => adapter,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn EngineAdapter {
        match self {
            Engine::Mapbox(adapter) => adapter,
            Engine::Kakao(adapter) => adapter,
        }
    }
}

impl EngineAdapter for Engine {
    fn kind(&self) -> EngineKind {
        self.inner().kind()
    }

    fn initialize(
        &mut self,
        container: &ContainerHandle,
        view: ViewState,
    ) -> Result<(), MapError> {
        self.inner_mut().initialize(container, view)
    }

    fn handle_event(&mut self, event: EngineEvent) -> Option<AdapterEvent> {
        self.inner_mut().handle_event(event)
    }

    fn is_ready(&self) -> bool {
        self.inner().is_ready()
    }

    fn render_all(&mut self, snapshot: &Snapshot<'_>) {
        self.inner_mut().render_all(snapshot)
    }

    fn start_drawing(&mut self, kind: ShapeKind) {
        self.inner_mut().start_drawing(kind)
    }

    fn stop_drawing(&mut self) {
        self.inner_mut().stop_drawing()
    }

    fn drawing(&self) -> Option<ShapeKind> {
        self.inner().drawing()
    }

    fn view_state(&self) -> ViewState {
        self.inner().view_state()
    }

    fn destroy(&mut self) {
        self.inner_mut().destroy()
    }

    fn set_3d_mode(&mut self, enabled: bool) -> Result<(), MapError> {
        self.inner_mut().set_3d_mode(enabled)
    }

    fn render_extrusion(
        &mut self,
        collection: &FeatureCollection,
        key: &str,
    ) -> Result<(), MapError> {
        self.inner_mut().render_extrusion(collection, key)
    }

    fn show_simulation_flow(
        &mut self,
        trips: Vec<simulation::Trip>,
        layer: simulation::SimLayerKind,
    ) -> Result<(), MapError> {
        self.inner_mut().show_simulation_flow(trips, layer)
    }

    fn set_animation_paused(&mut self, paused: bool) -> Result<(), MapError> {
        self.inner_mut().set_animation_paused(paused)
    }

    fn trip_hover(&self, index: usize) -> Option<simulation::TripHover> {
        self.inner().trip_hover(index)
    }

    fn create_grid_in_polygon(
        &mut self,
        rings: &[Vec<LngLat>],
        cell_size_km: f64,
        kind: GridKind,
    ) -> Result<usize, MapError> {
        self.inner_mut()
            .create_grid_in_polygon(rings, cell_size_km, kind)
    }

    fn merge_grid_by_condition(&mut self, source_id: &str) -> Result<usize, MapError> {
        self.inner_mut().merge_grid_by_condition(source_id)
    }
}
