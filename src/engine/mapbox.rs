//! Adapter for the global vector basemap engine.
//!
//! Shapes are drawn as GeoJSON sources, markers as DOM markers. Drawing is done by the
//! adapter itself from map clicks, so raw gestures are already longitude first.

use geojson::{Feature, FeatureCollection, Geometry as GeoGeometry, Value};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};

use super::drawing::{CompletedGesture, DrawSession};
use super::simulation::{self, SimLayerKind, Trip, TripHover, TripsClock};
use super::{
    AdapterEvent, ContainerHandle, DrawableConversion, EngineAdapter, EngineEvent, GridKind,
    LoadState, RenderCache,
};
use crate::config::{EngineConfig, MapboxConfig};
use crate::geometry::{
    CIRCLE_STEPS, Geometry, GeometryError, LatLng, LngLat, ShapeKind, circle_ring, closed_ring,
    haversine_distance, open_ring,
};
use crate::projection::ViewState;
use crate::store::{Shape, Snapshot};
use crate::style::{LabelPosition, StyleConfig, ser_color::to_hex};
use crate::{EngineKind, MapError};

/// Source holding the finished shapes and path trails.
pub const MASTER_SOURCE: &str = "master-source";
/// Source holding the shape being drawn.
pub const PREVIEW_SOURCE: &str = "preview-source";
/// Source holding the heatmap points.
pub const HEATMAP_SOURCE: &str = "heatmap-source";
/// Source holding the live entities.
pub const MARKER_SOURCE: &str = "marker-source";
/// Source filled by [`EngineAdapter::create_grid_in_polygon`].
pub const GRID_SOURCE: &str = "grid-source";
/// Source filled by [`EngineAdapter::merge_grid_by_condition`].
pub const MERGED_SOURCE: &str = "merged-zone-source";
/// Source holding the extruded statistics collection.
pub const EXTRUSION_SOURCE: &str = "custom-3d-source";

const BUILDINGS_LAYER: &str = "3d-buildings";
const EXTRUSION_LAYER: &str = "custom-3d-layer";
const GRID_LAYER: &str = "grid-layer";
const MERGED_LAYER: &str = "merged-zone-layer";
const MERGED_OUTLINE_LAYER: &str = "merged-zone-layer-outline";
const SIM_ARC_LAYER: &str = "sim-arc-layer";
const SIM_PATH_LAYER: &str = "sim-path-layer";
const SIM_TRIPS_LAYER: &str = "sim-trips-layer";
const SIM_LAYERS: [&str; 3] = [SIM_TRIPS_LAYER, SIM_ARC_LAYER, SIM_PATH_LAYER];

// Preview circles smaller than this are not shown.
const MIN_PREVIEW_RADIUS_M: f64 = 1.0;

// Heat weight of a point whose weight is zero or not a number.
const FALLBACK_HEAT_WEIGHT: f64 = 1.0;

// Camera target of the simulation views.
const SIM_CENTER: LngLat = LngLat(126.98, 37.53);
const SIM_ZOOM: f64 = 11.5;

/// Rendering type of a style layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerKind {
    /// Polygon fill.
    Fill,
    /// Line or outline.
    Line,
    /// Density heatmap.
    Heatmap,
    /// Icons and text.
    Symbol,
    /// Extruded polygons.
    FillExtrusion,
    /// Origin to destination arcs.
    Arc,
    /// Static paths.
    Path,
    /// Animated trips.
    Trips,
}

/// A style layer to add to the map.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LayerSpec {
    /// Layer id.
    pub id: String,
    /// Rendering type.
    pub kind: LayerKind,
    /// GeoJSON source the layer reads, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Source layer of a vector tile source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_layer: Option<String>,
    /// Paint properties.
    pub paint: JsonValue,
    /// Feature filter expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<JsonValue>,
    /// Inline data of data driven overlay layers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    /// Id of the layer to insert this one below.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
}

impl LayerSpec {
    fn new(id: &str, kind: LayerKind, paint: JsonValue) -> Self {
        Self {
            id: id.to_string(),
            kind,
            source: None,
            source_layer: None,
            paint,
            filter: None,
            data: None,
            before: None,
        }
    }

    fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    fn filter(mut self, filter: JsonValue) -> Self {
        self.filter = Some(filter);
        self
    }

    fn data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }
}

/// A DOM marker for a marker shape: icon, optional label and optional rating bar.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DomMarker {
    /// Id of the shape.
    pub shape_id: String,
    /// Anchor position.
    pub position: LngLat,
    /// Icon reference.
    pub icon: String,
    /// Icon size in pixels.
    pub icon_size: [f32; 2],
    /// Text shown next to the icon.
    pub label: Option<String>,
    /// Where the label sits.
    pub label_position: LabelPosition,
    /// Fill of the rating bar in percent.
    pub rating_percent: Option<f64>,
}

/// Mouse cursor over the map canvas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Cursor {
    /// Engine default.
    #[default]
    Default,
    /// Drawing crosshair.
    Crosshair,
}

/// An animated camera move. `None` fields keep their current value.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CameraMove {
    /// Target center.
    pub center: Option<LngLat>,
    /// Target zoom.
    pub zoom: Option<f64>,
    /// Target pitch in degrees.
    pub pitch: Option<f64>,
    /// Target bearing in degrees.
    pub bearing: Option<f64>,
    /// Animation length in milliseconds.
    pub duration_ms: u32,
}

impl CameraMove {
    fn tilt(pitch: f64, bearing: f64, duration_ms: u32) -> Self {
        Self {
            pitch: Some(pitch),
            bearing: Some(bearing),
            duration_ms,
            ..Default::default()
        }
    }

    fn overview(pitch: f64, bearing: f64) -> Self {
        Self {
            center: Some(SIM_CENTER),
            zoom: Some(SIM_ZOOM),
            ..Self::tilt(pitch, bearing, 1500)
        }
    }
}

/// What the adapter needs from the global engine's SDK.
pub trait GlobalSurface {
    /// Starts loading the map. Completion is reported as [`EngineEvent::Loaded`].
    fn load(
        &mut self,
        container: &ContainerHandle,
        config: &MapboxConfig,
        center: LngLat,
        zoom: f64,
    ) -> Result<(), MapError>;

    /// Replaces the data of a GeoJSON source, creating the source if needed.
    fn set_source_data(&mut self, source_id: &str, data: FeatureCollection);

    /// Adds a style layer.
    fn add_layer(&mut self, layer: LayerSpec);

    /// Whether a layer exists.
    fn has_layer(&self, layer_id: &str) -> bool;

    /// Removes a layer if it exists.
    fn remove_layer(&mut self, layer_id: &str);

    /// Shows or hides a layer.
    fn set_layer_visibility(&mut self, layer_id: &str, visible: bool);

    /// Sets one paint property of a layer.
    fn set_paint_property(&mut self, layer_id: &str, property: &str, value: JsonValue);

    /// Replaces all shape DOM markers.
    fn set_shape_markers(&mut self, markers: Vec<DomMarker>);

    /// Sets the canvas cursor.
    fn set_cursor(&mut self, cursor: Cursor);

    /// Current center and zoom, `None` before the map exists.
    fn camera(&self) -> Option<(LngLat, f64)>;

    /// Animates the camera.
    fn ease_to(&mut self, camera: CameraMove);

    /// Sets the current time of an animated layer and repaints.
    fn set_layer_time(&mut self, layer_id: &str, time: f64);

    /// Fills the polygon `rings` with `kind` cells of `cell_size_km`, clipped to the polygon,
    /// into `source_id`. Returns the number of cells.
    fn create_grid(
        &mut self,
        source_id: &str,
        rings: &[Vec<LngLat>],
        cell_size_km: f64,
        kind: GridKind,
    ) -> Result<usize, MapError>;

    /// Unions the cells of `source_id` by demand level into `target_id`. Returns the number
    /// of zones.
    fn merge_grid(&mut self, source_id: &str, target_id: &str) -> Result<usize, MapError>;

    /// Removes the map and all its listeners.
    fn remove(&mut self);
}

/// What the global engine draws for one shape.
#[derive(Clone, Debug, PartialEq)]
pub enum GlobalDrawable {
    /// A polygon feature of the master source.
    Feature(Feature),
    /// A DOM marker.
    Marker(DomMarker),
}

/// The global vector basemap engine.
pub struct MapboxAdapter {
    surface: Box<dyn GlobalSurface>,
    config: MapboxConfig,
    styles: StyleConfig,
    state: LoadState,
    session: DrawSession,
    cache: RenderCache,
    trips: Option<TripsClock>,
    shown_trips: Vec<Trip>,
    paused: bool,
}

impl MapboxAdapter {
    /// Creates an adapter drawing on `surface`.
    pub fn new(surface: Box<dyn GlobalSurface>, config: MapboxConfig, styles: StyleConfig) -> Self {
        Self {
            surface,
            config,
            styles,
            state: LoadState::Created,
            session: DrawSession::new(),
            cache: RenderCache::default(),
            trips: None,
            shown_trips: Vec::new(),
            paused: false,
        }
    }

    fn ensure_ready(&self) -> Result<(), MapError> {
        if self.state == LoadState::Ready {
            Ok(())
        } else {
            Err(MapError::NotReady)
        }
    }

    fn setup_layers(&mut self) {
        let surface = &mut self.surface;

        surface.set_source_data(MASTER_SOURCE, feature_collection(Vec::new()));
        surface.add_layer(
            LayerSpec::new(
                "master-fill",
                LayerKind::Fill,
                json!({
                    "fill-color": ["coalesce", ["get", "fillColor"], to_hex(&self.styles.polygon.fill_color)],
                    "fill-opacity": ["coalesce", ["get", "fillOpacity"], self.styles.polygon.fill_opacity],
                }),
            )
            .source(MASTER_SOURCE)
            .filter(json!(["==", "$type", "Polygon"])),
        );
        surface.add_layer(
            LayerSpec::new(
                "master-line",
                LayerKind::Line,
                json!({
                    "line-color": ["coalesce", ["get", "strokeColor"], to_hex(&self.styles.polygon.stroke_color)],
                    "line-width": ["coalesce", ["get", "strokeWidth"], self.styles.polygon.stroke_width],
                }),
            )
            .source(MASTER_SOURCE)
            .filter(json!(["any", ["==", "$type", "Polygon"], ["==", "$type", "LineString"]])),
        );

        surface.set_source_data(PREVIEW_SOURCE, feature_collection(Vec::new()));
        surface.add_layer(
            LayerSpec::new(
                "preview-fill",
                LayerKind::Fill,
                json!({"fill-color": "#0000FF", "fill-opacity": 0.3}),
            )
            .source(PREVIEW_SOURCE)
            .filter(json!(["==", "$type", "Polygon"])),
        );
        surface.add_layer(
            LayerSpec::new(
                "preview-line",
                LayerKind::Line,
                json!({"line-color": "#0000FF", "line-width": 2}),
            )
            .source(PREVIEW_SOURCE),
        );

        let heatmap = &self.styles.heatmap;
        let mut color = vec![json!("interpolate"), json!(["linear"]), json!(["heatmap-density"])];
        for stop in &heatmap.gradient {
            color.push(json!(stop.density));
            color.push(json!(to_hex(&stop.color)));
        }
        surface.set_source_data(HEATMAP_SOURCE, feature_collection(Vec::new()));
        let mut heatmap_layer = LayerSpec::new(
            "heatmap-layer",
            LayerKind::Heatmap,
            json!({
                "heatmap-weight": [
                    "interpolate", ["linear"],
                    ["coalesce", ["get", "weight"], FALLBACK_HEAT_WEIGHT],
                    0, 0,
                    heatmap.max_value, 1
                ],
                "heatmap-intensity": ["interpolate", ["linear"], ["zoom"], 0, 1, 15, 3],
                "heatmap-radius": ["interpolate", ["linear"], ["zoom"], 0, 2, 15, heatmap.radius],
                "heatmap-color": color,
                "heatmap-opacity": heatmap.opacity * 0.6,
            }),
        )
        .source(HEATMAP_SOURCE);
        heatmap_layer.before = Some("waterway-label".to_string());
        surface.add_layer(heatmap_layer);

        surface.set_source_data(MARKER_SOURCE, feature_collection(Vec::new()));
        surface.add_layer(
            LayerSpec::new(
                "marker-layer",
                LayerKind::Symbol,
                json!({"text-color": "#000000", "text-halo-color": "#FFFFFF", "text-halo-width": 1}),
            )
            .source(MARKER_SOURCE),
        );
    }

    fn render_static(&mut self, snapshot: &Snapshot<'_>) {
        let mut features = Vec::new();
        let mut markers = Vec::new();

        for shape in snapshot.shapes {
            match Self::to_engine_drawable(shape, &self.styles) {
                Ok(GlobalDrawable::Feature(feature)) => features.push(feature),
                Ok(GlobalDrawable::Marker(marker)) => markers.push(marker),
                Err(e) => warn!("Skipping shape {}: {}", shape.id, e),
            }
        }

        for (id, path) in snapshot.paths {
            if path.len() < 2 {
                continue;
            }
            let line = path.iter().map(|p| LngLat::from(*p).to_position()).collect();
            let mut properties = Map::new();
            properties.insert("entityId".to_string(), JsonValue::from(id.as_str()));
            properties.insert(
                "strokeColor".to_string(),
                JsonValue::from(to_hex(&self.styles.path.stroke_color)),
            );
            properties.insert(
                "strokeWidth".to_string(),
                JsonValue::from(self.styles.path.stroke_width),
            );
            features.push(feature(Value::LineString(line), properties));
        }

        debug!(
            "Drawing {} features and {} markers",
            features.len(),
            markers.len()
        );
        self.surface.set_shape_markers(markers);
        self.surface
            .set_source_data(MASTER_SOURCE, feature_collection(features));
    }

    fn render_heatmap(&mut self, snapshot: &Snapshot<'_>) {
        let features = snapshot
            .heatmap
            .iter()
            .map(|point| {
                let weight = if point.weight.is_finite() && point.weight != 0.0 {
                    point.weight
                } else {
                    FALLBACK_HEAT_WEIGHT
                };
                let mut properties = Map::new();
                properties.insert("weight".to_string(), JsonValue::from(weight));
                feature(Value::Point(vec![point.lng, point.lat]), properties)
            })
            .collect();
        self.surface
            .set_source_data(HEATMAP_SOURCE, feature_collection(features));
    }

    fn render_live_entities(&mut self, snapshot: &Snapshot<'_>) {
        let features = snapshot
            .live_entities
            .iter()
            .map(|(id, pos)| {
                let mut properties = Map::new();
                properties.insert("id".to_string(), JsonValue::from(id.as_str()));
                properties.insert("title".to_string(), JsonValue::from(id.as_str()));
                feature(Value::Point(LngLat::from(*pos).to_position()), properties)
            })
            .collect();
        self.surface
            .set_source_data(MARKER_SOURCE, feature_collection(features));
    }

    fn update_preview(&mut self, cursor: LngLat) {
        let features = self
            .session
            .preview(cursor)
            .and_then(|geometry| preview_value(&geometry))
            .map(|value| vec![feature(value, Map::new())])
            .unwrap_or_default();
        self.surface
            .set_source_data(PREVIEW_SOURCE, feature_collection(features));
    }

    fn finish(&mut self, gesture: CompletedGesture) -> Option<AdapterEvent> {
        self.stop_drawing();
        let geometry = Self::from_engine_draw_event(gesture)?;
        Some(AdapterEvent::ShapeDrawn(geometry))
    }
}

impl DrawableConversion for MapboxAdapter {
    type Drawable = GlobalDrawable;
    type RawDraw = CompletedGesture;

    fn to_engine_drawable(
        shape: &Shape,
        styles: &StyleConfig,
    ) -> Result<GlobalDrawable, GeometryError> {
        shape.geometry.validate()?;

        if let Geometry::Marker { coordinates } = &shape.geometry {
            let marker_style = shape.style.marker().unwrap_or(&styles.marker);
            let icon = if marker_style.icon.is_empty() {
                styles.marker.icon.clone()
            } else {
                marker_style.icon.clone()
            };
            return Ok(GlobalDrawable::Marker(DomMarker {
                shape_id: shape.id.clone(),
                position: *coordinates,
                icon,
                icon_size: styles.marker_icon_size,
                label: shape.name().map(str::to_string),
                label_position: marker_style.label_position,
                rating_percent: rating_percent(shape),
            }));
        }

        let style = shape
            .style
            .area()
            .copied()
            .unwrap_or_else(|| styles.area_for(shape.kind()));
        let mut properties = Map::new();
        properties.insert("id".to_string(), JsonValue::from(shape.id.as_str()));
        properties.insert(
            "fillColor".to_string(),
            JsonValue::from(to_hex(&style.fill_color)),
        );
        properties.insert("fillOpacity".to_string(), JsonValue::from(style.fill_opacity));
        properties.insert(
            "strokeColor".to_string(),
            JsonValue::from(to_hex(&style.stroke_color)),
        );
        properties.insert("strokeWidth".to_string(), JsonValue::from(style.stroke_width));

        let value = polygon_value(&shape.geometry).ok_or(GeometryError::TooFewVertices(0))?;
        Ok(GlobalDrawable::Feature(feature(value, properties)))
    }

    fn from_engine_draw_event(gesture: CompletedGesture) -> Option<Geometry> {
        match (gesture.kind, gesture.vertices.as_slice()) {
            (ShapeKind::Marker, [position, ..]) => Some(Geometry::Marker {
                coordinates: *position,
            }),
            (ShapeKind::Circle, [center, edge, ..]) => Some(Geometry::Circle {
                center: *center,
                radius: haversine_distance(*center, *edge),
            }),
            (ShapeKind::Rectangle, [a, b, ..]) => Some(Geometry::rectangle(*a, *b)),
            (ShapeKind::Polygon, vertices) if open_ring(vertices).len() >= 3 => {
                Some(Geometry::Polygon {
                    coordinates: vertices.to_vec(),
                })
            }
            _ => None,
        }
    }
}

impl EngineAdapter for MapboxAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Mapbox
    }

    fn initialize(
        &mut self,
        container: &ContainerHandle,
        view: ViewState,
    ) -> Result<(), MapError> {
        if self.state != LoadState::Created {
            return Err(MapError::EngineUnavailable(
                EngineKind::Mapbox,
                "adapter was already initialized".to_string(),
            ));
        }
        self.surface
            .load(container, &self.config, LngLat::from(view.center), view.zoom)?;
        self.state = LoadState::Loading;
        Ok(())
    }

    fn handle_event(&mut self, event: EngineEvent) -> Option<AdapterEvent> {
        match (self.state, event) {
            (LoadState::Loading, EngineEvent::Loaded) => {
                info!("Global engine loaded");
                self.setup_layers();
                self.state = LoadState::Ready;
                Some(AdapterEvent::Ready)
            }
            (LoadState::Loading, EngineEvent::LoadFailed(reason)) => {
                self.state = LoadState::Destroyed;
                Some(AdapterEvent::Failed(reason))
            }
            (LoadState::Ready, EngineEvent::Click(pos)) => {
                if let Some(gesture) = self.session.click(pos) {
                    return self.finish(gesture);
                }
                if self.session.active() == Some(ShapeKind::Polygon) {
                    self.update_preview(pos);
                }
                None
            }
            (LoadState::Ready, EngineEvent::DoubleClick(_) | EngineEvent::ContextMenu) => {
                let gesture = self.session.finish_polygon()?;
                self.finish(gesture)
            }
            (LoadState::Ready, EngineEvent::PointerMove(pos)) => {
                if self.session.active().is_some() {
                    self.update_preview(pos);
                }
                None
            }
            (LoadState::Ready, EngineEvent::AnimationFrame) => {
                let time = self.trips.as_mut()?.tick();
                self.surface.set_layer_time(SIM_TRIPS_LAYER, time);
                None
            }
            _ => None,
        }
    }

    fn is_ready(&self) -> bool {
        self.state == LoadState::Ready
    }

    fn render_all(&mut self, snapshot: &Snapshot<'_>) {
        if !self.is_ready() {
            return;
        }
        if self.cache.static_changed(snapshot) {
            self.render_static(snapshot);
        }
        if self.cache.heatmap_changed(snapshot) {
            self.render_heatmap(snapshot);
        }
        if self.cache.live_changed(snapshot) {
            self.render_live_entities(snapshot);
        }
    }

    fn start_drawing(&mut self, kind: ShapeKind) {
        if self.session.start(kind) {
            debug!("Discarded unfinished drawing for {kind}");
        }
        if self.is_ready() {
            self.surface.set_cursor(Cursor::Crosshair);
            self.surface
                .set_source_data(PREVIEW_SOURCE, feature_collection(Vec::new()));
        }
    }

    fn stop_drawing(&mut self) {
        self.session.stop();
        if self.is_ready() {
            self.surface.set_cursor(Cursor::Default);
            self.surface
                .set_source_data(PREVIEW_SOURCE, feature_collection(Vec::new()));
        }
    }

    fn drawing(&self) -> Option<ShapeKind> {
        self.session.active()
    }

    fn view_state(&self) -> ViewState {
        match self.surface.camera() {
            Some((center, zoom)) => ViewState::new(LatLng::from(center), zoom),
            None => ViewState::new(self.config.default_center(), self.config.default_zoom()),
        }
    }

    fn destroy(&mut self) {
        self.trips = None;
        self.shown_trips.clear();
        self.session.stop();
        self.cache.clear();
        if matches!(self.state, LoadState::Loading | LoadState::Ready) {
            self.surface.remove();
        }
        self.state = LoadState::Destroyed;
    }

    fn set_3d_mode(&mut self, enabled: bool) -> Result<(), MapError> {
        self.ensure_ready()?;
        if enabled {
            self.surface.ease_to(CameraMove::tilt(60.0, -20.0, 1000));
            if self.surface.has_layer(BUILDINGS_LAYER) {
                self.surface.set_layer_visibility(BUILDINGS_LAYER, true);
            } else {
                let mut layer = LayerSpec::new(
                    BUILDINGS_LAYER,
                    LayerKind::FillExtrusion,
                    json!({
                        "fill-extrusion-color": "#e0e0e0",
                        "fill-extrusion-height": ["get", "height"],
                        "fill-extrusion-base": ["get", "min_height"],
                        "fill-extrusion-opacity": 0.8,
                    }),
                )
                .source("composite")
                .filter(json!(["==", "extrude", "true"]));
                layer.source_layer = Some("building".to_string());
                self.surface.add_layer(layer);
            }
        } else {
            self.surface.ease_to(CameraMove::tilt(0.0, 0.0, 1000));
            if self.surface.has_layer(BUILDINGS_LAYER) {
                self.surface.set_layer_visibility(BUILDINGS_LAYER, false);
            }
        }
        Ok(())
    }

    fn render_extrusion(
        &mut self,
        collection: &FeatureCollection,
        key: &str,
    ) -> Result<(), MapError> {
        self.ensure_ready()?;
        self.surface
            .set_source_data(EXTRUSION_SOURCE, collection.clone());

        let value = json!(["to-number", ["get", key]]);
        let color = json!([
            "interpolate", ["linear"], value,
            0, "#3182bd",
            50000, "#ffeda0",
            150000, "#f03b20"
        ]);
        let height = json!(["*", value, 0.02]);

        if self.surface.has_layer(EXTRUSION_LAYER) {
            self.surface
                .set_paint_property(EXTRUSION_LAYER, "fill-extrusion-height", height);
            self.surface
                .set_paint_property(EXTRUSION_LAYER, "fill-extrusion-color", color);
        } else {
            self.surface.add_layer(
                LayerSpec::new(
                    EXTRUSION_LAYER,
                    LayerKind::FillExtrusion,
                    json!({
                        "fill-extrusion-color": color,
                        "fill-extrusion-height": height,
                        "fill-extrusion-base": 0,
                        "fill-extrusion-opacity": 0.8,
                    }),
                )
                .source(EXTRUSION_SOURCE),
            );
        }
        self.surface.ease_to(CameraMove::tilt(60.0, -20.0, 1500));
        Ok(())
    }

    fn show_simulation_flow(
        &mut self,
        mut trips: Vec<Trip>,
        layer: SimLayerKind,
    ) -> Result<(), MapError> {
        self.ensure_ready()?;
        self.trips = None;
        self.shown_trips.clear();
        for id in SIM_LAYERS {
            if self.surface.has_layer(id) {
                self.surface.remove_layer(id);
            }
        }

        match layer {
            SimLayerKind::None => {
                info!("Removed all simulation layers");
            }
            SimLayerKind::Arc => {
                let data = serde_json::to_value(simulation::arcs(&trips))?;
                self.surface.add_layer(
                    LayerSpec::new(
                        SIM_ARC_LAYER,
                        LayerKind::Arc,
                        json!({"getTargetColor": [255, 255, 255, 200], "getWidth": 3, "getHeight": 0.5, "getTilt": 15}),
                    )
                    .data(data),
                );
                self.surface.ease_to(CameraMove::overview(45.0, -10.0));
            }
            SimLayerKind::Path => {
                let data = serde_json::to_value(&trips)?;
                self.surface.add_layer(
                    LayerSpec::new(
                        SIM_PATH_LAYER,
                        LayerKind::Path,
                        json!({"getWidth": 10, "widthMinPixels": 3, "opacity": 0.7}),
                    )
                    .data(data),
                );
                self.surface.ease_to(CameraMove::overview(20.0, 0.0));
            }
            SimLayerKind::Trips => {
                simulation::retime(&mut trips);
                let trips = simulation::sanitize(trips);
                let clock = TripsClock::new(simulation::loop_length(&trips), self.paused);
                let data = serde_json::to_value(&trips)?;
                self.surface.add_layer(
                    LayerSpec::new(
                        SIM_TRIPS_LAYER,
                        LayerKind::Trips,
                        json!({"opacity": 0.9, "widthMinPixels": 4, "trailLength": 120, "currentTime": clock.time()}),
                    )
                    .data(data),
                );
                self.surface.ease_to(CameraMove::overview(55.0, -15.0));
                info!("Animating {} trips", trips.len());
                self.trips = Some(clock);
                self.shown_trips = trips;
            }
        }
        Ok(())
    }

    fn trip_hover(&self, index: usize) -> Option<TripHover> {
        self.shown_trips.get(index)?.hover_info()
    }

    fn set_animation_paused(&mut self, paused: bool) -> Result<(), MapError> {
        self.paused = paused;
        if let Some(clock) = self.trips.as_mut() {
            clock.set_paused(paused);
        }
        Ok(())
    }

    fn create_grid_in_polygon(
        &mut self,
        rings: &[Vec<LngLat>],
        cell_size_km: f64,
        kind: GridKind,
    ) -> Result<usize, MapError> {
        self.ensure_ready()?;
        let outer = rings.first().cloned().unwrap_or_default();
        Geometry::Polygon { coordinates: outer }.validate()?;
        if !(cell_size_km.is_finite() && cell_size_km > 0.0) {
            return Err(MapError::InvalidArgument(format!(
                "grid cell size must be positive, got {cell_size_km}"
            )));
        }

        let cells = self
            .surface
            .create_grid(GRID_SOURCE, rings, cell_size_km, kind)?;
        if !self.surface.has_layer(GRID_LAYER) {
            self.surface.add_layer(
                LayerSpec::new(
                    GRID_LAYER,
                    LayerKind::Fill,
                    json!({
                        "fill-color": ["interpolate", ["linear"], ["get", "demandValue"], 0, "#eff3ff", 100, "#084594"],
                        "fill-opacity": 0.6,
                        "fill-outline-color": "white",
                    }),
                )
                .source(GRID_SOURCE),
            );
        }
        info!("Created {cells} {kind:?} grid cells");
        Ok(cells)
    }

    fn merge_grid_by_condition(&mut self, source_id: &str) -> Result<usize, MapError> {
        self.ensure_ready()?;
        let zones = self.surface.merge_grid(source_id, MERGED_SOURCE)?;

        for id in [MERGED_LAYER, MERGED_OUTLINE_LAYER] {
            if self.surface.has_layer(id) {
                self.surface.remove_layer(id);
            }
        }
        self.surface.add_layer(
            LayerSpec::new(
                MERGED_LAYER,
                LayerKind::Fill,
                json!({
                    "fill-color": ["interpolate", ["linear"], ["get", "displayScore"], 0, "#ebfc07", 1, "#f50606"],
                    "fill-opacity": 0.7,
                    "fill-outline-color": "#ffffff",
                }),
            )
            .source(MERGED_SOURCE),
        );
        self.surface.add_layer(
            LayerSpec::new(
                MERGED_OUTLINE_LAYER,
                LayerKind::Line,
                json!({"line-color": "#2c3e50", "line-width": 1.5, "line-opacity": 0.4}),
            )
            .source(MERGED_SOURCE),
        );
        info!("Merged {source_id} into {zones} zones");
        Ok(zones)
    }
}

fn feature(value: Value, properties: Map<String, JsonValue>) -> Feature {
    let mut feature = Feature::default();
    feature.geometry = Some(GeoGeometry::new(value));
    feature.properties = Some(properties);
    feature
}

fn feature_collection(features: Vec<Feature>) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// The polygon of an area geometry. Markers have none.
fn polygon_value(geometry: &Geometry) -> Option<Value> {
    let ring = match geometry {
        Geometry::Marker { .. } => return None,
        Geometry::Circle { center, radius } => circle_ring(*center, *radius, CIRCLE_STEPS),
        Geometry::Rectangle { bbox } => bbox.ring(),
        Geometry::Polygon { coordinates } => closed_ring(coordinates),
    };
    Some(Value::Polygon(vec![
        ring.iter().map(LngLat::to_position).collect(),
    ]))
}

fn preview_value(geometry: &Geometry) -> Option<Value> {
    match geometry {
        Geometry::Circle { radius, .. } if *radius < MIN_PREVIEW_RADIUS_M => None,
        // Two vertices and the cursor do not enclose anything yet.
        Geometry::Polygon { coordinates } if geometry.validate().is_err() => {
            let line = open_ring(coordinates);
            (line.len() >= 2).then(|| Value::LineString(line.iter().map(LngLat::to_position).collect()))
        }
        _ => geometry.validate().ok().and_then(|_| polygon_value(geometry)),
    }
}

/// The rating property (`평점` or `rating`, out of five) as a bar fill percentage.
fn rating_percent(shape: &Shape) -> Option<f64> {
    let value = shape
        .properties
        .get("평점")
        .or_else(|| shape.properties.get("rating"))?;
    let rating = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    rating
        .is_finite()
        .then(|| (rating / 5.0 * 100.0).clamp(0.0, 100.0))
}
