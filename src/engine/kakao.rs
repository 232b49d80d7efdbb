//! Adapter for the regional raster basemap engine.
//!
//! The engine works latitude first and in integer levels, where a larger level shows more
//! of the map. Drawing is done by the engine's own drawing manager; its `drawend`
//! payload is converted to longitude first geometry here.

use egui::{Pos2, Rect, Vec2};
use log::{debug, info, warn};

use super::{
    AdapterEvent, ContainerHandle, DrawEnd, DrawableConversion, EngineAdapter, EngineEvent,
    LoadState, RenderCache,
};
use crate::config::{EngineConfig, KakaoConfig};
use crate::geometry::{Geometry, GeometryError, LatLng, LngLat, ShapeKind};
use crate::projection::{MapProjection, ViewState, regional_level_to_zoom, zoom_to_regional_level};
use crate::store::{DEFAULT_HEAT_WEIGHT, HeatPoint, Shape, Snapshot};
use crate::style::{AreaStyle, LabelPosition, PathStyle, StyleConfig};
use crate::{EngineKind, MapError};

/// Handle of an overlay placed on the map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverlayId(pub u64);

/// A native overlay, latitude first.
#[derive(Clone, Debug, PartialEq)]
pub enum Overlay {
    /// Circle with a radius in meters.
    Circle {
        /// Center.
        center: LatLng,
        /// Radius in meters.
        radius: f64,
        /// Stroke and fill.
        style: AreaStyle,
    },
    /// Rectangle given by its bounds.
    Rectangle {
        /// South west corner.
        sw: LatLng,
        /// North east corner.
        ne: LatLng,
        /// Stroke and fill.
        style: AreaStyle,
    },
    /// Polygon.
    Polygon {
        /// Vertices.
        path: Vec<LatLng>,
        /// Stroke and fill.
        style: AreaStyle,
    },
    /// Path trail of a live entity.
    Polyline {
        /// Vertices.
        path: Vec<LatLng>,
        /// Stroke.
        style: PathStyle,
    },
    /// Custom overlay for a marker shape.
    Marker {
        /// Anchor position.
        position: LatLng,
        /// Icon reference.
        icon: String,
        /// Icon size in pixels.
        icon_size: [f32; 2],
        /// Text shown next to the icon.
        label: Option<String>,
        /// Where the label sits.
        label_position: LabelPosition,
    },
    /// Custom overlay for a live entity.
    LiveEntity {
        /// Entity id.
        id: String,
        /// Current position.
        position: LatLng,
    },
}

/// One heatmap sample in container pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeatPixel {
    /// Pixel position, floored.
    pub pos: Pos2,
    /// Weight.
    pub value: f64,
    /// Radius in pixels.
    pub radius: f32,
}

/// Everything the density renderer needs for one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeatmapFrame {
    /// Weight that maps to full intensity, zero for an empty frame.
    pub max: f64,
    /// Samples inside the container.
    pub points: Vec<HeatPixel>,
}

/// What the adapter needs from the regional engine's SDK and the density renderer.
pub trait RegionalSurface {
    /// Starts loading the SDK and creates the map. Completion is reported as
    /// [`EngineEvent::Loaded`].
    fn load(
        &mut self,
        container: &ContainerHandle,
        config: &KakaoConfig,
        center: LatLng,
        level: u8,
    ) -> Result<(), MapError>;

    /// Places an overlay on the map.
    fn add_overlay(&mut self, overlay: Overlay) -> OverlayId;

    /// Takes an overlay off the map.
    fn remove_overlay(&mut self, id: OverlayId);

    /// Arms the drawing manager for `kind`.
    fn select_drawing(&mut self, kind: ShapeKind);

    /// Disarms the drawing manager, dropping an unfinished gesture.
    fn cancel_drawing(&mut self);

    /// Removes the temporary overlay of the last completed gesture.
    fn remove_drawn(&mut self);

    /// Current center and level, `None` before the map exists.
    fn camera(&self) -> Option<(LatLng, u8)>;

    /// Size of the map container in pixels.
    fn container_size(&self) -> Vec2;

    /// Replaces the heatmap data.
    fn set_heatmap(&mut self, frame: HeatmapFrame);

    /// Shows or hides the heatmap canvas.
    fn set_heatmap_visible(&mut self, visible: bool);

    /// Tears the map down.
    fn destroy(&mut self);
}

/// The regional raster basemap engine.
pub struct KakaoAdapter {
    surface: Box<dyn RegionalSurface>,
    config: KakaoConfig,
    styles: StyleConfig,
    state: LoadState,
    drawing: Option<ShapeKind>,
    cache: RenderCache,
    shape_overlays: Vec<OverlayId>,
    live_overlays: Vec<OverlayId>,
}

impl KakaoAdapter {
    /// Creates an adapter drawing on `surface`.
    pub fn new(surface: Box<dyn RegionalSurface>, config: KakaoConfig, styles: StyleConfig) -> Self {
        Self {
            surface,
            config,
            styles,
            state: LoadState::Created,
            drawing: None,
            cache: RenderCache::default(),
            shape_overlays: Vec::new(),
            live_overlays: Vec::new(),
        }
    }

    fn render_static(&mut self, snapshot: &Snapshot<'_>) {
        for id in self.shape_overlays.drain(..) {
            self.surface.remove_overlay(id);
        }

        for shape in snapshot.shapes {
            match Self::to_engine_drawable(shape, &self.styles) {
                Ok(overlay) => self.shape_overlays.push(self.surface.add_overlay(overlay)),
                Err(e) => warn!("Skipping shape {}: {}", shape.id, e),
            }
        }
        for path in snapshot.paths.values() {
            if path.len() < 2 {
                continue;
            }
            let overlay = Overlay::Polyline {
                path: path.clone(),
                style: self.styles.path,
            };
            self.shape_overlays.push(self.surface.add_overlay(overlay));
        }
    }

    fn render_live_entities(&mut self, snapshot: &Snapshot<'_>) {
        for id in self.live_overlays.drain(..) {
            self.surface.remove_overlay(id);
        }
        for (id, position) in snapshot.live_entities {
            let overlay = Overlay::LiveEntity {
                id: id.clone(),
                position: *position,
            };
            self.live_overlays.push(self.surface.add_overlay(overlay));
        }
    }

    /// Projects the last heatmap onto the current camera.
    fn render_heatmap_positions(&mut self) {
        let frame = self.heatmap_frame(self.cache.heatmap());
        let visible = !frame.points.is_empty();
        self.surface.set_heatmap(frame);
        if visible {
            self.surface.set_heatmap_visible(true);
        }
    }

    fn heatmap_frame(&self, heatmap: &[HeatPoint]) -> HeatmapFrame {
        if heatmap.is_empty() {
            return HeatmapFrame::default();
        }
        let container = Rect::from_min_size(Pos2::ZERO, self.surface.container_size());
        let projection = MapProjection::new(self.view_state(), container);
        let style = &self.styles.heatmap;

        let points = heatmap
            .iter()
            .filter_map(|point| {
                let pos = LatLng::new(point.lat, point.lng);
                if !projection.contains(pos) {
                    return None;
                }
                let pixel = projection.project(pos);
                let value = if point.weight.is_finite() && point.weight != 0.0 {
                    point.weight
                } else {
                    DEFAULT_HEAT_WEIGHT
                };
                Some(HeatPixel {
                    pos: egui::pos2(pixel.x.floor(), pixel.y.floor()),
                    value,
                    radius: style.radius,
                })
            })
            .collect();

        HeatmapFrame {
            max: style.max_value,
            points,
        }
    }
}

impl DrawableConversion for KakaoAdapter {
    type Drawable = Overlay;
    type RawDraw = DrawEnd;

    fn to_engine_drawable(shape: &Shape, styles: &StyleConfig) -> Result<Overlay, GeometryError> {
        shape.geometry.validate()?;
        let area = || {
            shape
                .style
                .area()
                .copied()
                .unwrap_or_else(|| styles.area_for(shape.kind()))
        };

        Ok(match &shape.geometry {
            Geometry::Marker { coordinates } => {
                let marker = shape.style.marker().unwrap_or(&styles.marker);
                Overlay::Marker {
                    position: LatLng::from(*coordinates),
                    icon: if marker.icon.is_empty() {
                        styles.marker.icon.clone()
                    } else {
                        marker.icon.clone()
                    },
                    icon_size: styles.marker_icon_size,
                    label: shape.name().map(str::to_string),
                    label_position: marker.label_position,
                }
            }
            Geometry::Circle { center, radius } => Overlay::Circle {
                center: LatLng::from(*center),
                radius: *radius,
                style: area(),
            },
            Geometry::Rectangle { bbox } => Overlay::Rectangle {
                sw: LatLng::from(bbox.min()),
                ne: LatLng::from(bbox.max()),
                style: area(),
            },
            Geometry::Polygon { coordinates } => Overlay::Polygon {
                path: coordinates.iter().map(|&c| LatLng::from(c)).collect(),
                style: area(),
            },
        })
    }

    fn from_engine_draw_event(raw: DrawEnd) -> Option<Geometry> {
        match raw {
            DrawEnd::Marker { position } => Some(Geometry::Marker {
                coordinates: LngLat::from(position),
            }),
            DrawEnd::Circle { center, radius } => Some(Geometry::Circle {
                center: LngLat::from(center),
                radius,
            }),
            DrawEnd::Rectangle { s_point, e_point } => Some(Geometry::rectangle(
                LngLat::from(s_point),
                LngLat::from(e_point),
            )),
            DrawEnd::Polygon { points } if !points.is_empty() => Some(Geometry::Polygon {
                coordinates: points.into_iter().map(LngLat::from).collect(),
            }),
            DrawEnd::Polygon { .. } => None,
        }
    }
}

impl EngineAdapter for KakaoAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Kakao
    }

    fn initialize(
        &mut self,
        container: &ContainerHandle,
        view: ViewState,
    ) -> Result<(), MapError> {
        if self.state != LoadState::Created {
            return Err(MapError::EngineUnavailable(
                EngineKind::Kakao,
                "adapter was already initialized".to_string(),
            ));
        }
        let level = zoom_to_regional_level(view.zoom);
        debug!("Loading regional engine at level {level} for zoom {}", view.zoom);
        self.surface
            .load(container, &self.config, view.center, level)?;
        self.state = LoadState::Loading;
        Ok(())
    }

    fn handle_event(&mut self, event: EngineEvent) -> Option<AdapterEvent> {
        match (self.state, event) {
            (LoadState::Loading, EngineEvent::Loaded) => {
                info!("Regional engine loaded");
                self.state = LoadState::Ready;
                if let Some(kind) = self.drawing {
                    self.surface.select_drawing(kind);
                }
                Some(AdapterEvent::Ready)
            }
            (LoadState::Loading, EngineEvent::LoadFailed(reason)) => {
                self.state = LoadState::Destroyed;
                Some(AdapterEvent::Failed(reason))
            }
            (LoadState::Ready, EngineEvent::DrawEnd(raw)) => {
                self.surface.remove_drawn();
                if self.drawing.is_none() {
                    debug!("Ignoring a drawing finished after drawing mode was left");
                    return None;
                }
                self.stop_drawing();
                Self::from_engine_draw_event(raw).map(AdapterEvent::ShapeDrawn)
            }
            (LoadState::Ready, EngineEvent::CameraChanged) => {
                self.render_heatmap_positions();
                None
            }
            (LoadState::Ready, EngineEvent::ZoomStart) => {
                self.surface.set_heatmap_visible(false);
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
        if self.cache.live_changed(snapshot) {
            self.render_live_entities(snapshot);
        }
        if self.cache.heatmap_changed(snapshot) {
            self.render_heatmap_positions();
        }
    }

    fn start_drawing(&mut self, kind: ShapeKind) {
        self.drawing = Some(kind);
        if self.is_ready() {
            self.surface.cancel_drawing();
            self.surface.select_drawing(kind);
        }
    }

    fn stop_drawing(&mut self) {
        self.drawing = None;
        if self.is_ready() {
            self.surface.cancel_drawing();
        }
    }

    fn drawing(&self) -> Option<ShapeKind> {
        self.drawing
    }

    fn view_state(&self) -> ViewState {
        match self.surface.camera() {
            Some((center, level)) => ViewState::new(center, regional_level_to_zoom(level)),
            None => ViewState::new(self.config.default_center(), self.config.default_zoom()),
        }
    }

    fn destroy(&mut self) {
        self.drawing = None;
        self.cache.clear();
        self.shape_overlays.clear();
        self.live_overlays.clear();
        if matches!(self.state, LoadState::Loading | LoadState::Ready) {
            self.surface.destroy();
        }
        self.state = LoadState::Destroyed;
    }
}
