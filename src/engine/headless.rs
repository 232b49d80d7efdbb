//! Surfaces that record what an adapter asks of them instead of drawing.
//!
//! Each surface is a cheap handle around shared state, so a test can keep a clone and
//! inspect the map after handing the other clone to an adapter.

use egui::Vec2;
use geojson::FeatureCollection;
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use super::kakao::{HeatmapFrame, Overlay, OverlayId, RegionalSurface};
use super::mapbox::{CameraMove, Cursor, DomMarker, GlobalSurface, LayerSpec};
use super::{ContainerHandle, GridKind, SurfaceProvider};
use crate::config::{KakaoConfig, MapboxConfig};
use crate::geometry::{LatLng, LngLat, ShapeKind};
use crate::{EngineKind, MapError};

#[derive(Debug, Default)]
struct GlobalRecord {
    mutations: usize,
    container: Option<ContainerHandle>,
    camera: Option<(LngLat, f64)>,
    sources: BTreeMap<String, FeatureCollection>,
    layers: BTreeMap<String, LayerSpec>,
    hidden: BTreeSet<String>,
    paint: BTreeMap<(String, String), JsonValue>,
    times: BTreeMap<String, f64>,
    markers: Vec<DomMarker>,
    cursor: Cursor,
    last_move: Option<CameraMove>,
    removed: bool,
}

/// A [`GlobalSurface`] recording sources, layers and camera moves.
#[derive(Clone, Debug, Default)]
pub struct HeadlessGlobalSurface {
    record: Rc<RefCell<GlobalRecord>>,
}

impl HeadlessGlobalSurface {
    /// Creates an empty surface.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls that changed the map.
    pub fn mutations(&self) -> usize {
        self.record.borrow().mutations
    }

    /// The container the map was loaded into.
    pub fn container(&self) -> Option<ContainerHandle> {
        self.record.borrow().container.clone()
    }

    /// Current data of a GeoJSON source.
    pub fn source(&self, source_id: &str) -> Option<FeatureCollection> {
        self.record.borrow().sources.get(source_id).cloned()
    }

    /// Ids of all layers, in id order.
    pub fn layer_ids(&self) -> Vec<String> {
        self.record.borrow().layers.keys().cloned().collect()
    }

    /// Whether a layer exists and is shown.
    pub fn layer_visible(&self, layer_id: &str) -> bool {
        let record = self.record.borrow();
        record.layers.contains_key(layer_id) && !record.hidden.contains(layer_id)
    }

    /// The last value set for a paint property.
    pub fn paint_property(&self, layer_id: &str, property: &str) -> Option<JsonValue> {
        let key = (layer_id.to_string(), property.to_string());
        self.record.borrow().paint.get(&key).cloned()
    }

    /// The animation time of a layer.
    pub fn layer_time(&self, layer_id: &str) -> Option<f64> {
        self.record.borrow().times.get(layer_id).copied()
    }

    /// The current shape markers.
    pub fn shape_markers(&self) -> Vec<DomMarker> {
        self.record.borrow().markers.clone()
    }

    /// The current cursor.
    pub fn cursor(&self) -> Cursor {
        self.record.borrow().cursor
    }

    /// The last camera animation.
    pub fn camera_move(&self) -> Option<CameraMove> {
        self.record.borrow().last_move
    }

    /// Moves the camera as if the user panned or zoomed.
    pub fn set_camera(&self, center: LngLat, zoom: f64) {
        self.record.borrow_mut().camera = Some((center, zoom));
    }

    /// Whether the map was removed.
    pub fn is_removed(&self) -> bool {
        self.record.borrow().removed
    }

    fn mutate(&self) -> std::cell::RefMut<'_, GlobalRecord> {
        let mut record = self.record.borrow_mut();
        record.mutations += 1;
        record
    }
}

impl GlobalSurface for HeadlessGlobalSurface {
    fn load(
        &mut self,
        container: &ContainerHandle,
        _config: &MapboxConfig,
        center: LngLat,
        zoom: f64,
    ) -> Result<(), MapError> {
        let mut record = self.mutate();
        record.container = Some(container.clone());
        record.camera = Some((center, zoom));
        Ok(())
    }

    fn set_source_data(&mut self, source_id: &str, data: FeatureCollection) {
        self.mutate().sources.insert(source_id.to_string(), data);
    }

    fn add_layer(&mut self, layer: LayerSpec) {
        let mut record = self.mutate();
        record.hidden.remove(&layer.id);
        record.layers.insert(layer.id.clone(), layer);
    }

    fn has_layer(&self, layer_id: &str) -> bool {
        self.record.borrow().layers.contains_key(layer_id)
    }

    fn remove_layer(&mut self, layer_id: &str) {
        let mut record = self.mutate();
        record.layers.remove(layer_id);
        record.times.remove(layer_id);
    }

    fn set_layer_visibility(&mut self, layer_id: &str, visible: bool) {
        let mut record = self.mutate();
        if visible {
            record.hidden.remove(layer_id);
        } else {
            record.hidden.insert(layer_id.to_string());
        }
    }

    fn set_paint_property(&mut self, layer_id: &str, property: &str, value: JsonValue) {
        self.mutate()
            .paint
            .insert((layer_id.to_string(), property.to_string()), value);
    }

    fn set_shape_markers(&mut self, markers: Vec<DomMarker>) {
        self.mutate().markers = markers;
    }

    fn set_cursor(&mut self, cursor: Cursor) {
        self.mutate().cursor = cursor;
    }

    fn camera(&self) -> Option<(LngLat, f64)> {
        let record = self.record.borrow();
        record.camera.filter(|_| !record.removed)
    }

    fn ease_to(&mut self, camera: CameraMove) {
        let mut record = self.mutate();
        if let Some((center, zoom)) = record.camera.as_mut() {
            *center = camera.center.unwrap_or(*center);
            *zoom = camera.zoom.unwrap_or(*zoom);
        }
        record.last_move = Some(camera);
    }

    fn set_layer_time(&mut self, layer_id: &str, time: f64) {
        self.mutate().times.insert(layer_id.to_string(), time);
    }

    fn create_grid(
        &mut self,
        source_id: &str,
        rings: &[Vec<LngLat>],
        cell_size_km: f64,
        _kind: GridKind,
    ) -> Result<usize, MapError> {
        // One cell per started cell size across the polygon's bounding box.
        let outer = rings.first().map(Vec::as_slice).unwrap_or_default();
        let (mut min, mut max) = (LngLat(f64::MAX, f64::MAX), LngLat(f64::MIN, f64::MIN));
        for p in outer {
            min = LngLat(min.0.min(p.0), min.1.min(p.1));
            max = LngLat(max.0.max(p.0), max.1.max(p.1));
        }
        let km_per_degree = 111.195;
        let columns = ((max.0 - min.0) * km_per_degree / cell_size_km).ceil().max(1.0);
        let rows = ((max.1 - min.1) * km_per_degree / cell_size_km).ceil().max(1.0);
        let cells = (columns * rows) as usize;

        self.mutate().sources.insert(
            source_id.to_string(),
            FeatureCollection {
                bbox: None,
                features: vec![geojson::Feature::default(); cells],
                foreign_members: None,
            },
        );
        Ok(cells)
    }

    fn merge_grid(&mut self, source_id: &str, target_id: &str) -> Result<usize, MapError> {
        let cells = self
            .record
            .borrow()
            .sources
            .get(source_id)
            .map(|fc| fc.features.len())
            .ok_or_else(|| MapError::InvalidArgument(format!("no grid source `{source_id}`")))?;
        // Busy and quiet cells form at most two zones.
        let zones = cells.min(2);
        self.mutate().sources.insert(
            target_id.to_string(),
            FeatureCollection {
                bbox: None,
                features: vec![geojson::Feature::default(); zones],
                foreign_members: None,
            },
        );
        Ok(zones)
    }

    fn remove(&mut self) {
        let mut record = self.mutate();
        record.removed = true;
        record.sources.clear();
        record.layers.clear();
        record.markers.clear();
    }
}

#[derive(Debug, Default)]
struct RegionalRecord {
    mutations: usize,
    container: Option<ContainerHandle>,
    camera: Option<(LatLng, u8)>,
    overlays: BTreeMap<OverlayId, Overlay>,
    next_overlay: u64,
    drawing: Option<ShapeKind>,
    drawn_removed: usize,
    heatmap: Option<HeatmapFrame>,
    heatmap_visible: bool,
    destroyed: bool,
}

/// A [`RegionalSurface`] recording overlays and heatmap frames, with an 800×600 container.
#[derive(Clone, Debug, Default)]
pub struct HeadlessRegionalSurface {
    record: Rc<RefCell<RegionalRecord>>,
}

impl HeadlessRegionalSurface {
    /// Creates an empty surface.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls that changed the map.
    pub fn mutations(&self) -> usize {
        self.record.borrow().mutations
    }

    /// The overlays on the map, in creation order.
    pub fn overlays(&self) -> Vec<Overlay> {
        self.record.borrow().overlays.values().cloned().collect()
    }

    /// The current native level.
    pub fn level(&self) -> Option<u8> {
        self.record.borrow().camera.map(|(_, level)| level)
    }

    /// Moves the camera as if the user panned or zoomed.
    pub fn set_camera(&self, center: LatLng, level: u8) {
        self.record.borrow_mut().camera = Some((center, level));
    }

    /// The armed drawing mode.
    pub fn selected_drawing(&self) -> Option<ShapeKind> {
        self.record.borrow().drawing
    }

    /// How many temporary drawing overlays were removed.
    pub fn drawn_removed(&self) -> usize {
        self.record.borrow().drawn_removed
    }

    /// The last heatmap frame.
    pub fn heatmap(&self) -> Option<HeatmapFrame> {
        self.record.borrow().heatmap.clone()
    }

    /// Whether the heatmap canvas is shown.
    pub fn heatmap_visible(&self) -> bool {
        self.record.borrow().heatmap_visible
    }

    /// Whether the map was torn down.
    pub fn is_destroyed(&self) -> bool {
        self.record.borrow().destroyed
    }

    fn mutate(&self) -> std::cell::RefMut<'_, RegionalRecord> {
        let mut record = self.record.borrow_mut();
        record.mutations += 1;
        record
    }
}

impl RegionalSurface for HeadlessRegionalSurface {
    fn load(
        &mut self,
        container: &ContainerHandle,
        _config: &KakaoConfig,
        center: LatLng,
        level: u8,
    ) -> Result<(), MapError> {
        let mut record = self.mutate();
        record.container = Some(container.clone());
        record.camera = Some((center, level));
        Ok(())
    }

    fn add_overlay(&mut self, overlay: Overlay) -> OverlayId {
        let mut record = self.mutate();
        record.next_overlay += 1;
        let id = OverlayId(record.next_overlay);
        record.overlays.insert(id, overlay);
        id
    }

    fn remove_overlay(&mut self, id: OverlayId) {
        self.mutate().overlays.remove(&id);
    }

    fn select_drawing(&mut self, kind: ShapeKind) {
        self.mutate().drawing = Some(kind);
    }

    fn cancel_drawing(&mut self) {
        self.mutate().drawing = None;
    }

    fn remove_drawn(&mut self) {
        self.mutate().drawn_removed += 1;
    }

    fn camera(&self) -> Option<(LatLng, u8)> {
        let record = self.record.borrow();
        record.camera.filter(|_| !record.destroyed)
    }

    fn container_size(&self) -> Vec2 {
        egui::vec2(800.0, 600.0)
    }

    fn set_heatmap(&mut self, frame: HeatmapFrame) {
        self.mutate().heatmap = Some(frame);
    }

    fn set_heatmap_visible(&mut self, visible: bool) {
        self.mutate().heatmap_visible = visible;
    }

    fn destroy(&mut self) {
        let mut record = self.mutate();
        record.destroyed = true;
        record.overlays.clear();
        record.drawing = None;
    }
}

/// Hands out headless surfaces and keeps a handle to each one it created.
///
/// An engine can be marked unavailable to mimic an SDK whose scripts failed to load.
#[derive(Clone, Debug)]
pub struct HeadlessProvider {
    /// Whether the global engine's SDK is loaded.
    pub mapbox_available: bool,
    /// Whether the regional engine's SDK is loaded.
    pub kakao_available: bool,
    mapbox: Vec<HeadlessGlobalSurface>,
    kakao: Vec<HeadlessRegionalSurface>,
}

impl Default for HeadlessProvider {
    fn default() -> Self {
        Self {
            mapbox_available: true,
            kakao_available: true,
            mapbox: Vec::new(),
            kakao: Vec::new(),
        }
    }
}

impl HeadlessProvider {
    /// A provider where both engines are available.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently created global surface.
    pub fn last_mapbox(&self) -> Option<HeadlessGlobalSurface> {
        self.mapbox.last().cloned()
    }

    /// The most recently created regional surface.
    pub fn last_kakao(&self) -> Option<HeadlessRegionalSurface> {
        self.kakao.last().cloned()
    }
}

impl SurfaceProvider for HeadlessProvider {
    fn mapbox_surface(&mut self) -> Result<Box<dyn GlobalSurface>, MapError> {
        if !self.mapbox_available {
            return Err(MapError::EngineUnavailable(
                EngineKind::Mapbox,
                "SDK not loaded".to_string(),
            ));
        }
        let surface = HeadlessGlobalSurface::new();
        self.mapbox.push(surface.clone());
        Ok(Box::new(surface))
    }

    fn kakao_surface(&mut self) -> Result<Box<dyn RegionalSurface>, MapError> {
        if !self.kakao_available {
            return Err(MapError::EngineUnavailable(
                EngineKind::Kakao,
                "SDK not loaded".to_string(),
            ));
        }
        let surface = HeadlessRegionalSurface::new();
        self.kakao.push(surface.clone());
        Ok(Box::new(surface))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_record() {
        let surface = HeadlessRegionalSurface::new();
        let mut handle: Box<dyn RegionalSurface> = Box::new(surface.clone());
        let id = handle.add_overlay(Overlay::LiveEntity {
            id: "car".to_string(),
            position: LatLng::new(1.0, 2.0),
        });
        assert_eq!(surface.overlays().len(), 1);
        handle.remove_overlay(id);
        assert!(surface.overlays().is_empty());
        assert_eq!(surface.mutations(), 2);
    }

    #[test]
    fn unavailable_engine_yields_no_surface() {
        let mut provider = HeadlessProvider::new();
        provider.kakao_available = false;
        assert!(matches!(
            provider.kakao_surface(),
            Err(MapError::EngineUnavailable(EngineKind::Kakao, _))
        ));
        assert!(provider.mapbox_surface().is_ok());
        assert!(provider.last_mapbox().is_some());
        assert!(provider.last_kakao().is_none());
    }

    #[test]
    fn grid_cells_cover_the_bounding_box() {
        let mut surface = HeadlessGlobalSurface::new();
        let ring = vec![
            LngLat(127.0, 37.5),
            LngLat(127.02, 37.5),
            LngLat(127.02, 37.51),
            LngLat(127.0, 37.5),
        ];
        let cells = surface
            .create_grid("grid-source", &[ring], 1.0, GridKind::Square)
            .unwrap();
        assert_eq!(cells, 6);
        assert_eq!(surface.merge_grid("grid-source", "merged").unwrap(), 2);
        assert!(surface.merge_grid("missing", "merged").is_err());
    }
}
