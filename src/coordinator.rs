//! The map coordinator: owner of the [`ShapeStore`], the active [`Engine`] and the
//! [`HostBridge`].
//!
//! Every mutation lands in the store first and is then redrawn by whichever engine is
//! active, so switching engines never loses data. Host calls are promises that are
//! checked in [`MapCoordinator::poll`], which the embedding event loop calls on every
//! frame.

use eyre::{WrapErr, eyre};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::{BridgeReply, BridgeResult, HostBridge};
use crate::config::CoordinatorConfig;
use crate::engine::simulation::{SimLayerKind, Trip, TripHover};
use crate::engine::{
    AdapterEvent, ContainerHandle, Engine, EngineAdapter, EngineEvent, GridKind,
    SurfaceProvider,
};
use crate::geometry::{Geometry, LatLng, LngLat, ShapeKind};
use crate::import::{Extrusion, GeoJsonImport};
use crate::projection::ViewState;
use crate::store::{HeatPoint, Properties, ShapeStore, Snapshot, restore_shapes};
use crate::{EngineKind, MapError};

/// Which kind of input failed to ingest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ingest {
    /// Heatmap samples.
    Heatmap,
    /// An imported GeoJSON file.
    GeoJson,
    /// Simulated trips.
    Simulation,
    /// The shape list restored from the host.
    SavedShapes,
}

/// A message for the user about input that could not be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    /// The input that was rejected.
    pub input: Ingest,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.input {
            Ingest::Heatmap => "heatmap data",
            Ingest::GeoJson => "the GeoJSON file",
            Ingest::Simulation => "simulation data",
            Ingest::SavedShapes => "the saved shapes",
        };
        write!(f, "Could not read {what}: {}", self.message)
    }
}

struct InFlight<T: Send + 'static> {
    promise: BridgeReply<T>,
    sent_at: Instant,
}

impl<T: Clone + Send + 'static> InFlight<T> {
    fn new(promise: BridgeReply<T>) -> Self {
        Self {
            promise,
            sent_at: Instant::now(),
        }
    }

    /// The outcome once the host answered or `timeout` passed.
    fn settle(&self, now: Instant, timeout: Duration) -> Option<BridgeResult<T>> {
        if let Some(result) = self.promise.ready() {
            return Some(result.clone());
        }
        if now.saturating_duration_since(self.sent_at) >= timeout {
            return Some(Err(Arc::new(eyre!(
                "no answer from the host within {timeout:?}"
            ))));
        }
        None
    }
}

/// Owns the store and the active engine and keeps the host in sync.
pub struct MapCoordinator {
    config: CoordinatorConfig,
    provider: Box<dyn SurfaceProvider>,
    bridge: Option<Box<dyn HostBridge>>,
    store: ShapeStore,
    engine: Option<Engine>,
    container: Option<ContainerHandle>,
    shapes_requested: bool,
    three_d: bool,
    pending_import: Option<GeoJsonImport>,
    extrusion: Option<Extrusion>,
    notices: Vec<Notice>,

    load_request: Option<InFlight<Option<String>>>,
    save_request: Option<InFlight<()>>,
    save_again: bool,
    retry_at: Option<Instant>,
    label_requests: Vec<(LngLat, InFlight<()>)>,
    key_reports: Vec<InFlight<()>>,
}

impl MapCoordinator {
    /// Creates a coordinator with an empty store and no engine.
    pub fn new(
        config: CoordinatorConfig,
        provider: Box<dyn SurfaceProvider>,
        bridge: Option<Box<dyn HostBridge>>,
    ) -> Self {
        Self {
            store: ShapeStore::new(config.styles.clone()),
            config,
            provider,
            bridge,
            engine: None,
            container: None,
            shapes_requested: false,
            three_d: false,
            pending_import: None,
            extrusion: None,
            notices: Vec::new(),
            load_request: None,
            save_request: None,
            save_again: false,
            retry_at: None,
            label_requests: Vec::new(),
            key_reports: Vec::new(),
        }
    }

    /// Brings up the default engine in `container`, centered on `center` if given.
    ///
    /// Saved shapes are requested from the host once the engine reports it is ready.
    pub fn initialize(
        &mut self,
        container: ContainerHandle,
        center: Option<LatLng>,
    ) -> Result<(), MapError> {
        info!("Initializing map in `{}`", container.0);
        self.container = Some(container);
        self.switch_engine(self.config.default_engine, center)
    }

    /// Replaces the active engine, carrying the camera over.
    ///
    /// The zoom is rounded to the nearest half step. If the new engine cannot be brought
    /// up the error is returned and no engine is active; the store is untouched either way.
    pub fn switch_engine(
        &mut self,
        kind: EngineKind,
        center: Option<LatLng>,
    ) -> Result<(), MapError> {
        let container = self.container.clone().ok_or(MapError::NotInitialized)?;

        let mut view = match &self.engine {
            Some(engine) => engine.view_state().rounded(),
            None => ViewState::new(self.config.default_center, self.config.default_zoom),
        };
        if let Some(center) = center {
            view.center = center;
        }

        if let Some(mut old) = self.engine.take() {
            debug!("Destroying {} engine", old.kind());
            old.destroy();
        }
        self.three_d = false;

        let mut engine = Engine::create(
            kind,
            self.provider.as_mut(),
            &self.config.mapbox,
            &self.config.kakao,
            &self.config.styles,
        )
        .inspect_err(|e| error!("Could not create the {kind} engine: {e}"))?;

        if let Err(e) = engine.initialize(&container, view) {
            error!("Could not initialize the {kind} engine: {e}");
            engine.destroy();
            return Err(e);
        }
        info!(
            "Switched to the {kind} engine at {:.5},{:.5} zoom {}",
            view.center.lat, view.center.lng, view.zoom
        );
        self.engine = Some(engine);
        Ok(())
    }

    /// Forwards a native event to the active engine and acts on its outcome.
    pub fn handle_engine_event(&mut self, event: EngineEvent) {
        let Some(engine) = self.engine.as_mut() else {
            debug!("Ignoring {event:?}, no engine is active");
            return;
        };
        match engine.handle_event(event) {
            Some(AdapterEvent::Ready) => self.on_ready(),
            Some(AdapterEvent::ShapeDrawn(geometry)) => self.on_shape_drawn(geometry),
            Some(AdapterEvent::Failed(reason)) => {
                error!("The {} engine failed to load: {reason}", engine.kind());
                if let Some(mut engine) = self.engine.take() {
                    engine.destroy();
                }
            }
            None => {}
        }
    }

    fn on_ready(&mut self) {
        if !self.shapes_requested {
            self.shapes_requested = true;
            self.load_from_host();
        }
        self.render();

        let (Some(engine), Some(extrusion)) = (self.engine.as_mut(), self.extrusion.as_ref())
        else {
            return;
        };
        match engine.render_extrusion(&extrusion.collection, &extrusion.key) {
            Ok(()) => debug!("Restored extrusion by `{}`", extrusion.key),
            Err(MapError::Unsupported { .. }) => {}
            Err(e) => warn!("Could not restore extrusion: {e}"),
        }
    }

    /// Stores a completed drawing gesture.
    ///
    /// With a host attached a marker is not stored right away; the host is asked for a
    /// label and answers with [`MapCoordinator::add_final_marker_with_label`].
    pub fn on_shape_drawn(&mut self, geometry: Geometry) {
        if let (Geometry::Marker { coordinates }, Some(bridge)) =
            (&geometry, self.bridge.as_mut())
        {
            debug!("Asking the host to label the marker at {coordinates:?}");
            let request = InFlight::new(bridge.marker_position_selected(*coordinates));
            self.label_requests.push((*coordinates, request));
            return;
        }
        self.add_shape(geometry, Properties::new());
    }

    /// Adds a labelled marker and persists it.
    pub fn add_final_marker_with_label(&mut self, lat: f64, lng: f64, text: &str) {
        let mut properties = Properties::new();
        properties.insert("name".to_string(), text.into());
        self.add_shape(
            Geometry::Marker {
                coordinates: LngLat(lng, lat),
            },
            properties,
        );
    }

    fn add_shape(&mut self, geometry: Geometry, properties: Properties) {
        let id = self.store.add_shape(geometry, properties, None).id.clone();
        info!("Added shape {id}");
        self.render();
        self.sync_to_host();
    }

    /// Moves a live entity and extends its path. Works with or without an engine.
    pub fn update_live_entity(&mut self, id: &str, lat: f64, lng: f64) {
        self.store.update_live_entity(id, lat, lng);
        self.render();
    }

    /// Replaces the heatmap.
    pub fn draw_heatmap(&mut self, points: Vec<HeatPoint>) {
        debug!("Drawing {} heatmap points", points.len());
        self.store.set_heatmap(points);
        self.render();
    }

    /// Replaces the heatmap from a JSON array of `{lat, lng, weight?}`.
    ///
    /// Malformed input leaves the heatmap unchanged and queues a [`Notice`].
    pub fn draw_heatmap_json(&mut self, json: &str) -> Result<(), MapError> {
        let points: Vec<HeatPoint> = serde_json::from_str(json)
            .map_err(MapError::from)
            .inspect_err(|e| self.notify(Ingest::Heatmap, e))?;
        self.draw_heatmap(points);
        Ok(())
    }

    /// Removes the heatmap.
    pub fn clear_heatmap(&mut self) {
        self.store.clear_heatmap();
        self.render();
    }

    /// Enters drawing mode on the active engine.
    pub fn start_drawing(&mut self, kind: ShapeKind) -> Result<(), MapError> {
        let engine = self.engine.as_mut().ok_or(MapError::NotInitialized)?;
        engine.start_drawing(kind);
        Ok(())
    }

    /// Leaves drawing mode. Does nothing without an engine.
    pub fn stop_drawing(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.stop_drawing();
        }
    }

    /// Parses a GeoJSON file and offers its point attribute keys to the host.
    ///
    /// The file is kept until [`MapCoordinator::apply_geojson_mapping`] is called; a new
    /// analysis replaces it.
    pub fn analyze_geojson(&mut self, json: &str) -> Result<Vec<String>, MapError> {
        let import = GeoJsonImport::analyze(json).inspect_err(|e| {
            self.notify(Ingest::GeoJson, e);
        })?;
        let keys = import.keys().to_vec();
        info!("GeoJSON file has {} point attribute keys", keys.len());

        if let Some(bridge) = self.bridge.as_mut() {
            self.key_reports
                .push(InFlight::new(bridge.report_geojson_keys(keys.clone())));
        }
        self.pending_import = Some(import);
        Ok(keys)
    }

    /// Adds the points of the analyzed file as markers named by `key`.
    ///
    /// Polygons are extruded on engines that can. Returns the number of markers added.
    pub fn apply_geojson_mapping(&mut self, key: &str) -> Result<usize, MapError> {
        let import = self
            .pending_import
            .take()
            .ok_or(MapError::NoPendingImport)?;
        let plan = import.apply(key);
        if plan.skipped > 0 {
            debug!("Skipped {} GeoJSON features", plan.skipped);
        }

        let added = plan.markers.len();
        for marker in plan.markers {
            self.store.add_shape(
                Geometry::Marker {
                    coordinates: marker.position,
                },
                marker.properties,
                None,
            );
        }

        if let Some(extrusion) = plan.extrusion {
            if let Some(engine) = self.engine.as_mut().filter(|e| e.is_ready()) {
                match engine.render_extrusion(&extrusion.collection, &extrusion.key) {
                    Ok(()) => {}
                    Err(MapError::Unsupported { .. }) => {
                        info!("Extrusion kept until an engine that supports it is active")
                    }
                    Err(e) => warn!("Could not extrude polygons: {e}"),
                }
            }
            self.extrusion = Some(extrusion);
        }

        info!("Imported {added} markers by `{key}`");
        self.render();
        if added > 0 {
            self.sync_to_host();
        }
        Ok(added)
    }

    /// Toggles 3D mode and returns the new state.
    pub fn toggle_3d(&mut self) -> Result<bool, MapError> {
        let engine = self.engine.as_mut().ok_or(MapError::NotInitialized)?;
        let enabled = !self.three_d;
        engine.set_3d_mode(enabled)?;
        self.three_d = enabled;
        Ok(enabled)
    }

    /// Shows simulated trips from JSON as the layer named `layer`.
    ///
    /// The layer name `None` or an empty string removes the simulation; `json` is not
    /// read in that case.
    pub fn show_simulation_flow(&mut self, json: &str, layer: &str) -> Result<(), MapError> {
        let layer: SimLayerKind = layer.parse()?;
        let trips: Vec<Trip> = if layer == SimLayerKind::None {
            Vec::new()
        } else {
            serde_json::from_str(json)
                .map_err(MapError::from)
                .inspect_err(|e| self.notify(Ingest::Simulation, e))?
        };
        let engine = self.engine.as_mut().ok_or(MapError::NotInitialized)?;
        engine.show_simulation_flow(trips, layer)
    }

    /// Pauses or resumes the trips animation.
    pub fn set_animation_pause(&mut self, paused: bool) -> Result<(), MapError> {
        let engine = self.engine.as_mut().ok_or(MapError::NotInitialized)?;
        engine.set_animation_paused(paused)
    }

    /// Node count and path ends of the animated trip at `index`, for a hover tooltip.
    pub fn trip_hover(&self, index: usize) -> Option<TripHover> {
        self.engine.as_ref()?.trip_hover(index)
    }

    /// Fills a polygon with grid cells. Returns the number of cells.
    pub fn create_grid_in_polygon(
        &mut self,
        rings: &[Vec<LngLat>],
        cell_size_km: f64,
        kind: GridKind,
    ) -> Result<usize, MapError> {
        let engine = self.engine.as_mut().ok_or(MapError::NotInitialized)?;
        engine.create_grid_in_polygon(rings, cell_size_km, kind)
    }

    /// Merges grid cells of `source_id` by demand level. Returns the number of zones.
    pub fn merge_grid_by_condition(&mut self, source_id: &str) -> Result<usize, MapError> {
        let engine = self.engine.as_mut().ok_or(MapError::NotInitialized)?;
        engine.merge_grid_by_condition(source_id)
    }

    /// Sends the whole shape list to the host.
    ///
    /// Only one save is in flight at a time; calls made meanwhile are folded into one
    /// follow-up save of the latest state. Failures are retried after
    /// [`CoordinatorConfig::sync_retry_delay`].
    pub fn sync_to_host(&mut self) {
        self.sync_at(Instant::now());
    }

    fn sync_at(&mut self, now: Instant) {
        if self.retry_at.is_some() {
            debug!("Save already scheduled");
            return;
        }
        if self.save_request.is_some() {
            self.save_again = true;
            return;
        }
        let Some(bridge) = self.bridge.as_mut() else {
            warn!(
                "No host bridge, retrying save in {:?}",
                self.config.sync_retry_delay
            );
            self.retry_at = Some(now + self.config.sync_retry_delay);
            return;
        };
        let json = match serde_json::to_string(self.store.shapes())
            .wrap_err("Could not serialize shapes for the host")
        {
            Ok(json) => json,
            Err(e) => {
                error!("{e:?}");
                return;
            }
        };
        debug!("Saving {} shapes", self.store.shapes().len());
        self.save_request = Some(InFlight::new(bridge.save_shapes(json)));
    }

    /// Requests the saved shape list from the host.
    ///
    /// A non-empty answer replaces the shapes in the store; nothing saved, or a failed
    /// request, leaves the store as it is.
    pub fn load_from_host(&mut self) {
        let Some(bridge) = self.bridge.as_mut() else {
            info!("No host bridge, starting without saved shapes");
            return;
        };
        self.load_request = Some(InFlight::new(bridge.load_shapes()));
    }

    fn apply_loaded_shapes(&mut self, json: &str) {
        let restored = match restore_shapes(json, self.store.styles()) {
            Ok(restored) => restored,
            Err(e) => {
                error!("Could not parse saved shapes: {e}");
                self.notify(Ingest::SavedShapes, &MapError::from(e));
                return;
            }
        };
        if restored.skipped > 0 {
            let e = MapError::InvalidArgument(format!(
                "{} saved shapes have unreadable geometry",
                restored.skipped
            ));
            self.notify(Ingest::SavedShapes, &e);
        }
        if restored.shapes.is_empty() {
            debug!("Host has no usable saved shapes");
            return;
        }
        info!("Restored {} shapes", restored.shapes.len());
        self.store.replace_shapes(restored.shapes);
        self.render();
    }

    /// Processes host answers, timeouts and due retries.
    pub fn poll(&mut self, now: Instant) {
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.poll();
        }
        let timeout = self.config.bridge_timeout;

        if let Some(result) = self
            .load_request
            .as_ref()
            .and_then(|request| request.settle(now, timeout))
        {
            self.load_request = None;
            match result {
                Ok(Some(json)) => self.apply_loaded_shapes(&json),
                Ok(None) => debug!("Host has no saved shapes"),
                Err(e) => warn!("Could not load shapes from the host: {e:?}"),
            }
        }

        if let Some(result) = self
            .save_request
            .as_ref()
            .and_then(|request| request.settle(now, timeout))
        {
            self.save_request = None;
            match result {
                Ok(()) => {
                    debug!("Shapes saved");
                    if std::mem::take(&mut self.save_again) {
                        self.sync_at(now);
                    }
                }
                Err(e) => {
                    warn!(
                        "Could not save shapes, retrying in {:?}: {e:?}",
                        self.config.sync_retry_delay
                    );
                    self.save_again = false;
                    self.retry_at = Some(now + self.config.sync_retry_delay);
                }
            }
        }

        let mut unlabelled = Vec::new();
        self.label_requests
            .retain(|(position, request)| match request.settle(now, timeout) {
                Some(Err(e)) => {
                    warn!("Host did not take the marker label: {e:?}");
                    unlabelled.push(*position);
                    false
                }
                Some(Ok(())) => false,
                None => true,
            });
        for coordinates in unlabelled {
            self.add_shape(Geometry::Marker { coordinates }, Properties::new());
        }

        self.key_reports
            .retain(|request| match request.settle(now, timeout) {
                Some(Err(e)) => {
                    warn!("Could not report GeoJSON keys: {e:?}");
                    false
                }
                Some(Ok(())) => false,
                None => true,
            });

        if self.retry_at.is_some_and(|at| now >= at) {
            self.retry_at = None;
            self.sync_at(now);
        }
    }

    /// Replaces the host bridge. Requests made through the old one are forgotten.
    ///
    /// A save that was waiting on the old bridge is sent again through the new one.
    pub fn set_bridge(&mut self, bridge: Option<Box<dyn HostBridge>>) {
        let resend = self.save_request.take().is_some() || self.save_again;
        self.load_request = None;
        self.save_again = false;
        self.label_requests.clear();
        self.key_reports.clear();
        self.bridge = bridge;
        if resend {
            self.retry_at = None;
            self.sync_to_host();
        }
    }

    /// Drains the queued notices.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn notify(&mut self, input: Ingest, error: &MapError) {
        warn!("Rejected {input:?} input: {error}");
        self.notices.push(Notice {
            input,
            message: error.to_string(),
        });
    }

    fn render(&mut self) {
        if let Some(engine) = self.engine.as_mut().filter(|e| e.is_ready()) {
            engine.render_all(&self.store.snapshot());
        }
    }

    /// Tears down the active engine. The store is kept.
    pub fn destroy(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.destroy();
        }
    }

    /// The store.
    pub fn store(&self) -> &ShapeStore {
        &self.store
    }

    /// A read-only view of the store.
    pub fn snapshot(&self) -> Snapshot<'_> {
        self.store.snapshot()
    }

    /// The kind of the active engine.
    pub fn active_engine(&self) -> Option<EngineKind> {
        self.engine.as_ref().map(Engine::kind)
    }

    /// The active engine.
    pub fn engine(&self) -> Option<&Engine> {
        self.engine.as_ref()
    }

    /// Whether the active engine finished loading.
    pub fn is_ready(&self) -> bool {
        self.engine.as_ref().is_some_and(Engine::is_ready)
    }

    /// Whether 3D mode is on.
    pub fn is_3d(&self) -> bool {
        self.three_d
    }

    /// Polygons kept for extrusion from the last import.
    pub fn extrusion(&self) -> Option<&Extrusion> {
        self.extrusion.as_ref()
    }
}

impl Drop for MapCoordinator {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeCall, ChannelBridge, HostEndpoint};
    use crate::engine::DrawEnd;
    use crate::engine::headless::HeadlessProvider;
    use crate::engine::kakao::RegionalSurface;
    use crate::engine::mapbox::{EXTRUSION_SOURCE, GlobalSurface, MASTER_SOURCE};
    use serde_json::{Value as JsonValue, json};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedProvider(Rc<RefCell<HeadlessProvider>>);

    impl SurfaceProvider for SharedProvider {
        fn mapbox_surface(&mut self) -> Result<Box<dyn GlobalSurface>, MapError> {
            self.0.borrow_mut().mapbox_surface()
        }

        fn kakao_surface(&mut self) -> Result<Box<dyn RegionalSurface>, MapError> {
            self.0.borrow_mut().kakao_surface()
        }
    }

    fn map_with(bridge: Option<Box<dyn HostBridge>>) -> (MapCoordinator, SharedProvider) {
        let _ = env_logger::builder().is_test(true).try_init();
        let provider = SharedProvider::default();
        let map = MapCoordinator::new(
            CoordinatorConfig::default(),
            Box::new(provider.clone()),
            bridge,
        );
        (map, provider)
    }

    fn ready_map(bridge: Option<Box<dyn HostBridge>>) -> (MapCoordinator, SharedProvider) {
        let (mut map, provider) = map_with(bridge);
        map.initialize("map".into(), None).unwrap();
        map.handle_engine_event(EngineEvent::Loaded);
        assert!(map.is_ready());
        (map, provider)
    }

    fn bridged_map() -> (MapCoordinator, SharedProvider, HostEndpoint) {
        let (bridge, host) = ChannelBridge::new();
        let (map, provider) = ready_map(Some(Box::new(bridge)));
        let load = host.next_request().unwrap();
        assert_eq!(load.call, BridgeCall::LoadShapes);
        host.reply(load.id, JsonValue::Null).unwrap();
        (map, provider, host)
    }

    fn saved_json(host: &HostEndpoint) -> JsonValue {
        match host.next_request().map(|r| r.call) {
            Some(BridgeCall::SaveShapes { json }) => serde_json::from_str(&json).unwrap(),
            other => panic!("expected a save, got {other:?}"),
        }
    }

    fn circle() -> Geometry {
        Geometry::Circle {
            center: LngLat(127.0, 37.5),
            radius: 500.0,
        }
    }

    #[test]
    fn live_entities_update_without_an_engine() {
        let (mut map, _) = map_with(None);
        map.update_live_entity("bus-7", 37.5, 127.0);
        map.update_live_entity("bus-7", 37.51, 127.01);

        let snapshot = map.snapshot();
        assert_eq!(snapshot.live_entities["bus-7"], LatLng::new(37.51, 127.01));
        assert_eq!(snapshot.paths["bus-7"].len(), 2);
        assert_eq!(map.active_engine(), None);
    }

    #[test]
    fn live_entities_update_before_the_engine_is_ready() {
        let (mut map, provider) = map_with(None);
        map.initialize("map".into(), None).unwrap();
        let surface = provider.0.borrow().last_mapbox().unwrap();
        let before = surface.mutations();

        map.update_live_entity("bus-7", 37.5, 127.0);
        assert_eq!(surface.mutations(), before);
        assert_eq!(map.store().snapshot().paths["bus-7"].len(), 1);
    }

    #[test]
    fn clearing_the_heatmap_empties_it() {
        let (mut map, _) = ready_map(None);
        map.draw_heatmap(vec![HeatPoint::new(37.5, 127.0), HeatPoint::new(37.6, 127.1)]);
        assert_eq!(map.snapshot().heatmap.len(), 2);
        map.clear_heatmap();
        assert!(map.snapshot().heatmap.is_empty());
    }

    #[test]
    fn malformed_heatmap_leaves_state_and_queues_a_notice() {
        let (mut map, _) = ready_map(None);
        map.draw_heatmap_json(r#"[{"lat": 37.5, "lng": 127.0}]"#)
            .unwrap();
        assert_eq!(map.snapshot().heatmap[0].weight, 50.0);

        assert!(map.draw_heatmap_json("[{").is_err());
        assert_eq!(map.snapshot().heatmap.len(), 1);
        let notices = map.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].input, Ingest::Heatmap);
        assert!(map.take_notices().is_empty());
    }

    #[test]
    fn drawn_circle_is_stored_rendered_and_saved() {
        let (mut map, provider, host) = bridged_map();
        map.start_drawing(ShapeKind::Circle).unwrap();
        map.handle_engine_event(EngineEvent::Click(LngLat(127.0, 37.5)));
        map.handle_engine_event(EngineEvent::Click(LngLat(127.0, 37.509)));

        assert_eq!(map.store().shapes().len(), 1);
        assert_eq!(map.store().shapes()[0].kind(), ShapeKind::Circle);
        let surface = provider.0.borrow().last_mapbox().unwrap();
        assert_eq!(surface.source(MASTER_SOURCE).unwrap().features.len(), 1);

        let saved = saved_json(&host);
        let records = saved.as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["type"], json!("circle"));
        assert_eq!(records[0]["geometry"]["center"], json!([127.0, 37.5]));
        assert!(records[0]["style"].is_object());
    }

    #[test]
    fn marker_waits_for_a_label_from_the_host() {
        let (mut map, _, host) = bridged_map();
        map.on_shape_drawn(Geometry::Marker {
            coordinates: LngLat(127.0, 37.5),
        });
        assert!(map.store().shapes().is_empty());
        assert_eq!(
            host.next_request().map(|r| r.call),
            Some(BridgeCall::OnMarkerPositionSelected {
                lng: 127.0,
                lat: 37.5
            })
        );

        map.add_final_marker_with_label(37.5, 127.0, "Depot");
        let shape = &map.store().shapes()[0];
        assert_eq!(shape.name(), Some("Depot"));
        assert_eq!(
            shape.geometry,
            Geometry::Marker {
                coordinates: LngLat(127.0, 37.5)
            }
        );
        assert_eq!(saved_json(&host)[0]["properties"]["name"], json!("Depot"));
    }

    #[test]
    fn marker_is_stored_unlabelled_when_the_host_refuses() {
        let (mut map, _, host) = bridged_map();
        map.on_shape_drawn(Geometry::Marker {
            coordinates: LngLat(127.0, 37.5),
        });
        let request = host.next_request().unwrap();
        host.fail(request.id, "dialog unavailable").unwrap();
        map.poll(Instant::now());

        assert_eq!(map.store().shapes().len(), 1);
        assert_eq!(map.store().shapes()[0].name(), None);
        assert_eq!(saved_json(&host).as_array().unwrap().len(), 1);
    }

    #[test]
    fn marker_without_a_host_is_stored_at_once() {
        let (mut map, _) = ready_map(None);
        map.on_shape_drawn(Geometry::Marker {
            coordinates: LngLat(127.0, 37.5),
        });
        assert_eq!(map.store().shapes().len(), 1);
    }

    #[test]
    fn failed_save_is_retried_after_the_delay() {
        let (mut map, _, host) = bridged_map();
        map.on_shape_drawn(circle());
        let save = host.next_request().unwrap();
        host.fail(save.id, "disk full").unwrap();

        let now = Instant::now();
        map.poll(now);
        assert!(host.next_request().is_none());
        map.poll(now + Duration::from_millis(499));
        assert!(host.next_request().is_none());
        map.poll(now + Duration::from_millis(500));
        assert_eq!(saved_json(&host).as_array().unwrap().len(), 1);
    }

    #[test]
    fn unanswered_save_times_out_and_is_retried() {
        let (mut map, _, host) = bridged_map();
        map.on_shape_drawn(circle());
        assert!(host.next_request().is_some());

        let late = Instant::now() + Duration::from_secs(11);
        map.poll(late);
        assert!(host.next_request().is_none());
        map.poll(late + Duration::from_millis(500));
        assert!(matches!(
            host.next_request().map(|r| r.call),
            Some(BridgeCall::SaveShapes { .. })
        ));
    }

    #[test]
    fn saves_made_while_one_is_in_flight_are_coalesced() {
        let (mut map, _, host) = bridged_map();
        map.on_shape_drawn(circle());
        let first = host.next_request().unwrap();
        map.on_shape_drawn(circle());
        map.on_shape_drawn(circle());
        assert!(host.next_request().is_none());

        host.reply(first.id, JsonValue::Null).unwrap();
        map.poll(Instant::now());
        assert_eq!(saved_json(&host).as_array().unwrap().len(), 3);
        assert!(host.next_request().is_none());
    }

    #[test]
    fn save_without_a_bridge_goes_out_once_one_is_set() {
        let (mut map, _) = ready_map(None);
        map.on_shape_drawn(circle());

        let (bridge, host) = ChannelBridge::new();
        map.set_bridge(Some(Box::new(bridge)));
        map.poll(Instant::now() + Duration::from_millis(500));
        assert_eq!(saved_json(&host).as_array().unwrap().len(), 1);
    }

    #[test]
    fn saved_shapes_are_restored_once() {
        let (bridge, host) = ChannelBridge::new();
        let (mut map, provider) = ready_map(Some(Box::new(bridge)));
        let load = host.next_request().unwrap();
        let saved = json!([{
            "id": "shape-1",
            "type": "marker",
            "geometry": {"coordinates": [127.0, 37.5]},
            "properties": {"name": "Depot"}
        }]);
        host.reply(load.id, JsonValue::String(saved.to_string()))
            .unwrap();
        map.poll(Instant::now());

        assert_eq!(map.store().shapes().len(), 1);
        assert_eq!(map.store().shapes()[0].id, "shape-1");
        let surface = provider.0.borrow().last_mapbox().unwrap();
        assert_eq!(surface.shape_markers().len(), 1);

        map.switch_engine(EngineKind::Kakao, None).unwrap();
        map.handle_engine_event(EngineEvent::Loaded);
        assert!(host.next_request().is_none());
        assert_eq!(map.store().shapes().len(), 1);
    }

    #[test]
    fn empty_or_malformed_saves_leave_the_store_alone() {
        let (bridge, host) = ChannelBridge::new();
        let (mut map, _) = ready_map(Some(Box::new(bridge)));
        map.store.add_shape(circle(), Properties::new(), None);
        let load = host.next_request().unwrap();
        host.reply(load.id, json!("[]")).unwrap();
        map.poll(Instant::now());
        assert_eq!(map.store().shapes().len(), 1);

        map.apply_loaded_shapes("{oops");
        assert_eq!(map.store().shapes().len(), 1);
        assert_eq!(map.take_notices()[0].input, Ingest::SavedShapes);
    }

    #[test]
    fn saved_shapes_with_bad_styles_are_all_restored() {
        let (bridge, host) = ChannelBridge::new();
        let (mut map, provider) = ready_map(Some(Box::new(bridge)));
        let load = host.next_request().unwrap();
        let saved = json!([
            {"id": "a", "type": "circle", "geometry": {"center": [127.0, 37.5], "radius": 300.0}, "style": {}},
            {"id": "b", "type": "rectangle", "geometry": {"bbox": [127.0, 37.5, 127.1, 37.6]},
             "style": {"fillColor": "red", "fillOpacity": 0.2, "strokeColor": "#FF0000", "strokeWidth": 2.0}},
            {"id": "c", "type": "circle", "geometry": {"center": [127.05, 37.55], "radius": 100.0}}
        ]);
        host.reply(load.id, JsonValue::String(saved.to_string()))
            .unwrap();
        map.poll(Instant::now());

        assert_eq!(map.store().shapes().len(), 3);
        assert!(map.take_notices().is_empty());
        let styles = map.store().styles().clone();
        assert_eq!(map.store().shapes()[1].style, styles.default_for(ShapeKind::Rectangle));
        let surface = provider.0.borrow().last_mapbox().unwrap();
        assert_eq!(surface.source(MASTER_SOURCE).unwrap().features.len(), 3);
    }

    #[test]
    fn saved_shapes_without_geometry_are_skipped_with_a_notice() {
        let (mut map, _) = ready_map(None);
        let saved = json!([
            {"id": "a", "type": "circle", "geometry": {"center": [127.0, 37.5], "radius": 300.0}},
            {"id": "b", "type": "polygon", "geometry": "nowhere"},
            {"id": "c", "type": "marker"}
        ]);
        map.apply_loaded_shapes(&saved.to_string());

        assert_eq!(map.store().shapes().len(), 1);
        assert_eq!(map.store().shapes()[0].id, "a");
        let notices = map.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].input, Ingest::SavedShapes);
        assert!(notices[0].message.contains('2'));
    }

    #[test]
    fn switching_engines_carries_the_camera() {
        let (mut map, provider) = ready_map(None);
        let global = provider.0.borrow().last_mapbox().unwrap();
        global.set_camera(LngLat(127.0, 37.5), 14.0);

        map.switch_engine(EngineKind::Kakao, None).unwrap();
        assert!(global.is_removed());
        let regional = provider.0.borrow().last_kakao().unwrap();
        let (center, level) = regional.camera().unwrap();
        assert_eq!(level, 4);
        assert_eq!(center, LatLng::new(37.5, 127.0));
        assert_eq!(map.active_engine(), Some(EngineKind::Kakao));

        map.switch_engine(EngineKind::Mapbox, None).unwrap();
        assert!(regional.is_destroyed());
        let global = provider.0.borrow().last_mapbox().unwrap();
        assert_eq!(global.camera().unwrap().1, 14.0);
    }

    #[test]
    fn fractional_zoom_is_rounded_to_half_steps() {
        let (mut map, provider) = ready_map(None);
        let global = provider.0.borrow().last_mapbox().unwrap();
        global.set_camera(LngLat(127.0, 37.5), 13.74);

        map.switch_engine(EngineKind::Kakao, None).unwrap();
        let regional = provider.0.borrow().last_kakao().unwrap();
        assert_eq!(regional.level(), Some(5));
        assert_eq!(map.engine().unwrap().view_state().zoom, 13.0);
    }

    #[test]
    fn forced_center_wins_over_the_current_view() {
        let (mut map, provider) = ready_map(None);
        map.switch_engine(EngineKind::Kakao, Some(LatLng::new(35.1, 129.0)))
            .unwrap();
        let regional = provider.0.borrow().last_kakao().unwrap();
        assert_eq!(regional.camera().unwrap().0, LatLng::new(35.1, 129.0));
    }

    #[test]
    fn store_survives_an_engine_switch() {
        let (mut map, provider) = ready_map(None);
        map.on_shape_drawn(circle());
        map.update_live_entity("bus-7", 37.5, 127.0);

        map.switch_engine(EngineKind::Kakao, None).unwrap();
        map.handle_engine_event(EngineEvent::Loaded);
        assert_eq!(map.store().shapes().len(), 1);
        let regional = provider.0.borrow().last_kakao().unwrap();
        assert!(!regional.overlays().is_empty());
    }

    #[test]
    fn unfinished_gestures_are_dropped_on_switch() {
        let (mut map, _) = ready_map(None);
        map.start_drawing(ShapeKind::Polygon).unwrap();
        map.handle_engine_event(EngineEvent::Click(LngLat(0.0, 0.0)));
        map.handle_engine_event(EngineEvent::Click(LngLat(1.0, 0.0)));

        map.switch_engine(EngineKind::Kakao, None).unwrap();
        map.handle_engine_event(EngineEvent::Loaded);
        map.handle_engine_event(EngineEvent::ContextMenu);
        assert!(map.store().shapes().is_empty());
        assert_eq!(map.engine().unwrap().drawing(), None);
    }

    #[test]
    fn stopping_drops_a_half_drawn_circle() {
        let (mut map, _, host) = bridged_map();
        map.start_drawing(ShapeKind::Circle).unwrap();
        map.handle_engine_event(EngineEvent::Click(LngLat(127.0, 37.5)));
        map.stop_drawing();
        map.handle_engine_event(EngineEvent::Click(LngLat(127.0, 37.509)));

        assert!(map.store().shapes().is_empty());
        assert!(host.next_request().is_none());
    }

    #[test]
    fn stopping_drops_a_half_drawn_polygon() {
        let (mut map, _, host) = bridged_map();
        map.start_drawing(ShapeKind::Polygon).unwrap();
        for p in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)] {
            map.handle_engine_event(EngineEvent::Click(LngLat::from(p)));
        }
        map.stop_drawing();
        map.handle_engine_event(EngineEvent::DoubleClick(LngLat(1.0, 1.0)));
        map.handle_engine_event(EngineEvent::ContextMenu);

        assert!(map.store().shapes().is_empty());
        assert_eq!(map.engine().unwrap().drawing(), None);
        assert!(host.next_request().is_none());
    }

    #[test]
    fn stopping_on_the_regional_engine_ignores_a_late_draw_end() {
        let (mut map, _) = ready_map(None);
        map.switch_engine(EngineKind::Kakao, None).unwrap();
        map.handle_engine_event(EngineEvent::Loaded);
        map.start_drawing(ShapeKind::Circle).unwrap();
        map.stop_drawing();
        map.handle_engine_event(EngineEvent::DrawEnd(DrawEnd::Circle {
            center: LatLng::new(37.5, 127.0),
            radius: 500.0,
        }));
        assert!(map.store().shapes().is_empty());
    }

    #[test]
    fn trip_hover_reads_the_animated_trips() {
        let (mut map, _) = ready_map(None);
        let trips = json!([{
            "path": [[127.0, 37.5], [127.003, 37.504], [127.006, 37.504]],
            "timestamps": [0.0],
            "color": [255, 0, 0]
        }]);
        map.show_simulation_flow(&trips.to_string(), "TripsLayer")
            .unwrap();
        let hover = map.trip_hover(0).unwrap();
        assert_eq!(hover.nodes, 3);
        assert_eq!(hover.destination, LngLat(127.006, 37.504));
        assert!(map.trip_hover(1).is_none());

        map.switch_engine(EngineKind::Kakao, None).unwrap();
        assert!(map.trip_hover(0).is_none());
    }

    #[test]
    fn unavailable_engine_leaves_no_engine_active() {
        let (mut map, provider) = ready_map(None);
        provider.0.borrow_mut().kakao_available = false;

        let result = map.switch_engine(EngineKind::Kakao, None);
        assert!(matches!(
            result,
            Err(MapError::EngineUnavailable(EngineKind::Kakao, _))
        ));
        assert_eq!(map.active_engine(), None);

        map.update_live_entity("bus-7", 37.5, 127.0);
        assert_eq!(map.store().snapshot().live_entities.len(), 1);

        map.switch_engine(EngineKind::Mapbox, None).unwrap();
        assert_eq!(map.active_engine(), Some(EngineKind::Mapbox));
    }

    #[test]
    fn load_failure_drops_the_engine() {
        let (mut map, _) = map_with(None);
        map.initialize("map".into(), None).unwrap();
        map.handle_engine_event(EngineEvent::LoadFailed("style 404".to_string()));
        assert_eq!(map.active_engine(), None);
    }

    #[test]
    fn switching_before_initialize_fails() {
        let (mut map, _) = map_with(None);
        assert!(matches!(
            map.switch_engine(EngineKind::Kakao, None),
            Err(MapError::NotInitialized)
        ));
    }

    #[test]
    fn optional_capabilities_report_unsupported_engines() {
        let (mut map, _) = ready_map(None);
        assert!(map.toggle_3d().unwrap());
        assert!(map.is_3d());

        map.switch_engine(EngineKind::Kakao, None).unwrap();
        map.handle_engine_event(EngineEvent::Loaded);
        assert!(!map.is_3d());
        assert!(matches!(
            map.toggle_3d(),
            Err(MapError::Unsupported {
                engine: EngineKind::Kakao,
                ..
            })
        ));
        assert!(matches!(
            map.merge_grid_by_condition("grid-source"),
            Err(MapError::Unsupported { .. })
        ));
        assert!(!map.is_3d());
    }

    #[test]
    fn simulation_layer_names_are_checked() {
        let (mut map, _) = ready_map(None);
        assert!(matches!(
            map.show_simulation_flow("[]", "HexagonLayer"),
            Err(MapError::UnknownValue(_))
        ));
        let trips = json!([{
            "path": [[127.0, 37.5], [127.01, 37.51]],
            "timestamps": [0.0, 10.0],
            "color": [255, 0, 0]
        }]);
        map.show_simulation_flow(&trips.to_string(), "TripsLayer")
            .unwrap();
        map.set_animation_pause(true).unwrap();
        map.show_simulation_flow("not read", "None").unwrap();

        assert!(map.show_simulation_flow("{", "PathLayer").is_err());
        assert_eq!(map.take_notices()[0].input, Ingest::Simulation);
    }

    #[test]
    fn geojson_import_reports_keys_and_adds_markers() {
        let (mut map, provider, host) = bridged_map();
        let file = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [127.0, 37.5]},
                    "properties": {"title": "Depot"}
                },
                {
                    "type": "Feature",
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[126.9, 37.4], [127.0, 37.4], [127.0, 37.5], [126.9, 37.4]]]
                    },
                    "properties": {"population": 120000}
                }
            ]
        })
        .to_string();

        assert_eq!(map.analyze_geojson(&file).unwrap(), ["title"]);
        assert_eq!(
            host.next_request().map(|r| r.call),
            Some(BridgeCall::ReportGeoJsonKeys {
                keys: vec!["title".to_string()]
            })
        );

        assert_eq!(map.apply_geojson_mapping("title").unwrap(), 1);
        assert_eq!(map.store().shapes()[0].name(), Some("Depot"));
        assert!(map.extrusion().is_some());
        let global = provider.0.borrow().last_mapbox().unwrap();
        assert!(global.source(EXTRUSION_SOURCE).is_some());
        assert_eq!(saved_json(&host).as_array().unwrap().len(), 1);

        assert!(matches!(
            map.apply_geojson_mapping("title"),
            Err(MapError::NoPendingImport)
        ));
    }

    #[test]
    fn extrusion_is_restored_on_a_supporting_engine() {
        let (mut map, provider) = ready_map(None);
        map.switch_engine(EngineKind::Kakao, None).unwrap();
        map.handle_engine_event(EngineEvent::Loaded);

        let file = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[126.9, 37.4], [127.0, 37.4], [127.0, 37.5], [126.9, 37.4]]]
                },
                "properties": {"population": 120000}
            }]
        })
        .to_string();
        map.analyze_geojson(&file).unwrap();
        assert_eq!(map.apply_geojson_mapping("population").unwrap(), 0);

        map.switch_engine(EngineKind::Mapbox, None).unwrap();
        map.handle_engine_event(EngineEvent::Loaded);
        let global = provider.0.borrow().last_mapbox().unwrap();
        assert_eq!(global.source(EXTRUSION_SOURCE).unwrap().features.len(), 1);
    }

    #[test]
    fn bad_geojson_queues_a_notice() {
        let (mut map, _) = ready_map(None);
        assert!(map.analyze_geojson("{\"type\": \"Point\"").is_err());
        assert_eq!(map.take_notices()[0].input, Ingest::GeoJson);
        assert!(matches!(
            map.apply_geojson_mapping("name"),
            Err(MapError::NoPendingImport)
        ));
    }

    #[test]
    fn notice_text_names_the_input() {
        let notice = Notice {
            input: Ingest::Heatmap,
            message: "Malformed JSON input".to_string(),
        };
        assert_eq!(
            notice.to_string(),
            "Could not read heatmap data: Malformed JSON input"
        );
    }
}
