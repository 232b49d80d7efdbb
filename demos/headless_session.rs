#![allow(rustdoc::missing_crate_level_docs)] // it's a demo

use log::{error, info};
use multi_engine_map::bridge::{BridgeCall, ChannelBridge, HostEndpoint};
use multi_engine_map::config::CoordinatorConfig;
use multi_engine_map::engine::EngineEvent;
use multi_engine_map::engine::headless::HeadlessProvider;
use multi_engine_map::{EngineKind, LngLat, MapCoordinator, ShapeKind};
use serde_json::Value as JsonValue;
use std::time::Instant;

// Plays the native host: answers every request the map made since the last call.
fn serve(host: &HostEndpoint, saved: &mut Option<String>) {
    while let Some(request) = host.next_request() {
        let result = match request.call {
            BridgeCall::LoadShapes => saved.clone().map_or(JsonValue::Null, JsonValue::String),
            BridgeCall::SaveShapes { json } => {
                info!("Host stored {json}");
                *saved = Some(json);
                JsonValue::Null
            }
            BridgeCall::OnMarkerPositionSelected { lng, lat } => {
                info!("Host asked the user to label {lat:.5},{lng:.5}");
                JsonValue::Null
            }
            BridgeCall::ReportGeoJsonKeys { keys } => {
                info!("Host offers keys {keys:?}");
                JsonValue::Null
            }
        };
        if let Err(e) = host.reply(request.id, result) {
            error!("{e}");
        }
    }
}

fn main() -> Result<(), multi_engine_map::MapError> {
    env_logger::init();

    let (bridge, host) = ChannelBridge::new();
    let mut saved = None;
    let mut map = MapCoordinator::new(
        CoordinatorConfig::default(),
        Box::new(HeadlessProvider::new()),
        Some(Box::new(bridge)),
    );

    map.initialize("map".into(), None)?;
    map.handle_engine_event(EngineEvent::Loaded);

    // Draw a rectangle with two clicks.
    map.start_drawing(ShapeKind::Rectangle)?;
    map.handle_engine_event(EngineEvent::Click(LngLat(126.97, 37.56)));
    map.handle_engine_event(EngineEvent::Click(LngLat(126.99, 37.57)));

    // Place a marker; the host answers with a label.
    map.start_drawing(ShapeKind::Marker)?;
    map.handle_engine_event(EngineEvent::Click(LngLat(126.98, 37.566)));
    serve(&host, &mut saved);
    map.add_final_marker_with_label(37.566, 126.98, "City Hall");

    for step in 0..5 {
        let offset = f64::from(step) * 0.001;
        map.update_live_entity("bus-7", 37.55 + offset, 126.97 + offset);
    }
    map.draw_heatmap_json(r#"[{"lat": 37.56, "lng": 126.97}, {"lat": 37.57, "lng": 126.98, "weight": 80}]"#)?;

    serve(&host, &mut saved);
    map.poll(Instant::now());

    map.switch_engine(EngineKind::Kakao, None)?;
    map.handle_engine_event(EngineEvent::Loaded);
    let snapshot = map.snapshot();
    info!(
        "Now on {:?} with {} shapes, {} live entities and {} heatmap points",
        map.active_engine(),
        snapshot.shapes.len(),
        snapshot.live_entities.len(),
        snapshot.heatmap.len()
    );

    serve(&host, &mut saved);
    map.poll(Instant::now());
    println!("{}", saved.unwrap_or_default());
    Ok(())
}
