#![warn(missing_docs)]

//! One map state shown by interchangeable map engines and kept in sync with a native host.
//!
//! A [`coordinator::MapCoordinator`] owns the [`store::ShapeStore`], the single source of
//! truth for user drawn shapes, live vehicles, their path trails and the heatmap, and one
//! active [`engine::Engine`]. Engines can be swapped at runtime without losing data or the
//! camera position. Shapes are persisted through a [`bridge::HostBridge`].
//!
//! # Example
//!
//! ```
//! use multi_engine_map::EngineKind;
//! use multi_engine_map::config::CoordinatorConfig;
//! use multi_engine_map::coordinator::MapCoordinator;
//! use multi_engine_map::engine::EngineEvent;
//! use multi_engine_map::engine::headless::HeadlessProvider;
//!
//! let mut map = MapCoordinator::new(
//!     CoordinatorConfig::default(),
//!     Box::new(HeadlessProvider::new()),
//!     None,
//! );
//! map.initialize("map".into(), None).unwrap();
//! map.handle_engine_event(EngineEvent::Loaded);
//! assert_eq!(map.active_engine(), Some(EngineKind::Mapbox));
//!
//! map.update_live_entity("drone-1", 37.50, 127.00);
//! assert_eq!(map.store().snapshot().paths["drone-1"].len(), 1);
//! ```

/// Request/response plumbing to the native host.
pub mod bridge;

/// Configuration traits and types for engines and the coordinator.
pub mod config;

/// The component that owns the store and the active engine.
pub mod coordinator;

pub mod engine;

/// Engine independent geometry, longitude first.
pub mod geometry;

/// GeoJSON ingestion.
pub mod import;

/// Camera state and map projection.
pub mod projection;

/// Shapes, live entities, paths and the heatmap.
pub mod store;

/// Visual parameters.
pub mod style;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::geometry::GeometryError;

pub use crate::coordinator::{MapCoordinator, Notice};
pub use crate::geometry::{Geometry, LatLng, LngLat, ShapeKind};
pub use crate::store::{Shape, ShapeStore};

/// The interchangeable map engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Global vector basemap with fractional zoom.
    Mapbox,
    /// Regional raster basemap with integer levels.
    Kakao,
}

impl EngineKind {
    /// The lowercase name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Mapbox => "mapbox",
            EngineKind::Kakao => "kakao",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineKind {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mapbox" => Ok(EngineKind::Mapbox),
            "kakao" => Ok(EngineKind::Kakao),
            other => Err(MapError::UnknownValue(other.to_string())),
        }
    }
}

/// Errors that can occur while using the map.
#[derive(Error, Debug)]
pub enum MapError {
    /// Input that should have been JSON was not.
    #[error("Malformed JSON input")]
    MalformedJson(#[from] serde_json::Error),

    /// Input that should have been GeoJSON was not.
    #[error("Malformed GeoJSON input")]
    MalformedGeoJson(#[from] geojson::Error),

    /// GeoJSON input that is not a feature collection.
    #[error("GeoJSON input is not a FeatureCollection")]
    NotAFeatureCollection,

    /// Geometry that cannot be used.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(#[from] GeometryError),

    /// An argument outside the accepted range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine's SDK is not available.
    #[error("The {0} engine is unavailable: {1}")]
    EngineUnavailable(EngineKind, String),

    /// The active engine lacks an optional capability.
    #[error("The {engine} engine does not support {capability}")]
    Unsupported {
        /// The engine.
        engine: EngineKind,
        /// The missing capability.
        capability: &'static str,
    },

    /// The engine has not finished loading.
    #[error("The map engine is not ready")]
    NotReady,

    /// No engine is active.
    #[error("The map has not been initialized")]
    NotInitialized,

    /// Applying a GeoJSON key mapping without a preceding analysis.
    #[error("No GeoJSON import is waiting for a key")]
    NoPendingImport,

    /// An unknown enumeration value, such as an engine or layer name.
    #[error("Unknown value `{0}`")]
    UnknownValue(String),

    /// The host bridge failed.
    #[error("Host bridge error: {0}")]
    Bridge(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_kind_names() {
        assert_eq!("kakao".parse::<EngineKind>().unwrap(), EngineKind::Kakao);
        assert_eq!(EngineKind::Mapbox.to_string(), "mapbox");
        assert!(matches!(
            "leaflet".parse::<EngineKind>(),
            Err(MapError::UnknownValue(name)) if name == "leaflet"
        ));
        assert_eq!(
            serde_json::to_value(EngineKind::Kakao).unwrap(),
            serde_json::json!("kakao")
        );
    }

    #[test]
    fn unsupported_message_names_engine_and_capability() {
        let error = MapError::Unsupported {
            engine: EngineKind::Kakao,
            capability: "3D mode",
        };
        assert_eq!(
            error.to_string(),
            "The kakao engine does not support 3D mode"
        );
    }
}
