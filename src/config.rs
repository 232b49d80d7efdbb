//! Configuration for the map engines and the coordinator.

use std::time::Duration;

use crate::EngineKind;
use crate::geometry::LatLng;
use crate::style::StyleConfig;

/// Seoul Station, the default camera center.
pub const DEFAULT_CENTER: LatLng = LatLng {
    lat: 37.5546,
    lng: 126.9706,
};

/// Default canonical zoom.
pub const DEFAULT_ZOOM: f64 = 14.0;

/// Configuration for a map engine provider.
pub trait EngineConfig {
    /// The engine this configuration belongs to.
    fn kind(&self) -> EngineKind;

    /// Returns the attribution text to be displayed on the map. If returns `None`, no attribution is shown.
    fn attribution(&self) -> Option<&String>;

    /// The default geographical center of the map.
    fn default_center(&self) -> LatLng;

    /// The default zoom of the map, in canonical zoom.
    fn default_zoom(&self) -> f64;
}

/// Configuration for the global vector basemap engine.
///
/// # Example
///
/// ```
/// use multi_engine_map::config::MapboxConfig;
/// let config = MapboxConfig::new("pk.my-token".to_string());
/// assert_eq!(config.access_token, "pk.my-token");
/// ```
#[derive(Clone, Debug)]
pub struct MapboxConfig {
    /// API access token.
    pub access_token: String,
    /// Style document url.
    pub style_url: String,
    attribution: String,
    default_center: LatLng,
    default_zoom: f64,
}

impl Default for MapboxConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            style_url: "mapbox://styles/mapbox/streets-v12".to_string(),
            attribution: "© Mapbox © OpenStreetMap".to_string(),
            default_center: DEFAULT_CENTER,
            default_zoom: DEFAULT_ZOOM,
        }
    }
}

impl MapboxConfig {
    /// Creates a new `MapboxConfig` with the given access token.
    pub fn new(access_token: String) -> Self {
        let mut config = Self::default();
        config.access_token = access_token;
        config
    }
}

impl EngineConfig for MapboxConfig {
    fn kind(&self) -> EngineKind {
        EngineKind::Mapbox
    }

    fn attribution(&self) -> Option<&String> {
        Some(&self.attribution)
    }

    fn default_center(&self) -> LatLng {
        self.default_center
    }

    fn default_zoom(&self) -> f64 {
        self.default_zoom
    }
}

/// Configuration for the regional raster basemap engine.
#[derive(Clone, Debug)]
pub struct KakaoConfig {
    /// JavaScript app key.
    pub app_key: String,
    attribution: String,
    default_center: LatLng,
    default_level: u8,
}

impl Default for KakaoConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            attribution: "© Kakao".to_string(),
            default_center: DEFAULT_CENTER,
            default_level: 3,
        }
    }
}

impl KakaoConfig {
    /// Creates a new `KakaoConfig` with the given app key.
    pub fn new(app_key: String) -> Self {
        let mut config = Self::default();
        config.app_key = app_key;
        config
    }

    /// The default native level.
    pub fn default_level(&self) -> u8 {
        self.default_level
    }
}

impl EngineConfig for KakaoConfig {
    fn kind(&self) -> EngineKind {
        EngineKind::Kakao
    }

    fn attribution(&self) -> Option<&String> {
        Some(&self.attribution)
    }

    fn default_center(&self) -> LatLng {
        self.default_center
    }

    fn default_zoom(&self) -> f64 {
        crate::projection::regional_level_to_zoom(self.default_level)
    }
}

/// Settings of the [`crate::coordinator::MapCoordinator`].
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Engine used by `initialize`.
    pub default_engine: EngineKind,
    /// Camera center when nothing else is known.
    pub default_center: LatLng,
    /// Canonical zoom when nothing else is known.
    pub default_zoom: f64,
    /// Delay before a failed save to the host is retried.
    pub sync_retry_delay: Duration,
    /// How long a host request may stay unanswered before it counts as failed.
    pub bridge_timeout: Duration,
    /// Default styles for new shapes.
    pub styles: StyleConfig,
    /// Global engine settings.
    pub mapbox: MapboxConfig,
    /// Regional engine settings.
    pub kakao: KakaoConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_engine: EngineKind::Mapbox,
            default_center: DEFAULT_CENTER,
            default_zoom: DEFAULT_ZOOM,
            sync_retry_delay: Duration::from_millis(500),
            bridge_timeout: Duration::from_secs(10),
            styles: StyleConfig::default(),
            mapbox: MapboxConfig::default(),
            kakao: KakaoConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapbox_config_new() {
        let config = MapboxConfig::new("test-token".to_string());
        assert_eq!(config.access_token, "test-token");
        assert_eq!(config.style_url, "mapbox://styles/mapbox/streets-v12");
        assert_eq!(config.kind(), EngineKind::Mapbox);
        assert_eq!(config.default_center(), DEFAULT_CENTER);
        assert_eq!(config.default_zoom(), 14.0);
    }

    #[test]
    fn kakao_config_default_zoom_is_canonical() {
        let config = KakaoConfig::new("app-key".to_string());
        assert_eq!(config.app_key, "app-key");
        assert_eq!(config.default_level(), 3);
        assert_eq!(config.default_zoom(), 15.0);
        assert_eq!(config.attribution().map(String::as_str), Some("© Kakao"));
    }

    #[test]
    fn coordinator_config_default() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.default_engine, EngineKind::Mapbox);
        assert_eq!(config.sync_retry_delay, Duration::from_millis(500));
        assert_eq!(config.default_zoom, DEFAULT_ZOOM);
        assert_eq!(config.bridge_timeout, Duration::from_secs(10));
        assert_eq!(config.kakao.default_level(), 3);
    }
}
