//! Visual parameters of shapes, paths and the heatmap.

use egui::Color32;
use serde::{Deserialize, Serialize};

use crate::geometry::ShapeKind;

/// Serializes `egui::Color32` as `#RRGGBB`, or `#RRGGBBAA` when it is not opaque.
pub(crate) mod ser_color {
    use egui::Color32;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn to_hex(color: &Color32) -> String {
        let [r, g, b, a] = color.to_srgba_unmultiplied();
        if a == 255 {
            format!("#{r:02X}{g:02X}{b:02X}")
        } else {
            format!("#{r:02X}{g:02X}{b:02X}{a:02X}")
        }
    }

    pub fn from_hex(s: &str) -> Result<Color32, String> {
        let Some(s) = s.strip_prefix('#') else {
            return Err("hex color must start with '#'".to_string());
        };
        let channel = |i: usize| {
            s.get(i..i + 2)
                .ok_or_else(|| "invalid hex color".to_string())
                .and_then(|c| u8::from_str_radix(c, 16).map_err(|e| e.to_string()))
        };
        match s.len() {
            6 => Ok(Color32::from_rgb(channel(0)?, channel(2)?, channel(4)?)),
            8 => Ok(Color32::from_rgba_unmultiplied(
                channel(0)?,
                channel(2)?,
                channel(4)?,
                channel(6)?,
            )),
            _ => Err("invalid hex color length".to_string()),
        }
    }

    pub fn serialize<S>(color: &Color32, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_hex(color))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Color32, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Stroke and fill of circles, rectangles and polygons.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaStyle {
    /// Fill color.
    #[serde(with = "ser_color")]
    pub fill_color: Color32,
    /// Fill opacity, `0.0..=1.0`.
    pub fill_opacity: f64,
    /// Outline color.
    #[serde(with = "ser_color")]
    pub stroke_color: Color32,
    /// Outline width in pixels.
    pub stroke_width: f64,
}

/// Where a marker label sits relative to its icon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelPosition {
    /// Above the icon.
    Top,
    /// Below the icon.
    #[default]
    Bottom,
    /// Left of the icon.
    Left,
    /// Right of the icon.
    Right,
}

/// Icon and label placement of a marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerStyle {
    /// Icon reference (url or data uri). Empty means the engine default.
    pub icon: String,
    /// Label placement.
    #[serde(default)]
    pub label_position: LabelPosition,
}

/// Style of a shape: markers carry an icon, everything else a stroke and a fill.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Style {
    /// Marker style.
    Marker(MarkerStyle),
    /// Circle, rectangle and polygon style.
    Area(AreaStyle),
}

impl Style {
    /// The area style, if this is one.
    pub fn area(&self) -> Option<&AreaStyle> {
        match self {
            Style::Area(area) => Some(area),
            Style::Marker(_) => None,
        }
    }

    /// The marker style, if this is one.
    pub fn marker(&self) -> Option<&MarkerStyle> {
        match self {
            Style::Marker(marker) => Some(marker),
            Style::Area(_) => None,
        }
    }
}

/// Stroke of live entity path trails.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PathStyle {
    /// Line color.
    pub stroke_color: Color32,
    /// Line width in pixels.
    pub stroke_width: f64,
}

/// One stop of the heatmap color ramp.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradientStop {
    /// Normalized density, `0.0..=1.0`.
    pub density: f32,
    /// Color at that density.
    pub color: Color32,
}

/// Heatmap appearance shared by both engines.
#[derive(Clone, Debug, PartialEq)]
pub struct HeatmapStyle {
    /// Point radius in pixels.
    pub radius: f32,
    /// Weight that maps to full intensity.
    pub max_value: f64,
    /// Maximum layer opacity.
    pub opacity: f32,
    /// Color ramp.
    pub gradient: Vec<GradientStop>,
}

/// Default styles for every kind of drawable.
#[derive(Clone, Debug, PartialEq)]
pub struct StyleConfig {
    /// Polygon default.
    pub polygon: AreaStyle,
    /// Rectangle default.
    pub rectangle: AreaStyle,
    /// Circle default.
    pub circle: AreaStyle,
    /// Marker default.
    pub marker: MarkerStyle,
    /// Marker icon size in pixels.
    pub marker_icon_size: [f32; 2],
    /// Live entity path trails.
    pub path: PathStyle,
    /// Heatmap.
    pub heatmap: HeatmapStyle,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            polygon: AreaStyle {
                fill_color: Color32::from_rgb(0, 0, 255),
                fill_opacity: 0.4,
                stroke_color: Color32::from_rgb(0, 0, 255),
                stroke_width: 3.0,
            },
            rectangle: AreaStyle {
                fill_color: Color32::from_rgb(0, 255, 0),
                fill_opacity: 0.4,
                stroke_color: Color32::from_rgb(0, 255, 0),
                stroke_width: 3.0,
            },
            circle: AreaStyle {
                fill_color: Color32::from_rgb(255, 0, 0),
                fill_opacity: 0.3,
                stroke_color: Color32::from_rgb(255, 0, 0),
                stroke_width: 2.0,
            },
            marker: MarkerStyle {
                icon: String::new(),
                label_position: LabelPosition::Bottom,
            },
            marker_icon_size: [24.0, 24.0],
            path: PathStyle {
                stroke_color: Color32::from_rgb(255, 0, 0),
                stroke_width: 4.0,
            },
            heatmap: HeatmapStyle {
                radius: 15.0,
                max_value: 150.0,
                opacity: 0.8,
                gradient: vec![
                    GradientStop {
                        density: 0.0,
                        color: Color32::TRANSPARENT,
                    },
                    GradientStop {
                        density: 0.2,
                        color: Color32::from_rgb(0, 0, 255),
                    },
                    GradientStop {
                        density: 0.4,
                        color: Color32::from_rgb(0, 255, 255),
                    },
                    GradientStop {
                        density: 0.6,
                        color: Color32::from_rgb(0, 255, 0),
                    },
                    GradientStop {
                        density: 0.8,
                        color: Color32::from_rgb(255, 255, 0),
                    },
                    GradientStop {
                        density: 1.0,
                        color: Color32::from_rgb(255, 0, 0),
                    },
                ],
            },
        }
    }
}

impl StyleConfig {
    /// The style a new shape of `kind` gets when none is given.
    pub fn default_for(&self, kind: ShapeKind) -> Style {
        match kind {
            ShapeKind::Marker => Style::Marker(self.marker.clone()),
            ShapeKind::Circle => Style::Area(self.circle),
            ShapeKind::Rectangle => Style::Area(self.rectangle),
            ShapeKind::Polygon => Style::Area(self.polygon),
        }
    }

    /// The area style used for `kind` when a stored shape carries a marker style.
    pub(crate) fn area_for(&self, kind: ShapeKind) -> AreaStyle {
        match kind {
            ShapeKind::Circle => self.circle,
            ShapeKind::Rectangle => self.rectangle,
            ShapeKind::Polygon | ShapeKind::Marker => self.polygon,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hex_colors() {
        assert_eq!(ser_color::to_hex(&Color32::from_rgb(0, 0, 255)), "#0000FF");
        assert_eq!(
            ser_color::from_hex("#00ff00"),
            Ok(Color32::from_rgb(0, 255, 0))
        );
        assert_eq!(
            ser_color::from_hex("#ff000080").map(|c| c.to_srgba_unmultiplied()[3]),
            Ok(0x80)
        );
        assert!(ser_color::from_hex("0000FF").is_err());
        assert!(ser_color::from_hex("#00F").is_err());
        assert!(ser_color::from_hex("#GG0000").is_err());
    }

    #[test]
    fn area_style_wire_format() {
        let style = StyleConfig::default().default_for(ShapeKind::Circle);
        assert_eq!(
            serde_json::to_value(&style).unwrap(),
            json!({
                "fillColor": "#FF0000",
                "fillOpacity": 0.3,
                "strokeColor": "#FF0000",
                "strokeWidth": 2.0
            })
        );
    }

    #[test]
    fn untagged_style_picks_the_right_variant() {
        let marker: Style =
            serde_json::from_value(json!({"icon": "drone.png", "labelPosition": "top"})).unwrap();
        assert_eq!(
            marker.marker().map(|m| m.label_position),
            Some(LabelPosition::Top)
        );

        let area: Style = serde_json::from_value(json!({
            "fillColor": "#0000FF",
            "fillOpacity": 0.4,
            "strokeColor": "#0000FF",
            "strokeWidth": 3
        }))
        .unwrap();
        assert_eq!(area.area(), Some(&StyleConfig::default().polygon));
    }

    #[test]
    fn defaults_per_kind() {
        let styles = StyleConfig::default();
        assert!(styles.default_for(ShapeKind::Marker).marker().is_some());
        assert_eq!(
            styles.default_for(ShapeKind::Rectangle).area().map(|a| a.fill_color),
            Some(Color32::from_rgb(0, 255, 0))
        );
        assert_eq!(
            styles.default_for(ShapeKind::Polygon).area().map(|a| a.stroke_width),
            Some(3.0)
        );
    }
}
