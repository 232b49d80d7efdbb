//! Simulated vehicle trips: payload parsing, constant speed retiming and the clock that
//! drives the trips animation.

use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::MapError;
use crate::geometry::LngLat;

/// Vehicle speed in degrees per time unit used to recompute trip timestamps.
pub const VEHICLE_SPEED: f64 = 0.0003;

/// Time added after the last trip ends before the animation loops.
pub const LOOP_PADDING: f64 = 150.0;

/// Time advanced per animation frame.
pub const TIME_STEP: f64 = 2.0;

/// Which layer shows the simulated trips.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SimLayerKind {
    /// Remove every simulation layer.
    #[default]
    None,
    /// Origin to destination arcs.
    Arc,
    /// Static driven paths.
    Path,
    /// Animated trips.
    Trips,
}

impl std::str::FromStr for SimLayerKind {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "None" => Ok(SimLayerKind::None),
            "ArcLayer" => Ok(SimLayerKind::Arc),
            "PathLayer" => Ok(SimLayerKind::Path),
            "TripsLayer" => Ok(SimLayerKind::Trips),
            other => Err(MapError::UnknownValue(other.to_string())),
        }
    }
}

/// One simulated vehicle trip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    /// Driven path, longitude first.
    #[serde(default)]
    pub path: Vec<LngLat>,
    /// Time at each path vertex. `null` entries read as NaN.
    #[serde(default, deserialize_with = "nullable_times")]
    pub timestamps: Vec<f64>,
    /// RGB(A) color.
    #[serde(default)]
    pub color: Vec<u8>,
}

fn nullable_times<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let times = Option::<Vec<Option<f64>>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(times.into_iter().map(|t| t.unwrap_or(f64::NAN)).collect())
}

/// What the map shows while the pointer rests on a vehicle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TripHover {
    /// Number of path vertices.
    pub nodes: usize,
    /// First path vertex.
    pub origin: LngLat,
    /// Last path vertex.
    pub destination: LngLat,
}

impl fmt::Display for TripHover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} nodes, from {:.4}, {:.4} to {:.4}, {:.4}",
            self.nodes,
            self.origin.lng(),
            self.origin.lat(),
            self.destination.lng(),
            self.destination.lat()
        )
    }
}

impl Trip {
    /// The hover readout of this trip, `None` for an empty path.
    pub fn hover_info(&self) -> Option<TripHover> {
        Some(TripHover {
            nodes: self.path.len(),
            origin: *self.path.first()?,
            destination: *self.path.last()?,
        })
    }
}

/// Origin and destination of a trip.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArcSegment {
    /// First path vertex.
    pub source: LngLat,
    /// Last path vertex.
    pub target: LngLat,
    /// Trip color.
    pub color: Vec<u8>,
}

/// One arc per trip with a non-empty path.
pub fn arcs(trips: &[Trip]) -> Vec<ArcSegment> {
    trips
        .iter()
        .filter_map(|trip| {
            Some(ArcSegment {
                source: *trip.path.first()?,
                target: *trip.path.last()?,
                color: trip.color.clone(),
            })
        })
        .collect()
}

/// Recomputes the timestamps of every trip with two or more vertices so the vehicle
/// moves at [`VEHICLE_SPEED`], starting at the trip's first timestamp (or zero).
pub fn retime(trips: &mut [Trip]) {
    for trip in trips.iter_mut().filter(|trip| trip.path.len() >= 2) {
        let mut time = trip.timestamps.first().copied().unwrap_or(0.0);
        let mut timestamps = Vec::with_capacity(trip.path.len());
        timestamps.push(time);
        for pair in trip.path.windows(2) {
            let (dx, dy) = (pair[1].0 - pair[0].0, pair[1].1 - pair[0].1);
            time += dx.hypot(dy) / VEHICLE_SPEED;
            timestamps.push(time);
        }
        trip.timestamps = timestamps;
    }
}

/// Drops trips without a path or with a timestamp that is not a number.
pub fn sanitize(trips: Vec<Trip>) -> Vec<Trip> {
    trips
        .into_iter()
        .filter(|trip| {
            let valid = !trip.path.is_empty() && trip.timestamps.iter().all(|t| t.is_finite());
            if !valid {
                warn!("Dropping trip with invalid timestamps: {:?}", trip.path.first());
            }
            valid
        })
        .collect()
}

/// The time at which the animation starts over.
pub fn loop_length(trips: &[Trip]) -> f64 {
    trips
        .iter()
        .filter_map(|trip| trip.timestamps.last().copied())
        .fold(0.0, f64::max)
        + LOOP_PADDING
}

/// The current time of the trips animation.
#[derive(Clone, Debug, PartialEq)]
pub struct TripsClock {
    time: f64,
    loop_length: f64,
    paused: bool,
}

impl TripsClock {
    /// A clock at time zero looping at `loop_length`.
    pub fn new(loop_length: f64, paused: bool) -> Self {
        Self {
            time: 0.0,
            loop_length,
            paused,
        }
    }

    /// Advances one frame and returns the new time.
    pub fn tick(&mut self) -> f64 {
        if !self.paused {
            self.time += TIME_STEP;
        }
        if self.time >= self.loop_length {
            self.time = 0.0;
        }
        self.time
    }

    /// Freezes or resumes the clock.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// The current time.
    pub fn time(&self) -> f64 {
        self.time
    }
}
