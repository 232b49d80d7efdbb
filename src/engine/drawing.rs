//! Drawing session state machine shared by the adapters: turns map clicks into
//! finished shape geometry and a preview of the shape under construction.

use crate::geometry::{BBox, Geometry, LngLat, ShapeKind, closed_ring};

/// The state of a [`DrawSession`].
#[derive(Clone, Debug, Default, PartialEq)]
pub enum DrawState {
    /// Not drawing.
    #[default]
    Idle,
    /// Waiting for the vertices of a `kind` shape.
    Collecting {
        /// What is being drawn.
        kind: ShapeKind,
        /// Vertices placed so far, longitude first.
        vertices: Vec<LngLat>,
    },
}

/// The vertices of a completed drawing gesture.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletedGesture {
    /// What was drawn.
    pub kind: ShapeKind,
    /// The clicked positions, in click order.
    pub vertices: Vec<LngLat>,
}

/// Click driven drawing: `Idle -> Collecting -> completed -> Idle`.
///
/// Markers complete on the first click, circles and rectangles on the second, polygons
/// on [`DrawSession::finish_polygon`] once they have three vertices. Starting a new
/// session or stopping drops whatever was collected.
#[derive(Clone, Debug, Default)]
pub struct DrawSession {
    state: DrawState,
}

impl DrawSession {
    /// Creates an idle session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts collecting a `kind` shape. Returns `true` if an unfinished gesture was dropped.
    pub fn start(&mut self, kind: ShapeKind) -> bool {
        let abandoned = self.has_vertices();
        self.state = DrawState::Collecting {
            kind,
            vertices: Vec::new(),
        };
        abandoned
    }

    /// Goes back to idle. Returns `true` if an unfinished gesture was dropped.
    pub fn stop(&mut self) -> bool {
        let abandoned = self.has_vertices();
        self.state = DrawState::Idle;
        abandoned
    }

    /// The kind being drawn, if any.
    pub fn active(&self) -> Option<ShapeKind> {
        match &self.state {
            DrawState::Idle => None,
            DrawState::Collecting { kind, .. } => Some(*kind),
        }
    }

    /// The current state.
    pub fn state(&self) -> &DrawState {
        &self.state
    }

    fn has_vertices(&self) -> bool {
        matches!(&self.state, DrawState::Collecting { vertices, .. } if !vertices.is_empty())
    }

    /// Places a vertex. Returns the gesture if this click completed it.
    pub fn click(&mut self, pos: LngLat) -> Option<CompletedGesture> {
        let DrawState::Collecting { kind, vertices } = &mut self.state else {
            return None;
        };
        vertices.push(pos);

        let complete = match kind {
            ShapeKind::Marker => true,
            ShapeKind::Circle | ShapeKind::Rectangle => vertices.len() == 2,
            ShapeKind::Polygon => false,
        };
        if complete { self.complete() } else { None }
    }

    /// Completes a polygon if it has at least three distinct vertices.
    pub fn finish_polygon(&mut self) -> Option<CompletedGesture> {
        let DrawState::Collecting {
            kind: ShapeKind::Polygon,
            vertices,
        } = &mut self.state
        else {
            return None;
        };
        // A double click also delivers two plain clicks on the same spot.
        vertices.dedup();
        if vertices.len() >= 3 {
            self.complete()
        } else {
            None
        }
    }

    fn complete(&mut self) -> Option<CompletedGesture> {
        match std::mem::take(&mut self.state) {
            DrawState::Collecting { kind, vertices } => Some(CompletedGesture { kind, vertices }),
            DrawState::Idle => None,
        }
    }

    /// The shape that would result if the gesture ended at `cursor`.
    pub fn preview(&self, cursor: LngLat) -> Option<Geometry> {
        let DrawState::Collecting { kind, vertices } = &self.state else {
            return None;
        };
        let first = *vertices.first()?;
        match kind {
            ShapeKind::Marker => None,
            ShapeKind::Circle => Some(Geometry::Circle {
                center: first,
                radius: crate::geometry::haversine_distance(first, cursor),
            }),
            ShapeKind::Rectangle => Some(Geometry::Rectangle {
                bbox: BBox::from_corners(first, cursor),
            }),
            ShapeKind::Polygon => {
                let mut ring = vertices.clone();
                ring.push(cursor);
                Some(Geometry::Polygon {
                    coordinates: closed_ring(&ring),
                })
            }
        }
    }
}
