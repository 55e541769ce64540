//! Drawing state machine: turns a sequence of pointer events into a
//! finished [`Annotation`].
//!
//! One ephemeral state per `(session, user)` key, created on start, mutated
//! on continue, consumed on finish or cancel. Lifecycle violations raise
//! before any state changes; the state is removed on finish regardless of
//! whether geometry validation succeeds.

use kurbo::Point;
use serde::Deserialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::f64::consts::PI;
use uuid::Uuid;

use crate::annotation::{
    Annotation, AnnotationKind, AnnotationMetadata, AnnotationStyle, Measurements,
};
use crate::error::{CollabError, CollabResult};
use crate::operation::now_ms;
use crate::sanitize::{clamp_stroke_width, sanitize_color};

/// A drawing tool available to clients.
#[derive(Debug, Clone, Copy)]
pub struct Tool {
    pub id: &'static str,
    /// Annotation shape the tool produces.
    pub kind: AnnotationKind,
    /// Close the path and report enclosed area on finish.
    pub closed: bool,
    pub default_color: &'static str,
    pub default_stroke_width: f64,
    pub default_fill: Option<&'static str>,
}

/// Static registry of known tools; drawing may only start with one of these.
pub const TOOL_REGISTRY: &[Tool] = &[
    Tool {
        id: "circle",
        kind: AnnotationKind::Circle,
        closed: false,
        default_color: "#d32f2f",
        default_stroke_width: 2.0,
        default_fill: None,
    },
    Tool {
        id: "rectangle",
        kind: AnnotationKind::Rectangle,
        closed: false,
        default_color: "#d32f2f",
        default_stroke_width: 2.0,
        default_fill: None,
    },
    Tool {
        id: "arrow",
        kind: AnnotationKind::Arrow,
        closed: false,
        default_color: "#1565c0",
        default_stroke_width: 2.0,
        default_fill: None,
    },
    // A ruler is an arrow that exists for its length measurement.
    Tool {
        id: "ruler",
        kind: AnnotationKind::Arrow,
        closed: false,
        default_color: "#6a1b9a",
        default_stroke_width: 1.0,
        default_fill: None,
    },
    Tool {
        id: "freehand",
        kind: AnnotationKind::Freehand,
        closed: false,
        default_color: "#2e7d32",
        default_stroke_width: 3.0,
        default_fill: None,
    },
    Tool {
        id: "polygon",
        kind: AnnotationKind::Freehand,
        closed: true,
        default_color: "#2e7d32",
        default_stroke_width: 2.0,
        default_fill: Some("#2e7d3233"),
    },
    Tool {
        id: "text",
        kind: AnnotationKind::Text,
        closed: false,
        default_color: "#000000",
        default_stroke_width: 1.0,
        default_fill: None,
    },
];

/// Look up a tool by id.
pub fn find_tool(id: &str) -> Option<&'static Tool> {
    TOOL_REGISTRY.iter().find(|t| t.id == id)
}

/// Effective settings for an in-flight drawing.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawingSettings {
    pub style: AnnotationStyle,
    /// Measurement unit reported on the finished annotation.
    pub unit: String,
}

/// Caller overrides merged over a tool's defaults at start.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DrawingOverrides {
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub stroke_width: Option<f64>,
    #[serde(default)]
    pub fill_color: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Ephemeral tool state for one user in one session.
#[derive(Debug, Clone)]
pub struct DrawingState {
    pub tool_id: String,
    pub image_id: String,
    pub layer_id: Option<String>,
    pub is_drawing: bool,
    pub current_path: Vec<Point>,
    pub start_point: Point,
    pub end_point: Option<Point>,
    pub settings: DrawingSettings,
    pub started_at: u64,
}

/// Owns every in-flight drawing, keyed by `(session_id, user_id)`.
#[derive(Debug, Default)]
pub struct DrawingStateMachine {
    states: HashMap<(String, String), DrawingState>,
}

impl DrawingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(session_id: &str, user_id: &str) -> (String, String) {
        (session_id.to_string(), user_id.to_string())
    }

    /// Begin a drawing. The tool must exist in the registry; an in-flight
    /// drawing for the same key is discarded and replaced.
    pub fn start(
        &mut self,
        session_id: &str,
        user_id: &str,
        tool_id: &str,
        image_id: &str,
        layer_id: Option<String>,
        start: Point,
        overrides: DrawingOverrides,
    ) -> CollabResult<&DrawingState> {
        let tool = find_tool(tool_id).ok_or_else(|| CollabError::not_found("tool", tool_id))?;

        let style = AnnotationStyle {
            color: sanitize_color(overrides.color.as_deref().unwrap_or(tool.default_color)),
            stroke_width: clamp_stroke_width(
                overrides.stroke_width.unwrap_or(tool.default_stroke_width),
            ),
            fill_color: overrides
                .fill_color
                .as_deref()
                .or(tool.default_fill)
                .map(sanitize_color),
        };

        let state = DrawingState {
            tool_id: tool.id.to_string(),
            image_id: image_id.to_string(),
            layer_id,
            is_drawing: true,
            current_path: vec![start],
            start_point: start,
            end_point: None,
            settings: DrawingSettings {
                style,
                unit: overrides.unit.unwrap_or_else(|| "px".to_string()),
            },
            started_at: now_ms(),
        };
        let slot = match self.states.entry(Self::key(session_id, user_id)) {
            Entry::Occupied(mut occupied) => {
                log::warn!(
                    "user {user_id} restarted drawing in session {session_id}, discarding draft"
                );
                occupied.insert(state);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(state),
        };
        Ok(slot)
    }

    /// Append a point to an in-flight drawing.
    pub fn append(&mut self, session_id: &str, user_id: &str, point: Point) -> CollabResult<&DrawingState> {
        let state = self
            .states
            .get_mut(&Self::key(session_id, user_id))
            .ok_or_else(|| {
                CollabError::InvalidState(format!(
                    "continue-drawing without start for user {user_id} in session {session_id}"
                ))
            })?;
        state.current_path.push(point);
        Ok(state)
    }

    /// Finish a drawing, producing the annotation draft.
    ///
    /// The state is consumed even when geometry validation fails.
    pub fn finish(
        &mut self,
        session_id: &str,
        user_id: &str,
        end: Option<Point>,
        text: Option<String>,
    ) -> CollabResult<Annotation> {
        let mut state = self
            .states
            .remove(&Self::key(session_id, user_id))
            .ok_or_else(|| {
                CollabError::InvalidState(format!(
                    "finish-drawing without start for user {user_id} in session {session_id}"
                ))
            })?;
        if let Some(end) = end {
            state.current_path.push(end);
            state.end_point = Some(end);
        }
        build_annotation(state, user_id, text)
    }

    /// Discard an in-flight drawing without producing an operation.
    pub fn cancel(&mut self, session_id: &str, user_id: &str) -> CollabResult<()> {
        self.states
            .remove(&Self::key(session_id, user_id))
            .map(|_| ())
            .ok_or_else(|| {
                CollabError::InvalidState(format!(
                    "cancel-drawing without start for user {user_id} in session {session_id}"
                ))
            })
    }

    pub fn is_drawing(&self, session_id: &str, user_id: &str) -> bool {
        self.states.contains_key(&Self::key(session_id, user_id))
    }

    /// Drop every in-flight drawing belonging to a session.
    pub fn drop_session(&mut self, session_id: &str) {
        self.states.retain(|(sid, _), _| sid != session_id);
    }
}

/// Compute the concrete annotation geometry for a consumed drawing state.
fn build_annotation(
    state: DrawingState,
    user_id: &str,
    text: Option<String>,
) -> CollabResult<Annotation> {
    let tool = find_tool(&state.tool_id)
        .ok_or_else(|| CollabError::not_found("tool", state.tool_id.clone()))?;
    let start = state.start_point;
    let end = state
        .end_point
        .or_else(|| state.current_path.last().copied())
        .unwrap_or(start);

    let (coordinates, measurements) = match tool.kind {
        AnnotationKind::Circle => {
            let radius = start.distance(end);
            (
                vec![start.x, start.y, radius],
                Some(Measurements {
                    area: Some(PI * radius * radius),
                    perimeter: Some(2.0 * PI * radius),
                    length: None,
                    unit: state.settings.unit.clone(),
                }),
            )
        }
        AnnotationKind::Rectangle => {
            let width = (end.x - start.x).abs();
            let height = (end.y - start.y).abs();
            (
                vec![start.x.min(end.x), start.y.min(end.y), width, height],
                Some(Measurements {
                    area: Some(width * height),
                    perimeter: Some(2.0 * (width + height)),
                    length: None,
                    unit: state.settings.unit.clone(),
                }),
            )
        }
        AnnotationKind::Arrow => {
            let length = start.distance(end);
            (
                vec![start.x, start.y, end.x, end.y],
                Some(Measurements {
                    length: Some(length),
                    area: None,
                    perimeter: None,
                    unit: state.settings.unit.clone(),
                }),
            )
        }
        AnnotationKind::Text => (vec![start.x, start.y], None),
        AnnotationKind::Freehand => {
            let path = &state.current_path;
            if path.len() < 2 {
                return Err(CollabError::Validation(
                    "freehand drawing requires at least two points".into(),
                ));
            }
            let area = if tool.closed && path.len() >= 3 {
                Some(shoelace_area(path))
            } else {
                None
            };
            (
                path.iter().flat_map(|p| [p.x, p.y]).collect(),
                Some(Measurements {
                    length: Some(polyline_length(path, tool.closed)),
                    area,
                    perimeter: None,
                    unit: state.settings.unit.clone(),
                }),
            )
        }
    };

    if tool.kind == AnnotationKind::Text
        && text.as_deref().map(str::trim).unwrap_or("").is_empty()
    {
        return Err(CollabError::Validation(
            "text annotation requires non-empty text".into(),
        ));
    }

    Ok(Annotation {
        id: Uuid::new_v4(),
        kind: tool.kind,
        coordinates,
        style: state.settings.style,
        text,
        measurements,
        metadata: AnnotationMetadata {
            created_by: user_id.to_string(),
            created_at: now_ms(),
            image_id: state.image_id,
            layer_id: state.layer_id,
            version: 1,
        },
    })
}

/// Total length of a polyline, optionally closing the loop.
fn polyline_length(points: &[Point], closed: bool) -> f64 {
    let mut length: f64 = points.windows(2).map(|w| w[0].distance(w[1])).sum();
    if closed && points.len() >= 3 {
        length += points[points.len() - 1].distance(points[0]);
    }
    length
}

/// Enclosed polygon area via the shoelace formula.
fn shoelace_area(points: &[Point]) -> f64 {
    let n = points.len();
    let mut doubled = 0.0;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        doubled += a.x * b.y - b.x * a.y;
    }
    doubled.abs() / 2.0
}
