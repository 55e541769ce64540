//! Ingress sanitation and validation.
//!
//! Raw client payloads are cleaned, bounded, and converted into typed
//! [`Operation`]s exactly once, here. Everything past this boundary deals in
//! closed types. Validation failures abort processing for the offending
//! operation before any state is touched.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::annotation::{AnnotationKind, AnnotationStyle, AnnotationUpdate, Measurements};
use crate::error::{CollabError, CollabResult};
use crate::operation::{AnnotatePayload, Operation, OperationKind, now_ms};

/// Coordinates are clamped into `[0, COORD_MAX]`.
pub const COORD_MAX: f64 = 10_000.0;
/// Free text is capped at this many characters.
pub const MAX_TEXT_LEN: usize = 500;
/// Stroke width bounds in pixels.
pub const STROKE_WIDTH_MIN: f64 = 1.0;
pub const STROKE_WIDTH_MAX: f64 = 20.0;

const NAMED_COLORS: &[&str] = &[
    "black", "white", "red", "green", "blue", "yellow", "orange", "purple", "brown", "gray",
];

fn script_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<script\b[^>]*/?>").unwrap())
}

fn js_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)javascript\s*:").unwrap())
}

fn event_handler_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\bon\w+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap())
}

fn hex_color_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{6}|[0-9a-fA-F]{8})$").unwrap())
}

/// Strip script tags, `javascript:` URLs, and inline event handlers, then
/// cap the result at [`MAX_TEXT_LEN`] characters.
pub fn scrub_text(input: &str) -> String {
    let cleaned = script_tag_re().replace_all(input, "");
    let cleaned = js_url_re().replace_all(&cleaned, "");
    let cleaned = event_handler_re().replace_all(&cleaned, "");
    cleaned.chars().take(MAX_TEXT_LEN).collect()
}

/// Clamp a coordinate into the workspace bounds; non-finite values become 0.
pub fn clamp_coordinate(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, COORD_MAX)
}

/// Convert a raw JSON coordinate list into bounded floats.
/// Non-numeric entries become 0.
pub fn sanitize_coordinates(raw: &[Value]) -> Vec<f64> {
    raw.iter()
        .map(|v| clamp_coordinate(v.as_f64().unwrap_or(0.0)))
        .collect()
}

/// Validate a color string against hex or the named-color set, falling back
/// to black.
pub fn sanitize_color(color: &str) -> String {
    let trimmed = color.trim();
    if hex_color_re().is_match(trimmed) {
        return trimmed.to_string();
    }
    let lower = trimmed.to_ascii_lowercase();
    if NAMED_COLORS.contains(&lower.as_str()) {
        return lower;
    }
    "#000000".to_string()
}

/// Clamp stroke width into `[1, 20]`; non-finite widths take the default.
pub fn clamp_stroke_width(width: f64) -> f64 {
    if !width.is_finite() {
        return 2.0;
    }
    width.clamp(STROKE_WIDTH_MIN, STROKE_WIDTH_MAX)
}

/// Structural validation per shape. Coordinate counts below the shape's
/// minimum, or text annotations without text, are rejected.
pub fn validate_shape(
    kind: AnnotationKind,
    coordinates: &[f64],
    text: Option<&str>,
) -> CollabResult<()> {
    let min = kind.min_coordinates();
    if coordinates.len() < min {
        return Err(CollabError::Validation(format!(
            "{} requires at least {} coordinate values, got {}",
            kind.as_str(),
            min,
            coordinates.len()
        )));
    }
    if kind == AnnotationKind::Text && text.map(str::trim).unwrap_or("").is_empty() {
        return Err(CollabError::Validation(
            "text annotation requires non-empty text".into(),
        ));
    }
    Ok(())
}

/// Loosely-typed operation payload as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOperation {
    #[serde(rename = "type", default)]
    pub op_type: Option<String>,
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub position: Option<f64>,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub annotation_id: Option<Uuid>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub annotation_type: Option<String>,
    #[serde(default)]
    pub coordinates: Option<Vec<Value>>,
    #[serde(default)]
    pub style: Option<RawStyle>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
}

/// Loosely-typed style payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStyle {
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub stroke_width: Option<f64>,
    #[serde(default)]
    pub fill_color: Option<String>,
}

impl RawStyle {
    fn sanitize(self) -> AnnotationStyle {
        AnnotationStyle {
            color: sanitize_color(self.color.as_deref().unwrap_or("#000000")),
            stroke_width: clamp_stroke_width(self.stroke_width.unwrap_or(2.0)),
            fill_color: self.fill_color.map(|c| sanitize_color(&c)),
        }
    }
}

fn sanitize_position(raw: Option<f64>) -> usize {
    match raw {
        Some(p) if p.is_finite() && p > 0.0 => p as usize,
        _ => 0,
    }
}

fn sanitize_length(raw: Option<f64>) -> usize {
    match raw {
        Some(l) if l.is_finite() && l > 0.0 => l as usize,
        _ => 1,
    }
}

/// Convert a raw client payload into a validated [`Operation`].
pub fn sanitize_operation(
    raw: RawOperation,
    user_id: &str,
    session_id: &str,
) -> CollabResult<Operation> {
    let op_type = raw
        .op_type
        .as_deref()
        .ok_or_else(|| CollabError::Validation("operation is missing a type".into()))?;

    let kind = match op_type {
        "insert" => {
            let content = match raw.content {
                Some(Value::String(s)) => scrub_text(&s),
                Some(other) => scrub_text(&other.to_string()),
                None => String::new(),
            };
            OperationKind::Insert { content }
        }
        "delete" => OperationKind::Delete { length: sanitize_length(raw.length) },
        "retain" => OperationKind::Retain { length: sanitize_length(raw.length) },
        "annotate" => OperationKind::Annotate(sanitize_annotate_payload(&raw)?),
        "move" => {
            let target_id = raw
                .target_id
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| CollabError::Validation("move requires a target_id".into()))?;
            OperationKind::Move { target_id }
        }
        other => {
            return Err(CollabError::Validation(format!("unknown operation type: {other}")));
        }
    };

    Ok(Operation {
        id: raw.id.unwrap_or_else(Uuid::new_v4),
        kind,
        position: sanitize_position(raw.position),
        timestamp: raw.timestamp.unwrap_or_else(now_ms),
        user_id: user_id.to_string(),
        session_id: session_id.to_string(),
    })
}

fn sanitize_annotate_payload(raw: &RawOperation) -> CollabResult<AnnotatePayload> {
    let image_id = raw
        .image_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CollabError::Validation("annotate requires an image_id".into()))?;

    let kind = AnnotationKind::from_client_str(raw.annotation_type.as_deref().unwrap_or(""));
    let coordinates = sanitize_coordinates(raw.coordinates.as_deref().unwrap_or(&[]));
    let text = raw
        .text
        .as_deref()
        .map(scrub_text)
        .filter(|t| !t.is_empty());

    validate_shape(kind, &coordinates, text.as_deref())?;

    Ok(AnnotatePayload {
        annotation_id: raw.annotation_id.unwrap_or_else(Uuid::new_v4),
        image_id: image_id.to_string(),
        annotation_type: kind,
        coordinates,
        style: raw.style.clone().unwrap_or_default().sanitize(),
        text,
    })
}

/// Loosely-typed annotation update as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAnnotationUpdate {
    #[serde(default)]
    pub coordinates: Option<Vec<Value>>,
    #[serde(default)]
    pub style: Option<RawStyle>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub measurements: Option<Measurements>,
}

/// Sanitize a partial annotation update.
pub fn sanitize_annotation_update(raw: RawAnnotationUpdate) -> AnnotationUpdate {
    AnnotationUpdate {
        coordinates: raw.coordinates.as_deref().map(sanitize_coordinates),
        style: raw.style.map(RawStyle::sanitize),
        text: raw.text.as_deref().map(scrub_text),
        measurements: raw.measurements,
    }
}
