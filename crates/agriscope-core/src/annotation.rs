//! Annotation artifacts persisted on crop images.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for annotations.
pub type AnnotationId = Uuid;

/// The shape of an annotation mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Circle,
    Rectangle,
    Arrow,
    Text,
    #[default]
    Freehand,
}

impl AnnotationKind {
    /// Parse a client-supplied type string; unknown values fall back to
    /// freehand (ingress whitelist).
    pub fn from_client_str(s: &str) -> Self {
        match s {
            "circle" => AnnotationKind::Circle,
            "rectangle" => AnnotationKind::Rectangle,
            "arrow" => AnnotationKind::Arrow,
            "text" => AnnotationKind::Text,
            "freehand" => AnnotationKind::Freehand,
            _ => AnnotationKind::Freehand,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Circle => "circle",
            AnnotationKind::Rectangle => "rectangle",
            AnnotationKind::Arrow => "arrow",
            AnnotationKind::Text => "text",
            AnnotationKind::Freehand => "freehand",
        }
    }

    /// Minimum coordinate count a shape must carry to be structurally valid.
    pub fn min_coordinates(&self) -> usize {
        match self {
            AnnotationKind::Circle => 3,
            AnnotationKind::Rectangle => 4,
            AnnotationKind::Arrow => 4,
            AnnotationKind::Text => 2,
            AnnotationKind::Freehand => 4,
        }
    }
}

/// Stroke and fill styling for an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationStyle {
    /// Stroke color, hex string or named color.
    pub color: String,
    /// Stroke width in pixels.
    pub stroke_width: f64,
    /// Fill color (None = no fill).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_color: Option<String>,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            color: "#000000".to_string(),
            stroke_width: 2.0,
            fill_color: None,
        }
    }
}

/// Derived geometric measurements for an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perimeter: Option<f64>,
    /// Measurement unit; screen pixels unless the image carries a scale.
    pub unit: String,
}

impl Default for Measurements {
    fn default() -> Self {
        Self {
            length: None,
            area: None,
            perimeter: None,
            unit: "px".to_string(),
        }
    }
}

/// Provenance and placement metadata for an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationMetadata {
    pub created_by: String,
    /// Unix-millisecond creation time.
    pub created_at: u64,
    /// Crop image the annotation is attached to.
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<String>,
    /// Starts at 1, incremented on every update.
    pub version: u32,
}

/// A persisted annotation on a crop image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    /// Flattened coordinates, `[x0, y0, x1, y1, ...]`.
    pub coordinates: Vec<f64>,
    pub style: AnnotationStyle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurements: Option<Measurements>,
    pub metadata: AnnotationMetadata,
}

impl Annotation {
    /// Apply an updated geometry/style/text to this annotation, bumping the
    /// version.
    pub fn apply_update(&mut self, update: AnnotationUpdate) {
        if let Some(coordinates) = update.coordinates {
            self.coordinates = coordinates;
        }
        if let Some(style) = update.style {
            self.style = style;
        }
        if let Some(text) = update.text {
            self.text = Some(text);
        }
        if let Some(measurements) = update.measurements {
            self.measurements = Some(measurements);
        }
        self.metadata.version += 1;
    }
}

/// A partial change to an existing annotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnotationUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<AnnotationStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurements: Option<Measurements>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotation() -> Annotation {
        Annotation {
            id: Uuid::new_v4(),
            kind: AnnotationKind::Rectangle,
            coordinates: vec![10.0, 10.0, 40.0, 20.0],
            style: AnnotationStyle::default(),
            text: None,
            measurements: None,
            metadata: AnnotationMetadata {
                created_by: "user-1".into(),
                created_at: 1_000,
                image_id: "img-1".into(),
                layer_id: None,
                version: 1,
            },
        }
    }

    #[test]
    fn test_unknown_type_falls_back_to_freehand() {
        assert_eq!(AnnotationKind::from_client_str("spline"), AnnotationKind::Freehand);
        assert_eq!(AnnotationKind::from_client_str("circle"), AnnotationKind::Circle);
    }

    #[test]
    fn test_update_bumps_version() {
        let mut a = annotation();
        assert_eq!(a.metadata.version, 1);
        a.apply_update(AnnotationUpdate {
            text: Some("leaf spot".into()),
            ..Default::default()
        });
        assert_eq!(a.metadata.version, 2);
        assert_eq!(a.text.as_deref(), Some("leaf spot"));
        // Fields not present in the update are untouched.
        assert_eq!(a.coordinates, vec![10.0, 10.0, 40.0, 20.0]);
    }
}
