//! Detection artifact reader.
//!
//! Accepts a `FeatureCollection`, a bare array of features, or a single
//! feature. The class label is taken from `properties.classification.name`,
//! falling back to `properties.name` and then to the caller's default.
//! Features with non-areal geometry (points, lines) are skipped.

use serde::Deserialize;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::store::{Geometry, NewAnnotation, Position};

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Collection { features: Vec<Feature> },
    Features(Vec<Feature>),
    Single(Feature),
}

#[derive(Deserialize)]
struct Feature {
    #[serde(default)]
    geometry: Option<RawGeometry>,
    #[serde(default)]
    properties: Option<Properties>,
}

#[derive(Deserialize)]
struct RawGeometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: serde_json::Value,
}

#[derive(Default, Deserialize)]
struct Properties {
    #[serde(default)]
    classification: Option<Classification>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct Classification {
    #[serde(default)]
    name: Option<String>,
}

/// Read every areal feature of the file at `path` as a new annotation.
pub fn read_feature_collection(path: &Path, default_class: Option<&str>) -> Result<Vec<NewAnnotation>> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    parse_feature_collection(&content, default_class).map_err(|reason| PipelineError::malformed(path, reason))
}

fn parse_feature_collection(content: &str, default_class: Option<&str>) -> std::result::Result<Vec<NewAnnotation>, String> {
    let document: Document = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let features = match document {
        Document::Collection { features } | Document::Features(features) => features,
        Document::Single(feature) => vec![feature],
    };

    let mut annotations = Vec::with_capacity(features.len());
    for (index, feature) in features.into_iter().enumerate() {
        let Some(raw) = feature.geometry else {
            tracing::debug!("Feature {} has no geometry, skipping", index);
            continue;
        };
        let geometry = match raw.kind.as_str() {
            "Polygon" => Geometry::Polygon(rings(&raw.coordinates).map_err(|e| format!("feature {index}: {e}"))?),
            "MultiPolygon" => {
                let polygons = raw
                    .coordinates
                    .as_array()
                    .ok_or_else(|| format!("feature {index}: MultiPolygon coordinates are not an array"))?
                    .iter()
                    .map(rings)
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| format!("feature {index}: {e}"))?;
                Geometry::MultiPolygon(polygons)
            }
            other => {
                tracing::debug!("Feature {} has {} geometry, skipping", index, other);
                continue;
            }
        };

        let properties = feature.properties.unwrap_or_default();
        let class_label = properties
            .classification
            .and_then(|c| c.name)
            .or(properties.name)
            .or_else(|| default_class.map(str::to_string));

        annotations.push(NewAnnotation { class_label, geometry });
    }
    Ok(annotations)
}

fn rings(value: &serde_json::Value) -> std::result::Result<Vec<Vec<Position>>, String> {
    let rings: Vec<Vec<Vec<f64>>> = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    rings
        .into_iter()
        .map(|ring| {
            ring.into_iter()
                .map(|point| match point.as_slice() {
                    [x, y, ..] => Ok([*x, *y]),
                    _ => Err(format!("position with {} values", point.len())),
                })
                .collect()
        })
        .collect()
}
