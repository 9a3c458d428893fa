//! Annotation and image store the pipeline reads from and writes back to.
//!
//! The pipeline never owns annotations: it reads them, adds new ones and
//! relabels existing ones through [`AnnotationStore`]. During a run the
//! pipeline worker is the only writer.

mod project;

pub use project::ProjectStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::Result;

/// Stable annotation identifier (a UUID string in the project store).
pub type AnnotationId = String;

/// A 2D coordinate in full-resolution image pixels.
pub type Position = [f64; 2];

/// Region geometry. Rings are closed coordinate lists, exterior first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Vec<Position>>),
    MultiPolygon(Vec<Vec<Vec<Position>>>),
}

impl Geometry {
    /// Axis-aligned bounding box, `None` for a geometry without points.
    pub fn bounds(&self) -> Option<Bounds> {
        let points: Vec<&Position> = match self {
            Geometry::Polygon(rings) => rings.iter().flatten().collect(),
            Geometry::MultiPolygon(polygons) => polygons.iter().flatten().flatten().collect(),
        };
        let first = points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first[0], first[1], first[0], first[1]);
        for p in &points[1..] {
            min_x = min_x.min(p[0]);
            min_y = min_y.min(p[1]);
            max_x = max_x.max(p[0]);
            max_y = max_y.max(p[1]);
        }
        Some(Bounds {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        })
    }

    /// Axis-aligned rectangle as a single-ring polygon.
    pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Self {
        Geometry::Polygon(vec![vec![
            [x, y],
            [x + width, y],
            [x + width, y + height],
            [x, y + height],
            [x, y],
        ]])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

/// An annotation as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    #[serde(default)]
    pub class_label: Option<String>,
    #[serde(default)]
    pub class_probability: Option<f64>,
    pub geometry: Geometry,
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
}

impl Annotation {
    pub fn has_class(&self, label: &str) -> bool {
        self.class_label.as_deref() == Some(label)
    }
}

/// An annotation to be added; the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnnotation {
    pub class_label: Option<String>,
    pub geometry: Geometry,
}

/// One image known to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image name without extension; this is the selection identifier.
    pub name: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Averaged pixel size in microns, when calibrated.
    #[serde(default)]
    pub pixel_size_um: Option<f64>,
}

/// A rectangular region in full-resolution pixels, rendered at `downsample`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionRequest {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    pub downsample: f64,
}

impl RegionRequest {
    /// The bounding box of `bounds` grown by `padding` pixels on every side.
    pub fn padded(bounds: &Bounds, padding: u32, downsample: f64) -> Self {
        let padding = i64::from(padding);
        Self {
            x: bounds.x as i64 - padding,
            y: bounds.y as i64 - padding,
            width: (bounds.width as i64 + 2 * padding).max(1) as u32,
            height: (bounds.height as i64 + 2 * padding).max(1) as u32,
            downsample,
        }
    }

    pub fn whole_image(info: &ImageInfo, downsample: f64) -> Self {
        Self {
            x: 0,
            y: 0,
            width: info.width,
            height: info.height,
            downsample,
        }
    }
}

/// Collaborator interface onto the image/annotation store.
pub trait AnnotationStore: Send + Sync {
    /// Images in the open project, in project order.
    fn list_images(&self) -> Result<Vec<ImageInfo>>;

    fn read_annotations(&self, image: &str) -> Result<Vec<Annotation>>;

    /// Add annotations and return the ids assigned to them.
    fn add_annotations(&self, image: &str, objects: Vec<NewAnnotation>) -> Result<Vec<AnnotationId>>;

    /// Relabel one annotation. Returns `false` when the id is unknown.
    fn set_class(
        &self,
        image: &str,
        id: &str,
        label: &str,
        probability: Option<f64>,
    ) -> Result<bool>;

    /// Merge measurements into one annotation. Returns `false` when the id is unknown.
    fn set_measurements(
        &self,
        image: &str,
        id: &str,
        measurements: BTreeMap<String, f64>,
    ) -> Result<bool>;

    /// Remove every annotation carrying `class_label`; returns how many were removed.
    fn remove_annotations_with_class(&self, image: &str, class_label: &str) -> Result<usize>;

    /// Render a region of the image, clipped to the image extent.
    fn read_region(&self, image: &str, region: &RegionRequest) -> Result<image::RgbImage>;

    fn persist(&self, image: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_bounds() {
        let geometry = Geometry::Polygon(vec![vec![[10.0, 20.0], [30.0, 25.0], [15.0, 60.0], [10.0, 20.0]]]);
        let bounds = geometry.bounds().unwrap();
        assert_eq!(bounds, Bounds { x: 10.0, y: 20.0, width: 20.0, height: 40.0 });
    }

    #[test]
    fn test_empty_geometry_has_no_bounds() {
        assert!(Geometry::MultiPolygon(vec![]).bounds().is_none());
    }

    #[test]
    fn test_geometry_serializes_as_geojson() {
        let geometry = Geometry::rectangle(0.0, 0.0, 2.0, 1.0);
        let json = serde_json::to_value(&geometry).unwrap();
        assert_eq!(json["type"], "Polygon");
        assert_eq!(json["coordinates"][0][2][0], 2.0);
    }

    #[test]
    fn test_padded_region() {
        let bounds = Bounds { x: 500.0, y: 400.0, width: 100.0, height: 50.0 };
        let region = RegionRequest::padded(&bounds, 300, 1.0);
        assert_eq!(region.x, 200);
        assert_eq!(region.y, 100);
        assert_eq!(region.width, 700);
        assert_eq!(region.height, 650);
    }

    #[test]
    fn test_bounds_intersects() {
        let a = Bounds { x: 0.0, y: 0.0, width: 10.0, height: 10.0 };
        let b = Bounds { x: 9.0, y: 9.0, width: 5.0, height: 5.0 };
        let c = Bounds { x: 10.0, y: 0.0, width: 5.0, height: 5.0 };
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }
}
