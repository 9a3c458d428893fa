//! File-backed project: a `project.json` image list plus one annotation file
//! per image under `annotations/`.
//!
//! Annotations are loaded lazily and kept in memory until [`persist`] writes
//! them back. Regions are decoded from the image file with the `image` crate;
//! the most recently decoded image is cached since the export and tiling
//! stages read many regions of the same image in a row.
//!
//! [`persist`]: AnnotationStore::persist

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use image::RgbImage;

use super::{Annotation, AnnotationId, AnnotationStore, ImageInfo, NewAnnotation, RegionRequest};
use crate::error::{PipelineError, Result};

const ANNOTATIONS_DIR: &str = "annotations";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectFile {
    images: Vec<ImageInfo>,
}

pub struct ProjectStore {
    root: PathBuf,
    images: Vec<ImageInfo>,
    annotations: Mutex<HashMap<String, Vec<Annotation>>>,
    decoded: Mutex<Option<(String, Arc<RgbImage>)>>,
}

impl ProjectStore {
    /// Open the project described by `<root>/<project_file>`.
    pub fn open(root: impl Into<PathBuf>, project_file: &str) -> Result<Self> {
        let root = root.into();
        let path = root.join(project_file);
        let content = std::fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
        let project: ProjectFile = serde_json::from_str(&content)
            .map_err(|e| PipelineError::malformed(&path, e.to_string()))?;

        tracing::info!("Opened project {} ({} images)", path.display(), project.images.len());
        Ok(Self::with_images(root, project.images))
    }

    /// Write a new project file listing `images` and open it.
    pub fn create(root: impl Into<PathBuf>, project_file: &str, images: Vec<ImageInfo>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| PipelineError::io(&root, e))?;
        let path = root.join(project_file);
        let project = ProjectFile { images };
        let content = serde_json::to_string_pretty(&project)
            .map_err(|e| PipelineError::Store(e.to_string()))?;
        std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
        Ok(Self::with_images(root, project.images))
    }

    fn with_images(root: PathBuf, images: Vec<ImageInfo>) -> Self {
        Self {
            root,
            images,
            annotations: Mutex::new(HashMap::new()),
            decoded: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn annotations_path(&self, image: &str) -> PathBuf {
        self.root.join(ANNOTATIONS_DIR).join(format!("{image}.json"))
    }

    fn image(&self, name: &str) -> Result<&ImageInfo> {
        self.images
            .iter()
            .find(|info| info.name == name)
            .ok_or_else(|| PipelineError::Store(format!("image '{name}' is not in the project")))
    }

    fn image_path(&self, info: &ImageInfo) -> PathBuf {
        if info.path.is_absolute() {
            info.path.clone()
        } else {
            self.root.join(&info.path)
        }
    }

    /// Run `f` on the in-memory annotations of `image`, loading them on first use.
    fn with_annotations<T>(&self, image: &str, f: impl FnOnce(&mut Vec<Annotation>) -> T) -> Result<T> {
        self.image(image)?;
        let mut cache = lock(&self.annotations);
        if !cache.contains_key(image) {
            let loaded = self.load_annotations(image)?;
            cache.insert(image.to_string(), loaded);
        }
        let annotations = cache
            .get_mut(image)
            .ok_or_else(|| PipelineError::Store(format!("annotations of '{image}' not loaded")))?;
        Ok(f(annotations))
    }

    fn load_annotations(&self, image: &str) -> Result<Vec<Annotation>> {
        let path = self.annotations_path(image);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
        serde_json::from_str(&content).map_err(|e| PipelineError::malformed(&path, e.to_string()))
    }

    fn decode(&self, info: &ImageInfo) -> Result<Arc<RgbImage>> {
        let mut decoded = lock(&self.decoded);
        if let Some((name, pixels)) = decoded.as_ref() {
            if name == &info.name {
                return Ok(Arc::clone(pixels));
            }
        }

        let path = self.image_path(info);
        tracing::debug!("Decoding {}", path.display());
        let pixels = image::open(&path)
            .map_err(|e| PipelineError::Store(format!("cannot read {}: {e}", path.display())))?
            .to_rgb8();
        let pixels = Arc::new(pixels);
        *decoded = Some((info.name.clone(), Arc::clone(&pixels)));
        Ok(pixels)
    }
}

impl AnnotationStore for ProjectStore {
    fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(self.images.clone())
    }

    fn read_annotations(&self, image: &str) -> Result<Vec<Annotation>> {
        self.with_annotations(image, |annotations| annotations.clone())
    }

    fn add_annotations(&self, image: &str, objects: Vec<NewAnnotation>) -> Result<Vec<AnnotationId>> {
        self.with_annotations(image, |annotations| {
            objects
                .into_iter()
                .map(|object| {
                    let id = uuid::Uuid::new_v4().to_string();
                    annotations.push(Annotation {
                        id: id.clone(),
                        class_label: object.class_label,
                        class_probability: None,
                        geometry: object.geometry,
                        measurements: BTreeMap::new(),
                    });
                    id
                })
                .collect()
        })
    }

    fn set_class(&self, image: &str, id: &str, label: &str, probability: Option<f64>) -> Result<bool> {
        self.with_annotations(image, |annotations| {
            match annotations.iter_mut().find(|a| a.id == id) {
                Some(annotation) => {
                    annotation.class_label = Some(label.to_string());
                    annotation.class_probability = probability;
                    true
                }
                None => false,
            }
        })
    }

    fn set_measurements(&self, image: &str, id: &str, measurements: BTreeMap<String, f64>) -> Result<bool> {
        self.with_annotations(image, |annotations| {
            match annotations.iter_mut().find(|a| a.id == id) {
                Some(annotation) => {
                    annotation.measurements.extend(measurements);
                    true
                }
                None => false,
            }
        })
    }

    fn remove_annotations_with_class(&self, image: &str, class_label: &str) -> Result<usize> {
        self.with_annotations(image, |annotations| {
            let before = annotations.len();
            annotations.retain(|a| !a.has_class(class_label));
            before - annotations.len()
        })
    }

    fn read_region(&self, image: &str, region: &RegionRequest) -> Result<RgbImage> {
        let info = self.image(image)?;
        let pixels = self.decode(info)?;

        let (img_w, img_h) = (i64::from(pixels.width()), i64::from(pixels.height()));
        let x0 = region.x.clamp(0, img_w);
        let y0 = region.y.clamp(0, img_h);
        let x1 = (region.x + i64::from(region.width)).clamp(0, img_w);
        let y1 = (region.y + i64::from(region.height)).clamp(0, img_h);
        if x1 <= x0 || y1 <= y0 {
            return Err(PipelineError::Store(format!(
                "region {}x{} at ({}, {}) lies outside '{}'",
                region.width, region.height, region.x, region.y, image
            )));
        }

        let crop = image::imageops::crop_imm(
            pixels.as_ref(),
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        )
        .to_image();

        if region.downsample <= 1.0 {
            return Ok(crop);
        }
        let out_w = ((crop.width() as f64 / region.downsample).round() as u32).max(1);
        let out_h = ((crop.height() as f64 / region.downsample).round() as u32).max(1);
        Ok(image::imageops::resize(
            &crop,
            out_w,
            out_h,
            image::imageops::FilterType::Triangle,
        ))
    }

    fn persist(&self, image: &str) -> Result<()> {
        let annotations = self.read_annotations(image)?;
        let dir = self.root.join(ANNOTATIONS_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

        let path = self.annotations_path(image);
        let content = serde_json::to_string_pretty(&annotations)
            .map_err(|e| PipelineError::Store(e.to_string()))?;
        std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
        tracing::debug!("Saved {} annotations for {}", annotations.len(), image);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
