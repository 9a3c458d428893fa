//! On-disk layout shared with the stage programs.
//!
//! ```text
//! <base>/Temp/lowres-output/Images/<image>/<image><ext>
//! <base>/Temp/threshold-output/Annotations/<image>/annotations.geojson
//! <base>/Temp/tiler-output/Tiles/<image>/<image> [x=..,y=..,w=..,h=..]<ext>
//! <base>/Temp/segment-output/Detections/<image>/detections.geojson
//! <base>/Temp/ann-export-output/<image>/<image>_<class>_<id>_<x>_<y>_<w>_<h>.png
//! <base>/Report/B-<model>_M-None/<image>.csv
//! ```

use std::path::{Path, PathBuf};

pub const TEMP_DIR: &str = "Temp";
pub const LOWRES_OUTPUT: &str = "lowres-output";
pub const THRESHOLD_OUTPUT: &str = "threshold-output";
pub const TILER_OUTPUT: &str = "tiler-output";
pub const SEGMENT_OUTPUT: &str = "segment-output";
pub const ANN_EXPORT_OUTPUT: &str = "ann-export-output";
pub const REPORT_DIR: &str = "Report";

/// Root of everything a run writes under `base`.
pub fn temp_root(base: &Path) -> PathBuf {
    base.join(TEMP_DIR)
}

/// A first-level folder under the temp root, as owned by a stage.
pub fn temp_folder(base: &Path, folder: &str) -> PathBuf {
    temp_root(base).join(folder)
}

pub fn lowres_dir(base: &Path, image: &str) -> PathBuf {
    temp_folder(base, LOWRES_OUTPUT).join("Images").join(image)
}

pub fn lowres_image(base: &Path, image: &str, extension: &str) -> PathBuf {
    lowres_dir(base, image).join(format!("{image}{extension}"))
}

pub fn threshold_artifact(base: &Path, image: &str) -> PathBuf {
    temp_folder(base, THRESHOLD_OUTPUT)
        .join("Annotations")
        .join(image)
        .join("annotations.geojson")
}

pub fn tiles_dir(base: &Path, image: &str) -> PathBuf {
    temp_folder(base, TILER_OUTPUT).join("Tiles").join(image)
}

pub fn tile_filename(image: &str, x: u32, y: u32, width: u32, height: u32, extension: &str) -> String {
    format!("{image} [x={x},y={y},w={width},h={height}]{extension}")
}

pub fn detection_artifact(base: &Path, image: &str) -> PathBuf {
    temp_folder(base, SEGMENT_OUTPUT)
        .join("Detections")
        .join(image)
        .join("detections.geojson")
}

pub fn export_dir(base: &Path, image: &str) -> PathBuf {
    temp_folder(base, ANN_EXPORT_OUTPUT).join(image)
}

/// Crop filename; the annotation id is recovered from it by the report reader.
pub fn export_filename(image: &str, class: &str, id: &str, x: i64, y: i64, width: u32, height: u32) -> String {
    format!("{image}_{class}_{id}_{x}_{y}_{width}_{height}.png")
}

pub fn report_path(base: &Path, model: &str, image: &str) -> PathBuf {
    base.join(REPORT_DIR)
        .join(format!("B-{model}_M-None"))
        .join(format!("{image}.csv"))
}
