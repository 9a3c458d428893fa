//! Readers for the files stage programs leave behind.

pub mod geojson;
pub mod report;

pub use geojson::read_feature_collection;
pub use report::{annotation_id_from_filename, read_report, ReportRow};
