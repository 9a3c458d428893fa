//! Classification report reader.
//!
//! The classifier writes one semicolon-separated table per image with a
//! header row:
//!
//! ```text
//! filename;predicted-class;NoSclerotic-prob;Sclerotic-prob;ABMGN-prob;...
//! /base/Temp/ann-export-output/slide/slide_Glomerulus_<id>_<x>_<y>_<w>_<h>.png;Sclerotic;0.1;0.9;;...
//! ```
//!
//! Rows are correlated to annotations only through the id embedded in the
//! crop filename, see [`annotation_id_from_filename`].

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{PipelineError, Result};

const PROBABILITY_SUFFIX: &str = "-prob";

/// One classified crop.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub filename: String,
    pub predicted_class: String,
    /// Per-class probabilities keyed by class name; empty or `nan` cells are left out.
    pub probabilities: BTreeMap<String, f64>,
}

impl ReportRow {
    /// Probability of the predicted class, when the report carries it.
    pub fn predicted_probability(&self) -> Option<f64> {
        self.probabilities.get(&self.predicted_class).copied()
    }

    /// Probabilities as annotation measurements (`<Class>-prob`).
    pub fn measurements(&self) -> BTreeMap<String, f64> {
        self.probabilities
            .iter()
            .map(|(class, p)| (format!("{class}{PROBABILITY_SUFFIX}"), *p))
            .collect()
    }
}

/// Read a whole report.
pub fn read_report(path: &Path) -> Result<Vec<ReportRow>> {
    let file = std::fs::File::open(path).map_err(|e| PipelineError::io(path, e))?;
    parse_report(file).map_err(|reason| PipelineError::malformed(path, reason))
}

fn parse_report<R: std::io::Read>(input: R) -> std::result::Result<Vec<ReportRow>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let probability_columns: Vec<(usize, String)> = reader
        .headers()
        .map_err(|e| e.to_string())?
        .iter()
        .enumerate()
        .filter_map(|(i, name)| {
            name.trim()
                .strip_suffix(PROBABILITY_SUFFIX)
                .map(|class| (i, class.to_string()))
        })
        .collect();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|e| e.to_string())?;
        // Header is line 1.
        let line = index + 2;
        if record.len() < 2 {
            return Err(format!("line {line} has {} column(s), expected at least 2", record.len()));
        }

        let mut probabilities = BTreeMap::new();
        for (column, class) in &probability_columns {
            let cell = record.get(*column).map(str::trim).unwrap_or("");
            if cell.is_empty() {
                continue;
            }
            let value: f64 = cell
                .parse()
                .map_err(|_| format!("line {line}: '{cell}' is not a probability"))?;
            if value.is_finite() {
                probabilities.insert(class.clone(), value);
            }
        }

        rows.push(ReportRow {
            filename: record[0].trim().to_string(),
            predicted_class: record[1].trim().to_string(),
            probabilities,
        });
    }
    Ok(rows)
}

/// Extract the annotation id from an exported crop filename.
///
/// Crops are named `<image>_<class>_<id>_<x>_<y>_<w>_<h>.<ext>`; the id runs
/// from the first `_` at or after `marker` up to the next `_` that follows
/// the marker and its separator. Only the basename is inspected so a
/// directory containing the marker cannot shift the match.
pub fn annotation_id_from_filename<'a>(filename: &'a str, marker: &str) -> Option<&'a str> {
    let basename = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let marker_at = basename.find(marker)?;
    let start = marker_at + basename[marker_at..].find('_')? + 1;
    let search_from = marker_at + marker.len() + 1;
    let end = search_from + basename.get(search_from..)?.find('_')?;

    if end <= start {
        return None;
    }
    Some(&basename[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "filename;predicted-class;NoSclerotic-prob;Sclerotic-prob;ABMGN-prob\n\
        /base/Temp/ann-export-output/slide/slide_Glomerulus_A_100_200_50_60.png;Sclerotic;0.2;0.8;\n\
        /base/Temp/ann-export-output/slide/slide_Glomerulus_B_300_200_50_60.png;NoSclerotic;0.7;0.3;nan\n";

    #[test]
    fn test_parse_report() {
        let rows = parse_report(REPORT.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].predicted_class, "Sclerotic");
        assert_eq!(rows[0].predicted_probability(), Some(0.8));
        assert_eq!(rows[1].predicted_probability(), Some(0.7));
        assert!(!rows[1].probabilities.contains_key("ABMGN"));
        assert_eq!(rows[0].measurements().get("NoSclerotic-prob"), Some(&0.2));
    }

    #[test]
    fn test_short_row_is_malformed() {
        let report = "filename;predicted-class\nonly-one-column\n";
        let err = parse_report(report.as_bytes()).unwrap_err();
        assert!(err.contains("line 2"));
    }

    #[test]
    fn test_bad_probability_is_malformed() {
        let report = "filename;predicted-class;Sclerotic-prob\nx_Glomerulus_A_1_2_3_4.png;Sclerotic;high\n";
        assert!(parse_report(report.as_bytes()).is_err());
    }

    #[test]
    fn test_annotation_id_from_filename() {
        assert_eq!(
            annotation_id_from_filename("slide_Glomerulus_4f1c-9a2e_10_20_30_40.png", "Glomerulus"),
            Some("4f1c-9a2e")
        );
        assert_eq!(
            annotation_id_from_filename(
                "/tmp/Glomerulus_study/slide_Glomerulus_id7_1_2_3_4.png",
                "Glomerulus"
            ),
            Some("id7")
        );
    }

    #[test]
    fn test_annotation_id_without_marker() {
        assert_eq!(annotation_id_from_filename("slide_Tissue_id_1_2_3_4.png", "Glomerulus"), None);
        assert_eq!(annotation_id_from_filename("slide_Glomerulus", "Glomerulus"), None);
    }

    #[test]
    fn test_missing_report_is_io_error() {
        let err = read_report(Path::new("/nonexistent/Report/slide.csv")).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }
}
