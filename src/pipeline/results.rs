//! Per-image summary of detection and classification results.
//!
//! Classifier probabilities are stored on each annotation as `<Class>-prob`
//! measurements. The disease classes are sub-classes of `NoSclerotic`, so
//! their probabilities are weighted by the annotation's `NoSclerotic-prob`
//! before being summed over the image.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::pipeline::ImageSelection;
use crate::store::{Annotation, AnnotationStore};

pub const NON_SCLEROTIC: &str = "Non-sclerotic";
pub const SCLEROTIC: &str = "Sclerotic";
pub const NON_CLASSIFIED: &str = "Non-classified";

/// Classes reported per image, in display order.
pub const RESULT_CLASSES: [&str; 15] = [
    NON_SCLEROTIC,
    SCLEROTIC,
    "ABMGN",
    "ANCA",
    "C3-GN",
    "CryoglobulinemicGN",
    "DDD",
    "Fibrillary",
    "IAGN",
    "IgAN",
    "MPGN",
    "Membranous",
    "PGNMID",
    "SLEGN-IV",
    NON_CLASSIFIED,
];

const NO_SCLEROTIC_LABEL: &str = "NoSclerotic";
const PROBABILITY_SUFFIX: &str = "-prob";
const TOP_CLASSES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageResult {
    pub image: String,
    /// Annotations carrying one of [`RESULT_CLASSES`].
    pub glomeruli: usize,
    /// Count per class; every class of [`RESULT_CLASSES`] is present.
    pub class_counts: BTreeMap<String, usize>,
    /// Up to three classes joined by ` | `, empty when nothing was found.
    pub most_predicted: String,
}

impl ImageResult {
    /// Summarize the annotations of one image. `subject_class` is the label
    /// of detected but not yet classified glomeruli.
    pub fn from_annotations(image: &str, annotations: &[Annotation], subject_class: &str) -> Self {
        let mut counts: BTreeMap<&str, usize> = RESULT_CLASSES.iter().map(|c| (*c, 0)).collect();
        let mut probabilities: BTreeMap<&str, f64> = RESULT_CLASSES.iter().map(|c| (*c, 0.0)).collect();
        let mut glomeruli = 0;

        for annotation in annotations {
            let Some(label) = annotation.class_label.as_deref() else {
                continue;
            };
            let Some(class) = result_class(label, subject_class) else {
                continue;
            };
            if let Some(count) = counts.get_mut(class) {
                *count += 1;
            }
            glomeruli += 1;

            let no_sclerotic = annotation
                .measurements
                .get(&format!("{NO_SCLEROTIC_LABEL}{PROBABILITY_SUFFIX}"))
                .copied()
                .unwrap_or(0.0);
            for (key, value) in &annotation.measurements {
                let Some(name) = key.strip_suffix(PROBABILITY_SUFFIX) else {
                    continue;
                };
                let (class, weighted) = match name {
                    NO_SCLEROTIC_LABEL => (NON_SCLEROTIC, *value),
                    SCLEROTIC => (SCLEROTIC, *value),
                    other => (other, value * no_sclerotic),
                };
                if let Some(sum) = probabilities.get_mut(class) {
                    *sum += weighted;
                }
            }
        }

        let most_predicted = if probabilities.values().all(|p| *p <= 0.0) {
            if counts[NON_CLASSIFIED] > 0 {
                NON_CLASSIFIED.to_string()
            } else {
                String::new()
            }
        } else {
            top_classes(&probabilities)
        };

        Self {
            image: image.to_string(),
            glomeruli,
            class_counts: counts.into_iter().map(|(c, n)| (c.to_string(), n)).collect(),
            most_predicted,
        }
    }
}

/// Map an annotation label onto a reported class. Only the first word of the
/// label counts.
fn result_class(label: &str, subject_class: &str) -> Option<&'static str> {
    let first = label.split(' ').next().unwrap_or(label);
    let name = if first == subject_class {
        NON_CLASSIFIED
    } else if first == NO_SCLEROTIC_LABEL {
        NON_SCLEROTIC
    } else {
        first
    };
    RESULT_CLASSES.iter().copied().find(|c| *c == name)
}

/// The single most probable class, or the top three once any disease
/// sub-class has a probability, in which case `Non-sclerotic` is left out.
fn top_classes(probabilities: &BTreeMap<&str, f64>) -> String {
    let has_subclass = probabilities
        .iter()
        .any(|(class, p)| *class != NON_SCLEROTIC && *class != SCLEROTIC && *p > 0.0);

    // Display order breaks ties.
    let mut ranked: Vec<(&str, f64)> = RESULT_CLASSES
        .iter()
        .filter(|class| !(has_subclass && **class == NON_SCLEROTIC))
        .map(|class| (*class, probabilities.get(class).copied().unwrap_or(0.0)))
        .filter(|(_, p)| *p > 0.0)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let take = if has_subclass { TOP_CLASSES } else { 1 };
    ranked
        .iter()
        .take(take)
        .map(|(class, _)| *class)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Results for the project images in `selection`, in project order.
pub fn collect_results(
    store: &dyn AnnotationStore,
    selection: &ImageSelection,
    subject_class: &str,
) -> Result<Vec<ImageResult>> {
    let mut results = Vec::new();
    for info in store.list_images()? {
        if !selection.contains(&info.name) {
            continue;
        }
        let annotations = store.read_annotations(&info.name)?;
        results.push(ImageResult::from_annotations(&info.name, &annotations, subject_class));
    }
    Ok(results)
}
