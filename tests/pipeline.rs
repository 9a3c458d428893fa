//! End-to-end runs against stand-in stage programs written as shell scripts.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gdcnn_pipeline::pipeline::paths;
use gdcnn_pipeline::store::{Geometry, ImageInfo, NewAnnotation};
use gdcnn_pipeline::{
    AnnotationStore, Config, ExitCodePolicy, Flow, ImageSelection, PipelineError,
    PipelineOrchestrator, PipelineStatus, ProjectStore, RunOutcome, StageKind, StageState,
};
use tempfile::TempDir;

const ARGS: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --wsi) WSI="$2"; shift 2;;
    --export|-e) BASE="$2"; shift 2;;
    *) shift;;
  esac
done
"#;

const THRESHOLD: &str = r#"
OUT="$BASE/Temp/threshold-output/Annotations/$WSI"
mkdir -p "$OUT"
echo '{"type":"FeatureCollection","features":[{"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[0,0],[60,0],[60,40],[0,40],[0,0]]]}}]}' > "$OUT/annotations.geojson"
echo "tissue found in $WSI"
"#;

const SEGMENT: &str = r#"
OUT="$BASE/Temp/segment-output/Detections/$WSI"
mkdir -p "$OUT"
echo "inference 50% done"
echo '[{"type":"Feature","properties":{"classification":{"name":"Glomerulus"}},"geometry":{"type":"Polygon","coordinates":[[[10,10],[30,10],[30,25],[10,25],[10,10]]]}}]' > "$OUT/detections.geojson"
"#;

const CLASSIFY: &str = r#"
OUT="$BASE/Report/B-swin_transformer_M-None"
mkdir -p "$OUT"
for dir in "$BASE"/Temp/ann-export-output/*/; do
  [ -d "$dir" ] || continue
  image=$(basename "$dir")
  {
    echo "filename;predicted-class;Healthy-prob;Sclerotic-prob"
    for crop in "$dir"*.png; do
      echo "$crop;Sclerotic;0.1;0.9"
    done
    echo "${image}_Glomerulus_gone_0_0_1_1.png;Healthy;0.8;0.2"
  } > "$OUT/$image.csv"
done
"#;

struct Fixture {
    _dir: TempDir,
    base: PathBuf,
    store: Arc<ProjectStore>,
    config: Config,
}

impl Fixture {
    fn new(images: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let base = dir.path().to_path_buf();

        let infos = images
            .iter()
            .map(|name| {
                let path = base.join(format!("{name}.png"));
                image::RgbImage::from_pixel(64, 48, image::Rgb([200, 120, 140]))
                    .save(&path)
                    .unwrap();
                ImageInfo {
                    name: name.to_string(),
                    path,
                    width: 64,
                    height: 48,
                    pixel_size_um: Some(0.25),
                }
            })
            .collect();
        let store = Arc::new(ProjectStore::create(&base, "project.json", infos).unwrap());

        let mut config = Config::with_base_dir(&base);
        config.tools.threshold_command = script(&base, "threshold", THRESHOLD);
        config.tools.segment_command = script(&base, "segment", SEGMENT);
        config.tools.classify_command = script(&base, "classify", CLASSIFY);
        config.tiling.tile_size = 32;
        config.tiling.overlap = 16;
        config.export.padding = 4;

        Self {
            _dir: dir,
            base,
            store,
            config,
        }
    }

    fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::new(self.config.clone(), Arc::clone(&self.store) as Arc<dyn AnnotationStore>)
    }

    fn add_glomerulus(&self, image: &str) -> String {
        let ids = self
            .store
            .add_annotations(
                image,
                vec![NewAnnotation {
                    class_label: Some("Glomerulus".to_string()),
                    geometry: Geometry::rectangle(8.0, 8.0, 20.0, 16.0),
                }],
            )
            .unwrap();
        ids[0].clone()
    }
}

/// Write an executable script under `<base>/bin` and return its path.
fn script(base: &Path, name: &str, body: &str) -> String {
    let bin = base.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let path = bin.join(name);
    std::fs::write(&path, format!("#!/bin/bash\n{ARGS}{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

async fn finish(orchestrator: &PipelineOrchestrator) -> PipelineStatus {
    tokio::time::timeout(Duration::from_secs(60), orchestrator.wait_idle())
        .await
        .expect("run did not finish")
}

fn state_of(status: &PipelineStatus, kind: StageKind) -> StageState {
    status
        .stages
        .iter()
        .find(|run| run.kind == kind)
        .map(|run| run.state)
        .unwrap()
}

#[tokio::test]
async fn test_full_run_reaches_completion() {
    let fixture = Fixture::new(&["slide-a", "slide-b"]);
    let orchestrator = fixture.orchestrator();

    orchestrator.run_full(ImageSelection::new(["slide-a", "slide-b"])).unwrap();
    let status = finish(&orchestrator).await;

    assert_eq!(status.outcome, Some(RunOutcome::Done));
    assert_eq!(status.progress, 1.0);
    assert!(status.done);
    assert!(orchestrator.is_done());
    assert!(status.stages.iter().all(|run| run.state == StageState::Done));
    assert!(status.stages.iter().all(|run| run.images_completed == 2));

    for image in ["slide-a", "slide-b"] {
        let annotations = fixture.store.read_annotations(image).unwrap();
        assert!(annotations.iter().all(|a| !a.has_class("Tissue")));
        let classified: Vec<_> = annotations.iter().filter(|a| a.has_class("Sclerotic")).collect();
        assert_eq!(classified.len(), 1);
        assert_eq!(classified[0].class_probability, Some(0.9));
    }

    // Every stage removed what it owns.
    for folder in [
        paths::LOWRES_OUTPUT,
        paths::THRESHOLD_OUTPUT,
        paths::TILER_OUTPUT,
        paths::SEGMENT_OUTPUT,
        paths::ANN_EXPORT_OUTPUT,
    ] {
        assert!(!paths::temp_folder(&fixture.base, folder).exists(), "{folder} left behind");
    }
    assert!(paths::report_path(&fixture.base, "swin_transformer", "slide-a").exists());

    let results = orchestrator.results(&ImageSelection::new(["slide-b", "slide-a"])).unwrap();
    let images: Vec<_> = results.iter().map(|r| r.image.as_str()).collect();
    assert_eq!(images, ["slide-a", "slide-b"]);
    for result in &results {
        assert_eq!(result.glomeruli, 1);
        assert_eq!(result.class_counts["Sclerotic"], 1);
        assert_eq!(result.most_predicted, "Sclerotic");
    }
}

#[tokio::test]
async fn test_malformed_detections_fail_the_run() {
    let mut fixture = Fixture::new(&["slide-a", "slide-b"]);
    let segment = format!(
        r#"{SEGMENT}
if [ "$WSI" = "slide-b" ]; then
  echo '{{"type":"FeatureCollection","features":[' > "$OUT/detections.geojson"
fi
"#
    );
    fixture.config.tools.segment_command = script(&fixture.base, "segment-broken", &segment);
    assert_eq!(fixture.config.processing.exit_code_policy, ExitCodePolicy::Lenient);
    let orchestrator = fixture.orchestrator();

    orchestrator.run_full(ImageSelection::new(["slide-a", "slide-b"])).unwrap();
    let status = finish(&orchestrator).await;

    match &status.outcome {
        Some(RunOutcome::Failed { stage, cause }) => {
            assert_eq!(*stage, StageKind::DetectSubjects);
            assert!(cause.contains("detections.geojson"), "{cause}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!status.done);
    let detect = status
        .stages
        .iter()
        .find(|run| run.kind == StageKind::DetectSubjects)
        .unwrap();
    assert_eq!(detect.state, StageState::Failed);
    assert_eq!(detect.images_completed, 1);
    assert_eq!(state_of(&status, StageKind::ExportAnnotations), StageState::Cancelled);
    assert_eq!(state_of(&status, StageKind::Classify), StageState::Cancelled);

    let first = fixture.store.read_annotations("slide-a").unwrap();
    assert_eq!(first.iter().filter(|a| a.has_class("Glomerulus")).count(), 1);
    assert!(fixture
        .store
        .read_annotations("slide-b")
        .unwrap()
        .iter()
        .all(|a| !a.has_class("Glomerulus")));
}

#[tokio::test]
async fn test_missing_image_still_completes() {
    let fixture = Fixture::new(&["slide"]);
    let orchestrator = fixture.orchestrator();

    orchestrator
        .run_detection_only(ImageSelection::new(["slide", "not-in-project"]))
        .unwrap();
    let status = finish(&orchestrator).await;

    assert_eq!(status.outcome, Some(RunOutcome::Done));
    assert_eq!(status.progress, 1.0);
    let glomeruli = fixture.store.read_annotations("slide").unwrap();
    assert_eq!(glomeruli.len(), 1);
    assert!(glomeruli[0].has_class("Glomerulus"));
}

#[tokio::test]
async fn test_cancel_mid_run() {
    let mut fixture = Fixture::new(&["slide"]);
    fixture.config.tools.segment_command = script(&fixture.base, "segment-slow", "exec sleep 30\n");
    let orchestrator = fixture.orchestrator();
    let selection = ImageSelection::new(["slide"]);

    let mut rx = orchestrator.subscribe();
    orchestrator.run_full(selection.clone()).unwrap();
    tokio::time::timeout(
        Duration::from_secs(30),
        rx.wait_for(|s| {
            s.stages
                .iter()
                .any(|run| run.kind == StageKind::DetectSubjects && run.state == StageState::RunningSubprocess)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    orchestrator.cancel(&selection).await.unwrap();
    let status = orchestrator.status();

    assert_eq!(status.outcome, Some(RunOutcome::Cancelled));
    assert!(status.progress < 1.0);
    assert!(!status.done);
    assert!(!orchestrator.is_running());
    assert_eq!(state_of(&status, StageKind::Tile), StageState::Done);
    assert_eq!(state_of(&status, StageKind::DetectSubjects), StageState::Cancelled);
    assert_eq!(state_of(&status, StageKind::Classify), StageState::Cancelled);
    assert!(!paths::temp_root(&fixture.base).exists());
    assert!(fixture
        .store
        .read_annotations("slide")
        .unwrap()
        .iter()
        .all(|a| !a.has_class("Tissue")));

    // Accepting again once the cancel returned.
    assert!(orchestrator.run_classification_only(selection).is_ok());
}

#[tokio::test]
async fn test_run_refused_while_cancelling() {
    let mut fixture = Fixture::new(&["slide"]);
    fixture.config.tools.threshold_command = script(&fixture.base, "threshold-slow", "exec sleep 30\n");
    let orchestrator = fixture.orchestrator();
    let selection = ImageSelection::new(["slide"]);

    let mut rx = orchestrator.subscribe();
    orchestrator.run_full(selection.clone()).unwrap();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| s.stage_label.is_some()))
        .await
        .unwrap()
        .unwrap();

    // Single-threaded runtime: the cancel is parked in its wait before the
    // second branch is polled.
    let (cancelled, refused) = tokio::join!(orchestrator.cancel(&selection), async {
        orchestrator.run_full(selection.clone())
    });
    assert!(cancelled.is_ok());
    assert!(matches!(refused, Err(PipelineError::Busy)));
}

#[tokio::test]
async fn test_empty_selection_rejected() {
    let fixture = Fixture::new(&["slide"]);
    let orchestrator = fixture.orchestrator();
    assert!(matches!(
        orchestrator.run(Flow::Full, ImageSelection::default()),
        Err(PipelineError::EmptySelection)
    ));
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_classification_skips_vanished_annotations() {
    let fixture = Fixture::new(&["slide"]);
    let id = fixture.add_glomerulus("slide");
    let orchestrator = fixture.orchestrator();

    let selection = orchestrator.images_with_subjects(&ImageSelection::new(["slide"])).unwrap();
    assert_eq!(selection.as_slice(), ["slide"]);
    orchestrator.run_classification_only(selection).unwrap();
    let status = finish(&orchestrator).await;

    assert_eq!(status.outcome, Some(RunOutcome::Done));
    let annotations = fixture.store.read_annotations("slide").unwrap();
    assert_eq!(annotations.len(), 1);
    let annotation = &annotations[0];
    assert_eq!(annotation.id, id);
    assert_eq!(annotation.class_label.as_deref(), Some("Sclerotic"));
    assert_eq!(annotation.class_probability, Some(0.9));
    assert_eq!(annotation.measurements.get("Healthy-prob"), Some(&0.1));
}

#[tokio::test]
async fn test_report_from_earlier_run_is_not_applied() {
    let mut fixture = Fixture::new(&["slide"]);
    let id = fixture.add_glomerulus("slide");

    let stale = paths::report_path(&fixture.base, "swin_transformer", "slide");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(
        &stale,
        format!("filename;predicted-class;Healthy-prob;Sclerotic-prob\nslide_Glomerulus_{id}_0_0_1_1.png;Healthy;0.8;0.2\n"),
    )
    .unwrap();
    fixture.config.tools.classify_command = script(&fixture.base, "classify-crash", "exit 1\n");
    let orchestrator = fixture.orchestrator();

    orchestrator.run_classification_only(ImageSelection::new(["slide"])).unwrap();
    let status = finish(&orchestrator).await;

    assert!(matches!(
        status.outcome,
        Some(RunOutcome::Failed { stage: StageKind::Classify, .. })
    ));
    assert!(!stale.exists());
    let annotations = fixture.store.read_annotations("slide").unwrap();
    assert_eq!(annotations.len(), 1);
    assert_eq!(annotations[0].class_label.as_deref(), Some("Glomerulus"));
    assert!(annotations[0].measurements.is_empty());
}

#[tokio::test]
async fn test_export_without_subjects_is_done() {
    let fixture = Fixture::new(&["slide"]);
    let orchestrator = fixture.orchestrator();

    orchestrator.run_classification_only(ImageSelection::new(["slide"])).unwrap();
    let status = finish(&orchestrator).await;

    assert_eq!(status.outcome, Some(RunOutcome::Done));
    assert_eq!(status.progress, 1.0);
    assert!(!paths::export_dir(&fixture.base, "slide").exists());
    assert!(fixture.store.read_annotations("slide").unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_progress_is_held_below_completion() {
    let mut fixture = Fixture::new(&["slide"]);
    let segment = format!("echo '100%'\nsleep 0.5\n{SEGMENT}");
    fixture.config.tools.segment_command = script(&fixture.base, "segment-hold", &segment);
    let orchestrator = fixture.orchestrator();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let collector = {
        let seen = Arc::clone(&seen);
        let mut rx = orchestrator.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let progress = rx.borrow_and_update().progress;
                seen.lock().unwrap().push(progress);
            }
        })
    };

    orchestrator.run_detection_only(ImageSelection::new(["slide"])).unwrap();
    let status = finish(&orchestrator).await;
    collector.abort();

    assert_eq!(status.progress, 1.0);
    let seen = seen.lock().unwrap().clone();
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "not monotonic: {seen:?}");
    assert!(seen.iter().all(|p| *p <= 0.99 || *p == 1.0), "leaked past hold: {seen:?}");
    assert!(seen.contains(&0.99));
}

#[tokio::test]
async fn test_exit_code_policy() {
    let failing_segment = format!("{SEGMENT}exit 3\n");

    let mut lenient = Fixture::new(&["slide"]);
    lenient.config.tools.segment_command = script(&lenient.base, "segment-exit", &failing_segment);
    let orchestrator = lenient.orchestrator();
    orchestrator.run_full(ImageSelection::new(["slide"])).unwrap();
    let status = finish(&orchestrator).await;
    assert_eq!(status.outcome, Some(RunOutcome::Done));

    let mut strict = Fixture::new(&["slide"]);
    strict.config.tools.segment_command = script(&strict.base, "segment-exit", &failing_segment);
    strict.config.processing.exit_code_policy = ExitCodePolicy::Strict;
    let orchestrator = strict.orchestrator();
    orchestrator.run_full(ImageSelection::new(["slide"])).unwrap();
    let status = finish(&orchestrator).await;

    match &status.outcome {
        Some(RunOutcome::Failed { stage, cause }) => {
            assert_eq!(*stage, StageKind::DetectSubjects);
            assert!(cause.contains("status 3"), "{cause}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(state_of(&status, StageKind::DetectSubjects), StageState::Failed);
    assert_eq!(state_of(&status, StageKind::ExportAnnotations), StageState::Cancelled);
    assert_eq!(state_of(&status, StageKind::Classify), StageState::Cancelled);
    assert!(!status.done);
    // Nothing is cleaned up after a failure.
    assert!(paths::temp_folder(&strict.base, paths::TILER_OUTPUT).exists());
}

#[tokio::test]
async fn test_missing_program_fails_stage() {
    let mut fixture = Fixture::new(&["slide"]);
    fixture.config.processing.exit_code_policy = ExitCodePolicy::Strict;
    fixture.config.tools.threshold_command = fixture.base.join("bin/does-not-exist").display().to_string();
    let orchestrator = fixture.orchestrator();

    orchestrator.run_detection_only(ImageSelection::new(["slide"])).unwrap();
    let status = finish(&orchestrator).await;

    assert!(matches!(
        status.outcome,
        Some(RunOutcome::Failed { stage: StageKind::TissueDetect, .. })
    ));
    assert_eq!(state_of(&status, StageKind::Tile), StageState::Cancelled);
}

#[tokio::test]
async fn test_queued_runs_execute_in_order() {
    let fixture = Fixture::new(&["slide"]);
    let orchestrator = fixture.orchestrator();

    let first = orchestrator.run_detection_only(ImageSelection::new(["slide"])).unwrap();
    let second = orchestrator.run_classification_only(ImageSelection::new(["slide"])).unwrap();
    assert!(second > first);

    let status = finish(&orchestrator).await;
    assert_eq!(status.invocation, second);
    assert_eq!(status.flow, Some(Flow::ClassificationOnly));
    assert_eq!(status.outcome, Some(RunOutcome::Done));
    assert!(fixture
        .store
        .read_annotations("slide")
        .unwrap()
        .iter()
        .any(|a| a.has_class("Sclerotic")));
}
