//! The five stage kinds and the state machine they share.
//!
//! Every stage walks the same states over the run's image selection:
//!
//! ```text
//! Pending ─▶ ResolvingInputs ─▶ ┌─ RunningSubprocess ─▶ ApplyingResults ─┐ ─▶ CleaningUp ─▶ Done
//!                               └──────────── once per image ◀───────────┘
//!                       (any state) ─▶ Failed | Cancelled
//! ```
//!
//! Images are processed strictly one after another in selection order. Tiling
//! and annotation export are computed in-process and never enter
//! `RunningSubprocess`. The classifier runs once for the whole selection
//! unless configured per image; its report is then applied image by image.

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;

use crate::artifacts::{annotation_id_from_filename, read_feature_collection, read_report};
use crate::config::{Config, ExitCodePolicy};
use crate::error::{PipelineError, Result, StageFailure};
use crate::pipeline::paths;
use crate::pipeline::ProgressTracker;
use crate::process::{CancelToken, LogSink, ProcessRunner, ProgressSink};
use crate::store::{AnnotationStore, Bounds, ImageInfo, RegionRequest};

/// The fixed set of stages a flow is composed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    TissueDetect,
    Tile,
    DetectSubjects,
    ExportAnnotations,
    Classify,
}

impl StageKind {
    /// Message shown to the user while the stage is active.
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::TissueDetect => "Detecting tissue...",
            StageKind::Tile => "Tiling images...",
            StageKind::DetectSubjects => "Detecting glomeruli... (this may take a while)",
            StageKind::ExportAnnotations => "Exporting glomerular annotations...",
            StageKind::Classify => "Classifying glomeruli...",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::TissueDetect => "tissue detection",
            StageKind::Tile => "tiling",
            StageKind::DetectSubjects => "glomerulus detection",
            StageKind::ExportAnnotations => "annotation export",
            StageKind::Classify => "classification",
        }
    }

    /// Tag attached to subprocess log lines.
    fn runner_name(&self) -> &'static str {
        match self {
            StageKind::TissueDetect => "tissue-detection",
            StageKind::Tile => "tiler",
            StageKind::DetectSubjects => "glomerulus-detection",
            StageKind::ExportAnnotations => "annotation-export",
            StageKind::Classify => "classification",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    ResolvingInputs,
    RunningSubprocess,
    ApplyingResults,
    CleaningUp,
    Done,
    Failed,
    Cancelled,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Done | StageState::Failed | StageState::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != StageState::Pending
    }
}

/// Ordered, duplicate-free image names for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageSelection(Vec<String>);

impl ImageSelection {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let names = names
            .into_iter()
            .map(Into::into)
            .filter(|name| seen.insert(name.clone()))
            .collect();
        Self(names)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl<S: Into<String>> FromIterator<S> for ImageSelection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Immutable description of one stage: program, arguments, artifact and the
/// temp folders it deletes when done.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub kind: StageKind,
    /// `None` for stages computed in-process.
    pub command: Option<String>,
    /// First-level folders under `<base>/Temp` this stage owns.
    pub owned_temp: Vec<&'static str>,
    config: Arc<Config>,
}

impl StageSpec {
    pub fn new(kind: StageKind, config: Arc<Config>) -> Self {
        let tools = &config.tools;
        let (command, owned_temp) = match kind {
            StageKind::TissueDetect => (
                Some(tools.threshold_command.clone()),
                vec![paths::LOWRES_OUTPUT, paths::THRESHOLD_OUTPUT],
            ),
            StageKind::Tile => (None, vec![]),
            StageKind::DetectSubjects => (
                Some(tools.segment_command.clone()),
                vec![paths::TILER_OUTPUT, paths::SEGMENT_OUTPUT],
            ),
            StageKind::ExportAnnotations => (None, vec![]),
            StageKind::Classify => (Some(tools.classify_command.clone()), vec![paths::ANN_EXPORT_OUTPUT]),
        };
        Self {
            kind,
            command,
            owned_temp,
            config,
        }
    }

    fn base_dir(&self) -> &Path {
        &self.config.workspace.base_dir
    }

    /// Command line for one image, or for the whole run when `image` is `None`
    /// (batch classification). Empty for in-process stages.
    pub fn argv(&self, image: Option<&ImageInfo>) -> Vec<String> {
        let Some(command) = &self.command else {
            return Vec::new();
        };
        let config = &self.config;
        let base = self.base_dir().display().to_string();
        let mut argv = vec![command.clone()];

        match self.kind {
            StageKind::TissueDetect | StageKind::DetectSubjects => {
                if let Some(info) = image {
                    argv.extend(["--wsi".to_string(), info.name.clone()]);
                }
                argv.extend(["--export".to_string(), base]);
                if self.kind == StageKind::TissueDetect {
                    argv.extend([
                        "--undersampling".to_string(),
                        config.tissue.downsample.to_string(),
                    ]);
                } else {
                    argv.extend([
                        "--model".to_string(),
                        config.detection.model.clone(),
                        "--train-config".to_string(),
                        config.detection.train_config.clone(),
                        "--undersampling".to_string(),
                        config.detection.undersampling.to_string(),
                    ]);
                }
                if let Some(pixel_size) = image.and_then(|info| info.pixel_size_um) {
                    argv.extend(["--pixel-size".to_string(), pixel_size.to_string()]);
                }
            }
            StageKind::Classify => {
                argv.extend([
                    "-e".to_string(),
                    base,
                    "--netB".to_string(),
                    config.classification.model.clone(),
                ]);
                if let Some(info) = image {
                    argv.extend(["--wsi".to_string(), info.name.clone()]);
                }
            }
            StageKind::Tile | StageKind::ExportAnnotations => {}
        }
        argv
    }

    /// Artifact read back for `image`, for stages that read one.
    pub fn artifact_path(&self, image: &str) -> Option<PathBuf> {
        let base = self.base_dir();
        match self.kind {
            StageKind::TissueDetect => Some(paths::threshold_artifact(base, image)),
            StageKind::DetectSubjects => Some(paths::detection_artifact(base, image)),
            StageKind::Classify => Some(paths::report_path(base, &self.config.classification.model, image)),
            StageKind::Tile | StageKind::ExportAnnotations => None,
        }
    }
}

/// Observable record of one stage execution.
#[derive(Debug, Clone, Serialize)]
pub struct StageRun {
    pub kind: StageKind,
    pub state: StageState,
    /// Images whose results have been applied.
    pub images_completed: usize,
    /// Failure cause, set only in `Failed`.
    pub error: Option<String>,
}

impl StageRun {
    fn new(kind: StageKind) -> Self {
        Self {
            kind,
            state: StageState::Pending,
            images_completed: 0,
            error: None,
        }
    }
}

/// Called on every state transition of a stage.
pub type StageObserver = Arc<dyn Fn(&StageRun) + Send + Sync>;

/// Everything a stage needs from the invocation that runs it.
#[derive(Clone)]
pub struct StageContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn AnnotationStore>,
    pub progress: Arc<ProgressTracker>,
    pub cancel: CancelToken,
    pub log_sink: Option<LogSink>,
    pub observer: Option<StageObserver>,
}

/// One stage of an invocation.
pub struct PipelineStage {
    spec: StageSpec,
    run: StageRun,
}

impl PipelineStage {
    pub fn new(kind: StageKind, config: Arc<Config>) -> Self {
        Self {
            spec: StageSpec::new(kind, config),
            run: StageRun::new(kind),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    pub fn run(&self) -> &StageRun {
        &self.run
    }

    /// Mark a stage that will never start as cancelled.
    pub fn cancel_pending(&mut self) {
        if !self.run.state.is_terminal() {
            self.run.state = StageState::Cancelled;
        }
    }

    /// Run the stage over `selection` to a terminal state.
    pub async fn execute(
        &mut self,
        selection: &ImageSelection,
        ctx: &StageContext,
    ) -> std::result::Result<(), StageFailure> {
        tracing::info!("Starting {} for {} images", self.kind(), selection.len());

        match self.execute_inner(selection, ctx).await {
            Ok(()) => {
                self.transition(ctx, StageState::Done);
                tracing::info!("{} finished", self.kind());
                Ok(())
            }
            Err(PipelineError::Cancelled) => {
                self.transition(ctx, StageState::Cancelled);
                tracing::warn!("{} cancelled", self.kind());
                Err(StageFailure {
                    stage: self.kind(),
                    error: PipelineError::Cancelled,
                })
            }
            Err(error) => {
                self.run.error = Some(error.to_string());
                self.transition(ctx, StageState::Failed);
                tracing::error!("{} failed: {}", self.kind(), error);
                Err(StageFailure {
                    stage: self.kind(),
                    error,
                })
            }
        }
    }

    async fn execute_inner(&mut self, selection: &ImageSelection, ctx: &StageContext) -> Result<()> {
        ctx.cancel.checkpoint()?;
        self.transition(ctx, StageState::ResolvingInputs);
        let images = self.resolve_inputs(selection, ctx)?;

        let runner = ProcessRunner::new(self.kind().runner_name(), ctx.cancel.clone())
            .with_env(ctx.config.tools.env.clone())
            .with_log_sink(ctx.log_sink.clone());

        let batch = self.kind() == StageKind::Classify && !ctx.config.classification.per_image;
        if batch && !images.is_empty() {
            ctx.cancel.checkpoint()?;
            self.transition(ctx, StageState::RunningSubprocess);
            for info in &images {
                self.discard_previous_report(info)?;
            }
            self.run_command(&runner, None, None, ctx).await?;
        }

        for info in &images {
            ctx.cancel.checkpoint()?;

            if self.spec.command.is_some() && !batch {
                self.transition(ctx, StageState::RunningSubprocess);
                self.prepare(info, ctx).await?;
                let hints = self.progress_sink(ctx);
                self.run_command(&runner, Some(info), hints, ctx).await?;
            }

            self.transition(ctx, StageState::ApplyingResults);
            self.apply(info, ctx).await?;
            ctx.store.persist(&info.name)?;

            self.run.images_completed += 1;
            ctx.progress.advance();
        }

        self.transition(ctx, StageState::CleaningUp);
        self.clean_up()
    }

    /// Selected images present in the store, in selection order. Missing images
    /// are skipped but still count as completed units.
    fn resolve_inputs(&self, selection: &ImageSelection, ctx: &StageContext) -> Result<Vec<ImageInfo>> {
        let available = ctx.store.list_images()?;
        let mut images = Vec::with_capacity(selection.len());
        for name in selection.iter() {
            match available.iter().find(|info| info.name == name) {
                Some(info) => images.push(info.clone()),
                None => {
                    tracing::warn!("Image '{}' is not in the project, skipping {}", name, self.kind());
                    ctx.progress.advance();
                }
            }
        }
        Ok(images)
    }

    /// Work that must happen before the stage program starts.
    async fn prepare(&self, info: &ImageInfo, ctx: &StageContext) -> Result<()> {
        match self.kind() {
            StageKind::TissueDetect => {}
            StageKind::Classify => return self.discard_previous_report(info),
            _ => return Ok(()),
        }
        let base = &ctx.config.workspace.base_dir;
        let path = paths::lowres_image(base, &info.name, &ctx.config.tissue.image_extension);
        let region = RegionRequest::whole_image(info, f64::from(ctx.config.tissue.downsample));
        let store = Arc::clone(&ctx.store);
        let name = info.name.clone();

        tracing::info!("Exporting low resolution image of {}", info.name);
        blocking(move || {
            let pixels = store.read_region(&name, &region)?;
            write_image(&pixels, &path)
        })
        .await
    }

    /// Delete the report an earlier run left for `info`; only a report the
    /// classifier writes during this run may be applied.
    fn discard_previous_report(&self, info: &ImageInfo) -> Result<()> {
        let Some(report) = self.spec.artifact_path(&info.name) else {
            return Ok(());
        };
        match std::fs::remove_file(&report) {
            Ok(()) => {
                tracing::debug!("Removed previous report {}", report.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::io(&report, e)),
        }
    }

    fn progress_sink(&self, ctx: &StageContext) -> Option<ProgressSink> {
        if self.kind() != StageKind::DetectSubjects {
            return None;
        }
        let progress = Arc::clone(&ctx.progress);
        Some(Arc::new(move |fraction: f64| progress.advance_partial(fraction)))
    }

    async fn run_command(
        &self,
        runner: &ProcessRunner,
        image: Option<&ImageInfo>,
        hints: Option<ProgressSink>,
        ctx: &StageContext,
    ) -> Result<()> {
        let argv = self.spec.argv(image);
        match image {
            Some(info) => tracing::info!("Running {} for {}", self.kind(), info.name),
            None => tracing::info!("Running {} for all images", self.kind()),
        }

        let code = runner
            .run(&argv, ctx.config.tools.working_dir.as_deref(), hints)
            .await?;

        if code != 0 && ctx.config.processing.exit_code_policy == ExitCodePolicy::Strict {
            return Err(PipelineError::NonZeroExit {
                command: argv.first().cloned().unwrap_or_default(),
                code,
            });
        }
        Ok(())
    }

    async fn apply(&self, info: &ImageInfo, ctx: &StageContext) -> Result<()> {
        match self.kind() {
            StageKind::TissueDetect => self.apply_detections(info, &ctx.config.processing.tissue_class, ctx),
            StageKind::DetectSubjects => self.apply_detections(info, &ctx.config.export.subject_class, ctx),
            StageKind::Tile => self.write_tiles(info, ctx).await,
            StageKind::ExportAnnotations => self.export_annotations(info, ctx).await,
            StageKind::Classify => self.apply_classification(info, ctx),
        }
    }

    fn apply_detections(&self, info: &ImageInfo, default_class: &str, ctx: &StageContext) -> Result<()> {
        let Some(path) = self.spec.artifact_path(&info.name) else {
            return Ok(());
        };
        let detected = read_feature_collection(&path, Some(default_class))?;
        ctx.cancel.checkpoint()?;

        let count = detected.len();
        ctx.store.add_annotations(&info.name, detected)?;
        tracing::info!("Added {} detected objects to {}", count, info.name);
        Ok(())
    }

    /// Cut the image into overlapping tiles, keep those touching tissue, then
    /// drop the tissue placeholders.
    async fn write_tiles(&self, info: &ImageInfo, ctx: &StageContext) -> Result<()> {
        let tiling = &ctx.config.tiling;
        let tissue_class = &ctx.config.processing.tissue_class;
        let tissue: Vec<Bounds> = ctx
            .store
            .read_annotations(&info.name)?
            .iter()
            .filter(|a| a.has_class(tissue_class))
            .filter_map(|a| a.geometry.bounds())
            .collect();

        let out_dir = paths::tiles_dir(&ctx.config.workspace.base_dir, &info.name);
        std::fs::create_dir_all(&out_dir).map_err(|e| PipelineError::io(&out_dir, e))?;
        tracing::info!(
            "Tiling {} [size={},overlap={}]",
            info.name,
            tiling.tile_size,
            tiling.overlap
        );

        let mut written = 0usize;
        for (x, y, w, h) in tile_grid(info.width, info.height, tiling.tile_size, tiling.overlap) {
            ctx.cancel.checkpoint()?;
            let bounds = Bounds {
                x: f64::from(x),
                y: f64::from(y),
                width: f64::from(w),
                height: f64::from(h),
            };
            if !tissue.iter().any(|t| t.intersects(&bounds)) {
                continue;
            }

            let region = RegionRequest {
                x: i64::from(x),
                y: i64::from(y),
                width: w,
                height: h,
                downsample: tiling.downsample,
            };
            let path = out_dir.join(paths::tile_filename(&info.name, x, y, w, h, &tiling.image_extension));
            let store = Arc::clone(&ctx.store);
            let name = info.name.clone();
            blocking(move || {
                let pixels = store.read_region(&name, &region)?;
                write_image(&pixels, &path)
            })
            .await?;
            written += 1;
        }
        tracing::info!("Tiling of {} finished: {} tiles in {}", info.name, written, out_dir.display());

        let removed = ctx.store.remove_annotations_with_class(&info.name, tissue_class)?;
        tracing::debug!("Removed {} '{}' annotations from {}", removed, tissue_class, info.name);
        Ok(())
    }

    /// Write one padded crop per subject annotation. An image without subjects
    /// gets no output folder.
    async fn export_annotations(&self, info: &ImageInfo, ctx: &StageContext) -> Result<()> {
        let export = &ctx.config.export;
        let subjects: Vec<_> = ctx
            .store
            .read_annotations(&info.name)?
            .into_iter()
            .filter(|a| a.has_class(&export.subject_class))
            .collect();

        if subjects.is_empty() {
            tracing::info!("No '{}' annotations in {}, nothing to export", export.subject_class, info.name);
            return Ok(());
        }

        let out_dir = paths::export_dir(&ctx.config.workspace.base_dir, &info.name);
        std::fs::create_dir_all(&out_dir).map_err(|e| PipelineError::io(&out_dir, e))?;
        tracing::info!("Exporting {} annotations for {}", subjects.len(), info.name);

        for annotation in subjects {
            ctx.cancel.checkpoint()?;
            let Some(bounds) = annotation.geometry.bounds() else {
                tracing::warn!("Annotation {} has an empty geometry, skipping", annotation.id);
                continue;
            };
            let region = RegionRequest::padded(&bounds, export.padding, export.downsample);
            let filename = paths::export_filename(
                &info.name,
                &export.subject_class,
                &annotation.id,
                region.x,
                region.y,
                region.width,
                region.height,
            );
            let path = out_dir.join(filename);
            let store = Arc::clone(&ctx.store);
            let name = info.name.clone();
            blocking(move || {
                let pixels = store.read_region(&name, &region)?;
                write_image(&pixels, &path)
            })
            .await?;
        }
        Ok(())
    }

    fn apply_classification(&self, info: &ImageInfo, ctx: &StageContext) -> Result<()> {
        let Some(report) = self.spec.artifact_path(&info.name) else {
            return Ok(());
        };
        let base = &ctx.config.workspace.base_dir;
        if !report.exists() && !paths::export_dir(base, &info.name).exists() {
            tracing::info!("No exported annotations for {}, nothing to classify", info.name);
            return Ok(());
        }

        let rows = read_report(&report)?;
        let marker = &ctx.config.export.subject_class;
        tracing::info!("Updating annotations of {} from {} report rows", info.name, rows.len());

        for row in rows {
            ctx.cancel.checkpoint()?;
            let Some(id) = annotation_id_from_filename(&row.filename, marker) else {
                tracing::warn!("No annotation id in report filename '{}'", row.filename);
                continue;
            };
            if !ctx
                .store
                .set_class(&info.name, id, &row.predicted_class, row.predicted_probability())?
            {
                tracing::debug!("Annotation {} no longer exists in {}", id, info.name);
                continue;
            }
            ctx.store.set_measurements(&info.name, id, row.measurements())?;
            tracing::debug!("Annotation {} classified as {}", id, row.predicted_class);
        }
        Ok(())
    }

    fn clean_up(&self) -> Result<()> {
        for folder in &self.spec.owned_temp {
            let path = paths::temp_folder(self.spec.base_dir(), folder);
            if path.exists() {
                std::fs::remove_dir_all(&path).map_err(|e| PipelineError::io(&path, e))?;
                tracing::debug!("Removed {}", path.display());
            }
        }
        Ok(())
    }

    fn transition(&mut self, ctx: &StageContext, state: StageState) {
        if self.run.state == state {
            return;
        }
        tracing::debug!("{}: {:?} -> {:?}", self.kind(), self.run.state, state);
        self.run.state = state;
        if let Some(observer) = &ctx.observer {
            observer(&self.run);
        }
    }
}

/// Top-left corner and size of every tile covering a `width` x `height` image.
fn tile_grid(width: u32, height: u32, tile_size: u32, overlap: u32) -> Vec<(u32, u32, u32, u32)> {
    let step = tile_size.saturating_sub(overlap).max(1) as usize;
    let mut tiles = Vec::new();
    for y in (0..height).step_by(step) {
        for x in (0..width).step_by(step) {
            tiles.push((x, y, tile_size.min(width - x), tile_size.min(height - y)));
        }
    }
    tiles
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Store(format!("raster task failed: {e}")))?
}

fn write_image(pixels: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    pixels
        .save(path)
        .map_err(|e| PipelineError::Store(format!("cannot write {}: {e}", path.display())))
}
