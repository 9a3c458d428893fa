//! GDCnn Pipeline
//!
//! Drives the external glomerulus detection and classification programs over
//! the images of a project and folds their file-based results back into the
//! project's annotations.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Process**: shell-wrapped subprocess execution with streamed output,
//!   progress hints and cooperative cancellation
//! - **Pipeline**: the five stages, the progress tracker and the
//!   single-worker orchestrator
//! - **Artifacts**: readers for the GeoJSON and CSV files the programs write
//! - **Store**: the annotation store interface and a file-backed project
//!
//! # Usage
//!
//! ```no_run
//! use gdcnn_pipeline::{run_flow, Config, Flow};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"pipeline.yaml".into())?;
//!     let status = run_flow(config, Flow::Full, Vec::new()).await?;
//!     println!("{}", status);
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod store;

pub use config::{Config, ExitCodePolicy};
pub use error::{PipelineError, StageFailure};
pub use pipeline::{
    Flow, ImageResult, ImageSelection, PipelineOrchestrator, PipelineStatus, ProgressTracker, RunOutcome,
    StageKind, StageState,
};
pub use process::{CancelToken, ProcessRunner};
pub use store::{AnnotationStore, ProjectStore};

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Run one flow over `images` (all project images when empty) to completion.
///
/// Ctrl-C cancels the run. The final status is returned whatever the outcome;
/// only setup problems are errors.
pub async fn run_flow(config: Config, flow: Flow, images: Vec<String>) -> Result<PipelineStatus> {
    config.validate()?;

    tracing::info!("Starting GDCnn pipeline ({:?})", flow);
    let store = Arc::new(ProjectStore::open(
        &config.workspace.base_dir,
        &config.workspace.project_file,
    )?);

    let selection = if images.is_empty() {
        store.list_images()?.into_iter().map(|info| info.name).collect()
    } else {
        ImageSelection::new(images)
    };
    if selection.is_empty() {
        anyhow::bail!("No images to process");
    }

    let report_interval = config.processing.report_interval_secs;
    let status_output_path = config.processing.status_output_path.clone();
    let orchestrator = PipelineOrchestrator::new(config, store);

    let selection = if flow == Flow::ClassificationOnly {
        let with_subjects = orchestrator.images_with_subjects(&selection)?;
        for name in selection.iter().filter(|name| !with_subjects.contains(name)) {
            tracing::warn!("{} has no glomerulus annotations, run detection first", name);
        }
        if with_subjects.is_empty() {
            anyhow::bail!("None of the selected images has glomerulus annotations");
        }
        with_subjects
    } else {
        selection
    };

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter = tokio::spawn(
        pipeline::StatusReporter::new(orchestrator.subscribe(), report_interval).run(shutdown_rx),
    );

    orchestrator.run(flow, selection.clone())?;

    let status = tokio::select! {
        status = orchestrator.wait_idle() => status,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling pipeline");
            if let Err(e) = orchestrator.cancel(&selection).await {
                tracing::warn!("Cleanup after cancel was incomplete: {}", e);
            }
            orchestrator.wait_idle().await
        }
    };

    let _ = shutdown_tx.send(()).await;
    let _ = reporter.await;
    orchestrator.shutdown().await;

    pipeline::print_summary(&status);
    if let Some(path) = status_output_path {
        if let Err(e) = status.save_to_file(&path) {
            tracing::warn!("Failed to save status to {}: {}", path, e);
        }
    }

    Ok(status)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
