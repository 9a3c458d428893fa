//! Pipeline orchestration: stages, progress and the single-worker queue.

mod orchestrator;
pub mod paths;
mod progress;
mod reporter;
mod results;
mod stages;

pub use orchestrator::{Flow, PipelineOrchestrator, PipelineStatus, RunOutcome};
pub use progress::{ProgressSnapshot, ProgressTracker, DONE_THRESHOLD, HOLD_THRESHOLD, HOLD_VALUE};
pub use reporter::{print_results, print_summary, StatusReporter};
pub use results::{collect_results, ImageResult, RESULT_CLASSES};
pub use stages::{
    ImageSelection, PipelineStage, StageContext, StageKind, StageObserver, StageRun, StageSpec,
    StageState,
};
