//! Composes stages into flows and runs them on a single background worker.
//!
//! `run_*` calls only enqueue an invocation and return; the worker drains the
//! queue one invocation at a time and one stage at a time. Callers observe a
//! run by polling [`PipelineOrchestrator::status`] or by subscribing to the
//! status channel.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::pipeline::paths;
use crate::pipeline::progress::DONE_THRESHOLD;
use crate::pipeline::results::{collect_results, ImageResult};
use crate::pipeline::stages::{
    ImageSelection, PipelineStage, StageContext, StageKind, StageObserver, StageRun,
};
use crate::pipeline::ProgressTracker;
use crate::process::{CancelToken, LogSink};
use crate::store::AnnotationStore;

/// Named stage sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Full,
    DetectionOnly,
    ClassificationOnly,
}

impl Flow {
    pub fn stages(&self) -> &'static [StageKind] {
        match self {
            Flow::Full => &[
                StageKind::TissueDetect,
                StageKind::Tile,
                StageKind::DetectSubjects,
                StageKind::ExportAnnotations,
                StageKind::Classify,
            ],
            Flow::DetectionOnly => &[StageKind::TissueDetect, StageKind::Tile, StageKind::DetectSubjects],
            Flow::ClassificationOnly => &[StageKind::ExportAnnotations, StageKind::Classify],
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    Failed { stage: StageKind, cause: String },
    Cancelled,
}

/// Snapshot of what the orchestrator is doing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatus {
    /// Id of the invocation this snapshot describes (0 before the first run).
    pub invocation: u64,
    pub flow: Option<Flow>,
    /// An invocation is queued or active.
    pub running: bool,
    pub done: bool,
    pub progress: f64,
    /// Label of the active stage.
    pub stage_label: Option<String>,
    pub stages: Vec<StageRun>,
    pub outcome: Option<RunOutcome>,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:.1}%]", self.progress * 100.0)?;
        if let Some(label) = &self.stage_label {
            write!(f, " {}", label)?;
        }
        match &self.outcome {
            Some(RunOutcome::Done) => write!(f, " done"),
            Some(RunOutcome::Cancelled) => write!(f, " cancelled"),
            Some(RunOutcome::Failed { stage, cause }) => write!(f, " {} failed: {}", stage, cause),
            None if self.running => write!(f, " running"),
            None => write!(f, " idle"),
        }
    }
}

struct Invocation {
    id: u64,
    flow: Flow,
    selection: ImageSelection,
    stages: Vec<PipelineStage>,
    progress: Arc<ProgressTracker>,
    cancel: CancelToken,
}

struct Inner {
    config: Arc<Config>,
    store: Arc<dyn AnnotationStore>,
    log_sink: Option<LogSink>,
    queue: Mutex<VecDeque<Invocation>>,
    wakeup: Notify,
    /// False while a cancellation is being carried out.
    accepting: AtomicBool,
    closed: AtomicBool,
    cancel: Mutex<CancelToken>,
    current_progress: Mutex<Arc<ProgressTracker>>,
    status: watch::Sender<PipelineStatus>,
    next_id: AtomicU64,
}

/// Runs pipeline flows over image selections.
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineOrchestrator {
    /// Create the orchestrator and start its worker. Must be called within a
    /// Tokio runtime.
    pub fn new(config: Config, store: Arc<dyn AnnotationStore>) -> Self {
        Self::with_log_sink(config, store, None)
    }

    /// Like [`new`](Self::new), additionally forwarding every subprocess
    /// output line to `log_sink`.
    pub fn with_log_sink(config: Config, store: Arc<dyn AnnotationStore>, log_sink: Option<LogSink>) -> Self {
        let (status, _rx) = watch::channel(PipelineStatus::default());
        let inner = Arc::new(Inner {
            config: Arc::new(config),
            store,
            log_sink,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            accepting: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            cancel: Mutex::new(CancelToken::new()),
            current_progress: Mutex::new(ProgressTracker::new()),
            status,
            next_id: AtomicU64::new(1),
        });

        let worker = tokio::spawn(Arc::clone(&inner).work());
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Tissue detection, tiling, glomerulus detection, export and classification.
    pub fn run_full(&self, selection: ImageSelection) -> Result<u64> {
        self.enqueue(Flow::Full, selection)
    }

    /// Tissue detection, tiling and glomerulus detection.
    pub fn run_detection_only(&self, selection: ImageSelection) -> Result<u64> {
        self.enqueue(Flow::DetectionOnly, selection)
    }

    /// Export and classification. The images are expected to carry subject
    /// annotations already, see [`images_with_subjects`](Self::images_with_subjects).
    pub fn run_classification_only(&self, selection: ImageSelection) -> Result<u64> {
        self.enqueue(Flow::ClassificationOnly, selection)
    }

    /// Enqueue `flow` over `selection` and return the invocation id.
    pub fn run(&self, flow: Flow, selection: ImageSelection) -> Result<u64> {
        self.enqueue(flow, selection)
    }

    fn enqueue(&self, flow: Flow, selection: ImageSelection) -> Result<u64> {
        if selection.is_empty() {
            return Err(PipelineError::EmptySelection);
        }
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(PipelineError::Busy);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let stages = flow
            .stages()
            .iter()
            .map(|kind| PipelineStage::new(*kind, Arc::clone(&self.inner.config)))
            .collect();
        let invocation = Invocation {
            id,
            flow,
            selection,
            stages,
            progress: ProgressTracker::new(),
            cancel: lock(&self.inner.cancel).clone(),
        };

        tracing::info!(
            "Queued {:?} run #{} over {} images",
            flow,
            id,
            invocation.selection.len()
        );
        {
            let mut queue = lock(&self.inner.queue);
            queue.push_back(invocation);
            self.inner.status.send_modify(|s| s.running = true);
        }
        self.inner.wakeup.notify_one();
        Ok(id)
    }

    /// Stop the active run, drop queued runs, delete `<base>/Temp` and remove
    /// tissue placeholders from `selection`.
    ///
    /// Not transactional: a stage caught while applying results may leave a
    /// partially updated store. New runs are refused with `Busy` until this
    /// returns.
    pub async fn cancel(&self, selection: &ImageSelection) -> Result<()> {
        if self
            .inner
            .accepting
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Cancellation already in progress");
            return Ok(());
        }
        tracing::info!("Cancelling pipeline");

        lock(&self.inner.cancel).cancel();

        let dropped: Vec<Invocation> = lock(&self.inner.queue).drain(..).collect();
        for invocation in dropped {
            tracing::info!("Dropped queued run #{}", invocation.id);
        }

        self.wait_idle().await;

        let result = self.inner.clean_up_after_cancel(selection);

        *lock(&self.inner.cancel) = CancelToken::new();
        self.inner.accepting.store(true, Ordering::SeqCst);
        tracing::info!("Pipeline cancelled");
        result
    }

    /// Wait until nothing is queued or running and return the final status.
    pub async fn wait_idle(&self) -> PipelineStatus {
        let mut rx = self.inner.status.subscribe();
        let status = match rx.wait_for(|s| !s.running).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        status
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.inner.status.subscribe()
    }

    pub fn progress(&self) -> f64 {
        lock(&self.inner.current_progress).value()
    }

    pub fn is_running(&self) -> bool {
        self.inner.status.borrow().running
    }

    pub fn is_done(&self) -> bool {
        self.progress() >= DONE_THRESHOLD
    }

    /// Label of the stage currently executing.
    pub fn stage_label(&self) -> Option<String> {
        self.inner.status.borrow().stage_label.clone()
    }

    /// The images of `selection` that already carry subject annotations.
    pub fn images_with_subjects(&self, selection: &ImageSelection) -> Result<ImageSelection> {
        let subject = &self.inner.config.export.subject_class;
        let mut with_subjects = Vec::new();
        for name in selection.iter() {
            let annotations = self.inner.store.read_annotations(name)?;
            if annotations.iter().any(|a| a.has_class(subject)) {
                with_subjects.push(name.to_string());
            }
        }
        Ok(ImageSelection::new(with_subjects))
    }

    /// Per-image counts and most predicted classes for `selection`.
    pub fn results(&self, selection: &ImageSelection) -> Result<Vec<ImageResult>> {
        collect_results(
            self.inner.store.as_ref(),
            selection,
            &self.inner.config.export.subject_class,
        )
    }

    /// Cancel whatever is running and stop the worker.
    pub async fn shutdown(&self) {
        self.inner.close();
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!("Pipeline worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl Inner {
    async fn work(self: Arc<Self>) {
        tracing::debug!("Pipeline worker started");
        loop {
            let next = {
                let mut queue = lock(&self.queue);
                let next = queue.pop_front();
                if next.is_none() {
                    // Under the queue lock so a concurrent enqueue cannot be missed.
                    self.status.send_modify(|s| {
                        s.running = false;
                        s.stage_label = None;
                    });
                }
                next
            };
            match next {
                Some(invocation) => self.execute(invocation).await,
                None if self.closed.load(Ordering::SeqCst) => break,
                None => self.wakeup.notified().await,
            }
        }
        tracing::debug!("Pipeline worker stopped");
    }

    async fn execute(self: &Arc<Self>, invocation: Invocation) {
        let Invocation {
            id,
            flow,
            selection,
            mut stages,
            progress,
            cancel,
        } = invocation;

        progress.begin(stages.len(), selection.len());
        *lock(&self.current_progress) = Arc::clone(&progress);
        self.status.send_modify(|s| {
            *s = PipelineStatus {
                invocation: id,
                flow: Some(flow),
                running: true,
                done: false,
                progress: 0.0,
                stage_label: None,
                stages: stages.iter().map(|stage| stage.run().clone()).collect(),
                outcome: None,
            };
        });
        tracing::info!("Starting {:?} run #{} (step {:.6})", flow, id, progress.step_size());

        let forwarder = {
            let inner = Arc::clone(self);
            let mut rx = progress.subscribe();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let value = *rx.borrow_and_update();
                    inner.status.send_modify(|s| {
                        s.progress = value;
                        s.done = value >= DONE_THRESHOLD;
                    });
                }
            })
        };

        let observer: StageObserver = {
            let inner = Arc::clone(self);
            Arc::new(move |run: &StageRun| {
                inner.status.send_modify(|s| {
                    if let Some(slot) = s.stages.iter_mut().find(|r| r.kind == run.kind) {
                        *slot = run.clone();
                    }
                    if run.state.is_active() {
                        s.stage_label = Some(run.kind.label().to_string());
                    }
                });
            })
        };

        let ctx = StageContext {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            progress: Arc::clone(&progress),
            cancel,
            log_sink: self.log_sink.clone(),
            observer: Some(observer),
        };

        let mut outcome = RunOutcome::Done;
        for index in 0..stages.len() {
            if let Err(failure) = stages[index].execute(&selection, &ctx).await {
                outcome = if failure.error.is_cancelled() {
                    RunOutcome::Cancelled
                } else {
                    tracing::error!("Run #{} halted: {}", id, failure);
                    RunOutcome::Failed {
                        stage: failure.stage,
                        cause: failure.error.to_string(),
                    }
                };
                for stage in &mut stages[index + 1..] {
                    stage.cancel_pending();
                }
                break;
            }
        }

        forwarder.abort();
        let value = progress.value();
        tracing::info!("Run #{} finished: {:?} at {:.4}", id, outcome, value);
        self.status.send_modify(|s| {
            s.progress = value;
            s.done = value >= DONE_THRESHOLD;
            s.stage_label = None;
            s.stages = stages.iter().map(|stage| stage.run().clone()).collect();
            s.outcome = Some(outcome);
        });
    }

    /// Best-effort: every failure is logged, the first one is returned.
    fn clean_up_after_cancel(&self, selection: &ImageSelection) -> Result<()> {
        let mut first_error = None;

        let temp = paths::temp_root(&self.config.workspace.base_dir);
        if temp.exists() {
            match std::fs::remove_dir_all(&temp) {
                Ok(()) => tracing::info!("Removed {}", temp.display()),
                Err(e) => {
                    tracing::warn!("Failed to remove {}: {}", temp.display(), e);
                    first_error.get_or_insert(PipelineError::io(&temp, e));
                }
            }
        }

        let tissue_class = &self.config.processing.tissue_class;
        for name in selection.iter() {
            let removed = self
                .store
                .remove_annotations_with_class(name, tissue_class)
                .and_then(|removed| {
                    if removed > 0 {
                        self.store.persist(name)?;
                    }
                    Ok(removed)
                });
            match removed {
                Ok(0) => {}
                Ok(n) => tracing::info!("Removed {} '{}' annotations from {}", n, tissue_class, name),
                Err(e) => {
                    tracing::warn!("Failed to remove '{}' annotations from {}: {}", tissue_class, name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.cancel).cancel();
            lock(&self.queue).clear();
            self.wakeup.notify_one();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_stage_counts() {
        assert_eq!(Flow::Full.stages().len(), 5);
        assert_eq!(Flow::DetectionOnly.stages().len(), 3);
        assert_eq!(Flow::ClassificationOnly.stages(), &[StageKind::ExportAnnotations, StageKind::Classify]);
    }

    #[test]
    fn test_status_display() {
        let status = PipelineStatus {
            running: true,
            progress: 0.4,
            stage_label: Some(StageKind::Tile.label().to_string()),
            ..Default::default()
        };
        let display = status.to_string();
        assert!(display.contains("40.0%"));
        assert!(display.contains("Tiling images..."));
        assert!(display.contains("running"));

        let failed = PipelineStatus {
            outcome: Some(RunOutcome::Failed {
                stage: StageKind::Classify,
                cause: "missing report".to_string(),
            }),
            ..Default::default()
        };
        assert!(failed.to_string().contains("classification failed: missing report"));
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(RunOutcome::Failed {
            stage: StageKind::DetectSubjects,
            cause: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["stage"], "detect_subjects");
    }
}
