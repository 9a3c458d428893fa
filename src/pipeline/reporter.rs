//! Periodic status reporting for command-line runs.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

use crate::pipeline::orchestrator::{PipelineStatus, RunOutcome};
use crate::pipeline::results::ImageResult;

/// Logs the orchestrator status on a fixed interval and on stage changes.
pub struct StatusReporter {
    status: watch::Receiver<PipelineStatus>,
    interval_secs: u64,
}

impl StatusReporter {
    pub fn new(status: watch::Receiver<PipelineStatus>, interval_secs: u64) -> Self {
        Self {
            status,
            interval_secs: interval_secs.max(1),
        }
    }

    /// Report until `shutdown` fires or the orchestrator goes away.
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        let mut last_label: Option<String> = None;

        loop {
            let event = tokio::select! {
                _ = ticker.tick() => Event::Tick,
                changed = self.status.changed() => Event::Changed(changed.is_ok()),
                _ = shutdown.recv() => Event::Shutdown,
            };

            match event {
                Event::Tick => {
                    let status = self.status.borrow().clone();
                    if status.running {
                        tracing::info!("{}", status);
                    }
                }
                Event::Changed(false) => break,
                Event::Changed(true) => {
                    let label = self.status.borrow_and_update().stage_label.clone();
                    if let Some(text) = label.as_ref().filter(|_| label != last_label) {
                        tracing::info!("{}", text);
                    }
                    last_label = label;
                }
                Event::Shutdown => {
                    let status = self.status.borrow().clone();
                    tracing::info!("Final: {}", status);
                    break;
                }
            }
        }
    }
}

enum Event {
    Tick,
    Changed(bool),
    Shutdown,
}

/// Print a final summary of a run.
pub fn print_summary(status: &PipelineStatus) {
    println!("\n=== Pipeline Summary ===");
    if let Some(flow) = status.flow {
        println!("Flow: {:?} (run #{})", flow, status.invocation);
    }
    println!("Progress: {:.1}%", status.progress * 100.0);
    for run in &status.stages {
        println!(
            "  {:<22} {:<18} {} images",
            run.kind.to_string(),
            format!("{:?}", run.state),
            run.images_completed
        );
        if let Some(error) = &run.error {
            println!("    error: {}", error);
        }
    }
    match &status.outcome {
        Some(RunOutcome::Done) => println!("Outcome: done"),
        Some(RunOutcome::Cancelled) => println!("Outcome: cancelled"),
        Some(RunOutcome::Failed { stage, cause }) => println!("Outcome: {} failed: {}", stage, cause),
        None => println!("Outcome: not finished"),
    }
}

/// Print the per-image results table. Classes no image contains are left out.
pub fn print_results(results: &[ImageResult]) {
    println!("\n=== Results ===");
    for result in results {
        let most_predicted = if result.most_predicted.is_empty() {
            "-"
        } else {
            result.most_predicted.as_str()
        };
        println!("{:<32} {:>5} glomeruli  {}", result.image, result.glomeruli, most_predicted);
        for (class, count) in result.class_counts.iter().filter(|(_, count)| **count > 0) {
            println!("    {:<20} {}", class, count);
        }
    }
}

impl PipelineStatus {
    /// Save the status as pretty JSON.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Status saved to {}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_interval_is_at_least_one_second() {
        let (_tx, rx) = watch::channel(PipelineStatus::default());
        let reporter = StatusReporter::new(rx, 0);
        assert_eq!(reporter.interval_secs, 1);
    }

    #[test]
    fn test_save_status_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        let status = PipelineStatus {
            progress: 1.0,
            done: true,
            outcome: Some(RunOutcome::Done),
            ..Default::default()
        };
        status.save_to_file(path.to_str().unwrap()).unwrap();

        let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["done"], true);
        assert_eq!(saved["outcome"]["outcome"], "done");
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let (_tx, rx) = watch::channel(PipelineStatus::default());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(StatusReporter::new(rx, 60).run(shutdown_rx));
        shutdown_tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
