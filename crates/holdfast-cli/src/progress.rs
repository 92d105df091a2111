//! Progress reporting module with TTY detection.
//!
//! Provides a [`PipelineObserver`] implementation that shows a progress bar
//! over the nine reconciliation stages in TTY mode and falls back to plain
//! stderr lines otherwise.

use std::time::Instant;

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};

use holdfast::pipeline::PipelineObserver;
use holdfast_types::{PipelineStage, RunOutcome};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Reports pipeline stage progress, showing a progress bar in TTY mode and
/// falling back to simple text output when not in a TTY.
pub struct StageReporter {
    is_tty: bool,
    total_stages: usize,
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
}

impl StageReporter {
    pub fn new() -> Self {
        let is_tty = is_tty();
        let total_stages = PipelineStage::ORDER.len();
        let progress_bar = if is_tty {
            let pb = ProgressBar::new(total_stages as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self { is_tty, total_stages, progress_bar, start_time: Instant::now() }
    }

    /// Creates a reporter that always uses non-TTY mode, for the `--quiet`
    /// flag and for tests.
    pub fn silent() -> Self {
        Self { is_tty: false, total_stages: PipelineStage::ORDER.len(), progress_bar: None, start_time: Instant::now() }
    }

    fn index_of(stage: PipelineStage) -> usize {
        PipelineStage::ORDER.iter().position(|s| *s == stage).unwrap_or(0)
    }
}

impl Default for StageReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineObserver for StageReporter {
    fn stage_started(&mut self, stage: PipelineStage) {
        let index = Self::index_of(stage) + 1;
        let elapsed = self.start_time.elapsed();
        let msg = format!("[{}/{}] {stage:?}... ({elapsed:?})", index, self.total_stages);

        if self.is_tty {
            if let Some(pb) = &self.progress_bar {
                pb.set_message(msg);
                pb.set_position((index - 1) as u64);
            }
        } else {
            eprintln!("{msg}");
        }
    }

    fn stage_finished(&mut self, stage: PipelineStage, outcome: RunOutcome, detail: Option<&str>) {
        let suffix = detail.map(|d| format!(" ({d})")).unwrap_or_default();
        let line = format!("{stage:?}: {outcome:?}{suffix}");
        if self.is_tty {
            if let Some(pb) = &self.progress_bar {
                pb.inc(1);
            }
        } else {
            eprintln!("{line}");
        }
    }

    fn run_finished(&mut self, outcome: RunOutcome) {
        let elapsed = self.start_time.elapsed();
        let msg = format!("run finished: {outcome:?} ({elapsed:?})");
        if self.is_tty {
            if let Some(pb) = self.progress_bar.take() {
                pb.finish_with_message(msg);
            }
        } else {
            eprintln!("{msg}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_tty_returns_bool() {
        let result = is_tty();
        assert!(matches!(result, true | false));
    }

    #[test]
    fn silent_reporter_disables_tty() {
        let reporter = StageReporter::silent();
        assert!(!reporter.is_tty);
        assert!(reporter.progress_bar.is_none());
    }

    #[test]
    fn stage_started_does_not_panic_in_silent_mode() {
        let mut reporter = StageReporter::silent();
        reporter.stage_started(PipelineStage::AcquireLock);
        reporter.stage_finished(PipelineStage::AcquireLock, RunOutcome::Succeeded, Some("abc123"));
        reporter.run_finished(RunOutcome::Succeeded);
    }

    #[test]
    fn index_of_places_release_lock_last() {
        assert_eq!(StageReporter::index_of(PipelineStage::ReleaseLock), PipelineStage::ORDER.len() - 1);
    }
}
