// ABOUTME: PollDriver - runs change detection cycles on a fixed interval
// ABOUTME: Observes a broadcast shutdown signal between and during cycles

use std::time::Duration;
use tokio::sync::broadcast;

use crate::detector::{ChangeDetector, CycleReport};
use crate::replica::ReplicaSink;
use crate::source::RowSource;

/// Drives a [`ChangeDetector`] forever, one cycle per poll interval.
///
/// A failed table never stops the loop; the next cycle starts after the same
/// interval whether or not the previous one succeeded.
pub struct PollDriver<S, W> {
    detector: ChangeDetector<S, W>,
    poll_interval: Duration,
}

impl<S: RowSource, W: ReplicaSink> PollDriver<S, W> {
    pub fn new(detector: ChangeDetector<S, W>, poll_interval: Duration) -> Self {
        Self {
            detector,
            poll_interval,
        }
    }

    pub fn detector(&self) -> &ChangeDetector<S, W> {
        &self.detector
    }

    pub fn into_detector(self) -> ChangeDetector<S, W> {
        self.detector
    }

    /// Initialize, then run a cycle immediately and one more after every
    /// poll interval until a shutdown signal arrives.
    ///
    /// A cycle in flight when shutdown is signalled is abandoned; its
    /// uncommitted replica transaction rolls back. Returns the number of
    /// completed cycles.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> u64 {
        tracing::info!(
            "Starting poll driver for {} table(s) with poll_interval={:?}",
            self.detector.monitored_tables().len(),
            self.poll_interval
        );

        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::info!("Shutdown signal received during initialization, stopping");
                return 0;
            }
            report = self.detector.initialize() => {
                if !report.is_success() {
                    tracing::warn!(
                        "{} table(s) failed to initialize; retrying on the next cycle",
                        report.errors.len()
                    );
                }
            }
        }

        let mut completed = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received during sync cycle, aborting");
                    break;
                }
                report = self.detector.detect_and_sync() => {
                    log_report(&report);
                    completed += 1;
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping poll driver");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        completed
    }

    /// Initialize, then run exactly `cycles` detection cycles.
    ///
    /// The poll interval is slept between cycles but not after the last one.
    pub async fn run_cycles(&mut self, cycles: usize) -> Vec<CycleReport> {
        self.detector.initialize().await;

        let mut reports = Vec::with_capacity(cycles);
        for i in 0..cycles {
            if i > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
            let report = self.detector.detect_and_sync().await;
            log_report(&report);
            reports.push(report);
        }
        reports
    }
}

fn log_report(report: &CycleReport) {
    if report.tables_changed > 0 {
        tracing::info!(
            "Sync cycle {} completed: {} tables checked, {} changed, {} rows in {}ms",
            report.cycle,
            report.tables_checked,
            report.tables_changed,
            report.rows_applied,
            report.duration_ms
        );
    } else {
        tracing::debug!(
            "Sync cycle {} completed: no changes in {} tables ({}ms)",
            report.cycle,
            report.tables_checked,
            report.duration_ms
        );
    }
    if !report.is_success() {
        tracing::warn!(
            "Sync cycle {} had {} error(s)",
            report.cycle,
            report.errors.len()
        );
    }
}
