//! Per-run bookkeeping: counters, abandoned tasks and batch summaries.

use crate::types::{DownloadResult, DownloadTask, FailureReason};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Success/skip/fail counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Tally {
    pub fn record(&mut self, result: &DownloadResult) {
        match result {
            DownloadResult::Success { .. } => self.success += 1,
            DownloadResult::Skipped => self.skipped += 1,
            DownloadResult::Failed(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &Tally) {
        self.success += other.success;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.success + self.skipped + self.failed
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "success: {}, skipped: {}, failed: {}",
            self.success, self.skipped, self.failed
        )
    }
}

/// A task together with the result it produced.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Position of the task in its batch.
    pub index: usize,
    pub task: DownloadTask,
    pub result: DownloadResult,
}

/// Outcome of one batch (one album, one listing page, one retry pass).
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub label: String,
    /// Ordered by task index, not completion order.
    pub reports: Vec<TaskReport>,
    pub tally: Tally,
}

impl BatchReport {
    pub(crate) fn new(label: impl Into<String>, mut reports: Vec<TaskReport>) -> Self {
        reports.sort_by_key(|r| r.index);
        let mut tally = Tally::default();
        for report in &reports {
            tally.record(&report.result);
        }
        Self {
            label: label.into(),
            reports,
            tally,
        }
    }

    /// Failed tasks and why they failed.
    pub fn failures(&self) -> impl Iterator<Item = (&DownloadTask, &FailureReason)> {
        self.reports
            .iter()
            .filter_map(|r| r.result.failure().map(|reason| (&r.task, reason)))
    }

    /// Nothing succeeded and something failed.
    pub fn is_total_failure(&self) -> bool {
        self.tally.success == 0 && self.tally.failed > 0
    }
}

/// Outcome of a whole task source.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub batches: Vec<BatchReport>,
    pub tally: Tally,
}

impl RunReport {
    pub(crate) fn new(batches: Vec<BatchReport>) -> Self {
        let mut tally = Tally::default();
        for batch in &batches {
            tally.merge(&batch.tally);
        }
        Self { batches, tally }
    }
}

/// A task that failed for a reason another pass could fix.
#[derive(Debug, Clone)]
pub struct Abandoned {
    pub task: DownloadTask,
    pub reason: FailureReason,
}

/// State shared by every batch of one run.
///
/// Counters are atomic and the abandoned list is mutex-guarded, so one
/// context can be handed to concurrently running batches.
#[derive(Debug, Default)]
pub struct RunContext {
    success: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    abandoned: Mutex<Vec<Abandoned>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, task: &DownloadTask, result: &DownloadResult) {
        match result {
            DownloadResult::Success { .. } => {
                self.success.fetch_add(1, Ordering::Relaxed);
            }
            DownloadResult::Skipped => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            DownloadResult::Failed(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if reason.is_retryable() {
                    self.lock_abandoned().push(Abandoned {
                        task: task.clone(),
                        reason: reason.clone(),
                    });
                }
            }
        }
    }

    /// Counts over every task executed with this context so far.
    pub fn tally(&self) -> Tally {
        Tally {
            success: self.success.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the retryable failures not yet retried.
    pub fn abandoned(&self) -> Vec<Abandoned> {
        self.lock_abandoned().clone()
    }

    /// Removes and returns the failed tasks, for a retry pass.
    pub fn take_abandoned(&self) -> Vec<Abandoned> {
        std::mem::take(&mut *self.lock_abandoned())
    }

    fn lock_abandoned(&self) -> MutexGuard<'_, Vec<Abandoned>> {
        self.abandoned.lock().unwrap_or_else(|e| e.into_inner())
    }
}
