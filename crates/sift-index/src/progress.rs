//! Live progress of running refreshes.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStage {
    Listing,
    Indexing,
    Removing,
    Linking,
}

impl RefreshStage {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Indexing,
            2 => Self::Removing,
            3 => Self::Linking,
            _ => Self::Listing,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Listing => 0,
            Self::Indexing => 1,
            Self::Removing => 2,
            Self::Linking => 3,
        }
    }
}

/// Point-in-time view of a running refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshProgress {
    pub stage: RefreshStage,
    pub processed_files: usize,
    pub total_files: usize,
    /// `processed_files / total_files`, `0.0` before the file set is known.
    pub progress: f64,
    pub message: String,
}

/// Counters shared between a refresh and status readers.
#[derive(Debug, Default)]
pub(crate) struct ProgressTracker {
    stage: AtomicU8,
    total: AtomicUsize,
    processed: AtomicUsize,
}

impl ProgressTracker {
    pub(crate) fn start(&self, total: usize) {
        self.processed.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        self.set_stage(RefreshStage::Indexing);
    }

    pub(crate) fn set_stage(&self, stage: RefreshStage) {
        self.stage.store(stage.as_u8(), Ordering::Relaxed);
    }

    /// Count one finished file and return how many are done.
    pub(crate) fn file_done(&self) -> usize {
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether `done` crosses a tenth of the total and deserves a log line.
    pub(crate) fn is_milestone(&self, done: usize) -> bool {
        let total = self.total.load(Ordering::Relaxed);
        let step = (total / 10).max(1);
        done == total || done % step == 0
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn snapshot(&self) -> RefreshProgress {
        let stage = RefreshStage::from_u8(self.stage.load(Ordering::Relaxed));
        let total = self.total.load(Ordering::Relaxed);
        let processed = self.processed.load(Ordering::Relaxed).min(total);
        let progress = if total == 0 {
            0.0
        } else {
            processed as f64 / total as f64
        };
        let message = match stage {
            RefreshStage::Listing => "listing files".to_owned(),
            RefreshStage::Indexing => format!("indexed {processed}/{total} files"),
            RefreshStage::Removing => "removing deleted files".to_owned(),
            RefreshStage::Linking => "resolving call edges".to_owned(),
        };
        RefreshProgress {
            stage,
            processed_files: processed,
            total_files: total,
            progress,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_is_listing() {
        let tracker = ProgressTracker::default();
        let progress = tracker.snapshot();
        assert_eq!(progress.stage, RefreshStage::Listing);
        assert_eq!(progress.total_files, 0);
        assert!(progress.progress.abs() < f64::EPSILON);
    }

    #[test]
    fn counts_files_and_reports_fraction() {
        let tracker = ProgressTracker::default();
        tracker.start(4);
        assert_eq!(tracker.file_done(), 1);
        assert_eq!(tracker.file_done(), 2);
        let progress = tracker.snapshot();
        assert_eq!(progress.stage, RefreshStage::Indexing);
        assert_eq!((progress.processed_files, progress.total_files), (2, 4));
        assert!((progress.progress - 0.5).abs() < f64::EPSILON);
        assert_eq!(progress.message, "indexed 2/4 files");

        tracker.set_stage(RefreshStage::Linking);
        assert_eq!(tracker.snapshot().stage, RefreshStage::Linking);
    }

    #[test]
    fn milestones_every_tenth() {
        let tracker = ProgressTracker::default();
        tracker.start(100);
        assert!(!tracker.is_milestone(5));
        assert!(tracker.is_milestone(10));
        assert!(tracker.is_milestone(100));

        tracker.start(3);
        assert!(tracker.is_milestone(1));
        assert!(tracker.is_milestone(3));
    }
}
