//! Progress reporting side channel.
//!
//! Digesting and conversion report how far they got through a [`ProgressTask`]. Nothing
//! reported here feeds back into the pipeline's results.

use humansize::{format_size, DECIMAL};
use log::debug;

/// What a task's position and total are counted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    Bytes,
    Items,
}

/// Factory for progress tasks, one per digest/conversion/run
pub trait ProgressReporter: Send + Sync {
    fn start(&self, label: &str, total: u64, unit: ProgressUnit) -> Box<dyn ProgressTask>;
}

/// A single tracked unit of work
pub trait ProgressTask: Send {
    /// Record `delta` more units of work done
    fn advance(&mut self, delta: u64);
    /// Mark the task finished
    fn finish(&mut self);
}

/// Reporter that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn start(&self, _label: &str, _total: u64, _unit: ProgressUnit) -> Box<dyn ProgressTask> {
        Box::new(NoProgress)
    }
}

impl ProgressTask for NoProgress {
    fn advance(&mut self, _delta: u64) {}
    fn finish(&mut self) {}
}

/// Reporter that writes start/finish lines to the debug log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn start(&self, label: &str, total: u64, unit: ProgressUnit) -> Box<dyn ProgressTask> {
        debug!("{}: started ({})", label, describe(total, unit));
        Box::new(LogTask {
            label: label.to_string(),
            unit,
            position: 0,
            finished: false,
        })
    }
}

struct LogTask {
    label: String,
    unit: ProgressUnit,
    position: u64,
    finished: bool,
}

impl ProgressTask for LogTask {
    fn advance(&mut self, delta: u64) {
        self.position = self.position.saturating_add(delta);
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            debug!("{}: finished ({})", self.label, describe(self.position, self.unit));
        }
    }
}

fn describe(amount: u64, unit: ProgressUnit) -> String {
    match unit {
        ProgressUnit::Bytes => format_size(amount, DECIMAL),
        ProgressUnit::Items => format!("{} items", amount),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_units() {
        assert_eq!(describe(3, ProgressUnit::Items), "3 items");
        assert!(describe(2_000, ProgressUnit::Bytes).contains("kB"));
    }

    #[test]
    fn test_log_task_accumulates_and_finishes_once() {
        let mut task = LogProgress.start("md5 clip.mp4", 10, ProgressUnit::Bytes);
        task.advance(4);
        task.advance(6);
        task.finish();
        task.finish();
    }
}
