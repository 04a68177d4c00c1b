use std::io::{self, Write};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use remux::{ProgressReporter, ProgressTask, ProgressUnit};

const BYTES_TEMPLATE: &str =
    "{msg:30} [{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const ITEMS_TEMPLATE: &str = "{msg:30} [{elapsed_precise}] {wide_bar} {pos}/{len}";

/// Terminal progress bars: the run's item bar plus one transient bar per digest or conversion
pub struct BarReporter {
    multi: MultiProgress,
}

impl BarReporter {
    /// Draw into `multi`, the same set of bars the log writer suspends
    pub fn with_multi(multi: MultiProgress) -> Self {
        Self { multi }
    }
}

/// Log sink that hides the bars while a record is written to stderr, then redraws them
pub struct SuspendingWriter {
    multi: MultiProgress,
}

impl SuspendingWriter {
    pub fn new(multi: MultiProgress) -> Self {
        Self { multi }
    }
}

impl Write for SuspendingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.multi.suspend(|| io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

fn style(unit: ProgressUnit) -> ProgressStyle {
    let template = match unit {
        ProgressUnit::Bytes => BYTES_TEMPLATE,
        ProgressUnit::Items => ITEMS_TEMPLATE,
    };
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl ProgressReporter for BarReporter {
    fn start(&self, label: &str, total: u64, unit: ProgressUnit) -> Box<dyn ProgressTask> {
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(style(unit));
        bar.set_message(label.to_string());
        Box::new(BarTask {
            bar,
            clear_on_finish: unit == ProgressUnit::Bytes,
        })
    }
}

struct BarTask {
    bar: ProgressBar,
    /// Per-file bars vanish when done; the run bar stays
    clear_on_finish: bool,
}

impl ProgressTask for BarTask {
    fn advance(&mut self, delta: u64) {
        self.bar.inc(delta);
    }

    fn finish(&mut self) {
        if self.bar.is_finished() {
            return;
        }
        if self.clear_on_finish {
            self.bar.finish_and_clear();
        } else {
            self.bar.finish();
        }
    }
}
