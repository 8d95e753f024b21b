//! Terminal progress display.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use studydeck_core::ProgressReporter;
use studydeck_shared::TaskId;

/// Spinner-based progress reporter.
pub(crate) struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} [{elapsed}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    pub(crate) fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl Drop for CliProgress {
    fn drop(&mut self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn progress(&self, message: &str, percent: u8) {
        self.spinner.set_message(format!("{percent:>3}% {message}"));
    }

    fn task_started(&self, _task_id: &TaskId, estimated_seconds: f64) {
        self.spinner
            .println(format!("  Estimated time: about {}", human_duration(estimated_seconds)));
    }

    fn advisory(&self, message: &str) {
        self.spinner.println(format!("  Note: {message}"));
    }
}

fn human_duration(secs: f64) -> String {
    let secs = secs.round().max(1.0) as u64;
    match secs {
        0..60 => format!("{secs}s"),
        _ => format!("{}m {:02}s", secs / 60, secs % 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_rounded() {
        assert_eq!(human_duration(0.2), "1s");
        assert_eq!(human_duration(42.4), "42s");
        assert_eq!(human_duration(125.0), "2m 05s");
    }
}
