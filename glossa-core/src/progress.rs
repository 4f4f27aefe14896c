use std::time::Duration;

use hf_hub::api::tokio::Progress;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;

static PROGRESS_BAR: Lazy<MultiProgress> = Lazy::new(MultiProgress::new);

pub fn progress_bar(filename: &str) -> ProgressBar {
    let pb = PROGRESS_BAR.add(ProgressBar::new_spinner());
    pb.enable_steady_tick(Duration::from_millis(120));
    if let Ok(style) = ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
    ) {
        pb.set_style(style);
    }
    pb.set_message(filename.to_string());
    pb
}

/// Drives a progress bar from hub download callbacks.
#[derive(Clone)]
pub struct Reporter {
    pb: ProgressBar,
    filename: String,
}

impl Reporter {
    pub fn new(filename: &str) -> Self {
        Self {
            pb: progress_bar(filename),
            filename: filename.to_string(),
        }
    }

    /// Removes the bar of a download that never completed.
    pub fn clear(&self) {
        self.pb.finish_and_clear();
    }
}

impl Progress for Reporter {
    async fn init(&mut self, size: usize, filename: &str) {
        self.filename = filename.to_string();
        self.pb.set_length(size as u64);
        self.pb.set_position(0);
        tracing::debug!(filename = %self.filename, size, "download started");
    }

    async fn update(&mut self, size: usize) {
        self.pb.inc(size as u64);
    }

    async fn finish(&mut self) {
        self.pb.finish_and_clear();
        tracing::debug!(filename = %self.filename, "download finished");
    }
}
