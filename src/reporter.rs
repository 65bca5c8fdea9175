use deep_index::ProgressReporter;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_chars(TICK_CHARS));
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Spinner per root for `index`, one long-lived spinner for `crawl`.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.bar.lock();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    pub fn finish(&self) {
        if let Some(pb) = self.bar.lock().take() {
            pb.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_root_start(&self, path: &str) {
        self.set_bar(spinner(format!("Indexing {}", path)));
    }

    fn on_root_complete(&self, path: &str, dispatched: usize, disabled: usize) {
        self.finish();
        eprintln!(
            "  \x1b[32m✓\x1b[0m {}: {} entries visited, {} unreadable",
            path, dispatched, disabled
        );
    }

    fn on_index_complete(&self, dispatched: usize, duration_secs: f64) {
        self.finish();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Index complete: {} entries in {:.2}s",
            dispatched, duration_secs
        );
    }

    fn on_crawl_tick(&self, pending_listings: usize, pending_updates: usize) {
        let mut guard = self.bar.lock();
        let message = format!(
            "Crawling... {} listings queued, {} writes queued",
            pending_listings, pending_updates
        );
        match guard.as_ref() {
            Some(pb) => pb.set_message(message),
            None => *guard = Some(spinner(message)),
        }
    }
}
