/// Trait for reporting indexing progress.
///
/// The CLI implements it with indicatif. All methods have default no-op
/// implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_index_start(&self, _roots: usize) {}
    fn on_root_start(&self, _path: &str) {}
    fn on_root_complete(&self, _path: &str, _dispatched: usize, _disabled: usize) {}
    fn on_index_complete(&self, _dispatched: usize, _duration_secs: f64) {}
    fn on_crawl_tick(&self, _pending_listings: usize, _pending_updates: usize) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
