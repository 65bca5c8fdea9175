use crate::cancel::WorkerContext;
use crate::config::{self, AppConfig};
use crate::error::{Error, Result};
use crate::lister::directory;
use crate::lock::Priority;
use crate::model::{folder_path, EntryType};
use crate::progress::ProgressReporter;
use crate::queue::{LazyQueue, UpdateQueue};
use crate::reconciler::Dispatcher;
use crate::scheduler::{IdleProbe, Scheduler};
use crate::storage::{shared, Database, DirectWriter, IndexStats, SharedDb};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
pub struct IndexResult {
    pub duration: Duration,
    pub roots: usize,
    pub dispatched: usize,
    pub disabled: usize,
}

struct Background {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    insertable: Arc<LazyQueue>,
    maintenance: Arc<LazyQueue>,
}

/// Owns the database, the single writer and, once started, the background
/// scheduler thread.
pub struct Indexer {
    config: AppConfig,
    db: SharedDb,
    updates: Arc<UpdateQueue>,
    background: Option<Background>,
    closed: bool,
}

impl Indexer {
    pub fn open(config: AppConfig) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        Self::with_database(config, db)
    }

    pub fn with_database(config: AppConfig, db: Database) -> Result<Self> {
        let db = shared(db);
        let updates = UpdateQueue::start(Arc::clone(&db))?;
        info!(
            "Index opened, archive names decoded as {} ({})",
            config.legacy_encoding,
            config.archive_extensions.join(", ")
        );
        Ok(Self {
            config,
            db,
            updates,
            background: None,
            closed: false,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    /// Register a live folder as a root. Re-adding an existing root returns
    /// its id; a folder nested in (or containing) another root is refused.
    pub fn add_root(&self, path: &Path) -> Result<i64> {
        let path = path.canonicalize()?;
        let root_path = folder_path(&path);
        let live = directory::stat(&root_path)?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", root_path),
            ))
        })?;
        if live.entry_type != EntryType::Folder {
            return Err(Error::Other(format!("{} is not a folder", root_path)));
        }

        let db = self.db.lock_high();
        let existing: Vec<String> = db.roots()?.into_iter().map(|r| r.entry.path).collect();
        if !existing.contains(&root_path) {
            let mut candidates = existing.clone();
            candidates.push(root_path.clone());
            let kept = config::non_overlapping_directories(candidates);
            if kept.len() != existing.len() + 1 {
                return Err(Error::Other(format!(
                    "{} overlaps an existing root",
                    root_path
                )));
            }
        }
        let mut entry = live;
        entry.path = root_path;
        let id = db.insert_root(&entry)?;
        info!("Root {} registered as {}", entry.path, id);
        Ok(id)
    }

    /// Register every configured root, logging the ones that cannot be added.
    pub fn add_configured_roots(&self) -> Vec<i64> {
        let mut ids = Vec::new();
        for root in config::non_overlapping_directories(self.config.root_paths.clone()) {
            match self.add_root(Path::new(&root)) {
                Ok(id) => ids.push(id),
                Err(e) => warn!("Skipping root {}: {}", root, e),
            }
        }
        ids
    }

    /// Run `f` with the database at high priority, ahead of any queued
    /// background registrant.
    pub fn foreground<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Database) -> R,
    {
        let db = self.db.lock_high();
        f(&db)
    }

    /// Full foreground pass over every root, to completion.
    pub fn index_now(&self, reporter: &dyn ProgressReporter) -> Result<IndexResult> {
        let start = Instant::now();
        let roots = self.foreground(|db| db.roots())?;
        reporter.on_index_start(roots.len());
        info!("Indexing {} root(s)", roots.len());

        let writer = Arc::new(DirectWriter::new(Arc::clone(&self.db), Priority::High));
        let dispatcher = Dispatcher::new(Arc::clone(&self.db), writer, &self.config);
        let ctx = WorkerContext::foreground();

        let mut result = IndexResult {
            roots: roots.len(),
            ..Default::default()
        };
        for root in &roots {
            reporter.on_root_start(root.path());
            let root_start = Instant::now();
            let summary = dispatcher.crawl_once(&ctx, root.id)?;
            debug!(
                "Root {} crawled in {:.2}s: {} dispatched, {} disabled",
                root.path(),
                root_start.elapsed().as_secs_f64(),
                summary.dispatched,
                summary.disabled
            );
            reporter.on_root_complete(root.path(), summary.dispatched, summary.disabled);
            result.dispatched += summary.dispatched;
            result.disabled += summary.disabled;
        }

        result.duration = start.elapsed();
        reporter.on_index_complete(result.dispatched, result.duration.as_secs_f64());
        info!(
            "Index completed in {:.2}s, {} entries visited",
            result.duration.as_secs_f64(),
            result.dispatched
        );
        Ok(result)
    }

    /// Start the background scheduler thread. A second call is a no-op.
    pub fn start(&mut self, probe: Arc<dyn IdleProbe>) -> Result<()> {
        if self.closed {
            return Err(Error::QueueClosed);
        }
        if self.background.is_some() {
            return Ok(());
        }
        let mut scheduler = Scheduler::new(
            Arc::clone(&self.db),
            self.config.clone(),
            Arc::clone(&self.updates),
            probe,
        );
        let insertable = Arc::clone(&scheduler.env().insertable);
        let maintenance = Arc::clone(&scheduler.env().maintenance);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || {
                scheduler.run_until(&flag);
                scheduler.shutdown();
            })?;
        self.background = Some(Background {
            stop,
            handle,
            insertable,
            maintenance,
        });
        info!("Background crawl started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.background.is_some()
    }

    /// Queued listing jobs and queued writes.
    pub fn pending(&self) -> (usize, usize) {
        let listings = self
            .background
            .as_ref()
            .map_or(0, |bg| bg.insertable.len() + bg.maintenance.len());
        (listings, self.updates.len())
    }

    pub fn stats(&self) -> Result<IndexStats> {
        Ok(self.foreground(|db| db.stats())?)
    }

    /// Stop the scheduler, close the worker pools and the writer.
    pub fn shutdown(&mut self) {
        if let Some(bg) = self.background.take() {
            bg.stop.store(true, Ordering::SeqCst);
            bg.insertable.close();
            bg.maintenance.close();
            if bg.handle.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
        if !self.closed {
            self.updates.close();
            self.closed = true;
            info!("Indexer shut down");
        }
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
