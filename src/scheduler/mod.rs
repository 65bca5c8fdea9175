//! The background crawl loop: three round-robin layers gated by queue
//! watermarks and by host idleness.

pub mod beacon;
pub mod consistency;
pub mod discovery;
pub mod layer;
pub mod maintenance;
pub mod watermark;

pub use beacon::{AlwaysIdle, Beacon, IdleProbe, ManualIdle};
pub use layer::{Layer, LayerStep, Phase};
pub use watermark::Watermark;

use crate::cancel::CancellationToken;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::queue::{update_job, LazyQueue, QueuedWriter, UpdatePriority, UpdateQueue};
use crate::reconciler::Dispatcher;
use crate::storage::{Database, LoggingWriter, SharedDb};
use discovery::{DiscoveryCycle, DiscoveryPhase};
use maintenance::{EqualityPhase, NoAccessFilesPhase, SizeCollisionPhase, TouchPhase};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Sleep between outer iterations when nothing could run.
const IDLE_POLL: Duration = Duration::from_millis(250);

// ── Environment ──

/// What phases see: storage, queues, and the backpressure gates.
pub struct SchedulerEnv {
    pub db: SharedDb,
    pub config: AppConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub insertable: Arc<LazyQueue>,
    pub maintenance: Arc<LazyQueue>,
    pub updates: Arc<UpdateQueue>,
    insertable_mark: Watermark,
    maintenance_mark: Watermark,
    update_mark: Watermark,
}

impl SchedulerEnv {
    /// Background dispatches write through the update queue without waiting.
    pub fn new(
        db: SharedDb,
        config: AppConfig,
        updates: Arc<UpdateQueue>,
        token: CancellationToken,
    ) -> Self {
        let writer = Arc::new(LoggingWriter::new(QueuedWriter::new(
            Arc::clone(&updates),
            UpdatePriority::Normal,
        )));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&db), writer, &config));
        let insertable = LazyQueue::new("insertable", config.crawl_threads, token.clone());
        let maintenance = LazyQueue::new("maintenance", config.crawl_threads, token);
        Self {
            insertable_mark: Watermark::new(config.insertable_watermarks),
            maintenance_mark: Watermark::new(config.maintenance_watermarks),
            update_mark: Watermark::new(config.update_watermarks),
            db,
            config,
            dispatcher,
            insertable,
            maintenance,
            updates,
        }
    }

    pub fn admits_insertable(&self) -> bool {
        self.insertable_mark.admits(self.insertable.len())
    }

    pub fn admits_maintenance(&self) -> bool {
        self.maintenance_mark.admits(self.maintenance.len())
    }

    pub fn admits_update(&self) -> bool {
        self.update_mark.admits(self.updates.len())
    }

    /// Run a set-based pass on the writer thread and wait for its row count.
    pub fn run_sql<F>(&self, name: &str, priority: UpdatePriority, pass: F) -> Result<usize>
    where
        F: FnOnce(&Database) -> rusqlite::Result<usize> + Send + 'static,
    {
        let changed = Arc::new(AtomicUsize::new(0));
        let out = Arc::clone(&changed);
        let start = Instant::now();
        self.updates.submit_and_wait(
            update_job(move |db| {
                out.store(pass(db)?, Ordering::SeqCst);
                Ok(())
            }),
            priority,
        )?;
        let changed = changed.load(Ordering::SeqCst);
        debug!("{}: {} rows in {:?}", name, changed, start.elapsed());
        Ok(changed)
    }

    /// Throw away queued work after a storage failure, then let the writer
    /// settle. Running jobs finish on their own.
    fn discard_queued(&self) -> usize {
        self.insertable.clear() + self.maintenance.clear() + self.updates.clear()
    }
}

// ── Scheduler ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStep {
    /// Phases that ran this iteration, across all layers.
    pub ran: usize,
    /// The host was busy; nothing ran.
    pub suspended: bool,
    /// Queued work was discarded after a storage failure.
    pub recovered: bool,
}

pub struct Scheduler {
    env: SchedulerEnv,
    layers: Vec<Layer>,
    beacon: Beacon,
}

impl Scheduler {
    pub fn new(
        db: SharedDb,
        config: AppConfig,
        updates: Arc<UpdateQueue>,
        probe: Arc<dyn IdleProbe>,
    ) -> Self {
        let token = CancellationToken::new();
        let beacon = Beacon::new(probe, config.idle_threshold(), token.clone());
        let max_repeats = config.max_phase_repeats;
        let env = SchedulerEnv::new(db, config, updates, token);

        let cycle = DiscoveryCycle::new();
        let layers = vec![
            Layer::new("discovery", DiscoveryPhase::all(&cycle), max_repeats),
            Layer::new(
                "maintenance",
                vec![
                    Box::new(SizeCollisionPhase),
                    Box::new(EqualityPhase::new()),
                    Box::new(NoAccessFilesPhase),
                    Box::new(TouchPhase::new()),
                ],
                max_repeats,
            ),
            Layer::new("consistency", consistency::phases(), max_repeats),
        ];
        Self { env, layers, beacon }
    }

    pub fn env(&self) -> &SchedulerEnv {
        &self.env
    }

    /// One outer iteration: a step of each layer, with the update queue
    /// drained in between.
    pub fn step(&mut self) -> SchedulerStep {
        let mut outcome = SchedulerStep::default();
        if !self.beacon.check() {
            outcome.suspended = true;
            return outcome;
        }

        for index in 0..self.layers.len() {
            let result = self.layers[index].step(&self.env);
            self.env.updates.wait_drained();
            match result {
                Ok(step) => {
                    if step.ran {
                        outcome.ran += 1;
                    }
                    if step.wrapped {
                        debug!("{} layer completed a round", self.layers[index].name());
                    }
                }
                Err(Error::Cancelled) => {
                    debug!("{} layer interrupted", self.layers[index].name());
                }
                Err(e) if e.is_storage() => {
                    error!(
                        "Storage failure in {} layer ({:?}): {}",
                        self.layers[index].name(),
                        self.layers[index].current_phase(),
                        e
                    );
                    self.recover();
                    outcome.recovered = true;
                    return outcome;
                }
                Err(e) => {
                    warn!(
                        "{} layer phase {:?} failed, skipping: {}",
                        self.layers[index].name(),
                        self.layers[index].current_phase(),
                        e
                    );
                    if let Err(e) = self.layers[index].skip(&self.env) {
                        warn!("Could not advance {} layer: {}", self.layers[index].name(), e);
                    }
                }
            }
        }

        let failures = self.env.updates.take_failures();
        if failures > 0 {
            error!("{} queued writes failed", failures);
            self.recover();
            outcome.recovered = true;
        }
        outcome
    }

    /// Drop queued work, try to clear orphans, wait for the writer.
    fn recover(&self) {
        let dropped = self.env.discard_queued();
        warn!("Recovering: {} queued jobs discarded", dropped);
        let limit = self.env.config.batch_size.max(1);
        match self.env.run_sql("cleanup-orphans", UpdatePriority::Normal, move |db| {
            db.cleanup_orphans(limit)
        }) {
            Ok(n) => debug!("Recovery removed {} orphans", n),
            Err(e) => warn!("Orphan cleanup during recovery failed: {}", e),
        }
        self.env.insertable.wait_idle();
        self.env.maintenance.wait_idle();
        self.env.updates.wait_drained();
    }

    /// Loop until `stop` is raised.
    pub fn run_until(&mut self, stop: &AtomicBool) {
        info!("Scheduler started");
        let mut iterations = 0u64;
        while !stop.load(Ordering::SeqCst) {
            let outcome = self.step();
            iterations += 1;
            let quiet = outcome.ran == 0
                && self.env.insertable.is_empty()
                && self.env.maintenance.is_empty();
            if outcome.suspended || quiet {
                thread::sleep(IDLE_POLL);
            }
        }
        info!("Scheduler stopped after {} iterations", iterations);
    }

    /// Close both work queues. The update queue belongs to the caller.
    pub fn shutdown(&self) {
        let dropped = self.env.insertable.close() + self.env.maintenance.close();
        debug!("Scheduler shut down, {} pending jobs dropped", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Watermarks;
    use crate::storage::shared;

    fn env_with(config: AppConfig) -> (SchedulerEnv, Arc<UpdateQueue>) {
        let db = shared(Database::open_in_memory().unwrap());
        let updates = UpdateQueue::start(Arc::clone(&db)).unwrap();
        let env = SchedulerEnv::new(db, config, Arc::clone(&updates), CancellationToken::new());
        (env, updates)
    }

    #[test]
    fn test_run_sql_returns_row_count() {
        let (env, updates) = env_with(AppConfig::default());
        let root = env
            .db
            .lock_high()
            .insert_root(&crate::model::Entry::folder("/r/", 1))
            .unwrap();
        env.db
            .lock_high()
            .update_status(root, crate::model::EntryStatus::Clean)
            .unwrap();
        let n = env
            .run_sql("force", UpdatePriority::Low, |db| db.force_folders_dirty())
            .unwrap();
        assert_eq!(n, 1);
        updates.close();
    }

    #[test]
    fn test_update_backpressure_gates_admission() {
        let mut config = AppConfig::default();
        config.update_watermarks = Watermarks::new(1, 2);
        let (env, updates) = env_with(config);

        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        updates
            .submit(
                update_job(move |_| {
                    gate_rx.recv_timeout(Duration::from_secs(5)).ok();
                    Ok(())
                }),
                UpdatePriority::Normal,
            )
            .unwrap();
        // Wait for the consumer to pick up the gate job.
        while !updates.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        for _ in 0..2 {
            updates.submit(update_job(|_| Ok(())), UpdatePriority::Low).unwrap();
        }
        assert!(!env.admits_update());
        gate_tx.send(()).unwrap();
        updates.wait_drained();
        assert!(env.admits_update());
        updates.close();
    }
}
