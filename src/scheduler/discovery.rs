//! Layer 1: find entries whose listing is missing or stale and hand them to
//! the insertable queue.

use super::layer::Phase;
use super::SchedulerEnv;
use crate::error::Result;
use crate::queue::{job, UpdatePriority};
use crate::reconciler::DispatchOptions;
use crate::storage::DiscoveryQuery;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub const DISCOVERY_QUERIES: [DiscoveryQuery; 6] = [
    DiscoveryQuery::FoldersWithChildren,
    DiscoveryQuery::FoldersWithoutChildren,
    DiscoveryQuery::ArchivesWithChildren,
    DiscoveryQuery::FilesWithoutChildren,
    DiscoveryQuery::NoAccessFoldersWithChildren,
    DiscoveryQuery::NoAccessFoldersWithoutChildren,
];

/// Roots each query has run dry on during the current round.
#[derive(Debug)]
pub struct DiscoveryCycle {
    exhausted: HashMap<DiscoveryQuery, HashSet<i64>>,
    last_full_relist: Instant,
}

impl DiscoveryCycle {
    pub fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            exhausted: HashMap::new(),
            last_full_relist: Instant::now(),
        }))
    }

    fn exhausted_roots(&self, query: DiscoveryQuery) -> Vec<i64> {
        self.exhausted
            .get(&query)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn folders_exhausted(&self, roots: &[i64]) -> bool {
        DISCOVERY_QUERIES
            .iter()
            .filter(|q| q.is_folder_listing())
            .all(|q| {
                self.exhausted
                    .get(q)
                    .map_or(false, |set| roots.iter().all(|r| set.contains(r)))
            })
    }
}

pub struct DiscoveryPhase {
    query: DiscoveryQuery,
    cycle: Arc<Mutex<DiscoveryCycle>>,
}

impl DiscoveryPhase {
    pub fn new(query: DiscoveryQuery, cycle: Arc<Mutex<DiscoveryCycle>>) -> Self {
        Self { query, cycle }
    }

    /// Every phase of layer 1, sharing one cycle record.
    pub fn all(cycle: &Arc<Mutex<DiscoveryCycle>>) -> Vec<Box<dyn Phase>> {
        DISCOVERY_QUERIES
            .iter()
            .map(|q| Box::new(DiscoveryPhase::new(*q, Arc::clone(cycle))) as Box<dyn Phase>)
            .collect()
    }
}

impl Phase for DiscoveryPhase {
    fn name(&self) -> &'static str {
        match self.query {
            DiscoveryQuery::FoldersWithChildren => "folders-with-children",
            DiscoveryQuery::FoldersWithoutChildren => "folders-without-children",
            DiscoveryQuery::ArchivesWithChildren => "archives-with-children",
            DiscoveryQuery::FilesWithoutChildren => "files-without-children",
            DiscoveryQuery::NoAccessFoldersWithChildren => "no-access-folders-with-children",
            DiscoveryQuery::NoAccessFoldersWithoutChildren => "no-access-folders-without-children",
        }
    }

    fn is_startable(&self, env: &SchedulerEnv) -> bool {
        env.admits_insertable() && env.admits_update()
    }

    fn step(&mut self, env: &SchedulerEnv) -> Result<bool> {
        let exclude = self.cycle.lock().exhausted_roots(self.query);
        let limit = env.config.batch_size.max(1);
        let batch = env
            .db
            .lock_low()
            .discovery_batch(self.query, &exclude, limit)?;

        let mut seen_roots = HashSet::new();
        let mut issued = 0usize;
        for entry in &batch {
            if !env.admits_insertable() || !env.admits_update() {
                debug!("{}: backpressure after {} dispatches", self.name(), issued);
                return Ok(false);
            }
            seen_roots.insert(entry.root_id);
            let dispatcher = Arc::clone(&env.dispatcher);
            let entry_for_job = entry.clone();
            let queued = env.insertable.enqueue(
                entry.root_id,
                Some(entry.id),
                job(move |ctx| {
                    dispatcher
                        .dispatch(ctx, &entry_for_job, DispatchOptions::discovery())
                        .map(|_| ())
                }),
            )?;
            if queued {
                issued += 1;
            }
        }

        let complete = batch.len() < limit;
        if complete {
            let roots = env.db.lock_low().root_ids()?;
            let mut cycle = self.cycle.lock();
            let set = cycle.exhausted.entry(self.query).or_default();
            for root in roots.into_iter().filter(|r| !seen_roots.contains(r)) {
                set.insert(root);
            }
        }
        if issued > 0 {
            debug!("{}: {} dispatches issued", self.name(), issued);
        }
        Ok(complete)
    }

    /// The first phase closes the round for everyone: if every folder query
    /// ran dry on every root, clean folders are forced Dirty for one full
    /// re-listing pass, at most once per relist interval.
    fn on_round(&mut self, env: &SchedulerEnv) -> Result<()> {
        if self.query != DiscoveryQuery::FoldersWithChildren {
            return Ok(());
        }
        let roots = env.db.lock_low().root_ids()?;
        let mut cycle = self.cycle.lock();
        let due = cycle.last_full_relist.elapsed() >= env.config.full_relist_interval();
        if !roots.is_empty() && cycle.folders_exhausted(&roots) && due {
            cycle.last_full_relist = Instant::now();
            drop(cycle);
            let forced =
                env.run_sql("force-folders-dirty", UpdatePriority::Low, |db| db.force_folders_dirty())?;
            info!(
                "Discovery exhausted, {} folders forced dirty for re-listing",
                forced
            );
            self.cycle.lock().exhausted.clear();
        } else {
            cycle.exhausted.clear();
        }
        Ok(())
    }
}
