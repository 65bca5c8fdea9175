//! Layer 2: checksum and equality upkeep. Nothing here inserts entries.

use super::layer::Phase;
use super::SchedulerEnv;
use crate::equality;
use crate::error::Result;
use crate::model::{now_secs, Equality, StoredEntry};
use crate::queue::job;
use crate::reconciler::{ChecksumMode, DispatchOptions};
use crate::storage::Mutation;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

fn maintenance_startable(env: &SchedulerEnv) -> bool {
    env.admits_maintenance() && env.admits_update()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Enqueued {
    /// New jobs on the queue.
    issued: usize,
    /// Leading entries dealt with: queued, or already in flight.
    handled: usize,
    /// Backpressure cut the batch short.
    stopped: bool,
}

/// Queue one dispatch per entry on the maintenance queue, in order, until
/// backpressure stops it.
fn enqueue_dispatches(
    env: &SchedulerEnv,
    entries: &[StoredEntry],
    opts: DispatchOptions,
) -> Result<Enqueued> {
    let mut done = Enqueued {
        issued: 0,
        handled: 0,
        stopped: false,
    };
    for entry in entries {
        if !maintenance_startable(env) {
            done.stopped = true;
            return Ok(done);
        }
        let dispatcher = Arc::clone(&env.dispatcher);
        let entry_for_job = entry.clone();
        if env.maintenance.enqueue(
            entry.root_id,
            Some(entry.id),
            job(move |ctx| dispatcher.dispatch(ctx, &entry_for_job, opts).map(|_| ())),
        )? {
            done.issued += 1;
        }
        done.handled += 1;
    }
    Ok(done)
}

/// Checksum files without a digest that share their size with another
/// file, largest first.
pub struct SizeCollisionPhase;

impl Phase for SizeCollisionPhase {
    fn name(&self) -> &'static str {
        "size-collision-checksum"
    }

    fn is_startable(&self, env: &SchedulerEnv) -> bool {
        maintenance_startable(env)
    }

    fn step(&mut self, env: &SchedulerEnv) -> Result<bool> {
        let limit = env.config.batch_size.max(1);
        let candidates = env.db.lock_low().size_collision_candidates(limit)?;
        let done = enqueue_dispatches(
            env,
            &candidates,
            DispatchOptions::checksum_only(ChecksumMode::IfMissing),
        )?;
        if done.issued > 0 {
            debug!("{} checksum dispatches issued", done.issued);
        }
        Ok(!done.stopped && candidates.len() < limit)
    }
}

/// Confirm new size+checksum matches byte by byte and re-verify confirmed
/// pairs oldest first.
pub struct EqualityPhase {
    /// Pairs that matched on checksum but not on bytes.
    rejected: Arc<Mutex<HashSet<(i64, i64)>>>,
}

impl EqualityPhase {
    pub fn new() -> Self {
        Self {
            rejected: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn enqueue_pair(&self, env: &SchedulerEnv, a: i64, b: i64) -> Result<bool> {
        let pair = Equality::new(a, b, 0, 0, 0);
        if self.rejected.lock().contains(&(pair.id1, pair.id2)) {
            return Ok(false);
        }
        let (first, second) = {
            let db = env.db.lock_low();
            (db.entry_by_id(pair.id1)?, db.entry_by_id(pair.id2)?)
        };
        let (first, second) = match (first, second) {
            (Some(first), Some(second)) => (first, second),
            _ => return Ok(false),
        };
        let db = Arc::clone(&env.db);
        let dispatcher = Arc::clone(&env.dispatcher);
        let rejected = Arc::clone(&self.rejected);
        env.maintenance.enqueue(
            first.root_id,
            Some(first.id),
            job(move |ctx| {
                let mutation =
                    match equality::verify_pair(ctx, &db, dispatcher.registry(), &first, &second) {
                        Ok(mutation) => mutation,
                        Err(e) if e.is_transient() => {
                            warn!("Dropping pair {} / {}: {}", first.path(), second.path(), e);
                            Mutation::DeleteEquality {
                                id1: pair.id1,
                                id2: pair.id2,
                            }
                        }
                        Err(e) => return Err(e),
                    };
                if let Mutation::DeleteEquality { id1, id2 } = mutation {
                    rejected.lock().insert((id1, id2));
                }
                dispatcher.writer().submit(vec![mutation])
            }),
        )
    }
}

impl Default for EqualityPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for EqualityPhase {
    fn name(&self) -> &'static str {
        "equality-verification"
    }

    fn is_startable(&self, env: &SchedulerEnv) -> bool {
        maintenance_startable(env)
    }

    fn step(&mut self, env: &SchedulerEnv) -> Result<bool> {
        let limit = env.config.batch_size.max(1);
        let stale_before = now_secs() - env.config.equality_reverify().as_secs() as i64;
        let (candidates, stale) = {
            let db = env.db.lock_low();
            (
                db.equality_candidates(limit)?,
                db.stale_equalities(stale_before, limit)?,
            )
        };

        let mut issued = 0;
        let pairs = candidates
            .iter()
            .copied()
            .chain(stale.iter().map(|eq| (eq.id1, eq.id2)));
        for (a, b) in pairs {
            if !maintenance_startable(env) {
                return Ok(false);
            }
            if self.enqueue_pair(env, a, b)? {
                issued += 1;
            }
        }
        if issued > 0 {
            debug!("{} equality checks issued", issued);
        }
        Ok(candidates.len() < limit && stale.len() < limit)
    }

    /// Forget rejections each round; checksums may have changed since.
    fn on_round(&mut self, _env: &SchedulerEnv) -> Result<()> {
        self.rejected.lock().clear();
        Ok(())
    }
}

/// Retry files that could not be read last time.
pub struct NoAccessFilesPhase;

impl Phase for NoAccessFilesPhase {
    fn name(&self) -> &'static str {
        "no-access-files"
    }

    fn is_startable(&self, env: &SchedulerEnv) -> bool {
        maintenance_startable(env)
    }

    fn step(&mut self, env: &SchedulerEnv) -> Result<bool> {
        let limit = env.config.batch_size.max(1);
        let entries = env.db.lock_low().no_access_files(limit)?;
        let done = enqueue_dispatches(
            env,
            &entries,
            DispatchOptions::checksum_only(ChecksumMode::IfMissing),
        )?;
        // One batch per round: entries that stay unreadable come back.
        Ok(!done.stopped)
    }
}

/// Re-stat clean entries under clean parents so in-place changes that do
/// not touch a folder's mtime are noticed.
pub struct TouchPhase {
    cursor: i64,
}

impl TouchPhase {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }
}

impl Default for TouchPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for TouchPhase {
    fn name(&self) -> &'static str {
        "touch"
    }

    fn is_startable(&self, env: &SchedulerEnv) -> bool {
        maintenance_startable(env)
    }

    fn step(&mut self, env: &SchedulerEnv) -> Result<bool> {
        let limit = env.config.batch_size.max(1);
        let entries = env.db.lock_low().touch_candidates(self.cursor, limit)?;
        let done = enqueue_dispatches(env, &entries, DispatchOptions::touch())?;
        if done.stopped {
            if let Some(last) = done.handled.checked_sub(1).and_then(|i| entries.get(i)) {
                self.cursor = last.id;
            }
            return Ok(false);
        }
        match entries.last() {
            Some(last) if entries.len() == limit => {
                self.cursor = last.id;
                Ok(false)
            }
            _ => {
                self.cursor = 0;
                Ok(true)
            }
        }
    }
}
