//! Layer 3: set-based passes that keep derived tables consistent. Every
//! pass runs as a low-priority job on the update queue.

use super::layer::Phase;
use super::SchedulerEnv;
use crate::error::Result;
use crate::queue::UpdatePriority;
use crate::storage::Database;
use tracing::{debug, info};

/// A pass over the whole table. `repeat` passes report end of line only
/// once they change nothing; the others run once per round.
pub struct SqlPhase {
    name: &'static str,
    repeat: bool,
    pass: fn(&Database, usize) -> rusqlite::Result<usize>,
}

impl SqlPhase {
    pub fn once(name: &'static str, pass: fn(&Database, usize) -> rusqlite::Result<usize>) -> Self {
        Self {
            name,
            repeat: false,
            pass,
        }
    }

    pub fn until_settled(
        name: &'static str,
        pass: fn(&Database, usize) -> rusqlite::Result<usize>,
    ) -> Self {
        Self {
            name,
            repeat: true,
            pass,
        }
    }
}

impl Phase for SqlPhase {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_startable(&self, env: &SchedulerEnv) -> bool {
        env.admits_update()
    }

    fn step(&mut self, env: &SchedulerEnv) -> Result<bool> {
        let pass = self.pass;
        let limit = env.config.batch_size.max(1);
        let changed = env.run_sql(self.name, UpdatePriority::Low, move |db| pass(db, limit))?;
        if changed > 0 {
            debug!("{}: {} rows changed", self.name, changed);
        }
        Ok(!self.repeat || changed == 0)
    }
}

/// Archives whose extension was removed from the allow-list lose their
/// listing.
pub struct UnlistDisabledPhase {
    cursor: i64,
}

impl UnlistDisabledPhase {
    pub fn new() -> Self {
        Self { cursor: 0 }
    }
}

impl Default for UnlistDisabledPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase for UnlistDisabledPhase {
    fn name(&self) -> &'static str {
        "unlist-disabled-extensions"
    }

    fn is_startable(&self, env: &SchedulerEnv) -> bool {
        env.admits_update()
    }

    fn step(&mut self, env: &SchedulerEnv) -> Result<bool> {
        let limit = env.config.batch_size.max(1);
        let candidates = env
            .db
            .lock_low()
            .unlisted_archive_candidates(self.cursor, limit)?;
        let registry = env.dispatcher.registry();
        let stale: Vec<i64> = candidates
            .iter()
            .filter(|c| !registry.is_archive(c.path()))
            .map(|c| c.id)
            .collect();
        if !stale.is_empty() {
            let unlisted = env.run_sql(self.name(), UpdatePriority::Low, move |db| {
                let mut n = 0;
                for id in &stale {
                    n += db.unlist_entry(*id)?;
                }
                Ok(n)
            })?;
            info!("Unlisted {} entries under disabled archive formats", unlisted);
        }
        match candidates.last() {
            Some(last) if candidates.len() == limit => {
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

/// All layer 3 phases in round order.
pub fn phases() -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(SqlPhase::once("direct-edges", |db, _| db.refresh_direct_edges())),
        Box::new(SqlPhase::until_settled("indirect-edges", |db, _| {
            db.refresh_indirect_edges()
        })),
        Box::new(UnlistDisabledPhase::new()),
        Box::new(SqlPhase::until_settled("reorphanize", |db, _| {
            db.reorphanize_children()
        })),
        Box::new(SqlPhase::once("duplicate-aggregates", |db, _| {
            db.recompute_duplicate_aggregates()
        })),
        Box::new(SqlPhase::until_settled("folder-sizes", |db, _| {
            db.recompute_folder_sizes()
        })),
        Box::new(SqlPhase::until_settled("cleanup-orphans", |db, limit| {
            db.cleanup_orphans(limit)
        })),
        Box::new(SqlPhase::once("cleanup-dangling", |db, _| db.cleanup_dangling())),
    ]
}
