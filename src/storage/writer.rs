//! Write mediation. Every storage mutation is described by a [`Mutation`]
//! value and reaches the database through a [`StorageWriter`]. Writers
//! compose by wrapping: a `LoggingWriter<CountingWriter<QueuedWriter>>` is a
//! pipeline, not a class hierarchy.

use super::sqlite::Database;
use super::SharedDb;
use crate::error::{Error, Result};
use crate::lock::Priority;
use crate::model::{Entry, EntryStatus, Equality, UpperLower};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Where an inserted entry hangs. Archive listings insert folders and their
/// content in one batch, so a parent may only be known by path until the
/// batch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    Id { id: i64, root_id: i64 },
    Path(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert {
        parent: ParentRef,
        entry: Entry,
        status: EntryStatus,
    },
    Update {
        id: i64,
        entry: Entry,
        status: EntryStatus,
    },
    UpdateStatus {
        id: i64,
        status: EntryStatus,
    },
    Delete {
        id: i64,
    },
    Disable {
        id: i64,
        entry: Option<Entry>,
    },
    Orphanize {
        id: i64,
    },
    InsertUpperLower(UpperLower),
    DeleteUpperLower {
        upper: i64,
        lower: i64,
    },
    UpsertEquality(Equality),
    DeleteEquality {
        id1: i64,
        id2: i64,
    },
    UpdateDuplicateFields {
        id: i64,
        duplicate_count: i64,
        dedupable_size: i64,
    },
}

impl Mutation {
    pub fn apply(&self, db: &Database) -> Result<()> {
        match self {
            Mutation::Insert {
                parent,
                entry,
                status,
            } => {
                let (parent_id, root_id) = match parent {
                    ParentRef::Id { id, root_id } => (*id, *root_id),
                    ParentRef::Path(path) => {
                        let parent = db.entry_by_path(path)?.ok_or_else(|| {
                            Error::Orphaned(format!("{} (parent {} missing)", entry.path, path))
                        })?;
                        (parent.id, parent.root_id)
                    }
                };
                db.insert_entry(parent_id, root_id, entry, *status)?;
            }
            Mutation::Update { id, entry, status } => db.update_entry(*id, entry, *status)?,
            Mutation::UpdateStatus { id, status } => db.update_status(*id, *status)?,
            Mutation::Delete { id } => db.delete_entry(*id)?,
            Mutation::Disable { id, entry } => db.disable_entry(*id, entry.as_ref())?,
            Mutation::Orphanize { id } => db.orphanize_entry(*id)?,
            Mutation::InsertUpperLower(edge) => db.insert_upper_lower(edge)?,
            Mutation::DeleteUpperLower { upper, lower } => db.delete_upper_lower(*upper, *lower)?,
            Mutation::UpsertEquality(eq) => db.insert_equality(eq)?,
            Mutation::DeleteEquality { id1, id2 } => db.delete_equality(*id1, *id2)?,
            Mutation::UpdateDuplicateFields {
                id,
                duplicate_count,
                dedupable_size,
            } => db.update_duplicate_fields(*id, *duplicate_count, *dedupable_size)?,
        }
        Ok(())
    }
}

/// Apply a batch atomically. Any failure rolls the whole batch back, so a
/// listing is either fully recorded or left for the next pass.
pub fn apply_batch(db: &Database, batch: &[Mutation]) -> Result<()> {
    let tx = db.connection().unchecked_transaction()?;
    for mutation in batch {
        mutation.apply(db)?;
    }
    tx.commit()?;
    Ok(())
}

pub trait StorageWriter: Send + Sync {
    fn submit(&self, batch: Vec<Mutation>) -> Result<()>;
}

/// Applies batches immediately on the calling thread under the stacking lock.
pub struct DirectWriter {
    db: SharedDb,
    priority: Priority,
}

impl DirectWriter {
    pub fn new(db: SharedDb, priority: Priority) -> Self {
        Self { db, priority }
    }
}

impl StorageWriter for DirectWriter {
    fn submit(&self, batch: Vec<Mutation>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let db = self.db.lock(self.priority);
        apply_batch(&db, &batch)
    }
}

/// Debug-logs every mutation before passing the batch on.
pub struct LoggingWriter<W> {
    inner: W,
}

impl<W: StorageWriter> LoggingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: StorageWriter> StorageWriter for LoggingWriter<W> {
    fn submit(&self, batch: Vec<Mutation>) -> Result<()> {
        for mutation in &batch {
            debug!("write: {:?}", mutation);
        }
        self.inner.submit(batch)
    }
}

/// Counts mutations and batches that pass through.
pub struct CountingWriter<W> {
    inner: W,
    mutations: AtomicUsize,
    batches: AtomicUsize,
}

impl<W: StorageWriter> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            mutations: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        }
    }

    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.mutations.store(0, Ordering::SeqCst);
        self.batches.store(0, Ordering::SeqCst);
    }
}

impl<W: StorageWriter> StorageWriter for CountingWriter<W> {
    fn submit(&self, batch: Vec<Mutation>) -> Result<()> {
        if !batch.is_empty() {
            self.mutations.fetch_add(batch.len(), Ordering::SeqCst);
            self.batches.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.submit(batch)
    }
}

impl<W: StorageWriter + ?Sized> StorageWriter for std::sync::Arc<W> {
    fn submit(&self, batch: Vec<Mutation>) -> Result<()> {
        (**self).submit(batch)
    }
}
