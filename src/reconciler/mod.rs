//! The dispatcher: compares one stored entry against live state and turns
//! every discrepancy into storage mutations.

pub mod checksum;
pub mod diff;
pub mod stack;

use crate::cancel::{WorkerContext, CANCEL_CHECK_INTERVAL};
use crate::config::AppConfig;
use crate::equality::{self, EqualityMode};
use crate::error::{Error, Result};
use crate::lister::{directory, DirectoryLister, EntryLister, ListerRegistry};
use crate::model::{Entry, EntryStatus, EntryType, StoredEntry};
use crate::storage::{Mutation, SharedDb, StorageWriter};
use diff::{diff_children, ChildDiff, ParentResolver};
use glob::Pattern;
use stack::CompressionStack;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    Skip,
    /// Compute when none is stored or the attributes changed.
    IfMissing,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// List folders and archives whose stored listing may be stale.
    pub list: bool,
    pub checksum: ChecksumMode,
    pub want_result: bool,
}

impl DispatchOptions {
    /// Discovery: list, checksum new files, nothing returned.
    pub const fn discovery() -> Self {
        Self {
            list: true,
            checksum: ChecksumMode::IfMissing,
            want_result: false,
        }
    }

    /// Foreground crawl: like discovery, but the updated entry is returned.
    pub const fn crawl() -> Self {
        Self {
            list: true,
            checksum: ChecksumMode::IfMissing,
            want_result: true,
        }
    }

    pub const fn checksum_only(mode: ChecksumMode) -> Self {
        Self {
            list: false,
            checksum: mode,
            want_result: true,
        }
    }

    pub const fn touch() -> Self {
        Self {
            list: false,
            checksum: ChecksumMode::Skip,
            want_result: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSummary {
    pub dispatched: usize,
    pub disabled: usize,
}

pub struct Dispatcher {
    db: SharedDb,
    writer: Arc<dyn StorageWriter>,
    registry: Arc<ListerRegistry>,
    ignore_patterns: Vec<Pattern>,
    long_diff_warning: Duration,
}

impl Dispatcher {
    pub fn new(db: SharedDb, writer: Arc<dyn StorageWriter>, config: &AppConfig) -> Self {
        let ignore_patterns = config
            .ignore_patterns
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();
        Self {
            db,
            writer,
            registry: Arc::new(ListerRegistry::new(&config.archive_extensions)),
            ignore_patterns,
            long_diff_warning: config.long_diff_warning(),
        }
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    pub fn registry(&self) -> &Arc<ListerRegistry> {
        &self.registry
    }

    pub fn writer(&self) -> &Arc<dyn StorageWriter> {
        &self.writer
    }

    /// Reconcile one stored entry with live state.
    ///
    /// Transient failures (vanished file, unreadable archive) disable the
    /// entry and return `Ok(None)`; a broken compression stack is a no-op.
    /// Cancellation propagates with nothing written.
    pub fn dispatch(
        &self,
        ctx: &WorkerContext,
        stored: &StoredEntry,
        opts: DispatchOptions,
    ) -> Result<Option<StoredEntry>> {
        ctx.checkpoint()?;
        let result = match stored.entry_type() {
            EntryType::Folder => self.dispatch_folder(ctx, stored, opts),
            EntryType::File | EntryType::CompressedFile => self.dispatch_file(ctx, stored, opts),
            EntryType::CompressedFolder => self.dispatch_compressed_folder(ctx, stored),
        };
        match result {
            Ok(updated) => Ok(if opts.want_result { updated } else { None }),
            Err(Error::Orphaned(path)) => {
                debug!("Skipping orphaned {}", path);
                Ok(None)
            }
            Err(e) if e.is_transient() => {
                warn!("Disabling {}: {}", stored.path(), e);
                self.writer.submit(vec![Mutation::Disable {
                    id: stored.id,
                    entry: None,
                }])?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn dispatch_folder(
        &self,
        ctx: &WorkerContext,
        stored: &StoredEntry,
        opts: DispatchOptions,
    ) -> Result<Option<StoredEntry>> {
        let live = match directory::stat(stored.path())? {
            Some(live) if live.entry_type == EntryType::Folder => live,
            _ => return Err(not_found(stored.path())),
        };

        if stored.status == EntryStatus::Clean && stored.entry.modified == live.modified {
            return Ok(Some(stored.clone()));
        }

        if !opts.list {
            if stored.entry.modified == live.modified {
                return Ok(Some(stored.clone()));
            }
            let mut entry = stored.entry.clone();
            entry.modified = live.modified;
            return self.commit(stored, entry, EntryStatus::Dirty, ChildDiff::default());
        }

        let mut lister = DirectoryLister::new(Path::new(stored.path()), &self.ignore_patterns);
        let live_children = collect_checked(ctx, &mut lister)?;
        let stored_children = self.db.lock(ctx.priority()).children_of(stored.id)?;
        let resolver = ParentResolver::Folder {
            id: stored.id,
            root_id: stored.root_id,
        };
        let diff = diff_children(
            ctx,
            stored.path(),
            &resolver,
            stored_children,
            live_children,
            lister.unreadable(),
            self.long_diff_warning,
        )?;

        let mut entry = stored.entry.clone();
        entry.modified = live.modified;
        entry.size = diff.size;
        entry.compressed_size = diff.compressed_size;
        entry.checksum = None;
        self.commit(stored, entry, EntryStatus::Clean, diff)
    }

    fn dispatch_file(
        &self,
        ctx: &WorkerContext,
        stored: &StoredEntry,
        opts: DispatchOptions,
    ) -> Result<Option<StoredEntry>> {
        let stack = CompressionStack::resolve(&self.db.lock(ctx.priority()), stored)?;

        // Archive members are described by their container's listing.
        let live = if stored.entry_type() == EntryType::File {
            match directory::stat(stored.path())? {
                Some(live) if live.entry_type == EntryType::File => live,
                _ => return Err(not_found(stored.path())),
            }
        } else {
            stored.entry.clone()
        };

        let changed = diff::attributes_differ(&stored.entry, &live);
        let mut entry = live;
        entry.checksum = if changed { None } else { stored.entry.checksum };

        let need_checksum = entry.size < 0
            || match opts.checksum {
                ChecksumMode::Skip => false,
                ChecksumMode::IfMissing => entry.checksum.is_none(),
                ChecksumMode::Force => true,
            };
        if need_checksum {
            let source = stack.open_source(&self.registry, &stored.entry);
            let mut reader = source()?;
            let (sum, size) = checksum::checksum_stream(ctx, &mut reader)?;
            entry.checksum = Some(sum);
            entry.size = size;
            if stored.entry_type() == EntryType::File {
                entry.compressed_size = size;
            }
        }

        let is_archive = self.registry.is_archive(stored.path());
        let needs_listing = is_archive && (changed || stored.status != EntryStatus::Clean);
        let (status, diff) = if needs_listing && opts.list {
            (EntryStatus::Clean, self.list_archive(ctx, stored, &stack)?)
        } else if needs_listing {
            (EntryStatus::Dirty, ChildDiff::default())
        } else {
            (EntryStatus::Clean, ChildDiff::default())
        };
        self.commit(stored, entry, status, diff)
    }

    fn list_archive(
        &self,
        ctx: &WorkerContext,
        stored: &StoredEntry,
        stack: &CompressionStack,
    ) -> Result<ChildDiff> {
        let source = stack.open_source(&self.registry, &stored.entry);
        let mut lister = self
            .registry
            .lister_for(stored.path(), source)
            .ok_or_else(|| Error::Lister(format!("{} is not archivable", stored.path())))?;
        let live_children = collect_checked(ctx, lister.as_mut())?;
        let stored_children = self
            .db
            .lock(ctx.priority())
            .archive_children_of(stored.id)?;
        let resolver = ParentResolver::Archive {
            id: stored.id,
            root_id: stored.root_id,
            base: stored.path(),
        };
        debug!(
            "Listed {} at depth {}: {} entries",
            stored.path(),
            stack.depth(),
            live_children.len()
        );
        diff_children(
            ctx,
            stored.path(),
            &resolver,
            stored_children,
            live_children,
            lister.unreadable(),
            self.long_diff_warning,
        )
    }

    /// An archive-internal folder is complete with its archive's listing.
    /// If it was flagged, the containing archive is re-listed instead.
    fn dispatch_compressed_folder(
        &self,
        ctx: &WorkerContext,
        stored: &StoredEntry,
    ) -> Result<Option<StoredEntry>> {
        let stack = CompressionStack::resolve(&self.db.lock(ctx.priority()), stored)?;
        if stored.status == EntryStatus::Clean {
            return Ok(Some(stored.clone()));
        }
        let container = stack
            .levels()
            .last()
            .ok_or_else(|| Error::Orphaned(stored.path().to_string()))?;
        self.writer.submit(vec![
            Mutation::UpdateStatus {
                id: container.id,
                status: EntryStatus::Dirty,
            },
            Mutation::UpdateStatus {
                id: stored.id,
                status: EntryStatus::Clean,
            },
        ])?;
        let mut updated = stored.clone();
        updated.status = EntryStatus::Clean;
        Ok(Some(updated))
    }

    /// Submit child mutations plus the entry's own update as one batch.
    /// Nothing is written when nothing changed.
    fn commit(
        &self,
        stored: &StoredEntry,
        entry: Entry,
        status: EntryStatus,
        diff: ChildDiff,
    ) -> Result<Option<StoredEntry>> {
        let unchanged = entry == stored.entry && status == stored.status;
        if unchanged && diff.is_empty() {
            return Ok(Some(stored.clone()));
        }
        if diff.inserted + diff.updated + diff.orphaned + diff.disabled > 0 {
            debug!(
                "{}: {} inserted, {} updated, {} orphaned, {} disabled",
                stored.path(),
                diff.inserted,
                diff.updated,
                diff.orphaned,
                diff.disabled
            );
        }
        let mut batch = diff.mutations;
        if !unchanged {
            batch.push(Mutation::Update {
                id: stored.id,
                entry: entry.clone(),
                status,
            });
        }
        self.writer.submit(batch)?;

        let mut updated = stored.clone();
        updated.entry = entry;
        updated.status = status;
        Ok(Some(updated))
    }

    /// Byte-level or checksum-level comparison of two stored files.
    pub fn check_equality(
        &self,
        ctx: &WorkerContext,
        a: &StoredEntry,
        b: &StoredEntry,
        mode: EqualityMode,
    ) -> Result<bool> {
        equality::check_equality(ctx, &self.db, &self.registry, a, b, mode)
    }

    /// Foreground full pass over one root: every stored entry is dispatched
    /// top-down, each short-circuiting when unchanged. Children are read
    /// after their parent's batch has been applied, so the writer must be
    /// synchronous.
    pub fn crawl_once(&self, ctx: &WorkerContext, root_id: i64) -> Result<CrawlSummary> {
        let root = self
            .db
            .lock(ctx.priority())
            .entry_by_id(root_id)?
            .ok_or_else(|| Error::Other(format!("no root with id {}", root_id)))?;
        let mut summary = CrawlSummary::default();
        let mut pending = VecDeque::from(vec![root]);

        while let Some(entry) = pending.pop_front() {
            ctx.checkpoint()?;
            summary.dispatched += 1;
            let current = match self.dispatch(ctx, &entry, DispatchOptions::crawl())? {
                Some(current) => current,
                None => {
                    summary.disabled += 1;
                    continue;
                }
            };
            let has_children = current.entry_type().is_folder()
                || (current.entry_type().is_file() && self.registry.is_archive(current.path()));
            if has_children && current.status != EntryStatus::NoAccess {
                let children = self.db.lock(ctx.priority()).children_of(current.id)?;
                pending.extend(children);
            }
        }
        Ok(summary)
    }
}

fn collect_checked(ctx: &WorkerContext, lister: &mut dyn EntryLister) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    while let Some(entry) = lister.next_entry()? {
        if entries.len() % CANCEL_CHECK_INTERVAL == 0 {
            ctx.checkpoint()?;
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn not_found(path: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} no longer exists", path),
    ))
}
