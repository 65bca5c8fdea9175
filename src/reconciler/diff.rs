use crate::cancel::{WorkerContext, CANCEL_CHECK_INTERVAL};
use crate::error::Result;
use crate::model::{EntryStatus, EntryType, Entry, StoredEntry, ARCHIVE_SEPARATOR, SEPARATORS};
use crate::storage::{Mutation, ParentRef};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::warn;

/// Outcome of comparing one listing against its stored children.
#[derive(Debug, Default)]
pub struct ChildDiff {
    pub mutations: Vec<Mutation>,
    pub size: i64,
    pub compressed_size: i64,
    pub inserted: usize,
    pub updated: usize,
    pub orphaned: usize,
    pub disabled: usize,
}

impl ChildDiff {
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// How inserted children find their parent row.
pub enum ParentResolver<'a> {
    /// Every child hangs directly from one folder.
    Folder { id: i64, root_id: i64 },
    /// Children of an archive listing hang from the archive or from a
    /// CompressedFolder of the same listing.
    Archive {
        id: i64,
        root_id: i64,
        base: &'a str,
    },
}

impl ParentResolver<'_> {
    fn parent_of(&self, child_path: &str) -> ParentRef {
        match self {
            ParentResolver::Folder { id, root_id } => ParentRef::Id {
                id: *id,
                root_id: *root_id,
            },
            ParentResolver::Archive { id, root_id, base } => {
                let trimmed = child_path.trim_end_matches(ARCHIVE_SEPARATOR);
                match trimmed.rfind(ARCHIVE_SEPARATOR) {
                    Some(pos) if pos > base.trim_end_matches(ARCHIVE_SEPARATOR).len() => {
                        ParentRef::Path(trimmed[..=pos].to_string())
                    }
                    _ => ParentRef::Id {
                        id: *id,
                        root_id: *root_id,
                    },
                }
            }
        }
    }
}

/// Initial status of a newly discovered child. Archive-internal folders are
/// complete once their archive has been listed; everything else still needs
/// its own dispatch.
pub fn insert_status(entry_type: EntryType) -> EntryStatus {
    match entry_type {
        EntryType::CompressedFolder => EntryStatus::Clean,
        _ => EntryStatus::Dirty,
    }
}

/// Listing-visible change. Folder sizes are rollups, not live attributes.
pub fn attributes_differ(stored: &Entry, live: &Entry) -> bool {
    if stored.entry_type != live.entry_type {
        return true;
    }
    if stored.entry_type.is_folder() {
        stored.modified != live.modified
    } else {
        !stored.same_attributes(live)
    }
}

/// Diff a complete live listing against the stored children.
///
/// Entries only in `live` are inserted, entries only in `stored` are
/// orphanized, and entries in both are updated when their attributes
/// diverge. Stored entries named in `unreadable` still exist and are
/// disabled instead. Sizes of direct file children and stored folder
/// rollups are summed along the way.
pub fn diff_children(
    ctx: &WorkerContext,
    parent_path: &str,
    resolver: &ParentResolver<'_>,
    stored: Vec<StoredEntry>,
    live: Vec<Entry>,
    unreadable: &[String],
    warn_after: Duration,
) -> Result<ChildDiff> {
    let started = Instant::now();
    let mut warned = false;
    let mut diff = ChildDiff::default();
    let mut by_path: HashMap<String, StoredEntry> = stored
        .into_iter()
        .map(|s| (s.entry.path.clone(), s))
        .collect();

    for (n, live_child) in live.into_iter().enumerate() {
        if n % CANCEL_CHECK_INTERVAL == 0 {
            ctx.checkpoint()?;
            if !warned && started.elapsed() > warn_after {
                warn!(
                    "Diff of {} running for {:.0}s ({} children so far)",
                    parent_path,
                    started.elapsed().as_secs_f64(),
                    n
                );
                warned = true;
            }
        }

        let direct = !matches!(
            resolver.parent_of(&live_child.path),
            ParentRef::Path(_)
        );

        match by_path.remove(&live_child.path) {
            Some(existing) => {
                if direct {
                    add_size(&mut diff, &existing.entry, &live_child);
                }
                if attributes_differ(&existing.entry, &live_child) {
                    let mut entry = live_child;
                    if entry.entry_type.is_folder() {
                        entry.size = existing.entry.size;
                        entry.compressed_size = existing.entry.compressed_size;
                    }
                    let status = insert_status(entry.entry_type);
                    diff.mutations.push(Mutation::Update {
                        id: existing.id,
                        entry,
                        status,
                    });
                    diff.updated += 1;
                } else if existing.status == EntryStatus::NoAccess {
                    diff.mutations.push(Mutation::UpdateStatus {
                        id: existing.id,
                        status: EntryStatus::Dirty,
                    });
                    diff.updated += 1;
                }
            }
            None => {
                if direct && live_child.entry_type.is_file() {
                    diff.size += live_child.size;
                    diff.compressed_size += live_child.compressed_size;
                }
                let status = insert_status(live_child.entry_type);
                diff.mutations.push(Mutation::Insert {
                    parent: resolver.parent_of(&live_child.path),
                    entry: live_child,
                    status,
                });
                diff.inserted += 1;
            }
        }
    }

    let unreadable: HashSet<&str> = unreadable
        .iter()
        .map(|p| p.trim_end_matches(SEPARATORS))
        .collect();
    let mut gone: Vec<StoredEntry> = by_path.into_values().collect();
    gone.sort_by_key(|s| s.id);
    for stale in gone {
        if unreadable.contains(stale.entry.path.trim_end_matches(SEPARATORS)) {
            diff.size += stale.entry.size;
            diff.compressed_size += stale.entry.compressed_size;
            if stale.status != EntryStatus::NoAccess {
                diff.mutations.push(Mutation::Disable {
                    id: stale.id,
                    entry: None,
                });
                diff.disabled += 1;
            }
            continue;
        }
        diff.mutations.push(Mutation::Orphanize { id: stale.id });
        diff.orphaned += 1;
    }
    Ok(diff)
}

fn add_size(diff: &mut ChildDiff, stored: &Entry, live: &Entry) {
    if live.entry_type.is_folder() {
        diff.size += stored.size;
        diff.compressed_size += stored.compressed_size;
    } else {
        diff.size += live.size;
        diff.compressed_size += live.compressed_size;
    }
}
