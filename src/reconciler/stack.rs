use crate::error::{Error, Result};
use crate::lister::{file_source, ContentSource, ListerRegistry};
use crate::model::{Entry, EntryType, StoredEntry};
use crate::storage::Database;
use std::io;
use std::sync::Arc;

/// Chain of archive containers from the real file down to the innermost
/// archive holding an entry. Empty for real files and folders.
#[derive(Debug, Clone)]
pub struct CompressionStack {
    levels: Vec<StoredEntry>,
}

impl CompressionStack {
    /// Walk parent links up to the real file. Any missing or orphaned link
    /// means the entry is unreachable.
    pub fn resolve(db: &Database, entry: &StoredEntry) -> Result<Self> {
        if entry.orphan {
            return Err(Error::Orphaned(entry.path().to_string()));
        }
        let mut levels = Vec::new();
        let mut current = entry.clone();
        while current.entry_type().is_compressed() {
            let parent = current
                .parent_id
                .map(|id| db.entry_by_id(id))
                .transpose()?
                .flatten()
                .filter(|parent| !parent.orphan)
                .ok_or_else(|| Error::Orphaned(entry.path().to_string()))?;
            match parent.entry_type() {
                EntryType::File | EntryType::CompressedFile => levels.push(parent.clone()),
                EntryType::CompressedFolder => {}
                EntryType::Folder => return Err(Error::Orphaned(entry.path().to_string())),
            }
            current = parent;
        }
        levels.reverse();
        Ok(Self { levels })
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[StoredEntry] {
        &self.levels
    }

    /// Content of `target`, re-opening every archive level on each open.
    pub fn open_source(&self, registry: &Arc<ListerRegistry>, target: &Entry) -> ContentSource {
        let mut levels = self.levels.iter();
        let outermost = match levels.next() {
            Some(outermost) => outermost,
            None => return file_source(&target.path),
        };
        let mut container_path = outermost.path().to_string();
        let mut source = file_source(&container_path);
        for level in levels {
            source = member_source(registry, &container_path, source, level.entry.clone());
            container_path = level.path().to_string();
        }
        member_source(registry, &container_path, source, target.clone())
    }
}

fn member_source(
    registry: &Arc<ListerRegistry>,
    container_path: &str,
    container: ContentSource,
    member: Entry,
) -> ContentSource {
    let registry = Arc::clone(registry);
    let container_path = container_path.to_string();
    Arc::new(move || {
        let lister = registry
            .lister_for(&container_path, Arc::clone(&container))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} is no longer an enabled archive", container_path),
                )
            })?;
        lister
            .open(&member)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryStatus;

    fn compressed(path: &str, entry_type: EntryType) -> Entry {
        Entry {
            path: path.to_string(),
            entry_type,
            modified: 1,
            size: 1,
            compressed_size: 1,
            checksum: None,
        }
    }

    #[test]
    fn test_resolve_collects_archive_levels() {
        let db = Database::open_in_memory().unwrap();
        let root = db.insert_root(&Entry::folder("/r/", 1)).unwrap();
        let outer = db
            .insert_entry(root, root, &Entry::file("/r/a.tar", 1, 10), EntryStatus::Clean)
            .unwrap();
        let dir = db
            .insert_entry(
                outer,
                root,
                &compressed("/r/a.tar/d/", EntryType::CompressedFolder),
                EntryStatus::Clean,
            )
            .unwrap();
        let inner = db
            .insert_entry(
                dir,
                root,
                &compressed("/r/a.tar/d/b.gz", EntryType::CompressedFile),
                EntryStatus::Clean,
            )
            .unwrap();
        let leaf = db
            .insert_entry(
                inner,
                root,
                &compressed("/r/a.tar/d/b.gz/b", EntryType::CompressedFile),
                EntryStatus::Dirty,
            )
            .unwrap();

        let leaf = db.entry_by_id(leaf).unwrap().unwrap();
        let stack = CompressionStack::resolve(&db, &leaf).unwrap();
        let paths: Vec<&str> = stack.levels().iter().map(|l| l.path()).collect();
        assert_eq!(paths, vec!["/r/a.tar", "/r/a.tar/d/b.gz"]);
    }

    #[test]
    fn test_broken_chain_is_orphaned() {
        let db = Database::open_in_memory().unwrap();
        let root = db.insert_root(&Entry::folder("/r/", 1)).unwrap();
        let outer = db
            .insert_entry(root, root, &Entry::file("/r/a.tar", 1, 10), EntryStatus::Clean)
            .unwrap();
        let leaf = db
            .insert_entry(
                outer,
                root,
                &compressed("/r/a.tar/x", EntryType::CompressedFile),
                EntryStatus::Dirty,
            )
            .unwrap();
        db.orphanize_entry(outer).unwrap();

        let leaf = db.entry_by_id(leaf).unwrap().unwrap();
        assert!(matches!(
            CompressionStack::resolve(&db, &leaf),
            Err(Error::Orphaned(_))
        ));
    }
}
