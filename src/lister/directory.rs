use super::{ByteStream, EntryLister};
use crate::error::{Error, Result};
use crate::model::{file_path, folder_path, Entry};
use glob::Pattern;
use std::fs::{self, File, Metadata};
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::warn;
use walkdir::WalkDir;

/// Direct children of one real folder. Symlinks and ignored paths are skipped.
pub struct DirectoryLister {
    walker: walkdir::IntoIter,
    ignore_patterns: Vec<Pattern>,
    unreadable: Vec<String>,
}

impl DirectoryLister {
    pub fn new(dir: &Path, ignore_patterns: &[Pattern]) -> Self {
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .into_iter();
        Self {
            walker,
            ignore_patterns: ignore_patterns.to_vec(),
            unreadable: Vec::new(),
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignore_patterns
            .iter()
            .any(|pattern| pattern.matches_path(path))
    }
}

impl EntryLister for DirectoryLister {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        loop {
            let dir_entry = match self.walker.next() {
                None => return Ok(None),
                Some(Ok(dir_entry)) => dir_entry,
                Some(Err(err)) => match err.path() {
                    Some(path) if err.depth() > 0 => {
                        warn!("Unreadable child {}: {}", path.display(), err);
                        self.unreadable.push(file_path(path));
                        continue;
                    }
                    // Without a path the listing cannot tell which child
                    // is missing; fail it as a whole.
                    _ => {
                        let io_err = err
                            .into_io_error()
                            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk failed"));
                        return Err(Error::Io(io_err));
                    }
                },
            };

            if dir_entry.path_is_symlink() || self.is_ignored(dir_entry.path()) {
                continue;
            }

            let metadata = match dir_entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(
                        "Unreadable child {}: {}",
                        dir_entry.path().display(),
                        err
                    );
                    self.unreadable.push(file_path(dir_entry.path()));
                    continue;
                }
            };
            return Ok(Some(entry_from_metadata(dir_entry.path(), &metadata)));
        }
    }

    fn open(&self, entry: &Entry) -> Result<ByteStream> {
        Ok(Box::new(File::open(&entry.path)?))
    }

    fn unreadable(&self) -> &[String] {
        &self.unreadable
    }
}

pub fn modified_secs(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn entry_from_metadata(path: &Path, metadata: &Metadata) -> Entry {
    if metadata.is_dir() {
        Entry::folder(folder_path(path), modified_secs(metadata))
    } else {
        Entry::file(file_path(path), modified_secs(metadata), metadata.len() as i64)
    }
}

/// Stat a real path. `Ok(None)` when it no longer exists.
pub fn stat(path: &str) -> io::Result<Option<Entry>> {
    let p = Path::new(path);
    match fs::symlink_metadata(p) {
        Ok(metadata) => Ok(Some(entry_from_metadata(p, &metadata))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryType;
    use tempfile::tempdir;

    #[test]
    fn test_lists_direct_children_only() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("sub/deeper")).unwrap();
        fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        fs::write(tmp.path().join("sub/b.txt"), "nested").unwrap();

        let mut lister = DirectoryLister::new(tmp.path(), &[]);
        let mut entries = lister.collect_entries().unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_type, EntryType::File);
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[1].entry_type, EntryType::Folder);
        assert!(entries[1].path.ends_with(std::path::MAIN_SEPARATOR));
    }

    #[test]
    fn test_ignore_patterns_skip_children() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("keep.txt"), "k").unwrap();
        fs::write(tmp.path().join("skip.tmp"), "s").unwrap();

        let patterns = vec![Pattern::new("*.tmp").unwrap()];
        let mut lister = DirectoryLister::new(tmp.path(), &patterns);
        let entries = lister.collect_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].path.ends_with("keep.txt"));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let tmp = tempdir().unwrap();
        let mut lister = DirectoryLister::new(&tmp.path().join("gone"), &[]);
        assert!(lister.next_entry().is_err());
        assert!(stat(&tmp.path().join("gone").to_string_lossy()).unwrap().is_none());
    }

    #[test]
    fn test_child_failing_stat_is_reported_unreadable() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("one.txt"), "1").unwrap();
        fs::write(tmp.path().join("two.txt"), "2").unwrap();

        let mut lister = DirectoryLister::new(tmp.path(), &[]);
        let first = lister.next_entry().unwrap().unwrap();
        // The remaining name is already read from the directory; its stat
        // now fails.
        fs::remove_file(tmp.path().join("one.txt")).unwrap();
        fs::remove_file(tmp.path().join("two.txt")).unwrap();
        assert!(lister.next_entry().unwrap().is_none());

        let other = if first.path.ends_with("one.txt") {
            "two.txt"
        } else {
            "one.txt"
        };
        assert_eq!(lister.unreadable().len(), 1);
        assert!(lister.unreadable()[0].ends_with(other));
    }
}
