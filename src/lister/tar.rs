use super::{ByteStream, ContentSource, EntryLister};
use crate::error::{Error, Result};
use crate::model::{archive_child_path, Entry, EntryType, ARCHIVE_SEPARATOR};
use std::collections::{HashSet, VecDeque};
use std::io::{self, Read};
use tar::Archive;

/// Lists a tar stream. Directories the archive only implies are synthesized
/// so every internal file has a folder chain to hang from.
pub struct TarLister {
    base: String,
    source: ContentSource,
    pending: Option<VecDeque<Entry>>,
}

impl TarLister {
    pub fn new(base: impl Into<String>, source: ContentSource) -> Self {
        Self {
            base: base.into(),
            source,
            pending: None,
        }
    }

    fn read_headers(&self) -> Result<VecDeque<Entry>> {
        let mut archive = Archive::new((self.source)()?);
        let mut seen: HashSet<String> = HashSet::new();
        let mut entries = VecDeque::new();

        for item in archive.entries()? {
            let item = item?;
            let header = item.header();
            let inner = normalize(&String::from_utf8_lossy(&item.path_bytes()));
            if inner.is_empty() {
                continue;
            }
            let entry_type = header.entry_type();
            let is_dir = entry_type.is_dir();
            if !is_dir && !entry_type.is_file() {
                continue;
            }
            let modified = header.mtime().unwrap_or(0) as i64;

            // Implied parent folders first.
            let parts: Vec<&str> = inner.split(ARCHIVE_SEPARATOR).collect();
            for depth in 1..parts.len() {
                let folder = parts[..depth].join("/");
                let path = archive_child_path(&self.base, &folder, true);
                if seen.insert(path.clone()) {
                    entries.push_back(Entry {
                        path,
                        entry_type: EntryType::CompressedFolder,
                        modified: 0,
                        size: 0,
                        compressed_size: 0,
                        checksum: None,
                    });
                }
            }

            let path = archive_child_path(&self.base, &inner, is_dir);
            if !seen.insert(path.clone()) {
                // A later header wins for files; folders keep the first sighting.
                if !is_dir {
                    entries.retain(|e| e.path != path);
                } else {
                    continue;
                }
            }
            let size = if is_dir { 0 } else { header.size()? as i64 };
            entries.push_back(Entry {
                path,
                entry_type: if is_dir {
                    EntryType::CompressedFolder
                } else {
                    EntryType::CompressedFile
                },
                modified,
                size,
                compressed_size: size,
                checksum: None,
            });
        }
        Ok(entries)
    }

    fn inner_path<'a>(&self, entry: &'a Entry) -> Option<&'a str> {
        entry
            .path
            .strip_prefix(self.base.trim_end_matches(ARCHIVE_SEPARATOR))
            .and_then(|rest| rest.strip_prefix(ARCHIVE_SEPARATOR))
            .map(|rest| rest.trim_end_matches(ARCHIVE_SEPARATOR))
    }
}

fn normalize(raw: &str) -> String {
    raw.replace('\\', "/")
        .trim_start_matches("./")
        .trim_matches(ARCHIVE_SEPARATOR)
        .to_string()
}

impl EntryLister for TarLister {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        if self.pending.is_none() {
            self.pending = Some(self.read_headers()?);
        }
        Ok(self.pending.as_mut().and_then(|p| p.pop_front()))
    }

    /// Streams the member straight from the archive. The header pass only
    /// locates the data (the last header for a path wins, as in the
    /// listing); the content is then read from a fresh stream bounded to
    /// the member's size.
    fn open(&self, entry: &Entry) -> Result<ByteStream> {
        let wanted = self
            .inner_path(entry)
            .ok_or_else(|| Error::Lister(format!("{} is not inside {}", entry.path, self.base)))?
            .to_string();
        let mut location: Option<(u64, u64)> = None;
        {
            let mut archive = Archive::new((self.source)()?);
            for item in archive.entries()? {
                let item = item?;
                if !item.header().entry_type().is_file() {
                    continue;
                }
                if normalize(&String::from_utf8_lossy(&item.path_bytes())) == wanted {
                    location = Some((item.raw_file_position(), item.header().size()?));
                }
            }
        }
        let (offset, size) =
            location.ok_or_else(|| Error::Lister(format!("{} not found in archive", entry.path)))?;

        let mut stream = (self.source)()?;
        let skipped = io::copy(&mut (&mut stream).take(offset), &mut io::sink())?;
        if skipped != offset {
            return Err(Error::Lister(format!("{} truncated before {}", self.base, entry.path)));
        }
        Ok(Box::new(stream.take(size)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lister::bytes_source;

    pub(crate) fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_lists_files_and_implied_folders() {
        let data = build_tar(&[("x.txt", b"hello"), ("docs/readme.md", b"read me")]);
        let mut lister = TarLister::new("/tmp/b.tar", bytes_source(data));
        let entries = lister.collect_entries().unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/tmp/b.tar/x.txt", "/tmp/b.tar/docs/", "/tmp/b.tar/docs/readme.md"]
        );
        assert_eq!(entries[0].entry_type, EntryType::CompressedFile);
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[0].modified, 1_700_000_000);
        assert_eq!(entries[1].entry_type, EntryType::CompressedFolder);
    }

    #[test]
    fn test_open_reads_member_content() {
        let data = build_tar(&[("a", b"first"), ("b", b"second")]);
        let mut lister = TarLister::new("/t.tar", bytes_source(data));
        let entries = lister.collect_entries().unwrap();
        let mut content = String::new();
        lister
            .open(&entries[1])
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "second");
    }

    #[test]
    fn test_open_streams_large_member_without_neighbours() {
        let big = vec![b'z'; 3 * 1024 * 1024 + 17];
        let data = build_tar(&[("small", b"tiny"), ("big.bin", &big), ("after", b"tail")]);
        let mut lister = TarLister::new("/t.tar", bytes_source(data));
        let entries = lister.collect_entries().unwrap();

        let mut reader = lister.open(&entries[1]).unwrap();
        let mut chunk = vec![0u8; 64 * 1024];
        let mut total = 0usize;
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            assert!(chunk[..n].iter().all(|b| *b == b'z'));
            total += n;
        }
        assert_eq!(total, big.len());

        let mut tail = String::new();
        lister.open(&entries[2]).unwrap().read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "tail");
    }

    #[test]
    fn test_later_header_wins_on_open() {
        let data = build_tar(&[("dup", b"old"), ("dup", b"newer")]);
        let mut lister = TarLister::new("/t.tar", bytes_source(data));
        let entries = lister.collect_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 5);
        let mut content = String::new();
        lister.open(&entries[0]).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "newer");
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let mut lister = TarLister::new("/t.tar", bytes_source(vec![7u8; 1024]));
        assert!(lister.next_entry().is_err());
    }
}
