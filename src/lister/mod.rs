//! Entry listers: one uniform way to enumerate the children of a real
//! folder or of any archive level, and to read their content.

pub mod directory;
pub mod gzip;
pub mod registry;
pub mod tar;

use crate::error::Result;
use crate::model::Entry;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

pub use directory::DirectoryLister;
pub use registry::ListerRegistry;

pub type ByteStream = Box<dyn Read + Send>;

/// A byte source that can be opened again from the start. Archive levels
/// are re-walked through these instead of caching streams.
pub type ContentSource = Arc<dyn Fn() -> io::Result<ByteStream> + Send + Sync>;

/// Lazily enumerates entries. Finite and not restartable; never yields two
/// entries with the same path.
pub trait EntryLister: Send {
    fn next_entry(&mut self) -> Result<Option<Entry>>;

    /// Open the content of an entry produced by this lister.
    fn open(&self, entry: &Entry) -> Result<ByteStream>;

    /// Children seen so far that exist but could not be described. Their
    /// stored rows are disabled, never orphanized.
    fn unreadable(&self) -> &[String] {
        &[]
    }

    /// Drain the remaining entries.
    fn collect_entries(&mut self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}

pub fn file_source(path: impl Into<PathBuf>) -> ContentSource {
    let path = path.into();
    Arc::new(move || Ok(Box::new(File::open(&path)?) as ByteStream))
}

pub fn bytes_source(bytes: Vec<u8>) -> ContentSource {
    let bytes = Arc::new(bytes);
    Arc::new(move || Ok(Box::new(io::Cursor::new(bytes.as_ref().clone())) as ByteStream))
}

/// Counts bytes pulled through a reader.
pub(crate) struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
