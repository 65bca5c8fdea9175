use super::tar::TarLister;
use super::{ByteStream, ContentSource, CountingReader, EntryLister};
use crate::error::{Error, Result};
use crate::model::{archive_child_path, name_of, Entry, EntryType};
use flate2::read::GzDecoder;
use std::io::{self, Read};
use std::sync::Arc;

/// Wrap a source so every open yields the decompressed stream.
pub fn gunzip_source(source: ContentSource) -> ContentSource {
    Arc::new(move || Ok(Box::new(GzDecoder::new(source()?)) as ByteStream))
}

/// Name of the single member of a gzip stream: the container name without
/// its `.gz` suffix.
pub fn member_name(base: &str) -> String {
    let name = name_of(base);
    let lower = name.to_lowercase();
    let stem = if lower.ends_with(".gz") {
        &name[..name.len() - 3]
    } else {
        name
    };
    if stem.is_empty() {
        "data".to_string()
    } else {
        stem.to_string()
    }
}

/// Single-member compressor: exposes exactly one CompressedFile.
pub struct GzipLister {
    base: String,
    source: ContentSource,
    done: bool,
}

impl GzipLister {
    pub fn new(base: impl Into<String>, source: ContentSource) -> Self {
        Self {
            base: base.into(),
            source,
            done: false,
        }
    }

    fn member_path(&self) -> String {
        archive_child_path(&self.base, &member_name(&self.base), false)
    }
}

impl EntryLister for GzipLister {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let mut compressed = CountingReader::new((self.source)()?);
        let (size, modified) = {
            let mut decoder = GzDecoder::new(&mut compressed);
            let size = io::copy(&mut decoder, &mut io::sink())?;
            let modified = decoder.header().map(|h| h.mtime() as i64).unwrap_or(0);
            (size as i64, modified)
        };
        Ok(Some(Entry {
            path: self.member_path(),
            entry_type: EntryType::CompressedFile,
            modified,
            size,
            compressed_size: compressed.count() as i64,
            checksum: None,
        }))
    }

    fn open(&self, entry: &Entry) -> Result<ByteStream> {
        if entry.path != self.member_path() {
            return Err(Error::Lister(format!(
                "{} is not the member of {}",
                entry.path, self.base
            )));
        }
        let mut stream: ByteStream = Box::new(GzDecoder::new((self.source)()?));
        // Surface a corrupt header now rather than on the first read.
        let mut first = [0u8; 1];
        let n = stream.read(&mut first)?;
        Ok(Box::new(io::Cursor::new(first[..n].to_vec()).chain(stream)))
    }
}

/// `.tgz` / `.tar.gz`: a tar stream behind gzip.
pub struct TarGzLister {
    inner: TarLister,
}

impl TarGzLister {
    pub fn new(base: impl Into<String>, source: ContentSource) -> Self {
        Self {
            inner: TarLister::new(base, gunzip_source(source)),
        }
    }
}

impl EntryLister for TarGzLister {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.inner.next_entry()
    }

    fn open(&self, entry: &Entry) -> Result<ByteStream> {
        self.inner.open(entry)
    }
}
