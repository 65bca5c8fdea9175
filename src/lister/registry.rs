use super::gzip::{GzipLister, TarGzLister};
use super::tar::TarLister;
use super::{ContentSource, EntryLister};
use crate::model::name_of;
use std::collections::HashMap;

pub type ListerConstructor = fn(String, ContentSource) -> Box<dyn EntryLister>;

fn tar_lister(base: String, source: ContentSource) -> Box<dyn EntryLister> {
    Box::new(TarLister::new(base, source))
}

fn tar_gz_lister(base: String, source: ContentSource) -> Box<dyn EntryLister> {
    Box::new(TarGzLister::new(base, source))
}

fn gzip_lister(base: String, source: ContentSource) -> Box<dyn EntryLister> {
    Box::new(GzipLister::new(base, source))
}

/// Archive format registry: extension to lister constructor. A format is
/// only used when its final extension is in the allow-list.
#[derive(Clone)]
pub struct ListerRegistry {
    formats: HashMap<&'static str, ListerConstructor>,
    allowed: Vec<String>,
}

impl ListerRegistry {
    pub fn new(allowed: &[String]) -> Self {
        let mut formats: HashMap<&'static str, ListerConstructor> = HashMap::new();
        formats.insert("tar", tar_lister);
        formats.insert("tgz", tar_gz_lister);
        formats.insert("tar.gz", tar_gz_lister);
        formats.insert("gz", gzip_lister);
        Self {
            formats,
            allowed: allowed.iter().map(|ext| ext.to_lowercase()).collect(),
        }
    }

    /// Registered format key for a path, preferring compound extensions.
    fn format_of(&self, path: &str) -> Option<&'static str> {
        let name = name_of(path).to_lowercase();
        let mut parts = name.rsplit('.');
        let last = parts.next()?;
        if last == name {
            return None;
        }
        if !self.allowed.iter().any(|ext| ext == last) {
            return None;
        }
        if let Some(prev) = parts.next() {
            let compound = format!("{}.{}", prev, last);
            if let Some((key, _)) = self.formats.get_key_value(compound.as_str()) {
                if name.len() > compound.len() {
                    return Some(*key);
                }
            }
        }
        self.formats.get_key_value(last).map(|(key, _)| *key)
    }

    pub fn is_archive(&self, path: &str) -> bool {
        self.format_of(path).is_some()
    }

    /// A lister over `source` for the archive at `path`, if archivable.
    pub fn lister_for(&self, path: &str, source: ContentSource) -> Option<Box<dyn EntryLister>> {
        let key = self.format_of(path)?;
        let constructor = self.formats.get(key)?;
        Some(constructor(path.to_string(), source))
    }
}
