use std::path::{Path, MAIN_SEPARATOR};

/// Separator used for paths inside archives, regardless of platform.
pub const ARCHIVE_SEPARATOR: char = '/';

pub const SEPARATORS: &[char] = &[MAIN_SEPARATOR, ARCHIVE_SEPARATOR];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Folder,
    File,
    CompressedFolder,
    CompressedFile,
}

impl EntryType {
    pub fn code(self) -> i64 {
        match self {
            EntryType::Folder => 0,
            EntryType::File => 1,
            EntryType::CompressedFolder => 2,
            EntryType::CompressedFile => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(EntryType::Folder),
            1 => Some(EntryType::File),
            2 => Some(EntryType::CompressedFolder),
            3 => Some(EntryType::CompressedFile),
            _ => None,
        }
    }

    pub fn is_folder(self) -> bool {
        matches!(self, EntryType::Folder | EntryType::CompressedFolder)
    }

    pub fn is_file(self) -> bool {
        matches!(self, EntryType::File | EntryType::CompressedFile)
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, EntryType::CompressedFolder | EntryType::CompressedFile)
    }
}

/// Listing state of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    Clean,
    Dirty,
    NoAccess,
}

impl EntryStatus {
    pub fn code(self) -> i64 {
        match self {
            EntryStatus::Clean => 0,
            EntryStatus::Dirty => 1,
            EntryStatus::NoAccess => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(EntryStatus::Clean),
            1 => Some(EntryStatus::Dirty),
            2 => Some(EntryStatus::NoAccess),
            _ => None,
        }
    }
}

/// A live or stored tree entry without storage identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub entry_type: EntryType,
    /// Seconds since the unix epoch.
    pub modified: i64,
    pub size: i64,
    pub compressed_size: i64,
    pub checksum: Option<u32>,
}

impl Entry {
    pub fn folder(path: impl Into<String>, modified: i64) -> Self {
        Self {
            path: path.into(),
            entry_type: EntryType::Folder,
            modified,
            size: 0,
            compressed_size: 0,
            checksum: None,
        }
    }

    pub fn file(path: impl Into<String>, modified: i64, size: i64) -> Self {
        Self {
            path: path.into(),
            entry_type: EntryType::File,
            modified,
            size,
            compressed_size: size,
            checksum: None,
        }
    }

    /// Attributes a listing can observe without reading content.
    pub fn same_attributes(&self, other: &Entry) -> bool {
        self.entry_type == other.entry_type
            && self.modified == other.modified
            && self.size == other.size
            && self.compressed_size == other.compressed_size
    }

    pub fn name(&self) -> &str {
        name_of(&self.path)
    }

    pub fn extension(&self) -> Option<String> {
        extension_of(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub root_id: i64,
    pub entry: Entry,
    pub status: EntryStatus,
    pub orphan: bool,
    pub duplicate_count: i64,
    pub dedupable_size: i64,
}

impl StoredEntry {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none() && self.root_id == self.id
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry.entry_type
    }

    pub fn path(&self) -> &str {
        &self.entry.path
    }
}

/// Closure edge: `lower` is a descendant of `upper` at `distance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpperLower {
    pub upper: i64,
    pub lower: i64,
    pub distance: i64,
}

/// Two entries confirmed byte-identical. Always stored with `id1 > id2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Equality {
    pub id1: i64,
    pub id2: i64,
    pub size: i64,
    pub checksum: u32,
    pub last_verified: i64,
}

impl Equality {
    pub fn new(a: i64, b: i64, size: i64, checksum: u32, last_verified: i64) -> Self {
        let (id1, id2) = if a > b { (a, b) } else { (b, a) };
        Self {
            id1,
            id2,
            size,
            checksum,
            last_verified,
        }
    }
}

// ── Path conventions ─────────────────────────────────────────

/// Canonical path of a real folder: always ends with the platform separator.
pub fn folder_path(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with(MAIN_SEPARATOR) {
        s.push(MAIN_SEPARATOR);
    }
    s
}

pub fn file_path(path: &Path) -> String {
    path.to_string_lossy()
        .trim_end_matches(MAIN_SEPARATOR)
        .to_string()
}

/// Path of an entry inside an archive. `base` is the containing archive entry.
pub fn archive_child_path(base: &str, inner: &str, is_folder: bool) -> String {
    let inner = inner
        .trim_start_matches("./")
        .trim_matches(ARCHIVE_SEPARATOR);
    let mut s = String::with_capacity(base.len() + inner.len() + 2);
    s.push_str(base.trim_end_matches(ARCHIVE_SEPARATOR));
    s.push(ARCHIVE_SEPARATOR);
    s.push_str(inner);
    if is_folder {
        s.push(ARCHIVE_SEPARATOR);
    }
    s
}

pub fn name_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATORS);
    trimmed
        .rsplit(SEPARATORS)
        .next()
        .unwrap_or(trimmed)
}

pub fn extension_of(path: &str) -> Option<String> {
    let name = name_of(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_lowercase()),
        _ => None,
    }
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
