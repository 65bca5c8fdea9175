use super::sqlite::Database;
use crate::model::{Entry, EntryStatus, EntryType, Equality, StoredEntry, UpperLower};
use rusqlite::{params, ErrorCode, OptionalExtension, Result, Row};
use tracing::{debug, warn};

pub(crate) const ENTRY_COLUMNS: &str = "id, path, entry_type, modified, size, compressed_size, \
     checksum, status, parent_id, root_id, orphan, duplicate_count, dedupable_size";

const FILE_TYPES: &str = "(1, 3)";

pub(crate) fn row_to_entry(row: &Row<'_>) -> Result<StoredEntry> {
    let type_code: i64 = row.get(2)?;
    let status_code: i64 = row.get(7)?;
    let entry_type =
        EntryType::from_code(type_code).ok_or(rusqlite::Error::IntegralValueOutOfRange(2, type_code))?;
    let status = EntryStatus::from_code(status_code)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(7, status_code))?;
    let checksum: Option<i64> = row.get(6)?;
    Ok(StoredEntry {
        id: row.get(0)?,
        parent_id: row.get(8)?,
        root_id: row.get(9)?,
        entry: Entry {
            path: row.get(1)?,
            entry_type,
            modified: row.get(3)?,
            size: row.get(4)?,
            compressed_size: row.get(5)?,
            checksum: checksum.map(|c| c as u32),
        },
        status,
        orphan: row.get(10)?,
        duplicate_count: row.get(11)?,
        dedupable_size: row.get(12)?,
    })
}

/// Bounded discovery queries issued by the first scheduler layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryQuery {
    FoldersWithChildren,
    FoldersWithoutChildren,
    ArchivesWithChildren,
    FilesWithoutChildren,
    NoAccessFoldersWithChildren,
    NoAccessFoldersWithoutChildren,
}

impl DiscoveryQuery {
    fn condition(self) -> String {
        let (filter, with_children) = match self {
            DiscoveryQuery::FoldersWithChildren => ("entry_type = 0 AND status = 1", true),
            DiscoveryQuery::FoldersWithoutChildren => ("entry_type = 0 AND status = 1", false),
            DiscoveryQuery::ArchivesWithChildren => ("entry_type IN (1, 3) AND status = 1", true),
            DiscoveryQuery::FilesWithoutChildren => ("entry_type IN (1, 3) AND status = 1", false),
            DiscoveryQuery::NoAccessFoldersWithChildren => ("entry_type = 0 AND status = 2", true),
            DiscoveryQuery::NoAccessFoldersWithoutChildren => {
                ("entry_type = 0 AND status = 2", false)
            }
        };
        format!(
            "{} AND {}EXISTS (SELECT 1 FROM entry c WHERE c.parent_id = entry.id AND c.orphan = 0)",
            filter,
            if with_children { "" } else { "NOT " }
        )
    }

    /// Folder phases whose exhaustion triggers a full re-listing pass.
    pub fn is_folder_listing(self) -> bool {
        matches!(
            self,
            DiscoveryQuery::FoldersWithChildren | DiscoveryQuery::FoldersWithoutChildren
        )
    }
}

fn root_exclusion(exclude_roots: &[i64]) -> String {
    if exclude_roots.is_empty() {
        return String::new();
    }
    let ids: Vec<String> = exclude_roots.iter().map(|id| id.to_string()).collect();
    format!(" AND root_id NOT IN ({})", ids.join(", "))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub entries: i64,
    pub folders: i64,
    pub files: i64,
    pub compressed: i64,
    pub dirty: i64,
    pub no_access: i64,
    pub orphans: i64,
    pub closure_edges: i64,
    pub equalities: i64,
    pub dedupable_bytes: i64,
}

#[derive(Debug, Clone)]
pub struct DuplicatePair {
    pub path1: String,
    pub path2: String,
    pub size: i64,
    pub checksum: u32,
    pub last_verified: i64,
}

impl Database {
    // ── Entry reads ──────────────────────────────────────────────

    pub fn entry_by_id(&self, id: i64) -> Result<Option<StoredEntry>> {
        self.connection()
            .query_row(
                &format!("SELECT {} FROM entry WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                row_to_entry,
            )
            .optional()
    }

    pub fn entry_by_path(&self, path: &str) -> Result<Option<StoredEntry>> {
        self.connection()
            .query_row(
                &format!("SELECT {} FROM entry WHERE path = ?1", ENTRY_COLUMNS),
                params![path],
                row_to_entry,
            )
            .optional()
    }

    /// Live (non-orphan) direct children.
    pub fn children_of(&self, parent_id: i64) -> Result<Vec<StoredEntry>> {
        let mut stmt = self.connection().prepare_cached(&format!(
            "SELECT {} FROM entry WHERE parent_id = ?1 AND orphan = 0 ORDER BY path",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![parent_id], row_to_entry)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Entries produced by listing one archive: its children plus everything
    /// under its CompressedFolders, but not the content of nested archives.
    pub fn archive_children_of(&self, archive_id: i64) -> Result<Vec<StoredEntry>> {
        let mut result = Vec::new();
        let mut pending = vec![archive_id];
        while let Some(parent) = pending.pop() {
            for child in self.children_of(parent)? {
                if child.entry_type() == EntryType::CompressedFolder {
                    pending.push(child.id);
                }
                result.push(child);
            }
        }
        Ok(result)
    }

    pub fn child_count(&self, parent_id: i64) -> Result<i64> {
        self.connection().query_row(
            "SELECT COUNT(*) FROM entry WHERE parent_id = ?1 AND orphan = 0",
            params![parent_id],
            |row| row.get(0),
        )
    }

    pub fn roots(&self) -> Result<Vec<StoredEntry>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM entry WHERE parent_id IS NULL AND root_id = id AND orphan = 0 \
             ORDER BY id",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], row_to_entry)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn root_ids(&self) -> Result<Vec<i64>> {
        Ok(self.roots()?.into_iter().map(|r| r.id).collect())
    }

    // ── Scheduler queries ────────────────────────────────────────

    pub fn discovery_batch(
        &self,
        query: DiscoveryQuery,
        exclude_roots: &[i64],
        limit: usize,
    ) -> Result<Vec<StoredEntry>> {
        let sql = format!(
            "SELECT {} FROM entry WHERE orphan = 0 AND {}{} ORDER BY id LIMIT ?1",
            ENTRY_COLUMNS,
            query.condition(),
            root_exclusion(exclude_roots)
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_entry)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Files without a checksum that share their size with another file,
    /// largest first.
    pub fn size_collision_candidates(&self, limit: usize) -> Result<Vec<StoredEntry>> {
        let sql = format!(
            "SELECT {cols} FROM entry e \
             WHERE e.entry_type IN {ft} AND e.checksum IS NULL AND e.status != 2 \
               AND e.orphan = 0 AND e.size > 0 \
               AND EXISTS (SELECT 1 FROM entry o WHERE o.size = e.size AND o.id != e.id \
                           AND o.entry_type IN {ft} AND o.orphan = 0) \
             ORDER BY e.size DESC, e.id LIMIT ?1",
            cols = prefixed_columns("e"),
            ft = FILE_TYPES
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_entry)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Pairs agreeing on size and checksum that have no equality row yet.
    pub fn equality_candidates(&self, limit: usize) -> Result<Vec<(i64, i64)>> {
        let sql = format!(
            "SELECT a.id, b.id FROM entry a \
             JOIN entry b ON b.size = a.size AND b.checksum = a.checksum AND b.id < a.id \
             WHERE a.entry_type IN {ft} AND b.entry_type IN {ft} \
               AND a.checksum IS NOT NULL AND a.orphan = 0 AND b.orphan = 0 \
               AND a.status != 2 AND b.status != 2 \
               AND NOT EXISTS (SELECT 1 FROM equality q WHERE q.id1 = a.id AND q.id2 = b.id) \
             ORDER BY a.size DESC LIMIT ?1",
            ft = FILE_TYPES
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Equality rows verified before `before`, oldest first.
    pub fn stale_equalities(&self, before: i64, limit: usize) -> Result<Vec<Equality>> {
        let mut stmt = self.connection().prepare(
            "SELECT id1, id2, size, checksum, last_verified FROM equality \
             WHERE last_verified < ?1 ORDER BY last_verified LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![before, limit as i64], row_to_equality)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn no_access_files(&self, limit: usize) -> Result<Vec<StoredEntry>> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {} FROM entry WHERE entry_type IN {} AND status = 2 AND orphan = 0 \
             ORDER BY id LIMIT ?1",
            ENTRY_COLUMNS, FILE_TYPES
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_entry)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Clean real entries under clean parents, walked by id from a cursor.
    pub fn touch_candidates(&self, after_id: i64, limit: usize) -> Result<Vec<StoredEntry>> {
        let sql = format!(
            "SELECT {} FROM entry e \
             WHERE e.id > ?1 AND e.status = 0 AND e.orphan = 0 AND e.entry_type IN (0, 1) \
               AND (e.parent_id IS NULL OR EXISTS \
                    (SELECT 1 FROM entry p WHERE p.id = e.parent_id AND p.status = 0)) \
             ORDER BY e.id LIMIT ?2",
            prefixed_columns("e")
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt
            .query_map(params![after_id, limit as i64], row_to_entry)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Closure and equality reads ───────────────────────────────

    pub fn upper_lower_of(&self, lower: i64) -> Result<Vec<UpperLower>> {
        let mut stmt = self.connection().prepare(
            "SELECT upper, lower, distance FROM upper_lower WHERE lower = ?1 ORDER BY distance",
        )?;
        let rows = stmt
            .query_map(params![lower], |row| {
                Ok(UpperLower {
                    upper: row.get(0)?,
                    lower: row.get(1)?,
                    distance: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn descendant_count(&self, upper: i64) -> Result<i64> {
        self.connection().query_row(
            "SELECT COUNT(*) FROM upper_lower WHERE upper = ?1",
            params![upper],
            |row| row.get(0),
        )
    }

    pub fn equality(&self, a: i64, b: i64) -> Result<Option<Equality>> {
        let (id1, id2) = if a > b { (a, b) } else { (b, a) };
        self.connection()
            .query_row(
                "SELECT id1, id2, size, checksum, last_verified FROM equality \
                 WHERE id1 = ?1 AND id2 = ?2",
                params![id1, id2],
                row_to_equality,
            )
            .optional()
    }

    pub fn equality_count(&self) -> Result<i64> {
        self.connection()
            .query_row("SELECT COUNT(*) FROM equality", [], |row| row.get(0))
    }

    pub fn duplicate_pairs(&self, offset: i64, limit: i64) -> Result<Vec<DuplicatePair>> {
        let mut stmt = self.connection().prepare(
            "SELECT a.path, b.path, q.size, q.checksum, q.last_verified FROM equality q \
             JOIN entry a ON a.id = q.id1 \
             JOIN entry b ON b.id = q.id2 \
             ORDER BY q.size DESC, q.id1 LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset], |row| {
                Ok(DuplicatePair {
                    path1: row.get(0)?,
                    path2: row.get(1)?,
                    size: row.get(2)?,
                    checksum: row.get::<_, i64>(3)? as u32,
                    last_verified: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.connection().query_row(
            "SELECT COUNT(*), \
                    COALESCE(SUM(entry_type = 0), 0), \
                    COALESCE(SUM(entry_type = 1), 0), \
                    COALESCE(SUM(entry_type IN (2, 3)), 0), \
                    COALESCE(SUM(status = 1), 0), \
                    COALESCE(SUM(status = 2), 0), \
                    COALESCE(SUM(orphan = 1), 0), \
                    (SELECT COUNT(*) FROM upper_lower), \
                    (SELECT COUNT(*) FROM equality), \
                    COALESCE(SUM(CASE WHEN entry_type IN (1, 3) THEN dedupable_size END), 0) \
             FROM entry",
            [],
            |row| {
                Ok(IndexStats {
                    entries: row.get(0)?,
                    folders: row.get(1)?,
                    files: row.get(2)?,
                    compressed: row.get(3)?,
                    dirty: row.get(4)?,
                    no_access: row.get(5)?,
                    orphans: row.get(6)?,
                    closure_edges: row.get(7)?,
                    equalities: row.get(8)?,
                    dedupable_bytes: row.get(9)?,
                })
            },
        )
    }

    // ── Entry writes ─────────────────────────────────────────────

    /// Insert a top-level entry that is its own root.
    pub fn insert_root(&self, entry: &Entry) -> Result<i64> {
        if let Some(existing) = self.entry_by_path(&entry.path)? {
            if existing.is_root() && !existing.orphan {
                return Ok(existing.id);
            }
            self.delete_entry(existing.id)?;
        }
        self.connection().execute(
            "INSERT INTO entry (path, entry_type, modified, size, compressed_size, status, \
                                parent_id, root_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 0)",
            params![
                entry.path,
                entry.entry_type.code(),
                entry.modified,
                entry.size,
                entry.compressed_size,
                EntryStatus::Dirty.code(),
            ],
        )?;
        let id = self.connection().last_insert_rowid();
        self.connection()
            .execute("UPDATE entry SET root_id = id WHERE id = ?1", params![id])?;
        debug!("Inserted root {} as {}", entry.path, id);
        Ok(id)
    }

    /// Insert a child. A path conflict first tries to revive the existing row
    /// (orphaned, or already attached to the same parent), otherwise the
    /// stale row is removed and the insert retried.
    pub fn insert_entry(
        &self,
        parent_id: i64,
        root_id: i64,
        entry: &Entry,
        status: EntryStatus,
    ) -> Result<i64> {
        match self.try_insert_entry(parent_id, root_id, entry, status) {
            Ok(id) => Ok(id),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                let existing = match self.entry_by_path(&entry.path)? {
                    Some(existing) => existing,
                    None => return self.try_insert_entry(parent_id, root_id, entry, status),
                };
                if existing.orphan || existing.parent_id == Some(parent_id) {
                    debug!("Reviving {} ({})", entry.path, existing.id);
                    self.revive_entry(existing.id, parent_id, root_id, entry, status)?;
                    Ok(existing.id)
                } else {
                    warn!(
                        "Path {} already indexed under parent {:?}, replacing",
                        entry.path, existing.parent_id
                    );
                    self.delete_entry(existing.id)?;
                    self.try_insert_entry(parent_id, root_id, entry, status)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn try_insert_entry(
        &self,
        parent_id: i64,
        root_id: i64,
        entry: &Entry,
        status: EntryStatus,
    ) -> Result<i64> {
        let mut stmt = self.connection().prepare_cached(
            "INSERT INTO entry (path, entry_type, modified, size, compressed_size, checksum, \
                                status, parent_id, root_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        stmt.execute(params![
            entry.path,
            entry.entry_type.code(),
            entry.modified,
            entry.size,
            entry.compressed_size,
            entry.checksum.map(i64::from),
            status.code(),
            parent_id,
            root_id,
        ])?;
        Ok(self.connection().last_insert_rowid())
    }

    fn revive_entry(
        &self,
        id: i64,
        parent_id: i64,
        root_id: i64,
        entry: &Entry,
        status: EntryStatus,
    ) -> Result<()> {
        self.connection().execute(
            "UPDATE entry SET entry_type = ?2, modified = ?3, size = ?4, compressed_size = ?5, \
                              checksum = ?6, status = ?7, parent_id = ?8, root_id = ?9, orphan = 0 \
             WHERE id = ?1",
            params![
                id,
                entry.entry_type.code(),
                entry.modified,
                entry.size,
                entry.compressed_size,
                entry.checksum.map(i64::from),
                status.code(),
                parent_id,
                root_id,
            ],
        )?;
        Ok(())
    }

    pub fn update_entry(&self, id: i64, entry: &Entry, status: EntryStatus) -> Result<()> {
        let mut stmt = self.connection().prepare_cached(
            "UPDATE entry SET entry_type = ?2, modified = ?3, size = ?4, compressed_size = ?5, \
                              checksum = ?6, status = ?7 \
             WHERE id = ?1",
        )?;
        stmt.execute(params![
            id,
            entry.entry_type.code(),
            entry.modified,
            entry.size,
            entry.compressed_size,
            entry.checksum.map(i64::from),
            status.code(),
        ])?;
        Ok(())
    }

    pub fn update_status(&self, id: i64, status: EntryStatus) -> Result<()> {
        let mut stmt = self
            .connection()
            .prepare_cached("UPDATE entry SET status = ?2 WHERE id = ?1")?;
        stmt.execute(params![id, status.code()])?;
        Ok(())
    }

    /// Remove an entry and every closure/equality row that mentions it.
    pub fn delete_entry(&self, id: i64) -> Result<()> {
        self.connection()
            .execute("DELETE FROM upper_lower WHERE upper = ?1 OR lower = ?1", params![id])?;
        self.connection()
            .execute("DELETE FROM equality WHERE id1 = ?1 OR id2 = ?1", params![id])?;
        self.connection()
            .execute("DELETE FROM entry WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Mark NoAccess (optionally with fresh attributes) and flag the parent Dirty.
    pub fn disable_entry(&self, id: i64, entry: Option<&Entry>) -> Result<()> {
        match entry {
            Some(entry) => self.update_entry(id, entry, EntryStatus::NoAccess)?,
            None => self.update_status(id, EntryStatus::NoAccess)?,
        }
        self.connection().execute(
            "UPDATE entry SET status = ?2 \
             WHERE id = (SELECT parent_id FROM entry WHERE id = ?1) AND status = ?3",
            params![id, EntryStatus::Dirty.code(), EntryStatus::Clean.code()],
        )?;
        Ok(())
    }

    /// Detach from the parent. `parent_id` is kept so maintenance can reap
    /// the subtree later.
    pub fn orphanize_entry(&self, id: i64) -> Result<()> {
        self.connection()
            .execute("UPDATE entry SET orphan = 1 WHERE id = ?1", params![id])?;
        self.connection()
            .execute("DELETE FROM equality WHERE id1 = ?1 OR id2 = ?1", params![id])?;
        Ok(())
    }

    pub fn update_duplicate_fields(
        &self,
        id: i64,
        duplicate_count: i64,
        dedupable_size: i64,
    ) -> Result<()> {
        self.connection().execute(
            "UPDATE entry SET duplicate_count = ?2, dedupable_size = ?3 WHERE id = ?1",
            params![id, duplicate_count, dedupable_size],
        )?;
        Ok(())
    }

    // ── Closure writes ───────────────────────────────────────────

    pub fn insert_upper_lower(&self, edge: &UpperLower) -> Result<()> {
        self.connection().execute(
            "INSERT INTO upper_lower (upper, lower, distance) VALUES (?1, ?2, ?3) \
             ON CONFLICT(upper, lower) DO UPDATE SET distance = excluded.distance",
            params![edge.upper, edge.lower, edge.distance],
        )?;
        Ok(())
    }

    pub fn delete_upper_lower(&self, upper: i64, lower: i64) -> Result<()> {
        self.connection().execute(
            "DELETE FROM upper_lower WHERE upper = ?1 AND lower = ?2",
            params![upper, lower],
        )?;
        Ok(())
    }

    // ── Equality writes ──────────────────────────────────────────

    /// Insert or refresh; argument order does not matter.
    pub fn insert_equality(&self, eq: &Equality) -> Result<()> {
        let eq = Equality::new(eq.id1, eq.id2, eq.size, eq.checksum, eq.last_verified);
        self.connection().execute(
            "INSERT INTO equality (id1, id2, size, checksum, last_verified) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(id1, id2) DO UPDATE SET size = excluded.size, \
                 checksum = excluded.checksum, last_verified = excluded.last_verified",
            params![eq.id1, eq.id2, eq.size, i64::from(eq.checksum), eq.last_verified],
        )?;
        Ok(())
    }

    pub fn update_equality(&self, eq: &Equality) -> Result<()> {
        let eq = Equality::new(eq.id1, eq.id2, eq.size, eq.checksum, eq.last_verified);
        self.connection().execute(
            "UPDATE equality SET size = ?3, checksum = ?4, last_verified = ?5 \
             WHERE id1 = ?1 AND id2 = ?2",
            params![eq.id1, eq.id2, eq.size, i64::from(eq.checksum), eq.last_verified],
        )?;
        Ok(())
    }

    pub fn delete_equality(&self, a: i64, b: i64) -> Result<()> {
        let (id1, id2) = if a > b { (a, b) } else { (b, a) };
        self.connection().execute(
            "DELETE FROM equality WHERE id1 = ?1 AND id2 = ?2",
            params![id1, id2],
        )?;
        Ok(())
    }
}

fn row_to_equality(row: &Row<'_>) -> Result<Equality> {
    Ok(Equality {
        id1: row.get(0)?,
        id2: row.get(1)?,
        size: row.get(2)?,
        checksum: row.get::<_, i64>(3)? as u32,
        last_verified: row.get(4)?,
    })
}

fn prefixed_columns(alias: &str) -> String {
    ENTRY_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let root = db.insert_root(&Entry::folder("/data/", 100)).unwrap();
        (db, root)
    }

    #[test]
    fn test_root_is_its_own_root() {
        let (db, root) = seeded();
        let stored = db.entry_by_id(root).unwrap().unwrap();
        assert!(stored.is_root());
        assert_eq!(stored.status, EntryStatus::Dirty);
        assert_eq!(db.insert_root(&Entry::folder("/data/", 100)).unwrap(), root);
    }

    #[test]
    fn test_insert_revives_orphan_by_path() {
        let (db, root) = seeded();
        let id = db
            .insert_entry(root, root, &Entry::file("/data/a.txt", 1, 10), EntryStatus::Dirty)
            .unwrap();
        db.orphanize_entry(id).unwrap();
        assert!(db.children_of(root).unwrap().is_empty());

        let revived = db
            .insert_entry(root, root, &Entry::file("/data/a.txt", 2, 20), EntryStatus::Dirty)
            .unwrap();
        assert_eq!(revived, id);
        let stored = db.entry_by_id(id).unwrap().unwrap();
        assert!(!stored.orphan);
        assert_eq!(stored.entry.size, 20);
    }

    #[test]
    fn test_disable_flags_parent_dirty() {
        let (db, root) = seeded();
        db.update_status(root, EntryStatus::Clean).unwrap();
        let id = db
            .insert_entry(root, root, &Entry::file("/data/a.txt", 1, 10), EntryStatus::Clean)
            .unwrap();
        db.disable_entry(id, None).unwrap();
        assert_eq!(db.entry_by_id(id).unwrap().unwrap().status, EntryStatus::NoAccess);
        assert_eq!(db.entry_by_id(root).unwrap().unwrap().status, EntryStatus::Dirty);
    }

    #[test]
    fn test_discovery_excludes_roots() {
        let (db, root) = seeded();
        let other = db.insert_root(&Entry::folder("/other/", 100)).unwrap();
        let found = db
            .discovery_batch(DiscoveryQuery::FoldersWithoutChildren, &[root], 10)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, other);
    }

    #[test]
    fn test_size_collision_candidates_largest_first() {
        let (db, root) = seeded();
        for (name, size) in [("a", 10), ("b", 10), ("c", 99), ("d", 500), ("e", 500)] {
            db.insert_entry(
                root,
                root,
                &Entry::file(format!("/data/{}", name), 1, size),
                EntryStatus::Clean,
            )
            .unwrap();
        }
        let found = db.size_collision_candidates(10).unwrap();
        let sizes: Vec<i64> = found.iter().map(|e| e.entry.size).collect();
        assert_eq!(sizes, vec![500, 500, 10, 10]);
    }
}
