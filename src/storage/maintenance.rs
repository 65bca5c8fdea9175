//! Set-based consistency passes run by the global maintenance layer.
//! Each returns the number of rows it changed so callers can repeat a
//! pass until it settles.

use super::queries::{row_to_entry, ENTRY_COLUMNS};
use super::sqlite::Database;
use crate::model::{EntryStatus, StoredEntry};
use rusqlite::{params, Result};
use tracing::debug;

impl Database {
    /// Bring distance-1 edges in line with live parent links.
    pub fn refresh_direct_edges(&self) -> Result<usize> {
        let deleted = self.connection().execute(
            "DELETE FROM upper_lower WHERE distance = 1 AND NOT EXISTS \
             (SELECT 1 FROM entry e WHERE e.id = upper_lower.lower \
              AND e.parent_id = upper_lower.upper AND e.orphan = 0)",
            [],
        )?;
        let inserted = self.connection().execute(
            "INSERT INTO upper_lower (upper, lower, distance) \
             SELECT e.parent_id, e.id, 1 FROM entry e \
             WHERE e.parent_id IS NOT NULL AND e.orphan = 0 \
               AND EXISTS (SELECT 1 FROM entry p WHERE p.id = e.parent_id) \
             ON CONFLICT(upper, lower) DO UPDATE SET distance = 1 \
             WHERE upper_lower.distance != 1",
            [],
        )?;
        debug!("Direct edges: {} removed, {} written", deleted, inserted);
        Ok(deleted + inserted)
    }

    /// One transitive step: drop indirect edges no longer backed by a chain,
    /// then extend every edge by one parent link. Repeat until zero.
    pub fn refresh_indirect_edges(&self) -> Result<usize> {
        let deleted = self.connection().execute(
            "DELETE FROM upper_lower WHERE distance > 1 AND NOT EXISTS \
             (SELECT 1 FROM entry e JOIN upper_lower a \
                ON a.lower = e.parent_id AND a.upper = upper_lower.upper \
              WHERE e.id = upper_lower.lower AND e.orphan = 0 \
                AND a.distance = upper_lower.distance - 1)",
            [],
        )?;
        let inserted = self.connection().execute(
            "INSERT INTO upper_lower (upper, lower, distance) \
             SELECT a.upper, e.id, a.distance + 1 FROM upper_lower a \
             JOIN entry e ON e.parent_id = a.lower \
             WHERE e.orphan = 0 \
             ON CONFLICT(upper, lower) DO UPDATE SET distance = excluded.distance \
             WHERE upper_lower.distance != excluded.distance",
            [],
        )?;
        debug!("Indirect edges: {} removed, {} written", deleted, inserted);
        Ok(deleted + inserted)
    }

    /// Files carrying archive children, walked by id from a cursor. The
    /// caller decides which of them are no longer archivable.
    pub fn unlisted_archive_candidates(&self, after_id: i64, limit: usize) -> Result<Vec<StoredEntry>> {
        let sql = format!(
            "SELECT {} FROM entry WHERE id > ?1 AND entry_type IN (1, 3) AND orphan = 0 AND EXISTS \
             (SELECT 1 FROM entry c WHERE c.parent_id = entry.id AND c.orphan = 0) \
             ORDER BY id LIMIT ?2",
            ENTRY_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt
            .query_map(params![after_id, limit as i64], row_to_entry)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Mark a file Dirty and detach everything listed from it.
    pub fn unlist_entry(&self, id: i64) -> Result<usize> {
        self.update_status(id, EntryStatus::Dirty)?;
        let n = self.connection().execute(
            "UPDATE entry SET orphan = 1 WHERE parent_id = ?1 AND orphan = 0",
            params![id],
        )?;
        Ok(n)
    }

    /// Propagate orphan state one level down, and catch entries whose parent
    /// row vanished.
    pub fn reorphanize_children(&self) -> Result<usize> {
        let n = self.connection().execute(
            "UPDATE entry SET orphan = 1 \
             WHERE orphan = 0 AND parent_id IS NOT NULL AND ( \
                parent_id IN (SELECT id FROM entry WHERE orphan = 1) \
                OR NOT EXISTS (SELECT 1 FROM entry p WHERE p.id = entry.parent_id))",
            [],
        )?;
        if n > 0 {
            debug!("Re-orphanized {} entries", n);
        }
        Ok(n)
    }

    /// Recompute per-file duplicate counts and dedupable sizes from the
    /// equality table, then roll dedupable size up to folders via closure.
    /// A file is dedupable when an identical copy with a lower id exists.
    pub fn recompute_duplicate_aggregates(&self) -> Result<usize> {
        let files = self.connection().execute(
            "UPDATE entry SET \
                duplicate_count = (SELECT COUNT(*) FROM equality q \
                                   WHERE q.id1 = entry.id OR q.id2 = entry.id), \
                dedupable_size = CASE WHEN EXISTS (SELECT 1 FROM equality q WHERE q.id1 = entry.id) \
                                      THEN size ELSE 0 END \
             WHERE entry_type IN (1, 3) AND orphan = 0 AND ( \
                duplicate_count != (SELECT COUNT(*) FROM equality q \
                                    WHERE q.id1 = entry.id OR q.id2 = entry.id) \
                OR dedupable_size != CASE WHEN EXISTS \
                    (SELECT 1 FROM equality q WHERE q.id1 = entry.id) THEN size ELSE 0 END)",
            [],
        )?;
        let folders = self.connection().execute(
            "UPDATE entry SET \
                duplicate_count = (SELECT COUNT(*) FROM upper_lower ul JOIN entry f ON f.id = ul.lower \
                                   WHERE ul.upper = entry.id AND f.entry_type IN (1, 3) \
                                     AND f.duplicate_count > 0), \
                dedupable_size = (SELECT COALESCE(SUM(f.dedupable_size), 0) FROM upper_lower ul \
                                  JOIN entry f ON f.id = ul.lower \
                                  WHERE ul.upper = entry.id AND f.entry_type IN (1, 3)) \
             WHERE entry_type IN (0, 2) AND orphan = 0",
            [],
        )?;
        debug!("Duplicate aggregates: {} files, {} folders", files, folders);
        Ok(files)
    }

    /// One bottom-up step of folder size rollup from direct children.
    pub fn recompute_folder_sizes(&self) -> Result<usize> {
        let n = self.connection().execute(
            "UPDATE entry SET \
                size = (SELECT COALESCE(SUM(c.size), 0) FROM entry c \
                        WHERE c.parent_id = entry.id AND c.orphan = 0), \
                compressed_size = (SELECT COALESCE(SUM(c.compressed_size), 0) FROM entry c \
                                   WHERE c.parent_id = entry.id AND c.orphan = 0) \
             WHERE entry_type IN (0, 2) AND orphan = 0 AND ( \
                size != (SELECT COALESCE(SUM(c.size), 0) FROM entry c \
                         WHERE c.parent_id = entry.id AND c.orphan = 0) \
                OR compressed_size != (SELECT COALESCE(SUM(c.compressed_size), 0) FROM entry c \
                                       WHERE c.parent_id = entry.id AND c.orphan = 0))",
            [],
        )?;
        Ok(n)
    }

    /// Delete up to `limit` orphaned entries together with their closure and
    /// equality rows.
    pub fn cleanup_orphans(&self, limit: usize) -> Result<usize> {
        let mut stmt = self
            .connection()
            .prepare("SELECT id FROM entry WHERE orphan = 1 ORDER BY id LIMIT ?1")?;
        let ids = stmt
            .query_map(params![limit as i64], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>>>()?;
        for id in &ids {
            self.delete_entry(*id)?;
        }
        if !ids.is_empty() {
            debug!("Deleted {} orphaned entries", ids.len());
        }
        Ok(ids.len())
    }

    /// Remove closure and equality rows pointing at missing entries, and
    /// equality rows whose endpoints no longer agree on size and checksum.
    pub fn cleanup_dangling(&self) -> Result<usize> {
        let edges = self.connection().execute(
            "DELETE FROM upper_lower WHERE \
                NOT EXISTS (SELECT 1 FROM entry e WHERE e.id = upper_lower.upper) \
                OR NOT EXISTS (SELECT 1 FROM entry e WHERE e.id = upper_lower.lower)",
            [],
        )?;
        let equalities = self.connection().execute(
            "DELETE FROM equality WHERE \
                NOT EXISTS (SELECT 1 FROM entry e WHERE e.id = equality.id1 AND e.orphan = 0 \
                            AND e.size = equality.size AND e.checksum = equality.checksum) \
                OR NOT EXISTS (SELECT 1 FROM entry e WHERE e.id = equality.id2 AND e.orphan = 0 \
                            AND e.size = equality.size AND e.checksum = equality.checksum)",
            [],
        )?;
        debug!(
            "Dangling rows removed: {} closure edges, {} equalities",
            edges, equalities
        );
        Ok(edges + equalities)
    }

    /// Force every clean real folder Dirty so the next cycle re-lists it.
    pub fn force_folders_dirty(&self) -> Result<usize> {
        self.connection().execute(
            "UPDATE entry SET status = ?1 WHERE entry_type = 0 AND status = ?2 AND orphan = 0",
            params![EntryStatus::Dirty.code(), EntryStatus::Clean.code()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entry, Equality};

    /// root / a / b / c.txt
    fn chain(db: &Database) -> (i64, i64, i64, i64) {
        let root = db.insert_root(&Entry::folder("/r/", 1)).unwrap();
        let a = db
            .insert_entry(root, root, &Entry::folder("/r/a/", 1), EntryStatus::Clean)
            .unwrap();
        let b = db
            .insert_entry(a, root, &Entry::folder("/r/a/b/", 1), EntryStatus::Clean)
            .unwrap();
        let c = db
            .insert_entry(b, root, &Entry::file("/r/a/b/c.txt", 1, 7), EntryStatus::Clean)
            .unwrap();
        (root, a, b, c)
    }

    fn settle(mut pass: impl FnMut() -> Result<usize>) {
        for _ in 0..16 {
            if pass().unwrap() == 0 {
                return;
            }
        }
        panic!("pass did not settle");
    }

    #[test]
    fn test_closure_has_one_row_per_ancestor() {
        let db = Database::open_in_memory().unwrap();
        let (root, a, b, c) = chain(&db);
        db.refresh_direct_edges().unwrap();
        settle(|| db.refresh_indirect_edges());

        let edges = db.upper_lower_of(c).unwrap();
        let got: Vec<(i64, i64)> = edges.iter().map(|e| (e.upper, e.distance)).collect();
        assert_eq!(got, vec![(b, 1), (a, 2), (root, 3)]);
        assert_eq!(db.descendant_count(root).unwrap(), 3);
    }

    #[test]
    fn test_closure_drops_rows_of_deleted_entries() {
        let db = Database::open_in_memory().unwrap();
        let (root, a, _b, c) = chain(&db);
        db.refresh_direct_edges().unwrap();
        settle(|| db.refresh_indirect_edges());

        db.orphanize_entry(a).unwrap();
        settle(|| db.reorphanize_children());
        settle(|| db.cleanup_orphans(100));
        db.cleanup_dangling().unwrap();
        db.refresh_direct_edges().unwrap();
        settle(|| db.refresh_indirect_edges());

        assert!(db.entry_by_id(c).unwrap().is_none());
        assert!(db.upper_lower_of(c).unwrap().is_empty());
        assert_eq!(db.descendant_count(root).unwrap(), 0);
    }

    #[test]
    fn test_folder_sizes_roll_up() {
        let db = Database::open_in_memory().unwrap();
        let (root, a, b, _c) = chain(&db);
        settle(|| db.recompute_folder_sizes());
        for id in [root, a, b] {
            assert_eq!(db.entry_by_id(id).unwrap().unwrap().entry.size, 7);
        }
    }

    #[test]
    fn test_dangling_equality_removed_on_checksum_change() {
        let db = Database::open_in_memory().unwrap();
        let root = db.insert_root(&Entry::folder("/r/", 1)).unwrap();
        let mut x = Entry::file("/r/x", 1, 5);
        x.checksum = Some(42);
        let mut y = Entry::file("/r/y", 1, 5);
        y.checksum = Some(42);
        let xi = db.insert_entry(root, root, &x, EntryStatus::Clean).unwrap();
        let yi = db.insert_entry(root, root, &y, EntryStatus::Clean).unwrap();
        db.insert_equality(&Equality::new(xi, yi, 5, 42, 0)).unwrap();
        assert_eq!(db.cleanup_dangling().unwrap(), 0);

        y.checksum = Some(43);
        db.update_entry(yi, &y, EntryStatus::Clean).unwrap();
        db.cleanup_dangling().unwrap();
        assert_eq!(db.equality_count().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_aggregates_mark_higher_id_dedupable() {
        let db = Database::open_in_memory().unwrap();
        let root = db.insert_root(&Entry::folder("/r/", 1)).unwrap();
        let mut x = Entry::file("/r/x", 1, 5);
        x.checksum = Some(1);
        let mut y = Entry::file("/r/y", 1, 5);
        y.checksum = Some(1);
        let xi = db.insert_entry(root, root, &x, EntryStatus::Clean).unwrap();
        let yi = db.insert_entry(root, root, &y, EntryStatus::Clean).unwrap();
        db.insert_equality(&Equality::new(xi, yi, 5, 1, 0)).unwrap();
        db.refresh_direct_edges().unwrap();
        db.recompute_duplicate_aggregates().unwrap();

        let xs = db.entry_by_id(xi).unwrap().unwrap();
        let ys = db.entry_by_id(yi).unwrap().unwrap();
        assert_eq!((xs.duplicate_count, xs.dedupable_size), (1, 0));
        assert_eq!((ys.duplicate_count, ys.dedupable_size), (1, 5));
        assert_eq!(db.entry_by_id(root).unwrap().unwrap().dedupable_size, 5);
    }
}
