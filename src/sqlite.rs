//! Relational [`AllocationStore`] backed by SQLite.
//!
//! Layout (one row per target in both `table_a` and `table_c`):
//!
//! ```text
//! table_a(seqno INTEGER PRIMARY KEY, entity_type TEXT)   -- target category
//! table_b(entity_type TEXT, tino TEXT)                   -- candidate pool
//! table_c(seqno INTEGER PRIMARY KEY, tino TEXT NULL)     -- target identifier
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{Assignment, Category, SourcePosition, SourceRow, TargetKey};
use crate::store::AllocationStore;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS table_a (
    seqno INTEGER PRIMARY KEY,
    entity_type TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_table_a_entity_type ON table_a(entity_type, seqno);
CREATE TABLE IF NOT EXISTS table_b (
    entity_type TEXT NOT NULL,
    tino TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_table_b_entity_type ON table_b(entity_type);
CREATE TABLE IF NOT EXISTS table_c (
    seqno INTEGER PRIMARY KEY,
    tino TEXT
);
";

const SELECT_ASSIGNED: &str = "SELECT c.tino FROM table_c c JOIN table_a a ON a.seqno = c.seqno \
     WHERE a.entity_type = ?1 AND c.tino IS NOT NULL";

const SELECT_UNASSIGNED_ORDERED: &str = "SELECT c.seqno FROM table_c c JOIN table_a a ON a.seqno = c.seqno \
     WHERE a.entity_type = ?1 AND c.tino IS NULL AND c.seqno > ?2 \
     ORDER BY c.seqno LIMIT ?3";

const SELECT_UNASSIGNED: &str = "SELECT c.seqno FROM table_c c JOIN table_a a ON a.seqno = c.seqno \
     WHERE a.entity_type = ?1 AND c.tino IS NULL LIMIT ?2";

const SELECT_CANDIDATES: &str = "SELECT rowid, tino FROM table_b \
     WHERE entity_type = ?1 AND rowid > ?2 ORDER BY rowid LIMIT ?3";

const UPDATE_GUARDED: &str = "UPDATE table_c SET tino = ?1 \
     WHERE seqno = ?2 AND tino IS NULL \
     AND seqno IN (SELECT seqno FROM table_a WHERE entity_type = ?3)";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(30))?;
        Ok(Self { conn })
    }

    /// Create the three tables if they do not exist. Used for fixtures and demos.
    pub fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("create allocation schema")?;
        Ok(())
    }

    /// Insert target rows for `category` in one transaction.
    pub fn insert_targets<I>(&mut self, category: &Category, rows: I) -> Result<usize>
    where
        I: IntoIterator<Item = (TargetKey, Option<String>)>,
    {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut insert_a =
                tx.prepare_cached("INSERT INTO table_a (seqno, entity_type) VALUES (?1, ?2)")?;
            let mut insert_c =
                tx.prepare_cached("INSERT INTO table_c (seqno, tino) VALUES (?1, ?2)")?;
            for (key, identifier) in rows {
                insert_a.execute(params![key.0, category.as_str()])?;
                insert_c.execute(params![key.0, identifier])?;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Append candidate identifiers for `category` in one transaction.
    pub fn insert_candidates<I, S>(&mut self, category: &Category, identifiers: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut insert =
                tx.prepare_cached("INSERT INTO table_b (entity_type, tino) VALUES (?1, ?2)")?;
            for identifier in identifiers {
                insert.execute(params![category.as_str(), identifier.as_ref()])?;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn identifier_of(&self, key: TargetKey) -> Result<Option<String>> {
        let identifier: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT tino FROM table_c WHERE seqno = ?1",
                params![key.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(identifier.flatten())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl AllocationStore for SqliteStore {
    fn for_each_assigned(&mut self, category: &Category, f: &mut dyn FnMut(&str)) -> Result<u64> {
        let mut stmt = self.conn.prepare_cached(SELECT_ASSIGNED)?;
        let mut rows = stmt
            .query(params![category.as_str()])
            .with_context(|| format!("scan assigned identifiers for {category}"))?;
        let mut visited = 0;
        while let Some(row) = rows.next()? {
            let identifier: Option<String> = row.get(0)?;
            if let Some(identifier) = identifier {
                f(&identifier);
                visited += 1;
            }
        }
        Ok(visited)
    }

    fn fetch_unassigned_ordered(
        &mut self,
        category: &Category,
        after: Option<TargetKey>,
        limit: usize,
    ) -> Result<Vec<TargetKey>> {
        let after = after.map_or(i64::MIN, |key| key.0);
        let mut stmt = self.conn.prepare_cached(SELECT_UNASSIGNED_ORDERED)?;
        let keys = stmt
            .query_map(params![category.as_str(), after, sql_limit(limit)], |row| {
                row.get(0).map(TargetKey)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("fetch unassigned targets for {category}"))?;
        Ok(keys)
    }

    fn fetch_unassigned(&mut self, category: &Category, limit: usize) -> Result<Vec<TargetKey>> {
        let mut stmt = self.conn.prepare_cached(SELECT_UNASSIGNED)?;
        let keys = stmt
            .query_map(params![category.as_str(), sql_limit(limit)], |row| {
                row.get(0).map(TargetKey)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("fetch unassigned targets for {category}"))?;
        Ok(keys)
    }

    fn fetch_candidates(
        &mut self,
        category: &Category,
        after: Option<SourcePosition>,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let after = after.map_or(0, |p| p.0);
        let mut stmt = self.conn.prepare_cached(SELECT_CANDIDATES)?;
        let rows = stmt
            .query_map(params![category.as_str(), after, sql_limit(limit)], |row| {
                Ok(SourceRow {
                    position: SourcePosition(row.get(0)?),
                    identifier: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("fetch candidates for {category}"))?;
        Ok(rows)
    }

    fn apply_assignments(
        &mut self,
        category: &Category,
        assignments: &[Assignment],
    ) -> Result<Vec<bool>> {
        let tx = self.conn.transaction()?;
        let mut affected = Vec::with_capacity(assignments.len());
        {
            let mut update = tx.prepare_cached(UPDATE_GUARDED)?;
            for assignment in assignments {
                let changed = update
                    .execute(params![
                        assignment.identifier,
                        assignment.target.0,
                        category.as_str()
                    ])
                    .with_context(|| format!("guarded update of {}", assignment.target))?;
                affected.push(changed > 0);
            }
        }
        tx.commit().context("commit assignment batch")?;
        Ok(affected)
    }

    fn count_unassigned(&mut self, category: &Category) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM table_c c JOIN table_a a ON a.seqno = c.seqno \
             WHERE a.entity_type = ?1 AND c.tino IS NULL",
            params![category.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn duplicate_assignments(&mut self, category: &Category) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.tino, COUNT(*) FROM table_c c JOIN table_a a ON a.seqno = c.seqno \
             WHERE a.entity_type = ?1 AND c.tino IS NOT NULL \
             GROUP BY c.tino HAVING COUNT(*) > 1 ORDER BY c.tino",
        )?;
        let duplicates = stmt
            .query_map(params![category.as_str()], |row| {
                let count: i64 = row.get(1)?;
                Ok((row.get::<_, String>(0)?, count.max(0) as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(duplicates)
    }
}
