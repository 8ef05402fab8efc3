use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::models::{GraphType, RowRecord};
use super::snapshot;
use crate::error::StoreError;
use crate::flamegraph::{trim_floor, FlameGraph, ROOT_ID};

/// Row store holding flattened flame graph snapshots.
///
/// One connection behind a mutex; every public operation holds the lock for
/// its whole duration. All calls block, so async callers go through
/// `tokio::task::spawn_blocking`.
pub struct Database {
    conn: Mutex<Connection>,
    path: String,
}

const ROW_COLUMNS: &str = "timestamp, graph_type, cluster, id, name, total, value, children_ids";

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(&path)?;
        let db = Database { conn: Mutex::new(conn), path: path_str };
        db.init()?;
        Ok(db)
    }

    pub fn get_path(&self) -> String {
        self.path.clone()
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn: Mutex::new(conn), path: ":memory:".to_string() };
        db.init()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        Self::ensure_schema(&conn)?;
        Ok(())
    }

    /// Idempotent; runs on open and before every snapshot write.
    fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS flamegraph (
                timestamp INTEGER NOT NULL,
                graph_type TEXT NOT NULL,
                cluster TEXT NOT NULL,
                id INTEGER NOT NULL,
                name TEXT NOT NULL,
                total INTEGER NOT NULL,
                value INTEGER NOT NULL,
                children_ids TEXT NOT NULL,  -- JSON array of child ids
                date TEXT NOT NULL           -- UTC day of the snapshot, YYYY-MM-DD
            );

            CREATE INDEX IF NOT EXISTS idx_flamegraph_snapshot
                ON flamegraph(timestamp, graph_type, cluster, value);

            -- Node ids are unique within one snapshot
            CREATE UNIQUE INDEX IF NOT EXISTS idx_flamegraph_node
                ON flamegraph(timestamp, graph_type, cluster, id);

            CREATE INDEX IF NOT EXISTS idx_flamegraph_cluster
                ON flamegraph(cluster, id, timestamp);
            ",
        )
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<RowRecord> {
        let graph_type: String = row.get(1)?;
        let graph_type = GraphType::from_str(&graph_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Text,
                format!("unknown graph type '{}'", graph_type).into(),
            )
        })?;
        let children_json: String = row.get(7)?;
        let children_ids: Vec<u64> = serde_json::from_str(&children_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

        Ok(RowRecord {
            timestamp: row.get(0)?,
            graph_type,
            cluster: row.get(2)?,
            id: row.get::<_, i64>(3)? as u64,
            name: row.get(4)?,
            total: row.get::<_, i64>(5)? as u64,
            value: row.get::<_, i64>(6)? as u64,
            children_ids,
        })
    }

    /// Insert all rows in a single transaction. Any failure rolls the whole
    /// batch back.
    pub fn insert_rows(&self, rows: &[RowRecord]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        Self::insert_rows_locked(&mut conn, rows)
    }

    fn insert_rows_locked(conn: &mut Connection, rows: &[RowRecord]) -> Result<usize, StoreError> {
        Self::ensure_schema(conn)?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO flamegraph (timestamp, graph_type, cluster, id, name, total, value, children_ids, date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for row in rows {
                let children_ids = serde_json::to_string(&row.children_ids)?;
                stmt.execute(params![
                    row.timestamp,
                    row.graph_type.as_str(),
                    row.cluster,
                    row.id as i64,
                    row.name,
                    row.total as i64,
                    row.value as i64,
                    children_ids,
                    snapshot_date(row.timestamp),
                ])?;
            }
        }
        tx.commit()?;

        Ok(rows.len())
    }

    /// Flatten `graph` and persist it as the snapshot at `timestamp`.
    pub fn write_snapshot(&self, graph: &FlameGraph, timestamp: i64) -> Result<usize, StoreError> {
        self.insert_rows(&snapshot::flatten(graph, timestamp))
    }

    /// Persist `graph` as the newest snapshot of its cluster, taken at `now`.
    ///
    /// Snapshot keys are whole seconds, so when the cluster already has a
    /// snapshot at or after `now` the write moves to one second past it.
    /// Returns the timestamp used and the number of rows written.
    pub fn write_next_snapshot(&self, graph: &FlameGraph, now: i64) -> Result<(i64, usize), StoreError> {
        let mut conn = self.lock()?;
        Self::ensure_schema(&conn)?;

        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(timestamp) FROM flamegraph WHERE cluster = ?1 AND graph_type = ?2",
            params![graph.cluster(), GraphType::GraphiteMetrics.as_str()],
            |row| row.get(0),
        )?;
        let timestamp = match latest {
            Some(latest) if latest >= now => latest + 1,
            _ => now,
        };

        let written = Self::insert_rows_locked(&mut conn, &snapshot::flatten(graph, timestamp))?;
        Ok((timestamp, written))
    }

    /// Rows of one snapshot whose value is strictly greater than `min_value`,
    /// keyed by id.
    pub fn get_rows_above(
        &self,
        timestamp: i64,
        cluster: &str,
        min_value: u64,
    ) -> Result<HashMap<u64, RowRecord>, StoreError> {
        let conn = self.lock()?;
        Ok(Self::query_rows_above(&conn, timestamp, cluster, min_value)?)
    }

    fn query_root(conn: &Connection, timestamp: i64, cluster: &str) -> rusqlite::Result<Option<RowRecord>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM flamegraph
                 WHERE timestamp = ?1 AND graph_type = ?2 AND cluster = ?3 AND id = ?4",
                ROW_COLUMNS
            ),
            params![timestamp, GraphType::GraphiteMetrics.as_str(), cluster, ROOT_ID as i64],
            Self::row_to_record,
        )
        .optional()
    }

    fn query_rows_above(
        conn: &Connection,
        timestamp: i64,
        cluster: &str,
        min_value: u64,
    ) -> rusqlite::Result<HashMap<u64, RowRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM flamegraph
             WHERE timestamp = ?1 AND graph_type = ?2 AND cluster = ?3 AND value > ?4",
            ROW_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![timestamp, GraphType::GraphiteMetrics.as_str(), cluster, min_value as i64],
            Self::row_to_record,
        )?;

        let mut data = HashMap::new();
        for row in rows {
            let row = row?;
            data.insert(row.id, row);
        }
        Ok(data)
    }

    /// Rebuild the snapshot of `cluster` at `timestamp`, keeping only nodes
    /// whose value exceeds `fraction` of the snapshot total. `None` when no
    /// such snapshot exists.
    pub fn load_snapshot(
        &self,
        timestamp: i64,
        cluster: &str,
        fraction: f64,
    ) -> Result<Option<FlameGraph>, StoreError> {
        let conn = self.lock()?;
        let Some(root) = Self::query_root(&conn, timestamp, cluster)? else {
            return Ok(None);
        };

        let min_value = trim_floor(root.total, fraction);
        let rows = Self::query_rows_above(&conn, timestamp, cluster, min_value)?;

        Ok(Some(snapshot::reconstruct(&root, &rows)))
    }

    /// Timestamps of the persisted snapshots of `cluster`, newest first.
    pub fn list_snapshots(&self, cluster: &str) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp FROM flamegraph
             WHERE cluster = ?1 AND id = ?2 AND graph_type = ?3
             ORDER BY timestamp DESC",
        )?;
        let timestamps = stmt
            .query_map(
                params![cluster, ROOT_ID as i64, GraphType::GraphiteMetrics.as_str()],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(timestamps)
    }

    pub fn count_rows(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM flamegraph", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// UTC calendar day of a unix timestamp.
fn snapshot_date(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}
