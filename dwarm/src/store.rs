// Copyright 2024 dprewarm developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Append-only persistence of run history.
//!
//! One SQLite table, one row per completed, canceled, or failed run. The
//! scheduler is the only writer and accesses the store serially.

use rusqlite::{params, Connection, OptionalExtension};
use std::{path::Path, sync::Mutex};
use thiserror::Error;

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// A persisted run. Timestamps are unix-epoch seconds, duration is
/// milliseconds. Nullable columns read back as zero values and empty
/// strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRecord {
    /// Assigned row id.
    pub id: i64,
    /// Run start, epoch seconds.
    pub started_at: i64,
    /// Run end, epoch seconds.
    pub finished_at: i64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
    /// Number of planned tasks.
    pub domains_total: i64,
    /// Number of completed tasks.
    pub domains_done: i64,
    /// Total unique addresses inserted.
    pub ips_inserted: i64,
    /// Error text; empty on success and on cancellation.
    pub error: String,
}

/// Fields for a new row; `id` is assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    /// Run start, epoch seconds.
    pub started_at: i64,
    /// Run end, epoch seconds.
    pub finished_at: Option<i64>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Number of planned tasks.
    pub domains_total: i64,
    /// Number of completed tasks.
    pub domains_done: i64,
    /// Total unique addresses inserted.
    pub ips_inserted: i64,
    /// Error text, if any.
    pub error: Option<String>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS prewarm_runs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at    INTEGER NOT NULL,
    finished_at   INTEGER,
    duration_ms   INTEGER,
    domains_total INTEGER NOT NULL,
    domains_done  INTEGER NOT NULL,
    ips_inserted  INTEGER NOT NULL,
    error         TEXT
)";

/// Run-history store over SQLite.
pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    /// Open (and create if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_conn(Connection::open(path)?)
    }

    /// Open an in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a row and return the record with its assigned id.
    pub fn save_run(&self, run: &NewRun) -> Result<RunRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO prewarm_runs
             (started_at, finished_at, duration_ms, domains_total, domains_done, ips_inserted, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.started_at,
                run.finished_at,
                run.duration_ms,
                run.domains_total,
                run.domains_done,
                run.ips_inserted,
                run.error,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(RunRecord {
            id,
            started_at: run.started_at,
            finished_at: run.finished_at.unwrap_or_default(),
            duration_ms: run.duration_ms.unwrap_or_default(),
            domains_total: run.domains_total,
            domains_done: run.domains_done,
            ips_inserted: run.ips_inserted,
            error: run.error.clone().unwrap_or_default(),
        })
    }

    /// The newest row, or `None` on an empty table.
    pub fn last_run(&self) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, started_at, finished_at, duration_ms,
                        domains_total, domains_done, ips_inserted, error
                 FROM prewarm_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(RunRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
                        duration_ms: row.get::<_, Option<i64>>(3)?.unwrap_or_default(),
                        domains_total: row.get(4)?,
                        domains_done: row.get(5)?,
                        ips_inserted: row.get(6)?,
                        error: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_has_no_last_run() {
        let store = RunStore::open_in_memory().unwrap();
        assert!(store.last_run().unwrap().is_none());
    }

    #[test]
    fn save_assigns_monotonic_ids() {
        let store = RunStore::open_in_memory().unwrap();
        let a = store
            .save_run(&NewRun {
                started_at: 100,
                domains_total: 3,
                ..NewRun::default()
            })
            .unwrap();
        let b = store
            .save_run(&NewRun {
                started_at: 200,
                ..NewRun::default()
            })
            .unwrap();
        assert!(b.id > a.id);
        assert_eq!(store.last_run().unwrap().unwrap().id, b.id);
    }

    #[test]
    fn nullable_columns_read_back_zeroed() {
        let store = RunStore::open_in_memory().unwrap();
        store
            .save_run(&NewRun {
                started_at: 100,
                finished_at: None,
                duration_ms: None,
                domains_total: 1,
                domains_done: 0,
                ips_inserted: 0,
                error: None,
            })
            .unwrap();
        let last = store.last_run().unwrap().unwrap();
        assert_eq!(last.finished_at, 0);
        assert_eq!(last.duration_ms, 0);
        assert_eq!(last.error, "");
    }

    #[test]
    fn full_row_round_trips() {
        let store = RunStore::open_in_memory().unwrap();
        let saved = store
            .save_run(&NewRun {
                started_at: 100,
                finished_at: Some(160),
                duration_ms: Some(60_000),
                domains_total: 10,
                domains_done: 10,
                ips_inserted: 42,
                error: Some("boom".into()),
            })
            .unwrap();
        assert_eq!(store.last_run().unwrap().unwrap(), saved);
    }
}
