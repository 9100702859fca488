//! Shared Database Handle
//! Mission: One SQLite connection behind a fast mutex, WAL mode, shared by
//! every store so business writes and outbox inserts commit atomically
//!
//! Stores create their own tables on construction; transactions that span
//! stores lock the connection once and use the `*_tx` associated functions.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;

pub type Db = Arc<Mutex<Connection>>;

pub fn open_db(db_path: &str) -> Result<Db> {
    let conn = Connection::open(db_path).context("open backend db")?;
    apply_pragmas(&conn);
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests and ephemeral runs.
pub fn open_memory_db() -> Result<Db> {
    let conn = Connection::open_in_memory().context("open in-memory db")?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn apply_pragmas(conn: &Connection) {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "foreign_keys", "ON").ok();
    conn.pragma_update(None, "busy_timeout", 5000).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_db() {
        let db = open_memory_db().unwrap();
        let conn = db.lock();
        conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_on_disk_db_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.db");
        let path = path.to_str().unwrap();

        {
            let db = open_db(path).unwrap();
            let conn = db.lock();
            conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
            conn.execute("INSERT INTO t VALUES (42)", []).unwrap();
        }

        let db = open_db(path).unwrap();
        let conn = db.lock();
        let x: i64 = conn.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(x, 42);

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
