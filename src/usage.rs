// UsageLedger — append-only SQLite-backed record of per-key, per-model
// token consumption, plus the aggregation queries the Selector and the
// `/stats*` operator surfaces need.
//
// Connection handling follows `engine/sessions/mod.rs::SessionStore`: one
// WAL-mode connection guarded by a parking_lot::Mutex, opened once at
// startup. Schema migrations follow `engine/sessions/schema.rs`'s
// idempotent `CREATE TABLE IF NOT EXISTS` + `ALTER TABLE ... ADD COLUMN`
// (errors swallowed) style.

use crate::error::ProxyResult;
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;

pub struct UsageLedger {
    conn: Mutex<Connection>,
}

impl UsageLedger {
    pub fn open(path: &Path) -> ProxyResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("[usage] Opening usage ledger at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> ProxyResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn run_migrations(conn: &Connection) -> ProxyResult<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL DEFAULT (datetime('now')),
                client_addr TEXT NOT NULL,
                key_index INTEGER NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_ts ON usage(ts);
            CREATE INDEX IF NOT EXISTS idx_usage_key ON usage(key_index, ts);

            CREATE TABLE IF NOT EXISTS requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL DEFAULT (datetime('now')),
                client_addr TEXT NOT NULL,
                method TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                model TEXT NOT NULL DEFAULT 'pending',
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                body_path TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_requests_ts ON requests(ts);
            ",
        )?;
        Ok(())
    }

    /// Append one usage row. Timestamp is assigned at insertion (now, UTC).
    pub fn record(
        &self,
        client_addr: &str,
        key_index: usize,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> ProxyResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO usage (client_addr, key_index, model, prompt_tokens, completion_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                client_addr,
                key_index as i64,
                model,
                prompt_tokens as i64,
                completion_tokens as i64
            ],
        )?;
        Ok(())
    }

    /// Sum of prompt + completion tokens, grouped by key, over rows from
    /// the last 2 hours. Missing keys are absent from the returned map
    /// (callers treat absence as 0).
    pub fn usage_2h(&self, key_indices: &[usize]) -> ProxyResult<HashMap<usize, i64>> {
        if key_indices.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock();
        let placeholders = key_indices.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT key_index, SUM(prompt_tokens + completion_tokens)
             FROM usage
             WHERE ts >= datetime('now', '-2 hours') AND key_index IN ({placeholders})
             GROUP BY key_index"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<i64> = key_indices.iter().map(|i| *i as i64).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (k, v) = row?;
            map.insert(k, v);
        }
        Ok(map)
    }

    pub fn total_tokens(&self) -> ProxyResult<i64> {
        let conn = self.conn.lock();
        let total: Option<i64> = conn.query_row(
            "SELECT SUM(prompt_tokens + completion_tokens) FROM usage",
            [],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0))
    }

    pub fn tokens_per_minute(&self, window_minutes: i64) -> ProxyResult<i64> {
        let conn = self.conn.lock();
        let total: Option<i64> = conn.query_row(
            "SELECT SUM(prompt_tokens + completion_tokens) FROM usage
             WHERE ts >= datetime('now', ?1)",
            params![format!("-{} minutes", window_minutes)],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0))
    }

    pub fn tokens_last_24h(&self) -> ProxyResult<i64> {
        let conn = self.conn.lock();
        let total: Option<i64> = conn.query_row(
            "SELECT SUM(prompt_tokens + completion_tokens) FROM usage
             WHERE ts >= datetime('now', '-24 hours')",
            [],
            |row| row.get(0),
        )?;
        Ok(total.unwrap_or(0))
    }

    pub fn per_key_totals(&self) -> ProxyResult<HashMap<usize, i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key_index, SUM(prompt_tokens + completion_tokens) FROM usage GROUP BY key_index",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (k, v) = row?;
            map.insert(k, v);
        }
        Ok(map)
    }

    // ── RequestLog (archival) ───────────────────────────────────────────

    /// Create the pre-dispatch row with `model = "pending"`. Returns the
    /// autoincrement id.
    pub fn create_pending_request(
        &self,
        client_addr: &str,
        method: &str,
        endpoint: &str,
        body_path: Option<&str>,
    ) -> ProxyResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO requests (client_addr, method, endpoint, body_path)
             VALUES (?1, ?2, ?3, ?4)",
            params![client_addr, method, endpoint, body_path],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Update the row once the TailParser extracts stats.
    pub fn finalize_request(
        &self,
        request_log_id: i64,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> ProxyResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE requests SET model = ?1, prompt_tokens = ?2, completion_tokens = ?3
             WHERE id = ?4",
            params![
                model,
                prompt_tokens as i64,
                completion_tokens as i64,
                request_log_id
            ],
        )?;
        Ok(())
    }

    pub fn list_requests(&self, limit: i64) -> ProxyResult<Vec<RequestRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ts, client_addr, method, endpoint, model, prompt_tokens, completion_tokens, body_path
             FROM requests ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(RequestRow {
                id: row.get(0)?,
                ts: row.get(1)?,
                client_addr: row.get(2)?,
                method: row.get(3)?,
                endpoint: row.get(4)?,
                model: row.get(5)?,
                prompt_tokens: row.get(6)?,
                completion_tokens: row.get(7)?,
                body_path: row.get(8)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn request_body_path(&self, id: i64) -> ProxyResult<Option<String>> {
        let conn = self.conn.lock();
        let path: Option<String> = conn
            .query_row(
                "SELECT body_path FROM requests WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .ok()
            .flatten();
        Ok(path)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestRow {
    pub id: i64,
    pub ts: String,
    pub client_addr: String,
    pub method: String,
    pub endpoint: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub body_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_query_usage_2h() {
        let ledger = UsageLedger::open_in_memory().unwrap();
        ledger.record("1.2.3.4", 0, "m", 7, 11).unwrap();
        ledger.record("1.2.3.4", 1, "m", 100, 100).unwrap();

        let map = ledger.usage_2h(&[0, 1, 2]).unwrap();
        assert_eq!(map.get(&0), Some(&18));
        assert_eq!(map.get(&1), Some(&200));
        assert_eq!(map.get(&2), None);
    }

    #[test]
    fn pending_request_then_finalize() {
        let ledger = UsageLedger::open_in_memory().unwrap();
        let id = ledger
            .create_pending_request("1.2.3.4", "POST", "api/generate", None)
            .unwrap();
        let rows = ledger.list_requests(10).unwrap();
        assert_eq!(rows[0].model, "pending");

        ledger.finalize_request(id, "llama3", 5, 9).unwrap();
        let rows = ledger.list_requests(10).unwrap();
        assert_eq!(rows[0].model, "llama3");
        assert_eq!(rows[0].prompt_tokens, 5);
    }

    #[test]
    fn total_tokens_sums_all_rows() {
        let ledger = UsageLedger::open_in_memory().unwrap();
        ledger.record("a", 0, "m", 1, 2).unwrap();
        ledger.record("a", 0, "m", 3, 4).unwrap();
        assert_eq!(ledger.total_tokens().unwrap(), 10);
    }
}
