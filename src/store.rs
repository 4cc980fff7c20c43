use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;

use crate::account::Account;

#[derive(Clone)]
pub struct SqliteStore {
    path: String,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            anyhow::bail!("SQLITE_PATH is empty");
        }
        if path != ":memory:" && !path.starts_with("file:") {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create sqlite parent dir for {path}"))?;
            }
        }

        // rusqlite::Connection is not Send/Sync, so only the path is kept and
        // each operation opens a short-lived connection (WAL mode).
        Ok(Self { path: path.to_string() })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| format!("open sqlite {}", self.path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    pub fn init_db(&self) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS account_snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts REAL,
  account_id TEXT,
  balance REAL,
  equity REAL,
  margin REAL,
  free_margin REAL,
  margin_level REAL,
  connection_status TEXT
);

CREATE INDEX IF NOT EXISTS idx_account_snapshots ON account_snapshots(account_id, ts);

CREATE TABLE IF NOT EXISTS subscription_snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts REAL,
  payload_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_subscription_snapshots_ts ON subscription_snapshots(ts);

CREATE TABLE IF NOT EXISTS runtime_status (
  component TEXT PRIMARY KEY,
  ts REAL,
  level TEXT,
  message TEXT,
  detail TEXT
);
"#,
        )?;
        Ok(())
    }

    pub fn upsert_runtime_status(
        &self,
        component: &str,
        level: &str,
        message: &str,
        detail: Option<&str>,
        ts: f64,
    ) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            r#"
INSERT INTO runtime_status(component, ts, level, message, detail)
VALUES(?,?,?,?,?)
ON CONFLICT(component) DO UPDATE SET
  ts=excluded.ts,
  level=excluded.level,
  message=excluded.message,
  detail=excluded.detail
"#,
            params![component, ts, level, message, detail],
        )?;
        Ok(())
    }

    pub fn insert_account_snapshots<'a, I>(&self, ts: f64, accounts: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a Account>,
    {
        let mut conn = self.open_conn()?;
        let tx = conn.transaction()?;
        let mut n = 0;
        {
            let mut stmt = tx.prepare(
                r#"
INSERT INTO account_snapshots(
  ts, account_id, balance, equity, margin, free_margin, margin_level, connection_status
)
VALUES(?,?,?,?,?,?,?,?)
"#,
            )?;
            for a in accounts {
                stmt.execute(params![
                    ts,
                    a.id.as_str(),
                    a.balance,
                    a.equity,
                    a.margin,
                    a.free_margin,
                    a.margin_level,
                    a.connection_status.as_str()
                ])?;
                n += 1;
            }
        }
        tx.commit()?;
        Ok(n)
    }

    pub fn insert_subscription_snapshot(&self, ts: f64, payload: &JsonValue) -> Result<()> {
        let conn = self.open_conn()?;
        conn.execute(
            "INSERT INTO subscription_snapshots(ts, payload_json) VALUES(?,?)",
            params![ts, serde_json::to_string(payload)?],
        )?;
        Ok(())
    }

    /// Drop snapshot rows older than `cutoff_ts`.
    pub fn prune_snapshots(&self, cutoff_ts: f64) -> Result<usize> {
        let conn = self.open_conn()?;
        let a = conn.execute("DELETE FROM account_snapshots WHERE ts < ?", params![cutoff_ts])?;
        let s = conn.execute("DELETE FROM subscription_snapshots WHERE ts < ?", params![cutoff_ts])?;
        Ok(a + s)
    }

    // ---- Dashboard queries (read-only) ----

    pub fn fetch_runtime_statuses(&self) -> Result<JsonValue> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare("SELECT component, ts, level, message, detail FROM runtime_status ORDER BY ts DESC")?;
        let mut rows = stmt.query([])?;
        let mut out = serde_json::Map::new();
        while let Some(r) = rows.next()? {
            let component: String = r.get(0)?;
            let ts: f64 = r.get(1)?;
            let level: String = r.get(2)?;
            let message: String = r.get(3)?;
            let detail: Option<String> = r.get(4)?;
            out.insert(
                component.clone(),
                serde_json::json!({
                    "component": component,
                    "ts": ts,
                    "level": level,
                    "message": message,
                    "detail": detail.unwrap_or_default(),
                }),
            );
        }
        Ok(JsonValue::Object(out))
    }

    pub fn fetch_account_snapshots(&self, account_id: &str, limit: usize) -> Result<Vec<JsonValue>> {
        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(
            r#"
SELECT ts, account_id, balance, equity, margin, free_margin, margin_level, connection_status
FROM account_snapshots
WHERE account_id = ?
ORDER BY ts DESC, id DESC
LIMIT ?
"#,
        )?;
        let mut rows = stmt.query(params![account_id, limit as i64])?;
        let mut out = vec![];
        while let Some(r) = rows.next()? {
            out.push(serde_json::json!({
                "ts": r.get::<_, f64>(0)?,
                "accountId": r.get::<_, String>(1)?,
                "balance": r.get::<_, Option<f64>>(2)?,
                "equity": r.get::<_, Option<f64>>(3)?,
                "margin": r.get::<_, Option<f64>>(4)?,
                "freeMargin": r.get::<_, Option<f64>>(5)?,
                "marginLevel": r.get::<_, Option<f64>>(6)?,
                "connectionStatus": r.get::<_, Option<String>>(7)?,
            }));
        }
        Ok(out)
    }

    pub fn fetch_latest_subscription_snapshot(&self) -> Result<Option<JsonValue>> {
        let conn = self.open_conn()?;
        let row: Option<(f64, String)> = conn
            .query_row(
                "SELECT ts, payload_json FROM subscription_snapshots ORDER BY ts DESC, id DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(ts, payload)| {
            let payload: JsonValue = serde_json::from_str(&payload).unwrap_or_else(|_| serde_json::json!({}));
            serde_json::json!({ "ts": ts, "payload": payload })
        }))
    }
}
