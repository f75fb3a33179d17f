//! The `monitor` worker (spec §4.4).
//!
//! Archives channel telemetry and hardware status, atomically refreshes
//! two flat-file snapshots operators can tail without going through the
//! broker, and serves bounded time-range queries back out. The
//! [`Archive`] trait is the storage boundary; [`SqliteArchive`] is the
//! production implementation, grounded on the original
//! `MonitorService.monclass` SQLite schema.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::receipt::{Receipt, ReceiptResponse};

/// One archived telemetry row.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRow {
    /// Channel alias.
    pub alias: String,
    /// Measured voltage.
    pub v_mon: f64,
    /// Current selected by `ImonRange` (`IMonH` if 0, else `IMonL`).
    pub current: f64,
    /// When the sample was taken (epoch seconds), as reported by the caller.
    pub measurement_time: i64,
    /// 15-bit status word at sample time.
    pub ch_status: u16,
}

/// One archived status-journal row.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRow {
    /// Overall system health at the time of the row.
    pub is_ok: bool,
    /// Human-readable cause, empty when `is_ok`.
    pub description: String,
    /// Epoch seconds.
    pub timestamp: i64,
}

/// Storage boundary for the monitor service.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Appends telemetry rows and returns the current row count, used by
    /// the caller to decide whether a rotation sweep is due.
    async fn insert_params(&self, rows: &[ParamRow]) -> Result<u64>;

    /// Appends one status-journal row.
    async fn insert_status(&self, row: &StatusRow) -> Result<u64>;

    /// Deletes telemetry rows older than `cutoff` (epoch seconds).
    async fn rotate_params(&self, cutoff: i64) -> Result<()>;

    /// Deletes status rows older than `cutoff` (epoch seconds).
    async fn rotate_status(&self, cutoff: i64) -> Result<()>;

    /// Rows with `start_time <= measurement_time < end_time`, newest first.
    async fn query_params(&self, start_time: i64, end_time: i64) -> Result<Vec<ParamRow>>;

    /// Rows with `start_time <= timestamp < end_time`, newest first.
    async fn query_status(&self, start_time: i64, end_time: i64) -> Result<Vec<StatusRow>>;
}

/// `rusqlite`-backed archive, schema grounded on `monclass.py`'s
/// `CREATE TABLE IF NOT EXISTS` statements.
pub struct SqliteArchive {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteArchive").finish_non_exhaustive()
    }
}

impl SqliteArchive {
    /// Opens (creating if needed) a SQLite database at `path`.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS data (
                alias TEXT NOT NULL,
                vmon REAL NOT NULL,
                current REAL NOT NULL,
                measurement_time INTEGER NOT NULL,
                ch_status INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS status (
                is_ok INTEGER NOT NULL,
                description TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS data_measurement_time_idx ON data(measurement_time);
            CREATE INDEX IF NOT EXISTS status_timestamp_idx ON status(timestamp);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(std::path::Path::new(":memory:"))
    }
}

#[async_trait]
impl Archive for SqliteArchive {
    async fn insert_params(&self, rows: &[ParamRow]) -> Result<u64> {
        let conn = self.conn.lock().await;
        for row in rows {
            conn.execute(
                "INSERT INTO data (alias, vmon, current, measurement_time, ch_status) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![row.alias, row.v_mon, row.current, row.measurement_time, row.ch_status],
            )?;
        }
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM data", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    async fn insert_status(&self, row: &StatusRow) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO status (is_ok, description, timestamp) VALUES (?1, ?2, ?3)",
            rusqlite::params![row.is_ok, row.description, row.timestamp],
        )?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM status", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    async fn rotate_params(&self, cutoff: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM data WHERE measurement_time < ?1", [cutoff])?;
        Ok(())
    }

    async fn rotate_status(&self, cutoff: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM status WHERE timestamp < ?1", [cutoff])?;
        Ok(())
    }

    async fn query_params(&self, start_time: i64, end_time: i64) -> Result<Vec<ParamRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT alias, vmon, current, measurement_time, ch_status FROM data
             WHERE measurement_time >= ?1 AND measurement_time < ?2
             ORDER BY measurement_time DESC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![start_time, end_time], |r| {
                Ok(ParamRow {
                    alias: r.get(0)?,
                    v_mon: r.get(1)?,
                    current: r.get(2)?,
                    measurement_time: r.get(3)?,
                    ch_status: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn query_status(&self, start_time: i64, end_time: i64) -> Result<Vec<StatusRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT is_ok, description, timestamp FROM status
             WHERE timestamp >= ?1 AND timestamp < ?2
             ORDER BY timestamp DESC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![start_time, end_time], |r| {
                Ok(StatusRow {
                    is_ok: r.get(0)?,
                    description: r.get(1)?,
                    timestamp: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Seconds in a day; rows older than this are dropped on rotation.
const ROTATION_WINDOW_SECONDS: i64 = 24 * 60 * 60;

/// Snapshot file paths and rotation cadence.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Path the `param_file` JSON snapshot is written to.
    pub param_file: PathBuf,
    /// Path the `status_file` JSON snapshot is written to.
    pub status_file: PathBuf,
    /// Run a rotation sweep every this many inserts.
    pub rotate_every: u64,
}

/// The `monitor` service.
pub struct Monitor {
    archive: Box<dyn Archive>,
    config: MonitorConfig,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Monitor {
    /// Builds a monitor service around `archive`.
    pub fn new(archive: Box<dyn Archive>, config: MonitorConfig) -> Self {
        Self { archive, config }
    }

    /// Dispatches one receipt and returns it with `.response` filled in.
    pub async fn handle(&self, receipt: Receipt) -> Receipt {
        let response = match receipt.title.as_str() {
            "send_params" => self.handle_send_params(&receipt.params).await,
            "send_status" => self.handle_send_status(&receipt.params).await,
            "get_params" => self.handle_get_params(&receipt.params).await,
            "get_status" => self.handle_get_status(&receipt.params).await,
            other => ReceiptResponse::not_found(format!("unknown title: {other}")),
        };
        receipt.with_response(response)
    }

    async fn handle_send_params(&self, params: &Value) -> ReceiptResponse {
        let Some(measurement_time) = params.get("measurement_time").and_then(Value::as_i64) else {
            return ReceiptResponse::application_error("missing measurement_time");
        };
        let Some(channels) = params.get("params").and_then(Value::as_object) else {
            return ReceiptResponse::application_error("missing params");
        };

        let mut rows = Vec::with_capacity(channels.len());
        let mut snapshot = Map::new();
        for (alias, fields) in channels {
            let v_mon = fields.get("VMon").and_then(Value::as_f64).unwrap_or(0.0);
            let imon_range = fields.get("ImonRange").and_then(Value::as_u64).unwrap_or(0);
            let current = if imon_range == 0 {
                fields.get("IMonH").and_then(Value::as_f64).unwrap_or(0.0)
            } else {
                fields.get("IMonL").and_then(Value::as_f64).unwrap_or(0.0)
            };
            let ch_status = fields.get("ChStatus").and_then(Value::as_u64).unwrap_or(0) as u16;
            rows.push(ParamRow {
                alias: alias.clone(),
                v_mon,
                current,
                measurement_time,
                ch_status,
            });
            snapshot.insert(format!("DCV{alias}"), json!(v_mon));
            snapshot.insert(format!("DCC{alias}"), json!(current));
        }

        let result = async {
            let count = self.archive.insert_params(&rows).await?;
            if self.config.rotate_every > 0 && count % self.config.rotate_every == 0 {
                self.archive.rotate_params(measurement_time - ROTATION_WINDOW_SECONDS).await?;
            }
            write_snapshot_atomically(&self.config.param_file, &Value::Object(snapshot))
        }
        .await;

        match result {
            Ok(()) => ReceiptResponse::ok(json!({})),
            Err(err) => ReceiptResponse::application_error(err.to_string()),
        }
    }

    async fn handle_send_status(&self, params: &Value) -> ReceiptResponse {
        let Some(is_ok) = params.get("is_ok").and_then(Value::as_bool) else {
            return ReceiptResponse::application_error("missing is_ok");
        };
        let description = params.get("description").and_then(Value::as_str).unwrap_or("").to_string();
        let Some(timestamp) = params.get("timestamp").and_then(Value::as_i64) else {
            return ReceiptResponse::application_error("missing timestamp");
        };

        let row = StatusRow { is_ok, description: description.clone(), timestamp };
        let snapshot = json!({ "is_ok": is_ok, "description": description, "timestamp": timestamp });

        let result = async {
            let count = self.archive.insert_status(&row).await?;
            if self.config.rotate_every > 0 && count % self.config.rotate_every == 0 {
                self.archive.rotate_status(timestamp - ROTATION_WINDOW_SECONDS).await?;
            }
            write_snapshot_atomically(&self.config.status_file, &snapshot)
        }
        .await;

        match result {
            Ok(()) => ReceiptResponse::ok(json!({})),
            Err(err) => ReceiptResponse::application_error(err.to_string()),
        }
    }

    async fn handle_get_params(&self, params: &Value) -> ReceiptResponse {
        let Some(start_time) = params.get("start_time").and_then(Value::as_i64) else {
            return ReceiptResponse::application_error("missing start_time");
        };
        let Some(end_time) = params.get("end_time").and_then(Value::as_i64) else {
            return ReceiptResponse::application_error("missing end_time");
        };
        match self.archive.query_params(start_time, end_time).await {
            Ok(rows) => ReceiptResponse::ok(json!({
                "rows": rows.iter().map(|r| json!({
                    "alias": r.alias,
                    "VMon": r.v_mon,
                    "current": r.current,
                    "measurement_time": r.measurement_time,
                    "ChStatus": r.ch_status,
                })).collect::<Vec<_>>()
            })),
            Err(err) => ReceiptResponse::application_error(err.to_string()),
        }
    }

    async fn handle_get_status(&self, params: &Value) -> ReceiptResponse {
        let Some(start_time) = params.get("start_time").and_then(Value::as_i64) else {
            return ReceiptResponse::application_error("missing start_time");
        };
        let Some(end_time) = params.get("end_time").and_then(Value::as_i64) else {
            return ReceiptResponse::application_error("missing end_time");
        };
        match self.archive.query_status(start_time, end_time).await {
            Ok(rows) => ReceiptResponse::ok(json!({
                "rows": rows.iter().map(|r| json!({
                    "is_ok": r.is_ok,
                    "description": r.description,
                    "timestamp": r.timestamp,
                })).collect::<Vec<_>>()
            })),
            Err(err) => ReceiptResponse::application_error(err.to_string()),
        }
    }
}

/// Writes `value` as JSON to `path` by writing to a sibling temp file and
/// renaming over the destination, so readers never observe a torn file
/// (spec §4.4, §5).
fn write_snapshot_atomically(path: &std::path::Path, value: &Value) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, serde_json::to_vec_pretty(value)?)
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("renaming onto {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl crate::transport::server::ReceiptDispatch for Monitor {
    async fn dispatch(&self, receipt: Receipt) -> Receipt {
        self.handle(receipt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(dir: &std::path::Path) -> Monitor {
        let archive = SqliteArchive::open_in_memory().unwrap();
        let config = MonitorConfig {
            param_file: dir.join("params.json"),
            status_file: dir.join("status.json"),
            rotate_every: 0,
        };
        Monitor::new(Box::new(archive), config)
    }

    #[tokio::test]
    async fn send_params_writes_snapshot_and_archives_row() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());

        let receipt = Receipt::new(
            "loader",
            "monitor",
            "send_params",
            json!({
                "measurement_time": 1000,
                "params": {
                    "ch0": {"VMon": 99.0, "IMonH": 1.2, "IMonL": 0.0, "ImonRange": 0, "ChStatus": 1}
                }
            }),
        );
        let answered = monitor.handle(receipt).await;
        assert!(answered.response.unwrap().is_ok());

        let snapshot: Value = serde_json::from_slice(&std::fs::read(dir.path().join("params.json")).unwrap()).unwrap();
        assert_eq!(snapshot["DCVch0"], json!(99.0));
        assert_eq!(snapshot["DCCch0"], json!(1.2));

        let query = Receipt::new("test", "monitor", "get_params", json!({"start_time": 0, "end_time": 2000}));
        let answered = monitor.handle(query).await;
        let rows = answered.response.unwrap().body["rows"].clone();
        assert_eq!(rows.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());

        let receipt = Receipt::new("health", "monitor", "send_status", json!({"is_ok": false, "description": "trip", "timestamp": 500}));
        monitor.handle(receipt).await;

        let query = Receipt::new("test", "monitor", "get_status", json!({"start_time": 0, "end_time": 1000}));
        let answered = monitor.handle(query).await;
        let rows = answered.response.unwrap().body["rows"].clone();
        assert_eq!(rows[0]["is_ok"], json!(false));
        assert_eq!(rows[0]["description"], json!("trip"));
    }

    #[tokio::test]
    async fn unknown_title_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        let receipt = Receipt::new("test", "monitor", "nonsense", json!({}));
        let answered = monitor.handle(receipt).await;
        assert_eq!(answered.response.unwrap().statuscode, 404);
    }
}
