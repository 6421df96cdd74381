//! Per-device telemetry history in SQLite.
//!
//! Each device gets a `device_<id>` table created from the first snapshot
//! it reports: one REAL column per metric key and one INTEGER `ch<i>` column
//! per channel slot. Keys seen later are added with `ALTER TABLE`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::traits::DeviceDataStore;
use cropdroid_core::types::DeviceSnapshot;
use rusqlite::Connection;
use rusqlite::types::Value;

pub struct SqliteDeviceDataStore {
    conn: Mutex<Connection>,
    columns: Mutex<HashMap<u64, HashSet<String>>>,
}

fn db_err(e: rusqlite::Error) -> CropDroidError {
    CropDroidError::Database(e.to_string())
}

/// Metric keys become column names; anything outside `[A-Za-z0-9_]` is folded.
fn column_name(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("m_{cleaned}")
}

fn table_name(device_id: u64) -> String {
    format!("device_{device_id}")
}

impl SqliteDeviceDataStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self::with_connection(Connection::open(path).map_err(db_err)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_connection(Connection::open_in_memory().map_err(db_err)?))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            columns: Mutex::new(HashMap::new()),
        }
    }

    /// Rows recorded for a device; 0 if it never reported.
    pub fn row_count(&self, device_id: u64) -> Result<usize> {
        let known = self
            .columns
            .lock()
            .map_err(|e| CropDroidError::Database(e.to_string()))?
            .contains_key(&device_id);
        if !known {
            return Ok(0);
        }
        let conn = self.conn.lock().map_err(|e| CropDroidError::Database(e.to_string()))?;
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table_name(device_id)), [], |r| r.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }

    /// Column names of a device table, in table order.
    pub fn columns(&self, device_id: u64) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|e| CropDroidError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table_name(device_id)))
            .map_err(db_err)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    /// Create the table or add missing columns so `wanted` all exist.
    fn ensure_schema(
        &self,
        conn: &Connection,
        device_id: u64,
        wanted: &[(String, &'static str)],
    ) -> Result<()> {
        let mut columns = self.columns.lock().map_err(|e| CropDroidError::Database(e.to_string()))?;
        let table = table_name(device_id);
        match columns.get_mut(&device_id) {
            None => {
                let defs: Vec<String> = wanted
                    .iter()
                    .map(|(name, ty)| format!("\"{name}\" {ty}"))
                    .collect();
                let mut sql = format!(
                    "CREATE TABLE IF NOT EXISTS {table} (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp TEXT NOT NULL"
                );
                for def in &defs {
                    sql.push_str(", ");
                    sql.push_str(def);
                }
                sql.push(')');
                conn.execute_batch(&sql).map_err(db_err)?;
                tracing::debug!("Created history table {table} with {} columns", defs.len());

                // A pre-existing table may carry columns from an older schema.
                let mut existing: HashSet<String> = {
                    let mut stmt = conn
                        .prepare(&format!("PRAGMA table_info({table})"))
                        .map_err(db_err)?;
                    stmt.query_map([], |row| row.get::<_, String>(1))
                        .map_err(db_err)?
                        .flatten()
                        .collect()
                };
                for (name, ty) in wanted {
                    if !existing.contains(name) {
                        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN \"{name}\" {ty}"))
                            .map_err(db_err)?;
                        existing.insert(name.clone());
                    }
                }
                columns.insert(device_id, existing);
            }
            Some(known) => {
                for (name, ty) in wanted {
                    if !known.contains(name) {
                        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN \"{name}\" {ty}"))
                            .map_err(db_err)?;
                        tracing::debug!("Added column {name} to {table}");
                        known.insert(name.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceDataStore for SqliteDeviceDataStore {
    async fn append(&self, device_id: u64, snapshot: &DeviceSnapshot) -> Result<()> {
        let mut keys: Vec<&String> = snapshot.metrics.keys().collect();
        keys.sort();

        let mut wanted: Vec<(String, &'static str)> =
            keys.iter().map(|k| (column_name(k), "REAL")).collect();
        wanted.extend((0..snapshot.channels.len()).map(|i| (format!("ch{i}"), "INTEGER")));

        let mut values: Vec<Value> = vec![Value::Text(snapshot.timestamp.to_rfc3339())];
        values.extend(keys.iter().map(|k| Value::Real(snapshot.metrics[*k])));
        values.extend(snapshot.channels.iter().map(|&c| Value::Integer(c as i64)));

        let conn = self.conn.lock().map_err(|e| CropDroidError::Database(e.to_string()))?;
        self.ensure_schema(&conn, device_id, &wanted)?;

        let names: Vec<String> = std::iter::once("timestamp".to_string())
            .chain(wanted.iter().map(|(n, _)| format!("\"{n}\"")))
            .collect();
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table_name(device_id),
            names.join(", "),
            placeholders.join(", ")
        );
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(metrics: &[(&str, f64)], channels: Vec<i32>) -> DeviceSnapshot {
        DeviceSnapshot::new(
            metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            channels,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_table_created_from_first_snapshot() {
        let store = SqliteDeviceDataStore::open_in_memory().unwrap();
        store
            .append(42, &snapshot(&[("tempF0", 72.5), ("humidity0", 55.0)], vec![0, 1]))
            .await
            .unwrap();
        let cols = store.columns(42).unwrap();
        assert!(cols.contains(&"m_tempF0".to_string()));
        assert!(cols.contains(&"ch1".to_string()));
        assert_eq!(store.row_count(42).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_new_keys_altered_in() {
        let store = SqliteDeviceDataStore::open_in_memory().unwrap();
        store.append(7, &snapshot(&[("pH", 6.1)], vec![0])).await.unwrap();
        store
            .append(7, &snapshot(&[("pH", 6.2), ("ec.ms", 1.4)], vec![0, 0, 1]))
            .await
            .unwrap();
        let cols = store.columns(7).unwrap();
        assert!(cols.contains(&"m_ec_ms".to_string()));
        assert!(cols.contains(&"ch2".to_string()));
        assert_eq!(store.row_count(7).unwrap(), 2);
        assert_eq!(store.row_count(8).unwrap(), 0);
    }
}
