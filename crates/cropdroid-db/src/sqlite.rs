//! SQLite-backed record store.
//!
//! One `records` table keyed by `(kind, id)`; bodies are JSON text. IDs are
//! at most 63 bits so they fit SQLite's signed INTEGER.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::model::{ConsistencyLevel, EntityKind};
use cropdroid_core::traits::{Mutation, PageQuery, Record, RecordPage, RecordStore};
use rusqlite::{Connection, ErrorCode, params};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> CropDroidError {
    CropDroidError::Database(e.to_string())
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| CropDroidError::Database(e.to_string()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                kind TEXT NOT NULL,
                id INTEGER NOT NULL,
                farm_id INTEGER NOT NULL DEFAULT 0,
                parent_id INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_farm ON records (kind, farm_id);
            CREATE INDEX IF NOT EXISTS idx_records_parent ON records (kind, parent_id);
            ",
        )
        .map_err(|e| CropDroidError::Database(format!("Migration: {e}")))?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, i64, i64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_row(raw: (String, i64, i64, i64, String)) -> Result<Record> {
    let (kind, id, farm_id, parent_id, body) = raw;
    let kind = EntityKind::parse(&kind)
        .ok_or_else(|| CropDroidError::Database(format!("unknown record kind '{kind}'")))?;
    Ok(Record {
        kind,
        id: id as u64,
        farm_id: farm_id as u64,
        parent_id: parent_id as u64,
        body: serde_json::from_str(&body)?,
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn apply(&self, batch: Vec<Mutation>, _level: ConsistencyLevel) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| CropDroidError::Database(e.to_string()))?;
        // Dropping the transaction without commit rolls the whole batch back.
        let tx = conn.transaction().map_err(db_err)?;
        for m in &batch {
            match m {
                Mutation::Insert(r) => {
                    tx.execute(
                        "INSERT INTO records (kind, id, farm_id, parent_id, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![r.kind.as_str(), r.id as i64, r.farm_id as i64, r.parent_id as i64, r.body.to_string()],
                    )
                    .map_err(|e| {
                        if is_constraint(&e) {
                            CropDroidError::StoreConflict(format!("{} {} already exists", r.kind, r.id))
                        } else {
                            db_err(e)
                        }
                    })?;
                }
                Mutation::Upsert(r) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO records (kind, id, farm_id, parent_id, body) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![r.kind.as_str(), r.id as i64, r.farm_id as i64, r.parent_id as i64, r.body.to_string()],
                    )
                    .map_err(db_err)?;
                }
                Mutation::Delete { kind, id } => {
                    tx.execute(
                        "DELETE FROM records WHERE kind = ?1 AND id = ?2",
                        params![kind.as_str(), *id as i64],
                    )
                    .map_err(db_err)?;
                }
            }
        }
        tx.commit().map_err(db_err)?;
        tracing::debug!("💾 Applied batch of {} mutations", batch.len());
        Ok(())
    }

    async fn get(
        &self,
        kind: EntityKind,
        id: u64,
        _level: ConsistencyLevel,
    ) -> Result<Option<Record>> {
        let conn = self.conn.lock().map_err(|e| CropDroidError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT kind, id, farm_id, parent_id, body FROM records WHERE kind = ?1 AND id = ?2")
            .map_err(db_err)?;
        let mut rows = stmt
            .query_map(params![kind.as_str(), id as i64], row_to_record)
            .map_err(db_err)?;
        match rows.next() {
            Some(raw) => Ok(Some(decode_row(raw.map_err(db_err)?)?)),
            None => Ok(None),
        }
    }

    async fn scan(
        &self,
        kind: EntityKind,
        query: &PageQuery,
        _level: ConsistencyLevel,
    ) -> Result<RecordPage> {
        let conn = self.conn.lock().map_err(|e| CropDroidError::Database(e.to_string()))?;
        let order = if query.descending { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT kind, id, farm_id, parent_id, body FROM records
             WHERE kind = ?1 AND (?2 IS NULL OR farm_id = ?2) AND (?3 IS NULL OR parent_id = ?3)
             ORDER BY id {order} LIMIT ?4 OFFSET ?5"
        );
        // One extra row tells whether another page exists; -1 is unbounded.
        let fetch: i64 = if query.limit == 0 { -1 } else { query.limit as i64 + 1 };
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![
                    kind.as_str(),
                    query.farm_id.map(|f| f as i64),
                    query.parent_id.map(|p| p as i64),
                    fetch,
                    query.offset as i64,
                ],
                row_to_record,
            )
            .map_err(db_err)?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(decode_row(raw.map_err(db_err)?)?);
        }
        let has_more = query.limit > 0 && records.len() > query.limit;
        records.truncate(if query.limit > 0 { query.limit } else { records.len() });
        Ok(RecordPage { records, has_more })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(kind: EntityKind, id: u64, farm_id: u64) -> Record {
        Record {
            kind,
            id,
            farm_id,
            parent_id: 0,
            body: json!({ "id": id, "name": format!("r{id}") }),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_and_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .apply(vec![Mutation::Insert(rec(EntityKind::Farm, 10, 10))], ConsistencyLevel::Local)
            .await
            .unwrap();
        let got = store.get(EntityKind::Farm, 10, ConsistencyLevel::Local).await.unwrap().unwrap();
        assert_eq!(got.body["name"], "r10");

        let err = store
            .apply(
                vec![
                    Mutation::Insert(rec(EntityKind::Device, 11, 10)),
                    Mutation::Insert(rec(EntityKind::Farm, 10, 10)),
                ],
                ConsistencyLevel::Local,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CropDroidError::StoreConflict(_)));
        // The device from the failed batch must not be visible.
        assert!(store.get(EntityKind::Device, 11, ConsistencyLevel::Local).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_with_limit() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch = (1..=4).map(|i| Mutation::Upsert(rec(EntityKind::EventLog, i, 3))).collect();
        store.apply(batch, ConsistencyLevel::Local).await.unwrap();

        let page = store
            .scan(
                EntityKind::EventLog,
                &PageQuery::farm(3).with_page(1, 2).newest_first(),
                ConsistencyLevel::Local,
            )
            .await
            .unwrap();
        assert_eq!(page.records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2]);
        assert!(page.has_more);

        let all = store
            .scan(EntityKind::EventLog, &PageQuery::default(), ConsistencyLevel::Local)
            .await
            .unwrap();
        assert_eq!(all.records.len(), 4);
        assert!(!all.has_more);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("cropdroid-sqlite-{}", std::process::id()));
        let path = dir.join("records.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .apply(vec![Mutation::Upsert(rec(EntityKind::User, 5, 0))], ConsistencyLevel::Local)
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get(EntityKind::User, 5, ConsistencyLevel::Local).await.unwrap().is_some());
        std::fs::remove_dir_all(&dir).ok();
    }
}
