use rusqlite::{params, Row};

use super::{Database, StorageResult};

pub(crate) const PENDING_LANDINGS_TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pending_landings (
    photo_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    s3_key TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    recorded_at_millis INTEGER NOT NULL
);";

/// 已传到对象存储、但后端尚未确认落盘的照片。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLandingRecord {
    pub photo_id: String,
    pub session_id: String,
    pub s3_key: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub recorded_at_millis: i64,
}

impl Database {
    pub fn upsert_pending_landing(&self, record: &PendingLandingRecord) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO pending_landings (
                    photo_id,
                    session_id,
                    s3_key,
                    attempts,
                    last_error,
                    recorded_at_millis
                )
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(photo_id) DO UPDATE SET
                    session_id = excluded.session_id,
                    s3_key = excluded.s3_key,
                    attempts = excluded.attempts,
                    last_error = excluded.last_error,
                    recorded_at_millis = excluded.recorded_at_millis",
                params![
                    record.photo_id,
                    record.session_id,
                    record.s3_key,
                    record.attempts,
                    record.last_error,
                    record.recorded_at_millis,
                ],
            )
            .map_err(|e| format!("failed to upsert pending landing: {e}"))?;
            Ok(())
        })
    }

    pub fn load_pending_landings(&self) -> StorageResult<Vec<PendingLandingRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT
                        photo_id,
                        session_id,
                        s3_key,
                        attempts,
                        last_error,
                        recorded_at_millis
                    FROM pending_landings
                    ORDER BY recorded_at_millis ASC",
                )
                .map_err(|e| format!("failed to prepare pending landing query: {e}"))?;
            let rows = stmt
                .query_map([], map_pending_landing)
                .map_err(|e| format!("failed to query pending landings: {e}"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("failed to parse pending landing row: {e}"))?;
            Ok(rows)
        })
    }

    pub fn delete_pending_landing(&self, photo_id: &str) -> StorageResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM pending_landings WHERE photo_id = ?",
                params![photo_id],
            )
            .map_err(|e| format!("failed to delete pending landing {photo_id}: {e}"))?;
            Ok(())
        })
    }
}

fn map_pending_landing(row: &Row) -> rusqlite::Result<PendingLandingRecord> {
    Ok(PendingLandingRecord {
        photo_id: row.get(0)?,
        session_id: row.get(1)?,
        s3_key: row.get(2)?,
        attempts: row.get(3)?,
        last_error: row.get(4)?,
        recorded_at_millis: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(photo_id: &str, recorded_at_millis: i64) -> PendingLandingRecord {
        PendingLandingRecord {
            photo_id: photo_id.to_string(),
            session_id: "s-1".to_string(),
            s3_key: format!("uploads/{photo_id}.jpg"),
            attempts: 1,
            last_error: Some("HTTP 503".to_string()),
            recorded_at_millis,
        }
    }

    #[test]
    fn pending_landings_are_listed_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(dir.path().join("landings.db")).unwrap();
        db.upsert_pending_landing(&record("b", 20)).unwrap();
        db.upsert_pending_landing(&record("a", 10)).unwrap();

        let ids: Vec<String> = db
            .load_pending_landings()
            .unwrap()
            .into_iter()
            .map(|r| r.photo_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        db.delete_pending_landing("a").unwrap();
        assert_eq!(db.load_pending_landings().unwrap().len(), 1);
    }

    #[test]
    fn upsert_replaces_attempt_count() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(dir.path().join("landings.db")).unwrap();
        db.upsert_pending_landing(&record("a", 10)).unwrap();
        let mut again = record("a", 10);
        again.attempts = 3;
        db.upsert_pending_landing(&again).unwrap();
        let rows = db.load_pending_landings().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attempts, 3);
    }
}
