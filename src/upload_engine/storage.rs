use crate::db::{current_timestamp_millis, Database, PendingLandingRecord};
use std::sync::Mutex;

use super::core::recover_lock;

/// 落盘通知日志：对象已进存储、后端却没收到确认的照片记在这里，
/// 之后由 `UploadEngine::reconcile_landings` 补发。
pub trait LandingJournal: Send + Sync {
    fn load(&self) -> Vec<PendingLandingRecord>;
    fn record(&self, landing: &PendingLandingRecord);
    fn remove(&self, photo_id: &str);
}

pub(crate) fn pending_landing(
    photo_id: &str,
    session_id: &str,
    s3_key: &str,
    attempts: i64,
    error: String,
) -> PendingLandingRecord {
    PendingLandingRecord {
        photo_id: photo_id.to_string(),
        session_id: session_id.to_string(),
        s3_key: s3_key.to_string(),
        attempts,
        last_error: Some(error),
        recorded_at_millis: current_timestamp_millis(),
    }
}

/// 默认的 SQLite 实现。
pub struct SqliteLandingJournal {
    db: Database,
}

impl SqliteLandingJournal {
    pub fn new(db: Database) -> Self {
        SqliteLandingJournal { db }
    }
}

impl LandingJournal for SqliteLandingJournal {
    fn load(&self) -> Vec<PendingLandingRecord> {
        self.db.load_pending_landings().unwrap_or_else(|err| {
            tracing::error!("failed to load pending landings: {err}");
            Vec::new()
        })
    }

    fn record(&self, landing: &PendingLandingRecord) {
        if let Err(err) = self.db.upsert_pending_landing(landing) {
            tracing::error!(
                photo_id = %landing.photo_id,
                "failed to record pending landing: {err}"
            );
        }
    }

    fn remove(&self, photo_id: &str) {
        if let Err(err) = self.db.delete_pending_landing(photo_id) {
            tracing::error!(%photo_id, "failed to delete pending landing: {err}");
        }
    }
}

/// 进程内实现，适合不需要跨重启保留的场景与单测。
#[derive(Default)]
pub struct MemoryLandingJournal {
    entries: Mutex<Vec<PendingLandingRecord>>,
}

impl LandingJournal for MemoryLandingJournal {
    fn load(&self) -> Vec<PendingLandingRecord> {
        recover_lock(&self.entries).clone()
    }

    fn record(&self, landing: &PendingLandingRecord) {
        let mut entries = recover_lock(&self.entries);
        entries.retain(|e| e.photo_id != landing.photo_id);
        entries.push(landing.clone());
    }

    fn remove(&self, photo_id: &str) {
        recover_lock(&self.entries).retain(|e| e.photo_id != photo_id);
    }
}
