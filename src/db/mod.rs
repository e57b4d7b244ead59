use directories::ProjectDirs;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

mod pending_landings;
mod settings;

pub use pending_landings::PendingLandingRecord;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "RapidPhoto";
const APPLICATION: &str = "RapidPhoto";
const DB_FILE_NAME: &str = "upload.db";

pub type StorageResult<T> = Result<T, String>;

/// 本地 SQLite 数据库句柄。每次操作按需打开连接，句柄本身只记路径，
/// 可以随意克隆并在线程间传递。
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// 使用系统应用数据目录下的默认数据库文件。
    pub fn open_default() -> StorageResult<Self> {
        let dirs = ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .ok_or_else(|| "failed to resolve application data directory".to_string())?;
        Self::open_at(dirs.data_dir().join(DB_FILE_NAME))
    }

    pub fn open_at(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let database = Self { path: path.into() };
        database.with_connection(|_| Ok(()))?;
        Ok(database)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn with_connection<T, F>(&self, operation: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        let conn = self.open_connection()?;
        operation(&conn)
    }

    fn open_connection(&self) -> StorageResult<Connection> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("failed to create database directory {dir:?}: {e}"))?;
        }

        let conn = Connection::open(&self.path)
            .map_err(|e| format!("failed to open SQLite database: {e}"))?;
        apply_migrations(&conn)?;
        Ok(conn)
    }
}

fn apply_migrations(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(settings::SETTINGS_TABLE_SCHEMA)
        .map_err(|e| format!("failed to initialize settings schema: {e}"))?;
    conn.execute_batch(pending_landings::PENDING_LANDINGS_TABLE_SCHEMA)
        .map_err(|e| format!("failed to initialize pending landings schema: {e}"))?;
    Ok(())
}

pub(crate) fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
