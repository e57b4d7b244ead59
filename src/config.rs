use crate::error::{Result, UploadError};
use crate::settings::clamp_upload_concurrency;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PART_SIZE_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PHOTOS_PER_SESSION: usize = 100;

const DEFAULT_ALLOWED_MIME_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
];

/// 上传引擎与进度通道共用的运行参数。缺失字段回落到默认值，
/// 方便宿主只覆盖关心的几项。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadConfig {
    pub max_concurrent_uploads: usize,
    pub part_size_bytes: u64,
    pub part_concurrency: usize,
    pub request_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub max_photos_per_session: usize,
    pub max_file_size_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub completion_fallback_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 10,
            part_size_bytes: DEFAULT_PART_SIZE_BYTES,
            part_concurrency: 3,
            request_timeout_ms: 10_000,
            upload_timeout_ms: 120_000,
            max_photos_per_session: DEFAULT_MAX_PHOTOS_PER_SESSION,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            completion_fallback_ms: 2_000,
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl UploadConfig {
    /// 从 JSON 读取配置，并把越界的数值收敛到可用范围。
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: UploadConfig = serde_json::from_str(raw).map_err(|source| {
            UploadError::Decode {
                context: "upload config",
                source,
            }
        })?;
        Ok(config.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.max_concurrent_uploads = clamp_upload_concurrency(self.max_concurrent_uploads);
        self.part_concurrency = self.part_concurrency.max(1);
        if self.part_size_bytes == 0 {
            self.part_size_bytes = DEFAULT_PART_SIZE_BYTES;
        }
        self.max_reconnect_attempts = self.max_reconnect_attempts.max(1);
        self.reconnect_max_delay_ms = self.reconnect_max_delay_ms.max(self.reconnect_base_delay_ms);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn completion_fallback(&self) -> Duration {
        Duration::from_millis(self.completion_fallback_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn is_mime_allowed(&self, mime_type: &str) -> bool {
        let wanted = mime_type.trim();
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(wanted))
    }
}
