use crate::error::{Result, UploadError};
use crate::source::ByteSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// 一个待上传的本地文件。创建后不可变，只属于一个上传会话。
#[derive(Clone)]
pub struct UploadTask {
    pub id: String,
    pub source: Arc<dyn ByteSource>,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
}

impl UploadTask {
    pub fn new(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        source: impl ByteSource + 'static,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), file_name, mime_type, size, source)
    }

    pub fn with_id(
        id: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        source: impl ByteSource + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            source: Arc::new(source),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            size,
        }
    }
}

impl fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadTask")
            .field("id", &self.id)
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }

    /// 后端快照里的状态是大写枚举名（`COMPLETED` 等），未知值按排队处理。
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "uploading" | "in_progress" => UploadStatus::Uploading,
            "completed" | "uploaded" => UploadStatus::Completed,
            "failed" => UploadStatus::Failed,
            _ => UploadStatus::Queued,
        }
    }
}

/// 单个文件的上传进度，由引擎独占维护，通过回调/事件对外只读暴露。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub task_id: String,
    pub photo_id: Option<String>,
    pub status: UploadStatus,
    pub progress: u8,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
}

impl UploadProgress {
    pub fn queued(task: &UploadTask) -> Self {
        Self {
            task_id: task.id.clone(),
            photo_id: None,
            status: UploadStatus::Queued,
            progress: 0,
            bytes_uploaded: 0,
            total_bytes: task.size,
            error: None,
        }
    }
}

/// SSE 推送的进度消息。事件名决定变体，负载为 JSON。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressMessage {
    PhotoUploaded(PhotoUploaded),
    PhotoFailed(PhotoFailed),
    SessionCompleted(SessionCompleted),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUploaded {
    pub session_id: String,
    pub photo_id: String,
    pub uploaded_count: u32,
    pub total_count: u32,
    pub progress_percent: u32,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoFailed {
    pub session_id: String,
    pub photo_id: String,
    #[serde(alias = "errorMessage")]
    pub reason: String,
    pub failed_count: u32,
    pub total_count: u32,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCompleted {
    pub session_id: String,
    #[serde(alias = "successCount")]
    pub uploaded_count: u32,
    pub failed_count: u32,
    pub total_count: u32,
    #[serde(default)]
    pub timestamp: Option<String>,
}

pub const EVENT_PHOTO_UPLOADED: &str = "PHOTO_UPLOADED";
pub const EVENT_PHOTO_FAILED: &str = "PHOTO_FAILED";
pub const EVENT_SESSION_COMPLETED: &str = "SESSION_COMPLETED";

impl ProgressMessage {
    /// 按事件名解析负载。未知事件返回 `Ok(None)`，负载不是合法 JSON 时返回错误。
    pub fn from_event(event: &str, data: &str) -> Result<Option<Self>, serde_json::Error> {
        let message = match event {
            EVENT_PHOTO_UPLOADED => ProgressMessage::PhotoUploaded(serde_json::from_str(data)?),
            EVENT_PHOTO_FAILED => ProgressMessage::PhotoFailed(serde_json::from_str(data)?),
            EVENT_SESSION_COMPLETED => {
                ProgressMessage::SessionCompleted(serde_json::from_str(data)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    pub fn session_id(&self) -> &str {
        match self {
            ProgressMessage::PhotoUploaded(m) => &m.session_id,
            ProgressMessage::PhotoFailed(m) => &m.session_id,
            ProgressMessage::SessionCompleted(m) => &m.session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionSource {
    Channel,
    LocalFallback,
}

/// 会话结束时交给界面的汇总，每个会话只产生一次。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub uploaded_count: u32,
    pub failed_count: u32,
    pub total_count: u32,
    pub source: CompletionSource,
}

impl From<SessionCompleted> for SessionSummary {
    fn from(value: SessionCompleted) -> Self {
        SessionSummary {
            session_id: value.session_id,
            uploaded_count: value.uploaded_count,
            failed_count: value.failed_count,
            total_count: value.total_count,
            source: CompletionSource::Channel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub total_photos: u32,
    pub total_size_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePhotoRequest {
    pub filename: String,
    pub file_size_bytes: u64,
    pub mime_type: String,
}

/// 后端为单个文件签发的上传目标：小文件一个 PUT 地址，大文件一组分片地址。
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDescriptor {
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub part_urls: Option<Vec<String>>,
    pub photo_id: String,
    pub s3_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget<'a> {
    Single(&'a str),
    Multipart(&'a [String]),
}

impl UploadDescriptor {
    pub fn target(&self) -> Result<UploadTarget<'_>> {
        match (self.upload_url.as_deref(), self.part_urls.as_deref()) {
            (Some(url), None) if !url.trim().is_empty() => Ok(UploadTarget::Single(url)),
            (None, Some(parts)) if !parts.is_empty() => Ok(UploadTarget::Multipart(parts)),
            (Some(_), Some(_)) => Err(UploadError::InvalidDescriptor(format!(
                "photo {} has both uploadUrl and partUrls",
                self.photo_id
            ))),
            _ => Err(UploadError::InvalidDescriptor(format!(
                "photo {} has no upload target",
                self.photo_id
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkUploadedRequest {
    pub s3_key: String,
}

/// `GET /api/upload/sessions/{id}` 的权威快照，字段缺失时取默认值。
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Option<String>,
    pub status: Option<String>,
    pub total_photos: u32,
    pub completed_photos: u32,
    pub failed_photos: u32,
    pub progress_percentage: u32,
    pub photos: Vec<PhotoSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PhotoSnapshot {
    pub id: String,
    pub filename: Option<String>,
    pub upload_status: Option<String>,
}

impl PhotoSnapshot {
    pub fn to_progress(&self) -> UploadProgress {
        let status = self
            .upload_status
            .as_deref()
            .map(UploadStatus::from_wire)
            .unwrap_or(UploadStatus::Queued);
        UploadProgress {
            task_id: self.id.clone(),
            photo_id: Some(self.id.clone()),
            status,
            progress: if status == UploadStatus::Completed { 100 } else { 0 },
            bytes_uploaded: 0,
            total_bytes: 0,
            error: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: Option<String>,
    pub message: Option<String>,
}
