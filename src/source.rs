use crate::api::upload::models::UploadTask;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// 本地字节来源。引擎只通过这个接口读取文件内容，与具体平台的文件选择方式无关。
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn read_all(&self) -> Result<Bytes>;
}

/// 平台文件选择能力：桌面端的文件对话框、移动端的相册等都实现这一接口。
#[async_trait]
pub trait FilePicker: Send + Sync {
    async fn select_files(&self) -> Result<Vec<UploadTask>>;
}

#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn read_all(&self) -> Result<Bytes> {
        let content = tokio::fs::read(&self.path).await?;
        Ok(Bytes::from(content))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    bytes: Bytes,
}

impl MemorySource {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read_all(&self) -> Result<Bytes> {
        Ok(self.bytes.clone())
    }
}

/// 由调用方预先给定路径的选择器，适合命令行或拖拽场景。
#[derive(Debug, Clone, Default)]
pub struct PathPicker {
    paths: Vec<PathBuf>,
}

impl PathPicker {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl FilePicker for PathPicker {
    async fn select_files(&self) -> Result<Vec<UploadTask>> {
        let mut tasks = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let metadata = tokio::fs::metadata(path).await?;
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned());
            tasks.push(UploadTask::new(
                file_name,
                mime_from_extension(path),
                metadata.len(),
                FileSource::new(path.clone()),
            ));
        }
        Ok(tasks)
    }
}

pub fn mime_from_extension(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        _ => "application/octet-stream",
    }
}
