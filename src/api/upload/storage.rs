use super::client::{build_client, ensure_success};
use crate::error::{Result, UploadError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client};
use std::sync::Arc;
use std::time::Duration;

/// 请求体每次交给传输层的字节数，同时决定进度回调的粒度。
const BODY_CHUNK_BYTES: usize = 64 * 1024;

/// 进度回调：(已发送字节, 总字节)。
pub type TransferProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 预签名地址的对象存储上传。只关心 PUT 是否 2xx，不附加任何后端签发之外的头。
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(
        &self,
        url: &str,
        content_type: &str,
        body: Bytes,
        progress: Option<TransferProgress>,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    client: Client,
}

impl HttpObjectStorage {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(Some(timeout))?,
        })
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn put_object(
        &self,
        url: &str,
        content_type: &str,
        body: Bytes,
        progress: Option<TransferProgress>,
    ) -> Result<()> {
        let total = body.len() as u64;
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, total);
        let request = match progress {
            Some(progress) => request.body(progress_body(body, progress)),
            None => request.body(body),
        };
        let response = request
            .send()
            .await
            .map_err(|e| UploadError::transport("uploading to object storage", e))?;
        ensure_success(response, "uploading to object storage").await?;
        Ok(())
    }
}

/// 把整块内容切成小段逐段交出，每交出一段就回调一次累计字节数。
fn progress_body(body: Bytes, progress: TransferProgress) -> Body {
    let total = body.len() as u64;
    let chunks = split_chunks(body, BODY_CHUNK_BYTES);
    let mut sent = 0u64;
    let stream = stream::iter(chunks.into_iter().map(move |chunk| {
        sent = sent.saturating_add(chunk.len() as u64);
        progress(sent, total);
        Ok::<Bytes, std::io::Error>(chunk)
    }));
    Body::wrap_stream(stream)
}

fn split_chunks(body: Bytes, chunk_size: usize) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(body.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk_size).min(body.len());
        chunks.push(body.slice(offset..end));
        offset = end;
    }
    chunks
}

/// 已发送字节换算为 0–100 的整数百分比。
pub fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = ((sent.min(total) as f64 / total as f64) * 100.0).round();
    pct as u8
}
