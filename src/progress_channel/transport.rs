use crate::api::upload::client::build_client;
use crate::error::{ChannelError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::Client;
use url::Url;

pub type EventStreamBody = BoxStream<'static, std::result::Result<Bytes, String>>;

/// 事件流握手结果：状态码、内容类型以及尚未消费的响应体。
pub struct StreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: EventStreamBody,
}

/// 打开事件流的传输层。`open` 只负责握手，状态码与内容类型的判定由通道完成；
/// 建连阶段的网络错误以 `ChannelError::Transport` 返回。
#[async_trait]
pub trait EventStreamConnector: Send + Sync {
    async fn open(
        &self,
        url: &Url,
        token: &str,
        last_event_id: Option<&str>,
    ) -> std::result::Result<StreamResponse, ChannelError>;
}

#[derive(Debug, Clone)]
pub struct HttpEventStreamConnector {
    client: Client,
}

impl HttpEventStreamConnector {
    /// 长连接不设整体超时，只限制建连时间。
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_client(None)?,
        })
    }
}

#[async_trait]
impl EventStreamConnector for HttpEventStreamConnector {
    async fn open(
        &self,
        url: &Url,
        token: &str,
        last_event_id: Option<&str>,
    ) -> std::result::Result<StreamResponse, ChannelError> {
        let mut request = self
            .client
            .get(url.clone())
            .bearer_auth(token)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| e.to_string()))
            .boxed();

        Ok(StreamResponse {
            status,
            content_type,
            body,
        })
    }
}
