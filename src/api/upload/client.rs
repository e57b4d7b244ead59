use crate::error::{Result, UploadError};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{redirect::Policy, Client, Response};
use std::fmt;
use std::time::Duration;
use url::Url;

use super::models::ErrorBody;

/// 路径段编码：保留 RFC 3986 的非保留字符，其余全部转义。
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// 访问后端所需的地址与凭证。令牌只在请求头中发送，不进日志也不进 URL。
#[derive(Clone)]
pub struct ApiCredentials {
    base_url: String,
    token: String,
}

impl ApiCredentials {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|source| UploadError::InvalidUrl {
            url: base_url.clone(),
            source,
        })?;
        Ok(Self {
            base_url,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            base_url: self.base_url.clone(),
            token: token.into(),
        }
    }

    /// 由路径段拼出后端地址，每段单独转义，避免 id 中的特殊字符改写路径。
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let path: Vec<String> = segments
            .iter()
            .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
            .collect();
        let raw = format!("{}/{}", self.base_url, path.join("/"));
        Url::parse(&raw).map_err(|source| UploadError::InvalidUrl { url: raw, source })
    }

    pub fn stream_url(&self, session_id: &str) -> Result<Url> {
        self.endpoint(&["api", "upload", "sessions", session_id, "stream"])
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// 构建带统一超时与重定向策略的 HTTP 客户端。`timeout` 为空时只限制建连时间，
/// 供长连接的事件流使用。
pub(crate) fn build_client(timeout: Option<Duration>) -> Result<Client> {
    let mut builder = Client::builder()
        .redirect(Policy::limited(10))
        .connect_timeout(Duration::from_secs(10));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| UploadError::transport("building HTTP client", e))
}

/// 非 2xx 响应转为 `UploadError::Http`，优先使用后端返回体里的 `error` 字段。
pub(crate) async fn ensure_success(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<ErrorBody>().await.unwrap_or_default();
    let message = body
        .error
        .or(body.message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    Err(UploadError::Http {
        context: context.to_string(),
        status: status.as_u16(),
        message,
    })
}
