use thiserror::Error;

pub type Result<T, E = UploadError> = std::result::Result<T, E>;

/// 上传链路的错误分类：校验、建会话、单文件上传、落盘通知。
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),

    #[error("failed to start upload session: {0}")]
    SessionStart(String),

    #[error("{context} failed with HTTP {status}: {message}")]
    Http {
        context: String,
        status: u16,
        message: String,
    },

    #[error("{context} failed: {source}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid upload descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to read local file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("upload cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),
}

impl UploadError {
    pub(crate) fn transport(context: impl Into<String>, source: reqwest::Error) -> Self {
        UploadError::Transport {
            context: context.into(),
            source,
        }
    }
}

/// SSE 通道错误。只有致命错误会从 `connect()` 抛出，可重试错误在内部吸收。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("event stream rejected with HTTP {status}")]
    Rejected { status: u16 },

    #[error("event stream answered HTTP {status} with content type {content_type:?}; session has ended or does not exist")]
    SessionEnded {
        status: u16,
        content_type: Option<String>,
    },

    #[error("max reconnection attempts exceeded ({attempts})")]
    RetriesExhausted { attempts: u32 },

    #[error("event stream transport error: {0}")]
    Transport(String),
}
