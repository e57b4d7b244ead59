//! 照片批量上传客户端核心：并发上传引擎、SSE 进度通道，以及两者之间的完成对账。

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod progress_channel;
pub mod settings;
pub mod source;
pub mod upload_engine;
pub mod validation;

pub use api::upload::{
    ApiCredentials, ConnectionStatus, ProgressMessage, SessionSummary, UploadProgress,
    UploadStatus, UploadTask,
};
pub use config::UploadConfig;
pub use error::{ChannelError, Result, UploadError};
pub use orchestrator::{UploadOrchestrator, UploadRun};
pub use progress_channel::{ChannelHook, ProgressChannel};
pub use upload_engine::{EngineEvent, SessionCallbacks, UploadEngine};
