pub mod backend;
pub mod client;
pub mod models;
pub mod storage;

pub use backend::{HttpUploadApi, UploadApi};
pub use client::ApiCredentials;
pub use models::{
    CompletionSource, ConnectionStatus, ProgressMessage, SessionSnapshot, SessionSummary,
    UploadDescriptor, UploadProgress, UploadStatus, UploadTask,
};
pub use storage::{HttpObjectStorage, ObjectStorage, TransferProgress};
