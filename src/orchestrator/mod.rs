pub mod core;

pub use self::core::{CompletionLatch, SummaryCallback, UploadOrchestrator, UploadRun};
