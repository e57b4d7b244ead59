pub mod core;
pub mod multipart;
pub mod storage;

pub use self::core::{
    EngineEvent, SessionCallbacks, UploadEngine, CANCELLED_MESSAGE, FINISHED_SESSION_LIMIT,
};
pub use storage::{LandingJournal, MemoryLandingJournal, SqliteLandingJournal};
