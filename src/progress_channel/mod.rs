pub mod core;
pub mod hook;
pub mod parser;
pub mod transport;

pub use self::core::{MessageHandler, ProgressChannel, ResyncHandler, StatusHandler, Subscription};
pub use hook::ChannelHook;
pub use parser::{SseEvent, SseParser};
pub use transport::{EventStreamBody, EventStreamConnector, HttpEventStreamConnector, StreamResponse};
