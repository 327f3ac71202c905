pub mod llm;
pub mod prompt;
pub mod recording;

pub use llm::*;
pub use prompt::*;
pub use recording::{
    CorrelationId, Direction, EventType, RecordedEvent, RecordingLogger, RecordingMiddleware,
    Sanitizer, ServiceType, CORRELATION_ID_HEADER,
};
