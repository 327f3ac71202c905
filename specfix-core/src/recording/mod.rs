pub mod logger;
pub mod middleware;
pub mod sanitizer;
pub mod types;

pub use logger::RecordingLogger;
pub use middleware::RecordingMiddleware;
pub use sanitizer::{Sanitizer, SENSITIVE_HEADERS, SENSITIVE_QUERY_PARAMS};
pub use types::*;
