pub mod analysis;
pub mod build_farm;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod hosting;
pub mod http;
pub mod lease;
pub mod notify;
pub mod reconcile;
pub mod repair;
pub mod retry;
pub mod store;
pub mod webhook;
pub mod worker;

#[cfg(test)]
pub(crate) mod fakes;

use std::sync::Arc;

pub use command::CommandFilter;
pub use hosting::HostingRegistry;
pub use specfix_core::RecordingLogger;
pub use store::RequestStore;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn get_version() -> String {
    let hash = option_env!("SPECFIX_GIT_HASH").or(built_info::GIT_COMMIT_HASH);
    match hash {
        Some(hash) if hash.len() >= 8 => hash[..8].to_string(),
        Some(hash) => hash.to_string(),
        None => "unknown".to_string(),
    }
}

/// Shared by the HTTP handlers.
pub struct AppState {
    pub store: Arc<dyn RequestStore>,
    pub hosting: Arc<HostingRegistry>,
    pub webhook_secret: String,
    pub commands: CommandFilter,
    /// Reject events whose pull request has no source repository instead of
    /// falling back to the origin.
    pub require_source_url: bool,
    pub recording_logger: Option<RecordingLogger>,
}
