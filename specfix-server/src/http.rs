use std::time::Duration;

use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use specfix_core::{RecordingLogger, RecordingMiddleware, ServiceType};

const USER_AGENT: &str = concat!("specfix/", env!("CARGO_PKG_VERSION"));

/// Outbound client shared by the hosting and build-farm adapters.
pub fn create_http_client(
    service_type: ServiceType,
    timeout: Duration,
    recording_logger: Option<RecordingLogger>,
) -> ClientWithMiddleware {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new());

    let mut builder = ClientBuilder::new(client);

    if let Some(logger) = recording_logger {
        builder = builder.with(RecordingMiddleware::new(logger, service_type));
    }

    builder.build()
}
