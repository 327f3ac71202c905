use super::sanitizer::Sanitizer;
use super::types::{CorrelationId, CORRELATION_ID_HEADER};
use super::{Direction, RecordedEvent, RecordingLogger, ServiceType};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Bodies above this size are summarised instead of stored.
const MAX_RECORDED_BODY: usize = 10_000;

/// Records every request/response pair that passes through a client.
pub struct RecordingMiddleware {
    logger: RecordingLogger,
    service_type: ServiceType,
}

impl RecordingMiddleware {
    pub fn new(logger: RecordingLogger, service_type: ServiceType) -> Self {
        Self {
            logger,
            service_type,
        }
    }

    fn emit(&self, correlation_id: &str, direction: Direction, operation: String, data: Value) {
        self.logger.record(RecordedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.to_string(),
            event_type: self.service_type.event_type(),
            direction,
            operation,
            data,
            metadata: HashMap::new(),
        });
    }
}

#[async_trait::async_trait]
impl Middleware for RecordingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let correlation_id = ensure_correlation_id(&mut req, extensions);

        let outgoing = RecordedRequest::capture(&req);
        let operation = format!("{} {}", outgoing.method, req.url().path());
        self.emit(
            &correlation_id,
            Direction::Request,
            operation,
            serde_json::to_value(&outgoing).unwrap_or(Value::Null),
        );

        let result = next.run(req, extensions).await;

        let (operation, data) = match &result {
            Ok(response) => {
                let incoming = RecordedResponse::capture(response);
                (
                    format!("response_{}", incoming.status_code),
                    serde_json::to_value(&incoming).unwrap_or(Value::Null),
                )
            }
            Err(err) => (
                "error".to_string(),
                json!({ "error": err.to_string(), "error_type": format!("{:?}", err) }),
            ),
        };
        self.emit(&correlation_id, Direction::Response, operation, data);

        result
    }
}

/// Reuses an id already on the request or in its extensions, otherwise mints
/// one, and makes sure the header carries it downstream.
fn ensure_correlation_id(req: &mut Request, extensions: &http::Extensions) -> String {
    if let Some(existing) = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return existing.to_string();
    }

    let id = extensions
        .get::<CorrelationId>()
        .map(|c| c.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&id) {
        req.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    id
}

fn plain_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let plain = headers
        .iter()
        .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
        .collect();
    Sanitizer::sanitize_headers(&plain)
}

fn describe_body(req: &Request) -> String {
    let Some(body) = req.body() else {
        return "[NO_BODY]".to_string();
    };
    let Some(bytes) = body.as_bytes() else {
        return "[STREAM_BODY]".to_string();
    };
    if bytes.len() > MAX_RECORDED_BODY {
        return format!("[LARGE_BODY_{}b]", bytes.len());
    }
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return Sanitizer::sanitize_json(&value).to_string();
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => format!("[BINARY_BODY_{}b]", bytes.len()),
    }
}

#[derive(Debug, Serialize)]
struct RecordedRequest {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: String,
}

impl RecordedRequest {
    fn capture(req: &Request) -> Self {
        Self {
            method: req.method().to_string(),
            url: Sanitizer::sanitize_url(req.url().as_str()),
            headers: plain_headers(req.headers()),
            body: describe_body(req),
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordedResponse {
    status_code: u16,
    headers: HashMap<String, String>,
    body_size: u64,
}

impl RecordedResponse {
    fn capture(response: &Response) -> Self {
        Self {
            status_code: response.status().as_u16(),
            headers: plain_headers(response.headers()),
            body_size: response.content_length().unwrap_or(0),
        }
    }
}
