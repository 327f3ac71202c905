//! Inbound Gitee note events.
//!
//! A signed comment on a pull request that matches one of the configured
//! commands becomes a stored repair request. Everything else is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use specfix_core::{CorrelationId, Direction, EventType, RecordedEvent, Sanitizer};

use crate::hosting::GitOpError;
use crate::repair::RepairSettings;
use crate::store::{NewRepairRequest, StoreError};
use crate::AppState;

pub const TOKEN_HEADER: &str = "x-gitee-token";
pub const TIMESTAMP_HEADER: &str = "x-gitee-timestamp";

#[derive(Debug, Deserialize, Default)]
pub struct GiteeNotePayload {
    pub noteable_type: Option<String>,
    /// Older payloads carry the comment text here.
    pub note: Option<String>,
    pub comment: Option<NoteComment>,
    pub project: Option<Project>,
    pub pull_request: Option<PullRequest>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NoteComment {
    pub body: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Project {
    pub html_url: Option<String>,
    pub url: Option<String>,
    pub name: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: Option<u64>,
    pub html_url: Option<String>,
    pub head: Option<PullRequestHead>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestHead {
    pub repo: Option<Project>,
}

impl GiteeNotePayload {
    pub fn comment_text(&self) -> &str {
        self.comment
            .as_ref()
            .and_then(|c| c.body.as_deref())
            .or(self.note.as_deref())
            .unwrap_or("")
    }

    pub fn is_pull_request_note(&self) -> bool {
        self.noteable_type.as_deref() == Some("PullRequest")
    }
}

/// The parts of a note event a repair needs, before the recipe is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestFields {
    pub origin_repo_url: String,
    pub source_repo_url: String,
    pub pr_number: u64,
    pub repo_name: String,
    pub pr_url: String,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid event: {0}")]
    Validation(String),
    #[error("could not read recipe: {0}")]
    RecipeUnavailable(GitOpError),
    #[error("could not store request: {0}")]
    Storage(StoreError),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::Validation(_) => StatusCode::BAD_REQUEST,
            WebhookError::RecipeUnavailable(_) => StatusCode::BAD_GATEWAY,
            WebhookError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, WebhookError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| WebhookError::Validation(format!("missing {}", field)))
}

/// Pull the request fields out of a note event.
///
/// Without a head repository the origin is used as the source, unless
/// `require_source_url` is set.
pub fn extract_fields(
    payload: &GiteeNotePayload,
    require_source_url: bool,
) -> Result<PullRequestFields, WebhookError> {
    let project = payload
        .project
        .as_ref()
        .ok_or_else(|| WebhookError::Validation("missing project".to_string()))?;
    let pull_request = payload
        .pull_request
        .as_ref()
        .ok_or_else(|| WebhookError::Validation("missing pull_request".to_string()))?;

    let origin_repo_url = required(
        project.html_url.as_deref().or(project.url.as_deref()),
        "project.html_url",
    )?
    .to_string();

    let source = pull_request
        .head
        .as_ref()
        .and_then(|head| head.repo.as_ref())
        .and_then(|repo| repo.html_url.as_deref().or(repo.url.as_deref()))
        .map(str::trim)
        .filter(|url| !url.is_empty());
    let source_repo_url = match source {
        Some(url) => url.to_string(),
        None if require_source_url => {
            return Err(WebhookError::Validation(
                "missing pull_request.head.repo.html_url".to_string(),
            ))
        }
        None => origin_repo_url.clone(),
    };

    let pr_number = pull_request
        .number
        .ok_or_else(|| WebhookError::Validation("missing pull_request.number".to_string()))?;

    let repo_name = required(
        project.name.as_deref().or(project.path.as_deref()),
        "project.name",
    )?
    .to_string();

    let pr_url = required(pull_request.html_url.as_deref(), "pull_request.html_url")?.to_string();

    Ok(PullRequestFields {
        origin_repo_url,
        source_repo_url,
        pr_number,
        repo_name,
        pr_url,
    })
}

type HmacSha256 = Hmac<Sha256>;

/// Gitee's signing scheme: base64(HMAC-SHA256(secret, "{timestamp}\n{secret}")).
pub fn compute_gitee_signature(secret: &str, timestamp: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(format!("{}\n{}", timestamp, secret).as_bytes());
    Some(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn verify_gitee_signature(secret: &str, timestamp: &str, token: &str) -> bool {
    let Ok(expected) = general_purpose::STANDARD.decode(token.trim()) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(format!("{}\n{}", timestamp, secret).as_bytes());

    // Constant-time comparison.
    mac.verify_slice(&expected).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let correlation_id = CorrelationId(Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
    };
    let (Some(token), Some(timestamp)) = (header(TOKEN_HEADER), header(TIMESTAMP_HEADER)) else {
        warn!("Webhook without signature headers");
        return Err(StatusCode::BAD_REQUEST);
    };

    if !verify_gitee_signature(&state.webhook_secret, &timestamp, &token) {
        error!("Invalid webhook signature");
        return Err(StatusCode::FORBIDDEN);
    }

    if let Some(ref logger) = state.recording_logger {
        let webhook_event = RecordedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.0.clone(),
            event_type: EventType::WebhookReceived,
            direction: Direction::Request,
            operation: "webhook".to_string(),
            data: json!({
                "headers": Sanitizer::sanitize_headers(&headers_to_hashmap(&parts.headers)),
                "body": Sanitizer::sanitize_json(
                    &serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null)
                )
            }),
            metadata: HashMap::new(),
        };
        logger.record(webhook_event);
    }

    let mut request = Request::from_parts(parts, axum::body::Body::from(bytes));
    request.extensions_mut().insert(correlation_id);

    Ok(next.run(request).await)
}

fn headers_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

fn ignored() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ignored" })))
}

pub async fn gitee_webhook_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), WebhookError> {
    let payload: GiteeNotePayload = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::Validation(format!("malformed payload: {}", e)))?;

    if !payload.is_pull_request_note() {
        info!(noteable_type = ?payload.noteable_type, "Ignoring non pull request note");
        return Ok(ignored());
    }
    if !state.commands.matches(payload.comment_text()) {
        info!("Ignoring comment without a recognized command");
        return Ok(ignored());
    }

    let fields = extract_fields(&payload, state.require_source_url)?;
    info!(
        repo = %fields.repo_name,
        pr_number = fields.pr_number,
        "Received repair command"
    );

    let hosting = state
        .hosting
        .for_url(&fields.origin_repo_url)
        .map_err(|e| WebhookError::Validation(e.to_string()))?;

    let recipe_content = hosting
        .read_file(
            &fields.origin_repo_url,
            fields.pr_number,
            &RepairSettings::recipe_path(&fields.repo_name),
        )
        .await
        .map_err(WebhookError::RecipeUnavailable)?;

    let id = state
        .store
        .insert(NewRepairRequest {
            origin_repo_url: fields.origin_repo_url,
            source_repo_url: fields.source_repo_url,
            pr_number: fields.pr_number,
            repo_name: fields.repo_name,
            pr_url: fields.pr_url,
            recipe_content,
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to store repair request");
            WebhookError::Storage(e)
        })?;

    info!(request_id = %id, "Stored repair request");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "request_id": id.0 })),
    ))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(gitee_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
