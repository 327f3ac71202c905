//! Client for OpenAI-compatible chat completion endpoints.

use anyhow::{anyhow, Context, Result};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

use crate::recording::{RecordingLogger, RecordingMiddleware, ServiceType};

pub const DEFAULT_CHAT_URL: &str = "https://api.siliconflow.cn/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-Coder-32B-Instruct";

/// Completions for large recipes and logs can take minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct ChatClient {
    client: ClientWithMiddleware,
    api_url: String,
    api_key: String,
    options: ChatOptions,
}

impl ChatClient {
    pub fn new(api_url: String, api_key: String, options: ChatOptions) -> Self {
        Self::new_with_recording(api_url, api_key, options, None)
    }

    pub fn new_with_recording(
        api_url: String,
        api_key: String,
        options: ChatOptions,
        recording_logger: Option<RecordingLogger>,
    ) -> Self {
        let base = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let mut builder = ClientBuilder::new(base);
        if let Some(logger) = recording_logger {
            builder = builder.with(RecordingMiddleware::new(logger, ServiceType::LogAnalysis));
        }

        Self {
            client: builder.build(),
            api_url,
            api_key,
            options,
        }
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    /// Send one conversation and return the first choice's text.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = ChatRequest {
            model: &self.options.model,
            messages,
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
        };

        debug!(
            model = %self.options.model,
            messages = messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("Chat completion API error: {} - {}", status, error_text);
            return Err(anyhow!(
                "Chat completion API error: {} - {}",
                status,
                error_text
            ));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("Chat completion response contained no choices"))
    }
}
