//! Log-analysis adapter backed by a chat completion model.

use async_trait::async_trait;
use specfix_core::llm::ChatClient;
use specfix_core::prompt::{
    diagnose_messages, extract_recipe, fix_messages, parse_issue_draft, IssueDraft,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("log analysis model call failed: {0}")]
    Model(String),
    #[error("model reply did not contain a ```spec block")]
    MissingRecipe,
    #[error("model reply could not be used: {0}")]
    Malformed(String),
}

/// A corrected recipe and the model's account of what it changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fix {
    pub recipe: String,
    pub explanation: String,
}

#[async_trait]
pub trait LogAnalyzer: Send + Sync {
    async fn fix(
        &self,
        repo_name: &str,
        recipe: &str,
        log: &str,
        context: Option<&str>,
    ) -> Result<Fix, AnalysisError>;

    /// Draft an issue from warning lines. `None` when the model declines.
    async fn diagnose(&self, warnings: &[String]) -> Result<Option<IssueDraft>, AnalysisError>;
}

pub struct ChatAnalyzer {
    client: ChatClient,
}

impl ChatAnalyzer {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogAnalyzer for ChatAnalyzer {
    async fn fix(
        &self,
        repo_name: &str,
        recipe: &str,
        log: &str,
        context: Option<&str>,
    ) -> Result<Fix, AnalysisError> {
        let messages = fix_messages(repo_name, recipe, log, context);
        let reply = self
            .client
            .complete(&messages)
            .await
            .map_err(|e| AnalysisError::Model(format!("{:#}", e)))?;

        let parsed = extract_recipe(&reply).ok_or_else(|| {
            warn!(repo_name = %repo_name, "Model reply has no recipe block");
            AnalysisError::MissingRecipe
        })?;

        if parsed.recipe == recipe.trim() {
            debug!(repo_name = %repo_name, "Model returned the recipe unchanged");
        }

        Ok(Fix {
            recipe: parsed.recipe,
            explanation: parsed.explanation,
        })
    }

    async fn diagnose(&self, warnings: &[String]) -> Result<Option<IssueDraft>, AnalysisError> {
        if warnings.is_empty() {
            return Err(AnalysisError::Malformed("no warnings to diagnose".to_string()));
        }
        let reply = self
            .client
            .complete(&diagnose_messages(warnings))
            .await
            .map_err(|e| AnalysisError::Model(format!("{:#}", e)))?;
        Ok(parse_issue_draft(&reply))
    }
}
