//! Prompt construction and reply parsing for the log-analysis model.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::llm::ChatMessage;

const RECIPE_FENCE: &str = "```spec";
const FENCE: &str = "```";

/// System prompt for recipe repair.
pub fn fix_system_prompt() -> &'static str {
    include_str!("../prompts/fix.txt")
}

/// System prompt for drafting an issue from build warnings.
pub fn diagnose_system_prompt() -> &'static str {
    include_str!("../prompts/diagnose.txt")
}

/// Build the user prompt for one repair round.
pub fn create_fix_prompt(
    repo_name: &str,
    recipe: &str,
    build_log: &str,
    context: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Package: {}\n\nSPEC FILE BEGINS:\n{}\nSPEC FILE ENDS\n\nBUILD LOG (last lines) BEGINS:\n{}\nBUILD LOG ENDS\n",
        repo_name, recipe, build_log
    );

    if let Some(context) = context {
        prompt.push_str("\nREPOSITORY CONTEXT (files changed by the pull request):\n");
        prompt.push_str(context);
        prompt.push('\n');
    }

    prompt
}

pub fn fix_messages(
    repo_name: &str,
    recipe: &str,
    build_log: &str,
    context: Option<&str>,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(fix_system_prompt()),
        ChatMessage::user(create_fix_prompt(repo_name, recipe, build_log, context)),
    ]
}

pub fn diagnose_messages(warnings: &[String]) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(diagnose_system_prompt()),
        ChatMessage::user(warnings.join("\n")),
    ]
}

/// A model reply split into the corrected recipe and the prose around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeReply {
    pub recipe: String,
    pub explanation: String,
}

/// Pull the first ```spec fenced block out of a reply.
///
/// Returns `None` when there is no opening fence, no closing fence, or the block is empty.
pub fn extract_recipe(reply: &str) -> Option<RecipeReply> {
    let start = reply.find(RECIPE_FENCE)?;
    let body_start = start + RECIPE_FENCE.len();
    let body_len = reply[body_start..].find(FENCE)?;
    let body_end = body_start + body_len;

    let recipe = reply[body_start..body_end].trim();
    if recipe.is_empty() {
        return None;
    }

    let before = reply[..start].trim();
    let after = reply[body_end + FENCE.len()..].trim();
    let explanation = match (before.is_empty(), after.is_empty()) {
        (false, false) => format!("{}\n\n{}", before, after),
        (false, true) => before.to_string(),
        (true, false) => after.to_string(),
        (true, true) => String::new(),
    };

    Some(RecipeReply {
        recipe: recipe.to_string(),
        explanation,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDraft {
    pub title: String,
    pub body: String,
}

static ISSUE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Title:\s*(?P<title>[^\n]+?)\s*\n\s*Body:\s*(?P<body>.*)")
        .expect("issue pattern is valid")
});

/// Parse a `Title:` / `Body:` reply. Anything else, including `NONE`, yields `None`.
pub fn parse_issue_draft(reply: &str) -> Option<IssueDraft> {
    let captures = ISSUE_PATTERN.captures(reply)?;
    let title = captures.name("title")?.as_str().trim();
    let body = captures.name("body")?.as_str().trim();

    if title.is_empty() || body.is_empty() {
        return None;
    }

    Some(IssueDraft {
        title: title.to_string(),
        body: body.to_string(),
    })
}
