use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use specfix_core::llm::{ChatOptions, DEFAULT_CHAT_URL, DEFAULT_MODEL};

use crate::build_farm::{BuildTarget, DEFAULT_BUILD_FARM_URL};
use crate::command::{CommandFilter, DEFAULT_COMMANDS};
use crate::dispatch::DispatchSettings;
use crate::repair::RepairSettings;
use crate::worker::WorkerSettings;

pub const DATABASE_FILE: &str = "specfix-state.db";

#[derive(Clone)]
pub struct Config {
    pub webhook_secret: String,
    pub port: u16,
    /// Directory for the SQLite database. Defaults to the working directory.
    pub state_dir: PathBuf,

    pub gitee_token: Option<String>,
    pub github_token: Option<String>,
    pub gitcode_token: Option<String>,

    pub llm_api_key: String,
    pub llm_api_url: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,

    pub build_farm_token: String,
    pub build_farm_api_url: String,
    pub repair_project: String,
    pub pr_project_template: Option<String>,
    pub os_variant: String,
    pub os_arch: String,
    pub ground_projects: Vec<String>,

    pub max_retries: u32,
    pub build_poll_interval: Duration,
    pub build_timeout: Duration,
    pub dispatch_interval: Duration,
    pub claim_batch_size: usize,
    pub worker_count: usize,
    pub lease_ttl: Duration,
    pub max_claims: u32,
    pub shutdown_grace: Duration,

    pub commands: CommandFilter,
    pub require_source_url: bool,

    pub recording_enabled: bool,
    pub recording_log_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            get(key).with_context(|| format!("{} environment variable is required", key))
        };

        let webhook_secret = require("WEBHOOK_SECRET")?;
        let llm_api_key = require("LLM_API_KEY")?;
        let build_farm_token = require("BUILD_FARM_TOKEN")?;
        let repair_project = require("REPAIR_PROJECT")?;

        let gitee_token = get("GITEE_TOKEN");
        let github_token = get("GITHUB_TOKEN");
        let gitcode_token = get("GITCODE_TOKEN");
        if gitee_token.is_none() && github_token.is_none() && gitcode_token.is_none() {
            bail!("at least one of GITEE_TOKEN, GITHUB_TOKEN or GITCODE_TOKEN is required");
        }

        let claim_batch_size: usize = parse_or(&get, "CLAIM_BATCH_SIZE", 8)?;
        if claim_batch_size == 0 {
            bail!("CLAIM_BATCH_SIZE must be at least 1");
        }
        let worker_count: usize = parse_or(&get, "WORKER_COUNT", 4)?;
        if worker_count == 0 {
            bail!("WORKER_COUNT must be at least 1");
        }
        let build_poll_interval = secs_or(&get, "BUILD_POLL_INTERVAL_SECS", 30)?;
        if build_poll_interval.is_zero() {
            bail!("BUILD_POLL_INTERVAL_SECS must be at least 1");
        }
        let dispatch_interval = secs_or(&get, "DISPATCH_INTERVAL_SECS", 30)?;
        if dispatch_interval.is_zero() {
            bail!("DISPATCH_INTERVAL_SECS must be at least 1");
        }

        Ok(Config {
            webhook_secret,
            port: parse_or(&get, "PORT", 3000)?,
            state_dir: get("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),

            gitee_token,
            github_token,
            gitcode_token,

            llm_api_key,
            llm_api_url: get("LLM_API_URL").unwrap_or_else(|| DEFAULT_CHAT_URL.to_string()),
            llm_model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            llm_temperature: parse_or(&get, "LLM_TEMPERATURE", 0.2)?,
            llm_max_tokens: parse_or(&get, "LLM_MAX_TOKENS", 4096)?,

            build_farm_token,
            build_farm_api_url: get("BUILD_FARM_API_URL")
                .unwrap_or_else(|| DEFAULT_BUILD_FARM_URL.to_string()),
            repair_project,
            pr_project_template: get("PR_PROJECT_TEMPLATE"),
            os_variant: get("OS_VARIANT").unwrap_or_else(|| "openEuler:24.03".to_string()),
            os_arch: get("OS_ARCH").unwrap_or_else(|| "x86_64".to_string()),
            ground_projects: get("GROUND_PROJECTS")
                .map(|list| split_list(&list))
                .unwrap_or_default(),

            max_retries: parse_or(&get, "MAX_RETRIES", 3)?,
            build_poll_interval,
            build_timeout: secs_or(&get, "BUILD_TIMEOUT_SECS", 36_000)?,
            dispatch_interval,
            claim_batch_size,
            worker_count,
            lease_ttl: secs_or(&get, "LEASE_TTL_SECS", 600)?,
            max_claims: parse_or(&get, "MAX_CLAIMS", 3)?,
            shutdown_grace: secs_or(&get, "SHUTDOWN_GRACE_SECS", 60)?,

            commands: CommandFilter::parse(
                &get("ACCEPT_COMMANDS").unwrap_or_else(|| DEFAULT_COMMANDS.to_string()),
            ),
            require_source_url: flag(&get, "REQUIRE_SOURCE_URL"),

            recording_enabled: flag(&get, "RECORDING_ENABLED"),
            recording_log_path: get("RECORDING_LOG_PATH")
                .unwrap_or_else(|| "recordings.jsonl".to_string()),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join(DATABASE_FILE)
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            model: self.llm_model.clone(),
            temperature: self.llm_temperature,
            max_tokens: self.llm_max_tokens,
        }
    }

    pub fn build_target(&self) -> BuildTarget {
        BuildTarget {
            os_variant: self.os_variant.clone(),
            architecture: self.os_arch.clone(),
            ground_projects: self.ground_projects.clone(),
            ..BuildTarget::default()
        }
    }

    pub fn repair_settings(&self) -> RepairSettings {
        RepairSettings {
            max_retries: self.max_retries,
            poll_interval: self.build_poll_interval,
            build_timeout: self.build_timeout,
            repair_project: self.repair_project.clone(),
            pr_project_template: self.pr_project_template.clone(),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            interval: self.dispatch_interval,
            batch_size: self.claim_batch_size,
            lease_ttl: self.lease_ttl,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            worker_count: self.worker_count,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{} must be a valid number: {}", key, e)),
        None => Ok(default),
    }
}

fn secs_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    parse_or(get, key, default).map(Duration::from_secs)
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    get(key)
        .map(|v| v.trim().parse::<bool>().unwrap_or(false))
        .unwrap_or(false)
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
