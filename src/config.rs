use crate::admission::DEFAULT_DAILY_QUOTA;
use crate::error::ConfigError;
use crate::extract::RangeValidation;
use crate::queue::{QueueConfig, DEFAULT_JOB_DELAY, DEFAULT_MAX_CONCURRENT};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_VERTEX_PROJECT: &str = "video-searcher-1";
pub const DEFAULT_VERTEX_LOCATION: &str = "us-central1";
pub const DEFAULT_VERTEX_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_STORAGE_API_URL: &str = "https://storage.googleapis.com/storage/v1";

/// Runtime configuration for the relay and its Vertex AI / Cloud Storage clients.
/// Values are sourced from environment variables with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub daily_quota: u32,
    pub max_concurrent: usize,
    pub job_delay: Duration,
    pub range_validation: RangeValidation,
    pub delete_after_analysis: bool,
    pub enable_ping: bool,
    pub vertex_project: String,
    pub vertex_location: String,
    pub vertex_model: String,
    pub vertex_api_url: String,
    pub storage_api_url: String,
    pub access_token: Option<String>,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daily_quota: DEFAULT_DAILY_QUOTA,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            job_delay: DEFAULT_JOB_DELAY,
            range_validation: RangeValidation::default(),
            delete_after_analysis: true,
            enable_ping: false,
            vertex_project: DEFAULT_VERTEX_PROJECT.into(),
            vertex_location: DEFAULT_VERTEX_LOCATION.into(),
            vertex_model: DEFAULT_VERTEX_MODEL.into(),
            vertex_api_url: default_vertex_api_url(DEFAULT_VERTEX_LOCATION, DEFAULT_VERTEX_PROJECT),
            storage_api_url: DEFAULT_STORAGE_API_URL.into(),
            access_token: None,
            user_agent: default_user_agent(),
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

fn default_user_agent() -> String {
    format!("video-searcher/{}", env!("CARGO_PKG_VERSION"))
}

/// Publisher-models base URL for a Vertex AI region and project.
pub fn default_vertex_api_url(location: &str, project: &str) -> String {
    format!(
        "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models"
    )
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

// Unset or blank means "use the default".
fn lookup(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(var, &raw, e.to_string())),
    }
}

fn parse_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, &raw, "expected true or false")),
    }
}

fn parse_url(var: &'static str, default: String) -> Result<String, ConfigError> {
    let raw = lookup(var).unwrap_or(default);
    let trimmed = raw.trim().trim_end_matches('/').to_string();
    Url::parse(&trimmed).map_err(|e| invalid(var, &raw, e.to_string()))?;
    Ok(trimmed)
}

impl Config {
    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - VIDEO_SEARCHER_DAILY_QUOTA (default: 1)
    /// - VIDEO_SEARCHER_MAX_CONCURRENT (default: 1, at least 1)
    /// - VIDEO_SEARCHER_JOB_DELAY_MS (default: 500)
    /// - VIDEO_SEARCHER_RANGE_VALIDATION (default: reject-inverted)
    /// - VIDEO_SEARCHER_DELETE_AFTER_ANALYSIS (default: true)
    /// - VIDEO_SEARCHER_ENABLE_PING (default: false)
    /// - VERTEX_PROJECT / VERTEX_LOCATION / VERTEX_MODEL
    /// - VERTEX_API_URL (default: derived from location and project)
    /// - STORAGE_API_URL (default: https://storage.googleapis.com/storage/v1)
    /// - GOOGLE_ACCESS_TOKEN (optional bearer token)
    /// - VIDEO_SEARCHER_HTTP_TIMEOUT_SECS (default: 120)
    /// - VIDEO_SEARCHER_HTTP_MAX_RETRIES (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let max_concurrent = parse_var("VIDEO_SEARCHER_MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(invalid("VIDEO_SEARCHER_MAX_CONCURRENT", "0", "must be at least 1"));
        }
        let job_delay_ms = parse_var(
            "VIDEO_SEARCHER_JOB_DELAY_MS",
            defaults.job_delay.as_millis() as u64,
        )?;

        let vertex_project = lookup("VERTEX_PROJECT").unwrap_or(defaults.vertex_project);
        let vertex_location = lookup("VERTEX_LOCATION").unwrap_or(defaults.vertex_location);
        let vertex_model = lookup("VERTEX_MODEL").unwrap_or(defaults.vertex_model);
        let vertex_api_url = parse_url(
            "VERTEX_API_URL",
            default_vertex_api_url(&vertex_location, &vertex_project),
        )?;

        Ok(Self {
            daily_quota: parse_var("VIDEO_SEARCHER_DAILY_QUOTA", defaults.daily_quota)?,
            max_concurrent,
            job_delay: Duration::from_millis(job_delay_ms),
            range_validation: parse_var("VIDEO_SEARCHER_RANGE_VALIDATION", defaults.range_validation)?,
            delete_after_analysis: parse_bool(
                "VIDEO_SEARCHER_DELETE_AFTER_ANALYSIS",
                defaults.delete_after_analysis,
            )?,
            enable_ping: parse_bool("VIDEO_SEARCHER_ENABLE_PING", defaults.enable_ping)?,
            vertex_project,
            vertex_location,
            vertex_model,
            vertex_api_url,
            storage_api_url: parse_url("STORAGE_API_URL", defaults.storage_api_url)?,
            access_token: lookup("GOOGLE_ACCESS_TOKEN"),
            user_agent: defaults.user_agent,
            timeout_secs: parse_var("VIDEO_SEARCHER_HTTP_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_retries: parse_var("VIDEO_SEARCHER_HTTP_MAX_RETRIES", defaults.max_retries)?,
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(self.max_concurrent, self.job_delay)
    }
}
