//! Input checks applied to analysis requests before any quota is spent.

use crate::error::AnalysisError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const MIN_PROMPT_CHARS: usize = 10;
pub const MAX_PROMPT_CHARS: usize = 1000;
pub const MAX_CLIP_PADDING_SECS: f64 = 30.0;
pub const MAX_RESULTS: u64 = 50;

static GCS_URI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^gs://[a-z0-9-]+/\S+$").expect("valid gcs uri regex"));

static PADDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)include\s+(\d+(?:\.\d+)?)\s+seconds?\s+of\s+padding").expect("valid padding regex")
});

static MAX_RESULTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)return\s+at\s+most\s+(\d+)\s+results?").expect("valid max results regex")
});

/// A request that passed validation; fields are trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub gcs_uri: String,
    pub prompt: String,
}

impl AnalyzeRequest {
    pub fn new(gcs_uri: &str, prompt: &str) -> Result<Self, AnalysisError> {
        let gcs_uri = validate_gcs_uri(gcs_uri)?;
        let prompt = validate_prompt(prompt)?;
        validate_clip_settings(&prompt)?;
        Ok(Self { gcs_uri, prompt })
    }
}

fn invalid(msg: impl Into<String>) -> AnalysisError {
    AnalysisError::Invalid(msg.into())
}

pub fn validate_gcs_uri(raw: &str) -> Result<String, AnalysisError> {
    let uri = raw.trim();
    if uri.is_empty() {
        return Err(invalid("gcs_uri is required"));
    }
    if !GCS_URI_RE.is_match(uri) {
        return Err(invalid(format!("invalid GCS URI format: {uri}")));
    }
    Ok(uri.to_string())
}

fn prompt_char_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c.is_whitespace() || ".,!?'\"()-:".contains(c)
}

pub fn validate_prompt(raw: &str) -> Result<String, AnalysisError> {
    let prompt = raw.trim();
    if prompt.is_empty() {
        return Err(invalid("prompt is required"));
    }
    let len = prompt.chars().count();
    if !(MIN_PROMPT_CHARS..=MAX_PROMPT_CHARS).contains(&len) {
        return Err(invalid(format!(
            "prompt must be between {MIN_PROMPT_CHARS} and {MAX_PROMPT_CHARS} characters, got {len}"
        )));
    }
    if let Some(bad) = prompt.chars().find(|c| !prompt_char_allowed(*c)) {
        return Err(invalid(format!("prompt contains invalid character {bad:?}")));
    }
    Ok(prompt.to_string())
}

/// Limits on clip settings the client embeds in the prompt text.
pub fn validate_clip_settings(prompt: &str) -> Result<(), AnalysisError> {
    if let Some(caps) = PADDING_RE.captures(prompt) {
        let padding: f64 = caps[1]
            .parse()
            .map_err(|_| invalid(format!("unreadable clip padding {:?}", &caps[1])))?;
        if padding > MAX_CLIP_PADDING_SECS {
            return Err(invalid(format!(
                "clip padding cannot exceed {MAX_CLIP_PADDING_SECS} seconds; requested {padding}"
            )));
        }
    }
    if let Some(caps) = MAX_RESULTS_RE.captures(prompt) {
        // Digits too long for u64 are certainly above the limit.
        let requested = caps[1].parse::<u64>().unwrap_or(u64::MAX);
        if requested > MAX_RESULTS {
            return Err(invalid(format!(
                "maximum results cannot exceed {MAX_RESULTS}; requested {}",
                &caps[1]
            )));
        }
    }
    Ok(())
}
