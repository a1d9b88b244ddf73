use crate::extract::TimeRange;
use crate::types::QuotaStatus;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "2024-11-01";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn identity_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "identity": {"type": "string", "description": "Verified principal identity, e.g. an e-mail address"}
        },
        "required": ["identity"]
    })
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "additionalProperties": false, "properties": {}})
}

/// Methods this server answers. `ping` is listed only when enabled.
pub fn method_descriptors(include_ping: bool) -> Vec<MethodDescriptor> {
    let mut out = Vec::new();
    if include_ping {
        out.push(MethodDescriptor {
            name: "ping".into(),
            description: "Health check; echoes a message.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "message": {"type": "string"}
                }
            }),
        });
    }

    out.push(MethodDescriptor {
        name: "principals/authenticate".into(),
        description: "Get or create the principal for a verified identity".into(),
        input_schema: identity_schema(),
    });
    out.push(MethodDescriptor {
        name: "quota/status".into(),
        description: "Daily quota usage for a principal".into(),
        input_schema: identity_schema(),
    });
    out.push(MethodDescriptor {
        name: "queue/stats".into(),
        description: "Snapshot of the analysis queue".into(),
        input_schema: empty_schema(),
    });
    out.push(MethodDescriptor {
        name: "timestamps/extract".into(),
        description: "Extract non-overlapping time ranges from free text".into(),
        input_schema: serde_json::json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "text": {"type": "string"}
            },
            "required": ["text"]
        }),
    });
    out.push(MethodDescriptor {
        name: "video/analyze".into(),
        description: "Analyze an uploaded video against a prompt; consumes one unit of daily quota".into(),
        input_schema: serde_json::json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "identity": {"type": "string"},
                "gcs_uri": {"type": "string", "pattern": "^gs://[a-z0-9-]+/\\S+$"},
                "prompt": {"type": "string", "minLength": 10, "maxLength": 1000}
            },
            "required": ["identity", "gcs_uri", "prompt"]
        }),
    });
    out
}

/// Trimmed, lower-cased identity; `None` when blank.
pub fn normalize_identity(raw: &str) -> Option<String> {
    let id = raw.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_lowercase())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PingInput {
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PingOutput {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdentityInput {
    pub identity: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthenticateOutput {
    pub principal_id: String,
    pub identity: String,
    pub quota: Option<QuotaStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QuotaStatusOutput {
    pub principal_id: String,
    pub quota: QuotaStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExtractInput {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExtractOutput {
    pub timestamps: Vec<String>,
    /// Parsed ranges; empty when the single-timestamp fallback was used.
    pub ranges: Vec<TimeRange>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyzeInput {
    pub identity: String,
    pub gcs_uri: String,
    pub prompt: String,
}
