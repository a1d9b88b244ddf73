//! Vertex AI `generateContent` and Cloud Storage object deletion over reqwest.

use crate::config::Config;
use crate::error::BackendError;
use crate::orchestrator::AnalysisBackend;
use crate::types::ErrorInfo;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const VIDEO_MIME_TYPE: &str = "video/mp4";

pub fn build_client(cfg: &Config) -> reqwest::Result<Client> {
    let mut default_headers = HeaderMap::new();
    if let Ok(ua) = HeaderValue::from_str(&cfg.user_agent) {
        default_headers.insert(USER_AGENT, ua);
    }
    default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    Client::builder()
        .default_headers(default_headers)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .use_rustls_tls()
        .build()
}

pub fn map_status_to_error(status: StatusCode, message: String) -> ErrorInfo {
    let (code, retriable) = match status {
        StatusCode::BAD_REQUEST => ("bad_request", false),
        StatusCode::UNAUTHORIZED => ("unauthorized", false),
        StatusCode::FORBIDDEN => ("forbidden", false),
        StatusCode::NOT_FOUND => ("not_found", false),
        StatusCode::TOO_MANY_REQUESTS => ("rate_limited", true),
        s if s.is_server_error() => ("upstream_error", true),
        _ => ("server_error", false),
    };
    ErrorInfo {
        code: code.to_string(),
        message,
        retriable,
    }
}

impl From<ErrorInfo> for BackendError {
    fn from(e: ErrorInfo) -> Self {
        BackendError::new(e.code, e.message, e.retriable)
    }
}

pub fn compute_backoff(attempt: u32, retry_after: Option<Duration>) -> Duration {
    if let Some(d) = retry_after {
        return d;
    }
    // Exponential with jitter: half of min(200ms * 2^attempt, 5s), plus up to that half again.
    let base = 200u64.saturating_mul(1u64 << attempt.min(5));
    let max = 5_000u64.min(base);
    let jitter = fastrand::u64(0..=max / 2);
    Duration::from_millis(max / 2 + jitter)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Split `gs://bucket/object/path` into bucket and object name.
pub fn parse_gcs_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("gs://")?;
    let (bucket, object) = rest.split_once('/')?;
    if bucket.is_empty() || object.is_empty() {
        return None;
    }
    Some((bucket, object))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    File {
        #[serde(rename = "fileData")]
        file_data: FileData<'a>,
    },
    Text {
        text: &'a str,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileData<'a> {
    mime_type: &'static str,
    file_uri: &'a str,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CandidatePart {
    #[serde(default)]
    pub text: Option<String>,
}

impl GenerateResponse {
    /// Text of the first part of the first candidate; empty when absent.
    pub fn first_text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.first())
            .and_then(|p| p.text.clone())
            .unwrap_or_default()
    }
}

/// Client for the model endpoint and the object store holding uploaded videos.
#[derive(Debug, Clone)]
pub struct VertexClient {
    client: Client,
    generate_url: String,
    storage_api_url: String,
    access_token: Option<String>,
    max_retries: u32,
}

impl VertexClient {
    pub fn new(cfg: &Config) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(cfg)?,
            generate_url: format!("{}/{}:generateContent", cfg.vertex_api_url, cfg.vertex_model),
            storage_api_url: cfg.storage_api_url.clone(),
            access_token: cfg.access_token.clone(),
            max_retries: cfg.max_retries,
        })
    }

    pub fn generate_url(&self) -> &str {
        &self.generate_url
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {token}")),
            None => req,
        }
    }

    // Sends the request built by `make`, retrying transport errors and 429/5xx.
    async fn send_with_retry(
        &self,
        what: &str,
        make: impl Fn() -> RequestBuilder,
    ) -> Result<Response, BackendError> {
        let mut attempt: u32 = 0;
        loop {
            let res = match self.authorize(make()).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt < self.max_retries {
                        let backoff = compute_backoff(attempt, None);
                        warn!("{} send error: {}; retrying in {:?}", what, e, backoff);
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(BackendError::new("upstream_error", e.to_string(), true));
                }
            };

            let status = res.status();
            if status.is_success() {
                return Ok(res);
            }
            if (status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error())
                && attempt < self.max_retries
            {
                let backoff = compute_backoff(attempt, retry_after(res.headers()));
                warn!("{} retrying (status {}), backoff {:?}", what, status, backoff);
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }
            let text = res.text().await.unwrap_or_default();
            return Err(map_status_to_error(status, text).into());
        }
    }

    /// Ask the model about the video at `gcs_uri`; returns its raw text answer.
    pub async fn generate(&self, gcs_uri: &str, prompt: &str) -> Result<String, BackendError> {
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    RequestPart::File {
                        file_data: FileData {
                            mime_type: VIDEO_MIME_TYPE,
                            file_uri: gcs_uri,
                        },
                    },
                    RequestPart::Text { text: prompt },
                ],
            }],
        };
        debug!("generateContent for {}", gcs_uri);
        let res = self
            .send_with_retry("generateContent", || {
                self.client.post(&self.generate_url).json(&body)
            })
            .await?;
        let parsed: GenerateResponse = res
            .json()
            .await
            .map_err(|e| BackendError::new("server_error", e.to_string(), false))?;
        Ok(parsed.first_text())
    }

    /// Delete the object behind a `gs://` URI.
    pub async fn delete_object(&self, gcs_uri: &str) -> Result<(), BackendError> {
        let (bucket, object) = parse_gcs_uri(gcs_uri).ok_or_else(|| {
            BackendError::new("bad_request", format!("not a gs:// object URI: {gcs_uri}"), false)
        })?;
        let url = format!(
            "{}/b/{}/o/{}",
            self.storage_api_url,
            urlencoding::encode(bucket),
            urlencoding::encode(object)
        );
        self.send_with_retry("storage delete", || self.client.delete(&url))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl AnalysisBackend for VertexClient {
    async fn analyze(&self, gcs_uri: &str, prompt: &str) -> Result<String, BackendError> {
        self.generate(gcs_uri, prompt).await
    }

    async fn release(&self, gcs_uri: &str) -> Result<(), BackendError> {
        self.delete_object(gcs_uri).await
    }
}
