//! Line-delimited JSON-RPC 2.0 over stdio.
//!
//! Cheap methods are answered on the reader loop. `video/analyze` is
//! validated, admitted and enqueued on the reader loop too, so line order
//! decides both who gets the last unit of quota and who reaches the model
//! first. Only the wait for the result runs on its own task.
//! Responses are written in completion order by a single writer task.

use crate::admission::{AdmissionController, PrincipalRepository};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::error::{AdmissionError, AnalysisError};
use crate::extract::TimeRangeExtractor;
use crate::http::VertexClient;
use crate::methods::*;
use crate::orchestrator::AnalysisOrchestrator;
use crate::queue::{RequestSerializer, ShutdownMode};
use crate::validate::AnalyzeRequest;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const APPLICATION_ERROR: i64 = -32000;
pub const QUOTA_EXCEEDED: i64 = -32029;

// Minimal JSON-RPC 2.0 types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Str(String),
    Num(i64),
    Null,
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn rpc_error(id: Option<Id>, code: i64, message: &str, data: Option<Value>) -> Response {
    Response {
        jsonrpc: "2.0".into(),
        result: None,
        error: Some(RpcError {
            code,
            message: message.into(),
            data,
        }),
        id,
    }
}

fn rpc_ok(id: Option<Id>, result: Value) -> Response {
    Response {
        jsonrpc: "2.0".into(),
        result: Some(result),
        error: None,
        id,
    }
}

fn rpc_result<T: Serialize>(id: Option<Id>, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(v) => rpc_ok(id, v),
        Err(e) => rpc_error(id, APPLICATION_ERROR, &format!("Serialization error: {}", e), None),
    }
}

fn analysis_error(id: Option<Id>, err: &AnalysisError) -> Response {
    let info = err.to_error_info();
    let mut data = serde_json::json!({
        "code": info.code,
        "message": info.message,
        "retriable": info.retriable,
    });
    let code = match err {
        AnalysisError::Admission(AdmissionError::QuotaExceeded {
            remaining,
            reset_at,
        }) => {
            data["remaining"] = serde_json::json!(remaining);
            data["reset_at"] = serde_json::json!(reset_at);
            QUOTA_EXCEEDED
        }
        AnalysisError::Invalid(_) => INVALID_PARAMS,
        _ => APPLICATION_ERROR,
    };
    rpc_error(id, code, &info.message, Some(data))
}

fn parse_params<T: DeserializeOwned>(id: &Option<Id>, params: Value) -> Result<T, Response> {
    serde_json::from_value(params)
        .map_err(|e| rpc_error(id.clone(), INVALID_PARAMS, &format!("Invalid params: {}", e), None))
}

fn identity_param(id: &Option<Id>, raw: &str) -> Result<String, Response> {
    normalize_identity(raw)
        .ok_or_else(|| rpc_error(id.clone(), INVALID_PARAMS, "identity is required", None))
}

/// Everything a request handler needs.
pub struct Server {
    orchestrator: Arc<AnalysisOrchestrator>,
    enable_ping: bool,
}

impl Server {
    pub fn new(orchestrator: Arc<AnalysisOrchestrator>, enable_ping: bool) -> Self {
        Self {
            orchestrator,
            enable_ping,
        }
    }

    /// Wire up the production components from configuration.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let backend = Arc::new(VertexClient::new(cfg)?);
        info!("model endpoint {}", backend.generate_url());
        let admission = AdmissionController::new(
            Arc::new(PrincipalRepository::new()),
            Arc::new(SystemClock),
            cfg.daily_quota,
        );
        let orchestrator = AnalysisOrchestrator::new(
            admission,
            RequestSerializer::new(cfg.queue_config()),
            TimeRangeExtractor::new(cfg.range_validation),
            backend,
        )
        .with_release_after(cfg.delete_after_analysis);
        Ok(Self::new(Arc::new(orchestrator), cfg.enable_ping))
    }

    /// Serve until `input` reaches end of file, then finish in-flight work.
    pub async fn serve<R, W>(self, input: R, output: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let writer = tokio::spawn(async move {
            let mut output = output;
            while let Some(resp) = rx.recv().await {
                let mut payload = serde_json::to_vec(&resp)?;
                payload.push(b'\n');
                output.write_all(&payload).await?;
                output.flush().await?;
            }
            anyhow::Ok(())
        });

        let mut in_flight = JoinSet::new();
        let mut lines = BufReader::new(input).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            while in_flight.try_join_next().is_some() {}
            let req: Request = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.send(rpc_error(None, PARSE_ERROR, &format!("Parse error: {}", e), None));
                    continue;
                }
            };
            debug!("Received method={}", req.method);
            if let Some(resp) = self.dispatch(req, &tx, &mut in_flight) {
                let _ = tx.send(resp);
            }
        }

        info!("input closed; waiting for {} in-flight analysis request(s)", in_flight.len());
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                warn!("analysis task failed: {}", e);
            }
        }
        self.orchestrator
            .serializer()
            .shutdown(ShutdownMode::Drain)
            .await;
        drop(tx);
        writer.await??;
        Ok(())
    }

    // Returns the response for inline methods; `None` when a task will answer.
    fn dispatch(
        &self,
        req: Request,
        tx: &mpsc::UnboundedSender<Response>,
        in_flight: &mut JoinSet<()>,
    ) -> Option<Response> {
        let id = req.id;
        let resp = match req.method.as_str() {
            "initialize" => self.handle_initialize(id),
            "methods/list" => rpc_ok(
                id,
                serde_json::json!({ "methods": method_descriptors(self.enable_ping) }),
            ),
            "ping" if self.enable_ping => self.handle_ping(id, req.params),
            "principals/authenticate" => self.handle_authenticate(id, req.params),
            "quota/status" => self.handle_quota_status(id, req.params),
            "queue/stats" => rpc_result(id, &self.orchestrator.serializer().stats()),
            "timestamps/extract" => self.handle_extract(id, req.params),
            "video/analyze" => return self.handle_analyze(id, req.params, tx, in_flight),
            other => rpc_error(id, METHOD_NOT_FOUND, &format!("Method not found: {}", other), None),
        };
        Some(resp)
    }

    fn handle_initialize(&self, id: Option<Id>) -> Response {
        let queue = self.orchestrator.serializer().config();
        rpc_ok(
            id,
            serde_json::json!({
                "server": {
                    "name": "video-searcher",
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol": PROTOCOL_VERSION,
                },
                "limits": {
                    "max_concurrent": queue.max_concurrent,
                    "job_delay_ms": queue.job_delay.as_millis() as u64,
                }
            }),
        )
    }

    fn handle_ping(&self, id: Option<Id>, params: Value) -> Response {
        let input: PingInput =
            serde_json::from_value(params).unwrap_or(PingInput { message: None });
        let message = input.message.unwrap_or_else(|| "pong".to_string());
        rpc_result(id, &PingOutput { message })
    }

    fn handle_authenticate(&self, id: Option<Id>, params: Value) -> Response {
        let input: IdentityInput = match parse_params(&id, params) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
        let identity = match identity_param(&id, &input.identity) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
        let admission = self.orchestrator.admission();
        let principal = admission.register(&identity);
        let out = AuthenticateOutput {
            quota: admission.quota_status(&principal.id),
            principal_id: principal.id,
            identity: principal.identity,
        };
        rpc_result(id, &out)
    }

    fn handle_quota_status(&self, id: Option<Id>, params: Value) -> Response {
        let input: IdentityInput = match parse_params(&id, params) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
        let identity = match identity_param(&id, &input.identity) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
        let admission = self.orchestrator.admission();
        let found = admission
            .repository()
            .find_by_identity(&identity)
            .and_then(|p| admission.quota_status(&p.id).map(|q| (p.id, q)));
        match found {
            Some((principal_id, quota)) => rpc_result(id, &QuotaStatusOutput { principal_id, quota }),
            None => analysis_error(id, &AdmissionError::UnknownPrincipal(identity).into()),
        }
    }

    fn handle_extract(&self, id: Option<Id>, params: Value) -> Response {
        let input: ExtractInput = match parse_params(&id, params) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
        let extractor = self.orchestrator.extractor();
        let ranges = extractor
            .extract_ranges(&input.text)
            .into_iter()
            .map(|e| e.range)
            .collect();
        let out = ExtractOutput {
            timestamps: extractor.extract(&input.text),
            ranges,
        };
        rpc_result(id, &out)
    }

    fn handle_analyze(
        &self,
        id: Option<Id>,
        params: Value,
        tx: &mpsc::UnboundedSender<Response>,
        in_flight: &mut JoinSet<()>,
    ) -> Option<Response> {
        let input: AnalyzeInput = match parse_params(&id, params) {
            Ok(v) => v,
            Err(resp) => return Some(resp),
        };
        let identity = match identity_param(&id, &input.identity) {
            Ok(v) => v,
            Err(resp) => return Some(resp),
        };
        let req = match AnalyzeRequest::new(&input.gcs_uri, &input.prompt) {
            Ok(r) => r,
            Err(e) => return Some(analysis_error(id, &e)),
        };
        let Some(principal) = self
            .orchestrator
            .admission()
            .repository()
            .find_by_identity(&identity)
        else {
            return Some(analysis_error(
                id,
                &AdmissionError::UnknownPrincipal(identity).into(),
            ));
        };
        let ticket = match self.orchestrator.admit(&principal.id) {
            Ok(t) => t,
            Err(e) => return Some(analysis_error(id, &e)),
        };

        // Enqueue on the reader loop so queue order follows line order.
        let pending = self.orchestrator.submit(ticket, req);
        let orchestrator = Arc::clone(&self.orchestrator);
        let tx = tx.clone();
        in_flight.spawn(async move {
            let resp = match orchestrator.complete(pending).await {
                Ok(report) => rpc_result(id, &report),
                Err(e) => analysis_error(id, &e),
            };
            let _ = tx.send(resp);
        });
        None
    }
}

/// Serve the process's stdin/stdout with components built from `cfg`.
pub async fn run_stdio_server(cfg: &Config) -> anyhow::Result<()> {
    info!("Starting video-searcher stdio server; protocol={}", PROTOCOL_VERSION);
    let server = Server::from_config(cfg)?;
    server.serve(tokio::io::stdin(), tokio::io::stdout()).await
}
