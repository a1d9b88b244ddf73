//! Request pipeline: validate, admit, serialize the model call, extract ranges.

use crate::admission::{AdmissionController, AdmissionTicket};
use crate::error::{AnalysisError, BackendError};
use crate::extract::TimeRangeExtractor;
use crate::queue::{JobHandle, RequestSerializer};
use crate::types::QuotaStatus;
use crate::validate::AnalyzeRequest;
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TIMESTAMP_INSTRUCTION: &str = "IMPORTANT: Provide all timestamps in MM:SS or HH:MM:SS format (e.g., 01:23 or 1:23:45). List each moment on a new line with its timestamp.";

/// The scarce external call the serializer protects.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Returns the model's free-form answer for the video.
    async fn analyze(&self, gcs_uri: &str, prompt: &str) -> Result<String, BackendError>;

    /// Release the stored video once it has been analyzed.
    async fn release(&self, _gcs_uri: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Caller prompt plus the formatting instruction sent to the model.
pub fn enhance_prompt(prompt: &str) -> String {
    format!("{prompt}\n\n{TIMESTAMP_INSTRUCTION}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub message: String,
    pub gcs_uri: String,
    pub prompt: String,
    pub status: String,
    pub analysis_text: String,
    pub timestamps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaStatus>,
}

/// An admitted request holding its place in the queue.
#[must_use = "the reservation is refunded unless the analysis is completed"]
pub struct PendingAnalysis {
    ticket: AdmissionTicket,
    req: AnalyzeRequest,
    handle: JobHandle<String, AnalysisError>,
}

impl PendingAnalysis {
    pub fn request(&self) -> &AnalyzeRequest {
        &self.req
    }
}

pub struct AnalysisOrchestrator {
    admission: AdmissionController,
    serializer: RequestSerializer,
    extractor: TimeRangeExtractor,
    backend: Arc<dyn AnalysisBackend>,
    release_after: bool,
}

impl AnalysisOrchestrator {
    pub fn new(
        admission: AdmissionController,
        serializer: RequestSerializer,
        extractor: TimeRangeExtractor,
        backend: Arc<dyn AnalysisBackend>,
    ) -> Self {
        Self {
            admission,
            serializer,
            extractor,
            backend,
            release_after: true,
        }
    }

    /// Whether the video is released after a successful analysis (default true).
    pub fn with_release_after(mut self, release_after: bool) -> Self {
        self.release_after = release_after;
        self
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn serializer(&self) -> &RequestSerializer {
        &self.serializer
    }

    pub fn extractor(&self) -> &TimeRangeExtractor {
        &self.extractor
    }

    /// Reserve one unit of quota for `principal_id`.
    pub fn admit(&self, principal_id: &str) -> Result<AdmissionTicket, AnalysisError> {
        Ok(self.admission.try_admit(principal_id)?)
    }

    /// Put an admitted request in line for the model.
    ///
    /// The queue position is taken here, synchronously, so callers that
    /// submit in order are served in order.
    pub fn submit(&self, ticket: AdmissionTicket, req: AnalyzeRequest) -> PendingAnalysis {
        let backend = Arc::clone(&self.backend);
        let gcs_uri = req.gcs_uri.clone();
        let enhanced = enhance_prompt(&req.prompt);
        let handle = self.serializer.enqueue(move || async move {
            backend
                .analyze(&gcs_uri, &enhanced)
                .await
                .map_err(AnalysisError::from)
        });
        PendingAnalysis {
            ticket,
            req,
            handle,
        }
    }

    /// Wait for a submitted request and build its report.
    ///
    /// The reservation is kept only when the model call succeeds; any failure
    /// drops the ticket and refunds it.
    pub async fn complete(&self, pending: PendingAnalysis) -> Result<AnalysisReport, AnalysisError> {
        let PendingAnalysis {
            ticket,
            req,
            handle,
        } = pending;
        let analysis_text = handle.await?;

        let timestamps = self.extractor.extract(&analysis_text);
        let principal_id = ticket.principal_id().to_string();
        ticket.commit();
        info!(
            "analysis complete for {}: {} timestamp(s)",
            principal_id,
            timestamps.len()
        );

        if self.release_after {
            if let Err(e) = self.backend.release(&req.gcs_uri).await {
                warn!("failed to release {}: {}", req.gcs_uri, e);
            }
        }

        Ok(AnalysisReport {
            message: "Analysis complete".into(),
            gcs_uri: req.gcs_uri,
            prompt: req.prompt,
            status: "completed".into(),
            analysis_text,
            timestamps,
            quota: self.admission.quota_status(&principal_id),
        })
    }

    /// Run an already admitted request: [`Self::submit`] then [`Self::complete`].
    pub async fn execute(
        &self,
        ticket: AdmissionTicket,
        req: AnalyzeRequest,
    ) -> Result<AnalysisReport, AnalysisError> {
        let pending = self.submit(ticket, req);
        self.complete(pending).await
    }

    /// Validate, admit and run in one call.
    pub async fn analyze(
        &self,
        principal_id: &str,
        gcs_uri: &str,
        prompt: &str,
    ) -> Result<AnalysisReport, AnalysisError> {
        let req = AnalyzeRequest::new(gcs_uri, prompt)?;
        let ticket = self.admit(principal_id)?;
        self.execute(ticket, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::PrincipalRepository;
    use crate::clock::ManualClock;
    use crate::queue::QueueConfig;
    use chrono::{Local, TimeZone};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Scripted {
        answers: Mutex<Vec<Result<String, BackendError>>>,
        prompts: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AnalysisBackend for Scripted {
        async fn analyze(&self, _gcs_uri: &str, prompt: &str) -> Result<String, BackendError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answers.lock().unwrap().remove(0)
        }

        async fn release(&self, gcs_uri: &str) -> Result<(), BackendError> {
            self.released.lock().unwrap().push(gcs_uri.to_string());
            Err(BackendError::new("not_found", "already gone", false))
        }
    }

    fn orchestrator(
        answers: Vec<Result<String, BackendError>>,
        quota: u32,
    ) -> (AnalysisOrchestrator, Arc<Scripted>, String) {
        let clock = Arc::new(ManualClock::new(
            Local.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
        ));
        let admission =
            AdmissionController::new(Arc::new(PrincipalRepository::new()), clock, quota);
        let principal = admission.register("player@example.com").id;
        let backend = Arc::new(Scripted {
            answers: Mutex::new(answers),
            ..Default::default()
        });
        let orch = AnalysisOrchestrator::new(
            admission,
            RequestSerializer::new(QueueConfig::new(1, Duration::from_millis(1))),
            TimeRangeExtractor::default(),
            backend.clone(),
        );
        (orch, backend, principal)
    }

    #[tokio::test]
    async fn successful_analysis_reports_ranges_and_quota() {
        let (orch, backend, principal) =
            orchestrator(vec![Ok("0:05 - 0:09 first kill\n0:07 - 0:12 dup".into())], 1);
        let report = orch
            .analyze(&principal, "gs://clips/match.mp4", "Find every kill in this match")
            .await
            .unwrap();
        assert_eq!(report.status, "completed");
        assert_eq!(report.timestamps, vec!["0:05 - 0:09"]);
        let quota = report.quota.unwrap();
        assert_eq!((quota.used, quota.remaining), (1, 0));

        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[0].starts_with("Find every kill in this match\n\n"));
        assert!(prompts[0].ends_with(TIMESTAMP_INSTRUCTION));
        // release failure is swallowed
        assert_eq!(*backend.released.lock().unwrap(), vec!["gs://clips/match.mp4"]);
    }

    #[tokio::test]
    async fn backend_failure_refunds_quota() {
        let (orch, backend, principal) = orchestrator(
            vec![Err(BackendError::new("rate_limited", "busy", true))],
            1,
        );
        let err = orch
            .analyze(&principal, "gs://clips/match.mp4", "Find every kill in this match")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "rate_limited");
        assert!(err.retriable());
        assert_eq!(orch.admission().quota_status(&principal).unwrap().used, 0);
        assert!(backend.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_quota_never_reaches_backend() {
        let (orch, backend, principal) = orchestrator(vec![Ok("0:01 - 0:02".into())], 1);
        orch.analyze(&principal, "gs://clips/a.mp4", "Find every kill please")
            .await
            .unwrap();
        let err = orch
            .analyze(&principal, "gs://clips/b.mp4", "Find every kill please")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "quota_exceeded");
        assert_eq!(backend.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_admission() {
        let (orch, _backend, principal) = orchestrator(vec![], 1);
        let err = orch
            .analyze(&principal, "http://not-gcs/x", "Find every kill please")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(orch.admission().quota_status(&principal).unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn unknown_principal_is_refused() {
        let (orch, _backend, _principal) = orchestrator(vec![], 1);
        let err = orch
            .analyze("nobody", "gs://clips/a.mp4", "Find every kill please")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_principal");
    }
}
