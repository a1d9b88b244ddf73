//! Relay between clients and a video-understanding model: per-principal
//! daily quotas, a bounded FIFO queue in front of the model, and time range
//! extraction from the model's answer.

pub mod admission;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod extract;
pub mod http;
pub mod methods;
pub mod orchestrator;
pub mod queue;
pub mod server;
pub mod types;
pub mod validate;

pub use admission::{AdmissionController, AdmissionTicket, Principal, PrincipalRepository};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AdmissionError, AnalysisError, BackendError, ConfigError, QueueError};
pub use extract::{RangeValidation, TimeRange, TimeRangeExtractor};
pub use orchestrator::{AnalysisBackend, AnalysisOrchestrator, AnalysisReport};
pub use queue::{JobHandle, QueueConfig, RequestSerializer, ShutdownMode};
pub use types::{QueueStats, QuotaDecision, QuotaStatus};
