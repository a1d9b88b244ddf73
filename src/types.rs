use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

// Shared result shapes used by the library API and the stdio server.

/// Outcome of a quota check.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Local>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct QuotaStatus {
    pub used: u32,
    pub total: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Local>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_size: usize,
    pub active_count: usize,
    pub max_concurrent: usize,
    pub total_pending: usize,
}

/// Wire shape for any error that leaves the process.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}
