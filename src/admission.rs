//! Per-principal daily quota gate.
//!
//! Quota windows roll over lazily: any read of a principal whose `reset_at`
//! has passed zeroes its counter and moves `reset_at` to the next local
//! midnight. There is no background timer.
//!
//! Two admission styles are offered:
//! - [`AdmissionController::try_admit`] checks and reserves one unit under a
//!   single lock scope. Concurrent callers can never overshoot the quota.
//! - [`AdmissionController::check_quota`] followed later by
//!   [`AdmissionController::record_usage`]. Two callers racing between those
//!   calls can both be told `allowed = true`, so the quota can be exceeded by
//!   the number of requests in flight inside one window. Prefer `try_admit`.

use crate::clock::{next_local_midnight, Clock};
use crate::error::AdmissionError;
use crate::types::{QuotaDecision, QuotaStatus};
use chrono::{DateTime, Local};
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

pub const DEFAULT_DAILY_QUOTA: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: String,
    /// Verified identity handed over by the authentication layer (e.g. e-mail).
    pub identity: String,
    pub created_at: DateTime<Local>,
    pub request_count: u32,
    pub last_request_at: DateTime<Local>,
    pub daily_quota: u32,
    pub reset_at: DateTime<Local>,
}

impl Principal {
    fn new(identity: &str, daily_quota: u32, now: DateTime<Local>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            created_at: now,
            request_count: 0,
            last_request_at: now,
            daily_quota,
            reset_at: next_local_midnight(now),
        }
    }

    // Returns true when the window rolled over.
    fn roll_window(&mut self, now: DateTime<Local>) -> bool {
        if now < self.reset_at {
            return false;
        }
        self.request_count = 0;
        self.reset_at = next_local_midnight(now);
        true
    }

    fn remaining(&self) -> u32 {
        self.daily_quota.saturating_sub(self.request_count)
    }
}

#[derive(Debug, Default)]
struct Tables {
    by_id: HashMap<String, Principal>,
    by_identity: HashMap<String, String>,
}

/// In-memory principal table. Constructed by the application and shared with
/// the [`AdmissionController`]; its contents live as long as the process.
#[derive(Debug, Default)]
pub struct PrincipalRepository {
    tables: Mutex<Tables>,
}

impl PrincipalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the principal for `identity`, creating it with `make` if absent.
    pub fn get_or_insert_with(
        &self,
        identity: &str,
        make: impl FnOnce() -> Principal,
    ) -> Principal {
        let mut tables = self.lock();
        if let Some(p) = tables
            .by_identity
            .get(identity)
            .and_then(|id| tables.by_id.get(id))
        {
            return p.clone();
        }
        let principal = make();
        tables
            .by_identity
            .insert(identity.to_string(), principal.id.clone());
        tables.by_id.insert(principal.id.clone(), principal.clone());
        principal
    }

    /// Run `f` with exclusive access to one principal. `None` if it is unknown.
    pub fn with_principal_mut<R>(&self, id: &str, f: impl FnOnce(&mut Principal) -> R) -> Option<R> {
        self.lock().by_id.get_mut(id).map(f)
    }

    pub fn get(&self, id: &str) -> Option<Principal> {
        self.lock().by_id.get(id).cloned()
    }

    pub fn find_by_identity(&self, identity: &str) -> Option<Principal> {
        let tables = self.lock();
        tables
            .by_identity
            .get(identity)
            .and_then(|id| tables.by_id.get(id))
            .cloned()
    }

    pub fn all(&self) -> Vec<Principal> {
        self.lock().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_id.is_empty()
    }
}

/// Decides whether a principal may issue another analysis and meters usage.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    repo: Arc<PrincipalRepository>,
    clock: Arc<dyn Clock>,
    daily_quota: u32,
}

impl AdmissionController {
    /// `daily_quota` applies to principals created through this controller.
    pub fn new(repo: Arc<PrincipalRepository>, clock: Arc<dyn Clock>, daily_quota: u32) -> Self {
        Self {
            repo,
            clock,
            daily_quota,
        }
    }

    pub fn repository(&self) -> &Arc<PrincipalRepository> {
        &self.repo
    }

    /// Get or create the principal for a verified identity.
    pub fn register(&self, identity: &str) -> Principal {
        let now = self.clock.now();
        self.repo
            .get_or_insert_with(identity, || Principal::new(identity, self.daily_quota, now))
    }

    pub fn check_quota(&self, principal_id: &str) -> QuotaDecision {
        let now = self.clock.now();
        self.repo
            .with_principal_mut(principal_id, |p| {
                p.roll_window(now);
                let remaining = p.remaining();
                QuotaDecision {
                    allowed: remaining > 0,
                    remaining,
                    reset_at: p.reset_at,
                }
            })
            .unwrap_or(QuotaDecision {
                allowed: false,
                remaining: 0,
                reset_at: now,
            })
    }

    /// Count one request against the principal. Unknown principals are ignored.
    pub fn record_usage(&self, principal_id: &str) {
        let now = self.clock.now();
        let recorded = self.repo.with_principal_mut(principal_id, |p| {
            p.request_count = p.request_count.saturating_add(1);
            p.last_request_at = now;
        });
        if recorded.is_none() {
            debug!("record_usage for unknown principal {}", principal_id);
        }
    }

    pub fn quota_status(&self, principal_id: &str) -> Option<QuotaStatus> {
        let now = self.clock.now();
        self.repo.with_principal_mut(principal_id, |p| {
            p.roll_window(now);
            QuotaStatus {
                used: p.request_count,
                total: p.daily_quota,
                remaining: p.remaining(),
                reset_at: p.reset_at,
            }
        })
    }

    /// Atomically check the quota and reserve one unit of it.
    ///
    /// The reservation is returned to the principal when the ticket is
    /// dropped without [`AdmissionTicket::commit`], unless the quota window has
    /// rolled over in the meantime.
    pub fn try_admit(&self, principal_id: &str) -> Result<AdmissionTicket, AdmissionError> {
        let now = self.clock.now();
        let window = self
            .repo
            .with_principal_mut(principal_id, |p| {
                p.roll_window(now);
                let remaining = p.remaining();
                if remaining == 0 {
                    return Err(AdmissionError::QuotaExceeded {
                        remaining,
                        reset_at: p.reset_at,
                    });
                }
                p.request_count += 1;
                p.last_request_at = now;
                Ok(p.reset_at)
            })
            .ok_or_else(|| AdmissionError::UnknownPrincipal(principal_id.to_string()))
            .and_then(|r| r)
            .inspect_err(|e| info!("admission denied for {}: {}", principal_id, e))?;

        Ok(AdmissionTicket {
            repo: Arc::clone(&self.repo),
            principal_id: principal_id.to_string(),
            window,
            committed: false,
        })
    }

    /// Override one principal's daily ceiling. Returns false for unknown ids.
    pub fn set_daily_quota(&self, principal_id: &str, daily_quota: u32) -> bool {
        self.repo
            .with_principal_mut(principal_id, |p| p.daily_quota = daily_quota)
            .is_some()
    }
}

/// One reserved unit of a principal's daily quota.
#[derive(Debug)]
#[must_use = "dropping the ticket without commit() refunds the reservation"]
pub struct AdmissionTicket {
    repo: Arc<PrincipalRepository>,
    principal_id: String,
    window: DateTime<Local>,
    committed: bool,
}

impl AdmissionTicket {
    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    /// Keep the reservation: the request counts against the quota.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let window = self.window;
        self.repo.with_principal_mut(&self.principal_id, |p| {
            if p.reset_at == window {
                p.request_count = p.request_count.saturating_sub(1);
            }
        });
        debug!("refunded quota reservation for {}", self.principal_id);
    }
}
