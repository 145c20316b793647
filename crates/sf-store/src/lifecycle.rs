//! TTL computation, expiry evaluation and cleanup.
//!
//! TTL policy: `ttl_hours <= 0` means the scenario is expired from the moment
//! it is created. It is persisted (so an inline run can use it) but is never
//! picked for reuse and is reclaimed by the next cleanup.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use sf_core::{Clock, ScenarioId, SystemClock};

use crate::store::ScenarioStore;
use crate::types::ScenarioRecord;
use crate::StoreError;

pub const DEFAULT_TTL_HOURS: i64 = 24;

pub fn compute_expiry(created_at: DateTime<Utc>, ttl_hours: i64) -> DateTime<Utc> {
    if ttl_hours <= 0 {
        return created_at;
    }
    TimeDelta::try_hours(ttl_hours)
        .and_then(|ttl| created_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn is_expired(record: &ScenarioRecord, now: DateTime<Utc>) -> bool {
    now >= record.expires_at
}

/// Non-expired and owned by `simulation_key`.
pub fn is_reusable(record: &ScenarioRecord, simulation_key: &str, now: DateTime<Utc>) -> bool {
    record.simulation_key == simulation_key && !is_expired(record, now)
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub removed: Vec<ScenarioId>,
    pub failed: Vec<(ScenarioId, String)>,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleManager {
    default_ttl_hours: i64,
    clock: Arc<dyn Clock>,
}

impl LifecycleManager {
    pub fn new(default_ttl_hours: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_ttl_hours,
            clock,
        }
    }

    pub fn with_system_clock(default_ttl_hours: i64) -> Self {
        Self::new(default_ttl_hours, Arc::new(SystemClock))
    }

    pub fn default_ttl_hours(&self) -> i64 {
        self.default_ttl_hours
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn resolve_ttl(&self, ttl_hours: Option<i64>) -> i64 {
        ttl_hours.unwrap_or(self.default_ttl_hours)
    }

    pub fn is_expired(&self, record: &ScenarioRecord) -> bool {
        is_expired(record, self.now())
    }

    pub fn is_reusable(&self, record: &ScenarioRecord, simulation_key: &str) -> bool {
        is_reusable(record, simulation_key, self.now())
    }

    /// Delete expired scenarios of one simulation together with their artifacts.
    ///
    /// Scenarios that vanish concurrently are skipped; running it twice is a no-op.
    pub fn cleanup_expired(&self, store: &ScenarioStore, simulation_key: &str) -> CleanupReport {
        let now = self.now();
        let mut report = CleanupReport::default();

        for record in store.list(simulation_key, true, now) {
            if !is_expired(&record, now) {
                continue;
            }
            match store.delete(&record.scenario_id) {
                Ok(_) => report.removed.push(record.scenario_id.clone()),
                Err(StoreError::ScenarioNotFound { .. }) => {}
                Err(e) => {
                    warn!(
                        scenario_id = %record.scenario_id,
                        error = %e,
                        "failed to delete expired scenario"
                    );
                    report.failed.push((record.scenario_id.clone(), e.to_string()));
                }
            }
        }

        if !report.removed.is_empty() {
            info!(
                simulation = simulation_key,
                removed = report.removed.len(),
                "cleaned up expired scenarios"
            );
        }
        report
    }

    pub fn cleanup_all(&self, store: &ScenarioStore) -> CleanupReport {
        let mut report = CleanupReport::default();
        for key in store.simulation_keys() {
            report.merge(self.cleanup_expired(store, &key));
        }
        report
    }
}
