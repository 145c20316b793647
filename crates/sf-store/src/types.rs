//! Scenario record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use sf_core::{ConfigHash, ScenarioId};

use crate::lifecycle;

/// Persisted form of a built scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    /// Assigned by the store when left empty.
    #[serde(default)]
    pub scenario_id: ScenarioId,
    pub simulation_key: String,
    pub simulation_version: String,
    /// Canonical config the scenario was built from.
    pub config: Value,
    pub config_hash: ConfigHash,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_hours: i64,
    /// Serialized scenario value returned by the build hook.
    pub scenario: Value,
    /// Artifact names written during the build.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub baseline_metrics: BTreeMap<String, f64>,
}

impl ScenarioRecord {
    pub fn summary(&self, now: DateTime<Utc>) -> ScenarioSummary {
        ScenarioSummary {
            scenario_id: self.scenario_id.clone(),
            simulation_key: self.simulation_key.clone(),
            simulation_version: self.simulation_version.clone(),
            config_hash: self.config_hash.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            artifact_count: self.artifacts.len(),
            expired: lifecycle::is_expired(self, now),
        }
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub scenario_id: ScenarioId,
    pub simulation_key: String,
    pub simulation_version: String,
    pub config_hash: ConfigHash,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub artifact_count: usize,
    pub expired: bool,
}

/// Full record plus its evaluated expiry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDetail {
    #[serde(flatten)]
    pub record: ScenarioRecord,
    pub expired: bool,
}
