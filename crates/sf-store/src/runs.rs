//! Run history.
//!
//! Each `run_simulation`/`run_inline` call leaves one [`RunRecord`] under
//! `{root}/simulations/{key}/runs/{run_id}/_run.json`. Records are written once
//! through a temp file and a rename; listing scans the simulation's run
//! directory, so there is no index to keep in sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

use sf_core::{ConfigHash, RunId, ScenarioId, validate_segment};

use crate::layout::{RUN_FILE, StoreLayout};
use crate::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Persisted outcome of one run against a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub simulation_key: String,
    pub scenario_id: ScenarioId,
    pub parameters: Value,
    /// Hash of the canonical parameters, comparable across runs.
    pub parameters_hash: ConfigHash,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[derive(Debug, Clone)]
pub struct RunStore {
    layout: StoreLayout,
}

impl RunStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Write `record`. Run ids are never reused, so an existing id is an error.
    pub fn put(&self, record: &RunRecord) -> StoreResult<()> {
        validate_segment("simulation key", &record.simulation_key)?;
        validate_segment("run id", &record.run_id)?;

        let dir = self.layout.run_dir(&record.simulation_key, &record.run_id);
        if dir.join(RUN_FILE).exists() {
            return Err(StoreError::DuplicateRun {
                run_id: record.run_id.clone(),
            });
        }
        fs::create_dir_all(&dir)?;
        let tmp_path = dir.join(format!(".{RUN_FILE}.tmp"));
        fs::write(&tmp_path, serde_json::to_string_pretty(record)?)?;
        fs::rename(&tmp_path, dir.join(RUN_FILE))?;

        debug!(
            run_id = %record.run_id,
            simulation = %record.simulation_key,
            scenario_id = %record.scenario_id,
            status = ?record.status,
            "recorded run"
        );
        Ok(())
    }

    pub fn get(&self, simulation_key: &str, run_id: &str) -> StoreResult<RunRecord> {
        let not_found = || StoreError::RunNotFound {
            run_id: run_id.to_string(),
        };
        if validate_segment("simulation key", simulation_key).is_err()
            || validate_segment("run id", run_id).is_err()
        {
            return Err(not_found());
        }

        let path = self.layout.run_record_path(simulation_key, run_id);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs of one simulation, newest first, at most `limit` of them.
    ///
    /// Unreadable records are skipped with a warning.
    pub fn list(&self, simulation_key: &str, limit: Option<usize>) -> StoreResult<Vec<RunRecord>> {
        validate_segment("simulation key", simulation_key)?;
        let root = self.layout.runs_root(simulation_key);
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path().join(RUN_FILE);
            if !path.is_file() {
                continue;
            }
            match read_run(&path) {
                Ok(record) if record.simulation_key == simulation_key => records.push(record),
                Ok(_) => warn!(
                    path = %path.display(),
                    "run record does not match its location, skipping"
                ),
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable run record, skipping"),
            }
        }

        records.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

fn read_run(path: &Path) -> StoreResult<RunRecord> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
