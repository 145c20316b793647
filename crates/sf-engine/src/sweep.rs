//! Parameter sweeps over one stored scenario.
//!
//! Entries run on the engine's bounded rayon pool and are collected in input
//! order. A failing or hung entry becomes a failure record; only problems with
//! the scenario itself abort the sweep.
//!
//! With a per-entry limit the hook runs on the engine's timed pool. A hook that
//! never returns keeps one of its threads, so time spent queueing for a free
//! worker counts against the entry's limit. Sweep entries are not added to the
//! run history.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use sf_core::{Delta, compute_delta};
use sf_store::ScenarioRecord;

use crate::engine::{SimulationEngine, ensure_owned};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::simulation::DynSimulation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for SweepFailure {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// One parameter set of a sweep. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepEntry {
    /// Position in the submitted parameter sets.
    pub index: usize,
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SweepFailure>,
    /// Against the sweep baseline, when there is one and the entry succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
}

impl SweepEntry {
    fn new(index: usize, parameters: Value, outcome: Result<Value, SweepFailure>) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(failure) => (None, Some(failure)),
        };
        Self {
            index,
            parameters,
            result,
            error,
            delta: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scenario_id: String,
    pub simulation_key: String,
    pub baseline: Option<Value>,
    /// Why no baseline was produced although one was requested.
    pub baseline_error: Option<String>,
    pub results: Vec<SweepEntry>,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
}

impl SimulationEngine {
    /// Run every parameter set against one scenario.
    ///
    /// With `include_baseline`, the simulation's default parameters are run
    /// first and each successful entry carries a delta against that result. A
    /// baseline that cannot be produced is reported in `baseline_error` and the
    /// sweep continues without deltas.
    pub fn sweep(
        &self,
        simulation_key: &str,
        scenario_id: &str,
        parameter_sets: &[Value],
        include_baseline: bool,
    ) -> EngineResult<SweepReport> {
        let sim = self.catalog.get(simulation_key)?;
        let record = self.load_runnable(scenario_id)?;
        ensure_owned(&record, simulation_key)?;

        let started = Instant::now();
        let timeout = self.config.sweep_entry_timeout();

        let (baseline, baseline_error) = if include_baseline {
            match self.sweep_baseline(&sim, &record, timeout) {
                Ok(baseline) => (Some(baseline), None),
                Err(message) => {
                    warn!(
                        simulation = simulation_key,
                        scenario_id,
                        error = %message,
                        "sweep baseline unavailable"
                    );
                    (None, Some(message))
                }
            }
        } else {
            (None, None)
        };

        let results: Vec<SweepEntry> = self.sweep_pool.install(|| {
            parameter_sets
                .par_iter()
                .enumerate()
                .map(|(index, parameters)| {
                    let outcome = self
                        .run_entry(&sim, &record, parameters, timeout)
                        .map_err(|err| {
                            debug!(scenario_id, index, error = %err, "sweep entry failed");
                            SweepFailure::from(&err)
                        });
                    let mut entry = SweepEntry::new(index, parameters.clone(), outcome);
                    if let (Some(baseline), Some(result)) = (&baseline, &entry.result) {
                        entry.delta = Some(compute_delta(baseline, result));
                    }
                    entry
                })
                .collect()
        });

        let successful_runs = results.iter().filter(|entry| entry.is_success()).count();
        let report = SweepReport {
            scenario_id: record.scenario_id.clone(),
            simulation_key: record.simulation_key.clone(),
            baseline,
            baseline_error,
            total_runs: results.len(),
            successful_runs,
            failed_runs: results.len() - successful_runs,
            results,
        };

        info!(
            simulation = simulation_key,
            scenario_id,
            total = report.total_runs,
            failed = report.failed_runs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sweep finished"
        );
        Ok(report)
    }

    fn sweep_baseline(
        &self,
        sim: &Arc<dyn DynSimulation>,
        record: &Arc<ScenarioRecord>,
        timeout: Option<Duration>,
    ) -> Result<Value, String> {
        let defaults = sim
            .default_parameters()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("simulation '{}' has no default parameters", sim.key()))?;
        self.run_entry(sim, record, &defaults, timeout)
            .map_err(|e| e.to_string())
    }

    /// One run, bounded by `timeout` when set.
    fn run_entry(
        &self,
        sim: &Arc<dyn DynSimulation>,
        record: &Arc<ScenarioRecord>,
        parameters: &Value,
        timeout: Option<Duration>,
    ) -> EngineResult<Value> {
        let ctx = self.run_context(record);
        let Some(limit) = timeout else {
            return sim.run(&record.scenario_id, &record.scenario, parameters, &ctx);
        };

        let (tx, rx) = mpsc::channel();
        let worker_sim = Arc::clone(sim);
        let worker_record = Arc::clone(record);
        let parameters = parameters.clone();
        self.timed_pool.spawn(move || {
            let _ = tx.send(worker_sim.run(
                &worker_record.scenario_id,
                &worker_record.scenario,
                &parameters,
                &ctx,
            ));
        });

        match rx.recv_timeout(limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    scenario_id = %record.scenario_id,
                    limit_ms = limit.as_millis() as u64,
                    "sweep entry timed out"
                );
                Err(EngineError::RunTimedOut {
                    scenario_id: record.scenario_id.clone(),
                    limit_ms: limit.as_millis() as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::RunFailed {
                scenario_id: record.scenario_id.clone(),
                source: "run worker exited without a result".into(),
            }),
        }
    }
}
