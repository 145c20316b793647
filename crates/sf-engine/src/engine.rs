//! Build-or-reuse, run and transport-facing operations.
//!
//! Per `(simulation_key, config_hash)` a scenario goes
//! absent -> building -> ready -> expired -> deleted. Building is
//! single-flight; ready/expired is evaluated lazily against the clock.
//!
//! A build that outlives `max_build_duration_ms` fails its callers at once, but
//! its hook keeps the key busy until it returns. The next build for that key
//! waits for it (up to the same limit), and the straggler removes its own
//! scenario directory.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

use sf_core::{
    Clock, ConfigHash, Delta, SystemClock, config_hash, delta_from_metrics, new_run_id,
    new_scenario_id,
};
use sf_store::{
    CleanupReport, LifecycleManager, RunRecord, RunStatus, RunStore, ScenarioDetail,
    ScenarioRecord, ScenarioStore, ScenarioSummary, Workspace, compute_expiry,
};

use crate::catalog::{SimulationCatalog, SimulationDescriptor};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::external::Collaborators;
use crate::simulation::{BuildContext, BuiltScenario, DynSimulation, RunContext};
use crate::single_flight::{DrainSet, Role, SingleFlight};

type BuildKey = (String, ConfigHash);
type SharedBuild = Result<BuildOutcome, Arc<EngineError>>;

/// How `get_or_build_scenario` obtained its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOrigin {
    /// This call ran the build hook.
    Built,
    /// An existing non-expired scenario was returned.
    Reused,
    /// This call waited on a build started by a concurrent caller.
    Joined,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub record: Arc<ScenarioRecord>,
    pub origin: BuildOrigin,
}

impl BuildOutcome {
    pub fn reused(&self) -> bool {
        self.origin == BuildOrigin::Reused
    }

    pub fn scenario_id(&self) -> &str {
        &self.record.scenario_id
    }
}

/// Result of one run, with the baseline comparison when the scenario has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Id of the run record left in the run history.
    pub run_id: String,
    pub scenario_id: String,
    pub simulation_key: String,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
}

pub struct SimulationEngine {
    pub(crate) catalog: SimulationCatalog,
    pub(crate) store: Arc<ScenarioStore>,
    pub(crate) runs: RunStore,
    pub(crate) lifecycle: LifecycleManager,
    pub(crate) config: EngineConfig,
    pub(crate) collaborators: Collaborators,
    builds: SingleFlight<BuildKey, SharedBuild>,
    draining: Arc<DrainSet<BuildKey>>,
    pub(crate) sweep_pool: rayon::ThreadPool,
    /// Runs with a time limit execute here, so hung hooks cannot pile up
    /// threads beyond this pool's size.
    pub(crate) timed_pool: rayon::ThreadPool,
}

impl std::fmt::Debug for SimulationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationEngine")
            .field("catalog", &self.catalog)
            .field("root", &self.store.layout().root())
            .field("config", &self.config)
            .finish()
    }
}

impl SimulationEngine {
    pub fn new(
        catalog: SimulationCatalog,
        store: Arc<ScenarioStore>,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> EngineResult<Self> {
        Self::with_clock(catalog, store, config, collaborators, Arc::new(SystemClock))
    }

    pub fn with_clock(
        catalog: SimulationCatalog,
        store: Arc<ScenarioStore>,
        config: EngineConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let sweep_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.sweep_workers)
            .thread_name(|i| format!("sf-sweep-{i}"))
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let timed_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.sweep_workers * 2)
            .thread_name(|i| format!("sf-timed-{i}"))
            .panic_handler(|_| warn!("timed run worker panicked"))
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        Ok(Self {
            catalog,
            runs: RunStore::new(store.layout().clone()),
            store,
            lifecycle: LifecycleManager::new(config.default_ttl_hours, clock),
            config,
            collaborators,
            builds: SingleFlight::new(),
            draining: Arc::new(DrainSet::new()),
            sweep_pool,
            timed_pool,
        })
    }

    /// Open the store under `config.workspace_root` and build an engine on it.
    pub fn open(
        catalog: SimulationCatalog,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> EngineResult<Self> {
        config.validate()?;
        let store = ScenarioStore::open(config.workspace_root.clone())?;
        Self::new(catalog, Arc::new(store), config, collaborators)
    }

    pub fn catalog(&self) -> &SimulationCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<ScenarioStore> {
        &self.store
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    /// Number of `(simulation_key, config_hash)` pairs whose timed-out build
    /// hook is still running.
    pub fn draining_builds(&self) -> usize {
        self.draining.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Return a reusable scenario for `config`, or build one.
    ///
    /// With `reuse_existing` unset a fresh scenario is always built, although a
    /// caller arriving while an identical build is in flight shares its result.
    pub fn get_or_build_scenario(
        &self,
        simulation_key: &str,
        config: &Value,
        ttl_hours: Option<i64>,
        reuse_existing: bool,
    ) -> EngineResult<BuildOutcome> {
        let sim = self.catalog.get(simulation_key)?;
        let canonical = sim.canonical_config(config)?;
        let hash = config_hash(&canonical);

        if reuse_existing {
            if let Some(record) = self.find_reusable(sim.as_ref(), &hash) {
                info!(
                    simulation = simulation_key,
                    scenario_id = %record.scenario_id,
                    config_hash = hash.short(),
                    "reusing scenario"
                );
                return Ok(BuildOutcome {
                    record,
                    origin: BuildOrigin::Reused,
                });
            }
        }

        let build_key: BuildKey = (simulation_key.to_string(), hash.clone());
        loop {
            let (shared, role) = self
                .builds
                .run(build_key.clone(), || {
                    // A build for this hash may have finished since the fast path.
                    if reuse_existing {
                        if let Some(record) = self.find_reusable(sim.as_ref(), &hash) {
                            return Ok(BuildOutcome {
                                record,
                                origin: BuildOrigin::Reused,
                            });
                        }
                    }
                    if !self
                        .draining
                        .wait_idle(&build_key, self.config.max_build_duration())
                    {
                        warn!(
                            simulation = simulation_key,
                            config_hash = hash.short(),
                            "previous build for this config is still running"
                        );
                        return Err(Arc::new(self.build_timed_out(simulation_key)));
                    }
                    self.build_new(&sim, &canonical, &build_key, ttl_hours)
                        .map(|record| BuildOutcome {
                            record,
                            origin: BuildOrigin::Built,
                        })
                        .map_err(Arc::new)
                });

            match (role, shared) {
                (Role::Leader, Ok(outcome)) => return Ok(outcome),
                (Role::Leader, Err(err)) => {
                    return Err(Arc::try_unwrap(err).unwrap_or_else(EngineError::Shared));
                }
                // The leader reused; this caller asked for a fresh build.
                (Role::Follower, Ok(outcome)) if outcome.reused() && !reuse_existing => {
                    continue;
                }
                (Role::Follower, Ok(outcome)) => {
                    let origin = if outcome.reused() {
                        BuildOrigin::Reused
                    } else {
                        BuildOrigin::Joined
                    };
                    return Ok(BuildOutcome {
                        record: outcome.record,
                        origin,
                    });
                }
                (Role::Follower, Err(err)) => return Err(EngineError::Shared(err)),
            }
        }
    }

    /// Run one parameter set against a stored scenario.
    pub fn run_simulation(
        &self,
        simulation_key: &str,
        scenario_id: &str,
        parameters: &Value,
    ) -> EngineResult<RunOutcome> {
        let sim = self.catalog.get(simulation_key)?;
        let record = self.load_runnable(scenario_id)?;
        ensure_owned(&record, simulation_key)?;
        self.execute_run(sim.as_ref(), &record, parameters)
    }

    /// Build-or-reuse followed by a run on the resulting record.
    ///
    /// The run uses the record just obtained, so it executes even when the
    /// requested TTL makes the scenario expire immediately.
    pub fn run_inline(
        &self,
        simulation_key: &str,
        config: &Value,
        parameters: &Value,
        ttl_hours: Option<i64>,
    ) -> EngineResult<RunOutcome> {
        let sim = self.catalog.get(simulation_key)?;
        sim.check_parameters(parameters)?;
        let outcome = self.get_or_build_scenario(simulation_key, config, ttl_hours, true)?;
        self.execute_run(sim.as_ref(), &outcome.record, parameters)
    }

    pub fn list_scenarios(
        &self,
        simulation_key: &str,
        include_expired: bool,
    ) -> EngineResult<Vec<ScenarioSummary>> {
        self.catalog.get(simulation_key)?;
        let now = self.lifecycle.now();
        Ok(self
            .store
            .list(simulation_key, include_expired, now)
            .iter()
            .map(|record| record.summary(now))
            .collect())
    }

    /// Scenarios of another simulation are reported as not found.
    pub fn get_scenario(
        &self,
        simulation_key: &str,
        scenario_id: &str,
    ) -> EngineResult<ScenarioDetail> {
        let record = self.load_runnable(scenario_id)?;
        if record.simulation_key != simulation_key {
            return Err(EngineError::ScenarioNotFound(scenario_id.to_string()));
        }
        Ok(ScenarioDetail {
            expired: self.lifecycle.is_expired(&record),
            record: ScenarioRecord::clone(&record),
        })
    }

    pub fn build_scenario(
        &self,
        simulation_key: &str,
        config: &Value,
        ttl_hours: Option<i64>,
        reuse_existing: bool,
    ) -> EngineResult<ScenarioSummary> {
        let outcome = self.get_or_build_scenario(simulation_key, config, ttl_hours, reuse_existing)?;
        Ok(outcome.record.summary(self.lifecycle.now()))
    }

    /// Remove a scenario and its artifacts.
    pub fn delete_scenario(&self, simulation_key: &str, scenario_id: &str) -> EngineResult<()> {
        let record = self.store.get(scenario_id)?;
        if record.simulation_key != simulation_key {
            return Err(EngineError::ScenarioNotFound(scenario_id.to_string()));
        }
        self.store.delete(scenario_id)?;
        Ok(())
    }

    pub fn list_simulations(&self) -> Vec<SimulationDescriptor> {
        self.catalog.describe()
    }

    /// Reclaim expired scenarios of one simulation, or of all of them.
    pub fn cleanup_expired(&self, simulation_key: Option<&str>) -> CleanupReport {
        match simulation_key {
            Some(key) => self.lifecycle.cleanup_expired(&self.store, key),
            None => self.lifecycle.cleanup_all(&self.store),
        }
    }

    /// Recorded runs of one simulation, newest first.
    pub fn list_runs(
        &self,
        simulation_key: &str,
        limit: Option<usize>,
    ) -> EngineResult<Vec<RunRecord>> {
        self.catalog.get(simulation_key)?;
        Ok(self.runs.list(simulation_key, limit)?)
    }

    pub fn get_run(&self, simulation_key: &str, run_id: &str) -> EngineResult<RunRecord> {
        self.catalog.get(simulation_key)?;
        Ok(self.runs.get(simulation_key, run_id)?)
    }

    /// Newest live record built by the registered version of `sim`.
    fn find_reusable(
        &self,
        sim: &dyn DynSimulation,
        hash: &ConfigHash,
    ) -> Option<Arc<ScenarioRecord>> {
        self.store
            .records_by_hash(sim.key(), hash)
            .into_iter()
            .find(|record| {
                record.simulation_version == sim.version()
                    && self.lifecycle.is_reusable(record, sim.key())
            })
    }

    fn build_timed_out(&self, simulation_key: &str) -> EngineError {
        EngineError::BuildTimedOut {
            simulation_key: simulation_key.to_string(),
            limit_ms: self.config.max_build_duration_ms.unwrap_or_default(),
        }
    }

    /// Stored record that may be run: present, and live unless expired runs
    /// are allowed.
    pub(crate) fn load_runnable(&self, scenario_id: &str) -> EngineResult<Arc<ScenarioRecord>> {
        let record = self.store.get(scenario_id)?;
        if !self.config.allow_expired_runs && self.lifecycle.is_expired(&record) {
            debug!(scenario_id, "scenario expired");
            return Err(EngineError::ScenarioNotFound(scenario_id.to_string()));
        }
        Ok(record)
    }

    fn build_new(
        &self,
        sim: &Arc<dyn DynSimulation>,
        canonical: &Value,
        build_key: &BuildKey,
        ttl_hours: Option<i64>,
    ) -> EngineResult<Arc<ScenarioRecord>> {
        let simulation_key = sim.key();
        let hash = &build_key.1;
        let scenario_id = new_scenario_id();
        let workspace = self.store.new_workspace(simulation_key, &scenario_id)?;
        let started = Instant::now();
        info!(
            simulation = simulation_key,
            scenario_id = %scenario_id,
            config_hash = hash.short(),
            "building scenario"
        );

        let ctx = BuildContext::new(
            simulation_key,
            &scenario_id,
            workspace.clone(),
            Arc::clone(&self.collaborators.values),
            self.collaborators.broker.clone(),
        );
        let persisted = self.invoke_build(sim, canonical, build_key, ctx).and_then(|built| {
            self.persist(sim.as_ref(), canonical, hash, ttl_hours, &scenario_id, &workspace, built)
        });

        match persisted {
            Ok(record) => {
                info!(
                    simulation = simulation_key,
                    scenario_id = %record.scenario_id,
                    artifacts = record.artifacts.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "scenario ready"
                );
                Ok(record)
            }
            Err(err) => {
                warn!(
                    simulation = simulation_key,
                    scenario_id = %scenario_id,
                    error = %err,
                    "scenario build failed"
                );
                if matches!(err, EngineError::BuildTimedOut { .. }) {
                    // The hook is still running; its worker discards the scenario.
                    workspace.seal();
                } else {
                    self.discard(simulation_key, &scenario_id, &workspace);
                }
                Err(err)
            }
        }
    }

    /// Run the build hook, on a watched worker thread when builds are limited.
    ///
    /// On timeout the worker is marked abandoned and keeps `build_key` busy in
    /// the drain set until the hook returns; it then removes the scenario
    /// directory itself.
    fn invoke_build(
        &self,
        sim: &Arc<dyn DynSimulation>,
        canonical: &Value,
        build_key: &BuildKey,
        mut ctx: BuildContext,
    ) -> EngineResult<BuiltScenario> {
        let Some(limit) = self.config.max_build_duration() else {
            return sim.build(canonical, &mut ctx);
        };

        let (tx, rx) = mpsc::channel();
        let abandoned = Arc::new(Mutex::new(false));
        let worker_abandoned = Arc::clone(&abandoned);
        let worker_sim = Arc::clone(sim);
        let config = canonical.clone();
        let scenario_dir = self
            .store
            .layout()
            .scenario_dir(sim.key(), ctx.scenario_id());
        let hold = self.draining.hold(build_key.clone());
        thread::Builder::new()
            .name(format!("sf-build-{}", ctx.scenario_id()))
            .spawn(move || {
                let _hold = hold;
                let built = worker_sim.build(&config, &mut ctx);
                let abandoned = worker_abandoned.lock().unwrap_or_else(|p| p.into_inner());
                if *abandoned {
                    debug!(scenario_id = ctx.scenario_id(), "timed-out build hook returned");
                    discard_scenario(ctx.workspace(), &scenario_dir);
                } else {
                    let _ = tx.send(built);
                }
            })?;

        match rx.recv_timeout(limit) {
            Ok(built) => built,
            Err(RecvTimeoutError::Timeout) => {
                let mut abandoned = abandoned.lock().unwrap_or_else(|p| p.into_inner());
                // The worker sends under this lock, so a result that raced the
                // deadline is already in the channel.
                if let Ok(built) = rx.try_recv() {
                    return built;
                }
                *abandoned = true;
                Err(self.build_timed_out(sim.key()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::BuildFailed {
                simulation_key: sim.key().to_string(),
                source: "build worker exited without a result".into(),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn persist(
        &self,
        sim: &dyn DynSimulation,
        canonical: &Value,
        hash: &ConfigHash,
        ttl_hours: Option<i64>,
        scenario_id: &str,
        workspace: &Workspace,
        built: BuiltScenario,
    ) -> EngineResult<Arc<ScenarioRecord>> {
        workspace.seal();
        let artifacts = workspace.list_names()?;
        let ttl_hours = self.lifecycle.resolve_ttl(ttl_hours);
        let created_at = self.lifecycle.now();

        let record = ScenarioRecord {
            scenario_id: scenario_id.to_string(),
            simulation_key: sim.key().to_string(),
            simulation_version: sim.version().to_string(),
            config: canonical.clone(),
            config_hash: hash.clone(),
            created_at,
            expires_at: compute_expiry(created_at, ttl_hours),
            ttl_hours,
            scenario: built.scenario,
            artifacts,
            baseline_metrics: built.baseline_metrics,
        };
        Ok(self.store.create(record)?)
    }

    /// Drop everything a failed build left on disk.
    fn discard(&self, simulation_key: &str, scenario_id: &str, workspace: &Workspace) {
        let dir: PathBuf = self.store.layout().scenario_dir(simulation_key, scenario_id);
        discard_scenario(workspace, &dir);
    }

    pub(crate) fn run_context(&self, record: &ScenarioRecord) -> RunContext {
        let workspace = Workspace::open_sealed(
            record.scenario_id.clone(),
            self.store
                .layout()
                .artifacts_dir(&record.simulation_key, &record.scenario_id),
        );
        RunContext::new(
            &record.simulation_key,
            &record.scenario_id,
            workspace,
            self.collaborators.broker.clone(),
        )
    }

    fn execute_run(
        &self,
        sim: &dyn DynSimulation,
        record: &ScenarioRecord,
        parameters: &Value,
    ) -> EngineResult<RunOutcome> {
        let run_id = new_run_id();
        let started_at = self.lifecycle.now();
        let ctx = self.run_context(record);
        let outcome = sim.run(&record.scenario_id, &record.scenario, parameters, &ctx);
        self.record_run(&run_id, record, parameters, started_at, &outcome);
        let result = outcome?;
        debug!(
            simulation = %record.simulation_key,
            scenario_id = %record.scenario_id,
            run_id = %run_id,
            "run finished"
        );

        let (baseline, delta) = if record.baseline_metrics.is_empty() {
            (None, None)
        } else {
            (
                serde_json::to_value(&record.baseline_metrics).ok(),
                Some(delta_from_metrics(&record.baseline_metrics, &result)),
            )
        };

        Ok(RunOutcome {
            run_id,
            scenario_id: record.scenario_id.clone(),
            simulation_key: record.simulation_key.clone(),
            result,
            baseline,
            delta,
        })
    }

    /// Append the run to the history. A failed write is logged, not returned:
    /// the run itself already happened.
    fn record_run(
        &self,
        run_id: &str,
        record: &ScenarioRecord,
        parameters: &Value,
        started_at: chrono::DateTime<chrono::Utc>,
        outcome: &EngineResult<Value>,
    ) {
        let (status, result, error) = match outcome {
            Ok(result) => (RunStatus::Completed, Some(result.clone()), None),
            Err(err) => (RunStatus::Failed, None, Some(err.to_string())),
        };
        let run = RunRecord {
            run_id: run_id.to_string(),
            simulation_key: record.simulation_key.clone(),
            scenario_id: record.scenario_id.clone(),
            parameters: parameters.clone(),
            parameters_hash: config_hash(parameters),
            status,
            started_at,
            finished_at: self.lifecycle.now(),
            result,
            error,
        };
        if let Err(e) = self.runs.put(&run) {
            warn!(run_id, scenario_id = %record.scenario_id, error = %e, "failed to record run");
        }
    }
}

/// Seal and remove a scenario's workspace and directory.
fn discard_scenario(workspace: &Workspace, scenario_dir: &Path) {
    if let Err(e) = workspace.delete() {
        warn!(workspace = workspace.id(), error = %e, "failed to discard build artifacts");
    }
    match fs::remove_dir_all(scenario_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %scenario_dir.display(), error = %e, "failed to remove scenario dir"),
    }
}

pub(crate) fn ensure_owned(record: &ScenarioRecord, simulation_key: &str) -> EngineResult<()> {
    if record.simulation_key != simulation_key {
        return Err(EngineError::SimulationKeyMismatch {
            scenario_id: record.scenario_id.clone(),
            requested: simulation_key.to_string(),
            actual: record.simulation_key.clone(),
        });
    }
    Ok(())
}
