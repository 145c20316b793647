#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sf_core::ManualClock;
use sf_engine::{
    BuildContext, Collaborators, EngineConfig, HookResult, InMemoryValues, Row, RunContext,
    Simulation, SimulationCatalog, SimulationEngine,
};
use sf_store::{Column, ScenarioStore, Table};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

pub const KEY: &str = "test.counter";
pub const BARE_KEY: &str = "test.bare";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    pub entity: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default = "default_base_load")]
    pub base_load: f64,
    #[serde(default)]
    pub build_sleep_ms: u64,
}

fn default_base_load() -> f64 {
    50.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterScenario {
    pub entity: String,
    pub base_load: f64,
    pub hours: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterParameters {
    #[serde(default)]
    pub extra_load: f64,
    #[serde(default)]
    pub export: f64,
    #[serde(default)]
    pub fail: bool,
    #[serde(default)]
    pub sleep_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterOutput {
    pub energy: f64,
    pub export: f64,
    pub hours: usize,
}

/// Counts builds; fails the next `fail_builds` builds on request.
pub struct CounterSim {
    pub key: &'static str,
    pub version: &'static str,
    pub with_defaults: bool,
    pub builds: Arc<AtomicUsize>,
    pub fail_builds: Arc<AtomicUsize>,
    /// Build hooks currently inside their sleep, and the most seen at once.
    pub active_builds: Arc<AtomicUsize>,
    pub peak_builds: Arc<AtomicUsize>,
}

impl CounterSim {
    pub fn new(key: &'static str) -> Self {
        Self {
            key,
            version: "1.0.0",
            with_defaults: true,
            builds: Arc::new(AtomicUsize::new(0)),
            fail_builds: Arc::new(AtomicUsize::new(0)),
            active_builds: Arc::new(AtomicUsize::new(0)),
            peak_builds: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Simulation for CounterSim {
    type Config = CounterConfig;
    type Scenario = CounterScenario;
    type Parameters = CounterParameters;
    type Output = CounterOutput;

    fn key(&self) -> &str {
        self.key
    }

    fn version(&self) -> &str {
        self.version
    }

    fn build(&self, config: &CounterConfig, ctx: &mut BuildContext) -> HookResult<CounterScenario> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let running = self.active_builds.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_builds.fetch_max(running, Ordering::SeqCst);
        if config.build_sleep_ms > 0 {
            thread::sleep(Duration::from_millis(config.build_sleep_ms));
        }
        self.active_builds.fetch_sub(1, Ordering::SeqCst);

        ctx.workspace().write_structured("inputs.json", config)?;
        if self
            .fail_builds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("upstream data unavailable".into());
        }

        let rows = ctx.fetch("load", &json!({"entity": config.entity}))?;
        let load: Vec<f64> = rows
            .iter()
            .map(|row| row.get("kwh").and_then(Value::as_f64).unwrap_or(0.0))
            .collect();
        let table = Table::new(vec![
            Column::int("hour", (0..load.len() as i64).collect()),
            Column::float("kwh", load.clone()),
        ])?;
        ctx.workspace().write_table("series/load.table", &table)?;

        Ok(CounterScenario {
            entity: config.entity.clone(),
            base_load: config.base_load,
            hours: load.len(),
        })
    }

    fn run(
        &self,
        scenario: &CounterScenario,
        parameters: &CounterParameters,
        ctx: &RunContext,
    ) -> HookResult<CounterOutput> {
        if parameters.sleep_ms > 0 {
            thread::sleep(Duration::from_millis(parameters.sleep_ms));
        }
        if parameters.fail {
            return Err("requested failure".into());
        }
        let table = ctx.workspace().read_table("series/load.table")?;
        Ok(CounterOutput {
            energy: scenario.base_load + parameters.extra_load,
            export: parameters.export,
            hours: table.num_rows(),
        })
    }

    fn default_parameters(&self) -> Option<CounterParameters> {
        self.with_defaults.then(CounterParameters::default)
    }

    fn baseline_metrics(&self, scenario: &CounterScenario) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("energy".to_string(), scenario.base_load),
            ("export".to_string(), 0.0),
        ])
    }

    fn validate_parameters(&self, parameters: &CounterParameters) -> Result<(), String> {
        if parameters.extra_load < 0.0 {
            return Err("extra_load must be non-negative".to_string());
        }
        Ok(())
    }
}

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn load_rows(hours: usize) -> Vec<Row> {
    (0..hours)
        .map(|h| {
            let mut row = Row::new();
            row.insert("hour".into(), json!(h));
            row.insert("kwh".into(), json!(1.0 + h as f64 / 10.0));
            row
        })
        .collect()
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub engine: SimulationEngine,
    pub clock: ManualClock,
    pub builds: Arc<AtomicUsize>,
    pub fail_builds: Arc<AtomicUsize>,
    pub peak_builds: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(t0());
        let sim = CounterSim::new(KEY);
        let builds = Arc::clone(&sim.builds);
        let fail_builds = Arc::clone(&sim.fail_builds);
        let peak_builds = Arc::clone(&sim.peak_builds);
        let engine = engine_at(&dir, &clock, sim, tweak);
        Self {
            dir,
            engine,
            clock,
            builds,
            fail_builds,
            peak_builds,
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn peak_builds(&self) -> usize {
        self.peak_builds.load(Ordering::SeqCst)
    }

    /// Scenario directories currently on disk for [`KEY`].
    pub fn scenario_dirs(&self) -> usize {
        std::fs::read_dir(self.engine.store().layout().scenarios_root(KEY))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Wait until no timed-out build hook is still running.
    pub fn wait_for_drained_builds(&self) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while self.engine.draining_builds() > 0 {
            assert!(std::time::Instant::now() < deadline, "build hooks never drained");
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn config(&self) -> Value {
        json!({"entity": "x", "start": "2024-01-01", "end": "2024-01-02"})
    }
}

/// Engine over `dir` with `sim` plus a simulation without default parameters.
pub fn engine_at(
    dir: &tempfile::TempDir,
    clock: &ManualClock,
    sim: CounterSim,
    tweak: impl FnOnce(&mut EngineConfig),
) -> SimulationEngine {
    let mut config = EngineConfig::with_root(dir.path());
    config.sweep_workers = 4;
    tweak(&mut config);

    let mut bare = CounterSim::new(BARE_KEY);
    bare.with_defaults = false;
    let catalog = SimulationCatalog::new()
        .with(sim)
        .unwrap()
        .with(bare)
        .unwrap();

    let store = Arc::new(ScenarioStore::open(config.workspace_root.clone()).unwrap());
    let values = InMemoryValues::new().with_rows("load", load_rows(24));
    SimulationEngine::with_clock(
        catalog,
        store,
        config,
        Collaborators::with_values(Arc::new(values)),
        Arc::new(clock.clone()),
    )
    .unwrap()
}
