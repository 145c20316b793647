//! On-disk layout.
//!
//! ```text
//! {root}/
//!   simulations/
//!     {simulation_key}/
//!       scenarios/
//!         {scenario_id}/
//!           _scenario.json
//!           artifacts/...
//!       runs/
//!         {run_id}/
//!           _run.json
//! ```

use std::path::{Path, PathBuf};

const SIMULATIONS_DIR: &str = "simulations";
const SCENARIOS_DIR: &str = "scenarios";
const ARTIFACTS_DIR: &str = "artifacts";
const RUNS_DIR: &str = "runs";
pub(crate) const RECORD_FILE: &str = "_scenario.json";
pub(crate) const RUN_FILE: &str = "_run.json";

#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn simulations_root(&self) -> PathBuf {
        self.root.join(SIMULATIONS_DIR)
    }

    pub fn scenarios_root(&self, simulation_key: &str) -> PathBuf {
        self.simulations_root()
            .join(simulation_key)
            .join(SCENARIOS_DIR)
    }

    pub fn scenario_dir(&self, simulation_key: &str, scenario_id: &str) -> PathBuf {
        self.scenarios_root(simulation_key).join(scenario_id)
    }

    pub fn record_path(&self, simulation_key: &str, scenario_id: &str) -> PathBuf {
        self.scenario_dir(simulation_key, scenario_id)
            .join(RECORD_FILE)
    }

    pub fn artifacts_dir(&self, simulation_key: &str, scenario_id: &str) -> PathBuf {
        self.scenario_dir(simulation_key, scenario_id)
            .join(ARTIFACTS_DIR)
    }

    pub fn runs_root(&self, simulation_key: &str) -> PathBuf {
        self.simulations_root().join(simulation_key).join(RUNS_DIR)
    }

    pub fn run_dir(&self, simulation_key: &str, run_id: &str) -> PathBuf {
        self.runs_root(simulation_key).join(run_id)
    }

    pub fn run_record_path(&self, simulation_key: &str, run_id: &str) -> PathBuf {
        self.run_dir(simulation_key, run_id).join(RUN_FILE)
    }
}
