//! Scenario record storage API.
//!
//! Records live on disk next to their artifacts (see [`crate::layout`]); an
//! in-memory index keyed by id and by `(simulation_key, config_hash)` is
//! rebuilt from disk on open and kept in sync on create/delete.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use sf_core::{ConfigHash, ScenarioId, new_scenario_id, validate_segment};

use crate::layout::{RECORD_FILE, StoreLayout};
use crate::lifecycle::is_expired;
use crate::types::ScenarioRecord;
use crate::workspace::Workspace;
use crate::{StoreError, StoreResult};

type HashKey = (String, ConfigHash);

#[derive(Debug, Default)]
struct ScenarioIndex {
    by_id: HashMap<ScenarioId, Arc<ScenarioRecord>>,
    by_hash: HashMap<HashKey, Vec<ScenarioId>>,
}

impl ScenarioIndex {
    fn insert(&mut self, record: Arc<ScenarioRecord>) {
        let key = (record.simulation_key.clone(), record.config_hash.clone());
        self.by_hash
            .entry(key)
            .or_default()
            .push(record.scenario_id.clone());
        self.by_id.insert(record.scenario_id.clone(), record);
    }

    fn remove(&mut self, scenario_id: &str) -> Option<Arc<ScenarioRecord>> {
        let record = self.by_id.remove(scenario_id)?;
        let key = (record.simulation_key.clone(), record.config_hash.clone());
        if let Some(ids) = self.by_hash.get_mut(&key) {
            ids.retain(|id| id != scenario_id);
            if ids.is_empty() {
                self.by_hash.remove(&key);
            }
        }
        Some(record)
    }
}

#[derive(Debug)]
pub struct ScenarioStore {
    layout: StoreLayout,
    index: RwLock<ScenarioIndex>,
}

impl ScenarioStore {
    /// Open a store rooted at `root`, loading every readable record.
    pub fn open(root: PathBuf) -> StoreResult<Self> {
        let layout = StoreLayout::new(root);
        fs::create_dir_all(layout.simulations_root())?;

        let mut index = ScenarioIndex::default();
        for record in load_records(&layout)? {
            index.insert(Arc::new(record));
        }
        info!(
            root = %layout.root().display(),
            scenarios = index.by_id.len(),
            "opened scenario store"
        );

        Ok(Self {
            layout,
            index: RwLock::new(index),
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Writable workspace for a scenario that is being built.
    pub fn new_workspace(&self, simulation_key: &str, scenario_id: &str) -> StoreResult<Workspace> {
        validate_segment("simulation key", simulation_key)?;
        validate_segment("scenario id", scenario_id)?;
        Workspace::open(
            scenario_id,
            self.layout.artifacts_dir(simulation_key, scenario_id),
        )
    }

    /// Sealed workspace of a persisted scenario.
    pub fn workspace(&self, scenario_id: &str) -> StoreResult<Workspace> {
        let record = self.get(scenario_id)?;
        Ok(Workspace::open_sealed(
            scenario_id,
            self.layout
                .artifacts_dir(&record.simulation_key, &record.scenario_id),
        ))
    }

    /// Persist a record and publish it to the index.
    ///
    /// Assigns a fresh id when `scenario_id` is empty. Every artifact named in
    /// the manifest must already exist in the scenario's workspace.
    pub fn create(&self, mut record: ScenarioRecord) -> StoreResult<Arc<ScenarioRecord>> {
        if record.scenario_id.is_empty() {
            record.scenario_id = new_scenario_id();
        }
        validate_segment("simulation key", &record.simulation_key)?;
        validate_segment("scenario id", &record.scenario_id)?;

        if self.read_index().by_id.contains_key(&record.scenario_id) {
            return Err(StoreError::DuplicateScenario {
                scenario_id: record.scenario_id,
            });
        }

        let artifacts = Workspace::open_sealed(
            record.scenario_id.clone(),
            self.layout
                .artifacts_dir(&record.simulation_key, &record.scenario_id),
        );
        if let Some(missing) = record.artifacts.iter().find(|name| !artifacts.exists(name)) {
            return Err(StoreError::ManifestMismatch {
                scenario_id: record.scenario_id.clone(),
                name: missing.clone(),
            });
        }

        let dir = self
            .layout
            .scenario_dir(&record.simulation_key, &record.scenario_id);
        fs::create_dir_all(&dir)?;
        let tmp_path = dir.join(format!(".{RECORD_FILE}.tmp"));
        fs::write(&tmp_path, serde_json::to_string_pretty(&record)?)?;

        let mut index = self.write_index();
        if index.by_id.contains_key(&record.scenario_id) {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::DuplicateScenario {
                scenario_id: record.scenario_id,
            });
        }
        fs::rename(&tmp_path, dir.join(RECORD_FILE))?;

        let record = Arc::new(record);
        index.insert(Arc::clone(&record));
        debug!(
            scenario_id = %record.scenario_id,
            simulation = %record.simulation_key,
            "created scenario record"
        );
        Ok(record)
    }

    pub fn get(&self, scenario_id: &str) -> StoreResult<Arc<ScenarioRecord>> {
        self.read_index()
            .by_id
            .get(scenario_id)
            .cloned()
            .ok_or_else(|| StoreError::ScenarioNotFound {
                scenario_id: scenario_id.to_string(),
            })
    }

    /// Most recent record for `(simulation_key, config_hash)`.
    ///
    /// Expired records are only considered when `include_expired` is set.
    pub fn find_by_hash(
        &self,
        simulation_key: &str,
        config_hash: &ConfigHash,
        now: DateTime<Utc>,
        include_expired: bool,
    ) -> Option<Arc<ScenarioRecord>> {
        self.records_by_hash(simulation_key, config_hash)
            .into_iter()
            .find(|r| include_expired || !is_expired(r, now))
    }

    /// Every record for `(simulation_key, config_hash)`, newest first.
    pub fn records_by_hash(
        &self,
        simulation_key: &str,
        config_hash: &ConfigHash,
    ) -> Vec<Arc<ScenarioRecord>> {
        let index = self.read_index();
        let key = (simulation_key.to_string(), config_hash.clone());
        let Some(ids) = index.by_hash.get(&key) else {
            return Vec::new();
        };
        let mut records: Vec<Arc<ScenarioRecord>> = ids
            .iter()
            .filter_map(|id| index.by_id.get(id))
            .filter(|r| r.simulation_key == simulation_key && r.config_hash == *config_hash)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.scenario_id.cmp(&b.scenario_id))
        });
        records
    }

    /// Records of one simulation, newest first.
    pub fn list(
        &self,
        simulation_key: &str,
        include_expired: bool,
        now: DateTime<Utc>,
    ) -> Vec<Arc<ScenarioRecord>> {
        let mut records: Vec<Arc<ScenarioRecord>> = self
            .read_index()
            .by_id
            .values()
            .filter(|r| r.simulation_key == simulation_key)
            .filter(|r| include_expired || !is_expired(r, now))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.scenario_id.cmp(&b.scenario_id))
        });
        records
    }

    /// Remove a record and all of its artifacts.
    pub fn delete(&self, scenario_id: &str) -> StoreResult<Arc<ScenarioRecord>> {
        let mut index = self.write_index();
        let record = index
            .by_id
            .get(scenario_id)
            .cloned()
            .ok_or_else(|| StoreError::ScenarioNotFound {
                scenario_id: scenario_id.to_string(),
            })?;

        let dir = self
            .layout
            .scenario_dir(&record.simulation_key, &record.scenario_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        index.remove(scenario_id);
        info!(
            scenario_id,
            simulation = %record.simulation_key,
            "deleted scenario"
        );
        Ok(record)
    }

    /// Simulation keys that currently own at least one record.
    pub fn simulation_keys(&self) -> Vec<String> {
        let keys: BTreeSet<String> = self
            .read_index()
            .by_id
            .values()
            .map(|r| r.simulation_key.clone())
            .collect();
        keys.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.read_index().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_index(&self) -> RwLockReadGuard<'_, ScenarioIndex> {
        self.index.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, ScenarioIndex> {
        self.index.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn load_records(layout: &StoreLayout) -> StoreResult<Vec<ScenarioRecord>> {
    let mut records = Vec::new();

    for sim_entry in fs::read_dir(layout.simulations_root())? {
        let sim_entry = sim_entry?;
        if !sim_entry.file_type()?.is_dir() {
            continue;
        }
        let simulation_key = sim_entry.file_name().to_string_lossy().to_string();
        let scenarios_root = layout.scenarios_root(&simulation_key);
        if !scenarios_root.is_dir() {
            continue;
        }

        for entry in fs::read_dir(&scenarios_root)? {
            let entry = entry?;
            let scenario_id = entry.file_name().to_string_lossy().to_string();
            let record_path = layout.record_path(&simulation_key, &scenario_id);
            if !record_path.is_file() {
                continue;
            }
            match read_record(&record_path) {
                Ok(record)
                    if record.scenario_id == scenario_id
                        && record.simulation_key == simulation_key =>
                {
                    records.push(record);
                }
                Ok(_) => warn!(
                    path = %record_path.display(),
                    "scenario record does not match its location, skipping"
                ),
                Err(e) => warn!(
                    path = %record_path.display(),
                    error = %e,
                    "unreadable scenario record, skipping"
                ),
            }
        }
    }

    Ok(records)
}

fn read_record(path: &std::path::Path) -> StoreResult<ScenarioRecord> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
