//! Registry of simulations, built once at startup and handed to the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use sf_core::validate_segment;

use crate::error::{EngineError, EngineResult};
use crate::simulation::{DynSimulation, Erased, Simulation};

/// Registration summary of one simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationDescriptor {
    pub key: String,
    pub version: String,
    pub config_type: String,
    pub scenario_type: String,
    pub parameters_type: String,
    pub output_type: String,
    pub has_default_parameters: bool,
}

#[derive(Default)]
pub struct SimulationCatalog {
    simulations: BTreeMap<String, Arc<dyn DynSimulation>>,
}

impl std::fmt::Debug for SimulationCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationCatalog")
            .field("keys", &self.keys())
            .finish()
    }
}

impl SimulationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a simulation. A key may only be registered once.
    pub fn register<S: Simulation>(&mut self, simulation: S) -> EngineResult<()> {
        let key = simulation.key().to_string();
        validate_segment("simulation key", &key)?;
        if self.simulations.contains_key(&key) {
            return Err(EngineError::DuplicateSimulation(key));
        }
        debug!(simulation = %key, version = simulation.version(), "registered simulation");
        self.simulations.insert(key, Arc::new(Erased(simulation)));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<S: Simulation>(mut self, simulation: S) -> EngineResult<Self> {
        self.register(simulation)?;
        Ok(self)
    }

    pub(crate) fn get(&self, key: &str) -> EngineResult<Arc<dyn DynSimulation>> {
        self.simulations
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::SimulationNotFound {
                key: key.to_string(),
                available: self.keys(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.simulations.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.simulations.keys().cloned().collect()
    }

    pub fn descriptor(&self, key: &str) -> EngineResult<SimulationDescriptor> {
        Ok(self.get(key)?.descriptor())
    }

    /// Descriptors of all registered simulations, sorted by key.
    pub fn describe(&self) -> Vec<SimulationDescriptor> {
        self.simulations.values().map(|s| s.descriptor()).collect()
    }

    pub fn len(&self) -> usize {
        self.simulations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.simulations.is_empty()
    }
}
