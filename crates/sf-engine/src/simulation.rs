//! Simulation contract and its type-erased adapter.
//!
//! A [`Simulation`] declares four typed shapes (config, scenario, parameters,
//! output) and two hooks. The engine only sees `serde_json::Value`, so every
//! crossing into a hook deserializes into the declared type first; a hook
//! never receives an untyped scenario.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use sf_core::ScenarioId;
use sf_store::{StoreError, Workspace};

use crate::catalog::SimulationDescriptor;
use crate::error::{EngineError, EngineResult};
use crate::external::{DomainEvent, EventPublisher, FetchError, PublishError, Row, ValuesFetcher};

/// Error raised by a hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;
pub type HookResult<T> = Result<T, HookError>;

pub trait Simulation: Send + Sync + 'static {
    type Config: Serialize + DeserializeOwned + Send;
    type Scenario: Serialize + DeserializeOwned + Send;
    type Parameters: Serialize + DeserializeOwned + Send;
    type Output: Serialize;

    fn key(&self) -> &str;

    /// Scenarios built by another version are never reused.
    fn version(&self) -> &str;

    /// Expensive step: fetch data, write artifacts, produce the scenario.
    fn build(&self, config: &Self::Config, ctx: &mut BuildContext) -> HookResult<Self::Scenario>;

    /// Cheap step: evaluate one parameter set. Must not fetch new data.
    fn run(
        &self,
        scenario: &Self::Scenario,
        parameters: &Self::Parameters,
        ctx: &RunContext,
    ) -> HookResult<Self::Output>;

    /// Parameters used for the baseline of a sweep.
    fn default_parameters(&self) -> Option<Self::Parameters> {
        None
    }

    /// Numeric summary of a scenario, stored with it and used for run deltas.
    fn baseline_metrics(&self, _scenario: &Self::Scenario) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    fn validate_config(&self, _config: &Self::Config) -> Result<(), String> {
        Ok(())
    }

    fn validate_parameters(&self, _parameters: &Self::Parameters) -> Result<(), String> {
        Ok(())
    }
}

/// Handed to the build hook.
#[derive(Debug)]
pub struct BuildContext {
    simulation_key: String,
    scenario_id: ScenarioId,
    workspace: Workspace,
    values: Arc<dyn ValuesFetcher>,
    broker: Option<Arc<dyn EventPublisher>>,
    metrics: BTreeMap<String, f64>,
}

impl BuildContext {
    pub(crate) fn new(
        simulation_key: &str,
        scenario_id: &str,
        workspace: Workspace,
        values: Arc<dyn ValuesFetcher>,
        broker: Option<Arc<dyn EventPublisher>>,
    ) -> Self {
        Self {
            simulation_key: simulation_key.to_string(),
            scenario_id: scenario_id.to_string(),
            workspace,
            values,
            broker,
            metrics: BTreeMap::new(),
        }
    }

    pub fn simulation_key(&self) -> &str {
        &self.simulation_key
    }

    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn fetch(&self, fetcher: &str, params: &Value) -> Result<Vec<Row>, FetchError> {
        self.values.fetch(fetcher, params)
    }

    /// No-op without a broker.
    pub fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        publish(self.broker.as_deref(), event)
    }

    /// Record a baseline metric alongside those from
    /// [`Simulation::baseline_metrics`]; the latter win on conflict.
    pub fn record_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }
}

/// Handed to the run hook. The workspace is sealed and there is no fetcher.
#[derive(Debug, Clone)]
pub struct RunContext {
    simulation_key: String,
    scenario_id: ScenarioId,
    workspace: Workspace,
    broker: Option<Arc<dyn EventPublisher>>,
}

impl RunContext {
    pub(crate) fn new(
        simulation_key: &str,
        scenario_id: &str,
        workspace: Workspace,
        broker: Option<Arc<dyn EventPublisher>>,
    ) -> Self {
        Self {
            simulation_key: simulation_key.to_string(),
            scenario_id: scenario_id.to_string(),
            workspace,
            broker,
        }
    }

    pub fn simulation_key(&self) -> &str {
        &self.simulation_key
    }

    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        publish(self.broker.as_deref(), event)
    }
}

fn publish(broker: Option<&dyn EventPublisher>, event: &DomainEvent) -> Result<(), PublishError> {
    match broker {
        Some(broker) => broker.publish(event),
        None => Ok(()),
    }
}

/// Scenario value plus the metrics captured while building it.
#[derive(Debug, Clone)]
pub(crate) struct BuiltScenario {
    pub scenario: Value,
    pub baseline_metrics: BTreeMap<String, f64>,
}

/// [`Simulation`] over JSON values.
pub(crate) trait DynSimulation: Send + Sync {
    fn key(&self) -> &str;
    fn version(&self) -> &str;
    fn descriptor(&self) -> SimulationDescriptor;

    /// Parse into the typed config, validate, and serialize back.
    fn canonical_config(&self, config: &Value) -> EngineResult<Value>;

    fn build(&self, config: &Value, ctx: &mut BuildContext) -> EngineResult<BuiltScenario>;

    fn check_parameters(&self, parameters: &Value) -> EngineResult<()>;

    fn run(
        &self,
        scenario_id: &str,
        scenario: &Value,
        parameters: &Value,
        ctx: &RunContext,
    ) -> EngineResult<Value>;

    fn default_parameters(&self) -> EngineResult<Option<Value>>;
}

pub(crate) struct Erased<S>(pub S);

impl<S: Simulation> Erased<S> {
    fn parse_config(&self, config: &Value) -> EngineResult<S::Config> {
        let config: S::Config = serde_json::from_value(config.clone())
            .map_err(|e| EngineError::validation("config", e.to_string()))?;
        self.0
            .validate_config(&config)
            .map_err(|message| EngineError::validation("config", message))?;
        Ok(config)
    }

    fn parse_parameters(&self, parameters: &Value) -> EngineResult<S::Parameters> {
        let parameters: S::Parameters = serde_json::from_value(parameters.clone())
            .map_err(|e| EngineError::validation("parameters", e.to_string()))?;
        self.0
            .validate_parameters(&parameters)
            .map_err(|message| EngineError::validation("parameters", message))?;
        Ok(parameters)
    }
}

impl<S: Simulation> DynSimulation for Erased<S> {
    fn key(&self) -> &str {
        self.0.key()
    }

    fn version(&self) -> &str {
        self.0.version()
    }

    fn descriptor(&self) -> SimulationDescriptor {
        SimulationDescriptor {
            key: self.0.key().to_string(),
            version: self.0.version().to_string(),
            config_type: type_name::<S::Config>().to_string(),
            scenario_type: type_name::<S::Scenario>().to_string(),
            parameters_type: type_name::<S::Parameters>().to_string(),
            output_type: type_name::<S::Output>().to_string(),
            has_default_parameters: self.0.default_parameters().is_some(),
        }
    }

    fn canonical_config(&self, config: &Value) -> EngineResult<Value> {
        let config = self.parse_config(config)?;
        serde_json::to_value(&config).map_err(|e| EngineError::validation("config", e.to_string()))
    }

    fn build(&self, config: &Value, ctx: &mut BuildContext) -> EngineResult<BuiltScenario> {
        let config = self.parse_config(config)?;
        let build_failed = |source: HookError| EngineError::BuildFailed {
            simulation_key: self.0.key().to_string(),
            source,
        };

        let scenario = catch_unwind(AssertUnwindSafe(|| self.0.build(&config, ctx)))
            .map_err(|payload| HookError::from(panic_message(payload)))
            .and_then(|built| built)
            .map_err(build_failed)?;

        let mut baseline_metrics = std::mem::take(&mut ctx.metrics);
        baseline_metrics.extend(self.0.baseline_metrics(&scenario));
        baseline_metrics.retain(|_, v| v.is_finite());

        let scenario = serde_json::to_value(&scenario).map_err(|e| build_failed(Box::new(e)))?;
        Ok(BuiltScenario {
            scenario,
            baseline_metrics,
        })
    }

    fn check_parameters(&self, parameters: &Value) -> EngineResult<()> {
        self.parse_parameters(parameters).map(|_| ())
    }

    fn run(
        &self,
        scenario_id: &str,
        scenario: &Value,
        parameters: &Value,
        ctx: &RunContext,
    ) -> EngineResult<Value> {
        let parameters = self.parse_parameters(parameters)?;
        let scenario: S::Scenario =
            serde_json::from_value(scenario.clone()).map_err(|e| EngineError::ScenarioCorrupt {
                scenario_id: scenario_id.to_string(),
                message: e.to_string(),
            })?;

        let run_failed = |source: HookError| run_error(scenario_id, source);
        let output = catch_unwind(AssertUnwindSafe(|| self.0.run(&scenario, &parameters, ctx)))
            .map_err(|payload| HookError::from(panic_message(payload)))
            .and_then(|output| output)
            .map_err(run_failed)?;

        serde_json::to_value(&output).map_err(|e| run_failed(Box::new(e)))
    }

    fn default_parameters(&self) -> EngineResult<Option<Value>> {
        self.0
            .default_parameters()
            .map(|p| serde_json::to_value(&p))
            .transpose()
            .map_err(|e| EngineError::validation("default parameters", e.to_string()))
    }
}

/// Workspace read failures keep their own kind; anything else is a run failure.
fn run_error(scenario_id: &str, source: HookError) -> EngineError {
    match source.downcast::<StoreError>() {
        Ok(store) => match *store {
            err @ (StoreError::ArtifactNotFound { .. } | StoreError::ArtifactCorrupt { .. }) => {
                EngineError::from(err)
            }
            other => EngineError::RunFailed {
                scenario_id: scenario_id.to_string(),
                source: Box::new(other),
            },
        },
        Err(source) => EngineError::RunFailed {
            scenario_id: scenario_id.to_string(),
            source,
        },
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("hook panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("hook panicked: {s}")
    } else {
        "hook panicked".to_string()
    }
}
