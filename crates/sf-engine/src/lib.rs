//! Scenario-based simulation engine.
//!
//! A simulation is registered once in a [`SimulationCatalog`] with two hooks:
//! an expensive `build` that turns a config into a cached scenario, and a cheap
//! `run` that evaluates parameters against it. [`SimulationEngine`] handles
//! reuse by config hash, single-flight builds, expiry, run history and
//! parameter sweeps.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod external;
pub mod simulation;
pub mod single_flight;
pub mod sweep;

pub use catalog::{SimulationCatalog, SimulationDescriptor};
pub use config::{DEFAULT_SWEEP_ENTRY_TIMEOUT_MS, EngineConfig};
pub use engine::{BuildOrigin, BuildOutcome, RunOutcome, SimulationEngine};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use external::{
    Collaborators, DomainEvent, EventPublisher, FetchError, InMemoryValues, NoValues,
    PublishError, Row, ValuesFetcher,
};
pub use simulation::{BuildContext, HookError, HookResult, RunContext, Simulation};
pub use single_flight::{DrainHold, DrainSet, Role, SingleFlight};
pub use sweep::{SweepEntry, SweepFailure, SweepReport};

pub use sf_store::{
    CleanupReport, RunRecord, RunStatus, ScenarioDetail, ScenarioRecord, ScenarioSummary, Table,
    Workspace,
};
