//! Error types for the simulation engine.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use sf_store::StoreError;

use crate::simulation::HookError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Simulation not found: {key} (available: {available:?})")]
    SimulationNotFound { key: String, available: Vec<String> },

    #[error("Simulation already registered: {0}")]
    DuplicateSimulation(String),

    #[error("Scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error(
        "Scenario {scenario_id} belongs to simulation '{actual}', not '{requested}'"
    )]
    SimulationKeyMismatch {
        scenario_id: String,
        requested: String,
        actual: String,
    },

    #[error("Invalid {what}: {message}")]
    Validation { what: &'static str, message: String },

    #[error("Build failed for simulation '{simulation_key}': {source}")]
    BuildFailed {
        simulation_key: String,
        #[source]
        source: HookError,
    },

    #[error("Build for simulation '{simulation_key}' exceeded {limit_ms} ms")]
    BuildTimedOut { simulation_key: String, limit_ms: u64 },

    #[error("Run failed on scenario {scenario_id}: {source}")]
    RunFailed {
        scenario_id: String,
        #[source]
        source: HookError,
    },

    #[error("Run on scenario {scenario_id} exceeded {limit_ms} ms")]
    RunTimedOut { scenario_id: String, limit_ms: u64 },

    #[error("Artifact '{name}' not found in workspace {workspace}")]
    ArtifactNotFound { workspace: String, name: String },

    #[error("Artifact '{name}' in workspace {workspace} is corrupt: {reason}")]
    ArtifactCorrupt {
        workspace: String,
        name: String,
        reason: String,
    },

    #[error("Stored scenario {scenario_id} does not match its contract: {message}")]
    ScenarioCorrupt { scenario_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure of a single-flight build observed by a follower.
    #[error(transparent)]
    Shared(Arc<EngineError>),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Flat classification of [`EngineError`] for transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SimulationNotFound,
    DuplicateSimulation,
    ScenarioNotFound,
    RunNotFound,
    SimulationKeyMismatch,
    Validation,
    BuildFailed,
    Timeout,
    RunFailed,
    ArtifactNotFound,
    ArtifactCorrupt,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SimulationNotFound => "simulation_not_found",
            ErrorKind::DuplicateSimulation => "duplicate_simulation",
            ErrorKind::ScenarioNotFound => "scenario_not_found",
            ErrorKind::RunNotFound => "run_not_found",
            ErrorKind::SimulationKeyMismatch => "simulation_key_mismatch",
            ErrorKind::Validation => "validation",
            ErrorKind::BuildFailed => "build_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RunFailed => "run_failed",
            ErrorKind::ArtifactNotFound => "artifact_not_found",
            ErrorKind::ArtifactCorrupt => "artifact_corrupt",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the caller caused the error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::SimulationNotFound
                | ErrorKind::ScenarioNotFound
                | ErrorKind::RunNotFound
                | ErrorKind::SimulationKeyMismatch
                | ErrorKind::Validation
        )
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::SimulationNotFound { .. } => ErrorKind::SimulationNotFound,
            EngineError::DuplicateSimulation(_) => ErrorKind::DuplicateSimulation,
            EngineError::ScenarioNotFound(_) => ErrorKind::ScenarioNotFound,
            EngineError::RunNotFound(_) => ErrorKind::RunNotFound,
            EngineError::SimulationKeyMismatch { .. } => ErrorKind::SimulationKeyMismatch,
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::BuildFailed { .. } => ErrorKind::BuildFailed,
            EngineError::BuildTimedOut { .. } | EngineError::RunTimedOut { .. } => {
                ErrorKind::Timeout
            }
            EngineError::RunFailed { .. } => ErrorKind::RunFailed,
            EngineError::ArtifactNotFound { .. } => ErrorKind::ArtifactNotFound,
            EngineError::ArtifactCorrupt { .. } => ErrorKind::ArtifactCorrupt,
            EngineError::ScenarioCorrupt { .. }
            | EngineError::Config(_)
            | EngineError::Store(_)
            | EngineError::Io(_) => ErrorKind::Internal,
            EngineError::Shared(inner) => inner.kind(),
        }
    }

    pub(crate) fn validation(what: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            what,
            message: message.into(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ScenarioNotFound { scenario_id } => {
                EngineError::ScenarioNotFound(scenario_id)
            }
            StoreError::RunNotFound { run_id } => EngineError::RunNotFound(run_id),
            StoreError::ArtifactNotFound { workspace, name } => {
                EngineError::ArtifactNotFound { workspace, name }
            }
            StoreError::ArtifactCorrupt {
                workspace,
                name,
                reason,
            } => EngineError::ArtifactCorrupt {
                workspace,
                name,
                reason,
            },
            StoreError::Core(sf_core::CoreError::InvalidSegment { what, value, reason }) => {
                EngineError::Validation {
                    what,
                    message: format!("{value:?} {reason}"),
                }
            }
            other => EngineError::Store(other),
        }
    }
}

impl From<sf_core::CoreError> for EngineError {
    fn from(err: sf_core::CoreError) -> Self {
        EngineError::from(StoreError::from(err))
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_error_keeps_kind() {
        let inner = EngineError::ScenarioNotFound("abc".into());
        let shared = EngineError::Shared(Arc::new(inner));
        assert_eq!(shared.kind(), ErrorKind::ScenarioNotFound);
        assert!(shared.kind().is_client_error());
        assert_eq!(shared.to_string(), "Scenario not found: abc");
    }

    #[test]
    fn store_errors_map_to_engine_taxonomy() {
        let err: EngineError = StoreError::ArtifactNotFound {
            workspace: "w".into(),
            name: "a.json".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ArtifactNotFound);

        let err: EngineError = StoreError::RunNotFound { run_id: "r".into() }.into();
        assert_eq!(err.kind(), ErrorKind::RunNotFound);
        assert!(err.kind().is_client_error());

        let err: EngineError = StoreError::WorkspaceSealed {
            workspace: "w".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
