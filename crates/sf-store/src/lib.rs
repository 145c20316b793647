//! sf-store: scenario records, run history and per-scenario artifact storage.

pub mod layout;
pub mod lifecycle;
pub mod runs;
pub mod store;
pub mod table;
pub mod types;
pub mod workspace;

pub use layout::StoreLayout;
pub use lifecycle::{CleanupReport, LifecycleManager, compute_expiry, is_expired, is_reusable};
pub use runs::{RunRecord, RunStatus, RunStore};
pub use store::ScenarioStore;
pub use table::{Column, ColumnData, Table, TableError};
pub use types::*;
pub use workspace::Workspace;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Scenario not found: {scenario_id}")]
    ScenarioNotFound { scenario_id: String },

    #[error("Scenario already exists: {scenario_id}")]
    DuplicateScenario { scenario_id: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Run already recorded: {run_id}")]
    DuplicateRun { run_id: String },

    #[error("Artifact '{name}' not found in workspace {workspace}")]
    ArtifactNotFound { workspace: String, name: String },

    #[error("Artifact '{name}' in workspace {workspace} is corrupt: {reason}")]
    ArtifactCorrupt {
        workspace: String,
        name: String,
        reason: String,
    },

    #[error("Invalid artifact name {name:?}: {reason}")]
    InvalidArtifactName { name: String, reason: &'static str },

    #[error("Workspace {workspace} is sealed")]
    WorkspaceSealed { workspace: String },

    #[error("Scenario {scenario_id} lists artifact '{name}' that does not exist")]
    ManifestMismatch { scenario_id: String, name: String },

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error(transparent)]
    Core(#[from] sf_core::CoreError),
}
