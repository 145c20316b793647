//! sf-core: stable foundation for scenflow.
//!
//! Contains:
//! - hash (canonical config hashing)
//! - delta (field-wise comparison against a baseline)
//! - clock (wall clock + manual clock for deterministic expiry)
//! - ids (scenario and run identifiers)
//! - numeric (float helpers)
//! - error (shared error types)

pub mod clock;
pub mod delta;
pub mod error;
pub mod hash;
pub mod ids;
pub mod numeric;

// Re-exports: nice ergonomics for downstream crates
pub use clock::{Clock, ManualClock, SystemClock};
pub use delta::{Delta, FieldDelta, compute_delta, delta_from_metrics};
pub use error::{CoreError, CoreResult};
pub use hash::{ConfigHash, canonical_json, canonicalize, config_hash, hash_serializable};
pub use ids::{RunId, ScenarioId, new_run_id, new_scenario_id, validate_segment};
pub use numeric::*;
