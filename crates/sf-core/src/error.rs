use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid {what}: {value:?} ({reason})")]
    InvalidSegment {
        what: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
