//! Collaborators consumed by simulation hooks: a values fetcher for raw series
//! and an optional event broker. The engine never calls them itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One row returned by a fetcher.
pub type Row = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Unknown fetcher: {0}")]
    UnknownFetcher(String),

    #[error("Fetcher '{fetcher}' failed: {message}")]
    Failed { fetcher: String, message: String },
}

/// Source of raw series for build hooks. Retries, if any, belong here.
pub trait ValuesFetcher: Send + Sync + fmt::Debug {
    fn fetch(&self, fetcher: &str, params: &Value) -> Result<Vec<Row>, FetchError>;
}

/// Fetcher with nothing registered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoValues;

impl ValuesFetcher for NoValues {
    fn fetch(&self, fetcher: &str, _params: &Value) -> Result<Vec<Row>, FetchError> {
        Err(FetchError::UnknownFetcher(fetcher.to_string()))
    }
}

/// Fixed rows per fetcher name; `params` are ignored.
#[derive(Debug, Default, Clone)]
pub struct InMemoryValues {
    series: HashMap<String, Vec<Row>>,
}

impl InMemoryValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, fetcher: impl Into<String>, rows: Vec<Row>) -> Self {
        self.series.insert(fetcher.into(), rows);
        self
    }

    pub fn insert(&mut self, fetcher: impl Into<String>, rows: Vec<Row>) {
        self.series.insert(fetcher.into(), rows);
    }
}

impl ValuesFetcher for InMemoryValues {
    fn fetch(&self, fetcher: &str, _params: &Value) -> Result<Vec<Row>, FetchError> {
        self.series
            .get(fetcher)
            .cloned()
            .ok_or_else(|| FetchError::UnknownFetcher(fetcher.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    pub source: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Publish failed: {0}")]
pub struct PublishError(pub String);

pub trait EventPublisher: Send + Sync + fmt::Debug {
    fn publish(&self, event: &DomainEvent) -> Result<(), PublishError>;
}

/// External services handed to hooks.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub values: Arc<dyn ValuesFetcher>,
    pub broker: Option<Arc<dyn EventPublisher>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            values: Arc::new(NoValues),
            broker: None,
        }
    }
}

impl Collaborators {
    pub fn with_values(values: Arc<dyn ValuesFetcher>) -> Self {
        Self {
            values,
            broker: None,
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn EventPublisher>) -> Self {
        self.broker = Some(broker);
        self
    }
}
