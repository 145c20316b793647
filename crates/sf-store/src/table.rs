//! Columnar tables stored as workspace artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("Column '{name}' has {found} rows, expected {expected}")]
    RaggedColumn {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Column '{name}' is not of type {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Text(Vec<String>),
    Bool(Vec<bool>),
    Timestamp(Vec<DateTime<Utc>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Text(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Timestamp(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Float(_) => "float",
            Self::Int(_) => "int",
            Self::Text(_) => "text",
            Self::Bool(_) => "bool",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn float(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self::new(name, ColumnData::Float(values))
    }

    pub fn int(name: impl Into<String>, values: Vec<i64>) -> Self {
        Self::new(name, ColumnData::Int(values))
    }

    pub fn text(name: impl Into<String>, values: Vec<String>) -> Self {
        Self::new(name, ColumnData::Text(values))
    }

    pub fn timestamp(name: impl Into<String>, values: Vec<DateTime<Utc>>) -> Self {
        Self::new(name, ColumnData::Timestamp(values))
    }
}

/// Named columns of equal length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTable")]
pub struct Table {
    columns: Vec<Column>,
}

#[derive(Deserialize)]
struct RawTable {
    columns: Vec<Column>,
}

impl TryFrom<RawTable> for Table {
    type Error = TableError;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        Table::new(raw.columns)
    }
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self, TableError> {
        let mut seen = HashSet::new();
        let expected = columns.first().map(|c| c.data.len()).unwrap_or(0);
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(TableError::DuplicateColumn(column.name.clone()));
            }
            if column.data.len() != expected {
                return Err(TableError::RaggedColumn {
                    name: column.name.clone(),
                    expected,
                    found: column.data.len(),
                });
            }
        }
        Ok(Self { columns })
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Result<&Column, TableError> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| TableError::ColumnNotFound(name.to_string()))
    }

    pub fn floats(&self, name: &str) -> Result<&[f64], TableError> {
        match &self.column(name)?.data {
            ColumnData::Float(v) => Ok(v),
            _ => Err(TableError::TypeMismatch {
                name: name.to_string(),
                expected: "float",
            }),
        }
    }

    pub fn ints(&self, name: &str) -> Result<&[i64], TableError> {
        match &self.column(name)?.data {
            ColumnData::Int(v) => Ok(v),
            _ => Err(TableError::TypeMismatch {
                name: name.to_string(),
                expected: "int",
            }),
        }
    }

    pub fn texts(&self, name: &str) -> Result<&[String], TableError> {
        match &self.column(name)?.data {
            ColumnData::Text(v) => Ok(v),
            _ => Err(TableError::TypeMismatch {
                name: name.to_string(),
                expected: "text",
            }),
        }
    }

    pub fn timestamps(&self, name: &str) -> Result<&[DateTime<Utc>], TableError> {
        match &self.column(name)?.data {
            ColumnData::Timestamp(v) => Ok(v),
            _ => Err(TableError::TypeMismatch {
                name: name.to_string(),
                expected: "timestamp",
            }),
        }
    }
}
