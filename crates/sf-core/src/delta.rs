//! Field-wise comparison of a run result against a baseline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::numeric::{Real, finite_or_none};

/// Difference of one numeric field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub baseline: Real,
    pub value: Real,
    /// `value - baseline`
    pub delta: Real,
    /// Percentage change; `None` when the baseline is zero.
    pub percent: Option<Real>,
}

impl FieldDelta {
    pub fn new(baseline: Real, value: Real) -> Self {
        let delta = value - baseline;
        let percent = if baseline == 0.0 {
            None
        } else {
            finite_or_none(delta * 100.0 / baseline)
        };
        Self {
            baseline,
            value,
            delta,
            percent,
        }
    }
}

/// Per-field deltas keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta {
    pub fields: BTreeMap<String, FieldDelta>,
}

impl Delta {
    pub fn get(&self, field: &str) -> Option<&FieldDelta> {
        self.fields.get(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Compare the top-level numeric fields shared by `baseline` and `value`.
///
/// Non-numeric fields, fields missing on either side and fields whose name
/// starts with `_` are skipped. Non-object inputs yield an empty delta.
pub fn compute_delta(baseline: &Value, value: &Value) -> Delta {
    let (Value::Object(base), Value::Object(current)) = (baseline, value) else {
        return Delta::default();
    };

    let fields = base
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .filter_map(|(name, b)| {
            let b = b.as_f64()?;
            let v = current.get(name)?.as_f64()?;
            Some((name.clone(), FieldDelta::new(b, v)))
        })
        .collect();

    Delta { fields }
}

/// Compare a result against precomputed baseline metrics.
pub fn delta_from_metrics(metrics: &BTreeMap<String, Real>, value: &Value) -> Delta {
    let Value::Object(current) = value else {
        return Delta::default();
    };

    let fields = metrics
        .iter()
        .filter_map(|(name, &b)| {
            let v = current.get(name)?.as_f64()?;
            Some((name.clone(), FieldDelta::new(b, v)))
        })
        .collect();

    Delta { fields }
}
