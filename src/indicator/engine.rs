use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use crate::accessor::Window;
use crate::indicator::catalog::IndicatorDefinition;

/// Which dates of the window get a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeExtent {
    /// Only the window's last date.
    Latest,
    /// Every date of the window.
    EveryDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndicatorValue {
    Available { value: f64 },
    Unavailable { required: usize, available: usize },
}

impl IndicatorValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Available { value } => Some(*value),
            Self::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub date: NaiveDate,
    pub values: BTreeMap<IndicatorDefinition, IndicatorValue>,
}

impl IndicatorSnapshot {
    /// Values keyed by column name, `None` where unavailable.
    pub fn columns(&self) -> BTreeMap<String, Option<f64>> {
        self.values
            .iter()
            .map(|(def, v)| (def.column(), v.value()))
            .collect()
    }
}

/// Computes indicator definitions over a [`Window`].
///
/// Each series is computed once over the whole window; snapshots index into
/// it. A definition that needs more bars than a date has behind it is
/// reported `Unavailable` for that date and the rest of the batch proceeds.
#[derive(Debug, Default)]
pub struct IndicatorEngine;

impl IndicatorEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(
        &self,
        window: &Window,
        definitions: &[IndicatorDefinition],
        extent: ComputeExtent,
    ) -> Vec<IndicatorSnapshot> {
        let bars = window.bars();
        let len = bars.len();
        if len == 0 {
            return Vec::new();
        }
        let first_index = match extent {
            ComputeExtent::Latest => len - 1,
            ComputeExtent::EveryDate => 0,
        };

        let mut snapshots: Vec<IndicatorSnapshot> = bars[first_index..]
            .iter()
            .map(|bar| IndicatorSnapshot {
                date: bar.date,
                values: BTreeMap::new(),
            })
            .collect();

        for def in definitions {
            let required = def.required_bars();
            let series = if len >= required {
                match def.build().and_then(|indicator| indicator.calculate(bars)) {
                    Ok(series) => series,
                    Err(report) => {
                        warn!(symbol = window.symbol(), indicator = %def, error = ?report, "indicator computation failed");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            // series[k] belongs to bars[offset + k]
            let offset = len - series.len();

            for (i, snapshot) in (first_index..len).zip(snapshots.iter_mut()) {
                let value = match i.checked_sub(offset).and_then(|k| series.get(k)) {
                    Some(&v) if v.is_finite() => IndicatorValue::Available { value: v },
                    _ => IndicatorValue::Unavailable {
                        required,
                        available: i + 1,
                    },
                };
                snapshot.values.insert(*def, value);
            }
        }

        snapshots
    }

    /// Snapshot of the window's last date.
    pub fn latest(
        &self,
        window: &Window,
        definitions: &[IndicatorDefinition],
    ) -> Option<IndicatorSnapshot> {
        self.compute(window, definitions, ComputeExtent::Latest).pop()
    }
}
