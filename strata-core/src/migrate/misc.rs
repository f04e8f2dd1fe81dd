//! Steps of the smaller collection kinds.

use super::date_keys::normalize_day_keys;
use crate::collection::{ensure_array, ensure_default, ensure_object};
use crate::version::SchemaVersion;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRepeatCfgStep {
    EnsureTagIds,
}

impl TaskRepeatCfgStep {
    pub const ALL: [TaskRepeatCfgStep; 1] = [TaskRepeatCfgStep::EnsureTagIds];

    pub fn name(self) -> &'static str {
        "EnsureTagIds"
    }

    pub fn since(self) -> SchemaVersion {
        SchemaVersion::new(1.2)
    }

    pub fn apply(self, cfg: &mut Map<String, Value>) -> bool {
        match self {
            TaskRepeatCfgStep::EnsureTagIds => ensure_array(cfg, "tagIds"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleCounterStep {
    /// `countOnDay` keyed with ASCII digits; `isOn` defaults to off.
    NormalizeCountOnDay,
}

impl SimpleCounterStep {
    pub const ALL: [SimpleCounterStep; 1] = [SimpleCounterStep::NormalizeCountOnDay];

    pub fn name(self) -> &'static str {
        "NormalizeCountOnDay"
    }

    pub fn since(self) -> SchemaVersion {
        SchemaVersion::new(1.1)
    }

    pub fn apply(self, counter: &mut Map<String, Value>) -> bool {
        match self {
            SimpleCounterStep::NormalizeCountOnDay => {
                let mut changed = ensure_object(counter, "countOnDay");
                changed |= normalize_day_keys(counter, "countOnDay");
                changed |= ensure_default(counter, "isOn", Value::Bool(false));
                changed
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteStep {
    /// Notes carry an explicit (possibly null) `projectId`.
    EnsureProjectId,
}

impl NoteStep {
    pub const ALL: [NoteStep; 1] = [NoteStep::EnsureProjectId];

    pub fn name(self) -> &'static str {
        "EnsureProjectId"
    }

    pub fn since(self) -> SchemaVersion {
        SchemaVersion::new(1.1)
    }

    pub fn apply(self, note: &mut Map<String, Value>) -> bool {
        match self {
            NoteStep::EnsureProjectId => {
                if note.contains_key("projectId") {
                    return false;
                }
                note.insert("projectId".to_string(), Value::Null);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricStep {
    EnsureMetricLists,
}

impl MetricStep {
    pub const ALL: [MetricStep; 1] = [MetricStep::EnsureMetricLists];

    pub fn name(self) -> &'static str {
        "EnsureMetricLists"
    }

    pub fn since(self) -> SchemaVersion {
        SchemaVersion::new(1.1)
    }

    pub fn apply(self, metric: &mut Map<String, Value>) -> bool {
        match self {
            MetricStep::EnsureMetricLists => {
                let mut changed = false;
                for field in ["obstructions", "improvements", "improvementsTomorrow"] {
                    changed |= ensure_array(metric, field);
                }
                changed
            }
        }
    }
}
