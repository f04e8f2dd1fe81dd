//! Task entity steps. Archived tasks share the schema and the steps.

use super::date_keys::normalize_day_keys;
use crate::collection::{ensure_array, ensure_object, str_field};
use crate::version::SchemaVersion;
use serde_json::{Map, Value};

/// UI state that older builds persisted with the task.
const UNUSED_FIELDS: [&str; 4] = [
    "_isAdditionalInfoOpen",
    "_showSubTasksMode",
    "_currentTab",
    "_isHideSubTasks",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStep {
    /// The generic `GIT` issue type became `GITHUB`.
    ReplaceLegacyGitType,
    /// List fields are arrays, maps are objects, numbers are numbers.
    MakeNullAndArraysConsistent,
    /// `timeSpentOnDay` is keyed with ASCII digits.
    WesternArabicDateKeys,
    DeleteUnusedFields,
    /// `timeSpent` is the sum of `timeSpentOnDay`.
    DeriveTimeSpent,
}

impl TaskStep {
    pub const ALL: [TaskStep; 5] = [
        TaskStep::ReplaceLegacyGitType,
        TaskStep::MakeNullAndArraysConsistent,
        TaskStep::WesternArabicDateKeys,
        TaskStep::DeleteUnusedFields,
        TaskStep::DeriveTimeSpent,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskStep::ReplaceLegacyGitType => "ReplaceLegacyGitType",
            TaskStep::MakeNullAndArraysConsistent => "MakeNullAndArraysConsistent",
            TaskStep::WesternArabicDateKeys => "WesternArabicDateKeys",
            TaskStep::DeleteUnusedFields => "DeleteUnusedFields",
            TaskStep::DeriveTimeSpent => "DeriveTimeSpent",
        }
    }

    pub fn since(self) -> SchemaVersion {
        SchemaVersion::new(match self {
            TaskStep::ReplaceLegacyGitType => 2.0,
            TaskStep::MakeNullAndArraysConsistent => 3.0,
            TaskStep::WesternArabicDateKeys => 3.2,
            TaskStep::DeleteUnusedFields => 3.3,
            TaskStep::DeriveTimeSpent => 3.6,
        })
    }

    pub fn apply(self, task: &mut Map<String, Value>) -> bool {
        match self {
            TaskStep::ReplaceLegacyGitType => {
                if str_field(task, "issueType") == Some("GIT") {
                    task.insert("issueType".to_string(), Value::from("GITHUB"));
                    true
                } else {
                    false
                }
            }
            TaskStep::MakeNullAndArraysConsistent => make_consistent(task),
            TaskStep::WesternArabicDateKeys => normalize_day_keys(task, "timeSpentOnDay"),
            TaskStep::DeleteUnusedFields => UNUSED_FIELDS
                .iter()
                .fold(false, |changed, f| task.remove(*f).is_some() || changed),
            TaskStep::DeriveTimeSpent => derive_time_spent(task),
        }
    }
}

fn make_consistent(task: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    for field in ["subTaskIds", "tagIds", "attachments"] {
        changed |= ensure_array(task, field);
    }
    changed |= ensure_object(task, "timeSpentOnDay");
    for field in ["timeEstimate", "timeSpent"] {
        if !task.get(field).is_some_and(Value::is_number) {
            task.insert(field.to_string(), Value::from(0));
            changed = true;
        }
    }
    if !task.get("isDone").is_some_and(Value::is_boolean) {
        task.insert("isDone".to_string(), Value::Bool(false));
        changed = true;
    }
    changed
}

fn derive_time_spent(task: &mut Map<String, Value>) -> bool {
    let Some(Value::Object(days)) = task.get("timeSpentOnDay") else {
        return false;
    };
    // Tasks from before per-day tracking only carry a total.
    if days.is_empty() {
        return false;
    }
    let sum: f64 = days.values().filter_map(Value::as_f64).sum();
    let current = task.get("timeSpent").and_then(Value::as_f64);
    if current == Some(sum) {
        return false;
    }
    let total = if sum.fract() == 0.0 && sum >= 0.0 && sum <= u64::MAX as f64 {
        Value::from(sum as u64)
    } else {
        Value::from(sum)
    };
    task.insert("timeSpent".to_string(), total);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_git_type_replaced() {
        let mut t = obj(json!({"issueType": "GIT", "issueId": "12"}));
        assert!(TaskStep::ReplaceLegacyGitType.apply(&mut t));
        assert_eq!(t["issueType"], json!("GITHUB"));
        assert!(!TaskStep::ReplaceLegacyGitType.apply(&mut t));
    }

    #[test]
    fn test_nulls_become_lists() {
        let mut t = obj(json!({"subTaskIds": null, "tagIds": ["a"], "timeSpent": "12"}));
        assert!(TaskStep::MakeNullAndArraysConsistent.apply(&mut t));
        assert_eq!(t["subTaskIds"], json!([]));
        assert_eq!(t["tagIds"], json!(["a"]));
        assert_eq!(t["timeSpent"], json!(0));
        assert_eq!(t["timeSpentOnDay"], json!({}));
        assert!(!TaskStep::MakeNullAndArraysConsistent.apply(&mut t));
    }

    #[test]
    fn test_time_spent_derived_from_days() {
        let mut t = obj(json!({
            "timeSpent": 5,
            "timeSpentOnDay": {"2020-01-05": 1000, "2020-01-06": 500}
        }));
        assert!(TaskStep::DeriveTimeSpent.apply(&mut t));
        assert_eq!(t["timeSpent"], json!(1500));
        assert!(!TaskStep::DeriveTimeSpent.apply(&mut t));
    }

    #[test]
    fn test_time_spent_kept_without_day_map() {
        let mut t = obj(json!({"timeSpent": 5, "timeSpentOnDay": {}}));
        assert!(!TaskStep::DeriveTimeSpent.apply(&mut t));
        assert_eq!(t["timeSpent"], json!(5));
    }

    #[test]
    fn test_unused_fields_removed() {
        let mut t = obj(json!({"_isAdditionalInfoOpen": true, "_currentTab": 2, "title": "x"}));
        assert!(TaskStep::DeleteUnusedFields.apply(&mut t));
        assert_eq!(Value::Object(t), json!({"title": "x"}));
    }
}
