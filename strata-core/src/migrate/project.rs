//! Project entity steps.

use super::date_keys::normalize_day_keys;
use crate::collection::{ensure_array, ensure_default, is_absent, str_field};
use crate::version::SchemaVersion;
use serde_json::{Map, Value, json};

/// Primary color used when a legacy theme name cannot be resolved.
const DEFAULT_PRIMARY: &str = "#29a1aa";

/// Named palette colors of the pre-5.0 theme model.
const LEGACY_THEME_COLORS: [(&str, &str); 12] = [
    ("red", "#f44336"),
    ("pink", "#e91e63"),
    ("purple", "#9c27b0"),
    ("deep-purple", "#673ab7"),
    ("indigo", "#3f51b5"),
    ("blue", "#2196f3"),
    ("light-blue", "#03a9f4"),
    ("cyan", "#00bcd4"),
    ("teal", "#009688"),
    ("green", "#4caf50"),
    ("orange", "#ff9800"),
    ("blue-grey", "#607d8b"),
];

const DAY_MAP_FIELDS: [&str; 4] = ["workStart", "workEnd", "breakNr", "breakTime"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStep {
    /// `taskIds` and `backlogTaskIds` become arrays.
    EnsureTaskLists,
    /// `themeColor`/`isDarkTheme` are replaced by a `theme` object.
    UpdateThemeModel,
    /// Day maps are keyed with ASCII digits.
    WesternArabicDateKeys,
    /// Flags and lists added after 7.0 get their defaults.
    ExtendDefaults,
}

impl ProjectStep {
    pub const ALL: [ProjectStep; 4] = [
        ProjectStep::EnsureTaskLists,
        ProjectStep::UpdateThemeModel,
        ProjectStep::WesternArabicDateKeys,
        ProjectStep::ExtendDefaults,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProjectStep::EnsureTaskLists => "EnsureTaskLists",
            ProjectStep::UpdateThemeModel => "UpdateThemeModel",
            ProjectStep::WesternArabicDateKeys => "WesternArabicDateKeys",
            ProjectStep::ExtendDefaults => "ExtendDefaults",
        }
    }

    pub fn since(self) -> SchemaVersion {
        SchemaVersion::new(match self {
            ProjectStep::EnsureTaskLists => 4.0,
            ProjectStep::UpdateThemeModel => 5.0,
            ProjectStep::WesternArabicDateKeys => 6.0,
            ProjectStep::ExtendDefaults => 7.1,
        })
    }

    pub fn apply(self, project: &mut Map<String, Value>) -> bool {
        match self {
            ProjectStep::EnsureTaskLists => {
                let a = ensure_array(project, "taskIds");
                let b = ensure_array(project, "backlogTaskIds");
                a || b
            }
            ProjectStep::UpdateThemeModel => update_theme_model(project),
            ProjectStep::WesternArabicDateKeys => DAY_MAP_FIELDS
                .iter()
                .fold(false, |changed, field| normalize_day_keys(project, field) || changed),
            ProjectStep::ExtendDefaults => extend_defaults(project),
        }
    }
}

fn update_theme_model(project: &mut Map<String, Value>) -> bool {
    if project.get("theme").is_some_and(Value::is_object) {
        return false;
    }
    let primary = match str_field(project, "themeColor") {
        Some(c) if c.starts_with('#') => c.to_string(),
        Some(name) => LEGACY_THEME_COLORS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, hex)| hex.to_string())
            .unwrap_or_else(|| DEFAULT_PRIMARY.to_string()),
        None => DEFAULT_PRIMARY.to_string(),
    };
    let is_dark = project
        .get("isDarkTheme")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    project.insert(
        "theme".to_string(),
        json!({
            "primary": primary,
            "isAutoContrast": true,
            "huePrimary": "500",
            "isReducedTheme": is_dark,
            "isDisableBackgroundGradient": false,
        }),
    );
    project.remove("themeColor");
    project.remove("isDarkTheme");
    true
}

fn extend_defaults(project: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    changed |= ensure_default(project, "isArchived", Value::Bool(false));
    changed |= ensure_default(project, "isHiddenFromMenu", Value::Bool(false));
    if is_absent(project, "isEnableBacklog") {
        let has_backlog = project
            .get("backlogTaskIds")
            .and_then(Value::as_array)
            .is_some_and(|ids| !ids.is_empty());
        project.insert("isEnableBacklog".to_string(), Value::Bool(has_backlog));
        changed = true;
    }
    changed |= ensure_array(project, "noteIds");
    changed
}
