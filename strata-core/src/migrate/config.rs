//! Global configuration defaults and the singleton steps.

use crate::version::SchemaVersion;
use serde_json::{Map, Value, json};

/// Well-known id of the default project.
pub const DEFAULT_PROJECT_ID: &str = "INBOX";

/// Defaults every section of the global configuration is filled from.
pub fn default_global_config() -> Value {
    json!({
        "misc": {
            "defaultProjectId": DEFAULT_PROJECT_ID,
            "isConfirmBeforeExit": false,
            "isDarkMode": false,
            "isAutMarkParentAsDone": false,
            "isTurnOffMarkdown": false,
        },
        "idle": {
            "isEnableIdleTimeTracking": true,
            "minIdleTime": 300000,
            "isOnlyOpenIdleWhenCurrentTask": false,
        },
        "takeABreak": {
            "isTakeABreakEnabled": false,
            "takeABreakMinWorkingTime": 3600000,
        },
        "sync": {
            "isEnabled": false,
            "syncProvider": null,
            "syncInterval": 300000,
            "isCompressionEnabled": true,
        },
        "keyboard": {},
        "localBackup": {
            "isEnabled": true,
        },
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalConfigStep {
    /// Missing sections and keys are filled from [`default_global_config`].
    ExtendConfigDefaults,
}

impl GlobalConfigStep {
    pub const ALL: [GlobalConfigStep; 1] = [GlobalConfigStep::ExtendConfigDefaults];

    pub fn name(self) -> &'static str {
        match self {
            GlobalConfigStep::ExtendConfigDefaults => "ExtendConfigDefaults",
        }
    }

    pub fn since(self) -> SchemaVersion {
        match self {
            GlobalConfigStep::ExtendConfigDefaults => SchemaVersion::new(3.4),
        }
    }

    pub fn apply(self, config: &mut Value) -> bool {
        match self {
            GlobalConfigStep::ExtendConfigDefaults => {
                if !config.is_object() {
                    *config = default_global_config();
                    return true;
                }
                fill_missing(config, &default_global_config())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemindersStep {
    /// Anything but an array becomes `[]`.
    EnsureList,
}

impl RemindersStep {
    pub const ALL: [RemindersStep; 1] = [RemindersStep::EnsureList];

    pub fn name(self) -> &'static str {
        match self {
            RemindersStep::EnsureList => "EnsureList",
        }
    }

    pub fn since(self) -> SchemaVersion {
        match self {
            RemindersStep::EnsureList => SchemaVersion::new(1.0),
        }
    }

    pub fn apply(self, reminders: &mut Value) -> bool {
        match self {
            RemindersStep::EnsureList => {
                if reminders.is_array() {
                    false
                } else {
                    *reminders = Value::Array(Vec::new());
                    true
                }
            }
        }
    }
}

/// Recursively copies keys of `defaults` that are missing (or null) in
/// `target`. Existing values are never overwritten.
pub(crate) fn fill_missing(target: &mut Value, defaults: &Value) -> bool {
    let (Value::Object(target), Value::Object(defaults)) = (target, defaults) else {
        return false;
    };
    fill_missing_map(target, defaults)
}

fn fill_missing_map(target: &mut Map<String, Value>, defaults: &Map<String, Value>) -> bool {
    let mut changed = false;
    for (key, default) in defaults {
        match target.get_mut(key) {
            Some(Value::Object(existing)) => {
                if let Value::Object(default) = default {
                    changed |= fill_missing_map(existing, default);
                }
                continue;
            }
            Some(Value::Null) if !default.is_null() => {}
            Some(_) => continue,
            None => {}
        }
        target.insert(key.clone(), default.clone());
        changed = true;
    }
    changed
}
