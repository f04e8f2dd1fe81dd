//! Issue provider kinds and their default configurations.

use serde_json::{Map, Value, json};
use std::fmt;

/// Backends whose per-project inline configuration predates the standalone
/// issue provider entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IssueProviderKind {
    Jira,
    Github,
    Gitlab,
    Caldav,
    OpenProject,
}

impl IssueProviderKind {
    pub const ALL: [IssueProviderKind; 5] = [
        IssueProviderKind::Jira,
        IssueProviderKind::Github,
        IssueProviderKind::Gitlab,
        IssueProviderKind::Caldav,
        IssueProviderKind::OpenProject,
    ];

    /// Key used both in `issueIntegrationCfgs` and as a task's `issueType`.
    pub fn key(self) -> &'static str {
        match self {
            IssueProviderKind::Jira => "JIRA",
            IssueProviderKind::Github => "GITHUB",
            IssueProviderKind::Gitlab => "GITLAB",
            IssueProviderKind::Caldav => "CALDAV",
            IssueProviderKind::OpenProject => "OPEN_PROJECT",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.key() == key)
    }

    /// Field without which a config cannot point anywhere.
    pub fn required_field(self) -> &'static str {
        match self {
            IssueProviderKind::Jira => "host",
            IssueProviderKind::Github => "repo",
            IssueProviderKind::Gitlab => "project",
            IssueProviderKind::Caldav => "caldavUrl",
            IssueProviderKind::OpenProject => "host",
        }
    }

    pub fn default_config(self) -> Map<String, Value> {
        let cfg = match self {
            IssueProviderKind::Jira => json!({
                "isEnabled": false,
                "host": null,
                "userName": null,
                "password": null,
                "isAutoPollTickets": true,
                "searchJqlQuery": "",
                "isAutoAddToBacklog": false,
                "autoAddBacklogJqlQuery":
                    "assignee = currentUser() AND sprint in openSprints() AND resolution = Unresolved",
                "isWorklogEnabled": true,
                "isAddWorklogOnSubTaskDone": true,
            }),
            IssueProviderKind::Github => json!({
                "isEnabled": false,
                "repo": null,
                "token": null,
                "filterUsernameForIssueUpdates": null,
                "backlogQuery": "sort:updated state:open assignee:@me",
            }),
            IssueProviderKind::Gitlab => json!({
                "isEnabled": false,
                "project": null,
                "gitlabBaseUrl": null,
                "token": null,
                "scope": "created-by-me",
                "filterIssues": null,
            }),
            IssueProviderKind::Caldav => json!({
                "isEnabled": false,
                "caldavUrl": null,
                "resourceName": null,
                "username": null,
                "password": null,
                "categoryFilter": null,
            }),
            IssueProviderKind::OpenProject => json!({
                "isEnabled": false,
                "host": null,
                "token": null,
                "projectId": null,
                "scope": "created-by-me",
            }),
        };
        match cfg {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Whether the required field of `cfg` holds a non-empty value.
    pub fn has_required_field(self, cfg: &Map<String, Value>) -> bool {
        match cfg.get(self.required_field()) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }
}

impl fmt::Display for IssueProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Names of the fields whose value in `cfg` differs from `defaults`, in
/// `cfg` order. Keys absent from `cfg` take the default and never differ;
/// keys unknown to `defaults` differ unless null.
pub fn differing_fields(cfg: &Map<String, Value>, defaults: &Map<String, Value>) -> Vec<String> {
    cfg.iter()
        .filter(|(k, v)| *v != defaults.get(k.as_str()).unwrap_or(&Value::Null))
        .map(|(k, _)| k.clone())
        .collect()
}
