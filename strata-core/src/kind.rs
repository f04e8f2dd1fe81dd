//! Entity kinds persisted by the application.
//!
//! Every kind maps to exactly one blob key in the local store. Collection
//! kinds hold an `{ids, entities}` state, singleton kinds hold a bare value.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One named category of persisted data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Project,
    Task,
    TaskArchive,
    TaskRepeatCfg,
    Tag,
    SimpleCounter,
    Note,
    Metric,
    Improvement,
    Obstruction,
    IssueProvider,
    GlobalConfig,
    Reminders,
}

impl EntityKind {
    /// All kinds in load order. Projects come first because the legacy shard
    /// lookup needs the project ids.
    pub const ALL: [EntityKind; 13] = [
        EntityKind::Project,
        EntityKind::Task,
        EntityKind::TaskArchive,
        EntityKind::TaskRepeatCfg,
        EntityKind::Tag,
        EntityKind::SimpleCounter,
        EntityKind::Note,
        EntityKind::Metric,
        EntityKind::Improvement,
        EntityKind::Obstruction,
        EntityKind::IssueProvider,
        EntityKind::GlobalConfig,
        EntityKind::Reminders,
    ];

    /// Kinds that were stored per project before they became global collections.
    pub const SHARDED_LEGACY: [EntityKind; 4] = [
        EntityKind::Note,
        EntityKind::Metric,
        EntityKind::Improvement,
        EntityKind::Obstruction,
    ];

    /// Stable storage key of the blob holding this kind.
    pub fn key(self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Task => "task",
            EntityKind::TaskArchive => "taskArchive",
            EntityKind::TaskRepeatCfg => "taskRepeatCfg",
            EntityKind::Tag => "tag",
            EntityKind::SimpleCounter => "simpleCounter",
            EntityKind::Note => "note",
            EntityKind::Metric => "metric",
            EntityKind::Improvement => "improvement",
            EntityKind::Obstruction => "obstruction",
            EntityKind::IssueProvider => "issueProvider",
            EntityKind::GlobalConfig => "globalConfig",
            EntityKind::Reminders => "reminders",
        }
    }

    /// Reverse of [`EntityKind::key`].
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.key() == key)
    }

    /// Whether the kind is stored as a bare value instead of an entity collection.
    pub fn is_singleton(self) -> bool {
        matches!(self, EntityKind::GlobalConfig | EntityKind::Reminders)
    }

    pub fn is_sharded_legacy(self) -> bool {
        Self::SHARDED_LEGACY.contains(&self)
    }

    /// Blob key of the legacy per-project shard of this kind.
    pub fn legacy_shard_key(self, project_id: &str) -> String {
        format!("p__{}__{}", project_id, self.key())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip_for_every_kind() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_key(kind.key()), Some(kind));
        }
        assert_eq!(EntityKind::from_key("bookmark"), None);
    }

    #[test]
    fn test_serde_name_matches_storage_key() {
        for kind in EntityKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.key()));
        }
    }

    #[test]
    fn test_legacy_shard_key() {
        assert_eq!(EntityKind::Note.legacy_shard_key("P1"), "p__P1__note");
        assert!(EntityKind::Metric.is_sharded_legacy());
        assert!(!EntityKind::Task.is_sharded_legacy());
    }
}
