//! Model version registry.
//!
//! Each entity kind carries a decimal schema version: the integer part is the
//! major version (restructuring change), the fraction is the minor version
//! (additive change). Loaded stamps are compared against the versions this
//! build knows about to decide whether a kind has to be migrated, can be
//! accepted as-is, or must be refused.

use crate::kind::EntityKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Field name of the version stamp embedded in every persisted blob.
pub const VERSION_FIELD: &str = "__v";

/// Decimal schema version of one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(f64);

impl SchemaVersion {
    pub const fn new(v: f64) -> Self {
        Self(v)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Integer part; a change here is a breaking change.
    pub fn major(self) -> u32 {
        self.0.floor().max(0.0) as u32
    }

    /// Reads a stamp from a JSON value. Non-numeric and non-finite stamps are
    /// treated as absent.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        value
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(Self)
    }

    pub fn max(self, other: Self) -> Self {
        if other > self { other } else { self }
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.0.total_cmp(&other.0))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of comparing a loaded stamp with the current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// No stamp present (pre-versioning data); migrate.
    Absent,
    /// Nothing to do.
    Equal,
    /// Loaded version is older; migrate.
    Stale,
    /// Newer additive version from a newer build; accept and warn.
    NewerMinor,
    /// Newer breaking version; refuse to load.
    NewerMajor,
}

impl VersionCheck {
    pub fn needs_migration(self) -> bool {
        matches!(self, VersionCheck::Absent | VersionCheck::Stale)
    }
}

/// Current schema version of every kind known to this build.
pub fn current_version(kind: EntityKind) -> SchemaVersion {
    let v = match kind {
        EntityKind::Project => 7.1,
        EntityKind::Task => 3.6,
        EntityKind::TaskArchive => 3.6,
        EntityKind::TaskRepeatCfg => 1.2,
        EntityKind::Tag => 1.0,
        EntityKind::SimpleCounter => 1.1,
        EntityKind::Note => 1.1,
        EntityKind::Metric => 1.1,
        EntityKind::Improvement => 1.0,
        EntityKind::Obstruction => 1.0,
        EntityKind::IssueProvider => 1.0,
        EntityKind::GlobalConfig => 3.4,
        EntityKind::Reminders => 1.0,
    };
    SchemaVersion::new(v)
}

/// Compares a loaded stamp with the version this build expects.
pub fn compare(loaded: Option<SchemaVersion>, current: SchemaVersion) -> VersionCheck {
    let Some(loaded) = loaded else {
        return VersionCheck::Absent;
    };
    match loaded.value().total_cmp(&current.value()) {
        Ordering::Equal => VersionCheck::Equal,
        Ordering::Less => VersionCheck::Stale,
        Ordering::Greater if loaded.major() > current.major() => VersionCheck::NewerMajor,
        Ordering::Greater => VersionCheck::NewerMinor,
    }
}

/// Compares the stamp of `kind` against the registry.
pub fn check(kind: EntityKind, loaded: Option<SchemaVersion>) -> VersionCheck {
    compare(loaded, current_version(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f64) -> SchemaVersion {
        SchemaVersion::new(x)
    }

    #[test]
    fn test_compare_all_outcomes() {
        assert_eq!(compare(None, v(3.0)), VersionCheck::Absent);
        assert_eq!(compare(Some(v(3.0)), v(3.0)), VersionCheck::Equal);
        assert_eq!(compare(Some(v(2.9)), v(3.0)), VersionCheck::Stale);
        assert_eq!(compare(Some(v(3.4)), v(3.1)), VersionCheck::NewerMinor);
        assert_eq!(compare(Some(v(4.0)), v(3.9)), VersionCheck::NewerMajor);
    }

    #[test]
    fn test_major_is_floor() {
        assert_eq!(v(7.1).major(), 7);
        assert_eq!(v(7.0).major(), 7);
        assert_eq!(v(0.5).major(), 0);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert_eq!(SchemaVersion::from_json(&serde_json::json!(2.5)), Some(v(2.5)));
        assert_eq!(SchemaVersion::from_json(&serde_json::json!(4)), Some(v(4.0)));
        assert_eq!(SchemaVersion::from_json(&serde_json::json!("4")), None);
        assert_eq!(SchemaVersion::from_json(&serde_json::json!(-1)), None);
        assert_eq!(SchemaVersion::from_json(&serde_json::Value::Null), None);
    }

    #[test]
    fn test_only_absent_and_stale_migrate() {
        assert!(VersionCheck::Absent.needs_migration());
        assert!(VersionCheck::Stale.needs_migration());
        assert!(!VersionCheck::Equal.needs_migration());
        assert!(!VersionCheck::NewerMinor.needs_migration());
        assert!(!VersionCheck::NewerMajor.needs_migration());
    }

    #[test]
    fn test_every_kind_has_a_positive_version() {
        for kind in EntityKind::ALL {
            assert!(current_version(kind).value() >= 1.0, "{kind}");
        }
    }
}
