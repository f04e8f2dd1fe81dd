//! Migration diagnostics.
//!
//! Records are informational only: they are logged and kept on the gateway
//! for inspection, never persisted as part of the snapshot.

use crate::kind::EntityKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What one migration did to one kind (or, for cross-model migrations, to
/// the snapshot as a whole).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// `None` for cross-model migrations.
    pub kind: Option<EntityKind>,
    pub name: String,
    /// `(label, count)` pairs, e.g. `("ReplaceLegacyGitType", 3)`.
    pub counts: Vec<(String, usize)>,
    /// Free-text lines, e.g. which provider was extracted from which project.
    pub details: Vec<String>,
}

impl MigrationRecord {
    pub fn new(kind: Option<EntityKind>, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            counts: Vec::new(),
            details: Vec::new(),
        }
    }

    pub fn count(&mut self, label: impl Into<String>, n: usize) {
        if n > 0 {
            self.counts.push((label.into(), n));
        }
    }

    pub fn detail(&mut self, line: impl Into<String>) {
        self.details.push(line.into());
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.details.is_empty()
    }
}

impl fmt::Display for MigrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "[{}] {}", kind, self.name)?,
            None => write!(f, "[cross-model] {}", self.name)?,
        }
        for (label, n) in &self.counts {
            write!(f, ", {}: {}", label, n)?;
        }
        Ok(())
    }
}

/// A heuristic decision that could not be verified. Logged with its full
/// input; the migration proceeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousOutcome {
    pub migration: String,
    pub decision: String,
    pub input: serde_json::Value,
}

/// Everything the last load or import migrated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub records: Vec<MigrationRecord>,
    pub ambiguous: Vec<AmbiguousOutcome>,
}

impl MigrationReport {
    pub fn push(&mut self, record: MigrationRecord) {
        if !record.is_empty() {
            tracing::info!("Migration: {}", record);
            for line in &record.details {
                tracing::debug!("  {}", line);
            }
            self.records.push(record);
        }
    }

    pub fn ambiguous(&mut self, outcome: AmbiguousOutcome) {
        tracing::warn!(
            "Ambiguous migration outcome in {}: {} (input: {})",
            outcome.migration,
            outcome.decision,
            outcome.input
        );
        self.ambiguous.push(outcome);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.ambiguous.is_empty()
    }

    pub fn record_for(&self, name: &str) -> Option<&MigrationRecord> {
        self.records.iter().find(|r| r.name == name)
    }
}
