//! Per-kind schema migrations.
//!
//! Every kind has an ordered list of steps, each tagged with the version that
//! introduced it. Migrating a kind loaded at version `v` applies every step
//! introduced after `v`, in order, then repairs the collection invariant.
//! Steps only fill, rename or derive fields; running them again on migrated
//! data changes nothing.

mod config;
mod date_keys;
mod misc;
mod project;
mod task;

pub use config::{DEFAULT_PROJECT_ID, GlobalConfigStep, RemindersStep, default_global_config};
pub use date_keys::{normalize_day_keys, to_western_digits};
pub use misc::{MetricStep, NoteStep, SimpleCounterStep, TaskRepeatCfgStep};
pub use project::ProjectStep;
pub use task::TaskStep;

use crate::collection::{EntityCollection, ModelData};
use crate::error::{Result, StrataError};
use crate::kind::EntityKind;
use crate::report::MigrationRecord;
use crate::version::{SchemaVersion, current_version};
use serde_json::{Map, Value};

/// One migration step of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStep {
    Project(ProjectStep),
    Task(TaskStep),
    TaskRepeatCfg(TaskRepeatCfgStep),
    SimpleCounter(SimpleCounterStep),
    Note(NoteStep),
    Metric(MetricStep),
    GlobalConfig(GlobalConfigStep),
    Reminders(RemindersStep),
}

impl MigrationStep {
    pub fn name(self) -> &'static str {
        match self {
            MigrationStep::Project(s) => s.name(),
            MigrationStep::Task(s) => s.name(),
            MigrationStep::TaskRepeatCfg(s) => s.name(),
            MigrationStep::SimpleCounter(s) => s.name(),
            MigrationStep::Note(s) => s.name(),
            MigrationStep::Metric(s) => s.name(),
            MigrationStep::GlobalConfig(s) => s.name(),
            MigrationStep::Reminders(s) => s.name(),
        }
    }

    /// Version that introduced the step.
    pub fn since(self) -> SchemaVersion {
        match self {
            MigrationStep::Project(s) => s.since(),
            MigrationStep::Task(s) => s.since(),
            MigrationStep::TaskRepeatCfg(s) => s.since(),
            MigrationStep::SimpleCounter(s) => s.since(),
            MigrationStep::Note(s) => s.since(),
            MigrationStep::Metric(s) => s.since(),
            MigrationStep::GlobalConfig(s) => s.since(),
            MigrationStep::Reminders(s) => s.since(),
        }
    }

    /// Applies an entity step. Singleton steps are no-ops here.
    fn apply_entity(self, entity: &mut Map<String, Value>) -> bool {
        match self {
            MigrationStep::Project(s) => s.apply(entity),
            MigrationStep::Task(s) => s.apply(entity),
            MigrationStep::TaskRepeatCfg(s) => s.apply(entity),
            MigrationStep::SimpleCounter(s) => s.apply(entity),
            MigrationStep::Note(s) => s.apply(entity),
            MigrationStep::Metric(s) => s.apply(entity),
            MigrationStep::GlobalConfig(_) | MigrationStep::Reminders(_) => false,
        }
    }

    /// Applies a singleton step. Entity steps are no-ops here.
    fn apply_value(self, value: &mut Value) -> bool {
        match self {
            MigrationStep::GlobalConfig(s) => s.apply(value),
            MigrationStep::Reminders(s) => s.apply(value),
            _ => false,
        }
    }
}

/// All steps of `kind`, oldest first.
pub fn steps_for(kind: EntityKind) -> Vec<MigrationStep> {
    match kind {
        EntityKind::Project => ProjectStep::ALL.map(MigrationStep::Project).to_vec(),
        EntityKind::Task | EntityKind::TaskArchive => TaskStep::ALL.map(MigrationStep::Task).to_vec(),
        EntityKind::TaskRepeatCfg => TaskRepeatCfgStep::ALL
            .map(MigrationStep::TaskRepeatCfg)
            .to_vec(),
        EntityKind::SimpleCounter => SimpleCounterStep::ALL
            .map(MigrationStep::SimpleCounter)
            .to_vec(),
        EntityKind::Note => NoteStep::ALL.map(MigrationStep::Note).to_vec(),
        EntityKind::Metric => MetricStep::ALL.map(MigrationStep::Metric).to_vec(),
        EntityKind::GlobalConfig => GlobalConfigStep::ALL
            .map(MigrationStep::GlobalConfig)
            .to_vec(),
        EntityKind::Reminders => RemindersStep::ALL.map(MigrationStep::Reminders).to_vec(),
        EntityKind::Tag
        | EntityKind::Improvement
        | EntityKind::Obstruction
        | EntityKind::IssueProvider => Vec::new(),
    }
}

/// Steps introduced after `loaded`; every step for unversioned data.
pub fn pending_steps(kind: EntityKind, loaded: Option<SchemaVersion>) -> Vec<MigrationStep> {
    steps_for(kind)
        .into_iter()
        .filter(|step| loaded.is_none_or(|v| step.since() > v))
        .collect()
}

/// Result of migrating one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Migrated {
    pub data: ModelData,
    pub record: MigrationRecord,
}

/// Migrates one kind's state from `loaded` to the current version.
///
/// The returned data is not stamped; stamping happens when it is persisted.
/// Fails only if the data has the wrong shape for the kind.
pub fn migrate(kind: EntityKind, data: ModelData, loaded: Option<SchemaVersion>) -> Result<Migrated> {
    match (kind.is_singleton(), data) {
        (false, ModelData::Collection(mut collection)) => {
            let record = migrate_entities(kind, &mut collection, loaded);
            Ok(Migrated {
                data: ModelData::Collection(collection),
                record,
            })
        }
        (true, ModelData::Singleton(mut value)) => {
            let record = migrate_value(kind, &mut value, loaded);
            Ok(Migrated {
                data: ModelData::Singleton(value),
                record,
            })
        }
        (true, _) => Err(StrataError::InvalidData {
            kind,
            reason: "expected a single value, got an entity collection".to_string(),
        }),
        (false, _) => Err(StrataError::InvalidData {
            kind,
            reason: "expected an entity collection, got a single value".to_string(),
        }),
    }
}

fn new_record(kind: EntityKind, loaded: Option<SchemaVersion>) -> MigrationRecord {
    let from = loaded.map_or_else(|| "unversioned".to_string(), |v| format!("v{}", v));
    MigrationRecord::new(
        Some(kind),
        format!("{} {} -> v{}", kind, from, current_version(kind)),
    )
}

/// Migrates a collection kind in place and repairs its ids/entities invariant.
pub fn migrate_entities(
    kind: EntityKind,
    collection: &mut EntityCollection,
    loaded: Option<SchemaVersion>,
) -> MigrationRecord {
    let mut record = new_record(kind, loaded);
    // Repair first so entities missing from `ids` are migrated too
    let fix = collection.fix_consistency();
    record.count("duplicateIds", fix.duplicate_ids);
    record.count("idsWithoutEntity", fix.ids_without_entity);
    record.count("entitiesWithoutId", fix.entities_without_id);
    for step in pending_steps(kind, loaded) {
        let mut n = 0;
        collection.for_each_entity_mut(|_, entity| {
            if step.apply_entity(entity) {
                n += 1;
            }
        });
        record.count(step.name(), n);
    }
    record
}

/// Migrates a singleton kind in place.
pub fn migrate_value(kind: EntityKind, value: &mut Value, loaded: Option<SchemaVersion>) -> MigrationRecord {
    let mut record = new_record(kind, loaded);
    for step in pending_steps(kind, loaded) {
        if step.apply_value(value) {
            record.count(step.name(), 1);
        }
    }
    record
}
