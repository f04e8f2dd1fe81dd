//! Migrations that span several entity kinds.
//!
//! They run once per load or import, after every kind has been migrated on
//! its own, in a fixed order:
//!
//! 1. extract standalone issue providers from legacy inline project configs
//! 2. clear issue links that do not resolve to a provider
//! 3. consolidate legacy per-project shards into global collections
//! 4. rewrite references to the renamed default project

use crate::collection::{AppSnapshot, EntityCollection, is_absent, str_field};
use crate::issue_provider::{IssueProviderKind, differing_fields};
use crate::kind::EntityKind;
use crate::migrate::DEFAULT_PROJECT_ID;
use crate::report::{AmbiguousOutcome, MigrationRecord, MigrationReport};
use crate::shard::{LegacyShardMerger, LegacyShards};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Minimum number of fields an inline provider config must differ from its
/// defaults in to be worth extracting. Kept as found; the right value is
/// unknown.
pub const PROVIDER_EXTRACTION_MIN_DIFF: usize = 2;

/// Id of the default project before it was renamed to [`DEFAULT_PROJECT_ID`].
pub const LEGACY_DEFAULT_PROJECT_ID: &str = "DEFAULT";

/// Task fields that link a task to an issue.
pub const ISSUE_LINK_FIELDS: [&str; 8] = [
    "issueId",
    "issueType",
    "issueProviderId",
    "issueWasUpdated",
    "issueLastUpdated",
    "issueAttachmentNr",
    "issuePoints",
    "issueTimeTracked",
];

const TASK_KINDS: [EntityKind; 2] = [EntityKind::Task, EntityKind::TaskArchive];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossModelStep {
    ExtractIssueProviders,
    CleanOrphanIssueLinks,
    ConsolidateLegacyShards,
    RenameDefaultProject,
}

impl CrossModelStep {
    /// Execution order. Later steps rely on the earlier ones.
    pub const ORDER: [CrossModelStep; 4] = [
        CrossModelStep::ExtractIssueProviders,
        CrossModelStep::CleanOrphanIssueLinks,
        CrossModelStep::ConsolidateLegacyShards,
        CrossModelStep::RenameDefaultProject,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CrossModelStep::ExtractIssueProviders => "ExtractIssueProviders",
            CrossModelStep::CleanOrphanIssueLinks => "CleanOrphanIssueLinks",
            CrossModelStep::ConsolidateLegacyShards => "ConsolidateLegacyShards",
            CrossModelStep::RenameDefaultProject => "RenameDefaultProject",
        }
    }
}

/// What the loader found besides the snapshot itself.
#[derive(Debug, Clone, Default)]
pub struct CrossModelContext {
    /// Whether an issue provider blob existed before this load.
    pub issue_provider_blob_exists: bool,
    /// Legacy shards per kind, already migrated per kind.
    pub legacy_shards: BTreeMap<EntityKind, LegacyShards>,
}

#[derive(Debug, Clone, Default)]
pub struct CrossModelOutcome {
    pub snapshot: AppSnapshot,
    pub report: MigrationReport,
    /// Kinds whose legacy shards were merged; their shard blobs can go.
    pub consolidated: Vec<EntityKind>,
}

pub struct CrossModelMigrator {
    min_diff: usize,
    new_id: Box<dyn Fn() -> String + Send + Sync>,
}

impl Default for CrossModelMigrator {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossModelMigrator {
    pub fn new() -> Self {
        Self {
            min_diff: PROVIDER_EXTRACTION_MIN_DIFF,
            new_id: Box::new(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Replaces the id generator used for extracted providers.
    pub fn with_id_generator(mut self, f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.new_id = Box::new(f);
        self
    }

    pub fn migrate(&self, snapshot: AppSnapshot, ctx: CrossModelContext) -> CrossModelOutcome {
        let mut out = CrossModelOutcome {
            snapshot,
            ..Default::default()
        };
        let CrossModelContext {
            issue_provider_blob_exists,
            mut legacy_shards,
        } = ctx;
        for step in CrossModelStep::ORDER {
            let mut record = MigrationRecord::new(None, step.name());
            match step {
                CrossModelStep::ExtractIssueProviders => {
                    if !issue_provider_blob_exists {
                        self.extract_issue_providers(&mut out.snapshot, &mut record, &mut out.report);
                    }
                }
                CrossModelStep::CleanOrphanIssueLinks => {
                    clean_orphan_issue_links(&mut out.snapshot, &mut record)
                }
                CrossModelStep::ConsolidateLegacyShards => {
                    out.consolidated =
                        consolidate_legacy_shards(&mut out.snapshot, &mut legacy_shards, &mut record)
                }
                CrossModelStep::RenameDefaultProject => {
                    rename_default_project(&mut out.snapshot, &mut record)
                }
            }
            out.report.push(record);
        }
        out
    }

    fn extract_issue_providers(
        &self,
        snapshot: &mut AppSnapshot,
        record: &mut MigrationRecord,
        report: &mut MigrationReport,
    ) {
        if snapshot
            .collection(EntityKind::IssueProvider)
            .is_some_and(|c| !c.is_empty())
        {
            return;
        }
        let mut providers = EntityCollection::new();
        // (issueType, projectId) -> provider id
        let mut extracted: HashMap<(String, String), String> = HashMap::new();

        if let Some(projects) = snapshot.collection(EntityKind::Project) {
            for (project_id, project) in projects.iter() {
                let Some(Value::Object(cfgs)) = project.get("issueIntegrationCfgs") else {
                    continue;
                };
                for kind in IssueProviderKind::ALL {
                    let Some(Value::Object(inline)) = cfgs.get(kind.key()) else {
                        continue;
                    };
                    let defaults = kind.default_config();
                    let diff = differing_fields(inline, &defaults);
                    let has_required = kind.has_required_field(inline);
                    let extract = diff.len() >= self.min_diff && has_required;
                    if diff.len().abs_diff(self.min_diff) <= 1 {
                        report.ambiguous(AmbiguousOutcome {
                            migration: CrossModelStep::ExtractIssueProviders.name().to_string(),
                            decision: format!(
                                "{} config of project {} {} ({} differing fields, required '{}' {})",
                                kind,
                                project_id,
                                if extract { "extracted" } else { "skipped" },
                                diff.len(),
                                kind.required_field(),
                                if has_required { "present" } else { "missing" },
                            ),
                            input: json!({
                                "projectId": project_id,
                                "issueProviderKey": kind.key(),
                                "differingFields": diff,
                                "config": inline,
                            }),
                        });
                    }
                    if !extract {
                        continue;
                    }
                    let id = (self.new_id)();
                    providers.upsert(id.clone(), provider_entity(kind, &id, project_id, inline, defaults));
                    record.detail(format!(
                        "{} provider {} extracted from project {}",
                        kind, id, project_id
                    ));
                    extracted.insert((kind.key().to_string(), project_id.clone()), id);
                }
            }
        }
        record.count("providers", providers.len());

        let mut repointed = 0;
        for kind in TASK_KINDS {
            if let Some(tasks) = snapshot.collection_mut(kind) {
                tasks.for_each_entity_mut(|_, task| {
                    let key = match (str_field(task, "issueType"), str_field(task, "projectId")) {
                        (Some(t), Some(p)) => (t.to_string(), p.to_string()),
                        _ => return,
                    };
                    if let Some(id) = extracted.get(&key) {
                        if str_field(task, "issueProviderId") != Some(id.as_str()) {
                            task.insert("issueProviderId".to_string(), Value::from(id.as_str()));
                            repointed += 1;
                        }
                    }
                });
            }
        }
        record.count("tasksRepointed", repointed);

        match snapshot.collection_mut(EntityKind::IssueProvider) {
            Some(existing) => {
                for (id, entity) in providers.iter() {
                    existing.upsert(id.clone(), entity.clone());
                }
            }
            None => {
                snapshot.collections.insert(EntityKind::IssueProvider, providers);
            }
        }
    }
}

fn provider_entity(
    kind: IssueProviderKind,
    id: &str,
    project_id: &str,
    inline: &Map<String, Value>,
    defaults: Map<String, Value>,
) -> Value {
    let mut entity = defaults;
    for (k, v) in inline {
        entity.insert(k.clone(), v.clone());
    }
    let is_enabled = inline.get("isEnabled").and_then(Value::as_bool).unwrap_or(true);
    entity.insert("id".to_string(), Value::from(id));
    entity.insert("issueProviderKey".to_string(), Value::from(kind.key()));
    entity.insert("defaultProjectId".to_string(), Value::from(project_id));
    entity.insert("migratedFromProjectId".to_string(), Value::from(project_id));
    entity.insert("isEnabled".to_string(), Value::Bool(is_enabled));
    Value::Object(entity)
}

fn has_issue_link(task: &Map<String, Value>) -> bool {
    !is_absent(task, "issueId") || !is_absent(task, "issueType")
}

fn clean_orphan_issue_links(snapshot: &mut AppSnapshot, record: &mut MigrationRecord) {
    let provider_ids: HashSet<String> = snapshot
        .collection(EntityKind::IssueProvider)
        .map(|c| c.ids.iter().cloned().collect())
        .unwrap_or_default();
    for kind in TASK_KINDS {
        let Some(tasks) = snapshot.collection_mut(kind) else {
            continue;
        };
        let mut cleared = 0;
        tasks.for_each_entity_mut(|id, task| {
            if !has_issue_link(task) {
                return;
            }
            let resolves = str_field(task, "issueProviderId").is_some_and(|p| provider_ids.contains(p));
            if resolves {
                return;
            }
            tracing::debug!("Clearing dangling issue link of {} {}", kind, id);
            for field in ISSUE_LINK_FIELDS {
                if task.contains_key(field) {
                    task.insert(field.to_string(), Value::Null);
                }
            }
            cleared += 1;
        });
        record.count(format!("{}Cleared", kind), cleared);
    }
}

fn consolidate_legacy_shards(
    snapshot: &mut AppSnapshot,
    legacy_shards: &mut BTreeMap<EntityKind, LegacyShards>,
    record: &mut MigrationRecord,
) -> Vec<EntityKind> {
    let mut consolidated = Vec::new();
    for kind in EntityKind::SHARDED_LEGACY {
        let Some(shards) = legacy_shards.remove(&kind) else {
            continue;
        };
        if shards.is_empty() {
            continue;
        }
        // A stamped global collection means consolidation already happened.
        if snapshot.schema_version(kind).is_some() {
            tracing::warn!(
                "Ignoring {} legacy {} shards: global collection is already versioned",
                shards.len(),
                kind
            );
            continue;
        }
        let merger = match kind {
            EntityKind::Note => LegacyShardMerger::new().stamping_project_id(),
            _ => LegacyShardMerger::new(),
        };
        let base = snapshot.collections.remove(&kind);
        let merged = merger.merge_into(base.as_ref(), &shards);
        record.count(format!("{}Shards", kind), shards.len());
        record.count(format!("{}Duplicates", kind), merged.duplicates);
        record.detail(format!(
            "{}: {} shards merged into {} entities",
            kind,
            shards.len(),
            merged.collection.len()
        ));
        snapshot.collections.insert(kind, merged.collection);
        consolidated.push(kind);
    }
    consolidated
}

fn rename_default_project(snapshot: &mut AppSnapshot, record: &mut MigrationRecord) {
    let (old_resolves, new_exists) = match snapshot.collection(EntityKind::Project) {
        Some(projects) => (
            projects.contains(LEGACY_DEFAULT_PROJECT_ID),
            projects.contains(DEFAULT_PROJECT_ID),
        ),
        None => (false, false),
    };
    if old_resolves && !new_exists {
        return;
    }
    let Some(config) = snapshot.singleton_mut(EntityKind::GlobalConfig) else {
        return;
    };
    let Some(Value::Object(misc)) = config.get_mut("misc") else {
        return;
    };
    if str_field(misc, "defaultProjectId") == Some(LEGACY_DEFAULT_PROJECT_ID) {
        misc.insert("defaultProjectId".to_string(), Value::from(DEFAULT_PROJECT_ID));
        record.count("defaultProjectId", 1);
        record.detail(format!(
            "globalConfig.misc.defaultProjectId: {} -> {}",
            LEGACY_DEFAULT_PROJECT_ID, DEFAULT_PROJECT_ID
        ));
    }
}
