//! Integrity checks run before a whole dataset leaves or replaces the
//! local replica.
//!
//! Every collection must satisfy the ids/entities invariant, and the links
//! between tasks, projects, tags and reminders must resolve.

use crate::collection::{AppSnapshot, EntityCollection, str_field};
use crate::kind::EntityKind;
use crate::migrate::DEFAULT_PROJECT_ID;
use serde_json::Value;
use std::collections::HashSet;

const TASK_KINDS: [EntityKind; 2] = [EntityKind::Task, EntityKind::TaskArchive];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    /// `ids` and `entities` disagree
    #[error("Inconsistent entity state \"{0}\"")]
    InconsistentEntityState(EntityKind),

    /// A project or tag lists a task that does not exist
    #[error("Missing task data (tid: {task_id}) for {owner_kind} {owner}")]
    MissingTask {
        owner_kind: EntityKind,
        owner: String,
        task_id: String,
    },

    /// A task points at a project, tag or reminder that does not exist
    #[error("{field} \"{target}\" of {kind} entity {task_id} does not exist")]
    DanglingReference {
        kind: EntityKind,
        task_id: String,
        field: &'static str,
        target: String,
    },

    /// A sub task whose parent is not in the same collection
    #[error("Sub task {task_id} in {kind} has no parent there")]
    LonelySubTask { kind: EntityKind, task_id: String },
}

/// Checks `snapshot`, reporting the first problem found.
pub fn validate_app_data(snapshot: &AppSnapshot) -> Result<(), IntegrityError> {
    for (kind, collection) in &snapshot.collections {
        if !is_consistent(collection) {
            return Err(IntegrityError::InconsistentEntityState(*kind));
        }
    }

    let tasks = ids_of(snapshot, EntityKind::Task);
    let projects = ids_of(snapshot, EntityKind::Project);
    let tags = ids_of(snapshot, EntityKind::Tag);
    let reminders: HashSet<&str> = snapshot
        .singleton(EntityKind::Reminders)
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(|rem| rem.get("id").and_then(Value::as_str)).collect())
        .unwrap_or_default();

    for (owner_kind, fields) in [
        (EntityKind::Project, &["taskIds", "backlogTaskIds"][..]),
        (EntityKind::Tag, &["taskIds"][..]),
    ] {
        let Some(owners) = snapshot.collection(owner_kind) else {
            continue;
        };
        for (id, owner) in owners.iter() {
            for field in fields {
                if let Some(missing) = string_list(owner, field).find(|t| !tasks.contains(t)) {
                    return Err(IntegrityError::MissingTask {
                        owner_kind,
                        owner: str_field_of(owner, "title").unwrap_or(id).to_string(),
                        task_id: missing.to_string(),
                    });
                }
            }
        }
    }

    for kind in TASK_KINDS {
        let Some(collection) = snapshot.collection(kind) else {
            continue;
        };
        for (id, task) in collection.iter() {
            let dangling = |field: &'static str, target: &str| IntegrityError::DanglingReference {
                kind,
                task_id: id.clone(),
                field,
                target: target.to_string(),
            };
            if let Some(tag) = string_list(task, "tagIds").find(|t| !tags.contains(t)) {
                return Err(dangling("tagId", tag));
            }
            let project = str_field_of(task, "projectId");
            if let Some(project) = project.filter(|p| *p != DEFAULT_PROJECT_ID && !projects.contains(p)) {
                return Err(dangling("projectId", project));
            }
            if let Some(reminder) = str_field_of(task, "reminderId").filter(|r| !reminders.contains(r)) {
                return Err(dangling("reminderId", reminder));
            }
            if str_field_of(task, "parentId").is_some_and(|parent| !collection.contains(parent)) {
                return Err(IntegrityError::LonelySubTask {
                    kind,
                    task_id: id.clone(),
                });
            }
        }
    }
    Ok(())
}

fn ids_of(snapshot: &AppSnapshot, kind: EntityKind) -> HashSet<&str> {
    snapshot
        .collection(kind)
        .map(|c| c.ids.iter().map(String::as_str).collect())
        .unwrap_or_default()
}

fn is_consistent(collection: &EntityCollection) -> bool {
    let unique: HashSet<&str> = collection.ids.iter().map(String::as_str).collect();
    unique.len() == collection.ids.len()
        && unique.len() == collection.entities.len()
        && unique.iter().all(|id| collection.entities.contains_key(*id))
}

fn str_field_of<'a>(entity: &'a Value, field: &str) -> Option<&'a str> {
    entity.as_object().and_then(|obj| str_field(obj, field))
}

fn string_list<'a>(entity: &'a Value, field: &str) -> impl Iterator<Item = &'a str> {
    entity
        .get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}
