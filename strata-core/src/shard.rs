//! Consolidation of legacy per-project shards into one global collection.
//!
//! Shards are processed in project id order. Ids keep their first-seen order.
//! An id found in several shards is merged field by field: arrays become the
//! union of both sides in encounter order, every other value is taken from
//! the shard processed last.

use crate::collection::EntityCollection;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Legacy shards of one kind, keyed by project id.
pub type LegacyShards = BTreeMap<String, EntityCollection>;

/// Result of a shard merge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShardMerge {
    pub collection: EntityCollection,
    /// Ids found in more than one input.
    pub duplicates: usize,
    /// Entities whose `projectId` was rewritten to the owning shard.
    pub restamped: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyShardMerger {
    stamp_project_id: bool,
}

impl LegacyShardMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the owning shard's project id into every shard entity.
    pub fn stamping_project_id(mut self) -> Self {
        self.stamp_project_id = true;
        self
    }

    pub fn merge(&self, shards: &LegacyShards) -> EntityCollection {
        self.merge_into(None, shards).collection
    }

    /// Merges `shards` after `base`, the already global (unstamped)
    /// collection, which is treated as the first shard.
    pub fn merge_into(&self, base: Option<&EntityCollection>, shards: &LegacyShards) -> ShardMerge {
        let mut out = ShardMerge::default();
        if let Some(base) = base {
            self.absorb(&mut out, None, base);
        }
        for (project_id, shard) in shards {
            self.absorb(&mut out, Some(project_id), shard);
        }
        out.collection.fix_consistency();
        out
    }

    fn absorb(&self, out: &mut ShardMerge, project_id: Option<&str>, shard: &EntityCollection) {
        for (key, value) in &shard.extra {
            out.collection.extra.insert(key.clone(), value.clone());
        }
        for (id, entity) in shard.iter() {
            let mut entity = entity.clone();
            if let (true, Some(pid), Value::Object(obj)) =
                (self.stamp_project_id, project_id, &mut entity)
            {
                if obj.get("projectId").and_then(Value::as_str) != Some(pid) {
                    if !matches!(obj.get("projectId"), None | Some(Value::Null)) {
                        tracing::debug!(
                            "Shard entity {} moved from project {} to {}",
                            id,
                            obj["projectId"],
                            pid
                        );
                    }
                    obj.insert("projectId".to_string(), Value::from(pid));
                    out.restamped += 1;
                }
            }
            match out.collection.get_mut(id) {
                Some(existing) => {
                    out.duplicates += 1;
                    merge_entity(existing, entity);
                }
                None => out.collection.upsert(id.clone(), entity),
            }
        }
    }
}

/// Merges `incoming` into `existing`.
pub fn merge_entity(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(existing), Value::Object(incoming)) => merge_fields(existing, incoming),
        (existing, incoming) => *existing = incoming,
    }
}

fn merge_fields(existing: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        if let (Some(Value::Array(current)), Value::Array(items)) = (existing.get_mut(&key), &value) {
            for item in items {
                if !current.contains(item) {
                    current.push(item.clone());
                }
            }
        } else {
            existing.insert(key, value);
        }
    }
}

/// Convenience for [`LegacyShardMerger::merge`] without project id stamping.
pub fn merge_shards(shards: &LegacyShards) -> EntityCollection {
    LegacyShardMerger::new().merge(shards)
}
