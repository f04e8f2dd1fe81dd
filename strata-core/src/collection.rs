//! Entity collections and the aggregate application snapshot.
//!
//! Entity bodies are kept as JSON values: the migrations only reason about a
//! handful of fields and everything else has to survive untouched, including
//! fields introduced by newer builds.

use crate::kind::EntityKind;
use crate::version::{SchemaVersion, VERSION_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// An `{ids, entities}` collection of one entity kind.
///
/// `ids` is the display order; every id has an entity and vice versa.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub struct EntityCollection {
    pub ids: Vec<String>,
    pub entities: Map<String, Value>,
    pub schema_version: Option<SchemaVersion>,
    /// Additional top-level state keys (e.g. `currentTaskId`), kept verbatim.
    pub extra: Map<String, Value>,
}

/// What [`EntityCollection::fix_consistency`] had to repair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsistencyFix {
    pub duplicate_ids: usize,
    pub ids_without_entity: usize,
    pub entities_without_id: usize,
}

impl ConsistencyFix {
    pub fn is_clean(&self) -> bool {
        self.duplicate_ids == 0 && self.ids_without_entity == 0 && self.entities_without_id == 0
    }
}

impl EntityCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty collection stamped with `version`.
    pub fn stamped(version: SchemaVersion) -> Self {
        Self {
            schema_version: Some(version),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Value> {
        self.entities.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Inserts or replaces an entity; new ids are appended to the order.
    pub fn upsert(&mut self, id: impl Into<String>, entity: Value) {
        let id = id.into();
        if !self.entities.contains_key(&id) {
            self.ids.push(id.clone());
        }
        self.entities.insert(id, entity);
    }

    pub fn remove(&mut self, id: &str) -> Option<Value> {
        self.ids.retain(|i| i != id);
        self.entities.remove(id)
    }

    /// Entities in `ids` order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.ids
            .iter()
            .filter_map(move |id| self.entities.get(id).map(|e| (id, e)))
    }

    /// Applies `f` to every entity object, in `ids` order.
    pub fn for_each_entity_mut(&mut self, mut f: impl FnMut(&str, &mut Map<String, Value>)) {
        for id in &self.ids {
            if let Some(Value::Object(obj)) = self.entities.get_mut(id) {
                f(id, obj);
            }
        }
    }

    /// Restores the ids/entities invariant: duplicates in `ids` are dropped,
    /// ids without an entity are dropped, entities missing from `ids` are
    /// appended in map order.
    pub fn fix_consistency(&mut self) -> ConsistencyFix {
        let mut fix = ConsistencyFix::default();
        let mut seen = HashSet::with_capacity(self.ids.len());
        let mut ids = Vec::with_capacity(self.ids.len());
        for id in self.ids.drain(..) {
            if !seen.insert(id.clone()) {
                fix.duplicate_ids += 1;
            } else if !self.entities.contains_key(&id) {
                fix.ids_without_entity += 1;
            } else {
                ids.push(id);
            }
        }
        for key in self.entities.keys() {
            if !seen.contains(key) {
                fix.entities_without_id += 1;
                ids.push(key.clone());
            }
        }
        self.ids = ids;
        fix
    }

    pub fn to_json(&self) -> Value {
        let mut obj = self.extra.clone();
        obj.insert(
            "ids".to_string(),
            Value::Array(self.ids.iter().cloned().map(Value::String).collect()),
        );
        obj.insert("entities".to_string(), Value::Object(self.entities.clone()));
        if let Some(v) = self.schema_version {
            obj.insert(VERSION_FIELD.to_string(), Value::from(v.value()));
        }
        Value::Object(obj)
    }

    /// Lenient parse of a stored collection. Numeric ids are converted to
    /// strings and null ids are skipped; the value itself must be an object.
    pub fn from_json(value: Value) -> Result<Self, String> {
        let Value::Object(mut obj) = value else {
            return Err("collection is not an object".to_string());
        };
        let ids = match obj.remove("ids") {
            Some(Value::Array(ids)) => ids.into_iter().filter_map(id_to_string).collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err("'ids' is not an array".to_string()),
        };
        let entities = match obj.remove("entities") {
            Some(Value::Object(entities)) => entities,
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err("'entities' is not an object".to_string()),
        };
        let schema_version = obj
            .remove(VERSION_FIELD)
            .and_then(|v| SchemaVersion::from_json(&v));
        Ok(Self {
            ids,
            entities,
            schema_version,
            extra: obj,
        })
    }
}

fn id_to_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl From<EntityCollection> for Value {
    fn from(c: EntityCollection) -> Self {
        c.to_json()
    }
}

impl TryFrom<Value> for EntityCollection {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(value)
    }
}

/// A singleton kind's value with its version stamp.
///
/// Stored as `{"__v": <version>, "value": <value>}`. A blob without that
/// envelope is legacy, unversioned data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", from = "Value")]
pub struct Singleton {
    pub value: Value,
    pub schema_version: Option<SchemaVersion>,
}

impl Singleton {
    pub fn new(value: Value, schema_version: Option<SchemaVersion>) -> Self {
        Self { value, schema_version }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if let Some(v) = self.schema_version {
            obj.insert(VERSION_FIELD.to_string(), Value::from(v.value()));
        }
        obj.insert("value".to_string(), self.value.clone());
        Value::Object(obj)
    }

    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(mut obj)
                if obj.len() == 2 && obj.contains_key(VERSION_FIELD) && obj.contains_key("value") =>
            {
                let schema_version = obj
                    .remove(VERSION_FIELD)
                    .and_then(|v| SchemaVersion::from_json(&v));
                let value = obj.remove("value").unwrap_or(Value::Null);
                Self { value, schema_version }
            }
            other => Self {
                value: other,
                schema_version: None,
            },
        }
    }
}

impl From<Singleton> for Value {
    fn from(s: Singleton) -> Self {
        s.to_json()
    }
}

impl From<Value> for Singleton {
    fn from(value: Value) -> Self {
        Singleton::from_json(value)
    }
}

/// Data of one kind as handed to [`crate::PersistenceGateway::save`].
#[derive(Debug, Clone, PartialEq)]
pub enum ModelData {
    Collection(EntityCollection),
    Singleton(Value),
}

/// The aggregate root: every kind's state plus the last-active timestamp.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub struct AppSnapshot {
    pub collections: BTreeMap<EntityKind, EntityCollection>,
    pub singletons: BTreeMap<EntityKind, Singleton>,
    pub last_active_time: Option<i64>,
}

impl AppSnapshot {
    pub fn collection(&self, kind: EntityKind) -> Option<&EntityCollection> {
        self.collections.get(&kind)
    }

    pub fn collection_mut(&mut self, kind: EntityKind) -> Option<&mut EntityCollection> {
        self.collections.get_mut(&kind)
    }

    pub fn singleton(&self, kind: EntityKind) -> Option<&Value> {
        self.singletons.get(&kind).map(|s| &s.value)
    }

    pub fn singleton_mut(&mut self, kind: EntityKind) -> Option<&mut Value> {
        self.singletons.get_mut(&kind).map(|s| &mut s.value)
    }

    /// Version stamp of `kind`, whichever form it is stored in.
    pub fn schema_version(&self, kind: EntityKind) -> Option<SchemaVersion> {
        if kind.is_singleton() {
            self.singletons.get(&kind).and_then(|s| s.schema_version)
        } else {
            self.collections.get(&kind).and_then(|c| c.schema_version)
        }
    }

    /// Stored JSON form of one kind, if present.
    pub fn kind_to_json(&self, kind: EntityKind) -> Option<Value> {
        if kind.is_singleton() {
            self.singletons.get(&kind).map(Singleton::to_json)
        } else {
            self.collections.get(&kind).map(EntityCollection::to_json)
        }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        for kind in EntityKind::ALL {
            if let Some(v) = self.kind_to_json(kind) {
                obj.insert(kind.key().to_string(), v);
            }
        }
        if let Some(t) = self.last_active_time {
            obj.insert("lastActiveTime".to_string(), Value::from(t));
        }
        Value::Object(obj)
    }

    /// Parses a snapshot. Unknown keys (e.g. kinds added by a newer build) are
    /// ignored with a warning.
    pub fn from_json(value: Value) -> Result<Self, String> {
        let Value::Object(obj) = value else {
            return Err("snapshot is not an object".to_string());
        };
        let mut snapshot = AppSnapshot::default();
        for (key, v) in obj {
            if key == "lastActiveTime" {
                snapshot.last_active_time = v.as_i64();
                continue;
            }
            match EntityKind::from_key(&key) {
                Some(kind) if kind.is_singleton() => {
                    snapshot.singletons.insert(kind, Singleton::from_json(v));
                }
                Some(kind) => {
                    let c = EntityCollection::from_json(v).map_err(|e| format!("{}: {}", key, e))?;
                    snapshot.collections.insert(kind, c);
                }
                None => tracing::warn!("Ignoring unknown snapshot key '{}'", key),
            }
        }
        Ok(snapshot)
    }
}

impl From<AppSnapshot> for Value {
    fn from(s: AppSnapshot) -> Self {
        s.to_json()
    }
}

impl TryFrom<Value> for AppSnapshot {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(value)
    }
}

// ─────────────────────────────────────────────────────
// JSON field helpers used by the migrations
// ─────────────────────────────────────────────────────

pub(crate) fn str_field<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    obj.get(field).and_then(Value::as_str)
}

/// True if the field is missing or JSON null.
pub(crate) fn is_absent(obj: &Map<String, Value>, field: &str) -> bool {
    matches!(obj.get(field), None | Some(Value::Null))
}

/// Replaces a missing, null or wrongly typed array field with `[]`.
pub(crate) fn ensure_array(obj: &mut Map<String, Value>, field: &str) -> bool {
    if obj.get(field).is_some_and(Value::is_array) {
        return false;
    }
    obj.insert(field.to_string(), Value::Array(Vec::new()));
    true
}

/// Replaces a missing, null or wrongly typed object field with `{}`.
pub(crate) fn ensure_object(obj: &mut Map<String, Value>, field: &str) -> bool {
    if obj.get(field).is_some_and(Value::is_object) {
        return false;
    }
    obj.insert(field.to_string(), Value::Object(Map::new()));
    true
}

/// Sets a field only if it is missing or null.
pub(crate) fn ensure_default(obj: &mut Map<String, Value>, field: &str, default: Value) -> bool {
    if !is_absent(obj, field) {
        return false;
    }
    obj.insert(field.to_string(), default);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_lenient_ids() {
        let c = EntityCollection::from_json(json!({
            "ids": ["a", 12, null],
            "entities": {"a": {"id": "a"}, "12": {"id": 12}},
            "__v": 2,
            "currentTaskId": "a"
        }))
        .unwrap();
        assert_eq!(c.ids, vec!["a", "12"]);
        assert_eq!(c.schema_version, Some(SchemaVersion::new(2.0)));
        assert_eq!(c.extra.get("currentTaskId"), Some(&json!("a")));
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(EntityCollection::from_json(json!([1, 2])).is_err());
        assert!(EntityCollection::from_json(json!({"ids": "a"})).is_err());
    }

    #[test]
    fn test_to_json_keeps_extra_and_stamp() {
        let mut c = EntityCollection::stamped(SchemaVersion::new(1.5));
        c.upsert("x", json!({"id": "x"}));
        c.extra.insert("selectedId".into(), json!("x"));
        let v = c.to_json();
        assert_eq!(v["__v"], json!(1.5));
        assert_eq!(v["ids"], json!(["x"]));
        assert_eq!(v["selectedId"], json!("x"));
        assert_eq!(EntityCollection::from_json(v).unwrap(), c);
    }

    #[test]
    fn test_fix_consistency() {
        let mut c = EntityCollection::from_json(json!({
            "ids": ["a", "b", "a", "ghost"],
            "entities": {"a": {}, "b": {}, "c": {}}
        }))
        .unwrap();
        let fix = c.fix_consistency();
        assert_eq!(c.ids, vec!["a", "b", "c"]);
        assert_eq!(fix.duplicate_ids, 1);
        assert_eq!(fix.ids_without_entity, 1);
        assert_eq!(fix.entities_without_id, 1);
        assert!(c.fix_consistency().is_clean());
    }

    #[test]
    fn test_upsert_and_remove_keep_order() {
        let mut c = EntityCollection::new();
        c.upsert("b", json!({}));
        c.upsert("a", json!({}));
        c.upsert("b", json!({"x": 1}));
        assert_eq!(c.ids, vec!["b", "a"]);
        assert_eq!(c.get("b"), Some(&json!({"x": 1})));
        c.remove("b");
        assert_eq!(c.ids, vec!["a"]);
        assert!(!c.contains("b"));
    }

    #[test]
    fn test_singleton_envelope_and_legacy() {
        let s = Singleton::from_json(json!({"__v": 3.4, "value": {"misc": {}}}));
        assert_eq!(s.schema_version, Some(SchemaVersion::new(3.4)));
        assert_eq!(s.value, json!({"misc": {}}));

        let legacy = Singleton::from_json(json!({"misc": {}, "sync": {}}));
        assert_eq!(legacy.schema_version, None);
        assert_eq!(legacy.value, json!({"misc": {}, "sync": {}}));
    }

    #[test]
    fn test_snapshot_json_ignores_unknown_kinds() {
        let snap = AppSnapshot::from_json(json!({
            "task": {"ids": [], "entities": {}, "__v": 3.6},
            "reminders": {"__v": 1, "value": []},
            "planner": {"days": {}},
            "lastActiveTime": 1234
        }))
        .unwrap();
        assert_eq!(snap.last_active_time, Some(1234));
        assert!(snap.collection(EntityKind::Task).is_some());
        assert_eq!(snap.singleton(EntityKind::Reminders), Some(&json!([])));
        assert_eq!(snap.collections.len(), 1);

        let back: AppSnapshot = serde_json::from_value(serde_json::to_value(&snap).unwrap()).unwrap();
        assert_eq!(back, snap);
    }
}
