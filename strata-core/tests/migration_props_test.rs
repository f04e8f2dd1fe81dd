//! Property tests for the migrations and the shard merger

use proptest::prelude::*;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use strata_core::{EntityCollection, EntityKind, LegacyShards, ModelData, SchemaVersion, merge_shards, migrate};

fn day_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("2021-03-04".to_string()),
        Just("٢٠٢١-٠٣-٠٥".to_string()),
        Just("२०२१-०३-०६".to_string()),
        Just("２０２１-０３-０７".to_string()),
    ]
}

fn field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        (0u32..10_000).prop_map(Value::from),
        "[a-z]{0,6}".prop_map(Value::from),
        Just(json!([])),
        Just(json!(["x", "y"])),
    ]
}

fn task() -> impl Strategy<Value = Value> {
    (
        prop_oneof![Just(Value::Null), Just(json!("GIT")), Just(json!("JIRA")), Just(json!("GITHUB"))],
        field_value(),
        field_value(),
        proptest::collection::btree_map(day_key(), 0u32..100_000, 0..4),
        any::<bool>(),
    )
        .prop_map(|(issue_type, sub_tasks, time_spent, days, ui_state)| {
            let mut t = Map::new();
            t.insert("issueType".into(), issue_type);
            t.insert("subTaskIds".into(), sub_tasks);
            t.insert("timeSpent".into(), time_spent);
            t.insert(
                "timeSpentOnDay".into(),
                Value::Object(days.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
            );
            if ui_state {
                t.insert("_currentTab".into(), json!(2));
            }
            Value::Object(t)
        })
}

/// How a task is referenced from `ids`
#[derive(Debug, Clone, Copy)]
enum Listing {
    Listed,
    Orphan,
    Duplicated,
}

fn listing() -> impl Strategy<Value = Listing> {
    prop_oneof![
        3 => Just(Listing::Listed),
        1 => Just(Listing::Orphan),
        1 => Just(Listing::Duplicated),
    ]
}

fn task_collection() -> impl Strategy<Value = EntityCollection> {
    (
        proptest::collection::vec((task(), listing()), 0..6),
        proptest::collection::vec("x[0-9]", 0..2),
    )
        .prop_map(|(tasks, dangling)| {
            let mut c = EntityCollection::new();
            for (i, (mut t, listing)) in tasks.into_iter().enumerate() {
                let id = format!("t{i}");
                t["id"] = json!(id);
                match listing {
                    Listing::Listed => c.upsert(id, t),
                    Listing::Orphan => {
                        c.entities.insert(id, t);
                    }
                    Listing::Duplicated => {
                        c.upsert(id.clone(), t);
                        c.ids.push(id);
                    }
                }
            }
            c.ids.extend(dangling);
            c
        })
}

fn loaded_version() -> impl Strategy<Value = Option<SchemaVersion>> {
    prop_oneof![
        Just(None),
        Just(Some(SchemaVersion::new(1.0))),
        Just(Some(SchemaVersion::new(3.0))),
        Just(Some(SchemaVersion::new(3.3))),
    ]
}

proptest! {
    #[test]
    fn migrating_twice_equals_migrating_once(tasks in task_collection(), loaded in loaded_version()) {
        let once = migrate(EntityKind::Task, ModelData::Collection(tasks), loaded).unwrap();
        let twice = migrate(EntityKind::Task, once.data.clone(), loaded).unwrap();
        prop_assert_eq!(&once.data, &twice.data);
        prop_assert!(twice.record.is_empty());
    }

    #[test]
    fn global_config_migration_is_idempotent(
        misc in proptest::collection::btree_map("[a-z]{1,4}", field_value(), 0..4),
        whole in prop_oneof![Just(None), Just(Some(json!(null))), Just(Some(json!("garbage")))],
    ) {
        let config = whole.unwrap_or_else(|| json!({ "misc": Value::Object(misc.into_iter().collect()) }));
        let once = migrate(EntityKind::GlobalConfig, ModelData::Singleton(config), None).unwrap();
        let twice = migrate(EntityKind::GlobalConfig, once.data.clone(), None).unwrap();
        prop_assert_eq!(once.data, twice.data);
    }

    #[test]
    fn disjoint_shards_merge_to_their_union(
        sizes in proptest::collection::vec(0usize..5, 1..5),
    ) {
        let mut shards = LegacyShards::new();
        let mut expected = BTreeMap::new();
        for (p, size) in sizes.iter().enumerate() {
            let mut c = EntityCollection::new();
            for i in 0..*size {
                let id = format!("p{p}-e{i}");
                let entity = json!({"id": id, "items": [i], "project": p});
                expected.insert(id.clone(), entity.clone());
                c.upsert(id, entity);
            }
            shards.insert(format!("P{p}"), c);
        }

        let merged = merge_shards(&shards);
        let ids: BTreeSet<_> = merged.ids.iter().cloned().collect();
        prop_assert_eq!(ids.len(), merged.ids.len());
        prop_assert_eq!(ids, expected.keys().cloned().collect::<BTreeSet<_>>());
        for (id, entity) in &expected {
            prop_assert_eq!(merged.get(id), Some(entity));
        }
    }

    #[test]
    fn overlapping_shards_union_their_arrays(
        a in proptest::collection::vec(0u8..6, 0..4),
        b in proptest::collection::vec(0u8..6, 0..4),
    ) {
        let mut shards = LegacyShards::new();
        for (pid, items) in [("A", &a), ("B", &b)] {
            let mut c = EntityCollection::new();
            c.upsert("shared", json!({"id": "shared", "items": items}));
            shards.insert(pid.to_string(), c);
        }
        let merged = merge_shards(&shards);
        prop_assert_eq!(merged.ids.clone(), vec!["shared".to_string()]);
        let items = merged.get("shared").unwrap()["items"].as_array().unwrap().clone();
        for x in a.iter().chain(b.iter()) {
            prop_assert!(items.contains(&json!(x)));
        }
        let again = merge_shards(&shards);
        prop_assert_eq!(again, merged);
    }
}
