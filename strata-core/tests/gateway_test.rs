//! Persistence gateway integration tests

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata_core::{
    AppSnapshot, BlobStore, CrossModelMigrator, EntityCollection, EntityKind, FileBlobStore, IntegrityError,
    MemoryBlobStore, ModelData, PersistenceGateway, ProviderId, SaveOptions, SchemaVersion, SqliteBlobStore,
    StoreConfig, StrataError, current_version,
};
use tempfile::TempDir;

fn numbered_ids() -> CrossModelMigrator {
    let n = AtomicUsize::new(0);
    CrossModelMigrator::new().with_id_generator(move || format!("provider-{}", n.fetch_add(1, Ordering::SeqCst) + 1))
}

/// Blobs as written by an old build: nothing versioned, notes and metrics
/// still stored per project, legacy default project id in the config.
async fn seed_legacy(store: &dyn BlobStore) {
    store
        .save(
            "project",
            &json!({
                "ids": ["P1"],
                "entities": {
                    "P1": {
                        "id": "P1",
                        "title": "Work",
                        "themeColor": "indigo",
                        "issueIntegrationCfgs": {
                            "JIRA": {
                                "isEnabled": true,
                                "host": "https://jira.example.com",
                                "userName": "me"
                            }
                        }
                    }
                }
            }),
        )
        .await
        .unwrap();
    store
        .save(
            "task",
            &json!({
                "ids": ["t1", "t2"],
                "entities": {
                    "t1": {"id": "t1", "projectId": "P1", "issueType": "JIRA", "issueId": "J-1"},
                    "t2": {"id": "t2", "projectId": "P1", "issueType": "GIT", "issueId": "7"}
                },
                "currentTaskId": "t1"
            }),
        )
        .await
        .unwrap();
    store
        .save(
            "p__P1__note",
            &json!({"ids": ["n1"], "entities": {"n1": {"id": "n1", "content": "hello"}}}),
        )
        .await
        .unwrap();
    store
        .save(
            "p__DEFAULT__metric",
            &json!({"ids": ["2020-01-01"], "entities": {"2020-01-01": {"id": "2020-01-01", "mood": 3}}}),
        )
        .await
        .unwrap();
    store
        .save("globalConfig", &json!({"misc": {"defaultProjectId": "DEFAULT"}}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_legacy_data_is_migrated_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FileBlobStore::open(temp_dir.path()).unwrap());
    seed_legacy(store.as_ref()).await;

    let gw = PersistenceGateway::new(store.clone()).with_cross_model_migrator(numbered_ids());
    let snap = gw.load().await.unwrap();

    for kind in EntityKind::ALL {
        assert_eq!(snap.schema_version(kind), Some(current_version(kind)), "{kind}");
    }

    // Provider extraction and re-pointing
    let providers = snap.collection(EntityKind::IssueProvider).unwrap();
    assert_eq!(providers.ids, vec!["provider-1"]);
    let provider = providers.get("provider-1").unwrap();
    assert_eq!(provider["migratedFromProjectId"], json!("P1"));
    assert_eq!(provider["issueProviderKey"], json!("JIRA"));
    assert_eq!(provider["host"], json!("https://jira.example.com"));
    let tasks = snap.collection(EntityKind::Task).unwrap();
    assert_eq!(tasks.get("t1").unwrap()["issueProviderId"], json!("provider-1"));
    assert_eq!(tasks.extra.get("currentTaskId"), Some(&json!("t1")));

    // The GitHub link has no provider behind it
    let t2 = tasks.get("t2").unwrap();
    assert_eq!(t2["issueType"], Value::Null);
    assert_eq!(t2["issueId"], Value::Null);

    // Shards consolidated, shard blobs gone
    let notes = snap.collection(EntityKind::Note).unwrap();
    assert_eq!(notes.get("n1").unwrap()["projectId"], json!("P1"));
    assert!(snap.collection(EntityKind::Metric).unwrap().contains("2020-01-01"));
    assert_eq!(store.load("p__P1__note").await.unwrap(), None);
    assert_eq!(store.load("p__DEFAULT__metric").await.unwrap(), None);

    // Default project renamed, config filled up
    let config = snap.singleton(EntityKind::GlobalConfig).unwrap();
    assert_eq!(config["misc"]["defaultProjectId"], json!("INBOX"));
    assert!(config["sync"].is_object());

    let report = gw.last_migration_report().await;
    assert!(report.record_for("task unversioned -> v3.6").is_some());
    assert!(report.record_for("ExtractIssueProviders").is_some());
    assert_eq!(report.ambiguous.len(), 1);

    // Everything is on disk: a fresh gateway finds nothing left to do.
    let again = PersistenceGateway::new(store.clone());
    let snap2 = again.load().await.unwrap();
    assert_eq!(snap2.collection(EntityKind::Task), snap.collection(EntityKind::Task));
    assert_eq!(snap2.collection(EntityKind::IssueProvider), snap.collection(EntityKind::IssueProvider));
    assert!(again.last_migration_report().await.is_empty());
}

#[tokio::test]
async fn test_entities_missing_from_ids_are_migrated_on_load() {
    let store = Arc::new(MemoryBlobStore::new());
    store
        .save(
            "task",
            &json!({
                "ids": ["t1"],
                "entities": {
                    "t1": {"id": "t1", "title": "listed"},
                    "t9": {"id": "t9", "title": "orphan", "subTaskIds": null}
                }
            }),
        )
        .await
        .unwrap();

    let gw = PersistenceGateway::new(store.clone());
    let snap = gw.load().await.unwrap();
    let tasks = snap.collection(EntityKind::Task).unwrap();
    assert_eq!(tasks.ids, vec!["t1", "t9"]);
    assert_eq!(tasks.get("t9").unwrap()["subTaskIds"], json!([]));
    assert_eq!(tasks.get("t9").unwrap()["title"], json!("orphan"));
    assert_eq!(snap.schema_version(EntityKind::Task), Some(current_version(EntityKind::Task)));

    // Stamped data needs nothing on the next load
    let again = PersistenceGateway::new(store);
    let snap2 = again.load().await.unwrap();
    assert_eq!(snap2.collection(EntityKind::Task), Some(tasks));
    assert!(again.last_migration_report().await.is_empty());
}

#[tokio::test]
async fn test_project_ids_with_slashes_load_from_file_store() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FileBlobStore::open(temp_dir.path()).unwrap());
    store
        .save(
            "project",
            &json!({"ids": ["team/ops"], "entities": {"team/ops": {"id": "team/ops", "title": "Ops"}}}),
        )
        .await
        .unwrap();
    let shard_key = EntityKind::Note.legacy_shard_key("team/ops");
    store
        .save(&shard_key, &json!({"ids": ["n1"], "entities": {"n1": {"id": "n1"}}}))
        .await
        .unwrap();

    let gw = PersistenceGateway::new(store.clone());
    let snap = gw.load().await.unwrap();
    let notes = snap.collection(EntityKind::Note).unwrap();
    assert_eq!(notes.get("n1").unwrap()["projectId"], json!("team/ops"));
    assert_eq!(store.load(&shard_key).await.unwrap(), None);
}

#[tokio::test]
async fn test_newer_major_leaves_store_untouched() {
    let store = Arc::new(MemoryBlobStore::new());
    seed_legacy(store.as_ref()).await;
    store
        .save("p__P1__obstruction", &json!({"ids": [], "entities": {}, "__v": 5}))
        .await
        .unwrap();

    let mut before = Vec::new();
    for key in store.keys().await.unwrap() {
        before.push((key.clone(), store.load(&key).await.unwrap()));
    }

    let gw = PersistenceGateway::new(store.clone());
    let err = gw.load().await.unwrap_err();
    match err {
        StrataError::MigrationVersionTooNew { kind, loaded, .. } => {
            assert_eq!(kind, EntityKind::Obstruction);
            assert_eq!(loaded, SchemaVersion::new(5.0));
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut after = Vec::new();
    for key in store.keys().await.unwrap() {
        after.push((key.clone(), store.load(&key).await.unwrap()));
    }
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_concurrent_saves_fail_while_import_lock_held() {
    let store = Arc::new(MemoryBlobStore::new());
    let gw = Arc::new(PersistenceGateway::new(store));
    gw.load().await.unwrap();

    let guard = gw.begin_import().unwrap();
    let mut handles = Vec::new();
    for i in 0..8 {
        let gw = Arc::clone(&gw);
        handles.push(tokio::spawn(async move {
            let mut tags = EntityCollection::new();
            tags.upsert(format!("tag-{i}"), json!({"id": format!("tag-{i}")}));
            gw.save(EntityKind::Tag, ModelData::Collection(tags), SaveOptions::default())
                .await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(StrataError::ImportInProgress(EntityKind::Tag))));
    }
    assert!(matches!(gw.begin_import(), Err(StrataError::ImportAlreadyRunning)));
    drop(guard);

    gw.save(EntityKind::Tag, ModelData::Collection(EntityCollection::new()), SaveOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stamped_versions_never_decrease() {
    let store = Arc::new(MemoryBlobStore::new());
    let gw = PersistenceGateway::new(store.clone());
    gw.load().await.unwrap();

    let stamps = [0.5, 3.6, 1.0, 3.9, 2.0, 3.7];
    let mut highest = current_version(EntityKind::Task);
    for stamp in stamps {
        let tasks = EntityCollection::stamped(SchemaVersion::new(stamp));
        gw.save(EntityKind::Task, ModelData::Collection(tasks), SaveOptions::default())
            .await
            .unwrap();
        let stored = store.load("task").await.unwrap().unwrap();
        let stored = SchemaVersion::from_json(&stored["__v"]).unwrap();
        assert!(stored >= highest, "{stored} < {highest}");
        highest = stored;
    }
    assert_eq!(highest, SchemaVersion::new(3.9));
}

#[tokio::test]
async fn test_import_replaces_data_and_keeps_backup() {
    let store = Arc::new(MemoryBlobStore::new());
    let gw = PersistenceGateway::new(store.clone());
    gw.load().await.unwrap();
    let mut tags = EntityCollection::new();
    tags.upsert("old", json!({"id": "old"}));
    gw.save(EntityKind::Tag, ModelData::Collection(tags), SaveOptions::default())
        .await
        .unwrap();

    let incoming = AppSnapshot::from_json(json!({
        "tag": {"ids": ["new"], "entities": {"new": {"id": "new"}}, "__v": 1},
        "task": {"ids": ["t"], "entities": {"t": {"id": "t", "issueType": "GIT"}}, "__v": 1},
        "lastActiveTime": 42
    }))
    .unwrap();
    let before = gw.last_local_change().await;
    let imported = gw.import_complete(incoming).await.unwrap();
    assert!(imported.changed_at > before);
    assert_eq!(gw.last_local_change().await, imported.changed_at);
    let snap = imported.snapshot;

    assert!(snap.collection(EntityKind::Tag).unwrap().contains("new"));
    // Imported data goes through the same migrations as loaded data
    assert_eq!(
        snap.collection(EntityKind::Task).unwrap().get("t").unwrap()["issueType"],
        Value::Null
    );
    assert_eq!(snap.schema_version(EntityKind::Task), Some(current_version(EntityKind::Task)));
    assert!(!gw.is_import_in_progress());

    let backup = gw.load_backup().await.unwrap().unwrap();
    assert!(backup.collection(EntityKind::Tag).unwrap().contains("old"));
    gw.clear_backup().await.unwrap();
    assert!(gw.load_backup().await.unwrap().is_none());
}

#[tokio::test]
async fn test_import_of_newer_major_is_refused() {
    let store = Arc::new(MemoryBlobStore::new());
    let gw = PersistenceGateway::new(store.clone());
    let before = gw.load().await.unwrap();

    let incoming = AppSnapshot::from_json(json!({
        "project": {"ids": [], "entities": {}, "__v": 8.0}
    }))
    .unwrap();
    let err = gw.import_complete(incoming).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(gw.snapshot().await.unwrap(), before);
    assert!(gw.load_backup().await.unwrap().is_none());
}

#[tokio::test]
async fn test_import_with_broken_links_is_refused() {
    let store = Arc::new(MemoryBlobStore::new());
    let gw = PersistenceGateway::new(store.clone());
    let before = gw.load().await.unwrap();

    let incoming = AppSnapshot::from_json(json!({
        "project": {
            "ids": ["P1"],
            "entities": {"P1": {"id": "P1", "title": "Work", "taskIds": ["gone"]}}
        }
    }))
    .unwrap();
    let err = gw.import_complete(incoming).await.unwrap_err();
    assert!(matches!(
        err,
        StrataError::Integrity(IntegrityError::MissingTask { owner_kind: EntityKind::Project, .. })
    ));
    assert_eq!(gw.snapshot().await.unwrap(), before);
    assert!(gw.load_backup().await.unwrap().is_none());
    assert!(!gw.is_import_in_progress());
}

#[tokio::test]
async fn test_reset_keeps_provider_registrations() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteBlobStore::open(&temp_dir.path().join("strata.db")).unwrap());
    let gw = PersistenceGateway::new(store.clone());
    gw.load().await.unwrap();
    gw.register_provider("dropbox".into()).await.unwrap();
    let mut tags = EntityCollection::new();
    tags.upsert("a", json!({"id": "a"}));
    gw.save(EntityKind::Tag, ModelData::Collection(tags), SaveOptions::default())
        .await
        .unwrap();
    let touched = gw.sync_clock(&"dropbox".into()).await.unwrap().local_changed_at;

    let snap = gw.reset_all().await.unwrap();
    assert!(snap.collection(EntityKind::Tag).unwrap().is_empty());
    assert_eq!(gw.provider_ids().await, vec![ProviderId::new("dropbox")]);
    assert!(gw.sync_clock(&"dropbox".into()).await.unwrap().local_changed_at > touched);

    // Clocks survive a restart
    let reopened = PersistenceGateway::new(store);
    reopened.load().await.unwrap();
    assert_eq!(reopened.provider_ids().await, vec![ProviderId::new("dropbox")]);
}

#[tokio::test]
async fn test_open_uses_store_config() {
    let temp_dir = TempDir::new().unwrap();
    StoreConfig::File { dir: "data".into() }.save(temp_dir.path()).unwrap();
    let gw = PersistenceGateway::open(temp_dir.path()).unwrap();
    gw.load().await.unwrap();
    assert!(temp_dir.path().join("data").join("task.json").exists());
}
