//! Storage Port contract, run against every backend

mod helpers;

use helpers::*;
use recflow_engine::storage::{MemoryStorage, SqliteStorage, Storage};
use recflow_engine::types::Classification;
use recflow_engine::{EngineConfig, Entity, EntityWrite, PipelineEngine, Relation, RelationWrite, User};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

async fn sqlite_storage(dir: &TempDir) -> SqliteStorage {
    SqliteStorage::open(&dir.path().join("nested").join("recflow.db"))
        .await
        .expect("Failed to open test database")
}

async fn exercise_contract(storage: &dyn Storage) {
    // Entities: missing, insert, replace, scoped by type
    assert_eq!(storage.get_entity(SONG, "s1").await.unwrap(), None);

    let mut entity = Entity::unprocessed("s1", json!({"plays": 1, "title": "One"}));
    entity.features.insert("plays".to_string(), json!(1));
    storage.put_entity(SONG, &entity).await.unwrap();
    assert_eq!(storage.get_entity(SONG, "s1").await.unwrap(), Some(entity.clone()));

    entity.classification = Classification::from([("relevance".to_string(), 0.25)]);
    storage.put_entity(SONG, &entity).await.unwrap();
    assert_eq!(storage.get_entity(SONG, "s1").await.unwrap(), Some(entity.clone()));
    assert_eq!(storage.get_entity("video", "s1").await.unwrap(), None);

    // Users
    assert_eq!(storage.get_user(SONG, "u1").await.unwrap(), None);
    let user = User {
        id: "u1".to_string(),
        features: json!({"plays": 3}).as_object().cloned().unwrap(),
    };
    storage.put_user(SONG, &user).await.unwrap();
    assert_eq!(storage.get_user(SONG, "u1").await.unwrap(), Some(user));

    // Relations: one per pair, listing sorted by user id
    for user_id in ["u2", "u1", "u3"] {
        storage
            .put_relation(
                SONG,
                &Relation {
                    entity_id: "s1".to_string(),
                    user_id: user_id.to_string(),
                    data: json!({"plays": 1}),
                },
            )
            .await
            .unwrap();
    }
    storage
        .put_relation(
            SONG,
            &Relation {
                entity_id: "s1".to_string(),
                user_id: "u1".to_string(),
                data: json!({"plays": 9}),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        storage.list_users_related_to(SONG, "s1").await.unwrap(),
        vec!["u1", "u2", "u3"]
    );
    assert!(storage.list_users_related_to(SONG, "s2").await.unwrap().is_empty());
    assert!(storage.list_users_related_to("video", "s1").await.unwrap().is_empty());

    let relation = storage.get_relation(SONG, "s1", "u1").await.unwrap().unwrap();
    assert_eq!(relation.data, json!({"plays": 9}));
    assert_eq!(storage.get_relation(SONG, "s1", "u9").await.unwrap(), None);

    // Scores
    assert_eq!(
        storage.get_user_entity_classification(SONG, "s1", "u1").await.unwrap(),
        None
    );
    storage
        .put_user_entity_classification(SONG, "s1", "u1", 0.5)
        .await
        .unwrap();
    storage
        .put_user_entity_classification(SONG, "s1", "u1", 0.75)
        .await
        .unwrap();
    assert_eq!(
        storage.get_user_entity_classification(SONG, "s1", "u1").await.unwrap(),
        Some(0.75)
    );
}

#[tokio::test]
async fn test_memory_backend_contract() {
    exercise_contract(&MemoryStorage::new()).await;
}

#[tokio::test]
async fn test_sqlite_backend_contract() {
    let dir = TempDir::new().unwrap();
    exercise_contract(&sqlite_storage(&dir).await).await;
}

#[tokio::test]
async fn test_sqlite_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let storage = sqlite_storage(&dir).await;
        storage
            .put_entity(SONG, &Entity::unprocessed("s1", json!({"plays": 2})))
            .await
            .unwrap();
        storage.pool().close().await;
    }

    let reopened = sqlite_storage(&dir).await;
    let entity = reopened.get_entity(SONG, "s1").await.unwrap().unwrap();
    assert_eq!(entity.data, json!({"plays": 2}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_over_sqlite() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::new();
    let storage = Arc::new(sqlite_storage(&dir).await);
    let engine = Arc::new(PipelineEngine::new(
        storage,
        song_registry(&recorder),
        EngineConfig::default(),
    ));

    engine
        .write_entity(SONG, EntityWrite::new("s1", song(10)))
        .await
        .unwrap();

    let mut join_set = tokio::task::JoinSet::new();
    for user in ["u1", "u2", "u3", "u4"] {
        let engine = Arc::clone(&engine);
        join_set.spawn(async move {
            engine
                .write_relation(SONG, RelationWrite::new("s1", user, plays(user, 5)))
                .await
        });
    }
    while let Some(result) = join_set.join_next().await {
        result.expect("Task panicked").unwrap();
    }

    engine
        .write_entity(SONG, EntityWrite::new("s1", song(20)))
        .await
        .unwrap();

    for user in ["u1", "u2", "u3", "u4"] {
        assert_eq!(
            engine.user_entity_score(SONG, "s1", user).await.unwrap(),
            Some(10.0),
            "user {} was not refreshed",
            user
        );
    }
    let stored = engine.entity(SONG, "s1").await.unwrap().unwrap();
    assert_eq!(stored.classification.get("relevance"), Some(&20.0));
}
