use super::*;
use crate::storage::{AuthSession, Database, KvStore, SessionStore};
use crate::sync::backoff::Backoff;
use serde_json::{Value, json};
use std::time::Duration;
use storysync_core::AuthClient;
use tempfile::TempDir;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn at(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
}

fn stamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap()
}

fn remote_json(id: &str, updated_at: OffsetDateTime, data: Value) -> Value {
    json!({ "id": id, "updated_at": stamp(updated_at), "data": data })
}

fn session(access: &str) -> AuthSession {
    AuthSession {
        access_token: access.into(),
        refresh_token: Some("refresh-1".into()),
        expires_at: None,
    }
}

async fn make_engine_with(
    server: &MockServer,
    session: Option<AuthSession>,
    max_retries: u32,
) -> (SyncEngine, TempDir) {
    let db = Database::open_in_memory().await.unwrap();
    let kv = KvStore::new(&db);
    let sessions = SessionStore::new(kv.clone());
    if let Some(session) = session {
        sessions.save(&session).await.unwrap();
    }
    let auth = AuthClient::with_base_url(&server.uri(), "client-id").unwrap();
    let tokens = TokenProvider::load(sessions, Some(auth)).await.unwrap();
    let queue = DurableQueue::open(kv)
        .await
        .unwrap()
        .with_max_retries(max_retries)
        .with_backoff(Backoff::new(
            Duration::from_secs(2),
            Duration::from_secs(300),
            false,
        ));
    let client = StoryClient::with_base_url(&server.uri(), "").unwrap();
    let dir = tempfile::tempdir().unwrap();
    let engine = SyncEngine::new(
        client,
        CacheStore::new(&db),
        queue,
        tokens,
        MediaStore::new(dir.path()),
    );
    (engine, dir)
}

async fn make_engine(server: &MockServer) -> (SyncEngine, TempDir) {
    make_engine_with(server, Some(session("test-token")), 5).await
}

fn synced_story(local_id: &str, server_id: &str, payload: Value) -> SyncableEntity {
    let mut story = SyncableEntity::new(EntityType::Story, payload, at(0)).with_local_id(local_id);
    story.server_id = Some(server_id.into());
    story.sync_status = SyncStatus::Synced;
    story.last_synced_at = Some(at(0));
    story.server_updated_at = Some(at(0));
    story
}

#[tokio::test]
async fn creates_hero_then_story_with_parent_server_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/heroes"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(remote_json("srv-h1", at(10), json!({ "name": "Mila" }))),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/stories"))
        .and(body_partial_json(json!({ "parent_id": "srv-h1" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(remote_json("srv-s1", at(11), json!({ "title": "Night" }))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (engine, _dir) = make_engine(&server).await;
    let mut story = SyncableEntity::new(EntityType::Story, json!({ "title": "Night" }), at(1))
        .with_local_id("s1")
        .with_parent("h1");
    let mut hero =
        SyncableEntity::new(EntityType::Hero, json!({ "name": "Mila" }), at(0)).with_local_id("h1");
    // Enqueued story first; priority still drains the hero first.
    engine
        .track_change(&mut story, OperationType::Create, Priority::Medium)
        .await
        .unwrap();
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.applied, 2);
    assert!(engine.queue().is_empty().await);
    let story = engine.cache().fetch(EntityType::Story, "s1").await.unwrap().unwrap();
    assert_eq!(story.server_id.as_deref(), Some("srv-s1"));
    assert_eq!(story.sync_status, SyncStatus::Synced);
    assert!(story.pending_changes.is_none());
    assert!(story.last_synced_at.unwrap() >= story.server_updated_at.unwrap());
}

#[tokio::test]
async fn story_waits_for_unsynced_hero() {
    let server = MockServer::start().await;
    let (engine, _dir) = make_engine(&server).await;
    let hero = SyncableEntity::new(EntityType::Hero, json!({}), at(0)).with_local_id("h1");
    engine.cache().save(&hero).await.unwrap();
    let mut story = SyncableEntity::new(EntityType::Story, json!({}), at(0))
        .with_local_id("s1")
        .with_parent("h1");
    engine
        .track_change(&mut story, OperationType::Create, Priority::Medium)
        .await
        .unwrap();

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.retry_scheduled, 1);
    let ops = engine.queue().operations().await;
    assert_eq!(ops[0].attempt_count, 1);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_failure_honours_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/heroes"))
        .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "120"))
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    let mut hero = SyncableEntity::new(EntityType::Hero, json!({}), at(0)).with_local_id("h1");
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();

    let before = clock::now();
    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.retry_scheduled, 1);
    let op = &engine.queue().operations().await[0];
    assert_eq!(op.attempt_count, 1);
    assert!(op.retry_at.unwrap() >= before + Duration::from_secs(119));
    let hero = engine.cache().fetch(EntityType::Hero, "h1").await.unwrap().unwrap();
    assert_eq!(hero.sync_status, SyncStatus::Pending);

    // Not ready yet, so a second run does nothing.
    let report = engine.sync_all().await.unwrap();
    assert_eq!(report.attempted, 0);
}

#[tokio::test]
async fn validation_failure_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/custom-events"))
        .respond_with(ResponseTemplate::new(422).set_body_string("title is required"))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    let mut event =
        SyncableEntity::new(EntityType::CustomEvent, json!({}), at(0)).with_local_id("e1");
    engine
        .track_change(&mut event, OperationType::Create, Priority::Low)
        .await
        .unwrap();

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.failed, 1);
    let failed = engine.queue().failed_operations().await;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap().contains("title is required"));
    assert_eq!(engine.queue().statistics().await.exhausted, 1);
    let event = engine
        .cache()
        .fetch(EntityType::CustomEvent, "e1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.sync_status, SyncStatus::Error);
    assert!(event.sync_error.unwrap().contains("title is required"));

    // Not retried on its own.
    assert_eq!(engine.sync_all().await.unwrap().attempted, 0);
    assert_eq!(engine.queue().clear_failed_operations().await.unwrap(), 1);
    assert!(engine.queue().is_empty().await);
}

#[tokio::test]
async fn corrected_entity_is_retried_after_validation_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/custom-events"))
        .and(body_partial_json(json!({ "data": { "title": "Feast" } })))
        .respond_with(ResponseTemplate::new(201).set_body_json(remote_json(
            "srv-e1",
            at(10),
            json!({ "title": "Feast" }),
        )))
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/custom-events"))
        .respond_with(ResponseTemplate::new(422).set_body_string("title is required"))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    let mut event =
        SyncableEntity::new(EntityType::CustomEvent, json!({}), at(0)).with_local_id("e1");
    engine
        .track_change(&mut event, OperationType::Create, Priority::Low)
        .await
        .unwrap();
    assert_eq!(engine.sync_all().await.unwrap().failed, 1);

    let mut event = engine
        .cache()
        .fetch(EntityType::CustomEvent, "e1")
        .await
        .unwrap()
        .unwrap();
    event.record_local_edit(json!({ "title": "Feast" }), at(5));
    assert!(
        engine
            .track_change(&mut event, OperationType::Create, Priority::Low)
            .await
            .unwrap()
    );
    assert_eq!(engine.queue().len().await, 1);

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.applied, 1);
    assert!(engine.queue().is_empty().await);
    let event = engine
        .cache()
        .fetch(EntityType::CustomEvent, "e1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.sync_status, SyncStatus::Synced);
    assert_eq!(event.server_id.as_deref(), Some("srv-e1"));
}

#[tokio::test]
async fn exhausted_operation_marks_entity_error_and_stays_queued() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/heroes"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine_with(&server, Some(session("test-token")), 1).await;
    let mut hero = SyncableEntity::new(EntityType::Hero, json!({}), at(0)).with_local_id("h1");
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(engine.queue().failed_operations().await.len(), 1);
    let hero = engine.cache().fetch(EntityType::Hero, "h1").await.unwrap().unwrap();
    assert_eq!(hero.sync_status, SyncStatus::Error);
}

#[tokio::test]
async fn unauthorized_refreshes_token_and_retries_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-token",
            "token_type": "bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/heroes"))
        .and(header("authorization", "Bearer old-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/heroes"))
        .and(header("authorization", "Bearer new-token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(remote_json(
            "srv-h1",
            at(10),
            json!({}),
        )))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine_with(&server, Some(session("old-token")), 5).await;
    let mut hero = SyncableEntity::new(EntityType::Hero, json!({}), at(0)).with_local_id("h1");
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.applied, 1);
    assert!(engine.is_authenticated().await);
}

#[tokio::test]
async fn repeated_unauthorized_signs_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-token",
            "token_type": "bearer"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/heroes"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    let mut hero = SyncableEntity::new(EntityType::Hero, json!({}), at(0)).with_local_id("h1");
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();

    let err = engine.sync_all().await.unwrap_err();

    assert!(matches!(err, EngineError::SessionExpired));
    assert!(!engine.is_authenticated().await);
    let ops = engine.queue().operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].attempt_count, 0);
    assert_eq!(engine.phase(), SyncPhase::Idle);
    assert!(!engine.is_in_flight());
}

#[tokio::test]
async fn rejected_refresh_token_signs_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/heroes"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    let mut hero = SyncableEntity::new(EntityType::Hero, json!({}), at(0)).with_local_id("h1");
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();

    let err = engine.sync_all().await.unwrap_err();

    assert!(err.is_auth_required());
    assert!(!engine.is_authenticated().await);
}

#[tokio::test]
async fn sync_without_session_requires_authentication() {
    let server = MockServer::start().await;
    let (engine, _dir) = make_engine_with(&server, None, 5).await;

    // Nothing queued: nothing to authenticate for.
    assert_eq!(engine.sync_all().await.unwrap(), SyncReport::default());

    let mut hero = SyncableEntity::new(EntityType::Hero, json!({}), at(0)).with_local_id("h1");
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();
    let err = engine.sync_all().await.unwrap_err();
    assert!(matches!(err, EngineError::NotAuthenticated));
}

async fn mount_conflict(server: &MockServer, current: Value) {
    Mock::given(method("PUT"))
        .and(path("/v1/stories/srv-s1"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "current": current })))
        .mount(server)
        .await;
}

async fn queue_story_edit(engine: &SyncEngine, payload: Value, edited_at: i64) {
    let mut story = synced_story("s1", "srv-s1", json!({ "title": "A", "body": "x" }));
    story.record_local_edit(payload, at(edited_at));
    engine
        .track_change(&mut story, OperationType::Update, Priority::Medium)
        .await
        .unwrap();
}

#[tokio::test]
async fn update_sends_expected_timestamp() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/stories/srv-s1"))
        .and(body_partial_json(json!({ "expected_updated_at": stamp(at(0)) })))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_json(
            "srv-s1",
            at(30),
            json!({ "title": "B", "body": "x" }),
        )))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    queue_story_edit(&engine, json!({ "title": "B", "body": "x" }), 20).await;

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.applied, 1);
    let story = engine.cache().fetch(EntityType::Story, "s1").await.unwrap().unwrap();
    assert_eq!(story.sync_status, SyncStatus::Synced);
    assert_eq!(story.server_updated_at, Some(at(30)));
}

#[tokio::test]
async fn edit_made_during_update_is_pushed_by_next_run() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/stories/srv-s1"))
        .and(body_partial_json(json!({ "data": { "title": "B" } })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(remote_json(
                    "srv-s1",
                    at(30),
                    json!({ "title": "B", "body": "x" }),
                ))
                .set_delay(Duration::from_millis(400)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/stories/srv-s1"))
        .and(body_partial_json(json!({
            "data": { "title": "C" },
            "expected_updated_at": stamp(at(30))
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_json(
            "srv-s1",
            at(40),
            json!({ "title": "C", "body": "x" }),
        )))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    queue_story_edit(&engine, json!({ "title": "B", "body": "x" }), 20).await;

    let edit = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut story = engine
            .cache()
            .fetch(EntityType::Story, "s1")
            .await
            .unwrap()
            .unwrap();
        story.record_local_edit(json!({ "title": "C", "body": "x" }), at(25));
        engine
            .track_change(&mut story, OperationType::Update, Priority::Medium)
            .await
            .unwrap()
    };
    let (report, enqueued) = tokio::join!(engine.sync_all(), edit);

    assert_eq!(report.unwrap().applied, 1);
    // The update in flight already covered the tuple.
    assert!(!enqueued);
    let story = engine.cache().fetch(EntityType::Story, "s1").await.unwrap().unwrap();
    assert_eq!(story.sync_status, SyncStatus::Pending);
    assert_eq!(story.payload, json!({ "title": "C", "body": "x" }));
    assert_eq!(story.server_updated_at, Some(at(30)));
    assert_eq!(engine.queue().len().await, 1);

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.attempted, 1);
    assert_eq!(report.applied, 1);
    assert!(engine.queue().is_empty().await);
    let story = engine.cache().fetch(EntityType::Story, "s1").await.unwrap().unwrap();
    assert_eq!(story.sync_status, SyncStatus::Synced);
    assert_eq!(story.payload, json!({ "title": "C", "body": "x" }));
    assert_eq!(story.server_updated_at, Some(at(40)));
}

#[tokio::test]
async fn stale_copy_edited_after_create_keeps_server_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/heroes"))
        .and(header("idempotency-key", "h1"))
        .respond_with(ResponseTemplate::new(201).set_body_json(remote_json(
            "srv-h1",
            at(10),
            json!({ "name": "Mila" }),
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/heroes/srv-h1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_json(
            "srv-h1",
            at(20),
            json!({ "name": "Mira" }),
        )))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    let mut hero = SyncableEntity::new(EntityType::Hero, json!({ "name": "Mila" }), at(0))
        .with_local_id("h1");
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();
    assert_eq!(engine.sync_all().await.unwrap().applied, 1);

    // `hero` was read before the create landed.
    hero.record_local_edit(json!({ "name": "Mira" }), at(15));
    engine
        .track_change(&mut hero, OperationType::Update, Priority::High)
        .await
        .unwrap();
    assert_eq!(hero.server_id.as_deref(), Some("srv-h1"));

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.applied, 1);
    let stored = engine.cache().fetch(EntityType::Hero, "h1").await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Synced);
    assert_eq!(stored.payload, json!({ "name": "Mira" }));
}

#[tokio::test]
async fn conflict_with_older_remote_write_force_pushes_local() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/stories/srv-s1"))
        .and(query_param("force", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_json(
            "srv-s1",
            at(120),
            json!({ "title": "B", "body": "x" }),
        )))
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_conflict(
        &server,
        remote_json("srv-s1", at(50), json!({ "title": "C", "body": "x" })),
    )
    .await;
    let (engine, _dir) = make_engine(&server).await;
    queue_story_edit(&engine, json!({ "title": "B", "body": "x" }), 100).await;

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.applied, 1);
    let story = engine.cache().fetch(EntityType::Story, "s1").await.unwrap().unwrap();
    assert_eq!(story.payload, json!({ "title": "B", "body": "x" }));
    assert_eq!(story.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn conflict_with_newer_remote_write_accepts_remote() {
    let server = MockServer::start().await;
    mount_conflict(
        &server,
        remote_json("srv-s1", at(200), json!({ "title": "C", "body": "x" })),
    )
    .await;
    let (engine, _dir) = make_engine(&server).await;
    queue_story_edit(&engine, json!({ "title": "B", "body": "x" }), 100).await;

    engine.sync_all().await.unwrap();

    let story = engine.cache().fetch(EntityType::Story, "s1").await.unwrap().unwrap();
    assert_eq!(story.payload, json!({ "title": "C", "body": "x" }));
    assert_eq!(story.sync_status, SyncStatus::Synced);
    assert!(engine.queue().is_empty().await);
}

#[tokio::test]
async fn conflict_on_disjoint_fields_pushes_merged_payload() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/stories/srv-s1"))
        .and(query_param("force", "true"))
        .and(body_partial_json(json!({ "data": { "title": "B", "body": "y" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_json(
            "srv-s1",
            at(60),
            json!({ "title": "B", "body": "y" }),
        )))
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_conflict(
        &server,
        remote_json("srv-s1", at(50), json!({ "title": "A", "body": "y" })),
    )
    .await;
    let (engine, _dir) = make_engine(&server).await;
    queue_story_edit(&engine, json!({ "title": "B", "body": "x" }), 100).await;

    engine.sync_all().await.unwrap();

    let story = engine.cache().fetch(EntityType::Story, "s1").await.unwrap().unwrap();
    assert_eq!(story.payload, json!({ "title": "B", "body": "y" }));
    assert_eq!(story.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn simultaneous_conflict_is_left_for_manual_resolution() {
    let server = MockServer::start().await;
    mount_conflict(
        &server,
        remote_json("srv-s1", at(100), json!({ "title": "C", "body": "x" })),
    )
    .await;
    let (engine, _dir) = make_engine(&server).await;
    queue_story_edit(&engine, json!({ "title": "B", "body": "x" }), 100).await;

    let report = engine.sync_all().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert!(engine.queue().is_empty().await);
    let story = engine.cache().fetch(EntityType::Story, "s1").await.unwrap().unwrap();
    assert_eq!(story.sync_status, SyncStatus::Conflict);
    assert_eq!(story.payload, json!({ "title": "B", "body": "x" }));
}

#[tokio::test]
async fn update_of_remotely_deleted_entity_removes_local_copy() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/stories/srv-s1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    queue_story_edit(&engine, json!({ "title": "B", "body": "x" }), 10).await;

    engine.sync_all().await.unwrap();

    assert!(engine.cache().fetch(EntityType::Story, "s1").await.unwrap().is_none());
    assert!(engine.queue().is_empty().await);
}

#[tokio::test]
async fn delete_uses_server_id_captured_at_enqueue() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/stories/srv-s1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    let story = synced_story("s1", "srv-s1", json!({}));
    engine.cache().save(&story).await.unwrap();

    assert!(engine.track_delete(&story, Priority::Medium).await.unwrap());
    assert!(engine.cache().fetch(EntityType::Story, "s1").await.unwrap().is_none());

    let report = engine.sync_all().await.unwrap();
    assert_eq!(report.applied, 1);
    assert!(engine.queue().is_empty().await);
}

#[tokio::test]
async fn deleting_never_uploaded_entity_queues_nothing() {
    let server = MockServer::start().await;
    let (engine, _dir) = make_engine(&server).await;
    let mut hero = SyncableEntity::new(EntityType::Hero, json!({}), at(0)).with_local_id("h1");
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();

    assert!(!engine.track_delete(&hero, Priority::High).await.unwrap());
    assert!(engine.queue().is_empty().await);
}

#[tokio::test]
async fn concurrent_sync_all_runs_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/heroes"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(remote_json("srv-h1", at(10), json!({})))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let (engine, _dir) = make_engine(&server).await;
    let mut hero = SyncableEntity::new(EntityType::Hero, json!({}), at(0)).with_local_id("h1");
    engine
        .track_change(&mut hero, OperationType::Create, Priority::High)
        .await
        .unwrap();

    let (first, second) = tokio::join!(engine.sync_all(), engine.sync_all());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(first.skipped != second.skipped);
    assert_eq!(first.applied + second.applied, 1);
    assert!(!engine.is_in_flight());
    assert_eq!(engine.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn downloads_media_through_signed_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/media/download-link"))
        .and(query_param("key", "audio/ch1.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": format!("{}/blob/ch1", server.uri()),
            "method": "GET"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/blob/ch1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"mp3"))
        .mount(&server)
        .await;
    let (engine, dir) = make_engine(&server).await;
    engine.ensure_token().await.unwrap();

    let target = engine.download_media("audio/ch1.mp3").await.unwrap();

    assert_eq!(target, dir.path().join("audio/ch1.mp3"));
    assert_eq!(std::fs::read(target).unwrap(), b"mp3");
}
