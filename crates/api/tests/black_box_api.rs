use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::json;

use synctrack_api::app::{self, services::{self, AppServices}};
use synctrack_api::settings::Settings;
use synctrack_core::{
    Changeset, ChangesetId, Entity, EntityAction, EntityId, EntityStatus, File, FileId,
    FileStatus, GeometryType, SyncId, SyncRun, SyncStatus,
};
use synctrack_infra::IsolationLevel;
use synctrack_infra::jobs::WorkerHandle;
use synctrack_infra::store::{
    ChangesetStore, EntityStore, FileStore, InMemoryDatabase, SyncStore, TransactionSource,
    UnitOfWork,
};

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    workers: Vec<WorkerHandle>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over in-memory storage, bound to an ephemeral port.
        let mut settings = Settings::defaults();
        settings.database_url = None;
        settings.redis_url = None;
        settings.poll_interval_ms = 10;

        let services = Arc::new(services::build_services(&settings).await.unwrap());
        let workers = services.spawn_workers();
        let app = app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            workers,
            handle,
        }
    }

    fn db(&self) -> &InMemoryDatabase {
        self.services.in_memory_database().unwrap()
    }

    async fn stop(self) {
        self.handle.abort();
        self.services.shutdown(self.workers).await;
    }
}

fn sync_row(status: SyncStatus, total_files: i32) -> SyncRun {
    SyncRun {
        id: SyncId::new(),
        layer_id: 3,
        geometry_type: GeometryType::Line,
        dump_date: Utc::now(),
        start_date: Utc::now(),
        end_date: None,
        status,
        total_files: Some(total_files),
        is_full: true,
        base_sync_id: None,
        run_number: 0,
        metadata: None,
    }
}

fn file_row(sync_id: SyncId, total_entities: i32) -> File {
    File {
        file_id: FileId::new(),
        sync_id,
        status: FileStatus::InProgress,
        total_entities: Some(total_entities),
        start_date: Utc::now(),
        end_date: None,
    }
}

fn entity(id: &str, file_id: FileId, changeset_id: Option<ChangesetId>, status: EntityStatus) -> Entity {
    Entity {
        entity_id: EntityId::new(id),
        file_id,
        changeset_id,
        status,
        action: EntityAction::Modify,
        fail_reason: None,
    }
}

async fn wait_for_status(db: &InMemoryDatabase, sync_id: SyncId, status: SyncStatus) -> SyncRun {
    // Workers run asynchronously; poll until the cascade reaches the sync.
    for _ in 0..200 {
        let sync = db.sync_row(sync_id).await.unwrap();
        if sync.status == status {
            return sync;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sync {sync_id} never reached {status}");
}

#[tokio::test]
async fn health_and_metrics_are_served() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(format!("{}/metrics", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    let lanes = body["lanes"].as_array().unwrap();
    assert_eq!(lanes.len(), 3);
    assert_eq!(lanes[0]["lane"], "changesets");

    srv.stop().await;
}

#[tokio::test]
async fn closure_triggers_validate_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/file/closure", srv.base_url))
        .json(&json!({ "ids": ["not-a-uuid"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!("{}/sync/closure", srv.base_url))
        .json(&json!({ "ids": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let id = SyncId::new().to_string();
    let res = client
        .post(format!("{}/sync/closure", srv.base_url))
        .json(&json!({ "ids": [id] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["lane"], "syncs");
    assert_eq!(body["enqueued"], json!([id]));

    // Other spellings of the same uuid share the canonical job id.
    let res = client
        .post(format!("{}/sync/closure", srv.base_url))
        .json(&json!({ "ids": [format!("{{{}}}", id.to_uppercase())] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    // Queued again or coalesced, depending on whether the worker got there first.
    let mut job_ids: Vec<serde_json::Value> = body["enqueued"].as_array().unwrap().clone();
    job_ids.extend(body["deduplicated"].as_array().unwrap().iter().cloned());
    assert_eq!(job_ids, vec![json!(id)]);

    srv.stop().await;
}

#[tokio::test]
async fn changeset_trigger_cascades_to_sync_completion() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let sync = sync_row(SyncStatus::InProgress, 1);
    let file = file_row(sync.id, 2);
    let changeset = Changeset {
        changeset_id: ChangesetId::new(),
        osm_id: Some(42),
    };
    let mut uow = srv.db().begin(IsolationLevel::Serializable).await.unwrap();
    uow.insert_sync(&sync).await.unwrap();
    uow.insert_file(&file).await.unwrap();
    uow.insert_changeset(&changeset).await.unwrap();
    uow.insert_entities(&[
        entity("way/1", file.file_id, Some(changeset.changeset_id), EntityStatus::InProgress),
        entity("way/2", file.file_id, None, EntityStatus::NotSynced),
    ])
    .await
    .unwrap();
    uow.commit().await.unwrap();

    let res = client
        .post(format!("{}/changeset/closure", srv.base_url))
        .json(&json!({ "ids": [changeset.changeset_id.to_string()] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let closed = wait_for_status(srv.db(), sync.id, SyncStatus::Completed).await;
    assert!(closed.end_date.is_some());
    assert_eq!(
        srv.db().file_row(file.file_id).await.unwrap().status,
        FileStatus::Completed
    );

    srv.stop().await;
}

#[tokio::test]
async fn rerun_endpoint_maps_outcomes_to_status_codes() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/sync/{}/rerun", srv.base_url, SyncId::new()))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let base = sync_row(SyncStatus::Failed, 1);
    let file = file_row(base.id, 1);

    let res = client
        .post(format!("{}/sync/{}/rerun", srv.base_url, base.id))
        .header("content-type", "application/json")
        .body("{\"id\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let mut uow = srv.db().begin(IsolationLevel::Serializable).await.unwrap();
    uow.insert_sync(&base).await.unwrap();
    uow.insert_file(&file).await.unwrap();
    uow.insert_entities(&[entity("node/7", file.file_id, None, EntityStatus::Failed)])
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let rerun_id = SyncId::new();
    let res = client
        .post(format!("{}/sync/{}/rerun", srv.base_url, base.id))
        .json(&json!({ "id": rerun_id.to_string(), "metadata": { "reason": "timeout" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["created"], true);
    assert_eq!(body["sync"]["run_number"], 1);
    assert_eq!(body["sync"]["base_sync_id"], base.id.to_string());

    // A second rerun while the first is in progress conflicts.
    let res = client
        .post(format!("{}/sync/{}/rerun", srv.base_url, base.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "conflict");

    srv.stop().await;
}
