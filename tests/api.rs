//! HTTP API tests driven through the router in-process.
//!
//! Uses `tower::ServiceExt::oneshot` against `build_router`, with the same
//! fake collaborators as the pipeline tests behind the queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use clausebase::config::Config;
use clausebase::db::connect_path;
use clausebase::embedding::EmbeddingGenerator;
use clausebase::error::PipelineError;
use clausebase::events::EventBus;
use clausebase::extract::TextExtractor;
use clausebase::metadata::{ContractFields, MetadataExtractor};
use clausebase::migrate::run_migrations;
use clausebase::models::Chunk;
use clausebase::queue::{PipelineDeps, ProcessingQueue};
use clausebase::server::{build_router, AppState};
use clausebase::storage::{ObjectStorage, StoredObject};
use clausebase::store::Store;
use clausebase::vector_store::{SqliteVectorStore, VectorStore};

// ============ Fakes ============

#[derive(Default)]
struct MemStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStorage for MemStorage {
    async fn upload(&self, bytes: &[u8], _filename: &str) -> Result<StoredObject, PipelineError> {
        let storage_id = Uuid::new_v4().to_string();
        self.objects
            .lock()
            .unwrap()
            .insert(storage_id.clone(), bytes.to_vec());
        Ok(StoredObject {
            url: format!("mem://{}", storage_id),
            storage_id,
        })
    }
    async fn download(&self, storage_id: &str) -> Result<Vec<u8>, PipelineError> {
        self.objects
            .lock()
            .unwrap()
            .get(storage_id)
            .cloned()
            .ok_or_else(|| PipelineError::Storage(format!("no object {}", storage_id)))
    }
    async fn delete(&self, storage_id: &str) -> Result<(), PipelineError> {
        self.objects.lock().unwrap().remove(storage_id);
        Ok(())
    }
}

struct PassthroughExtractor;

#[async_trait]
impl TextExtractor for PassthroughExtractor {
    async fn extract(&self, _filename: &str, bytes: &[u8]) -> Result<String, PipelineError> {
        Ok(String::from_utf8_lossy(bytes).to_string())
    }
}

struct FakeEmbedder;

#[async_trait]
impl EmbeddingGenerator for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embedder"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(chunks.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
    }
}

struct FakeMetadataExtractor;

#[async_trait]
impl MetadataExtractor for FakeMetadataExtractor {
    async fn extract_fields(&self, _text: &str) -> Result<ContractFields, PipelineError> {
        Ok(ContractFields {
            vendor_name: Some("Acme Corp".to_string()),
            liability_cap_risk_score: Some(1),
            ..Default::default()
        })
    }
}

// ============ Setup ============

struct TestApp {
    _tmp: TempDir,
    router: Router,
    store: Store,
}

async fn test_app() -> TestApp {
    build_app(
        r#"
        [db]
        path = "unused.db"
        [server]
        bind = "127.0.0.1:0"
        [chunking]
        chunk_size = 64
        chunk_overlap = 8
    "#,
    )
    .await
}

async fn build_app(config_toml: &str) -> TestApp {
    let tmp = TempDir::new().unwrap();
    let pool = connect_path(&tmp.path().join("api.db")).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let store = Store::new(pool.clone());

    let config: Config = toml::from_str(config_toml).unwrap();

    let storage: Arc<dyn ObjectStorage> = Arc::new(MemStorage::default());
    let embedder: Arc<dyn EmbeddingGenerator> = Arc::new(FakeEmbedder);
    let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(pool));
    let deps = PipelineDeps {
        storage: Arc::clone(&storage),
        extractor: Box::new(PassthroughExtractor),
        embedder: Arc::clone(&embedder),
        metadata: Box::new(FakeMetadataExtractor),
    };

    let events = EventBus::new();
    let queue = ProcessingQueue::new(
        &config,
        store.clone(),
        Arc::clone(&vectors),
        deps,
        events.clone(),
    );
    queue.start();

    let router = build_router(AppState {
        config: Arc::new(config),
        store: store.clone(),
        queue,
        events,
        storage,
        embedder,
        vectors,
    });

    TestApp {
        _tmp: tmp,
        router,
        store,
    }
}

fn multipart_request(filename: &str, content: &str) -> Request<Body> {
    let boundary = "TESTBOUNDARY";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{f}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n{c}\r\n--{b}--\r\n",
        b = boundary,
        f = filename,
        c = content
    );
    Request::builder()
        .method("POST")
        .uri("/api/v1/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

fn search_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/search")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_settled(store: &Store, file_id: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let record = store.get_file(file_id).await.unwrap().unwrap();
            if record.is_settled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("file did not settle in time");
}

// ============ Tests ============

#[tokio::test]
async fn test_health() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_list_files_empty() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(Request::get("/api/v1/files").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["files"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_list_files_rejects_bad_limit() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(
            Request::get("/api/v1/files?limit=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_upload_accepts_and_processes_pdf() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("msa.pdf", "Agreement with Acme Corp."))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;

    let files = json["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["filename"], "msa.pdf");
    assert_eq!(files[0]["vector_processing_status"], "pending");
    let file_id = files[0]["id"].as_str().unwrap().to_string();

    wait_settled(&app.store, &file_id).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/files/{}/status", file_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["vector_processing_status"], "completed");
    assert_eq!(json["metadata_processing_status"], "completed");
    assert_eq!(json["processing_attempts"], 1);

    let response = app
        .router
        .oneshot(
            Request::get(format!("/api/v1/files/{}", file_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["file_metadata"]["vendor_name"], "Acme Corp");
}

#[tokio::test]
async fn test_upload_rejects_unsupported_type() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(multipart_request("notes.txt", "plain notes"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["files"].as_array().unwrap().len(), 0);
    let rejected = json["rejected"].as_array().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["filename"], "notes.txt");
    assert!(rejected[0]["reason"]
        .as_str()
        .unwrap()
        .contains("unsupported file type"));
}

#[tokio::test]
async fn test_upload_without_files_is_bad_request() {
    let app = test_app().await;
    let boundary = "TESTBOUNDARY";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{b}--\r\n",
        b = boundary
    );
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();

    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_unknown_file_not_found() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(
            Request::get("/api/v1/files/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_retry_unknown_file_not_found() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(
            Request::post("/api/v1/files/does-not-exist/retry")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retry_completed_file_conflicts_without_force() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("again.pdf", "Agreement text"))
        .await
        .unwrap();
    let json = json_body(response).await;
    let file_id = json["files"][0]["id"].as_str().unwrap().to_string();
    wait_settled(&app.store, &file_id).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::post(format!("/api/v1/files/{}/retry", file_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .router
        .oneshot(
            Request::post(format!("/api/v1/files/{}/retry?force=true", file_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "queued");
}

#[tokio::test]
async fn test_queue_status_endpoint() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(
            Request::get("/api/v1/queue/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["is_running"], true);
    assert_eq!(json["total_workers"], 3);
}

#[tokio::test]
async fn test_errors_listing_and_resolve_unknown() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(Request::get("/api/v1/errors").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["errors"].as_array().unwrap().len(), 0);

    let response = app
        .router
        .oneshot(
            Request::post("/api/v1/errors/bogus/resolve")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_larger_than_two_megabytes_is_accepted() {
    // Files between axum's built-in 2 MB body cap and the configured upload
    // limit must reach per-file validation, not die as a body-read error.
    let app = build_app(
        r#"
        [db]
        path = "unused.db"
        [server]
        bind = "127.0.0.1:0"
        [chunking]
        chunk_size = 8192
        chunk_overlap = 256
    "#,
    )
    .await;

    let content = "contract clause text ".repeat(150_000); // ~3 MB
    let response = app
        .router
        .oneshot(multipart_request("big.pdf", &content))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let files = json["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["filename"], "big.pdf");
    assert_eq!(json["rejected"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_upload_over_configured_cap_gets_per_file_rejection() {
    let app = build_app(
        r#"
        [db]
        path = "unused.db"
        [server]
        bind = "127.0.0.1:0"
        [upload]
        max_file_size_mb = 1
    "#,
    )
    .await;

    // Just over the 1 MB cap but within the body limit's framing slack.
    let content = "x".repeat(1024 * 1024 + 1024);
    let response = app
        .router
        .oneshot(multipart_request("large.pdf", &content))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["files"].as_array().unwrap().len(), 0);
    let rejected = json["rejected"].as_array().unwrap();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0]["reason"].as_str().unwrap().contains("size limit"));
}

#[tokio::test]
async fn test_search_returns_indexed_chunks() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("msa.pdf", "Liability is capped at fees paid."))
        .await
        .unwrap();
    let json = json_body(response).await;
    let file_id = json["files"][0]["id"].as_str().unwrap().to_string();
    wait_settled(&app.store, &file_id).await;

    let response = app
        .router
        .oneshot(search_request(serde_json::json!({
            "query": "liability cap"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let hits = json["hits"].as_array().unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0]["file_id"], file_id.as_str());
    assert!(hits[0]["score"].as_f64().unwrap() > 0.99);
}

#[tokio::test]
async fn test_search_respects_file_id_filter() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("msa.pdf", "Payment due in 30 days."))
        .await
        .unwrap();
    let json = json_body(response).await;
    let file_id = json["files"][0]["id"].as_str().unwrap().to_string();
    wait_settled(&app.store, &file_id).await;

    let response = app
        .router
        .clone()
        .oneshot(search_request(serde_json::json!({
            "query": "payment terms",
            "file_ids": ["some-other-file"]
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["hits"].as_array().unwrap().len(), 0);

    let response = app
        .router
        .oneshot(search_request(serde_json::json!({
            "query": "payment terms",
            "file_ids": [file_id]
        })))
        .await
        .unwrap();
    let json = json_body(response).await;
    assert!(!json["hits"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_search_rejects_empty_query() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(search_request(serde_json::json!({ "query": "  " })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_delete_file_removes_record() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("bye.pdf", "Agreement text"))
        .await
        .unwrap();
    let json = json_body(response).await;
    let file_id = json["files"][0]["id"].as_str().unwrap().to_string();
    wait_settled(&app.store, &file_id).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::delete(format!("/api/v1/files/{}", file_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .oneshot(
            Request::get(format!("/api/v1/files/{}", file_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
