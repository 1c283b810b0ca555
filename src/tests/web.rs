use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::{app::create_app, support::*};
use crate::{app::AppLocal, items::BackendJson, web};

fn create_router() -> (Router, Arc<AppLocal>, Arc<BackendJson>, tempfile::TempDir) {
    let (app, store, tmp) = create_app(FakeEmbedder::new());
    let app = Arc::new(app);
    (web::router(app.clone()), app, store, tmp)
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, value)
}

#[tokio::test]
async fn test_generate_embedding_route() {
    let (router, _app, store, _tmp) = create_router();
    let item = add_item(&store, "", "white sneakers size 42");

    let (status, body) = call(
        &router,
        "POST",
        "/api/embeddings/generate",
        Some(json!({"itemId": item.id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "updated"}));

    let (status, body) = call(
        &router,
        "POST",
        "/api/embeddings/generate",
        Some(json!({"itemId": "missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_matches_route() {
    let (router, _app, store, _tmp) = create_router();
    insert_with_vector(&store, "a", vec![1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "b", vec![1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "c", vec![0.0, 1.0], TEST_MODEL);

    let (status, body) = call(
        &router,
        "POST",
        "/api/matches",
        Some(json!({"itemId": "a", "k": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"itemId": "b", "similarity": 1.0},
            {"itemId": "c", "similarity": 0.0},
        ])
    );

    let (status, _) = call(
        &router,
        "POST",
        "/api/matches",
        Some(json!({"itemId": "a", "k": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&router, "POST", "/api/matches", Some(json!({"itemId": "zzz"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_backfill_route_without_body() {
    let (router, _app, store, _tmp) = create_router();
    add_item(&store, "", "lost passport");
    add_item(&store, "", "");

    let (status, body) = call(&router, "POST", "/api/embeddings/backfill", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempted"], 1);
    assert_eq!(body["updated"], 1);
    assert_eq!(body["skipped"], 1);
    assert_eq!(body["failed"], 0);
}

#[tokio::test]
async fn test_backfill_route_rejects_oversized_pool() {
    let (router, _app, store, _tmp) = create_router();
    add_item(&store, "", "lost passport");

    let (status, body) = call(
        &router,
        "POST",
        "/api/embeddings/backfill",
        Some(json!({"concurrency": 100000})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("concurrency"));
}

#[tokio::test]
async fn test_fetch_item_with_encoded_id() {
    let (router, _app, store, _tmp) = create_router();
    insert_with_vector(&store, "a/b?c", vec![1.0, 0.0], TEST_MODEL);

    let (status, fetched) = call(&router, "GET", "/api/items/a%2Fb%3Fc", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], "a/b?c");
}

#[tokio::test]
async fn test_delete_item_route() {
    let (router, _app, store, _tmp) = create_router();
    insert_with_vector(&store, "a", vec![1.0, 0.0], TEST_MODEL);
    insert_with_vector(&store, "b", vec![1.0, 0.0], TEST_MODEL);

    let (status, deleted) = call(
        &router,
        "POST",
        "/api/items/delete",
        Some(json!({"itemId": "b"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["id"], "b");

    let (status, body) = call(&router, "POST", "/api/matches", Some(json!({"itemId": "a"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = call(
        &router,
        "POST",
        "/api/items/delete",
        Some(json!({"itemId": "b"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_and_fetch_item() {
    let (router, app, _store, _tmp) = create_router();

    let (status, created) = call(
        &router,
        "POST",
        "/api/items",
        Some(json!({"title": "Found: keys", "description": "three keys on a ring", "kind": "found"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = created["id"].as_str().unwrap().to_string();

    app.shutdown();

    let (status, fetched) = call(&router, "GET", &format!("/api/items/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["kind"], "found");
    assert_eq!(
        fetched["embedding"]["vector"].as_array().unwrap().len(),
        TEST_DIMENSIONS
    );

    let (status, _) = call(&router, "GET", "/api/items/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_item_created_event_is_accepted() {
    let (router, app, store, _tmp) = create_router();
    let item = add_item(&store, "", "lost earring");

    let (status, _) = call(
        &router,
        "POST",
        "/api/events/item_created",
        Some(json!({"itemId": item.id})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    app.shutdown();

    let (_, status) = call(&router, "GET", "/api/status", None).await;
    assert_eq!(status["embedded"], 1);
    assert_eq!(status["trigger"]["received"], 1);
    assert_eq!(status["trigger"]["updated"], 1);
}

#[tokio::test]
async fn test_status_route() {
    let (router, _app, store, _tmp) = create_router();
    add_item(&store, "", "pending");
    add_item(&store, "", "");

    let (status, body) = call(&router, "GET", "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["pending"], 1);
    assert_eq!(body["noText"], 1);
    assert_eq!(body["backfillRunning"], false);
}
