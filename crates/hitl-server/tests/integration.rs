//! Route-level tests: requests go through the full router without binding a
//! socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use hitl_engine::{MemoryCheckpointStore, WorkflowService};
use hitl_llm::{LlmClient, ScriptedProvider};
use hitl_workflows::{default_catalog, StaticAnalysisTool};
use serde_json::{json, Value};
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn router(provider: ScriptedProvider) -> Router {
    let llm = Arc::new(LlmClient::new().with_provider(provider));
    let catalog = default_catalog(Arc::new(StaticAnalysisTool::new())).unwrap();
    let service = WorkflowService::new(catalog, Arc::new(MemoryCheckpointStore::new()), llm);
    hitl_server::app(service, &[])
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, text) = send(app, request).await;
    (status, serde_json::from_str(&text).unwrap())
}

/// `data:` payloads of the SSE events named `name`.
fn sse_data(body: &str, name: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter(|block| block.lines().any(|l| l == format!("event: {name}")))
        .filter_map(|block| block.lines().find_map(|l| l.strip_prefix("data: ")))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}

async fn start(app: &Router, workflow: &str, query: &str) -> String {
    let (status, ack) = post(
        app,
        "/workflows/start",
        json!({ "workflow": workflow, "query": query }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "pending");
    ack["thread_id"].as_str().unwrap().to_string()
}

// ---------------------------------------------------------------------------
// Test 1: Health and workflow listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_and_listing() {
    let app = router(ScriptedProvider::new());
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health, json!({ "status": "ok", "workflows": 4 }));

    let (_, body) = get(&app, "/workflows").await;
    let list: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 4);
    assert_eq!(list[0]["name"], "review");
}

// ---------------------------------------------------------------------------
// Test 2: Start, stream, resume, stream to finished
// ---------------------------------------------------------------------------

#[tokio::test]
async fn review_round_trip_over_sse() {
    let app = router(
        ScriptedProvider::new()
            .with_reply("Rain falls.")
            .with_reply("Rain falls softly."),
    );
    let thread = start(&app, "review", "Write about rain.").await;

    let (status, body) = get(&app, &format!("/workflows/stream/{thread}")).await;
    assert_eq!(status, StatusCode::OK);
    let handshake = sse_data(&body, "start");
    assert_eq!(handshake.len(), 1);
    assert_eq!(handshake[0]["thread_id"], thread.as_str());
    assert!(!sse_data(&body, "token").is_empty());
    let paused = sse_data(&body, "status");
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0]["status"], "user_feedback");
    assert_eq!(paused[0]["draft_content"], "Rain falls.");

    let (status, ack) = post(
        &app,
        "/workflows/resume",
        json!({ "thread_id": thread, "decision": "approved" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "pending");

    let (_, body) = get(&app, &format!("/workflows/stream/{thread}")).await;
    assert_eq!(sse_data(&body, "resume").len(), 1);
    let done = sse_data(&body, "status");
    assert_eq!(done[0]["status"], "finished");
    assert_eq!(done[0]["final_output"], "Rain falls softly.");

    let (status, body) = get(&app, &format!("/workflows/state/{thread}")).await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(snapshot["next"], json!([]));
    assert_eq!(snapshot["workflow"], "review");
}

// ---------------------------------------------------------------------------
// Test 3: Errors map to status codes with an error body
// ---------------------------------------------------------------------------

#[tokio::test]
async fn errors_map_to_status_codes() {
    let app = router(ScriptedProvider::new());

    let (status, body) = get(&app, "/workflows/stream/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let err: Value = serde_json::from_str(&body).unwrap();
    assert!(err["error"].as_str().unwrap().contains("nope"));

    let (status, _) = post(
        &app,
        "/workflows/start",
        json!({ "workflow": "poetry", "query": "x" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let thread = start(&app, "review", "rain").await;
    get(&app, &format!("/workflows/stream/{thread}")).await;

    let (status, body) = post(
        &app,
        "/workflows/interrupt",
        json!({ "thread_id": thread, "message": "stop" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].is_string());

    post(
        &app,
        "/workflows/resume",
        json!({ "thread_id": thread, "decision": "approved" }),
    )
    .await;
    get(&app, &format!("/workflows/stream/{thread}")).await;
    let (status, _) = post(
        &app,
        "/workflows/resume",
        json!({ "thread_id": thread, "decision": "approved" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// ---------------------------------------------------------------------------
// Test 4: Sentence endpoints on an editor thread
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sentence_endpoints() {
    let app = router(ScriptedProvider::new().with_reply("Rain falls. Streets shine."));
    let thread = start(&app, "editor", "Describe rain.").await;
    get(&app, &format!("/workflows/stream/{thread}")).await;

    let (status, body) = get(&app, &format!("/workflows/sentences/{thread}")).await;
    assert_eq!(status, StatusCode::OK);
    let view: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(view["sentences"][1]["id"], "sentence_1");
    assert_eq!(view["sentences"][1]["text"], "Streets shine.");

    let (status, view) = post(
        &app,
        "/workflows/sentences/edit",
        json!({ "thread_id": thread, "sentence_id": "sentence_1", "text": "Streets glitter." }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["sentences"][1]["edited"], "Streets glitter.");

    let (status, view) = post(
        &app,
        "/workflows/sentences/feedback",
        json!({ "thread_id": thread, "sentence_id": "sentence_0", "feedback": "warmer" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["sentences"][0]["feedback"], "warmer");

    let (status, _) = post(
        &app,
        "/workflows/sentences/edit",
        json!({ "thread_id": thread, "sentence_id": "sentence_5", "text": "x" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
