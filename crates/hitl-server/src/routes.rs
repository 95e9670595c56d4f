//! Route handlers. Each one maps a request onto a `WorkflowService` call.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{Stream, StreamExt};
use hitl_engine::{Ack, ResumeRequest, StartRequest, ThreadSnapshot, WireEvent, WorkflowInfo};
use hitl_workflows::{editor, SentenceView};
use serde::{Deserialize, Serialize};

use crate::{ApiError, AppState};

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub workflows: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        workflows: state.service.catalog().names().len(),
    })
}

pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowInfo>> {
    Json(state.service.workflows())
}

pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Ack> {
    Ok(Json(state.service.start(request).await?))
}

pub async fn resume(
    State(state): State<AppState>,
    Json(request): Json<ResumeRequest>,
) -> ApiResult<Ack> {
    Ok(Json(state.service.resume(request).await?))
}

#[derive(Debug, Deserialize)]
pub struct InterruptRequest {
    pub thread_id: String,
    #[serde(default)]
    pub message: String,
}

pub async fn interrupt(
    State(state): State<AppState>,
    Json(request): Json<InterruptRequest>,
) -> ApiResult<Ack> {
    Ok(Json(
        state
            .service
            .interrupt(&request.thread_id, &request.message)
            .await?,
    ))
}

pub async fn get_state(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<ThreadSnapshot> {
    Ok(Json(state.service.get_state(&thread_id).await?))
}

/// `GET /workflows/stream/{thread_id}`: the thread's run as server-sent
/// events, named after the event kind.
pub async fn stream(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.service.stream(&thread_id).await?;
    tracing::info!(thread_id = %thread_id, "SSE stream opened");
    let stream = events.map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &WireEvent) -> Event {
    Event::default()
        .event(event.kind())
        .data(event.to_json().to_string())
}

pub async fn sentences(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<SentenceView> {
    Ok(Json(editor::sentences(&state.service, &thread_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SentenceEdit {
    pub thread_id: String,
    pub sentence_id: String,
    pub text: String,
}

pub async fn edit_sentence(
    State(state): State<AppState>,
    Json(edit): Json<SentenceEdit>,
) -> ApiResult<SentenceView> {
    let view =
        editor::edit_sentence(&state.service, &edit.thread_id, &edit.sentence_id, &edit.text)
            .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct SentenceFeedback {
    pub thread_id: String,
    pub sentence_id: String,
    pub feedback: String,
}

pub async fn feedback_sentence(
    State(state): State<AppState>,
    Json(note): Json<SentenceFeedback>,
) -> ApiResult<SentenceView> {
    let view = editor::feedback_sentence(
        &state.service,
        &note.thread_id,
        &note.sentence_id,
        &note.feedback,
    )
    .await?;
    Ok(Json(view))
}
