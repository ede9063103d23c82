//! HTTP surface: SSE streams, publish requests and approval transitions.
use crate::approval::{ApprovalDesk, ApprovalError, PublishOutcome, PublishRequest, Review};
use crate::model::StreamEvent;
use crate::stream::{StreamController, StreamRequest};
use crate::transform::ImageOverrides;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

pub struct AppState {
    pub desk: Arc<ApprovalDesk>,
    pub streams: StreamController,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/stream", get(stream))
        .route("/api/sources", get(sources))
        .route("/api/post", post(publish))
        .route("/api/awaiting", get(list_awaiting))
        .route("/api/awaiting/{id}/approve", post(approve))
        .route("/api/awaiting/{id}/cancel", post(cancel))
        .route("/api/awaiting/{id}/image", post(request_image))
        .route("/api/filters/{id}/evaluate", post(evaluate_filter))
        .route("/api/authors/{id}/rewrite", post(rewrite))
        .route("/api/logs", get(logs))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// JSON `{error}` response with a status code.
#[derive(Debug)]
pub struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<ApprovalError> for AppError {
    fn from(err: ApprovalError) -> Self {
        let status = match &err {
            ApprovalError::NotFound
            | ApprovalError::UnknownTenant(_)
            | ApprovalError::UnknownFilter(_)
            | ApprovalError::UnknownAuthor(_) => StatusCode::NOT_FOUND,
            ApprovalError::NoActiveApprovers
            | ApprovalError::MissingChannel
            | ApprovalError::MissingContent => StatusCode::BAD_REQUEST,
            ApprovalError::Busy | ApprovalError::DuplicateId(_) => StatusCode::CONFLICT,
            ApprovalError::Publish(_) | ApprovalError::Llm(_) => {
                warn!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError(status, err.to_string())
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    sources: Option<String>,
    history: Option<String>,
    instance_id: Option<String>,
}

fn parse_flag(value: Option<&str>, default: bool) -> bool {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if v == "false" || v == "0" || v == "no" => false,
        Some(v) if v == "true" || v == "1" || v == "yes" => true,
        _ => default,
    }
}

fn to_sse(event: &StreamEvent) -> Event {
    let sse = Event::default().data(event.payload().to_string());
    match event.name() {
        Some(name) => sse.event(name),
        None => sse,
    }
}

async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut ids: Vec<String> = query
        .sources
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        ids = state.streams.sources().ids();
    }
    let request = StreamRequest {
        sources: ids,
        include_history: parse_flag(query.history.as_deref(), true),
        instance_id: query.instance_id.filter(|s| !s.is_empty()),
    };
    let events = state
        .streams
        .subscribe(request)
        .map(|ev| Ok::<Event, Infallible>(to_sse(&ev)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn sources(State(state): State<Arc<AppState>>) -> Json<Value> {
    let list: Vec<Value> = state
        .streams
        .sources()
        .describe()
        .into_iter()
        .map(|(id, label)| json!({ "id": id, "label": label }))
        .collect();
    Json(Value::Array(list))
}

#[derive(Debug, Deserialize)]
struct PostBody {
    #[serde(flatten)]
    request: PublishRequest,
    #[serde(flatten)]
    review: Review,
}

async fn publish(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PostBody>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.desk.submit_reviewed(body.request, body.review).await?;
    let value = match outcome {
        PublishOutcome::Awaiting { id } => json!({ "ok": true, "awaiting": true, "id": id }),
        PublishOutcome::Published => json!({ "ok": true, "awaiting": false }),
        PublishOutcome::Rejected { score } => {
            json!({ "ok": false, "rejected": true, "score": score })
        }
    };
    Ok(Json(value))
}

async fn list_awaiting(State(state): State<Arc<AppState>>) -> Json<Value> {
    let posts = state.desk.list_awaiting().await;
    Json(serde_json::to_value(posts).unwrap_or_else(|_| json!([])))
}

async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.desk.approve(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.desk.cancel(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn request_image(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let overrides: ImageOverrides = if body.iter().all(u8::is_ascii_whitespace) {
        ImageOverrides::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError(StatusCode::BAD_REQUEST, format!("invalid body: {}", e)))?
    };
    let post = state.desk.request_image(&id, &overrides).await?;
    Ok(Json(json!({ "ok": true, "id": post.id, "media": post.media })))
}

#[derive(Debug, Deserialize)]
struct TextBody {
    login: String,
    text: String,
}

async fn evaluate_filter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<TextBody>,
) -> Result<Json<Value>, AppError> {
    let score = state.desk.evaluate_filter(&body.login, &id, &body.text).await?;
    Ok(Json(json!({
        "score": score.value,
        "content": score.content,
        "tokens": score.tokens,
    })))
}

async fn rewrite(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<TextBody>,
) -> Result<Json<Value>, AppError> {
    let out = state.desk.rewrite_with_author(&body.login, &id, &body.text).await?;
    Ok(Json(json!({ "text": out.text, "tokens": out.tokens })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    instance_id: Option<String>,
}

async fn logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let scope = query.instance_id.filter(|s| !s.is_empty());
    let mut rx = state.desk.logs().subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(line) if line.instance_id == scope => {
                    yield Ok::<Event, Infallible>(
                        Event::default().data(json!({ "message": line.message }).to_string()),
                    );
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
