//! HTTP JSON API over the staging list and execution state.
//!
//! - `GET    /api/clips?start=N`          staged snippets with id > N
//! - `POST   /api/clips`                  stage `{code}`
//! - `DELETE /api/clips/:id`
//! - `POST   /api/clips/:id/execute`      unstage and execute
//! - `POST   /api/execute`                execute `{code}` directly
//! - `GET    /api/states?start=N&previous=bool`
//! - `GET    /api/states/:id/result`      waits for the execution to finish
//! - `POST   /api/states/:id/select`
//! - `DELETE /api/states/:id`
//! - `DELETE /api/previous/:id`
//! - `POST   /api/reset`
//! - `GET    /api/pool`

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use kernel_client::{escape_html, KernelError, PoolStatus, ResultRecord};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::staging::StagingList;
use crate::state::ExecutionState;

/// Everything the handlers share.
pub struct AppState {
    pub state: ExecutionState,
    pub staging: StagingList,
}

impl AppState {
    pub fn new(state: ExecutionState) -> Self {
        Self {
            state,
            staging: StagingList::new(),
        }
    }
}

type SharedState = Arc<AppState>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Execution(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Kernel(KernelError::NotFound(_)) | ApiError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("[server] {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct ListQuery {
    start: Option<i64>,
    #[serde(default)]
    previous: bool,
}

#[derive(Debug, Deserialize)]
struct CodeBody {
    code: String,
}

/// Id of the newest listed item, falling back to the requested start.
fn last_id<I: IntoIterator<Item = i64>>(ids: I, start: Option<i64>) -> i64 {
    ids.into_iter().last().unwrap_or(start.unwrap_or(-1))
}

/// Render one MIME bundle entry as an HTML fragment.
pub fn render_mime(mime: &str, value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines
            .iter()
            .map(|line| line.as_str().map(str::to_string).unwrap_or_else(|| line.to_string()))
            .collect(),
        other => other.to_string(),
    };

    if mime.starts_with("text/") {
        format!("<p>{}</p>", escape_html(&text))
    } else if mime.starts_with("image/") {
        let payload: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        format!(
            "<img src=\"data:{};base64,{}\" alt=\"Embedded Image\">",
            escape_html(mime),
            escape_html(&payload)
        )
    } else {
        format!(
            "<p>Unknown mimetype: {}</p>\n<p>{}</p>",
            escape_html(mime),
            escape_html(&text)
        )
    }
}

fn render_result(record: &ResultRecord) -> Value {
    let html: Vec<Value> = record
        .data
        .iter()
        .map(|(mime, value)| json!({ "mime": mime, "html": render_mime(mime, value) }))
        .collect();

    json!({
        "data": record.data,
        "metadata": record.metadata,
        "stream": record.stream,
        "html": html,
    })
}

// ============================================================
// Staging
// ============================================================

async fn list_clips(
    State(app): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let clips = match query.start {
        Some(start) => app.staging.list_after(start),
        None => app.staging.list(),
    };
    let last = last_id(clips.iter().map(|c| c.id), query.start);
    Json(json!({ "clips": clips, "last_id": last }))
}

async fn add_clip(State(app): State<SharedState>, Json(body): Json<CodeBody>) -> Json<Value> {
    let id = app.staging.add(body.code);
    Json(json!({ "id": id }))
}

async fn delete_clip(State(app): State<SharedState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    match app.staging.remove(id) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::NotFound(format!("Clip {}", id))),
    }
}

async fn execute_clip(
    State(app): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let clip = app
        .staging
        .remove(id)
        .ok_or_else(|| ApiError::NotFound(format!("Clip {}", id)))?;
    let state_id = app.state.execute(&clip.code).await?;
    Ok(Json(json!({ "id": state_id })))
}

async fn execute_code(
    State(app): State<SharedState>,
    Json(body): Json<CodeBody>,
) -> ApiResult<Json<Value>> {
    let id = app.state.execute(&body.code).await?;
    Ok(Json(json!({ "id": id })))
}

// ============================================================
// Execution state
// ============================================================

async fn list_states(
    State(app): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let mut states = app.state.list_states(!query.previous).await;
    if let Some(start) = query.start {
        states.retain(|s| s.id > start);
    }
    let last = last_id(states.iter().map(|s| s.id), query.start);
    Json(json!({ "states": states, "last_id": last }))
}

async fn state_result(
    State(app): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let record = app
        .state
        .get_state(id)
        .await
        .ok_or(KernelError::NotFound(id))?;

    let outcome = record.wait_for_result().await;
    if let Some(e) = &outcome.error {
        return Err(ApiError::Execution(e.clone()));
    }

    let results: Vec<Value> = outcome.results.iter().map(render_result).collect();
    Ok(Json(json!({
        "id": record.id(),
        "code": record.code(),
        "kernel_id": record.kernel_id(),
        "results": results,
        "exceptions": outcome.exceptions,
    })))
}

async fn select_state(
    State(app): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    app.state.select(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_state(
    State(app): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if app.state.remove_state(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(KernelError::NotFound(id).into())
    }
}

async fn delete_previous(
    State(app): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if app.state.remove_previous_state(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(KernelError::NotFound(id).into())
    }
}

async fn reset(State(app): State<SharedState>) -> ApiResult<StatusCode> {
    app.state.reset().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pool_status(State(app): State<SharedState>) -> Json<PoolStatus> {
    Json(app.state.pool().status().await)
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;
    debug!("[server] {} {} -> {}", method, uri, response.status());
    response
}

pub fn router(app: SharedState) -> Router {
    Router::new()
        .route("/api/clips", get(list_clips).post(add_clip))
        .route("/api/clips/:id", delete(delete_clip))
        .route("/api/clips/:id/execute", post(execute_clip))
        .route("/api/execute", post(execute_code))
        .route("/api/states", get(list_states))
        .route("/api/states/:id", delete(delete_state))
        .route("/api/states/:id/result", get(state_result))
        .route("/api/states/:id/select", post(select_state))
        .route("/api/previous/:id", delete(delete_previous))
        .route("/api/reset", post(reset))
        .route("/api/pool", get(pool_status))
        .layer(middleware::from_fn(log_request))
        .with_state(app)
}

/// Serve the API until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: SharedState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("[server] Listening on http://{}", addr);
    }
    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_text_is_escaped() {
        let html = render_mime("text/plain", &json!("<b>2</b>"));
        assert_eq!(html, "<p>&lt;b&gt;2&lt;/b&gt;</p>");
    }

    #[test]
    fn test_render_multiline_text() {
        let html = render_mime("text/plain", &json!(["a\n", "b"]));
        assert_eq!(html, "<p>a\nb</p>");
    }

    #[test]
    fn test_render_image() {
        let html = render_mime("image/png", &json!("iVBO\nRw0K\n"));
        assert_eq!(
            html,
            "<img src=\"data:image/png;base64,iVBORw0K\" alt=\"Embedded Image\">"
        );
    }

    #[test]
    fn test_render_unknown_mimetype() {
        let html = render_mime("application/json", &json!({"a": 1}));
        assert_eq!(
            html,
            "<p>Unknown mimetype: application/json</p>\n<p>{&quot;a&quot;:1}</p>"
        );
    }

    #[test]
    fn test_last_id() {
        assert_eq!(last_id(vec![3, 5], Some(1)), 5);
        assert_eq!(last_id(Vec::new(), Some(7)), 7);
        assert_eq!(last_id(Vec::new(), None), -1);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let response = ApiError::Kernel(KernelError::NotFound(3)).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::Execution("boom".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
