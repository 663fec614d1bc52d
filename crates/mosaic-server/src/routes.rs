//! HTTP surface.
//!
//! Thin handlers: parse, call the Node, shape the JSON. Every route except
//! `/auth/*` sits behind the auth gate; CORS wraps everything.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use mosaic_core::app::NodeInfo;
use mosaic_core::domain::TaskInfo;
use mosaic_core::ports::OptionSpec;
use mosaic_core::{MosaicError, Node, TaskId};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::auth::{self, AuthGate, check_token};
use crate::error::ApiError;
use crate::form::{TaskAction, TaskForm};

pub struct AppState {
    pub node: Arc<Node>,
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(node: Arc<Node>, gate: AuthGate) -> Router {
    let state = Arc::new(AppState { node });
    Router::new()
        .route("/task/new/init", post(init_task))
        .route("/task/new/upload/{uuid}", post(upload_images))
        .route("/task/new/commit/{uuid}", post(commit_task))
        .route("/task/new", post(create_task))
        .route("/task/list", get(list_tasks))
        .route("/task/{uuid}/info", get(task_info))
        .route("/task/{uuid}/output", get(task_output))
        .route("/task/{uuid}/download/{*asset}", get(download_asset))
        .route("/task/cancel", post(cancel_task))
        .route("/task/remove", post(remove_task))
        .route("/task/restart", post(restart_task))
        .route("/options", get(options))
        .route("/info", get(node_info))
        // image uploads are bounded by max_images, not body size
        .layer(DefaultBodyLimit::disable())
        .route_layer(middleware::from_fn_with_state(gate, check_token))
        .with_state(state)
        .merge(auth::routes())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

fn parse_task_id(raw: &str) -> Result<TaskId, MosaicError> {
    raw.parse::<TaskId>()
        .map_err(|e| MosaicError::Validation(e.to_string()))
}

fn success() -> Json<Value> {
    Json(json!({ "success": true }))
}

async fn init_task(State(state): State<Arc<AppState>>, form: TaskForm) -> ApiResult<Json<Value>> {
    let id = state.node.init(form.task).await?;
    Ok(Json(json!({ "uuid": id })))
}

async fn upload_images(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    form: TaskForm,
) -> ApiResult<Json<Value>> {
    let id = parse_task_id(&uuid)?;
    debug!(task_id = %id, images = form.images.len(), "upload received");
    state.node.upload(id, form.images).await?;
    Ok(success())
}

async fn commit_task(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<TaskInfo>> {
    let id = parse_task_id(&uuid)?;
    Ok(Json(state.node.commit(id).await?))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    form: TaskForm,
) -> ApiResult<Json<TaskInfo>> {
    Ok(Json(state.node.create(form.task, form.images).await?))
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<Value>> {
    let ids = state.node.list().await;
    Json(ids.into_iter().map(|id| json!({ "uuid": id })).collect())
}

#[derive(Debug, Deserialize)]
struct InfoQuery {
    with_output: Option<i64>,
}

async fn task_info(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    query: Result<Query<InfoQuery>, QueryRejection>,
) -> ApiResult<Json<TaskInfo>> {
    let Query(query) = query.map_err(|e| ApiError::invalid(e.body_text()))?;
    let id = parse_task_id(&uuid)?;
    Ok(Json(state.node.task_info(id, query.with_output).await?))
}

#[derive(Debug, Deserialize)]
struct OutputQuery {
    line: Option<i64>,
}

async fn task_output(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    query: Result<Query<OutputQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<String>>> {
    let Query(query) = query.map_err(|e| ApiError::invalid(e.body_text()))?;
    let id = parse_task_id(&uuid)?;
    Ok(Json(
        state.node.output(id, query.line.unwrap_or(0)).await?,
    ))
}

async fn download_asset(
    State(state): State<Arc<AppState>>,
    Path((uuid, asset)): Path<(String, String)>,
) -> ApiResult<Response> {
    let id = parse_task_id(&uuid)?;
    let download = state.node.download(id, &asset).await?;

    let file = tokio::fs::File::open(&download.path)
        .await
        .map_err(MosaicError::from)?;
    let len = file.metadata().await.map_err(MosaicError::from)?.len();
    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.file_name.replace('"', "")
    );
    let headers = [
        (CONTENT_TYPE, download.content_type.to_string()),
        (CONTENT_DISPOSITION, disposition),
        (CONTENT_LENGTH, len.to_string()),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

fn action_task_id(action: &TaskAction) -> Result<TaskId, ApiError> {
    let uuid = action
        .uuid
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::invalid("uuid is required").as_outcome())?;
    parse_task_id(uuid).map_err(|e| ApiError::from(e).as_outcome())
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    action: TaskAction,
) -> ApiResult<Json<Value>> {
    let id = action_task_id(&action)?;
    state
        .node
        .cancel(id)
        .await
        .map_err(|e| ApiError::from(e).as_outcome())?;
    Ok(success())
}

async fn remove_task(
    State(state): State<Arc<AppState>>,
    action: TaskAction,
) -> ApiResult<Json<Value>> {
    let id = action_task_id(&action)?;
    state
        .node
        .remove(id)
        .await
        .map_err(|e| ApiError::from(e).as_outcome())?;
    Ok(success())
}

async fn restart_task(
    State(state): State<Arc<AppState>>,
    action: TaskAction,
) -> ApiResult<Json<Value>> {
    let id = action_task_id(&action)?;
    let options = action
        .options
        .map(|field| field.into_options())
        .transpose()
        .map_err(ApiError::as_outcome)?;
    state
        .node
        .restart(id, options)
        .await
        .map_err(|e| ApiError::from(e).as_outcome())?;
    Ok(success())
}

async fn options(State(state): State<Arc<AppState>>) -> Json<Vec<OptionSpec>> {
    Json(state.node.options_schema())
}

async fn node_info(State(state): State<Arc<AppState>>) -> Json<NodeInfo> {
    Json(state.node.info().await)
}
