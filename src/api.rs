//! JSON REST surface for the chat UI: grid reads and direct edits, thread
//! and message persistence, and a generic tool invocation route.
//!
//! Direct edits through `/api/xlsx/update` are made by the user in the grid
//! and therefore skip the confirmation protocol; tool calls made on a user's
//! behalf go through `/api/tools/{tool}` and the dispatch ledger.

use crate::address::CellRange;
use crate::error::{AddressError, ErrorCode, InvokeError, StoreError, ThreadError};
use crate::execute::{self, Execution};
use crate::metrics::METRICS;
use crate::model::{Literal, Message, RangeData, Role, Thread};
use crate::state::AppState;
use crate::tools::{self, ToolOutcome};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/xlsx/range", get(get_range))
        .route("/api/xlsx/update", post(update))
        .route("/api/threads", get(list_threads).post(create_thread))
        .route(
            "/api/threads/{id}",
            get(get_thread).patch(update_thread).delete(delete_thread),
        )
        .route(
            "/api/messages/{thread_id}",
            get(list_messages).post(append_message),
        )
        .route("/api/tools/{tool}", post(invoke_tool))
        .with_state(state)
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code.category() {
            "validation_error" => StatusCode::BAD_REQUEST,
            "resource_not_found" => StatusCode::NOT_FOUND,
            "policy" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = %self.code, error = %self.message, "request failed");
        } else {
            tracing::debug!(code = %self.code, error = %self.message, "request rejected");
        }
        let body = ErrorBody {
            error: self.message,
            code: self.code.as_str(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AddressError> for ApiError {
    fn from(error: AddressError) -> Self {
        Self::new(ErrorCode::InvalidAddress, error.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl From<ThreadError> for ApiError {
    fn from(error: ThreadError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl From<InvokeError> for ApiError {
    fn from(error: InvokeError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl From<task::JoinError> for ApiError {
    fn from(error: task::JoinError) -> Self {
        Self::new(
            ErrorCode::InternalError,
            format!("request worker failed: {error}"),
        )
    }
}

async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work).await?
}

fn json_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::new(ErrorCode::InvalidParams, format!("invalid request body: {e}")))
}

// =============================================================================
// WORKBOOK
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub sheet: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Missing query parameters fall back to the configured view window.
async fn get_range(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<RangeData>, ApiError> {
    let config = state.config();
    let view = &config.view;
    let sheet = query.sheet.unwrap_or_else(|| view.sheet.clone());
    let from = query.from.unwrap_or_else(|| view.from.encode());
    let to = query.to.unwrap_or_else(|| view.to.encode());
    let range = CellRange::from_a1(sheet, &from, &to)?;

    let data = blocking(move || Ok(state.store().read_range(&range)?)).await?;
    Ok(Json(data))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UpdateRequest {
    Cell {
        sheet: String,
        cell: String,
        value: Literal,
    },
    Range {
        sheet: String,
        from: String,
        to: String,
        values: Vec<Vec<Literal>>,
    },
}

async fn update(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Execution>, ApiError> {
    let request: UpdateRequest = json_body(&body)?;
    let execution = blocking(move || {
        let config = state.config();
        let store = state.store();
        let (kind, execution) = match request {
            UpdateRequest::Cell { sheet, cell, value } => (
                "cell",
                Execution::Cell(execute::execute_cell_update(
                    &store,
                    &config.view,
                    &sheet,
                    &cell,
                    value,
                )),
            ),
            UpdateRequest::Range {
                sheet,
                from,
                to,
                values,
            } => (
                "range",
                Execution::Range(execute::execute_range_update(
                    &store,
                    &config.view,
                    &sheet,
                    &from,
                    &to,
                    values,
                )),
            ),
        };
        METRICS.record_execution(kind, execution.success(), store.version());
        Ok(execution)
    })
    .await?;

    if execution.success() {
        Ok(Json(execution))
    } else {
        let code = execution.error_code().unwrap_or(ErrorCode::InternalError);
        Err(ApiError::new(code, execution.message()))
    }
}

// =============================================================================
// THREADS & MESSAGES
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct TitleRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default = "default_role")]
    pub role: Role,
    pub content: String,
}

fn default_role() -> Role {
    Role::User
}

async fn list_threads(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Thread>>, ApiError> {
    let threads = blocking(move || Ok(state.threads().list_threads()?)).await?;
    Ok(Json(threads))
}

async fn create_thread(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Thread>), ApiError> {
    let request: TitleRequest = json_body(&body)?;
    let thread = blocking(move || Ok(state.threads().create_thread(&request.title)?)).await?;
    tracing::info!(thread_id = %thread.id, "thread created");
    Ok((StatusCode::CREATED, Json(thread)))
}

async fn get_thread(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Thread>, ApiError> {
    let thread = blocking(move || Ok(state.threads().get_thread(&id)?)).await?;
    Ok(Json(thread))
}

async fn update_thread(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Thread>, ApiError> {
    let request: TitleRequest = json_body(&body)?;
    let thread = blocking(move || Ok(state.threads().update_thread(&id, &request.title)?)).await?;
    Ok(Json(thread))
}

/// Also drops the conversation's pending previews and turn state.
async fn delete_thread(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    blocking(move || {
        state.threads().delete_thread(&id)?;
        state.ledger().forget(&id);
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = blocking(move || Ok(state.threads().list_messages(&thread_id)?)).await?;
    Ok(Json(messages))
}

/// A user message opens a new turn for the thread's conversation.
async fn append_message(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let request: MessageRequest = json_body(&body)?;
    let message = blocking(move || {
        let message = state
            .threads()
            .append_message(&thread_id, request.role, &request.content)?;
        if message.role == Role::User {
            let turn = state.ledger().begin_turn(&thread_id);
            tracing::debug!(thread_id = %thread_id, turn, "user message opened a new turn");
        }
        Ok(message)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

// =============================================================================
// TOOLS
// =============================================================================

/// Rejections come back in-band with status 200; only an unknown tool or
/// unparseable parameters are HTTP errors.
async fn invoke_tool(
    State(state): State<Arc<AppState>>,
    Path(tool): Path<String>,
    body: Bytes,
) -> Result<Json<ToolOutcome>, ApiError> {
    let params = if body.is_empty() {
        serde_json::Value::Null
    } else {
        json_body(&body)?
    };
    let outcome = tools::invoke(state, &tool, params).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_error_category() {
        assert_eq!(
            ApiError::new(ErrorCode::InvalidAddress, "bad").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::new(ErrorCode::ThreadNotFound, "gone").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::new(ErrorCode::StaleConfirmation, "changed").status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::new(ErrorCode::IoError, "disk").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn update_request_is_tagged_by_mode() {
        let request: UpdateRequest = serde_json::from_str(
            r#"{"mode":"cell","sheet":"Sheet1","cell":"B2","value":42}"#,
        )
        .unwrap();
        assert!(matches!(
            request,
            UpdateRequest::Cell { value: Literal::Number(n), .. } if n == 42.0
        ));
    }
}
