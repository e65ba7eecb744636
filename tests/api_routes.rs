mod support;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use sheet_chat::address::CellAddress;
use sheet_chat::model::CellValue;
use sheet_chat::state::AppState;
use std::sync::Arc;
use support::TestWorkspace;
use tower::ServiceExt;

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

fn setup() -> (TestWorkspace, Arc<AppState>, Router) {
    let workspace = TestWorkspace::new();
    let state = workspace.app_state();
    let router = sheet_chat::build_router(state.clone());
    (workspace, state, router)
}

#[tokio::test]
async fn range_defaults_to_the_view_window() {
    let (_workspace, _state, router) = setup();

    let (status, body) = send(&router, Method::GET, "/api/xlsx/range", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
    assert_eq!(body["data"][1][1]["value"], json!(100.0));
    assert_eq!(body["data"][0][0]["value"], json!("Name"));
}

#[tokio::test]
async fn range_errors_map_to_http_status() {
    let (_workspace, _state, router) = setup();

    let (status, body) = send(
        &router,
        Method::GET,
        "/api/xlsx/range?sheet=Sheet1&from=a1&to=C3",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_address");
    assert!(body["error"].as_str().unwrap().contains("a1"));

    let (status, body) = send(
        &router,
        Method::GET,
        "/api/xlsx/range?sheet=Ghost&from=A1&to=B2",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "sheet_not_found");
}

#[tokio::test]
async fn whole_sheet_range_is_a_bad_request() {
    let (_workspace, _state, router) = setup();

    let (status, body) = send(
        &router,
        Method::GET,
        "/api/xlsx/range?sheet=Sheet1&from=A1&to=XFD1048576",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "range_too_large");
}

#[tokio::test]
async fn direct_update_writes_without_confirmation() {
    let (_workspace, state, router) = setup();

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/xlsx/update",
        Some(json!({"mode": "cell", "sheet": "Sheet1", "cell": "B2", "value": 999})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(
        state
            .store()
            .read_cell("Sheet1", CellAddress::decode("B2").unwrap()),
        CellValue::Number(999.0)
    );

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/xlsx/update",
        Some(json!({"mode": "cell", "sheet": "Sheet1", "cell": "ZZZZ9", "value": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_address");

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/xlsx/update",
        Some(json!({"mode": "sideways"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_params");
}

#[tokio::test]
async fn thread_lifecycle() {
    let (_workspace, _state, router) = setup();

    let (status, _) = send(&router, Method::POST, "/api/threads", Some(json!({"title": " "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, thread) = send(
        &router,
        Method::POST,
        "/api/threads",
        Some(json!({"title": "Budget"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = thread["id"].as_str().unwrap().to_string();

    let (status, renamed) = send(
        &router,
        Method::PATCH,
        &format!("/api/threads/{id}"),
        Some(json!({"title": "Budget 2025"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["title"], "Budget 2025");

    let (status, listed) = send(&router, Method::GET, "/api/threads", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = send(&router, Method::DELETE, &format!("/api/threads/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&router, Method::GET, &format!("/api/threads/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "thread_not_found");
}

#[tokio::test]
async fn user_message_starts_a_new_turn() {
    let (_workspace, state, router) = setup();
    let (_, thread) = send(
        &router,
        Method::POST,
        "/api/threads",
        Some(json!({"title": "Chat"})),
    )
    .await;
    let id = thread["id"].as_str().unwrap().to_string();

    let read = json!({"thread_id": id, "sheet": "Sheet1", "from": "A1", "to": "C3"});
    let (status, first) = send(&router, Method::POST, "/api/tools/get_range", Some(read.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["outcome"], "range_read");

    let (status, second) = send(&router, Method::POST, "/api/tools/get_range", Some(read.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"], "rejected");
    assert_eq!(second["code"], "duplicate_read");

    let (status, message) = send(
        &router,
        Method::POST,
        &format!("/api/messages/{id}"),
        Some(json!({"content": "show me the table again"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["role"], "user");

    let (_, third) = send(&router, Method::POST, "/api/tools/get_range", Some(read)).await;
    assert_eq!(third["outcome"], "range_read");

    let (status, messages) = send(&router, Method::GET, &format!("/api/messages/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages.as_array().unwrap().len(), 1);

    let (status, _) = send(&router, Method::DELETE, &format!("/api/threads/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(state.ledger().pending(&id).is_empty());
}

#[tokio::test]
async fn messages_for_unknown_thread_are_not_found() {
    let (_workspace, _state, router) = setup();
    let (status, body) = send(
        &router,
        Method::POST,
        "/api/messages/nope",
        Some(json!({"role": "assistant", "content": "hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "thread_not_found");
}

#[tokio::test]
async fn tool_route_reports_unknown_tools_and_rejections() {
    let (_workspace, _state, router) = setup();

    let (status, body) = send(&router, Method::POST, "/api/tools/drop_table", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "method_not_found");

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/tools/execute_cell_update",
        Some(json!({"sheet": "Sheet1", "cell": "B2", "new_value": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "rejected");
    assert_eq!(body["code"], "confirmation_required");

    let (status, body) = send(&router, Method::POST, "/api/tools/begin_turn", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "turn_started");
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
    let (_workspace, _state, router) = setup();

    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&router, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], json!(true));

    // populate at least one series
    send(&router, Method::POST, "/api/tools/begin_turn", None).await;
    let (status, body) = send(&router, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("sheet_chat_tool_calls"));
}
