//! HTTP front end tests
//!
//! Requests go through the full router, including the authorization
//! middleware, with an in-process bus standing in for the IST mode manager.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use bmcfront::bus::{BusValue, LocalBus, Signal};
use bmcfront::config::AccountConfig;
use bmcfront::constants::*;
use bmcfront::server::{router, AppState, IST_INTERFACE, IST_PATH, IST_SET_METHOD, IST_STATUS_IN_PROGRESS};
use bmcfront::{Completion, Config, TaskCallback, TaskData, TaskState};

const STATUS_PREFIX: &str = "xyz.openbmc_project.IstModeManager.Server.Status";

struct Harness {
    app: Router,
    state: AppState,
    bus: LocalBus,
}

fn account(username: &str, role: &str) -> AccountConfig {
    AccountConfig {
        username: username.into(),
        password: format!("{username}-pw"),
        role: role.into(),
        groups: Vec::new(),
    }
}

fn harness() -> Harness {
    let bus = LocalBus::new();
    let mut config = Config::default();
    config.accounts = vec![
        account("root", ROLE_ADMIN),
        account("operator", ROLE_OPERATOR),
        account("reader", ROLE_USER),
    ];
    let state = AppState::new(&config, Arc::new(bus.clone())).unwrap();
    Harness {
        app: router(state.clone()),
        state,
        bus,
    }
}

/// Harness whose bus answers SetISTMode and records the requested mode
fn ist_harness() -> (Harness, Arc<std::sync::Mutex<Vec<bool>>>) {
    let h = harness();
    let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&calls);
    h.bus.register_method(IST_INTERFACE, IST_SET_METHOD, move |call| {
        let enabled = call.args.first().and_then(BusValue::as_bool).unwrap_or(false);
        seen.lock().unwrap().push(enabled);
        Ok(Vec::new())
    });
    (h, calls)
}

impl Harness {
    fn token(&self, username: &str) -> String {
        let (token, _) = self.state.sessions.login(username, &format!("{username}-pw")).unwrap();
        token
    }

    async fn send(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, HeaderMap, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("X-Auth-Token", token);
        }
        let body = match body {
            Some(v) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };
        let response = self.app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, json)
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, HeaderMap, Value) {
        self.send(Method::GET, uri, token, None).await
    }

    fn emit_status(&self, status: &str) {
        self.bus.emit(Signal::properties_changed(IST_PATH, IST_INTERFACE, [("Status", status)]));
    }
}

fn idle() -> TaskCallback {
    Box::new(|_: &Signal, _: &mut TaskData| Completion::Pending)
}

fn error_id(body: &Value) -> &str {
    body["error"]["@Message.ExtendedInfo"][0]["MessageId"].as_str().unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn service_root_is_anonymous() {
    let h = harness();
    let (status, _, body) = h.get("/redfish/v1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Id"], "RootService");
}

#[tokio::test]
async fn protected_route_without_session_is_401() {
    let h = harness();
    let (status, _, body) = h.get("/redfish/v1/TaskService/Tasks", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_id(&body), "Base.1.19.0.NoValidSession");

    let (status, _, _) = h.get("/redfish/v1/TaskService/Tasks", Some("forged")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_issues_usable_token() {
    let h = harness();
    let (status, headers, body) = h
        .send(
            Method::POST,
            "/redfish/v1/SessionService/Sessions",
            None,
            Some(json!({"UserName": "reader", "Password": "reader-pw"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["UserName"], "reader");

    let token = headers["x-auth-token"].to_str().unwrap().to_string();
    let location = headers[header::LOCATION].to_str().unwrap();
    assert_eq!(location, format!("/redfish/v1/SessionService/Sessions/{}", body["Id"].as_str().unwrap()));

    let (status, _, _) = h.get("/redfish/v1/TaskService", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn bad_credentials_are_401() {
    let h = harness();
    let (status, headers, _) = h
        .send(
            Method::POST,
            "/redfish/v1/SessionService/Sessions",
            None,
            Some(json!({"UserName": "root", "Password": "guess"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.get("x-auth-token").is_none());
}

#[tokio::test]
async fn bearer_token_is_accepted() {
    let h = harness();
    let token = h.token("reader");
    let request = Request::builder()
        .uri("/redfish/v1/TaskService/Tasks")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn session_collection_lists_live_sessions() {
    let h = harness();
    let token = h.token("reader");
    h.token("root");

    let (status, _, body) = h.get("/redfish/v1/SessionService/Sessions", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Members@odata.count"], 2);
}

#[tokio::test]
async fn delete_own_session_only() {
    let h = harness();
    let reader = h.token("reader");
    let root = h.token("root");
    let sessions = h.state.sessions.list();
    let reader_id = sessions.iter().find(|s| s.username == "reader").unwrap().id.clone();
    let root_id = sessions.iter().find(|s| s.username == "root").unwrap().id.clone();

    let (status, _, _) = h
        .send(Method::DELETE, &format!("/redfish/v1/SessionService/Sessions/{root_id}"), Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = h
        .send(Method::DELETE, &format!("/redfish/v1/SessionService/Sessions/{reader_id}"), Some(&reader), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The revoked token no longer works
    let (status, _, _) = h.get("/redfish/v1/TaskService", Some(&reader)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = h
        .send(Method::DELETE, &format!("/redfish/v1/SessionService/Sessions/{reader_id}"), Some(&root), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Roles
// ============================================================================

#[tokio::test]
async fn role_lists_assigned_privileges() {
    let h = harness();
    let token = h.token("reader");

    let (status, _, body) = h.get("/redfish/v1/AccountService/Roles/ReadOnly", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["AssignedPrivileges"], json!(["Login", "ConfigureSelf"]));

    let (status, _, body) = h.get("/redfish/v1/AccountService/Roles/Guest", Some(&token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_id(&body), "Base.1.19.0.ResourceNotFound");
}

// ============================================================================
// Task collection and $filter
// ============================================================================

#[tokio::test]
async fn filter_selects_tasks() {
    let h = harness();
    let token = h.token("reader");
    for _ in 0..3 {
        h.state.tasks.create_task(None, idle(), Duration::from_secs(60)).unwrap();
    }
    h.state.tasks.get(1).unwrap().with(|data| data.complete());

    let (status, _, body) = h.get("/redfish/v1/TaskService/Tasks", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Members@odata.count"], 3);

    let (status, _, body) = h
        .get("/redfish/v1/TaskService/Tasks?$filter=TaskState%20eq%20'Completed'", Some(&token))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Members"], json!([{"@odata.id": "/redfish/v1/TaskService/Tasks/1"}]));

    let (_, _, body) = h
        .get("/redfish/v1/TaskService/Tasks?$filter=PercentComplete%20lt%20100", Some(&token))
        .await;
    assert_eq!(body["Members@odata.count"], 2);
}

#[tokio::test]
async fn malformed_filter_is_400() {
    let h = harness();
    let token = h.token("reader");

    let (status, _, body) = h.get("/redfish/v1/TaskService/Tasks?$filter=1abc", Some(&token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_id(&body), "Base.1.19.0.QueryParameterValueFormatError");
    assert_eq!(body["error"]["@Message.ExtendedInfo"][0]["MessageArgs"], json!(["abc", "$filter"]));

    // `not` is off by default
    let (status, _, _) = h
        .get("/redfish/v1/TaskService/Tasks?$filter=not%20(Id%20eq%20'0')", Some(&token))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_task_is_404() {
    let h = harness();
    let token = h.token("reader");
    let (status, _, body) = h.get("/redfish/v1/TaskService/Tasks/42", Some(&token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["@Message.ExtendedInfo"][0]["MessageArgs"], json!(["Task", "42"]));

    let (status, _, _) = h.get("/redfish/v1/TaskService/Tasks/42/Monitor", Some(&token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Task update
// ============================================================================

#[tokio::test]
async fn update_requires_configure_manager() {
    let h = harness();
    h.state.tasks.create_task(None, idle(), Duration::from_secs(60)).unwrap();
    let uri = "/redfish/v1/TaskService/Tasks/0/Update";
    let cancel = json!({"TaskState": "Cancelled"});

    let operator = h.token("operator");
    let (status, _, body) = h.send(Method::PATCH, uri, Some(&operator), Some(cancel.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_id(&body), "Base.1.19.0.InsufficientPrivilege");

    let root = h.token("root");
    let (status, _, _) = h.send(Method::PATCH, uri, Some(&root), Some(cancel.clone())).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(h.state.tasks.get(0).unwrap().state(), TaskState::Cancelled);

    // Terminal tasks cannot be changed again
    let (status, _, body) = h.send(Method::PATCH, uri, Some(&root), Some(json!({"TaskState": "Running"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_id(&body), "Base.1.19.0.PropertyValueNotInList");
}

#[tokio::test]
async fn update_validates_state_name() {
    let h = harness();
    h.state.tasks.create_task(None, idle(), Duration::from_secs(60)).unwrap();
    let root = h.token("root");

    let (status, _, _) = h
        .send(Method::PATCH, "/redfish/v1/TaskService/Tasks/0/Update", Some(&root), Some(json!({"TaskState": "Paused"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = h
        .send(Method::PATCH, "/redfish/v1/TaskService/Tasks/7/Update", Some(&root), Some(json!({"TaskState": "Completed"})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// IST mode action
// ============================================================================

const IST_ACTION: &str = "/redfish/v1/Managers/bmc/Actions/Oem/Manager.SetIstMode";

#[tokio::test(start_paused = true)]
async fn ist_mode_task_runs_to_completion() {
    let (h, calls) = ist_harness();
    let token = h.token("operator");

    let (status, headers, body) = h.send(Method::POST, IST_ACTION, Some(&token), Some(json!({"Enabled": true}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(headers[header::LOCATION], "/redfish/v1/TaskService/Tasks/0/Monitor");
    assert_eq!(headers[header::RETRY_AFTER], "30");
    assert_eq!(body["TaskState"], "Running");
    assert_eq!(*calls.lock().unwrap(), vec![true]);

    let monitor = "/redfish/v1/TaskService/Tasks/0/Monitor";
    h.emit_status(IST_STATUS_IN_PROGRESS);
    settle().await;
    let (status, _, _) = h.get(monitor, Some(&token)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    h.emit_status(&format!("{STATUS_PREFIX}.Enabled"));
    settle().await;
    let (status, _, body) = h.get(monitor, Some(&token)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
    let (status, _, _) = h.get(monitor, Some(&token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, task) = h.get("/redfish/v1/TaskService/Tasks/0", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["TaskState"], "Completed");
    assert_eq!(task["PercentComplete"], 100);
    assert_eq!(task["Payload"]["TargetUri"], IST_ACTION);
    assert_eq!(task["Payload"]["HttpOperation"], "POST");
    assert!(task.get("TaskMonitor").is_none());
}

#[tokio::test(start_paused = true)]
async fn ist_mode_unexpected_status_is_exception() {
    let (h, _) = ist_harness();
    let token = h.token("root");

    let (status, _, _) = h.send(Method::POST, IST_ACTION, Some(&token), Some(json!({"Enabled": true}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    h.emit_status(&format!("{STATUS_PREFIX}.Disabled"));
    settle().await;

    let (_, _, task) = h.get("/redfish/v1/TaskService/Tasks/0", Some(&token)).await;
    assert_eq!(task["TaskState"], "Exception");
    assert_eq!(task["TaskStatus"], "Critical");
    let last = task["Messages"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["MessageArgs"], json!(["Oem.IstMode", "Enabled Failed"]));
}

#[tokio::test(start_paused = true)]
async fn ist_mode_times_out() {
    let (h, _) = ist_harness();
    let token = h.token("root");
    h.send(Method::POST, IST_ACTION, Some(&token), Some(json!({"Enabled": false}))).await;

    tokio::time::sleep(Duration::from_secs(151)).await;
    assert_eq!(h.state.tasks.get(0).unwrap().state(), TaskState::Cancelled);
}

#[tokio::test]
async fn ist_mode_needs_enabled_parameter() {
    let (h, calls) = ist_harness();
    let token = h.token("root");

    let (status, _, body) = h.send(Method::POST, IST_ACTION, Some(&token), Some(json!({"Mode": "on"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_id(&body), "Base.1.19.0.ActionParameterMissing");
    assert!(calls.lock().unwrap().is_empty());
    assert!(h.state.tasks.is_empty());
}

#[tokio::test]
async fn ist_mode_forbidden_for_readonly() {
    let (h, calls) = ist_harness();
    let token = h.token("reader");

    let (status, _, _) = h.send(Method::POST, IST_ACTION, Some(&token), Some(json!({"Enabled": true}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(calls.lock().unwrap().is_empty());
}

/// A failed bus call leaves no task behind
#[tokio::test]
async fn ist_mode_bus_failure_is_500() {
    let h = harness();
    let token = h.token("root");

    let (status, _, body) = h.send(Method::POST, IST_ACTION, Some(&token), Some(json!({"Enabled": true}))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_id(&body), "Base.1.19.0.InternalError");
    assert!(h.state.tasks.is_empty());

    settle().await;
    assert_eq!(h.bus.subscriber_count(), 0);
}
