//! Redfish HTTP front end
//!
//! Every route goes through [`authorize`]: the matched route pattern and verb
//! are checked against the privilege registry before any handler runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::auth::{SessionStore, UserSession};
use crate::authz::Authorizer;
use crate::bus::{Bus, MatchRule, MethodCall};
use crate::config::Config;
use crate::constants::{
    CONFIGURE_MANAGER, ROLE_COLLECTION_URI, ROUTE_IST_MODE, ROUTE_ROLE,
    ROUTE_SERVICE_ROOT, ROUTE_SESSION, ROUTE_SESSIONS, ROUTE_TASK, ROUTE_TASKS,
    ROUTE_TASK_MONITOR, ROUTE_TASK_SERVICE, ROUTE_TASK_UPDATE, SESSION_COLLECTION_URI,
    TASK_COLLECTION_URI,
};
use crate::error::Error;
use crate::filter::{FilterExpr, ParseError, ParserOptions};
use crate::messages::{self, Message};
use crate::privileges::assigned_privileges;
use crate::registry::{PrivilegeRegistry, Verb};
use crate::task::{MonitorResponse, Payload, TaskState};
use crate::task_registry::TaskRegistry;
use crate::watch::PropertyWatch;

// IST mode manager on the bus
pub const IST_SERVICE: &str = "xyz.openbmc_project.IstModeManager";
pub const IST_PATH: &str = "/xyz/openbmc_project/IstModeManager";
pub const IST_INTERFACE: &str = "xyz.openbmc_project.IstModeManager.Server";
pub const IST_SET_METHOD: &str = "SetISTMode";
pub const IST_STATUS_PROPERTY: &str = "Status";
pub const IST_STATUS_IN_PROGRESS: &str = "xyz.openbmc_project.IstModeManager.Server.Status.InProgress";
pub const IST_TASK_TIMEOUT: Duration = Duration::from_secs(150);

const X_AUTH_TOKEN: &str = "x-auth-token";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no valid session")]
    Unauthenticated,

    #[error("insufficient privilege")]
    Forbidden,

    #[error(transparent)]
    Filter(#[from] ParseError),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("bad request: {}", .0.message)]
    BadRequest(Message),

    #[error("internal error: {0}")]
    Internal(Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Filter(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> Message {
        match self {
            Self::Unauthenticated => messages::no_valid_session(),
            Self::Forbidden => messages::insufficient_privilege(),
            Self::Filter(e) => messages::query_parameter_value_format_error(&e.remainder, "$filter"),
            Self::NotFound { kind, id } => messages::resource_not_found(kind, id),
            Self::BadRequest(m) => m.clone(),
            Self::Internal(_) => messages::internal_error(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Filter(e) => Self::Filter(e),
            Error::TaskNotFound(id) => Self::NotFound { kind: "Task", id },
            Error::Session(_) => Self::Unauthenticated,
            Error::InvalidTransition { to, .. } => {
                Self::BadRequest(messages::property_value_not_in_list(to.as_str(), "TaskState"))
            }
            other => Self::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(e) = &self {
            error!(error = %e, "request failed");
        }
        (self.status_code(), Json(messages::error_body(&self.message()))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub tasks: TaskRegistry,
    pub sessions: Arc<SessionStore>,
    pub authorizer: Arc<Authorizer>,
    pub filter_options: ParserOptions,
}

impl AppState {
    pub fn new(config: &Config, bus: Arc<dyn Bus>) -> crate::Result<Self> {
        Ok(Self {
            tasks: TaskRegistry::new(bus, config.task.limits()),
            sessions: Arc::new(SessionStore::from_config(&config.session, &config.accounts)?),
            authorizer: Arc::new(Authorizer::new(PrivilegeRegistry::with_defaults())),
            filter_options: config.filter.parser_options(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(ROUTE_SERVICE_ROOT, get(service_root))
        .route(ROUTE_SESSIONS, get(session_collection).post(create_session))
        .route(ROUTE_SESSION, get(get_session).delete(delete_session))
        .route(ROUTE_TASK_SERVICE, get(task_service))
        .route(ROUTE_TASKS, get(task_collection))
        .route(ROUTE_TASK, get(get_task))
        .route(ROUTE_TASK_MONITOR, get(task_monitor))
        .route(ROUTE_TASK_UPDATE, patch(update_task))
        .route(ROUTE_ROLE, get(get_role))
        .route(ROUTE_IST_MODE, post(set_ist_mode))
        .route_layer(middleware::from_fn_with_state(state.clone(), authorize))
        .with_state(state)
}

// ============================================================================
// Authentication / authorization
// ============================================================================

fn token_from(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers.get(X_AUTH_TOKEN).and_then(|v| v.to_str().ok()) {
        return Some(token);
    }
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Resolve the session, then check the matched route against the registry
async fn authorize(State(state): State<AppState>, mut req: Request, next: Next) -> ApiResult<Response> {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    let Some(verb) = Verb::from_method(req.method().as_str()) else {
        return Err(ApiError::Forbidden);
    };

    let session = token_from(req.headers()).and_then(|t| state.sessions.validate(t).ok());
    let user = session.as_ref().map(UserSession::privileges).unwrap_or_default();
    if session.is_none() && state.authorizer.requires_session(&route, verb) {
        return Err(ApiError::Unauthenticated);
    }
    if !state.authorizer.authorize(&route, verb, &user).is_allowed() {
        return Err(ApiError::Forbidden);
    }

    if let Some(session) = session {
        req.extensions_mut().insert(session);
    }
    Ok(next.run(req).await)
}

// ============================================================================
// Service root / roles
// ============================================================================

async fn service_root() -> Json<Value> {
    Json(json!({
        "@odata.id": ROUTE_SERVICE_ROOT,
        "@odata.type": "#ServiceRoot.v1_15_0.ServiceRoot",
        "Id": "RootService",
        "Name": "Root Service",
        "RedfishVersion": "1.17.0",
        "SessionService": { "@odata.id": "/redfish/v1/SessionService" },
        "AccountService": { "@odata.id": "/redfish/v1/AccountService" },
        "Tasks": { "@odata.id": ROUTE_TASK_SERVICE },
        "Links": { "Sessions": { "@odata.id": SESSION_COLLECTION_URI } },
    }))
}

async fn get_role(Path(role_id): Path<String>) -> ApiResult<Json<Value>> {
    let privileges = assigned_privileges(&role_id).ok_or_else(|| ApiError::NotFound {
        kind: "Role",
        id: role_id.clone(),
    })?;
    Ok(Json(json!({
        "@odata.id": format!("{ROLE_COLLECTION_URI}/{role_id}"),
        "@odata.type": "#Role.v1_3_1.Role",
        "Id": role_id,
        "Name": "User Role",
        "Description": format!("{role_id} User Role"),
        "RoleId": role_id,
        "IsPredefined": true,
        "AssignedPrivileges": privileges,
        "OemPrivileges": [],
    })))
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoginRequest {
    user_name: String,
    password: String,
}

fn session_json(session: &UserSession) -> Value {
    json!({
        "@odata.id": format!("{SESSION_COLLECTION_URI}/{}", session.id),
        "@odata.type": "#Session.v1_5_0.Session",
        "Id": session.id,
        "Name": "User Session",
        "Description": "Manager User Session",
        "UserName": session.username,
    })
}

async fn create_session(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> ApiResult<Response> {
    let (token, session) = state.sessions.login(&req.user_name, &req.password)?;
    let location = format!("{SESSION_COLLECTION_URI}/{}", session.id);
    Ok((
        StatusCode::CREATED,
        [
            (HeaderName::from_static(X_AUTH_TOKEN), token),
            (header::LOCATION, location),
        ],
        Json(session_json(&session)),
    )
        .into_response())
}

async fn session_collection(State(state): State<AppState>) -> Json<Value> {
    let members: Vec<Value> = state
        .sessions
        .list()
        .iter()
        .map(|s| json!({ "@odata.id": format!("{SESSION_COLLECTION_URI}/{}", s.id) }))
        .collect();
    Json(json!({
        "@odata.id": SESSION_COLLECTION_URI,
        "@odata.type": "#SessionCollection.SessionCollection",
        "Name": "Session Collection",
        "Members@odata.count": members.len(),
        "Members": members,
    }))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state
        .sessions
        .list()
        .iter()
        .find(|s| s.id == id)
        .map(|s| Json(session_json(s)))
        .ok_or(ApiError::NotFound { kind: "Session", id })
}

/// Own session, or any session with ConfigureManager
async fn delete_session(
    State(state): State<AppState>,
    Extension(caller): Extension<UserSession>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if caller.id != id && !caller.privileges().contains(CONFIGURE_MANAGER) {
        return Err(ApiError::Forbidden);
    }
    if !state.sessions.revoke_by_id(&id) {
        return Err(ApiError::NotFound { kind: "Session", id });
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Tasks
// ============================================================================

async fn task_service(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "@odata.id": ROUTE_TASK_SERVICE,
        "@odata.type": "#TaskService.v1_1_4.TaskService",
        "Id": "TaskService",
        "Name": "Task Service",
        "DateTime": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false),
        "CompletedTaskOverWritePolicy": "Oldest",
        "LifeCycleEventOnTaskStateChange": true,
        "ServiceEnabled": true,
        "Status": { "State": "Enabled" },
        "Tasks": { "@odata.id": TASK_COLLECTION_URI },
        "Oem": { "MaxTasks": state.tasks.limits().max_tasks },
    }))
}

/// `$filter` applies to the full Task resources; members are listed by reference
async fn task_collection(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let filter = match params.get("$filter") {
        Some(text) => Some(FilterExpr::parse_with(text, state.filter_options).map_err(|e| {
            warn!(filter = %text, remainder = %e.remainder, offset = e.offset, "rejecting $filter");
            e
        })?),
        None => None,
    };

    let members: Vec<Value> = state
        .tasks
        .list()
        .iter()
        .map(|task| task.resource_json())
        .filter(|resource| filter.as_ref().map_or(true, |f| f.matches(resource)))
        .map(|resource| json!({ "@odata.id": resource["@odata.id"] }))
        .collect();

    Ok(Json(json!({
        "@odata.id": TASK_COLLECTION_URI,
        "@odata.type": "#TaskCollection.TaskCollection",
        "Name": "Task Collection",
        "Members@odata.count": members.len(),
        "Members": members,
    })))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let task = state
        .tasks
        .find(&id)
        .ok_or(ApiError::NotFound { kind: "Task", id })?;
    Ok(Json(task.resource_json()))
}

fn monitor_response(id: String, response: MonitorResponse) -> Response {
    match response {
        MonitorResponse::Accepted { body, location, retry_after } => (
            StatusCode::ACCEPTED,
            [
                (header::LOCATION, location),
                (header::RETRY_AFTER, retry_after.to_string()),
            ],
            Json(body),
        )
            .into_response(),
        MonitorResponse::Response(body) => (StatusCode::OK, Json(body)).into_response(),
        MonitorResponse::NoContent => StatusCode::NO_CONTENT.into_response(),
        MonitorResponse::Gone => ApiError::NotFound { kind: "Monitor", id }.into_response(),
    }
}

async fn task_monitor(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let Some(task) = state.tasks.find(&id) else {
        return Err(ApiError::NotFound { kind: "Monitor", id });
    };
    Ok(monitor_response(id, task.poll_monitor()))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskUpdate {
    task_state: Option<String>,
    messages: Option<Vec<Message>>,
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> ApiResult<StatusCode> {
    let task = state
        .tasks
        .find(&id)
        .ok_or(ApiError::NotFound { kind: "Task", id })?;
    let task_state = match update.task_state.as_deref() {
        Some(name) => Some(TaskState::from_name(name).ok_or_else(|| {
            ApiError::BadRequest(messages::property_value_not_in_list(name, "TaskState"))
        })?),
        None => None,
    };
    state.tasks.update(task.index(), task_state, update.messages)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// IST mode action
// ============================================================================

/// Ask the IST mode manager for a mode change and hand back a task that
/// follows its `Status` property.
async fn set_ist_mode(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let Some(enabled) = body.get("Enabled").and_then(Value::as_bool) else {
        return Err(ApiError::BadRequest(messages::action_parameter_missing(
            "Manager.SetIstMode",
            "Enabled",
        )));
    };
    let awaited = if enabled { "Enabled" } else { "Disabled" };

    // Subscribe before the call so the first status change cannot be missed
    let rule = MatchRule::properties_changed(IST_PATH, IST_INTERFACE).to_string();
    let watch = PropertyWatch::new(IST_STATUS_PROPERTY, awaited)
        .in_progress(IST_STATUS_IN_PROGRESS)
        .context("Oem.IstMode");
    let task = state
        .tasks
        .create_task(Some(&rule), watch.into_callback(), IST_TASK_TIMEOUT)?;

    let call = MethodCall::new(IST_SERVICE, IST_PATH, IST_INTERFACE, IST_SET_METHOD).arg(enabled);
    if let Err(err) = state.tasks.bus().call(call).await {
        state.tasks.remove(task.index());
        return Err(ApiError::Internal(err.into()));
    }

    let captured: Vec<(&str, &str)> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect();
    task.set_payload(Payload::new(uri.path(), method.as_str(), captured, body));
    Ok(monitor_response(task.index().to_string(), task.populate_resp()))
}
