//! Task state machine
//!
//! A task moves `New → Running → {Completed | Cancelled | Exception | Aborted}`.
//! Terminal states absorb: once one is reached every mutator is a no-op, so
//! whichever of completion, failure or timeout gets there first wins.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::info;

use crate::bus::Signal;
use crate::constants::{TASK_COLLECTION_URI, TASK_ODATA_TYPE};
use crate::error::{Error, Result};
use crate::messages::{self, Message, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    New,
    Running,
    Completed,
    Cancelled,
    Exception,
    Aborted,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::New,
        TaskState::Running,
        TaskState::Completed,
        TaskState::Cancelled,
        TaskState::Exception,
        TaskState::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "New",
            TaskState::Running => "Running",
            TaskState::Completed => "Completed",
            TaskState::Cancelled => "Cancelled",
            TaskState::Exception => "Exception",
            TaskState::Aborted => "Aborted",
        }
    }

    pub fn from_name(name: &str) -> Option<TaskState> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Exception | TaskState::Aborted
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a signal callback reports back to the task monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Not informative yet, keep listening
    Pending,
    /// Done; the monitor completes the task if the callback left it running
    Completed,
}

/// Signal handler for one task. It gets the task locked for the duration of the call.
pub type TaskCallback = Box<dyn FnMut(&Signal, &mut TaskData) -> Completion + Send>;

// ============================================================================
// Payload
// ============================================================================

const HEADER_WHITELIST: [&str; 7] = [
    "Accept",
    "Accept-Encoding",
    "User-Agent",
    "Host",
    "Connection",
    "Content-Length",
    "Upgrade",
];

/// The request that started a task, kept for the Task resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Payload {
    pub target_uri: String,
    pub http_operation: String,
    /// `Name: value` lines
    pub http_headers: Vec<String>,
    pub json_body: Value,
}

impl Payload {
    /// Only whitelisted headers and `Location` are kept
    pub fn new<'h, I>(target_uri: &str, http_operation: &str, headers: I, json_body: Value) -> Self
    where
        I: IntoIterator<Item = (&'h str, &'h str)>,
    {
        let http_headers = headers
            .into_iter()
            .filter_map(|(name, value)| {
                HEADER_WHITELIST
                    .iter()
                    .chain(std::iter::once(&"Location"))
                    .find(|allowed| allowed.eq_ignore_ascii_case(name))
                    .map(|canonical| format!("{canonical}: {value}"))
            })
            .collect();
        Self {
            target_uri: target_uri.to_string(),
            http_operation: http_operation.to_string(),
            http_headers,
            json_body,
        }
    }

    /// Value of a captured `Location` header
    pub fn location(&self) -> Option<&str> {
        self.http_headers
            .iter()
            .find_map(|h| h.strip_prefix("Location: "))
    }

    fn to_json(&self) -> Value {
        json!({
            "TargetUri": self.target_uri,
            "HttpOperation": self.http_operation,
            "HttpHeaders": self.http_headers,
            "JsonBody": self.json_body.to_string(),
        })
    }
}

/// Result of the operation, served from the monitor once the task completed OK
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResponse {
    pub body: Value,
}

/// What a poll of the task monitor produces
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorResponse {
    /// 202 with the task body and `Location`/`Retry-After` headers
    Accepted {
        body: Value,
        location: String,
        retry_after: u64,
    },
    /// 200 with the stored operation result
    Response(Value),
    /// 204, given exactly once after the task ended
    NoContent,
    /// 404, the monitor has expired
    Gone,
}

// ============================================================================
// TaskData
// ============================================================================

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, false)
}

#[derive(Debug, Clone)]
pub struct TaskData {
    index: u32,
    state: TaskState,
    percent_complete: u8,
    messages: Vec<Message>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    payload: Option<Payload>,
    response: Option<TaskResponse>,
    match_rule: Option<String>,
    deadline: Instant,
    gave_204: bool,
}

impl TaskData {
    pub fn new(index: u32, match_rule: Option<String>, deadline: Instant) -> Self {
        Self {
            index,
            state: TaskState::New,
            percent_complete: 0,
            messages: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            payload: None,
            response: None,
            match_rule,
            deadline,
            gave_204: false,
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn percent_complete(&self) -> u8 {
        self.percent_complete
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn response(&self) -> Option<&TaskResponse> {
        self.response.as_ref()
    }

    pub fn match_rule(&self) -> Option<&str> {
        self.match_rule.as_deref()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn gave_204(&self) -> bool {
        self.gave_204
    }

    pub fn uri(&self) -> String {
        format!("{TASK_COLLECTION_URI}/{}", self.index)
    }

    pub fn monitor_uri(&self) -> String {
        format!("{}/Monitor", self.uri())
    }

    /// Worst severity across the messages
    pub fn status(&self) -> Severity {
        self.messages
            .iter()
            .map(|m| m.message_severity)
            .max()
            .unwrap_or(Severity::Ok)
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// `New → Running`, recording TaskStarted
    pub fn start(&mut self) -> bool {
        if self.state != TaskState::New {
            return false;
        }
        self.state = TaskState::Running;
        self.messages.push(messages::task_started(self.index));
        true
    }

    /// Raise percent complete. Lower values are ignored, values over 100 clamp.
    pub fn set_percent_complete(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if self.is_terminal() || percent <= self.percent_complete {
            return false;
        }
        self.percent_complete = percent;
        true
    }

    pub fn push_message(&mut self, message: Message) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = Some(payload);
    }

    pub fn set_response(&mut self, body: Value) {
        self.response = Some(TaskResponse { body });
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = deadline;
    }

    /// Move to terminal `state`. Only the first terminal transition takes
    /// effect; later ones return false and change nothing.
    pub fn finish(&mut self, state: TaskState, message: Option<Message>) -> bool {
        if self.is_terminal() || !state.is_terminal() {
            return false;
        }
        self.state = state;
        if state == TaskState::Completed {
            self.percent_complete = 100;
        }
        if let Some(message) = message {
            self.messages.push(message);
        }
        self.end_time = Some(Utc::now());
        info!(task = self.index, state = %state, "task finished");
        true
    }

    pub fn complete(&mut self) -> bool {
        let message = messages::task_completed_ok(self.index);
        self.finish(TaskState::Completed, Some(message))
    }

    /// Backend reported an error: `Exception`
    pub fn fail(&mut self, message: Message) -> bool {
        self.finish(TaskState::Exception, Some(message))
    }

    pub fn cancel(&mut self, message: Message) -> bool {
        self.finish(TaskState::Cancelled, Some(message))
    }

    pub fn abort(&mut self, message: Message) -> bool {
        self.finish(TaskState::Aborted, Some(message))
    }

    /// Deadline elapsed: `Cancelled` with a TaskAborted message
    pub fn time_out(&mut self) -> bool {
        let message = messages::task_aborted(self.index);
        self.finish(TaskState::Cancelled, Some(message))
    }

    /// External update (`PATCH …/Update`). Messages replace the current list.
    pub fn update(&mut self, state: Option<TaskState>, messages: Option<Vec<Message>>) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: state.unwrap_or(self.state),
            });
        }
        match state {
            Some(to) if to == self.state => {}
            Some(TaskState::New) => {
                return Err(Error::InvalidTransition { from: self.state, to: TaskState::New })
            }
            Some(TaskState::Running) => {
                self.start();
            }
            Some(to) => {
                if let Some(messages) = messages {
                    self.messages = messages;
                }
                self.finish(to, None);
                return Ok(());
            }
            None => {}
        }
        if let Some(messages) = messages {
            self.messages = messages;
        }
        Ok(())
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    /// Monitor response for the request that created the task, or for a poll
    pub fn populate_resp(&mut self, retry_after: u64) -> MonitorResponse {
        if self.end_time.is_none() {
            let mut body = json!({
                "@odata.id": self.uri(),
                "@odata.type": TASK_ODATA_TYPE,
                "Id": self.index.to_string(),
                "TaskState": self.state,
                "TaskStatus": self.status().as_str(),
                "PercentComplete": self.percent_complete,
                "TaskMonitor": self.monitor_uri(),
            });
            body["Messages"] = Value::Array(self.messages.iter().map(Message::to_json).collect());
            return MonitorResponse::Accepted {
                body,
                location: self.monitor_uri(),
                retry_after,
            };
        }
        if !self.gave_204 {
            self.gave_204 = true;
            return MonitorResponse::NoContent;
        }
        MonitorResponse::Gone
    }

    /// `GET …/Monitor`: the stored result once completed OK, otherwise the
    /// 202/204/404 sequence of [`populate_resp`](Self::populate_resp).
    pub fn poll_monitor(&mut self, retry_after: u64) -> MonitorResponse {
        if self.state == TaskState::Completed && self.status() == Severity::Ok {
            if let Some(response) = &self.response {
                return MonitorResponse::Response(response.body.clone());
            }
        }
        if self.gave_204 {
            return MonitorResponse::Gone;
        }
        match self.populate_resp(retry_after) {
            MonitorResponse::Accepted { body, retry_after, .. } => {
                let location = self
                    .payload
                    .as_ref()
                    .and_then(Payload::location)
                    .map(str::to_string)
                    .unwrap_or_else(|| self.monitor_uri());
                MonitorResponse::Accepted { body, location, retry_after }
            }
            other => other,
        }
    }

    /// The full Task resource
    pub fn to_resource_json(&self) -> Value {
        let mut body = Map::new();
        body.insert("@odata.id".into(), json!(self.uri()));
        body.insert("@odata.type".into(), json!(TASK_ODATA_TYPE));
        body.insert("Id".into(), json!(self.index.to_string()));
        body.insert("Name".into(), json!(format!("Task {}", self.index)));
        body.insert("TaskState".into(), json!(self.state));
        body.insert("TaskStatus".into(), json!(self.status().as_str()));
        body.insert("StartTime".into(), json!(format_time(&self.start_time)));
        if let Some(end) = &self.end_time {
            body.insert("EndTime".into(), json!(format_time(end)));
        }
        body.insert(
            "Messages".into(),
            Value::Array(self.messages.iter().map(Message::to_json).collect()),
        );
        body.insert("PercentComplete".into(), json!(self.percent_complete));
        if !self.gave_204 {
            body.insert("TaskMonitor".into(), json!(self.monitor_uri()));
        }
        body.insert("HidePayload".into(), json!(self.payload.is_none()));
        if let Some(payload) = &self.payload {
            body.insert("Payload".into(), payload.to_json());
        }
        Value::Object(body)
    }

    /// Collection member reference
    pub fn member_json(&self) -> Value {
        json!({ "@odata.id": self.uri() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> TaskData {
        let mut task = TaskData::new(1, None, Instant::now());
        task.start();
        task
    }

    #[test]
    fn states_round_trip_names() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::from_name(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::from_name("Killed"), None);
    }

    #[test]
    fn payload_keeps_whitelist_and_location() {
        let payload = Payload::new(
            "/redfish/v1/x",
            "POST",
            [("accept", "*/*"), ("Cookie", "secret"), ("Location", "/elsewhere")],
            json!({}),
        );
        assert_eq!(payload.http_headers, vec!["Accept: */*", "Location: /elsewhere"]);
        assert_eq!(payload.location(), Some("/elsewhere"));
    }

    #[test]
    fn update_rejects_terminal_and_new() {
        let mut task = running();
        assert!(task.update(Some(TaskState::New), None).is_err());
        task.update(Some(TaskState::Exception), None).unwrap();
        assert_eq!(task.state(), TaskState::Exception);
        assert!(task.update(Some(TaskState::Running), None).is_err());
    }

    #[test]
    fn status_rolls_up_worst_severity() {
        let mut task = running();
        assert_eq!(task.status(), Severity::Ok);
        task.push_message(messages::task_cancelled(1));
        assert_eq!(task.status(), Severity::Warning);
        task.push_message(messages::task_aborted(1));
        task.push_message(messages::task_progress_changed(1, 5));
        assert_eq!(task.status(), Severity::Critical);
    }
}
