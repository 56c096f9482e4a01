//! Redfish message objects used in task resources and error bodies

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::task::TaskState;

const MESSAGE_ODATA_TYPE: &str = "#Message.v1_1_1.Message";
const TASK_EVENT_REGISTRY: &str = "TaskEvent.1.0.3";
const BASE_REGISTRY: &str = "Base.1.19.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "OK")]
    Ok,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Warning => "Warning",
            Severity::Critical => "Critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    #[serde(rename = "@odata.type", default = "default_odata_type")]
    pub odata_type: String,
    pub message_id: String,
    pub message: String,
    #[serde(default)]
    pub message_args: Vec<String>,
    pub message_severity: Severity,
    #[serde(default)]
    pub resolution: String,
}

fn default_odata_type() -> String {
    MESSAGE_ODATA_TYPE.to_string()
}

impl Message {
    fn new(registry: &str, id: &str, text: String, args: Vec<String>, severity: Severity, resolution: &str) -> Self {
        Self {
            odata_type: default_odata_type(),
            message_id: format!("{registry}.{id}"),
            message: text,
            message_args: args,
            message_severity: severity,
            resolution: resolution.to_string(),
        }
    }

    /// Registry-local id, e.g. `TaskStarted` for `TaskEvent.1.0.3.TaskStarted`
    pub fn short_id(&self) -> &str {
        self.message_id.rsplit('.').next().unwrap_or(&self.message_id)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ============================================================================
// Task events
// ============================================================================

pub fn task_started(index: u32) -> Message {
    Message::new(
        TASK_EVENT_REGISTRY,
        "TaskStarted",
        format!("The task with Id '{index}' has started."),
        vec![index.to_string()],
        Severity::Ok,
        "None.",
    )
}

pub fn task_completed_ok(index: u32) -> Message {
    Message::new(
        TASK_EVENT_REGISTRY,
        "TaskCompletedOK",
        format!("The task with Id '{index}' has completed."),
        vec![index.to_string()],
        Severity::Ok,
        "None.",
    )
}

pub fn task_completed_warning(index: u32) -> Message {
    Message::new(
        TASK_EVENT_REGISTRY,
        "TaskCompletedWarning",
        format!("The task with Id '{index}' has completed with warnings."),
        vec![index.to_string()],
        Severity::Warning,
        "None.",
    )
}

pub fn task_aborted(index: u32) -> Message {
    Message::new(
        TASK_EVENT_REGISTRY,
        "TaskAborted",
        format!("The task with Id '{index}' has been aborted."),
        vec![index.to_string()],
        Severity::Critical,
        "None.",
    )
}

pub fn task_cancelled(index: u32) -> Message {
    Message::new(
        TASK_EVENT_REGISTRY,
        "TaskCancelled",
        format!("The task with Id '{index}' has been cancelled."),
        vec![index.to_string()],
        Severity::Warning,
        "None.",
    )
}

pub fn task_progress_changed(index: u32, percent: u8) -> Message {
    Message::new(
        TASK_EVENT_REGISTRY,
        "TaskProgressChanged",
        format!("The task with Id '{index}' has changed to progress {percent} percent complete."),
        vec![index.to_string(), percent.to_string()],
        Severity::Ok,
        "None.",
    )
}

/// The event message for a task entering `state`, if that state has one
pub fn lifecycle_message(state: TaskState, index: u32) -> Option<Message> {
    match state {
        TaskState::New => None,
        TaskState::Running => Some(task_started(index)),
        TaskState::Completed => Some(task_completed_ok(index)),
        TaskState::Exception => Some(task_completed_warning(index)),
        TaskState::Cancelled => Some(task_cancelled(index)),
        TaskState::Aborted => Some(task_aborted(index)),
    }
}

// ============================================================================
// Base registry
// ============================================================================

pub fn resource_errors_detected_format_error(property: &str, error: &str) -> Message {
    Message::new(
        BASE_REGISTRY,
        "ResourceErrorsDetectedFormatError",
        format!("The resource property {property} has detected errors of type '{error}'."),
        vec![property.to_string(), error.to_string()],
        Severity::Critical,
        "Correct the resource property and resubmit the request if the operation failed.",
    )
}

pub fn insufficient_privilege() -> Message {
    Message::new(
        BASE_REGISTRY,
        "InsufficientPrivilege",
        "There are insufficient privileges for the account or credentials associated with the current session to perform the requested operation.".to_string(),
        Vec::new(),
        Severity::Critical,
        "Either abandon the operation or change the associated access rights and resubmit the request if the operation failed.",
    )
}

pub fn no_valid_session() -> Message {
    Message::new(
        BASE_REGISTRY,
        "NoValidSession",
        "There is no valid session established with the implementation.".to_string(),
        Vec::new(),
        Severity::Critical,
        "Establish a session before attempting any operations.",
    )
}

pub fn resource_not_found(kind: &str, name: &str) -> Message {
    Message::new(
        BASE_REGISTRY,
        "ResourceNotFound",
        format!("The requested resource of type {kind} named '{name}' was not found."),
        vec![kind.to_string(), name.to_string()],
        Severity::Critical,
        "Provide a valid resource identifier and resubmit the request.",
    )
}

pub fn query_parameter_value_format_error(value: &str, parameter: &str) -> Message {
    Message::new(
        BASE_REGISTRY,
        "QueryParameterValueFormatError",
        format!("The value '{value}' for the parameter {parameter} is of a different format than the parameter can accept."),
        vec![value.to_string(), parameter.to_string()],
        Severity::Warning,
        "Correct the value for the query parameter in the request and resubmit the request if the operation failed.",
    )
}

pub fn property_value_not_in_list(value: &str, property: &str) -> Message {
    Message::new(
        BASE_REGISTRY,
        "PropertyValueNotInList",
        format!("The value '{value}' for the property {property} is not in the list of acceptable values."),
        vec![value.to_string(), property.to_string()],
        Severity::Warning,
        "Choose a value from the enumeration list that the implementation can support and resubmit the request if the operation failed.",
    )
}

pub fn action_parameter_missing(action: &str, parameter: &str) -> Message {
    Message::new(
        BASE_REGISTRY,
        "ActionParameterMissing",
        format!("The action {action} requires the parameter {parameter} to be present in the request body."),
        vec![action.to_string(), parameter.to_string()],
        Severity::Critical,
        "Supply the action with the required parameter in the request body when the request is resubmitted.",
    )
}

pub fn internal_error() -> Message {
    Message::new(
        BASE_REGISTRY,
        "InternalError",
        "The request failed due to an internal service error.  The service is still operational.".to_string(),
        Vec::new(),
        Severity::Critical,
        "Resubmit the request.  If the problem persists, consider resetting the service.",
    )
}

/// Redfish error body wrapping `message`
pub fn error_body(message: &Message) -> Value {
    json!({
        "error": {
            "code": message.message_id,
            "message": message.message,
            "@Message.ExtendedInfo": [message.to_json()],
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_pascal_case() {
        let v = task_started(4).to_json();
        assert_eq!(v["MessageId"], "TaskEvent.1.0.3.TaskStarted");
        assert_eq!(v["MessageSeverity"], "OK");
        assert_eq!(v["MessageArgs"][0], "4");
        assert_eq!(v["@odata.type"], MESSAGE_ODATA_TYPE);
    }

    #[test]
    fn severity_orders_by_impact() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Ok);
    }
}
