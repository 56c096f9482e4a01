//! Task callbacks that wait for a bus property to reach a value

use tracing::{debug, warn};

use crate::bus::{BusValue, Signal};
use crate::messages;
use crate::task::{Completion, TaskCallback, TaskData};

/// Last dotted component: `xyz.Manager.Status.Enabled` → `Enabled`
#[inline]
fn short_value(value: &str) -> &str {
    value.rsplit('.').next().unwrap_or(value)
}

/// Watches one string property in PropertiesChanged signals.
///
/// Signals without the property, or with a non-string value, are ignored.
/// Values registered with [`in_progress`](Self::in_progress) are ignored too.
/// The awaited value completes the task; anything else fails it.
/// Values compare on their last dotted component.
#[derive(Debug, Clone)]
pub struct PropertyWatch {
    property: String,
    awaited: String,
    in_progress: Vec<String>,
    progress_property: Option<String>,
    context: String,
}

impl PropertyWatch {
    pub fn new(property: &str, awaited: &str) -> Self {
        Self {
            property: property.to_string(),
            awaited: awaited.to_string(),
            in_progress: Vec::new(),
            progress_property: None,
            context: property.to_string(),
        }
    }

    pub fn in_progress(mut self, value: &str) -> Self {
        self.in_progress.push(value.to_string());
        self
    }

    /// Numeric property feeding percent complete
    pub fn progress_from(mut self, property: &str) -> Self {
        self.progress_property = Some(property.to_string());
        self
    }

    /// Property name reported in the failure message
    pub fn context(mut self, name: &str) -> Self {
        self.context = name.to_string();
        self
    }

    pub fn evaluate(&self, signal: &Signal, task: &mut TaskData) -> Completion {
        if let Some(percent) = self
            .progress_property
            .as_deref()
            .and_then(|p| signal.property(p))
            .and_then(BusValue::as_u64)
        {
            task.set_percent_complete(percent.min(100) as u8);
        }

        let Some(value) = signal.property(&self.property) else {
            debug!(task = task.index(), property = %self.property, "signal without watched property");
            return Completion::Pending;
        };
        let Some(value) = value.as_str() else {
            warn!(task = task.index(), property = %self.property, "watched property is not a string");
            return Completion::Pending;
        };

        let value = short_value(value);
        if self.in_progress.iter().any(|p| short_value(p) == value) {
            return Completion::Pending;
        }
        if value == short_value(&self.awaited) {
            task.complete();
            return Completion::Completed;
        }
        let error = format!("{} Failed", short_value(&self.awaited));
        task.fail(messages::resource_errors_detected_format_error(&self.context, &error));
        Completion::Completed
    }

    pub fn into_callback(self) -> TaskCallback {
        Box::new(move |signal: &Signal, task: &mut TaskData| self.evaluate(signal, task))
    }
}
