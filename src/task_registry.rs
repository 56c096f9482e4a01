//! Task registry and per-task monitors
//!
//! The registry is the only long-lived owner of each task. Every task gets one
//! spawned monitor future that waits on the task's bus subscription, its
//! deadline and a wake-up notification; the monitor only holds weak
//! references, so removing a task from the registry ends it.
//!
//! Signal callbacks run with their own task locked and may call back into
//! the registry, so the list lock is never held while taking a task lock.
//! Eviction and removal abort a busy task through its monitor instead of
//! waiting on it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusError, MatchRule, Signal, Subscription};
use crate::constants::{
    DEFAULT_RETRY_AFTER_SECS, DEFAULT_TASK_TIMEOUT_SECS, MAX_TASK_COUNT, TASK_COLLECTION_URI,
};
use crate::error::{Error, Result};
use crate::messages::{self, Message};
use crate::task::{Completion, MonitorResponse, Payload, TaskCallback, TaskData, TaskState};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLimits {
    /// Tasks kept before the oldest is evicted
    pub max_tasks: usize,
    pub default_timeout: Duration,
    /// `Retry-After` seconds on 202 monitor responses
    pub retry_after: u64,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            max_tasks: MAX_TASK_COUNT,
            default_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            retry_after: DEFAULT_RETRY_AFTER_SECS,
        }
    }
}

/// Lifecycle event for one state transition
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub index: u32,
    pub state: TaskState,
    pub message: Message,
    /// URI of the task resource
    pub origin: String,
}

struct TaskEntry {
    index: u32,
    data: Mutex<TaskData>,
    wake: Arc<Notify>,
    /// Copy of the end time, readable without the data lock
    ended_at: OnceLock<DateTime<Utc>>,
    /// Dropped from the registry; the monitor aborts it if still running
    detached: AtomicBool,
}

impl TaskEntry {
    fn new(data: TaskData) -> Self {
        Self {
            index: data.index(),
            data: Mutex::new(data),
            wake: Arc::new(Notify::new()),
            ended_at: OnceLock::new(),
            detached: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskData> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `None` if another caller holds the task, possibly this thread from a callback
    fn try_lock(&self) -> Option<MutexGuard<'_, TaskData>> {
        match self.data.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    #[inline]
    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

struct TaskList {
    entries: VecDeque<Arc<TaskEntry>>,
    next_index: u32,
}

impl TaskList {
    /// Next free index; wraps around and skips indices still in use
    fn allocate_index(&mut self) -> u32 {
        loop {
            let index = self.next_index;
            self.next_index = self.next_index.wrapping_add(1);
            if !self.entries.iter().any(|e| e.index == index) {
                return index;
            }
        }
    }

    /// Oldest finished task by end time, otherwise the oldest task.
    /// Reads only `ended_at`, never the task data.
    fn evict(&mut self) -> Option<Arc<TaskEntry>> {
        let finished = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(pos, e)| e.ended_at.get().map(|end| (*end, pos)))
            .min()
            .map(|(_, pos)| pos);
        self.entries.remove(finished.unwrap_or(0))
    }
}

struct Shared {
    bus: Arc<dyn Bus>,
    limits: TaskLimits,
    tasks: Mutex<TaskList>,
    events: broadcast::Sender<TaskEvent>,
}

impl Shared {
    fn lock_tasks(&self) -> MutexGuard<'_, TaskList> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, index: u32, state: TaskState) {
        let Some(message) = messages::lifecycle_message(state, index) else {
            return;
        };
        // No receivers is fine
        let _ = self.events.send(TaskEvent {
            index,
            state,
            message,
            origin: format!("{TASK_COLLECTION_URI}/{index}"),
        });
    }

    /// Run `f` on the task under its lock, then publish any state change
    fn mutate<R>(&self, entry: &TaskEntry, f: impl FnOnce(&mut TaskData) -> R) -> R {
        self.apply(entry, entry.lock(), f)
    }

    fn try_mutate<R>(&self, entry: &TaskEntry, f: impl FnOnce(&mut TaskData) -> R) -> Option<R> {
        let data = entry.try_lock()?;
        Some(self.apply(entry, data, f))
    }

    fn apply<R>(
        &self,
        entry: &TaskEntry,
        mut data: MutexGuard<'_, TaskData>,
        f: impl FnOnce(&mut TaskData) -> R,
    ) -> R {
        let before = data.state();
        let result = f(&mut data);
        let after = data.state();
        if let Some(end) = data.end_time() {
            let _ = entry.ended_at.set(end);
        }
        drop(data);

        if before != after {
            self.emit(entry.index, after);
            if after.is_terminal() {
                entry.wake.notify_one();
            }
        }
        result
    }

    /// Abort a task that just left the registry. When the task is locked,
    /// possibly by the caller's own signal callback, its monitor does it on
    /// the next wake-up.
    fn detach(&self, entry: &TaskEntry) {
        entry.detached.store(true, Ordering::Release);
        if self
            .try_mutate(entry, |data| data.abort(messages::task_aborted(entry.index)))
            .is_none()
        {
            debug!(task = entry.index, "task busy, abort deferred to its monitor");
        }
        entry.wake.notify_one();
    }

    fn handle(self: &Arc<Self>, entry: &Arc<TaskEntry>) -> TaskHandle {
        TaskHandle {
            entry: Arc::clone(entry),
            shared: Arc::clone(self),
        }
    }
}

/// Process-wide collection of tasks
#[derive(Clone)]
pub struct TaskRegistry {
    shared: Arc<Shared>,
}

impl TaskRegistry {
    pub fn new(bus: Arc<dyn Bus>, limits: TaskLimits) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                bus,
                limits,
                tasks: Mutex::new(TaskList {
                    entries: VecDeque::new(),
                    next_index: 0,
                }),
                events,
            }),
        }
    }

    pub fn limits(&self) -> &TaskLimits {
        &self.shared.limits
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.shared.bus
    }

    /// Create a running task and start its monitor.
    ///
    /// With a match rule, `callback` runs for each matching signal; with `None`
    /// the task only ends through its handle, an update or the deadline.
    /// Must be called from within a Tokio runtime.
    pub fn create_task(
        &self,
        match_rule: Option<&str>,
        callback: TaskCallback,
        timeout: Duration,
    ) -> Result<TaskHandle> {
        let subscription = match match_rule {
            Some(text) => {
                let rule = MatchRule::parse(text)?;
                Some(self.shared.bus.subscribe(rule)?)
            }
            None => None,
        };
        let deadline = Instant::now() + timeout;

        let (entry, evicted) = {
            let mut tasks = self.shared.lock_tasks();
            let evicted = if tasks.entries.len() >= self.shared.limits.max_tasks.max(1) {
                tasks.evict()
            } else {
                None
            };
            let index = tasks.allocate_index();
            let mut data = TaskData::new(index, match_rule.map(str::to_string), deadline);
            data.start();
            let entry = Arc::new(TaskEntry::new(data));
            tasks.entries.push_back(Arc::clone(&entry));
            (entry, evicted)
        };

        if let Some(old) = evicted {
            warn!(task = old.index, "task limit reached, evicting");
            self.shared.detach(&old);
        }

        info!(task = entry.index, match_rule = ?match_rule, timeout_secs = timeout.as_secs(), "task created");
        self.shared.emit(entry.index, TaskState::Running);

        tokio::spawn(monitor(
            Arc::downgrade(&self.shared),
            Arc::downgrade(&entry),
            Arc::clone(&entry.wake),
            subscription,
            callback,
        ));

        Ok(self.shared.handle(&entry))
    }

    pub fn get(&self, index: u32) -> Option<TaskHandle> {
        let tasks = self.shared.lock_tasks();
        tasks
            .entries
            .iter()
            .find(|e| e.index == index)
            .map(|e| self.shared.handle(e))
    }

    /// Look a task up by its resource id (the decimal index)
    pub fn find(&self, id: &str) -> Option<TaskHandle> {
        let tasks = self.shared.lock_tasks();
        tasks
            .entries
            .iter()
            .find(|e| e.index.to_string() == id)
            .map(|e| self.shared.handle(e))
    }

    /// All tasks, oldest first
    pub fn list(&self) -> Vec<TaskHandle> {
        let tasks = self.shared.lock_tasks();
        tasks.entries.iter().map(|e| self.shared.handle(e)).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.lock_tasks().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a task from the registry. A task that is still running is aborted
    /// so its monitor lets go of the subscription.
    pub fn remove(&self, index: u32) -> Option<TaskHandle> {
        let entry = {
            let mut tasks = self.shared.lock_tasks();
            let pos = tasks.entries.iter().position(|e| e.index == index)?;
            tasks.entries.remove(pos)?
        };
        self.shared.detach(&entry);
        debug!(task = index, "task removed");
        Some(self.shared.handle(&entry))
    }

    /// `PATCH …/Update`: set state and/or replace messages
    pub fn update(&self, index: u32, state: Option<TaskState>, messages: Option<Vec<Message>>) -> Result<()> {
        let handle = self
            .get(index)
            .ok_or_else(|| Error::TaskNotFound(index.to_string()))?;
        handle.with(|data| data.update(state, messages))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Shared handle to one task
#[derive(Clone)]
pub struct TaskHandle {
    entry: Arc<TaskEntry>,
    shared: Arc<Shared>,
}

impl TaskHandle {
    #[inline]
    pub fn index(&self) -> u32 {
        self.entry.index
    }

    /// Mutate the task. State transitions made by `f` are published and a
    /// terminal one stops the monitor.
    pub fn with<R>(&self, f: impl FnOnce(&mut TaskData) -> R) -> R {
        self.shared.mutate(&self.entry, f)
    }

    pub fn read<R>(&self, f: impl FnOnce(&TaskData) -> R) -> R {
        f(&self.entry.lock())
    }

    pub fn state(&self) -> TaskState {
        self.read(TaskData::state)
    }

    pub fn percent_complete(&self) -> u8 {
        self.read(TaskData::percent_complete)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.read(|data| data.messages().to_vec())
    }

    /// Monitor response for the request that created the task
    pub fn populate_resp(&self) -> MonitorResponse {
        let retry_after = self.shared.limits.retry_after;
        self.entry.lock().populate_resp(retry_after)
    }

    pub fn poll_monitor(&self) -> MonitorResponse {
        let retry_after = self.shared.limits.retry_after;
        self.entry.lock().poll_monitor(retry_after)
    }

    /// Re-arm the deadline `timeout` from now
    pub fn extend_timer(&self, timeout: Duration) {
        let changed = {
            let mut data = self.entry.lock();
            if data.is_terminal() {
                false
            } else {
                data.set_deadline(Instant::now() + timeout);
                true
            }
        };
        if changed {
            self.entry.wake.notify_one();
        }
    }

    pub fn set_payload(&self, payload: Payload) {
        self.entry.lock().set_payload(payload);
    }

    pub fn set_response(&self, body: Value) {
        self.entry.lock().set_response(body);
    }

    pub fn resource_json(&self) -> Value {
        self.read(TaskData::to_resource_json)
    }
}

// ============================================================================
// Monitor
// ============================================================================

async fn next_signal(subscription: &mut Option<Subscription>) -> Option<std::result::Result<Signal, BusError>> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Drives one task until it is terminal or gone. Dropping `subscription` on
/// exit removes the bus match.
async fn monitor(
    shared: Weak<Shared>,
    entry: Weak<TaskEntry>,
    wake: Arc<Notify>,
    mut subscription: Option<Subscription>,
    mut callback: TaskCallback,
) {
    loop {
        let deadline = {
            let (Some(shared), Some(entry)) = (shared.upgrade(), entry.upgrade()) else { break };
            if entry.is_detached() {
                shared.mutate(&entry, |data| data.abort(messages::task_aborted(entry.index)));
                break;
            }
            let data = entry.lock();
            if data.is_terminal() {
                break;
            }
            data.deadline()
        };

        tokio::select! {
            // Deadline before signals: a timeout wins a tie with a late signal
            biased;

            _ = wake.notified() => {}

            _ = sleep_until(deadline) => {
                let (Some(shared), Some(entry)) = (shared.upgrade(), entry.upgrade()) else { break };
                let timed_out = shared.mutate(&entry, |data| {
                    Instant::now() >= data.deadline() && data.time_out()
                });
                if timed_out {
                    warn!(task = entry.index, "task timed out");
                }
            }

            received = next_signal(&mut subscription) => {
                let (Some(shared), Some(entry)) = (shared.upgrade(), entry.upgrade()) else { break };
                match received {
                    Some(Ok(signal)) => {
                        shared.mutate(&entry, |data| {
                            if data.is_terminal() {
                                return;
                            }
                            let percent = data.percent_complete();
                            if callback(&signal, &mut *data) == Completion::Completed {
                                data.complete();
                            }
                            if !data.is_terminal() && data.percent_complete() > percent {
                                debug!(task = entry.index, percent = data.percent_complete(), "task progress");
                            }
                        });
                    }
                    Some(Err(err)) => {
                        error!(task = entry.index, error = %err, "task subscription failed");
                        shared.mutate(&entry, |data| {
                            data.cancel(messages::resource_errors_detected_format_error("Subscription", &err.to_string()))
                        });
                    }
                    None => {
                        error!(task = entry.index, "task subscription closed");
                        let err = BusError::Disconnected;
                        shared.mutate(&entry, |data| {
                            data.cancel(messages::resource_errors_detected_format_error("Subscription", &err.to_string()))
                        });
                    }
                }
            }
        }
    }
    debug!("task monitor exiting");
}
