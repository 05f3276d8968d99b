//! Process-wide task state: one handle per conversion, a bounded log
//! ring, and the broadcast channel every lifecycle event fans out on.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const LOG_RING_CAPACITY: usize = 2048;
/// stderr lines joined into a runtime failure message.
pub const ERROR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Errored,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are sticky until the task is dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Errored | TaskStatus::Cancelled
        )
    }
}

/// Signals delivered to the supervisor of a running task. Cancellation
/// travels on the task's [`CancellationToken`] instead so it can be
/// observed even before the control loop is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Resume,
}

/// How a task left the running state.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    Errored(String),
    Cancelled,
}

/// The event vocabulary published to the UI collaborator.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(tag = "event")]
pub enum ConversionEvent {
    #[serde(rename = "conversion-started")]
    Started { id: String },
    #[serde(rename = "conversion-progress")]
    Progress { id: String, progress: f64 },
    #[serde(rename = "conversion-log")]
    Log { id: String, line: String },
    #[serde(rename = "conversion-completed")]
    #[serde(rename_all = "camelCase")]
    Completed {
        id: String,
        #[schema(value_type = String)]
        output_path: PathBuf,
    },
    #[serde(rename = "conversion-error")]
    Error { id: String, error: String },
    #[serde(rename = "conversion-cancelled")]
    Cancelled { id: String },
}

impl ConversionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConversionEvent::Started { .. } => "conversion-started",
            ConversionEvent::Progress { .. } => "conversion-progress",
            ConversionEvent::Log { .. } => "conversion-log",
            ConversionEvent::Completed { .. } => "conversion-completed",
            ConversionEvent::Error { .. } => "conversion-error",
            ConversionEvent::Cancelled { .. } => "conversion-cancelled",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            ConversionEvent::Started { id }
            | ConversionEvent::Progress { id, .. }
            | ConversionEvent::Log { id, .. }
            | ConversionEvent::Completed { id, .. }
            | ConversionEvent::Error { id, .. }
            | ConversionEvent::Cancelled { id } => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversionEvent::Completed { .. }
                | ConversionEvent::Error { .. }
                | ConversionEvent::Cancelled { .. }
        )
    }
}

/// Best-effort fan-out; a slow or absent consumer never blocks the
/// supervisor.
#[derive(Debug, Clone)]
pub struct EventChannel(broadcast::Sender<ConversionEvent>);

impl EventChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self(tx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversionEvent> {
        self.0.subscribe()
    }

    pub fn send(&self, event: ConversionEvent) {
        let _ = self.0.send(event);
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded ring of recent stderr lines; the oldest drop on overflow.
#[derive(Debug)]
pub struct LogRing {
    capacity: usize,
    lines: VecDeque<String>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        self.lines
            .iter()
            .skip(self.lines.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug)]
pub struct TaskHandle {
    pub id: String,
    /// Internal identifier for tracing; caller ids are reusable.
    pub run_id: Uuid,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub status: TaskStatus,
    pub progress: f64,
    pub logs: LogRing,
    pub created: OffsetDateTime,
    pub control: mpsc::UnboundedSender<ControlSignal>,
    pub cancellation: CancellationToken,
    last_emitted_percent: Option<u32>,
}

impl TaskHandle {
    pub fn new(
        id: String,
        source_path: PathBuf,
        output_path: PathBuf,
        control: mpsc::UnboundedSender<ControlSignal>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            id,
            run_id: Uuid::new_v4(),
            source_path,
            output_path,
            status: TaskStatus::Queued,
            progress: 0.0,
            logs: LogRing::new(LOG_RING_CAPACITY),
            created: OffsetDateTime::now_utc(),
            control,
            cancellation,
            last_emitted_percent: None,
        }
    }
}

/// Immutable view handed to API consumers.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub run_id: Uuid,
    #[schema(value_type = String)]
    pub source_path: PathBuf,
    #[schema(value_type = String)]
    pub output_path: PathBuf,
    pub status: TaskStatus,
    pub progress: f64,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String)]
    pub created: OffsetDateTime,
}

impl From<&TaskHandle> for TaskSnapshot {
    fn from(handle: &TaskHandle) -> Self {
        Self {
            id: handle.id.clone(),
            run_id: handle.run_id,
            source_path: handle.source_path.clone(),
            output_path: handle.output_path.clone(),
            status: handle.status,
            progress: handle.progress,
            created: handle.created,
        }
    }
}

/// The id to handle map. Every status transition goes through here so
/// transitions stay serialized per task and every event is emitted
/// from under the handle lock.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Arc<Mutex<TaskHandle>>>>,
    events: EventChannel,
}

impl TaskRegistry {
    pub fn new(events: EventChannel) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Register a new task. Duplicate ids are rejected, including ids
    /// still occupied by a terminal task the caller has not dropped.
    pub fn insert(&self, handle: TaskHandle) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.entry(handle.id.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(handle)));
                true
            }
        }
    }

    pub fn handle(&self, id: &str) -> Option<Arc<Mutex<TaskHandle>>> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.handle(id).map(|h| h.lock().unwrap().status)
    }

    /// Drop a terminal task. Active tasks are kept so running work is
    /// never silently lost.
    pub fn remove_terminal(&self, id: &str) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        let Some(handle) = tasks.get(id) else {
            return false;
        };
        if !handle.lock().unwrap().status.is_terminal() {
            return false;
        }
        tasks.remove(id);
        true
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.handle(id).map(|h| TaskSnapshot::from(&*h.lock().unwrap()))
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .map(|h| TaskSnapshot::from(&*h.lock().unwrap()))
            .collect();
        snapshots.sort_by_key(|s| s.created);
        snapshots
    }

    pub fn log_snapshot(&self, id: &str) -> Option<Vec<String>> {
        self.handle(id).map(|h| h.lock().unwrap().logs.snapshot())
    }

    pub fn mark_started(&self, id: &str) {
        let Some(handle) = self.handle(id) else {
            return;
        };
        let mut task = handle.lock().unwrap();
        if task.status != TaskStatus::Queued {
            return;
        }
        task.status = TaskStatus::Running;
        self.events.send(ConversionEvent::Started { id: id.to_string() });
    }

    pub fn set_paused(&self, id: &str, paused: bool) {
        let Some(handle) = self.handle(id) else {
            return;
        };
        let mut task = handle.lock().unwrap();
        task.status = match (paused, task.status) {
            (true, TaskStatus::Running) => TaskStatus::Paused,
            (false, TaskStatus::Paused) => TaskStatus::Running,
            _ => return,
        };
    }

    /// Monotone progress update. Events are collapsed to whole-percent
    /// changes to cap the delivery rate.
    pub fn update_progress(&self, id: &str, progress: f64) {
        let Some(handle) = self.handle(id) else {
            return;
        };
        let mut task = handle.lock().unwrap();
        if task.status.is_terminal() {
            return;
        }
        let progress = progress.clamp(0.0, 1.0);
        if progress <= task.progress {
            return;
        }
        task.progress = progress;
        let percent = (progress * 100.0).round() as u32;
        if task.last_emitted_percent == Some(percent) {
            return;
        }
        task.last_emitted_percent = Some(percent);
        self.events.send(ConversionEvent::Progress {
            id: id.to_string(),
            progress,
        });
    }

    pub fn append_log(&self, id: &str, line: String) {
        let Some(handle) = self.handle(id) else {
            return;
        };
        let mut task = handle.lock().unwrap();
        if task.status.is_terminal() {
            return;
        }
        task.logs.push(line.clone());
        self.events.send(ConversionEvent::Log {
            id: id.to_string(),
            line,
        });
    }

    pub fn error_tail(&self, id: &str) -> String {
        self.handle(id)
            .map(|h| h.lock().unwrap().logs.tail(ERROR_TAIL_LINES).join("\n"))
            .unwrap_or_default()
    }

    /// Drive a task into its terminal state, emitting exactly one
    /// terminal event. Later calls for the same task are no-ops, which
    /// makes cancellation races harmless.
    pub fn finish(&self, id: &str, outcome: TaskOutcome) -> bool {
        let Some(handle) = self.handle(id) else {
            return false;
        };
        let mut task = handle.lock().unwrap();
        if task.status.is_terminal() {
            return false;
        }
        let event = match outcome {
            TaskOutcome::Completed => {
                task.status = TaskStatus::Completed;
                task.progress = 1.0;
                ConversionEvent::Completed {
                    id: id.to_string(),
                    output_path: task.output_path.clone(),
                }
            }
            TaskOutcome::Errored(error) => {
                task.status = TaskStatus::Errored;
                ConversionEvent::Error {
                    id: id.to_string(),
                    error,
                }
            }
            TaskOutcome::Cancelled => {
                task.status = TaskStatus::Cancelled;
                ConversionEvent::Cancelled { id: id.to_string() }
            }
        };
        self.events.send(event);
        true
    }
}
