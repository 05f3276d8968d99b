//! The façade the UI collaborator talks to. Every call returns once
//! the state transition is registered; progress flows exclusively over
//! the event channel.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use lru::LruCache;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::conversion::{args, ConversionConfig};
use crate::ffmpeg::{self, AvailableEncoders, SourceMetadata};
use crate::scheduler::{CancelDisposition, QueuedTask, Scheduler};
use crate::supervisor::Supervisor;
use crate::tasks::{
    ControlSignal, ConversionEvent, EventChannel, TaskHandle, TaskOutcome, TaskRegistry,
    TaskSnapshot, TaskStatus,
};

/// Probed sources kept around so queueing a just-probed file does not
/// spawn ffprobe again.
const PROBE_CACHE_SIZE: usize = 64;

#[derive(Debug)]
pub enum Error {
    /// No legal argv can be produced from this request. Returned
    /// synchronously from `queue`; never produces a task.
    ConfigInvalid(String),
    DuplicateTask(String),
    NotFound(String),
    BinaryMissing(PathBuf),
    ProbeFailed(String),
    SpawnFailed(String),
    RuntimeFailed {
        exit_code: Option<i32>,
        tail: String,
    },
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ConfigInvalid(message) => write!(f, "Invalid configuration: {message}"),
            Error::DuplicateTask(id) => write!(f, "Task {id} already exists"),
            Error::NotFound(id) => write!(f, "Task {id} was not found"),
            Error::BinaryMissing(path) => {
                write!(f, "Required binary is missing: {}", path.display())
            }
            Error::ProbeFailed(reason) => write!(f, "Probe failed: {reason}"),
            Error::SpawnFailed(reason) => write!(f, "Failed to spawn ffmpeg: {reason}"),
            Error::RuntimeFailed { exit_code, tail } => match exit_code {
                Some(code) => write!(f, "ffmpeg exited with code {code}\n{tail}"),
                None => write!(f, "ffmpeg was terminated by a signal\n{tail}"),
            },
            Error::Internal(message) => write!(f, "Internal error: {message}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::ConfigInvalid(_) | Error::DuplicateTask(_) | Error::ProbeFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BinaryMissing(_)
            | Error::SpawnFailed(_)
            | Error::RuntimeFailed { .. }
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}

pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    scheduler: Arc<Scheduler>,
    events: EventChannel,
    probe_cache: Mutex<LruCache<PathBuf, SourceMetadata>>,
}

impl Orchestrator {
    pub fn new(max_concurrency: usize) -> Arc<Self> {
        let events = EventChannel::new();
        let registry = Arc::new(TaskRegistry::new(events.clone()));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Supervisor::new(registry.clone(), done_tx.clone()));
        let scheduler = Scheduler::with_completion(max_concurrency, supervisor, done_tx, done_rx);
        Arc::new(Self {
            registry,
            scheduler,
            events,
            probe_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(PROBE_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        })
    }

    /// Validate the request, build the argv once (fail-fast) and hand
    /// the task to the scheduler in Queued state.
    pub async fn queue(
        &self,
        id: String,
        file_path: PathBuf,
        output_name: Option<String>,
        config: ConversionConfig,
    ) -> Result<(), Error> {
        if id.trim().is_empty() {
            return Err(Error::ConfigInvalid("task id cannot be empty".to_string()));
        }
        if self.registry.status(&id).is_some() {
            return Err(Error::DuplicateTask(id));
        }
        if !file_path.is_file() {
            return Err(Error::ConfigInvalid(format!(
                "input file does not exist: {}",
                file_path.display()
            )));
        }
        config
            .validate()
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let config = config.normalize();

        if config.video_codec.is_hardware() && !config.container.is_audio_only() {
            let encoders = ffmpeg::available_encoders().await;
            if !encoders.supports(config.video_codec) {
                return Err(Error::ConfigInvalid(format!(
                    "encoder {} is not available in this ffmpeg build",
                    config.video_codec
                )));
            }
        }

        let metadata = self.probe_cached(&file_path).await?;
        let output_path =
            args::resolve_output_path(&file_path, config.container, output_name.as_deref());
        let plan = args::build_plan(&metadata, &config, &file_path, &output_path)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();
        let handle = TaskHandle::new(
            id.clone(),
            file_path,
            output_path,
            control_tx,
            cancellation.clone(),
        );
        if !self.registry.insert(handle) {
            return Err(Error::DuplicateTask(id));
        }
        tracing::info!("Queued conversion task {id}");
        self.scheduler
            .enqueue(QueuedTask {
                id,
                plan,
                control: control_rx,
                cancellation,
            })
            .await;
        Ok(())
    }

    pub async fn probe(&self, path: &Path) -> Result<SourceMetadata, Error> {
        self.probe_cached(path).await
    }

    async fn probe_cached(&self, path: &Path) -> Result<SourceMetadata, Error> {
        if let Some(cached) = self.probe_cache.lock().unwrap().get(path) {
            return Ok(cached.clone());
        }
        let probe = ffmpeg::probe(path)
            .await
            .map_err(|e| Error::ProbeFailed(format!("{e:#}")))?;
        let metadata = SourceMetadata::from_probe(&probe);
        self.probe_cache
            .lock()
            .unwrap()
            .put(path.to_path_buf(), metadata.clone());
        Ok(metadata)
    }

    /// No-op unless the task is Running.
    pub fn pause(&self, id: &str) -> Result<(), Error> {
        let handle = self
            .registry
            .handle(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let task = handle.lock().unwrap();
        if task.status == TaskStatus::Running {
            let _ = task.control.send(ControlSignal::Pause);
        }
        Ok(())
    }

    /// No-op unless the task is Paused.
    pub fn resume(&self, id: &str) -> Result<(), Error> {
        let handle = self
            .registry
            .handle(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let task = handle.lock().unwrap();
        if task.status == TaskStatus::Paused {
            let _ = task.control.send(ControlSignal::Resume);
        }
        Ok(())
    }

    /// Idempotent. A queued task is dropped with a synchronous terminal
    /// event; a running one is signalled and emits its terminal event
    /// when the OS confirms exit.
    pub async fn cancel(&self, id: &str) -> Result<(), Error> {
        let handle = self
            .registry
            .handle(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        match self.scheduler.cancel(id).await {
            CancelDisposition::DroppedFromQueue => {
                self.registry.finish(id, TaskOutcome::Cancelled);
            }
            CancelDisposition::ReleasedRunning => {
                handle.lock().unwrap().cancellation.cancel();
            }
            CancelDisposition::Unknown => {
                // Already terminal, or racing its own completion; the
                // token is the idempotent way to resolve either.
                let task = handle.lock().unwrap();
                if !task.status.is_terminal() {
                    task.cancellation.cancel();
                }
            }
        }
        Ok(())
    }

    pub async fn available_encoders(&self) -> AvailableEncoders {
        ffmpeg::available_encoders().await
    }

    pub async fn max_concurrency(&self) -> usize {
        self.scheduler.limit().await
    }

    pub async fn set_max_concurrency(&self, value: usize) -> Result<(), Error> {
        if value == 0 {
            return Err(Error::ConfigInvalid(
                "max concurrency must be at least 1".to_string(),
            ));
        }
        tracing::info!("Setting max concurrency to {value}");
        self.scheduler.set_limit(value).await;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversionEvent> {
        self.events.subscribe()
    }

    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.registry.snapshots()
    }

    pub fn task(&self, id: &str) -> Result<TaskSnapshot, Error> {
        self.registry
            .snapshot(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn task_log(&self, id: &str) -> Result<Vec<String>, Error> {
        self.registry
            .log_snapshot(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Drop a terminal task from the registry, freeing its id.
    pub fn delete_task(&self, id: &str) -> Result<(), Error> {
        if self.registry.remove_terminal(id) {
            return Ok(());
        }
        match self.registry.status(id) {
            Some(_) => Err(Error::ConfigInvalid(
                "only finished tasks can be deleted".to_string(),
            )),
            None => Err(Error::NotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupy_id(orchestrator: &Orchestrator, id: &str) {
        let (control, _rx) = mpsc::unbounded_channel();
        let handle = TaskHandle::new(
            id.to_string(),
            PathBuf::from("/in.mp4"),
            PathBuf::from("/out.mp4"),
            control,
            CancellationToken::new(),
        );
        assert!(orchestrator.registry.insert(handle));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_synchronously() {
        let orchestrator = Orchestrator::new(2);
        occupy_id(&orchestrator, "job-1");
        let result = orchestrator
            .queue(
                "job-1".into(),
                PathBuf::from("/does/not/matter.mp4"),
                None,
                ConversionConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::DuplicateTask(_))));
    }

    #[tokio::test]
    async fn missing_input_is_config_invalid() {
        let orchestrator = Orchestrator::new(2);
        let result = orchestrator
            .queue(
                "job-1".into(),
                PathBuf::from("/definitely/not/here.mp4"),
                None,
                ConversionConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
        assert!(orchestrator.tasks().is_empty());
    }

    #[tokio::test]
    async fn probe_failure_surfaces_synchronously_from_queue() {
        // the test environment has no ffprobe sidecar installed
        let orchestrator = Orchestrator::new(2);
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = orchestrator
            .queue(
                "job-1".into(),
                file.path().to_path_buf(),
                None,
                ConversionConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::ProbeFailed(_))));
        assert!(orchestrator.tasks().is_empty());
    }

    #[tokio::test]
    async fn control_commands_require_a_known_task() {
        let orchestrator = Orchestrator::new(2);
        assert!(matches!(orchestrator.pause("ghost"), Err(Error::NotFound(_))));
        assert!(matches!(orchestrator.resume("ghost"), Err(Error::NotFound(_))));
        assert!(matches!(
            orchestrator.cancel("ghost").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(orchestrator.task("ghost"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn pause_is_a_noop_for_queued_tasks() {
        let orchestrator = Orchestrator::new(2);
        occupy_id(&orchestrator, "job-1");
        // queued, not running: accepted but nothing happens
        orchestrator.pause("job-1").unwrap();
        assert_eq!(
            orchestrator.task("job-1").unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn concurrency_is_validated_and_applied() {
        let orchestrator = Orchestrator::new(2);
        assert!(orchestrator.set_max_concurrency(0).await.is_err());
        orchestrator.set_max_concurrency(4).await.unwrap();
        assert_eq!(orchestrator.max_concurrency().await, 4);
    }

    #[tokio::test]
    async fn delete_only_applies_to_terminal_tasks() {
        let orchestrator = Orchestrator::new(2);
        occupy_id(&orchestrator, "job-1");
        assert!(matches!(
            orchestrator.delete_task("job-1"),
            Err(Error::ConfigInvalid(_))
        ));
        orchestrator
            .registry
            .finish("job-1", TaskOutcome::Cancelled);
        orchestrator.delete_task("job-1").unwrap();
        assert!(matches!(
            orchestrator.delete_task("job-1"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn error_statuses_match_the_http_mapping() {
        assert_eq!(
            Error::ConfigInvalid(String::new()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound(String::new()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::BinaryMissing(PathBuf::new()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::RuntimeFailed {
                exit_code: Some(1),
                tail: String::new()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
