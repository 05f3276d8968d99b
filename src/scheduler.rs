//! Bounded FIFO admission. At most `limit` tasks run at once, the rest
//! wait in queue order. Slots are released on terminal transitions and
//! immediately on cancel; a paused task keeps its slot on purpose so
//! users can shed CPU pressure without losing their place.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::conversion::args::ConversionPlan;
use crate::tasks::ControlSignal;

/// A task admitted into the scheduler, carrying everything its
/// supervisor needs.
#[derive(Debug)]
pub struct QueuedTask {
    pub id: String,
    pub plan: ConversionPlan,
    pub control: mpsc::UnboundedReceiver<ControlSignal>,
    pub cancellation: CancellationToken,
}

/// Seam between admission and process supervision. The production
/// implementation spawns a supervisor task; tests record admissions.
#[async_trait]
pub trait TaskLauncher: Send + Sync + 'static {
    /// Start the task. Must return promptly; the launched work reports
    /// back through the scheduler's completion handle when terminal.
    async fn launch(&self, task: QueuedTask);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
    /// Task was still queued; it never started and consumed no permit.
    DroppedFromQueue,
    /// Task was running; its permit is already released, the caller
    /// signals the process.
    ReleasedRunning,
    /// Not held by the scheduler (unknown id or already terminal).
    Unknown,
}

#[derive(Debug)]
struct State {
    queued: VecDeque<QueuedTask>,
    running: HashSet<String>,
    limit: usize,
}

pub struct Scheduler {
    state: Mutex<State>,
    launcher: Arc<dyn TaskLauncher>,
    done_tx: mpsc::UnboundedSender<String>,
}

impl Scheduler {
    pub fn new(limit: usize, launcher: Arc<dyn TaskLauncher>) -> Arc<Self> {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self::with_completion(limit, launcher, done_tx, done_rx)
    }

    /// Variant taking an externally created completion channel, so the
    /// launcher can be handed the sender before the scheduler exists.
    pub fn with_completion(
        limit: usize,
        launcher: Arc<dyn TaskLauncher>,
        done_tx: mpsc::UnboundedSender<String>,
        mut done_rx: mpsc::UnboundedReceiver<String>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            state: Mutex::new(State {
                queued: VecDeque::new(),
                running: HashSet::new(),
                limit: limit.max(1),
            }),
            launcher,
            done_tx,
        });
        let weak = Arc::downgrade(&scheduler);
        tokio::spawn(async move {
            while let Some(id) = done_rx.recv().await {
                let Some(scheduler) = weak.upgrade() else {
                    break;
                };
                scheduler.task_finished(&id).await;
            }
        });
        scheduler
    }

    /// Supervisors send the task id here once it reaches a terminal
    /// state.
    pub fn completion_handle(&self) -> mpsc::UnboundedSender<String> {
        self.done_tx.clone()
    }

    pub async fn enqueue(&self, task: QueuedTask) {
        let mut state = self.state.lock().await;
        state.queued.push_back(task);
        self.admit(&mut state).await;
    }

    /// Promote queued tasks while permits are free. Runs under the
    /// state lock so admission order is exactly queue order.
    async fn admit(&self, state: &mut State) {
        while state.running.len() < state.limit {
            let Some(task) = state.queued.pop_front() else {
                break;
            };
            tracing::debug!(
                "Admitting task {} ({} running, {} queued)",
                task.id,
                state.running.len() + 1,
                state.queued.len()
            );
            state.running.insert(task.id.clone());
            self.launcher.launch(task).await;
        }
    }

    pub async fn task_finished(&self, id: &str) {
        let mut state = self.state.lock().await;
        if state.running.remove(id) {
            self.admit(&mut state).await;
        }
    }

    /// Take the task out of the scheduler. A queued task is dropped in
    /// O(1) without ever consuming a permit; a running task has its
    /// permit released right away rather than when the process is
    /// confirmed gone.
    pub async fn cancel(&self, id: &str) -> CancelDisposition {
        let mut state = self.state.lock().await;
        if let Some(position) = state.queued.iter().position(|t| t.id == id) {
            if let Some(task) = state.queued.remove(position) {
                task.cancellation.cancel();
            }
            return CancelDisposition::DroppedFromQueue;
        }
        if state.running.remove(id) {
            self.admit(&mut state).await;
            return CancelDisposition::ReleasedRunning;
        }
        CancelDisposition::Unknown
    }

    /// Raising the cap admits waiting tasks immediately; lowering it
    /// never preempts, admission simply stalls until running tasks
    /// drain below the new cap.
    pub async fn set_limit(&self, limit: usize) {
        let mut state = self.state.lock().await;
        state.limit = limit.max(1);
        self.admit(&mut state).await;
    }

    pub async fn limit(&self) -> usize {
        self.state.lock().await.limit
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub async fn queue_depth(&self) -> usize {
        self.state.lock().await.queued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{args, ConversionConfig};
    use crate::ffmpeg::{AudioTrackInfo, SourceMetadata};
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingLauncher {
        started: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskLauncher for RecordingLauncher {
        async fn launch(&self, task: QueuedTask) {
            self.started.lock().unwrap().push(task.id);
        }
    }

    fn task(id: &str) -> QueuedTask {
        let source = SourceMetadata {
            duration_seconds: Some(60.0),
            audio_tracks: vec![AudioTrackInfo {
                index: 0,
                codec: "aac".into(),
                channels: Some(2),
                channel_layout: None,
                sample_rate: Some(48000),
                bitrate: None,
                language: None,
                label: None,
            }],
            ..Default::default()
        };
        let plan = args::build_plan(
            &source,
            &ConversionConfig::default(),
            Path::new("/in.mp4"),
            Path::new("/out.mp4"),
        )
        .unwrap();
        let (_control_tx, control) = mpsc::unbounded_channel();
        QueuedTask {
            id: id.to_string(),
            plan,
            control,
            cancellation: CancellationToken::new(),
        }
    }

    fn started(launcher: &RecordingLauncher) -> Vec<String> {
        launcher.started.lock().unwrap().clone()
    }

    #[test_log::test(tokio::test)]
    async fn admits_up_to_limit_in_fifo_order() {
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Scheduler::new(2, launcher.clone());
        for id in ["a", "b", "c", "d"] {
            scheduler.enqueue(task(id)).await;
        }
        assert_eq!(started(&launcher), ["a", "b"]);
        assert_eq!(scheduler.queue_depth().await, 2);

        // a completes -> c starts; b completes -> d starts
        scheduler.task_finished("a").await;
        assert_eq!(started(&launcher), ["a", "b", "c"]);
        scheduler.task_finished("b").await;
        assert_eq!(started(&launcher), ["a", "b", "c", "d"]);
    }

    #[test_log::test(tokio::test)]
    async fn raising_the_limit_admits_waiting_tasks() {
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Scheduler::new(1, launcher.clone());
        for id in ["a", "b", "c"] {
            scheduler.enqueue(task(id)).await;
        }
        assert_eq!(started(&launcher), ["a"]);

        scheduler.set_limit(3).await;
        assert_eq!(started(&launcher), ["a", "b", "c"]);
    }

    #[test_log::test(tokio::test)]
    async fn lowering_the_limit_never_preempts() {
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Scheduler::new(2, launcher.clone());
        for id in ["a", "b", "c"] {
            scheduler.enqueue(task(id)).await;
        }
        assert_eq!(scheduler.running_count().await, 2);

        scheduler.set_limit(1).await;
        assert_eq!(scheduler.running_count().await, 2);

        // draining below the cap does not admit yet
        scheduler.task_finished("a").await;
        assert_eq!(started(&launcher), ["a", "b"]);
        assert_eq!(scheduler.running_count().await, 1);

        scheduler.task_finished("b").await;
        assert_eq!(started(&launcher), ["a", "b", "c"]);
    }

    #[test_log::test(tokio::test)]
    async fn cancelling_a_queued_task_never_starts_it() {
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Scheduler::new(1, launcher.clone());
        scheduler.enqueue(task("a")).await;
        scheduler.enqueue(task("b")).await;

        let disposition = scheduler.cancel("b").await;
        assert_eq!(disposition, CancelDisposition::DroppedFromQueue);
        assert_eq!(scheduler.queue_depth().await, 0);

        scheduler.task_finished("a").await;
        assert_eq!(started(&launcher), ["a"]);
    }

    #[test_log::test(tokio::test)]
    async fn cancelling_a_running_task_releases_the_slot_immediately() {
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Scheduler::new(2, launcher.clone());
        for id in ["a", "b", "c"] {
            scheduler.enqueue(task(id)).await;
        }
        assert_eq!(started(&launcher), ["a", "b"]);

        // The process has not exited yet, but the permit is free.
        let disposition = scheduler.cancel("a").await;
        assert_eq!(disposition, CancelDisposition::ReleasedRunning);
        assert_eq!(started(&launcher), ["a", "b", "c"]);

        // The late completion notification is a harmless no-op.
        scheduler.task_finished("a").await;
        assert_eq!(scheduler.running_count().await, 2);
    }

    #[test_log::test(tokio::test)]
    async fn unknown_ids_are_reported() {
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = Scheduler::new(1, launcher);
        assert_eq!(scheduler.cancel("ghost").await, CancelDisposition::Unknown);
    }
}
