//! Drives one admitted conversion to a terminal state: spawns the
//! ffmpeg child (twice for loudness-normalized runs), folds its stderr
//! into progress/log events, and honors pause/resume/cancel.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config;
use crate::conversion::args::{ConversionPlan, LoudnessMeasurement};
use crate::ffmpeg::{self, FFmpegRunningJob, StderrEvent};
use crate::orchestrator::Error;
use crate::scheduler::{QueuedTask, TaskLauncher};
use crate::tasks::{ControlSignal, TaskOutcome, TaskRegistry};

/// SIGTERM-to-SIGKILL escalation window on cancel.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Raw stderr tail kept aside for the loudnorm measurement block and
/// spawn-adjacent diagnostics.
const RAW_TAIL_LINES: usize = 64;

enum PassResult {
    Finished { tail: Vec<String> },
    Cancelled,
    Failed { error: Error },
}

#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<TaskRegistry>,
    done: mpsc::UnboundedSender<String>,
}

impl Supervisor {
    pub fn new(registry: Arc<TaskRegistry>, done: mpsc::UnboundedSender<String>) -> Self {
        Self { registry, done }
    }

    /// Run the task to its terminal state and release the permit.
    pub async fn run(&self, task: QueuedTask) {
        let QueuedTask {
            id,
            plan,
            mut control,
            cancellation,
        } = task;
        let outcome = self
            .drive(&id, &plan, &mut control, &cancellation)
            .await;
        self.registry.finish(&id, outcome);
        let _ = self.done.send(id);
    }

    async fn drive(
        &self,
        id: &str,
        plan: &ConversionPlan,
        control: &mut mpsc::UnboundedReceiver<ControlSignal>,
        cancellation: &CancellationToken,
    ) -> TaskOutcome {
        if cancellation.is_cancelled() {
            return TaskOutcome::Cancelled;
        }
        self.registry.mark_started(id);

        let duration = plan.duration();
        let first_range = if plan.two_pass { 0.0..0.5 } else { 0.0..1.0 };
        let first = self
            .run_pass(id, &plan.first_pass, duration, first_range, control, cancellation)
            .await;
        let tail = match first {
            PassResult::Cancelled => return TaskOutcome::Cancelled,
            PassResult::Failed { error } => return TaskOutcome::Errored(error.to_string()),
            PassResult::Finished { tail } => tail,
        };
        if !plan.two_pass {
            return TaskOutcome::Completed;
        }

        // A cancel landing between the passes stops the run here.
        if cancellation.is_cancelled() {
            return TaskOutcome::Cancelled;
        }
        let Some(measurement) = LoudnessMeasurement::from_stderr_tail(&tail) else {
            return TaskOutcome::Errored(
                Error::Internal("loudness measurement pass produced no parsable values".to_string())
                    .to_string(),
            );
        };
        tracing::debug!("Task {id} measured loudness: {measurement:?}");

        let second = self
            .run_pass(
                id,
                &plan.second_pass(&measurement),
                duration,
                0.5..1.0,
                control,
                cancellation,
            )
            .await;
        match second {
            PassResult::Cancelled => TaskOutcome::Cancelled,
            PassResult::Failed { error } => TaskOutcome::Errored(error.to_string()),
            PassResult::Finished { .. } => TaskOutcome::Completed,
        }
    }

    async fn run_pass(
        &self,
        id: &str,
        args: &[String],
        duration: Option<Duration>,
        range: Range<f64>,
        control: &mut mpsc::UnboundedReceiver<ControlSignal>,
        cancellation: &CancellationToken,
    ) -> PassResult {
        let mut job = match FFmpegRunningJob::spawn(&config::ffmpeg_path(), args) {
            Ok(job) => job,
            Err(e) => {
                return PassResult::Failed {
                    error: Error::SpawnFailed(e.to_string()),
                }
            }
        };

        let mut paused = false;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(RAW_TAIL_LINES);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    // A stopped process cannot receive the termination
                    // signal's default handling; wake it first.
                    if paused {
                        let _ = job.resume();
                    }
                    let _ = job.terminate(CANCEL_GRACE).await;
                    return PassResult::Cancelled;
                }
                Some(signal) = control.recv() => self.apply_control(id, &job, signal, &mut paused),
                line = job.next_stderr_line() => match line {
                    Ok(Some(line)) => {
                        if tail.len() == RAW_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                        match ffmpeg::classify_stderr_line(&line) {
                            StderrEvent::Progress { out_time } => {
                                if let Some(total) = duration {
                                    let fraction = (out_time.as_secs_f64()
                                        / total.as_secs_f64())
                                    .clamp(0.0, 0.99);
                                    self.registry.update_progress(
                                        id,
                                        map_into_range(fraction, &range),
                                    );
                                }
                            }
                            StderrEvent::PassEnd => {
                                self.registry.update_progress(id, range.end);
                            }
                            StderrEvent::Log(line) => self.registry.append_log(id, line),
                            StderrEvent::Noise => {}
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = job.terminate(CANCEL_GRACE).await;
                        return PassResult::Failed {
                            error: Error::Internal(format!("reading ffmpeg output failed: {e}")),
                        };
                    }
                },
            }
        }

        match job.wait().await {
            Ok(status) if status.success() => PassResult::Finished {
                tail: tail.into_iter().collect(),
            },
            Ok(status) => {
                if cancellation.is_cancelled() {
                    PassResult::Cancelled
                } else {
                    PassResult::Failed {
                        error: Error::RuntimeFailed {
                            exit_code: status.code(),
                            tail: self.registry.error_tail(id),
                        },
                    }
                }
            }
            Err(e) => PassResult::Failed {
                error: Error::Internal(format!("waiting for ffmpeg failed: {e}")),
            },
        }
    }

    fn apply_control(
        &self,
        id: &str,
        job: &FFmpegRunningJob,
        signal: ControlSignal,
        paused: &mut bool,
    ) {
        match signal {
            ControlSignal::Pause if !*paused => match job.suspend() {
                Ok(()) => {
                    *paused = true;
                    self.registry.set_paused(id, true);
                    tracing::debug!("Task {id} paused");
                }
                Err(e) => tracing::warn!("Failed to pause task {id}: {e}"),
            },
            ControlSignal::Resume if *paused => match job.resume() {
                Ok(()) => {
                    *paused = false;
                    self.registry.set_paused(id, false);
                    tracing::debug!("Task {id} resumed");
                }
                Err(e) => tracing::warn!("Failed to resume task {id}: {e}"),
            },
            _ => {}
        }
    }
}

fn map_into_range(fraction: f64, range: &Range<f64>) -> f64 {
    range.start + fraction * (range.end - range.start)
}

#[async_trait]
impl TaskLauncher for Supervisor {
    async fn launch(&self, task: QueuedTask) {
        let supervisor = self.clone();
        let span = tracing::info_span!("conversion", task = %task.id);
        tokio::spawn(async move { supervisor.run(task).await }.instrument(span));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{args, ConversionConfig};
    use crate::ffmpeg::{AudioTrackInfo, SourceMetadata};
    use crate::tasks::{ConversionEvent, EventChannel, TaskHandle, TaskStatus};
    use std::path::{Path, PathBuf};

    #[test]
    fn progress_mapping_stitches_passes() {
        assert_eq!(map_into_range(0.5, &(0.0..1.0)), 0.5);
        assert_eq!(map_into_range(0.5, &(0.0..0.5)), 0.25);
        assert_eq!(map_into_range(0.0, &(0.5..1.0)), 0.5);
        assert_eq!(map_into_range(0.99, &(0.5..1.0)), 0.995);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_spawns() {
        let events = EventChannel::new();
        let mut rx = events.subscribe();
        let registry = Arc::new(TaskRegistry::new(events));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(registry.clone(), done_tx);

        let source = SourceMetadata {
            duration_seconds: Some(10.0),
            audio_tracks: vec![AudioTrackInfo {
                index: 0,
                codec: "aac".into(),
                channels: Some(2),
                channel_layout: None,
                sample_rate: None,
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

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancellation = CancellationToken::new();
        let handle = TaskHandle::new(
            "t".into(),
            PathBuf::from("/in.mp4"),
            PathBuf::from("/out.mp4"),
            control_tx,
            cancellation.clone(),
        );
        assert!(registry.insert(handle));

        cancellation.cancel();
        supervisor
            .run(QueuedTask {
                id: "t".into(),
                plan,
                control: control_rx,
                cancellation,
            })
            .await;

        assert_eq!(registry.status("t"), Some(TaskStatus::Cancelled));
        assert_eq!(done_rx.recv().await.as_deref(), Some("t"));
        // the only event is the terminal one; no Started was emitted
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, ConversionEvent::Cancelled { .. }));
        assert!(rx.try_recv().is_err());
    }
}
