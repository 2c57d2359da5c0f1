// src/pipelines/run.rs: the process-wide run state and its entry points

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::defs::{PipelineError, RunConfig};
use crate::pipelines::consensus_genome::generate_plan;
use crate::pipelines::executor::{CancelHandle, PipelineExecutor, RunOutcome, RunningPipeline};
use crate::utils::pairing::{resolve_uploads, UploadedFile};
use crate::utils::progress::ProgressLog;
use crate::utils::streams::{ProgressEvent, ProgressStreamer};


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running,
    /// The script exited. `failed_step` names the step that was running when
    /// it exited non-zero.
    Completed { exit_code: i32, failed_step: Option<String> },
    FailedToStart(String),
    Cancelled,
}

impl RunStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, RunStatus::Running)
    }

    /// Ok for a run that exited 0; otherwise the error that ended it.
    pub fn into_result(self) -> Result<(), PipelineError> {
        match self {
            RunStatus::Completed { exit_code: 0, .. } => Ok(()),
            RunStatus::Completed { exit_code, failed_step } => Err(PipelineError::StepFailed {
                label: failed_step.unwrap_or_else(|| "pipeline setup".to_string()),
                exit_code,
            }),
            RunStatus::Cancelled => Err(PipelineError::Cancelled),
            RunStatus::FailedToStart(reason) => Err(PipelineError::RunFailedToStart(reason)),
            RunStatus::Idle | RunStatus::Running => Err(PipelineError::ToolExecution {
                tool: "executor".to_string(),
                error: "no finished run".to_string(),
            }),
        }
    }
}


/// Returned by a successful trigger, before the pipeline finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAck {
    pub run_id: u64,
    pub samples: Vec<String>,
    pub plan_path: PathBuf,
    pub log_path: PathBuf,
}


#[derive(Default)]
struct RunState {
    run_id: u64,
    cancel: Option<CancelHandle>,
}


/// Owns the single active run. Triggers are serialized; a trigger while a
/// run is in progress is rejected before any upload is touched.
#[derive(Clone)]
pub struct RunController {
    config: Arc<RunConfig>,
    log: ProgressLog,
    streamer: ProgressStreamer,
    state: Arc<Mutex<RunState>>,
    status: Arc<watch::Sender<RunStatus>>,
}

impl RunController {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let log = ProgressLog::new(config.progress_log_path());
        let streamer = ProgressStreamer::new(&log, config.poll_interval);
        let (status, _) = watch::channel(RunStatus::Idle);
        Self {
            config,
            log,
            streamer,
            state: Arc::new(Mutex::new(RunState::default())),
            status: Arc::new(status),
        }
    }

    /// Resolves the uploads, plans and starts a run, and returns without
    /// waiting for it.
    ///
    /// # Arguments
    ///
    /// * `uploads` - Files of one upload, in upload order.
    ///
    /// # Returns
    /// RunAck, or the resolution / start error. Nothing on disk changes
    /// when resolution fails.
    pub async fn trigger(&self, uploads: Vec<UploadedFile>) -> Result<RunAck, PipelineError> {
        let mut state = self.state.lock().await;
        if self.status.borrow().is_running() {
            warn!("Rejected run trigger: a run is already in progress");
            return Err(PipelineError::RunAlreadyInProgress);
        }

        // Renames block; keep them off the runtime threads.
        let resolution = tokio::task::spawn_blocking(move || resolve_uploads(&uploads))
            .await
            .map_err(|e| PipelineError::ToolExecution {
                tool: "sample resolver".to_string(),
                error: e.to_string(),
            })??;
        let plan = generate_plan(&self.config, &resolution.genome, &resolution.samples);

        let executor = PipelineExecutor::from_config(&self.config);
        let RunningPipeline { cancel, task } = match executor.start(&plan, &self.log).await {
            Ok(running) => running,
            Err(e) => {
                let reason = match &e {
                    PipelineError::RunFailedToStart(reason) => reason.clone(),
                    other => other.to_string(),
                };
                self.status.send_replace(RunStatus::FailedToStart(reason));
                return Err(e);
            }
        };

        state.run_id += 1;
        let run_id = state.run_id;
        state.cancel = Some(cancel);
        self.status.send_replace(RunStatus::Running);
        info!("Run {} started for {} sample(s)", run_id, resolution.samples.len());

        let status = self.status.clone();
        let monitor_state = self.state.clone();
        tokio::spawn(async move {
            let final_status = match task.await {
                Ok(RunOutcome::Completed { exit_code, failed_step }) => {
                    RunStatus::Completed { exit_code, failed_step }
                }
                Ok(RunOutcome::Cancelled) => RunStatus::Cancelled,
                Err(e) => {
                    error!("Run {} supervisor failed: {}", run_id, e);
                    RunStatus::Completed { exit_code: -1, failed_step: None }
                }
            };
            let mut state = monitor_state.lock().await;
            if state.run_id == run_id {
                state.cancel = None;
            }
            info!("Run {} ended: {:?}", run_id, final_status);
            status.send_replace(final_status);
        });

        Ok(RunAck {
            run_id,
            samples: resolution.sample_names(),
            plan_path: self.config.plan_json_path(),
            log_path: self.config.progress_log_path(),
        })
    }

    /// Cancels the active run. Returns false when nothing is running.
    pub async fn cancel(&self) -> bool {
        let state = self.state.lock().await;
        match (&state.cancel, self.status.borrow().is_running()) {
            (Some(cancel), true) => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Waits until no run is in progress and returns the last status.
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(|s| !s.is_running()).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }

    /// New progress subscriber, replaying the current log from the start.
    pub fn subscribe(&self) -> ReceiverStream<ProgressEvent> {
        self.streamer.subscribe()
    }

    pub fn log(&self) -> &ProgressLog {
        &self.log
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;
    use crate::config::defs::ToolPaths;

    fn touch(dir: &Path, name: &str) -> anyhow::Result<UploadedFile> {
        let path = dir.join(name);
        std::fs::write(&path, b"")?;
        Ok(UploadedFile::new(name, path))
    }

    #[tokio::test]
    async fn test_rejected_upload_leaves_state_idle() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = RunConfig::with_defaults(dir.path().to_path_buf(), dir.path().join("out"));
        let controller = RunController::new(Arc::new(config));
        let uploads = vec![touch(dir.path(), "a_1.fastq.gz")?, touch(dir.path(), "a_2.fastq.gz")?];

        assert!(matches!(controller.trigger(uploads).await, Err(PipelineError::NoGenomeFound)));
        assert_eq!(controller.status(), RunStatus::Idle);
        assert!(!dir.path().join("out").exists());
        Ok(())
    }

    #[test]
    fn test_status_results() {
        assert!((RunStatus::Completed { exit_code: 0, failed_step: None }).into_result().is_ok());
        let failed = RunStatus::Completed { exit_code: 2, failed_step: Some("Step 2.1: Read alignment for a".to_string()) };
        match failed.into_result() {
            Err(PipelineError::StepFailed { label, exit_code }) => {
                assert_eq!(label, "Step 2.1: Read alignment for a");
                assert_eq!(exit_code, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(RunStatus::Cancelled.into_result(), Err(PipelineError::Cancelled)));
        assert!(matches!(
            RunStatus::FailedToStart("no bash".to_string()).into_result(),
            Err(PipelineError::RunFailedToStart(reason)) if reason == "no bash"
        ));
        assert!(RunStatus::Running.into_result().is_err());
    }

    #[tokio::test]
    async fn test_failed_start_sets_status() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut config = RunConfig::with_defaults(dir.path().to_path_buf(), dir.path().join("out"));
        config.tools = ToolPaths::all("true");
        config.tools.shell = dir.path().join("missing-bash").to_string_lossy().into_owned();
        let controller = RunController::new(Arc::new(config));
        let uploads = vec![
            touch(dir.path(), "ref.fasta")?,
            touch(dir.path(), "a_1.fastq.gz")?,
            touch(dir.path(), "a_2.fastq.gz")?,
        ];

        assert!(matches!(controller.trigger(uploads).await, Err(PipelineError::RunFailedToStart(_))));
        assert!(matches!(controller.status(), RunStatus::FailedToStart(_)));
        assert!(!controller.cancel().await);
        Ok(())
    }
}
