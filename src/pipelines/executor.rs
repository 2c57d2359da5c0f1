// src/pipelines/executor.rs: runs a rendered plan as one supervised bash child

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::defs::{PipelineError, RunConfig};
use crate::pipelines::plan::ExecutionPlan;
use crate::utils::file::write_executable;
use crate::utils::progress::ProgressLog;
use crate::utils::streams::spawn_line_reader;


pub const STARTED_RECORD: &str = "Pipeline started";
const FINISHED_PREFIX: &str = "Pipeline finished with exit code ";
const CANCELLED_PREFIX: &str = "Pipeline cancelled (exit code ";
const FAILED_TO_START_PREFIX: &str = "Pipeline failed to start: ";
const LINE_BUFFER: usize = 256;
/// Time the tools get to exit on SIGTERM before the group is killed.
pub const KILL_GRACE: Duration = Duration::from_secs(5);


/// True for the last record a run writes to its progress log.
pub fn is_final_record(line: &str) -> bool {
    line.starts_with(FINISHED_PREFIX)
        || line.starts_with(CANCELLED_PREFIX)
        || line.starts_with(FAILED_TO_START_PREFIX)
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The script exited on its own. `failed_step` is the label of the step
    /// running when it exited non-zero.
    Completed { exit_code: i32, failed_step: Option<String> },
    Cancelled,
}


/// Cancels the run it was taken from.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}


pub struct RunningPipeline {
    pub cancel: CancelHandle,
    pub task: JoinHandle<RunOutcome>,
}


pub struct PipelineExecutor {
    shell: String,
    cwd: PathBuf,
    script_path: PathBuf,
    plan_json_path: PathBuf,
}

impl PipelineExecutor {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            shell: config.tools.shell.clone(),
            cwd: config.cwd.clone(),
            script_path: config.script_path(),
            plan_json_path: config.plan_json_path(),
        }
    }

    /// Writes the plan's script and JSON, truncates the progress log and
    /// spawns the shell on the script. Returns as soon as the child runs;
    /// output is copied into `log` by a background task.
    ///
    /// # Arguments
    ///
    /// * `plan` - Plan to render and run.
    /// * `log` - Progress log for this run; reset here.
    ///
    /// # Returns
    /// Handle to cancel or wait for the run, or `RunFailedToStart` if the
    /// shell could not be spawned.
    pub async fn start(&self, plan: &ExecutionPlan, log: &ProgressLog) -> Result<RunningPipeline, PipelineError> {
        write_executable(&self.script_path, &plan.render_script())?;
        let json = plan
            .to_json()
            .map_err(|e| PipelineError::IOError(format!("Failed to serialize plan: {}", e)))?;
        tokio::fs::write(&self.plan_json_path, json).await?;
        debug!("Wrote {} and {}", self.script_path.display(), self.plan_json_path.display());

        log.reset().await?;
        log.append_line(STARTED_RECORD).await?;

        let mut command = Command::new(&self.shell);
        command
            .arg(&self.script_path)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so cancelling reaches the tools bash starts.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("{}: {}", self.shell, e);
                error!("Failed to spawn pipeline: {}", reason);
                if let Err(log_err) = log.append_line(&format!("{}{}", FAILED_TO_START_PREFIX, reason)).await {
                    warn!("Could not record start failure: {}", log_err);
                }
                return Err(PipelineError::RunFailedToStart(reason));
            }
        };
        info!("Pipeline started (pid {:?}): {} {}", child.id(), self.shell, self.script_path.display());

        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let supervisor = Supervisor {
            child,
            lines: line_rx,
            readers,
            log: log.clone(),
            labels: plan.labels(),
            cancel: cancel_rx,
        };
        let task = tokio::spawn(supervisor.run());

        Ok(RunningPipeline {
            cancel: CancelHandle { tx: cancel_tx },
            task,
        })
    }
}


struct Supervisor {
    child: Child,
    lines: mpsc::Receiver<String>,
    readers: Vec<JoinHandle<std::io::Result<()>>>,
    log: ProgressLog,
    labels: Vec<String>,
    cancel: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) -> RunOutcome {
        let mut current_step: Option<String> = None;
        let mut cancelled = false;
        let mut killed = false;
        let mut cancel_open = true;
        let grace = tokio::time::sleep(KILL_GRACE);
        tokio::pin!(grace);

        loop {
            tokio::select! {
                line = self.lines.recv() => {
                    let Some(line) = line else { break };
                    if self.labels.iter().any(|l| *l == line) {
                        debug!("Entering: {}", line);
                        current_step = Some(line.clone());
                    }
                    if let Err(e) = self.log.append_line(&line).await {
                        warn!("Failed to write progress log: {}", e);
                    }
                }
                changed = self.cancel.changed(), if cancel_open && !cancelled => {
                    match changed {
                        Ok(()) if *self.cancel.borrow() => {
                            cancelled = true;
                            info!("Cancelling pipeline");
                            signal_group(&mut self.child, "TERM").await;
                            grace.as_mut().reset(tokio::time::Instant::now() + KILL_GRACE);
                        }
                        Ok(()) => {}
                        Err(_) => cancel_open = false,
                    }
                }
                () = &mut grace, if cancelled && !killed => {
                    warn!("Pipeline still running {:?} after SIGTERM, killing", KILL_GRACE);
                    signal_group(&mut self.child, "KILL").await;
                    killed = true;
                }
            }
        }

        for reader in self.readers.drain(..) {
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error reading pipeline output: {}", e),
                Err(e) => warn!("Output reader task failed: {}", e),
            }
        }

        if cancelled && !killed && tokio::time::timeout(KILL_GRACE, self.child.wait()).await.is_err() {
            warn!("Pipeline shell ignored SIGTERM, killing");
            signal_group(&mut self.child, "KILL").await;
        }
        let exit_code = match self.child.wait().await {
            Ok(status) => status_code(status),
            Err(e) => {
                error!("Failed to wait on pipeline: {}", e);
                -1
            }
        };

        let (record, outcome) = if cancelled {
            (
                format!("{}{})", CANCELLED_PREFIX, exit_code),
                RunOutcome::Cancelled,
            )
        } else {
            let failed_step = if exit_code == 0 { None } else { current_step };
            (
                format!("{}{}", FINISHED_PREFIX, exit_code),
                RunOutcome::Completed { exit_code, failed_step },
            )
        };
        if let Err(e) = self.log.append_line(&record).await {
            warn!("Failed to write progress log: {}", e);
        }
        info!("{}", record);
        outcome
    }
}


/// Sends `signal` (a `kill` signal name) to the child's whole process group.
/// Falls back to killing the child alone.
async fn signal_group(child: &mut Child, signal: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("kill -{} -{}", signal, pid))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => return,
            Ok(s) => debug!("kill -{} on group {} exited with {}", signal, pid, s),
            Err(e) => debug!("Could not run kill -{} on group {}: {}", signal, pid, e),
        }
    }
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill pipeline: {}", e);
    }
}


/// Exit code, or 128 + signal number for a signalled child.
fn status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
