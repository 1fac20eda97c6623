use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    ExecutionSubstrate, UnitExit, UnitHandle, UnitOutput, UnitSpec, ENV_CONFIG_PATH,
    ENV_STATE_PATH,
};
use crate::config::SubstrateConfig;
use crate::error::SubstrateError;

pub(crate) const CONFIG_FILE: &str = "config.json";
pub(crate) const STATE_FILE: &str = "state.json";

/// `None` while running, `Some(code)` once exited.
type ExitState = Option<Option<i32>>;

struct RunningUnit {
    pid: Option<u32>,
    stdout: Option<ChildStdout>,
    exit: watch::Receiver<ExitState>,
    /// Dropping or firing this kills the child.
    kill: Option<oneshot::Sender<()>>,
    stderr_task: Option<JoinHandle<()>>,
    /// Removed from disk when the unit is dropped.
    _workdir: TempDir,
}

/// Child processes backing live units, keyed by unit id.
///
/// Each child is owned by a wait task that publishes its exit code on a
/// watch channel, so any number of callers can await the exit.
#[derive(Default)]
pub(crate) struct ProcessTable {
    units: Mutex<HashMap<String, RunningUnit>>,
}

/// Per-unit working directory with the unit's input files.
pub(crate) struct UnitInputs {
    pub dir: TempDir,
    pub config_path: PathBuf,
    pub state_path: Option<PathBuf>,
}

impl UnitInputs {
    pub(crate) fn prepare(root: Option<&Path>, spec: &UnitSpec) -> Result<Self, SubstrateError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ferry-unit-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let config_path = dir.path().join(CONFIG_FILE);
        std::fs::write(&config_path, serde_json::to_vec(&spec.config)?)?;

        let state_path = match &spec.checkpoint {
            Some(checkpoint) => {
                let path = dir.path().join(STATE_FILE);
                std::fs::write(&path, serde_json::to_vec(checkpoint.as_value())?)?;
                Some(path)
            }
            None => None,
        };

        Ok(Self {
            dir,
            config_path,
            state_path,
        })
    }
}

impl ProcessTable {
    /// Spawn `command` as the process backing `unit_id`.
    ///
    /// On failure nothing is registered and `workdir` is removed.
    pub(crate) fn spawn(
        &self,
        unit_id: &str,
        mut command: Command,
        workdir: TempDir,
    ) -> Result<UnitHandle, SubstrateError> {
        if self.units.lock().contains_key(unit_id) {
            return Err(SubstrateError::Start {
                unit_id: unit_id.to_string(),
                reason: "a unit with this id is already running".into(),
            });
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| SubstrateError::Start {
            unit_id: unit_id.to_string(),
            reason: err.to_string(),
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr_task = child.stderr.take().map(|stderr| {
            let unit = unit_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(unit_id = %unit, "stderr: {line}");
                }
            })
        });

        let (exit_tx, exit_rx) = watch::channel::<ExitState>(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let unit = unit_id.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(err) = child.start_kill() {
                        debug!(unit_id = %unit, error = %err, "kill failed, process likely gone");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(unit_id = %unit, error = %err, "failed to reap unit process");
                    None
                }
            };
            debug!(unit_id = %unit, ?code, "unit process exited");
            let _ = exit_tx.send(Some(code));
        });

        self.units.lock().insert(
            unit_id.to_string(),
            RunningUnit {
                pid,
                stdout,
                exit: exit_rx,
                kill: Some(kill_tx),
                stderr_task,
                _workdir: workdir,
            },
        );
        Ok(UnitHandle::new(unit_id))
    }

    pub(crate) fn take_output(&self, handle: &UnitHandle) -> Result<UnitOutput, SubstrateError> {
        let mut units = self.units.lock();
        let unit = units
            .get_mut(&handle.unit_id)
            .ok_or_else(|| SubstrateError::UnknownUnit(handle.unit_id.clone()))?;
        let stdout = unit
            .stdout
            .take()
            .ok_or_else(|| SubstrateError::OutputUnavailable(handle.unit_id.clone()))?;
        Ok(Box::new(stdout))
    }

    /// Pid of a unit that has not exited yet.
    pub(crate) fn live_pid(&self, handle: &UnitHandle) -> Result<Option<u32>, SubstrateError> {
        let units = self.units.lock();
        let unit = units
            .get(&handle.unit_id)
            .ok_or_else(|| SubstrateError::UnknownUnit(handle.unit_id.clone()))?;
        if unit.exit.borrow().is_some() {
            return Ok(None);
        }
        Ok(unit.pid)
    }

    pub(crate) fn kill(&self, handle: &UnitHandle) {
        if let Some(unit) = self.units.lock().get_mut(&handle.unit_id) {
            if let Some(kill) = unit.kill.take() {
                let _ = kill.send(());
            }
        }
    }

    pub(crate) async fn await_exit(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<UnitExit, SubstrateError> {
        let mut exit = self
            .units
            .lock()
            .get(&handle.unit_id)
            .map(|unit| unit.exit.clone())
            .ok_or_else(|| SubstrateError::UnknownUnit(handle.unit_id.clone()))?;

        let exited = match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(state)) => Ok(UnitExit::Exited {
                code: state.flatten(),
            }),
            // Wait task is gone without reporting: treat as killed.
            Ok(Err(_)) => Ok(UnitExit::Exited { code: None }),
            Err(_) => Ok(UnitExit::TimedOut),
        };
        exited
    }

    /// Kill and forget a unit, removing its working directory.
    ///
    /// Returns `false` if the unit was not registered.
    pub(crate) async fn remove(&self, handle: &UnitHandle, reap_wait: Duration) -> bool {
        let Some(mut unit) = self.units.lock().remove(&handle.unit_id) else {
            return false;
        };

        drop(unit.kill.take());
        let mut exit = unit.exit.clone();
        if tokio::time::timeout(reap_wait, exit.wait_for(Option::is_some))
            .await
            .is_err()
        {
            warn!(unit_id = %handle.unit_id, "unit did not exit after kill");
        }
        if let Some(task) = unit.stderr_task.take() {
            task.abort();
        }
        true
    }
}

/// Runs units as local child processes.
///
/// The unit's stdout is the protocol stream; stderr is logged. Inputs are
/// written to a private working directory and passed both as `--config` /
/// `--state` arguments and through `FERRY_CONFIG_PATH` / `FERRY_STATE_PATH`.
/// Resource limits are not enforced by this substrate.
pub struct LocalProcessSubstrate {
    config: SubstrateConfig,
    processes: ProcessTable,
}

impl std::fmt::Debug for LocalProcessSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessSubstrate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LocalProcessSubstrate {
    pub fn new(config: SubstrateConfig) -> Self {
        Self {
            config,
            processes: ProcessTable::default(),
        }
    }
}

impl Default for LocalProcessSubstrate {
    fn default() -> Self {
        Self::new(SubstrateConfig::default())
    }
}

#[async_trait]
impl ExecutionSubstrate for LocalProcessSubstrate {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn start(&self, spec: &UnitSpec) -> Result<UnitHandle, SubstrateError> {
        let inputs = UnitInputs::prepare(self.config.work_dir.as_deref(), spec)?;

        let mut command = Command::new(&spec.image);
        command
            .args(&spec.args)
            .arg("--config")
            .arg(&inputs.config_path)
            .envs(&spec.env)
            .env(ENV_CONFIG_PATH, &inputs.config_path)
            .current_dir(inputs.dir.path());
        if let Some(state_path) = &inputs.state_path {
            command.arg("--state").arg(state_path).env(ENV_STATE_PATH, state_path);
        }
        if spec.resources.cpus.is_some() || spec.resources.memory_bytes.is_some() {
            debug!(unit_id = %spec.unit_id, "local substrate does not enforce resource limits");
        }

        let handle = self.processes.spawn(&spec.unit_id, command, inputs.dir)?;
        debug!(unit_id = %handle, image = %spec.image, "started local unit");
        Ok(handle)
    }

    async fn attach_output(&self, handle: &UnitHandle) -> Result<UnitOutput, SubstrateError> {
        self.processes.take_output(handle)
    }

    async fn signal_terminate(&self, handle: &UnitHandle) -> Result<(), SubstrateError> {
        let Some(pid) = self.processes.live_pid(handle)? else {
            return Ok(());
        };
        send_sigterm(pid, &self.processes, handle).await
    }

    async fn await_exit(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<UnitExit, SubstrateError> {
        self.processes.await_exit(handle, timeout).await
    }

    async fn destroy(&self, handle: &UnitHandle) -> Result<(), SubstrateError> {
        let reap_wait = Duration::from_millis(self.config.reap_wait_ms);
        if self.processes.remove(handle, reap_wait).await {
            debug!(unit_id = %handle, "destroyed local unit");
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn send_sigterm(
    pid: u32,
    processes: &ProcessTable,
    handle: &UnitHandle,
) -> Result<(), SubstrateError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        processes.kill(handle);
        return Ok(());
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => Ok(()),
        // Exited between the liveness check and the signal.
        Err(Errno::ESRCH) => {
            debug!(unit_id = %handle, pid, "unit already gone");
            Ok(())
        }
        Err(errno) => {
            warn!(unit_id = %handle, pid, %errno, "SIGTERM failed, killing unit");
            processes.kill(handle);
            Ok(())
        }
    }
}

#[cfg(not(unix))]
async fn send_sigterm(
    _pid: u32,
    processes: &ProcessTable,
    handle: &UnitHandle,
) -> Result<(), SubstrateError> {
    processes.kill(handle);
    Ok(())
}
