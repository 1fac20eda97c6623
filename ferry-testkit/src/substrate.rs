use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferry::error::SubstrateError;
use ferry::substrate::{ExecutionSubstrate, UnitExit, UnitHandle, UnitOutput, UnitSpec};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 8 * 1024;

/// One thing a scripted unit does.
#[derive(Clone, Debug)]
pub enum UnitStep {
    /// Write one protocol line. Blocks while the reader is behind.
    Emit(String),
    Sleep(Duration),
    /// Go silent and stay alive until terminated or destroyed.
    Hang,
}

/// Behaviour of one scripted unit, from start to exit.
#[derive(Clone, Debug, Default)]
pub struct UnitScript {
    pub steps: Vec<UnitStep>,
    pub exit_code: i32,
    /// Make `start` fail with this reason.
    pub start_error: Option<String>,
    /// Keep running after a terminate signal; only `destroy` stops it.
    pub ignore_terminate: bool,
}

impl UnitScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// A unit that prints `lines` and exits 0.
    pub fn succeeding<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lines.into_iter().fold(Self::new(), |script, line| script.emit(line))
    }

    /// A unit that prints `lines` and exits with `code`.
    pub fn failing<I, S>(lines: I, code: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::succeeding(lines).exit(code)
    }

    pub fn start_failure(reason: impl Into<String>) -> Self {
        Self {
            start_error: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn emit(mut self, line: impl Into<String>) -> Self {
        self.steps.push(UnitStep::Emit(line.into()));
        self
    }

    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(UnitStep::Sleep(duration));
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push(UnitStep::Hang);
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn ignore_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }
}

/// `None` while running, `Some(code)` once exited.
type ExitState = Option<Option<i32>>;

struct ScriptedUnit {
    output: Option<DuplexStream>,
    exit: watch::Receiver<ExitState>,
    terminate: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<VecDeque<UnitScript>>,
    fallback: Mutex<UnitScript>,
    units: Mutex<HashMap<String, ScriptedUnit>>,
    starts: Mutex<Vec<UnitSpec>>,
    terminations: Mutex<Vec<String>>,
    destroys: Mutex<Vec<String>>,
}

/// In-memory execution substrate running scripted units over pipes.
///
/// Each `start` consumes the next queued [`UnitScript`], or the fallback
/// script once the queue is empty. Every start, terminate signal and destroy
/// is recorded for assertions.
#[derive(Clone, Default)]
pub struct ScriptedSubstrate {
    inner: Arc<Inner>,
}

impl ScriptedSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue scripts for the next starts, in order.
    pub fn with_scripts<I>(scripts: I) -> Self
    where
        I: IntoIterator<Item = UnitScript>,
    {
        let substrate = Self::new();
        for script in scripts {
            substrate.push_script(script);
        }
        substrate
    }

    pub fn push_script(&self, script: UnitScript) {
        self.inner.scripts.lock().push_back(script);
    }

    /// Script used when the queue is empty. Defaults to a unit that exits 0
    /// without output.
    pub fn set_fallback(&self, script: UnitScript) {
        *self.inner.fallback.lock() = script;
    }

    /// Specs of every started unit, in start order.
    pub fn starts(&self) -> Vec<UnitSpec> {
        self.inner.starts.lock().clone()
    }

    pub fn start_count(&self) -> usize {
        self.inner.starts.lock().len()
    }

    pub fn terminations(&self) -> Vec<String> {
        self.inner.terminations.lock().clone()
    }

    /// Every destroy call, including repeated and unknown ids.
    pub fn destroys(&self) -> Vec<String> {
        self.inner.destroys.lock().clone()
    }

    pub fn was_destroyed(&self, unit_id: &str) -> bool {
        self.inner.destroys.lock().iter().any(|id| id == unit_id)
    }

    /// Units started and not yet destroyed.
    pub fn live_units(&self) -> Vec<String> {
        let mut units: Vec<String> = self.inner.units.lock().keys().cloned().collect();
        units.sort();
        units
    }

    fn next_script(&self) -> UnitScript {
        self.inner
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.inner.fallback.lock().clone())
    }
}

async fn terminated(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|terminated| *terminated).await;
}

async fn run_script(
    script: UnitScript,
    mut writer: DuplexStream,
    exit: watch::Sender<ExitState>,
    mut terminate: watch::Receiver<bool>,
) {
    let honours_terminate = !script.ignore_terminate;

    for step in script.steps {
        let stopped = match step {
            UnitStep::Emit(line) => {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if honours_terminate {
                    tokio::select! {
                        result = writer.write_all(&bytes) => result.is_err(),
                        _ = terminated(&mut terminate) => true,
                    }
                } else {
                    writer.write_all(&bytes).await.is_err()
                }
            }
            UnitStep::Sleep(duration) => {
                if honours_terminate {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => false,
                        _ = terminated(&mut terminate) => true,
                    }
                } else {
                    tokio::time::sleep(duration).await;
                    false
                }
            }
            UnitStep::Hang => {
                if honours_terminate {
                    terminated(&mut terminate).await;
                } else {
                    std::future::pending::<()>().await;
                }
                true
            }
        };

        if stopped {
            drop(writer);
            let _ = exit.send(Some(None));
            return;
        }
    }

    let _ = writer.shutdown().await;
    drop(writer);
    let _ = exit.send(Some(Some(script.exit_code)));
}

#[async_trait]
impl ExecutionSubstrate for ScriptedSubstrate {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn start(&self, spec: &UnitSpec) -> Result<UnitHandle, SubstrateError> {
        self.inner.starts.lock().push(spec.clone());
        let script = self.next_script();

        if let Some(reason) = script.start_error.clone() {
            return Err(SubstrateError::Start {
                unit_id: spec.unit_id.clone(),
                reason,
            });
        }

        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (terminate_tx, terminate_rx) = watch::channel(false);
        let task = tokio::spawn(run_script(script, writer, exit_tx, terminate_rx));

        let previous = self.inner.units.lock().insert(
            spec.unit_id.clone(),
            ScriptedUnit {
                output: Some(reader),
                exit: exit_rx,
                terminate: terminate_tx,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(UnitHandle::new(spec.unit_id.clone()))
    }

    async fn attach_output(&self, handle: &UnitHandle) -> Result<UnitOutput, SubstrateError> {
        let mut units = self.inner.units.lock();
        let unit = units
            .get_mut(&handle.unit_id)
            .ok_or_else(|| SubstrateError::UnknownUnit(handle.unit_id.clone()))?;
        let output = unit
            .output
            .take()
            .ok_or_else(|| SubstrateError::OutputUnavailable(handle.unit_id.clone()))?;
        Ok(Box::new(output))
    }

    async fn signal_terminate(&self, handle: &UnitHandle) -> Result<(), SubstrateError> {
        self.inner.terminations.lock().push(handle.unit_id.clone());
        if let Some(unit) = self.inner.units.lock().get(&handle.unit_id) {
            let _ = unit.terminate.send(true);
        }
        Ok(())
    }

    async fn await_exit(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<UnitExit, SubstrateError> {
        let mut exit = self
            .inner
            .units
            .lock()
            .get(&handle.unit_id)
            .map(|unit| unit.exit.clone())
            .ok_or_else(|| SubstrateError::UnknownUnit(handle.unit_id.clone()))?;

        let exited = match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(state)) => Ok(UnitExit::Exited {
                code: state.flatten(),
            }),
            Ok(Err(_)) => Ok(UnitExit::Exited { code: None }),
            Err(_) => Ok(UnitExit::TimedOut),
        };
        exited
    }

    async fn destroy(&self, handle: &UnitHandle) -> Result<(), SubstrateError> {
        self.inner.destroys.lock().push(handle.unit_id.clone());
        if let Some(unit) = self.inner.units.lock().remove(&handle.unit_id) {
            unit.task.abort();
        }
        Ok(())
    }
}
