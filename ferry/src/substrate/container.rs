use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::process::{ProcessTable, UnitInputs, CONFIG_FILE, STATE_FILE};
use super::{
    ExecutionSubstrate, UnitExit, UnitHandle, UnitOutput, UnitSpec, ENV_CONFIG_PATH,
    ENV_STATE_PATH,
};
use crate::config::SubstrateConfig;
use crate::error::SubstrateError;

/// Mount point of the unit's input directory inside the container.
pub const INPUT_MOUNT: &str = "/ferry/input";

/// Runs units as containers through a Docker-compatible CLI.
///
/// Containers are named after the unit id, so a unit left behind by a
/// crashed orchestrator can still be removed with [`ExecutionSubstrate::destroy`].
pub struct ContainerSubstrate {
    config: SubstrateConfig,
    clients: ProcessTable,
}

impl std::fmt::Debug for ContainerSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSubstrate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContainerSubstrate {
    pub fn new(config: SubstrateConfig) -> Self {
        Self {
            config,
            clients: ProcessTable::default(),
        }
    }

    /// Arguments for `docker run` that launch `spec`.
    pub fn run_args(&self, spec: &UnitSpec, input_dir: &str) -> Vec<String> {
        let container = &self.config.container;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            spec.unit_id.clone(),
            "--label".to_string(),
            format!("ferry.job_id={}", spec.job_id),
            "--label".to_string(),
            format!("ferry.attempt={}", spec.attempt_number),
        ];

        if let Some(cpus) = spec.resources.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        if let Some(memory) = spec.resources.memory_bytes {
            args.push("--memory".into());
            args.push(format!("{memory}b"));
        }
        if let Some(network) = &container.network {
            args.push("--network".into());
            args.push(network.clone());
        }

        let config_path = format!("{INPUT_MOUNT}/{CONFIG_FILE}");
        let state_path = format!("{INPUT_MOUNT}/{STATE_FILE}");
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push("-e".into());
        args.push(format!("{ENV_CONFIG_PATH}={config_path}"));
        if spec.checkpoint.is_some() {
            args.push("-e".into());
            args.push(format!("{ENV_STATE_PATH}={state_path}"));
        }

        args.push("-v".into());
        args.push(format!("{input_dir}:{INPUT_MOUNT}:ro"));
        args.extend(container.extra_run_args.iter().cloned());

        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        args.push("--config".into());
        args.push(config_path);
        if spec.checkpoint.is_some() {
            args.push("--state".into());
            args.push(state_path);
        }
        args
    }

    async fn cli(&self, args: &[&str]) -> Result<std::process::Output, SubstrateError> {
        let output = Command::new(&self.config.container.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output)
    }
}

#[async_trait]
impl ExecutionSubstrate for ContainerSubstrate {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn start(&self, spec: &UnitSpec) -> Result<UnitHandle, SubstrateError> {
        let inputs = UnitInputs::prepare(self.config.work_dir.as_deref(), spec)?;
        let input_dir = inputs.dir.path().to_string_lossy().into_owned();

        let mut command = Command::new(&self.config.container.binary);
        command.args(self.run_args(spec, &input_dir));

        match self.clients.spawn(&spec.unit_id, command, inputs.dir) {
            Ok(handle) => {
                debug!(unit_id = %handle, image = %spec.image, "started container unit");
                Ok(handle)
            }
            Err(err) => {
                // The CLI may have created the container before failing.
                if let Err(cleanup) = self.destroy(&UnitHandle::new(&spec.unit_id)).await {
                    warn!(unit_id = %spec.unit_id, error = %cleanup, "cleanup after failed start");
                }
                Err(err)
            }
        }
    }

    async fn attach_output(&self, handle: &UnitHandle) -> Result<UnitOutput, SubstrateError> {
        self.clients.take_output(handle)
    }

    async fn signal_terminate(&self, handle: &UnitHandle) -> Result<(), SubstrateError> {
        let output = self
            .cli(&["kill", "--signal", "TERM", handle.unit_id.as_str()])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(unit_id = %handle, %stderr, "terminate signal not delivered");
        }
        Ok(())
    }

    async fn await_exit(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<UnitExit, SubstrateError> {
        self.clients.await_exit(handle, timeout).await
    }

    async fn destroy(&self, handle: &UnitHandle) -> Result<(), SubstrateError> {
        let output = self.cli(&["rm", "-f", handle.unit_id.as_str()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if !stderr.contains("No such container") {
                return Err(SubstrateError::Command {
                    command: format!("{} rm -f {}", self.config.container.binary, handle),
                    stderr,
                });
            }
        }

        let reap_wait = Duration::from_millis(self.config.reap_wait_ms);
        self.clients.remove(handle, reap_wait).await;
        debug!(unit_id = %handle, "destroyed container unit");
        Ok(())
    }
}
