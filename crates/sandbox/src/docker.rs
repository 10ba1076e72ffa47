//! Docker-based sandbox backend using the `bollard` crate.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use sandflow_core::{
    Error, NetworkIsolationLevel, ResourceKind, ResourceUsage, Result, SandboxConfiguration,
    SandboxId,
};

use crate::engine::{BackendOutput, ExecRequest, SandboxEngine};

const SANDBOX_USER: &str = "agent";
const MANAGED_BY_LABEL: &str = "sandflow-sandbox";
/// Exit code of a process killed by SIGKILL (128 + 9), the OOM killer's signal.
const SIGKILL_EXIT_CODE: i64 = 137;
/// Environment variable tagging every process an exec starts.
const EXEC_MARKER: &str = "SANDFLOW_EXEC";
/// Wait between SIGTERM and SIGKILL for a timed-out exec.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Sends `$SIGNAL` to every process whose environment carries
/// `SANDFLOW_EXEC=$TARGET_EXEC`. Children inherit the tag, so the whole
/// tree of one exec is reached and nothing else is.
const SIGNAL_EXEC_SCRIPT: &str = r#"for p in /proc/[0-9]*; do
  if tr '\0' '\n' < "$p/environ" 2>/dev/null | grep -qx "SANDFLOW_EXEC=$TARGET_EXEC"; then
    kill -s "$SIGNAL" "${p#/proc/}" 2>/dev/null
  fi
done
exit 0"#;

/// Docker-based sandbox engine.
///
/// Creates isolated containers with:
/// - No network (isolated) or a bridge gated by the permission broker
/// - Read-only root filesystem (writable tmpfs workdir only)
/// - Memory, CPU, pids and open-file limits
/// - Non-root user execution, all capabilities dropped
pub struct DockerSandbox {
    docker: bollard::Docker,
    workdirs: parking_lot::Mutex<HashMap<SandboxId, String>>,
    /// Marker tags of execs still running, per sandbox.
    running: parking_lot::Mutex<HashMap<SandboxId, HashSet<String>>>,
}

impl DockerSandbox {
    /// Create a new Docker sandbox engine connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            Error::backend_unavailable(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self::from_client(docker))
    }

    /// Create from an existing bollard Docker client.
    pub fn from_client(docker: bollard::Docker) -> Self {
        Self {
            docker,
            workdirs: parking_lot::Mutex::new(HashMap::new()),
            running: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Send `signal` (a name such as `TERM`) to the processes of one exec.
    async fn signal_exec(&self, id: &SandboxId, tag: &str, signal: &str) -> Result<()> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let env = [format!("TARGET_EXEC={}", tag), format!("SIGNAL={}", signal)];
        let exec = self
            .docker
            .create_exec(
                id.as_str(),
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", SIGNAL_EXEC_SCRIPT]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some(SANDBOX_USER),
                    env: Some(env.iter().map(String::as_str).collect()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::sandbox_backend(format!("Failed to create signal exec: {}", e)))?;
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::sandbox_backend(format!("Failed to signal sandbox command: {}", e)))?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while output.next().await.is_some() {}
        }
        tracing::debug!(sandbox_id = %id, exec = %tag, signal = %signal, "Signalled sandbox exec");
        Ok(())
    }

    /// SIGTERM a timed-out exec, then SIGKILL it if it outlives the grace.
    async fn stop_exec(&self, id: &SandboxId, tag: &str, exec_id: &str) {
        if let Err(e) = self.signal_exec(id, tag, "TERM").await {
            tracing::warn!(sandbox_id = %id, error = %e, "Failed to SIGTERM timed-out exec");
        }
        tokio::time::sleep(KILL_GRACE).await;

        let still_running = match self.docker.inspect_exec(exec_id).await {
            Ok(inspect) => inspect.running.unwrap_or(false),
            Err(_) => true,
        };
        if still_running {
            tracing::warn!(sandbox_id = %id, exec = %tag, "Exec ignored SIGTERM, sending SIGKILL");
            if let Err(e) = self.signal_exec(id, tag, "KILL").await {
                tracing::warn!(sandbox_id = %id, error = %e, "Failed to SIGKILL timed-out exec");
            }
        }
    }

    /// Stream an exec's output until it exits or times out.
    async fn attach_exec(
        &self,
        id: &SandboxId,
        exec_id: &str,
        tag: &str,
        request: &ExecRequest,
    ) -> Result<BackendOutput> {
        use bollard::exec::StartExecResults;

        let start_result = self
            .docker
            .start_exec(exec_id, None)
            .await
            .map_err(|e| Error::sandbox_backend(format!("Failed to start exec in sandbox: {}", e)))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            let collect_future = async {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {} // ignore stdin logs
                        Err(e) => {
                            stderr.push_str(&format!("\n[sandbox error: {}]", e));
                            break;
                        }
                    }
                }
            };

            if tokio::time::timeout(request.timeout, collect_future)
                .await
                .is_err()
            {
                tracing::warn!(sandbox_id = %id, command = %request.command, "Sandbox exec timed out");
                self.stop_exec(id, tag, exec_id).await;
                let usage = self.sample_usage(id).await;
                return Ok(BackendOutput::timed_out(stdout, stderr, request.timeout).with_usage(usage));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| Error::sandbox_backend(format!("Failed to inspect exec result: {}", e)))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        let usage = self.sample_usage(id).await;
        let mut output = BackendOutput::exit(exit_code, stdout, stderr).with_usage(usage);
        if exit_code == SIGKILL_EXIT_CODE && self.oom_killed(id).await {
            output = output.with_limit_exceeded(ResourceKind::Memory);
        }
        Ok(output)
    }

    fn track(&self, id: &SandboxId, tag: &str, running: bool) {
        let mut execs = self.running.lock();
        if running {
            execs.entry(id.clone()).or_default().insert(tag.to_string());
        } else if let Some(tags) = execs.get_mut(id) {
            tags.remove(tag);
            if tags.is_empty() {
                execs.remove(id);
            }
        }
    }

    fn workdir(&self, id: &SandboxId) -> String {
        self.workdirs
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| "/workspace".to_string())
    }

    fn host_config(config: &SandboxConfiguration) -> bollard::models::HostConfig {
        use bollard::models::{HostConfig, Mount, MountTmpfsOptions, MountTypeEnum, ResourcesUlimits};

        let limits = &config.limits;
        HostConfig {
            memory: Some(limits.max_memory_bytes as i64),
            cpu_quota: Some((limits.max_cpu_percent / 100.0 * 100_000.0) as i64),
            cpu_period: Some(100_000), // standard 100ms period
            network_mode: Some(
                match config.network {
                    NetworkIsolationLevel::Isolated => "none",
                    NetworkIsolationLevel::Restricted | NetworkIsolationLevel::Open => "bridge",
                }
                .to_string(),
            ),
            // Writable scratch space bounded by the disk limit
            mounts: Some(vec![Mount {
                target: Some(config.workdir.clone()),
                typ: Some(MountTypeEnum::TMPFS),
                tmpfs_options: Some(MountTmpfsOptions {
                    size_bytes: Some(limits.max_disk_bytes as i64),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(limits.max_processes as i64),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(limits.max_file_handles as i64),
                hard: Some(limits.max_file_handles as i64),
            }]),
            ..Default::default()
        }
    }

    /// One-shot stats sample. Missing numbers stay zero ("not measured").
    async fn sample_usage(&self, id: &SandboxId) -> ResourceUsage {
        use bollard::container::StatsOptions;

        let mut usage = ResourceUsage::empty();
        let mut stream = self.docker.stats(
            id.as_str(),
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        if let Some(Ok(stats)) = stream.next().await {
            usage.memory_bytes = stats.memory_stats.usage.unwrap_or(0);
            usage.processes = stats.pids_stats.current.unwrap_or(0) as u32;
        }
        usage
    }

    async fn oom_killed(&self, id: &SandboxId) -> bool {
        match self.docker.inspect_container(id.as_str(), None).await {
            Ok(info) => info
                .state
                .and_then(|s| s.oom_killed)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl SandboxEngine for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, id: &SandboxId, config: &SandboxConfiguration) -> Result<()> {
        use bollard::container::{Config, CreateContainerOptions};

        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let container_config = Config {
            image: Some(config.image.clone()),
            working_dir: Some(config.workdir.clone()),
            user: Some(SANDBOX_USER.to_string()), // non-root
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            host_config: Some(Self::host_config(config)),
            labels: Some(HashMap::from([
                ("managed-by".to_string(), MANAGED_BY_LABEL.to_string()),
                ("sandflow.sandbox-id".to_string(), id.to_string()),
            ])),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: id.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| Error::sandbox_backend(format!("Failed to create sandbox container: {}", e)))?;

        self.workdirs.lock().insert(id.clone(), config.workdir.clone());
        tracing::info!(sandbox_id = %id, image = %config.image, "Sandbox container created");
        Ok(())
    }

    async fn start(&self, id: &SandboxId) -> Result<()> {
        self.docker
            .start_container::<String>(id.as_str(), None)
            .await
            .map_err(|e| Error::sandbox_backend(format!("Failed to start sandbox container: {}", e)))?;
        tracing::info!(sandbox_id = %id, "Sandbox container started");
        Ok(())
    }

    async fn exec(&self, id: &SandboxId, request: &ExecRequest) -> Result<BackendOutput> {
        use bollard::exec::CreateExecOptions;

        let workdir = self.workdir(id);
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(std::iter::once(format!("{}={}", EXEC_MARKER, tag)))
            .collect();
        let exec_options = CreateExecOptions {
            cmd: Some(vec!["sh", "-c", request.command.as_str()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(workdir.as_str()),
            user: Some(SANDBOX_USER),
            env: Some(env.iter().map(String::as_str).collect()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id.as_str(), exec_options)
            .await
            .map_err(|e| Error::sandbox_backend(format!("Failed to create exec in sandbox: {}", e)))?;

        self.track(id, &tag, true);
        let outcome = self.attach_exec(id, &exec.id, &tag, request).await;
        self.track(id, &tag, false);
        outcome
    }

    async fn terminate(&self, id: &SandboxId) -> Result<()> {
        let tags: Vec<String> = self
            .running
            .lock()
            .get(id)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default();
        for tag in tags {
            self.signal_exec(id, &tag, "TERM").await?;
        }
        Ok(())
    }

    async fn suspend(&self, id: &SandboxId) -> Result<()> {
        self.docker
            .pause_container(id.as_str())
            .await
            .map_err(|e| Error::sandbox_backend(format!("Failed to pause sandbox container: {}", e)))
    }

    async fn resume(&self, id: &SandboxId) -> Result<()> {
        self.docker
            .unpause_container(id.as_str())
            .await
            .map_err(|e| Error::sandbox_backend(format!("Failed to unpause sandbox container: {}", e)))
    }

    async fn destroy(&self, id: &SandboxId) -> Result<()> {
        use bollard::container::{RemoveContainerOptions, StopContainerOptions};

        self.running.lock().remove(id);

        // Stop the container (with 5s grace period)
        if let Err(e) = self
            .docker
            .stop_container(id.as_str(), Some(StopContainerOptions { t: 5 }))
            .await
        {
            if !is_not_found(&e) {
                tracing::warn!(sandbox_id = %id, error = %e, "Sandbox container did not stop cleanly, forcing removal");
            }
        }

        match self
            .docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                tracing::debug!(sandbox_id = %id, "Sandbox container already gone");
            }
            Err(e) => {
                return Err(Error::sandbox_backend(format!(
                    "Failed to remove sandbox container: {}",
                    e
                )))
            }
        }

        self.workdirs.lock().remove(id);
        tracing::info!(sandbox_id = %id, "Sandbox container destroyed");
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}
