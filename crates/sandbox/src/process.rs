//! Restricted host-process backend.
//!
//! Serves `Process` and `VirtualFilesystem` sandboxes: each sandbox gets a
//! private temporary directory, commands run through `sh -c` with a cleared
//! environment and `setrlimit` ceilings, in their own process group so the
//! whole tree can be signalled.
//!
//! While a command runs a watchdog samples the group's resident memory and
//! the sandbox directory size, killing the group when either crosses its
//! ceiling. `RLIMIT_AS` sits above the memory ceiling as a backstop; an
//! allocation refused by it is recognised from the command's stderr.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

use sandflow_core::{
    Error, ResourceKind, ResourceLimits, ResourceUsage, Result, SandboxConfiguration, SandboxId,
};

use crate::engine::{BackendOutput, ExecRequest, SandboxEngine};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);
/// Disk is walked once every this many memory samples.
const DISK_SAMPLE_EVERY: u32 = 5;
/// Address-space backstop as a multiple of the memory ceiling.
const ADDRESS_SPACE_FACTOR: u64 = 4;

/// Lowercased stderr fragments left by allocations the kernel refused.
const ALLOCATION_FAILURES: &[&str] = &[
    "memoryerror",
    "cannot allocate memory",
    "out of memory",
    "memory exhausted",
    "bad_alloc",
    "xmalloc",
    "out of space",
];

struct ProcessEntry {
    dir: TempDir,
    limits: ResourceLimits,
    cpu_seconds: u64,
    env: HashMap<String, String>,
    /// Process-group leaders of commands currently running.
    running: HashSet<u32>,
}

/// Host-process sandbox engine.
#[derive(Default)]
pub struct ProcessSandbox {
    entries: Mutex<HashMap<SandboxId, ProcessEntry>>,
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal_running(&self, id: &SandboxId, signal: libc::c_int) -> Result<()> {
        let groups: Vec<u32> = match self.entries.lock().get(id) {
            Some(entry) => entry.running.iter().copied().collect(),
            None => return Err(Error::SandboxNotFound(id.to_string())),
        };
        for pgid in groups {
            signal_group(pgid, signal);
        }
        Ok(())
    }
}

/// Send `signal` to every process in group `pgid`.
fn signal_group(pgid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group we created with process_group(0).
    unsafe {
        libc::kill(-(pgid as libc::pid_t), signal);
    }
}

/// Apply the sandbox ceilings to the child between fork and exec.
fn apply_limits(cmd: &mut Command, limits: &ResourceLimits, cpu_seconds: u64) {
    let max_memory = limits
        .max_memory_bytes
        .saturating_mul(ADDRESS_SPACE_FACTOR) as libc::rlim_t;
    let max_files = limits.max_file_handles as libc::rlim_t;
    let max_file_size = limits.max_disk_bytes as libc::rlim_t;
    let max_cpu = cpu_seconds as libc::rlim_t;

    // SAFETY: pre_exec runs between fork() and exec() in the child process.
    // The closure only calls setrlimit, which is async-signal-safe, on Copy
    // values moved into it. The parent is not affected.
    unsafe {
        cmd.pre_exec(move || {
            let set = |resource, value: libc::rlim_t| {
                let limit = libc::rlimit {
                    rlim_cur: value,
                    rlim_max: value,
                };
                libc::setrlimit(resource, &limit);
            };
            set(libc::RLIMIT_AS, max_memory);
            set(libc::RLIMIT_NOFILE, max_files);
            set(libc::RLIMIT_FSIZE, max_file_size);
            set(libc::RLIMIT_CPU, max_cpu);
            // RLIMIT_NPROC counts every process of the uid, not this tree,
            // so the process ceiling is left to the container backend.
            Ok(())
        });
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

async fn disk_usage(path: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || dir_size(&path))
        .await
        .unwrap_or(0)
}

/// Process group of `pid`, read from `/proc/<pid>/stat`.
fn process_group_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces and parentheses.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(2)?.parse().ok()
}

fn resident_bytes(pid: u32) -> u64 {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) else {
        return 0;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|kb| kb.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

/// Resident memory summed over every process in group `pgid`. Zero where
/// `/proc` is unavailable.
fn group_resident_bytes(pgid: u32) -> u64 {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| process_group_of(*pid) == Some(pgid))
        .map(resident_bytes)
        .sum()
}

fn allocation_failed(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    ALLOCATION_FAILURES.iter().any(|marker| stderr.contains(marker))
}

/// Samples one running command's process group.
struct Watchdog {
    pgid: Option<u32>,
    workdir: PathBuf,
    max_memory_bytes: u64,
    max_disk_bytes: u64,
    peak_memory_bytes: u64,
}

impl Watchdog {
    fn new(pgid: Option<u32>, workdir: &Path, limits: &ResourceLimits) -> Self {
        Self {
            pgid,
            workdir: workdir.to_path_buf(),
            max_memory_bytes: limits.max_memory_bytes,
            max_disk_bytes: limits.max_disk_bytes,
            peak_memory_bytes: 0,
        }
    }

    /// Resolves with the first ceiling the group crosses.
    async fn breach(&mut self) -> ResourceKind {
        let Some(pgid) = self.pgid else {
            return std::future::pending().await;
        };
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        let mut samples = 0u32;
        loop {
            ticker.tick().await;
            let resident = tokio::task::spawn_blocking(move || group_resident_bytes(pgid))
                .await
                .unwrap_or(0);
            self.peak_memory_bytes = self.peak_memory_bytes.max(resident);
            if resident >= self.max_memory_bytes {
                return ResourceKind::Memory;
            }

            samples += 1;
            if samples % DISK_SAMPLE_EVERY == 0
                && disk_usage(self.workdir.clone()).await > self.max_disk_bytes
            {
                return ResourceKind::Disk;
            }
        }
    }
}

#[async_trait]
impl SandboxEngine for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn provision(&self, id: &SandboxId, config: &SandboxConfiguration) -> Result<()> {
        let dir = tempfile::Builder::new()
            .prefix("sandflow-")
            .tempdir()
            .map_err(|e| Error::sandbox_backend(format!("Failed to create sandbox directory: {}", e)))?;
        tracing::debug!(sandbox_id = %id, path = %dir.path().display(), "Sandbox directory created");

        self.entries.lock().insert(
            id.clone(),
            ProcessEntry {
                dir,
                limits: config.limits.clone(),
                cpu_seconds: config.max_execution_time.as_secs().max(1),
                env: config.env.clone(),
                running: HashSet::new(),
            },
        );
        Ok(())
    }

    async fn start(&self, id: &SandboxId) -> Result<()> {
        if self.entries.lock().contains_key(id) {
            Ok(())
        } else {
            Err(Error::SandboxNotFound(id.to_string()))
        }
    }

    async fn exec(&self, id: &SandboxId, request: &ExecRequest) -> Result<BackendOutput> {
        let (workdir, limits, cpu_seconds, env) = {
            let entries = self.entries.lock();
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::SandboxNotFound(id.to_string()))?;
            (
                entry.dir.path().to_path_buf(),
                entry.limits.clone(),
                entry.cpu_seconds,
                entry.env.clone(),
            )
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&workdir)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", &workdir)
            .envs(&env)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        apply_limits(&mut cmd, &limits, cpu_seconds);

        let child = cmd
            .spawn()
            .map_err(|e| Error::sandbox_backend(format!("Failed to spawn command: {}", e)))?;
        let pgid = child.id();
        if let Some(pgid) = pgid {
            if let Some(entry) = self.entries.lock().get_mut(id) {
                entry.running.insert(pgid);
            }
        }

        let mut watchdog = Watchdog::new(pgid, &workdir, &limits);
        let (waited, breach) = {
            let wait = tokio::time::timeout(request.timeout, child.wait_with_output());
            tokio::pin!(wait);
            let sample = watchdog.breach();
            tokio::pin!(sample);
            let mut breach = None;
            let waited = loop {
                tokio::select! {
                    waited = &mut wait => break waited,
                    resource = &mut sample, if breach.is_none() => {
                        tracing::warn!(
                            sandbox_id = %id,
                            command = %request.command,
                            resource = %resource,
                            "Process sandbox command over its limit, killing"
                        );
                        if let Some(pgid) = pgid {
                            signal_group(pgid, libc::SIGKILL);
                        }
                        breach = Some(resource);
                    }
                }
            };
            (waited, breach)
        };

        if let Some(pgid) = pgid {
            if let Some(entry) = self.entries.lock().get_mut(id) {
                entry.running.remove(&pgid);
            }
        }

        let mut usage = ResourceUsage::empty();
        usage.memory_bytes = watchdog.peak_memory_bytes;
        usage.disk_bytes = disk_usage(workdir).await;

        match waited {
            Err(_) => {
                if let Some(pgid) = pgid {
                    signal_group(pgid, libc::SIGKILL);
                }
                tracing::warn!(sandbox_id = %id, command = %request.command, "Process sandbox command timed out");
                Ok(BackendOutput::timed_out(String::new(), String::new(), request.timeout)
                    .with_usage(usage))
            }
            Ok(Err(e)) => Err(Error::sandbox_backend(format!(
                "Failed to wait for command: {}",
                e
            ))),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let (exit_code, limit) = match (output.status.code(), output.status.signal()) {
                    (Some(code), _) => (code as i64, None),
                    (None, Some(signal)) => {
                        let limit = match signal {
                            libc::SIGXCPU => Some(ResourceKind::Cpu),
                            libc::SIGXFSZ => Some(ResourceKind::Disk),
                            _ => None,
                        };
                        (128 + signal as i64, limit)
                    }
                    (None, None) => (-1, None),
                };
                let limit = breach.or(limit).or_else(|| {
                    (exit_code != 0 && allocation_failed(&stderr)).then_some(ResourceKind::Memory)
                });

                let mut result = BackendOutput::exit(exit_code, stdout, stderr).with_usage(usage);
                if let Some(resource) = limit {
                    result = result.with_limit_exceeded(resource);
                }
                Ok(result)
            }
        }
    }

    async fn terminate(&self, id: &SandboxId) -> Result<()> {
        self.signal_running(id, libc::SIGTERM)
    }

    async fn suspend(&self, id: &SandboxId) -> Result<()> {
        self.signal_running(id, libc::SIGSTOP)
    }

    async fn resume(&self, id: &SandboxId) -> Result<()> {
        self.signal_running(id, libc::SIGCONT)
    }

    async fn destroy(&self, id: &SandboxId) -> Result<()> {
        let entry = self.entries.lock().remove(id);
        if let Some(entry) = entry {
            for pgid in &entry.running {
                signal_group(*pgid, libc::SIGKILL);
            }
            let path = entry.dir.path().display().to_string();
            entry
                .dir
                .close()
                .map_err(|e| Error::sandbox_backend(format!("Failed to remove {}: {}", path, e)))?;
            tracing::debug!(sandbox_id = %id, "Sandbox directory removed");
        }
        Ok(())
    }

    async fn is_available(&self) -> bool {
        Path::new("/bin/sh").exists()
    }

    fn workdir(&self, id: &SandboxId, config: &SandboxConfiguration) -> String {
        self.entries
            .lock()
            .get(id)
            .map(|entry| entry.dir.path().display().to_string())
            .unwrap_or_else(|| config.workdir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandflow_core::{SandboxType, TIMEOUT_EXIT_CODE};

    fn config() -> SandboxConfiguration {
        SandboxConfiguration {
            sandbox_type: SandboxType::Process,
            ..Default::default()
        }
    }

    async fn provisioned() -> (ProcessSandbox, SandboxId) {
        let backend = ProcessSandbox::new();
        let id = SandboxId::generate();
        backend.provision(&id, &config()).await.unwrap();
        backend.start(&id).await.unwrap();
        (backend, id)
    }

    #[tokio::test]
    async fn test_runs_in_private_directory() {
        let (backend, id) = provisioned().await;
        let workdir = backend.workdir(&id, &config());
        assert_ne!(workdir, "/workspace");

        let out = backend
            .exec(&id, &ExecRequest::new("echo hi > note.txt && pwd", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), workdir);
        assert!(out.usage.disk_bytes > 0);

        backend.destroy(&id).await.unwrap();
        assert!(!Path::new(&workdir).exists());
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("SANDFLOW_HOST_SECRET", "leak");
        let (backend, id) = provisioned().await;
        let mut request = ExecRequest::new("echo \"$SANDFLOW_HOST_SECRET|$STAGE\"", Duration::from_secs(10));
        request.env.insert("STAGE".into(), "build".into());

        let out = backend.exec(&id, &request).await.unwrap();
        assert_eq!(out.stdout.trim(), "|build");
        backend.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_and_timeout() {
        let (backend, id) = provisioned().await;

        let out = backend
            .exec(&id, &ExecRequest::new("echo oops >&2; exit 3", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");

        let out = backend
            .exec(&id, &ExecRequest::new("sleep 30", Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        backend.destroy(&id).await.unwrap();
    }

    fn limited(max_memory_bytes: u64) -> SandboxConfiguration {
        let mut config = config();
        config.limits.max_memory_bytes = max_memory_bytes;
        config
    }

    #[tokio::test]
    async fn test_resident_memory_over_limit_kills_group() {
        let backend = ProcessSandbox::new();
        let id = SandboxId::generate();
        backend.provision(&id, &limited(32 * 1024 * 1024)).await.unwrap();

        // Holds ~48 MB in a shell variable, then idles.
        let out = backend
            .exec(
                &id,
                &ExecRequest::new(
                    "x=$(head -c 48000000 /dev/zero | tr '\\0' a); sleep 20; echo ${#x}",
                    Duration::from_secs(15),
                ),
            )
            .await
            .unwrap();
        assert!(!out.timed_out);
        assert_ne!(out.exit_code, 0);
        assert_eq!(out.limit_exceeded, Some(ResourceKind::Memory));
        backend.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_allocation_is_memory_breach() {
        if !Path::new("/usr/bin/python3").exists() {
            return;
        }
        let backend = ProcessSandbox::new();
        let id = SandboxId::generate();
        backend.provision(&id, &limited(256 * 1024 * 1024)).await.unwrap();

        let out = backend
            .exec(
                &id,
                &ExecRequest::new(
                    "python3 -c 'x = bytearray(2_000_000_000)'",
                    Duration::from_secs(15),
                ),
            )
            .await
            .unwrap();
        assert_ne!(out.exit_code, 0);
        assert_eq!(out.limit_exceeded, Some(ResourceKind::Memory));
        backend.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_peak_memory_is_reported() {
        let (backend, id) = provisioned().await;
        let out = backend
            .exec(&id, &ExecRequest::new("sleep 0.3", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.limit_exceeded.is_none());
        assert!(out.usage.memory_bytes > 0);
        backend.destroy(&id).await.unwrap();
    }

    #[test]
    fn test_allocation_failure_markers() {
        assert!(allocation_failed("Traceback ...\nMemoryError\n"));
        assert!(allocation_failed("tail: memory exhausted"));
        assert!(!allocation_failed("error: file not found"));
    }

    #[tokio::test]
    async fn test_destroy_unknown_is_noop() {
        let backend = ProcessSandbox::new();
        backend.destroy(&SandboxId::from("never-created")).await.unwrap();
        assert!(backend
            .exec(&SandboxId::from("never-created"), &ExecRequest::new("true", Duration::from_secs(1)))
            .await
            .is_err());
    }
}
