//! Script execution and run supervision.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::ProjectConfig;
use crate::errors::{PirunError, Result};
use crate::path_guard::PathGuard;
use crate::state::{RunRecord, RunRegistry, RunState, EXIT_CODE_ABNORMAL};

/// Log directory, relative to the project root.
pub const LOG_DIR: &str = "var/logs";

/// Settings for launching runs. Built from the project config; none of it
/// comes from clients.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub interpreter: PathBuf,
    pub script_extensions: Vec<String>,
    pub timeout: Duration,
}

impl ExecutorConfig {
    pub fn from_project(root: &Path, project: &ProjectConfig) -> Self {
        Self {
            interpreter: root.join(&project.venv_python),
            script_extensions: project.script_extensions.clone(),
            timeout: project.run_timeout(),
        }
    }
}

/// Returned to the caller as soon as a run is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct RunTicket {
    pub run_id: String,
    /// Seconds since the Unix epoch.
    pub started_at: i64,
    pub timeout_ms: u64,
}

/// Everything a supervising task needs, owned so it can outlive the request.
struct RunJob {
    run_id: String,
    script: PathBuf,
    args: Vec<String>,
    log_file: PathBuf,
    interpreter: PathBuf,
    cwd: PathBuf,
    timeout: Duration,
}

struct Outcome {
    state: RunState,
    exit_code: i32,
}

pub struct RunExecutor {
    guard: PathGuard,
    registry: RunRegistry,
    config: ExecutorConfig,
    log_dir: PathBuf,
}

impl RunExecutor {
    /// Create the executor, making sure the log directory exists.
    pub fn new(guard: PathGuard, registry: RunRegistry, config: ExecutorConfig) -> Result<Self> {
        let log_dir = guard.root().join(LOG_DIR);
        fs::create_dir_all(&log_dir)?;
        Ok(Self {
            guard,
            registry,
            config,
            log_dir,
        })
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Validate the script and start it in the background.
    ///
    /// The run record is inserted before the supervising task is spawned, so
    /// a status query issued right after this returns sees `running`.
    pub async fn start(&self, script_path: &str, args: Vec<String>) -> Result<RunTicket> {
        let script = self.validate_script(script_path)?;

        let record = self.registry.create(script_path, args, &self.log_dir).await;
        info!(
            run_id = %record.run_id,
            script = %script_path,
            args = ?record.args,
            "run accepted"
        );

        let ticket = RunTicket {
            run_id: record.run_id.clone(),
            started_at: record.started_at.timestamp(),
            timeout_ms: self.config.timeout.as_millis() as u64,
        };

        let job = self.job_for(&record, script);
        tokio::spawn(supervise(job, self.registry.clone()));

        Ok(ticket)
    }

    /// Current snapshot of a run.
    pub async fn status(&self, run_id: &str) -> Result<RunRecord> {
        self.registry.get(run_id).await
    }

    fn validate_script(&self, script_path: &str) -> Result<PathBuf> {
        let has_extension = Path::new(script_path)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.config.script_extensions.iter().any(|x| x == ext));
        if !has_extension {
            return Err(PirunError::InvalidScript(format!(
                "only {} files can be executed: {script_path}",
                self.config
                    .script_extensions
                    .iter()
                    .map(|e| format!(".{e}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let script = self.guard.resolve(script_path)?;
        if !script.is_file() {
            return Err(PirunError::NotFound(format!("script {script_path}")));
        }
        Ok(script)
    }

    fn job_for(&self, record: &RunRecord, script: PathBuf) -> RunJob {
        RunJob {
            run_id: record.run_id.clone(),
            script,
            args: record.args.clone(),
            log_file: record.log_file.clone(),
            interpreter: self.config.interpreter.clone(),
            cwd: self.guard.root().to_path_buf(),
            timeout: self.config.timeout,
        }
    }
}

/// Drive one run to a terminal state. Never propagates errors: failures are
/// written to the run's log and recorded as `failed`.
async fn supervise(job: RunJob, registry: RunRegistry) {
    let outcome = match execute(&job).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(run_id = %job.run_id, error = %err, "run failed to execute");
            if let Err(log_err) = append_log(&job.log_file, &format!("[ERROR: {err}]\n")).await {
                warn!(run_id = %job.run_id, error = %log_err, "could not write error to run log");
            }
            Outcome {
                state: RunState::Failed,
                exit_code: EXIT_CODE_ABNORMAL,
            }
        }
    };

    let ended_at: DateTime<Utc> = Utc::now();
    registry
        .update(&job.run_id, outcome.state, outcome.exit_code, ended_at)
        .await;
    info!(
        run_id = %job.run_id,
        state = ?outcome.state,
        exit_code = outcome.exit_code,
        "run finished"
    );
}

async fn execute(job: &RunJob) -> Result<Outcome> {
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&job.log_file)
        .map_err(|e| PirunError::Launch(format!("open log {}: {e}", job.log_file.display())))?;
    let stderr = stdout.try_clone()?;

    let mut cmd = Command::new(&job.interpreter);
    cmd.arg(&job.script)
        .args(&job.args)
        .current_dir(&job.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);
    // Own process group, so a timeout can take down everything the script started.
    #[cfg(unix)]
    cmd.process_group(0);
    apply_venv_env(&mut cmd, &job.interpreter);

    let mut child = cmd.spawn().map_err(|e| {
        PirunError::Launch(format!("spawn {}: {e}", job.interpreter.display()))
    })?;
    info!(run_id = %job.run_id, pid = ?child.id(), "process spawned");

    match tokio::time::timeout(job.timeout, child.wait()).await {
        Ok(status) => {
            let status = status?;
            let exit_code = status.code().unwrap_or(EXIT_CODE_ABNORMAL);
            let state = if status.success() {
                RunState::Succeeded
            } else {
                RunState::Failed
            };
            Ok(Outcome { state, exit_code })
        }
        Err(_) => {
            warn!(
                run_id = %job.run_id,
                timeout_ms = job.timeout.as_millis() as u64,
                "run timed out; killing"
            );
            kill_process_tree(&mut child).await?;
            let marker = PirunError::TimeoutKilled(job.timeout);
            if let Err(e) = append_log(&job.log_file, &format!("\n\n[{marker}]\n")).await {
                warn!(run_id = %job.run_id, error = %e, "could not write timeout marker");
            }
            Ok(Outcome {
                state: RunState::Killed,
                exit_code: EXIT_CODE_ABNORMAL,
            })
        }
    }
}

/// SIGKILL the child's process group, then reap the child. Nothing in the
/// group can write to the log afterwards.
#[cfg(unix)]
async fn kill_process_tree(child: &mut tokio::process::Child) -> std::io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => return Err(std::io::Error::from(e)),
    }
    child.wait().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn kill_process_tree(child: &mut tokio::process::Child) -> std::io::Result<()> {
    child.kill().await
}

/// Point the child at the virtual environment that owns `interpreter`.
fn apply_venv_env(cmd: &mut Command, interpreter: &Path) {
    let Some(bin_dir) = interpreter.parent() else {
        return;
    };
    if bin_dir.file_name().is_some_and(|n| n == "bin") {
        if let Some(venv) = bin_dir.parent() {
            cmd.env("VIRTUAL_ENV", venv);
        }
    }

    let mut paths = vec![bin_dir.to_path_buf()];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    if let Ok(joined) = std::env::join_paths(paths) {
        cmd.env("PATH", joined);
    }
}

async fn append_log(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::log_reader::tail_file;
    use tempfile::{tempdir, TempDir};

    fn executor(timeout: Duration) -> (TempDir, RunExecutor) {
        executor_with(timeout, PathBuf::from("/bin/sh"))
    }

    fn executor_with(timeout: Duration, interpreter: PathBuf) -> (TempDir, RunExecutor) {
        let dir = tempdir().unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        let config = ExecutorConfig {
            interpreter,
            script_extensions: vec!["sh".to_string()],
            timeout,
        };
        let exec = RunExecutor::new(guard, RunRegistry::new(), config).unwrap();
        (dir, exec)
    }

    async fn wait_terminal(exec: &RunExecutor, run_id: &str) -> RunRecord {
        for _ in 0..200 {
            let record = exec.status(run_id).await.unwrap();
            if record.state.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn successful_run_records_output() {
        let (dir, exec) = executor(Duration::from_secs(10));
        fs::write(dir.path().join("hello.sh"), "echo \"hello $1\"\necho oops >&2\n").unwrap();

        let ticket = exec.start("hello.sh", vec!["world".into()]).await.unwrap();
        assert_eq!(ticket.timeout_ms, 10_000);
        assert_eq!(
            exec.status(&ticket.run_id).await.unwrap().state,
            RunState::Running
        );

        let record = wait_terminal(&exec, &ticket.run_id).await;
        assert_eq!(record.state, RunState::Succeeded);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.ended_at.is_some());

        let log = tail_file(&record.log_file, 64).unwrap();
        assert!(log.contains("hello world"));
        assert!(log.contains("oops"));
    }

    #[tokio::test]
    async fn runs_in_project_root() {
        let (dir, exec) = executor(Duration::from_secs(10));
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/where.sh"), "pwd\n").unwrap();

        let ticket = exec.start("sub/where.sh", vec![]).await.unwrap();
        let record = wait_terminal(&exec, &ticket.run_id).await;

        let log = tail_file(&record.log_file, 64).unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        assert_eq!(log.trim(), root.display().to_string());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let (dir, exec) = executor(Duration::from_secs(10));
        fs::write(dir.path().join("bad.sh"), "exit 3\n").unwrap();

        let ticket = exec.start("bad.sh", vec![]).await.unwrap();
        let record = wait_terminal(&exec, &ticket.run_id).await;
        assert_eq!(record.state, RunState::Failed);
        assert_eq!(record.exit_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_kills_and_marks_log() {
        let (dir, exec) = executor(Duration::from_millis(200));
        fs::write(dir.path().join("slow.sh"), "echo started\nexec sleep 30\n").unwrap();

        let ticket = exec.start("slow.sh", vec![]).await.unwrap();
        let record = wait_terminal(&exec, &ticket.run_id).await;
        assert_eq!(record.state, RunState::Killed);
        assert_eq!(record.exit_code, Some(-1));

        let log = tail_file(&record.log_file, 64).unwrap();
        assert!(log.contains("started"));
        assert!(log.contains("[KILLED: Timeout after 0.2s]"));
    }

    #[tokio::test]
    async fn timeout_kills_background_children_too() {
        let (dir, exec) = executor(Duration::from_millis(200));
        fs::write(
            dir.path().join("spawner.sh"),
            "sh -c 'sleep 0.8; echo late-output-after-kill'\n",
        )
        .unwrap();

        let ticket = exec.start("spawner.sh", vec![]).await.unwrap();
        let record = wait_terminal(&exec, &ticket.run_id).await;
        assert_eq!(record.state, RunState::Killed);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let log = tail_file(&record.log_file, 64).unwrap();
        assert!(!log.contains("late-output-after-kill"), "log: {log:?}");
        assert!(log.ends_with("[KILLED: Timeout after 0.2s]\n"));
    }

    #[tokio::test]
    async fn launch_error_is_failed_with_logged_error() {
        let (dir, exec) = executor_with(
            Duration::from_secs(5),
            PathBuf::from("/definitely/not/an/interpreter"),
        );
        fs::write(dir.path().join("x.sh"), "true\n").unwrap();

        let ticket = exec.start("x.sh", vec![]).await.unwrap();
        let record = wait_terminal(&exec, &ticket.run_id).await;
        assert_eq!(record.state, RunState::Failed);
        assert_eq!(record.exit_code, Some(-1));

        let log = tail_file(&record.log_file, 64).unwrap();
        assert!(log.starts_with("[ERROR: "));
    }

    #[tokio::test]
    async fn rejected_scripts_create_no_record() {
        let (dir, exec) = executor(Duration::from_secs(5));
        fs::write(dir.path().join("notes.txt"), "echo hi\n").unwrap();

        assert!(matches!(
            exec.start("notes.txt", vec![]).await,
            Err(PirunError::InvalidScript(_))
        ));
        assert!(matches!(
            exec.start("../outside.sh", vec![]).await,
            Err(PirunError::PathEscape(_))
        ));
        assert!(matches!(
            exec.start("missing.sh", vec![]).await,
            Err(PirunError::NotFound(_))
        ));
        assert!(exec.registry().is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_runs_are_isolated() {
        let (dir, exec) = executor(Duration::from_secs(10));
        fs::write(dir.path().join("echo.sh"), "echo \"marker-$1\"\n").unwrap();

        let (a, b) = tokio::join!(
            exec.start("echo.sh", vec!["a".into()]),
            exec.start("echo.sh", vec!["b".into()])
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.run_id, b.run_id);

        let ra = wait_terminal(&exec, &a.run_id).await;
        let rb = wait_terminal(&exec, &b.run_id).await;
        let la = tail_file(&ra.log_file, 64).unwrap();
        let lb = tail_file(&rb.log_file, 64).unwrap();
        assert!(la.contains("marker-a") && !la.contains("marker-b"));
        assert!(lb.contains("marker-b") && !lb.contains("marker-a"));
    }

    #[tokio::test]
    async fn venv_is_exposed_to_the_process() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join(".venv/bin");
        fs::create_dir_all(&bin).unwrap();
        std::os::unix::fs::symlink("/bin/sh", bin.join("python")).unwrap();

        let guard = PathGuard::new(dir.path()).unwrap();
        let root = guard.root().to_path_buf();
        let config = ExecutorConfig::from_project(
            &root,
            &ProjectConfig {
                script_extensions: vec!["sh".into()],
                ..ProjectConfig::default()
            },
        );
        let exec = RunExecutor::new(guard, RunRegistry::new(), config).unwrap();
        fs::write(root.join("env.sh"), "echo \"$VIRTUAL_ENV\"\n").unwrap();

        let ticket = exec.start("env.sh", vec![]).await.unwrap();
        let record = wait_terminal(&exec, &ticket.run_id).await;
        assert_eq!(record.state, RunState::Succeeded);

        let log = tail_file(&record.log_file, 64).unwrap();
        assert_eq!(log.trim(), root.join(".venv").display().to_string());
    }
}
