//! Shared application state and run records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::{PirunError, Result};
use crate::files::FileStore;
use crate::log_reader::LogReader;
use crate::runner::RunExecutor;

/// Exit code recorded for runs that were killed or never launched.
pub const EXIT_CODE_ABNORMAL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Running)
    }
}

/// One script invocation, from acceptance to terminal state.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    /// Script path as the client supplied it, relative to the project root.
    pub script_path: String,
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub log_file: PathBuf,
}

/// Thread-safe run table. Clones share the same underlying map.
///
/// The lock is only ever held for a map lookup or mutation.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, RunRecord>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh `running` record under a new identifier and return a
    /// snapshot of it. The log file is named after the identifier inside
    /// `log_dir`.
    pub async fn create(
        &self,
        script_path: &str,
        args: Vec<String>,
        log_dir: &Path,
    ) -> RunRecord {
        let run_id = uuid::Uuid::new_v4().to_string();
        let record = RunRecord {
            log_file: log_dir.join(format!("{run_id}.log")),
            run_id: run_id.clone(),
            script_path: script_path.to_string(),
            args,
            started_at: Utc::now(),
            ended_at: None,
            state: RunState::Running,
            exit_code: None,
        };

        self.runs.lock().await.insert(run_id, record.clone());
        record
    }

    /// Snapshot of a run record.
    pub async fn get(&self, run_id: &str) -> Result<RunRecord> {
        self.runs
            .lock()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| PirunError::NotFound(format!("run {run_id}")))
    }

    /// Move a running record into its terminal state. Records that are already
    /// terminal are left untouched; returns whether the transition happened.
    pub async fn update(
        &self,
        run_id: &str,
        state: RunState,
        exit_code: i32,
        ended_at: DateTime<Utc>,
    ) -> bool {
        let mut runs = self.runs.lock().await;
        let Some(record) = runs.get_mut(run_id) else {
            warn!(run_id = %run_id, "update for unknown run");
            return false;
        };
        if record.state.is_terminal() || !state.is_terminal() {
            warn!(
                run_id = %run_id,
                from = ?record.state,
                to = ?state,
                "ignoring non-monotone run state transition"
            );
            return false;
        }

        record.state = state;
        record.exit_code = Some(exit_code);
        record.ended_at = Some(ended_at);
        true
    }

    /// Drop terminal records that ended before `cutoff`. Running records are
    /// always kept.
    pub async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut runs = self.runs.lock().await;
        let before = runs.len();
        runs.retain(|_, r| match r.ended_at {
            Some(ended) if r.state.is_terminal() => ended >= cutoff,
            _ => true,
        });
        let evicted = before - runs.len();
        if evicted > 0 {
            debug!(evicted, remaining = runs.len(), "evicted finished runs");
        }
        evicted
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.runs.lock().await.is_empty()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub files: Arc<FileStore>,
    pub runs: Arc<RunExecutor>,
    pub logs: LogReader,
}

impl AppState {
    pub fn new(files: FileStore, runs: RunExecutor) -> Self {
        let logs = LogReader::new(runs.registry().clone());
        Self {
            files: Arc::new(files),
            runs: Arc::new(runs),
            logs,
        }
    }
}
