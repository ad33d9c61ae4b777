//! Pirun - edit and run project scripts over HTTP, confined to one directory.

pub mod config;
pub mod errors;
pub mod files;
pub mod http_server;
pub mod log_reader;
pub mod logging;
pub mod path_guard;
pub mod runner;
pub mod state;

use std::path::Path;

use crate::config::ProjectConfig;
use crate::errors::Result;
use crate::files::FileStore;
use crate::path_guard::PathGuard;
use crate::runner::{ExecutorConfig, RunExecutor};
use crate::state::{AppState, RunRegistry};

/// Wire up the services for a project root.
pub fn build_state(root: &Path, config: &ProjectConfig) -> Result<AppState> {
    let guard = PathGuard::new(root)?;
    let exec_config = ExecutorConfig::from_project(guard.root(), config);
    let executor = RunExecutor::new(guard.clone(), RunRegistry::new(), exec_config)?;
    Ok(AppState::new(FileStore::new(guard), executor))
}
