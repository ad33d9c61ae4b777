//! Project configuration stored in `<root>/.pirun.yaml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{PirunError, Result};

pub const CONFIG_FILE_NAME: &str = ".pirun.yaml";

fn default_name() -> String { "pirun-project".to_string() }
fn default_venv_python() -> String { ".venv/bin/python".to_string() }
fn default_script_extensions() -> Vec<String> { vec!["py".to_string()] }
fn default_addr() -> String { "127.0.0.1:8080".to_string() }
fn default_request_timeout_ms() -> u64 { 15000 }
fn default_run_timeout_ms() -> u64 { 30000 }
fn default_max_upload_bytes() -> usize { 5_000_000 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Interpreter used for every run, relative to the project root unless
    /// absolute. Never taken from a client request.
    #[serde(default = "default_venv_python")]
    pub venv_python: String,
    /// Extensions (without the dot) a script must carry to be runnable.
    #[serde(default = "default_script_extensions")]
    pub script_extensions: Vec<String>,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Finished runs older than this are dropped from memory. Unset keeps
    /// every run for the life of the process.
    #[serde(default)]
    pub run_retention_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            request_timeout_ms: default_request_timeout_ms(),
            run_timeout_ms: default_run_timeout_ms(),
            max_upload_bytes: default_max_upload_bytes(),
            run_retention_secs: None,
        }
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            venv_python: default_venv_python(),
            script_extensions: default_script_extensions(),
            server: ServerConfig::default(),
        }
    }
}

impl ProjectConfig {
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE_NAME)
    }

    /// Load the project config, falling back to defaults when the file is
    /// absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path_in(root);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)?;
        let config: ProjectConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(Self::path_in(root), yaml)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.venv_python.trim().is_empty() {
            return Err(PirunError::Config("venv_python must not be empty".into()));
        }
        if self.script_extensions.is_empty() {
            return Err(PirunError::Config(
                "script_extensions must list at least one extension".into(),
            ));
        }
        if self.server.run_timeout_ms == 0 {
            return Err(PirunError::Config("server.run_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.server.run_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }

    pub fn run_retention(&self) -> Option<Duration> {
        self.server.run_retention_secs.map(Duration::from_secs)
    }
}
