//! Crate-wide error type.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PirunError {
    #[error("Path escapes project root: {0}")]
    PathEscape(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("File is not valid UTF-8 text: {0}")]
    Decode(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("KILLED: Timeout after {}s", format_secs(.0))]
    TimeoutKilled(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PirunError>;

/// Seconds with at least one decimal place: `30.0`, `0.2`, `1.25`.
fn format_secs(d: &Duration) -> String {
    let secs = d.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{secs:.1}")
    } else {
        secs.to_string()
    }
}
