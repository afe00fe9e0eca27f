use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid override path '{path}': {reason}")]
    InvalidOverridePath { path: String, reason: String },

    #[error("directory conflict at {}: {reason}", path.display())]
    DirectoryConflict { path: PathBuf, reason: String },

    #[error("executable {} not found", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("external command failed: {}", exit_description(*code))]
    NonZeroExit { code: Option<i32> },

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("post-processing failed: {0}")]
    PostProcess(String),

    #[error("sweep interrupted after {finished} finished jobs")]
    Interrupted { finished: usize },

    #[error("external command killed by sweep abort")]
    Killed,

    #[error("collaborator error: {0:#}")]
    Collaborator(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SweepError>;

fn exit_description(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl SweepError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) => FailureKind::Config,
            Self::InvalidOverridePath { .. } => FailureKind::InvalidOverridePath,
            Self::DirectoryConflict { .. } => FailureKind::DirectoryConflict,
            Self::ExecutableNotFound(_) => FailureKind::ExecutableNotFound,
            Self::NonZeroExit { .. } => FailureKind::NonZeroExit,
            Self::Io { .. } => FailureKind::Io,
            Self::PostProcess(_) => FailureKind::PostProcess,
            Self::Interrupted { .. } | Self::Killed => FailureKind::Interrupted,
            Self::Collaborator(_) => FailureKind::Config,
        }
    }
}

/// Classification recorded in a failed job's summary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "config_error")]
    Config,
    #[serde(rename = "invalid_override_path")]
    InvalidOverridePath,
    #[serde(rename = "directory_conflict")]
    DirectoryConflict,
    #[serde(rename = "executable_not_found")]
    ExecutableNotFound,
    #[serde(rename = "non_zero_exit")]
    NonZeroExit,
    #[serde(rename = "io_error")]
    Io,
    #[serde(rename = "post_process_error")]
    PostProcess,
    #[serde(rename = "interrupted")]
    Interrupted,
    #[serde(rename = "internal_error")]
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config_error",
            Self::InvalidOverridePath => "invalid_override_path",
            Self::DirectoryConflict => "directory_conflict",
            Self::ExecutableNotFound => "executable_not_found",
            Self::NonZeroExit => "non_zero_exit",
            Self::Io => "io_error",
            Self::PostProcess => "post_process_error",
            Self::Interrupted => "interrupted",
            Self::Internal => "internal_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "config_error" => Self::Config,
            "invalid_override_path" => Self::InvalidOverridePath,
            "directory_conflict" => Self::DirectoryConflict,
            "executable_not_found" => Self::ExecutableNotFound,
            "non_zero_exit" => Self::NonZeroExit,
            "io_error" => Self::Io,
            "post_process_error" => Self::PostProcess,
            "interrupted" => Self::Interrupted,
            "internal_error" => Self::Internal,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
