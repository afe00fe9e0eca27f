use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FailureKind, SweepError};

/// What to do when a job's working directory already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    #[default]
    Allow,
    Reject,
}

/// Names the collaborator that produces a job's base configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupRef {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl SetupRef {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            entry: None,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }
}

/// One unit of work in a sweep. Immutable once handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub work_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot_dir: Option<PathBuf>,
    #[serde(default)]
    pub overwrite: OverwritePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot_source: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_command: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_prefix: Vec<String>,
    #[serde(default = "default_redirect")]
    pub redirect_output: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

fn default_redirect() -> bool {
    true
}

impl JobDescriptor {
    pub fn new(name: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            work_dir: work_dir.into(),
            plot_dir: None,
            overwrite: OverwritePolicy::Allow,
            setup: None,
            plot_source: None,
            overrides: BTreeMap::new(),
            run_command: None,
            run_prefix: Vec::new(),
            redirect_output: true,
            params: BTreeMap::new(),
        }
    }

    pub fn with_plot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plot_dir = Some(dir.into());
        self
    }

    pub fn with_overwrite(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = policy;
        self
    }

    pub fn with_setup(mut self, setup: SetupRef) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn with_plot_source(mut self, source: impl Into<String>) -> Self {
        self.plot_source = Some(source.into());
        self
    }

    pub fn with_override(mut self, path: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(path.into(), value);
        self
    }

    pub fn with_run_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.run_command = Some(command.into());
        self
    }

    pub fn with_run_prefix(mut self, prefix: Vec<String>) -> Self {
        self.run_prefix = prefix;
        self
    }

    pub fn with_redirect_output(mut self, redirect: bool) -> Self {
        self.redirect_output = redirect;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Rebases relative work, plot and command paths onto `root`.
    pub fn rooted_at(mut self, root: &Path) -> Self {
        self.work_dir = crate::fsutil::resolve_against(root, &self.work_dir);
        self.plot_dir = self
            .plot_dir
            .map(|p| crate::fsutil::resolve_against(root, &p));
        self.run_command = self
            .run_command
            .map(|p| crate::fsutil::resolve_against(root, &p));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executor states a job can fail in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DirSetup,
    ParamInjection,
    Invocation,
    PostProcess,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirSetup => "dir_setup",
            Self::ParamInjection => "param_injection",
            Self::Invocation => "invocation",
            Self::PostProcess => "post_process",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dir_setup" => Some(Self::DirSetup),
            "param_injection" => Some(Self::ParamInjection),
            "invocation" => Some(Self::Invocation),
            "post_process" => Some(Self::PostProcess),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub phase: Phase,
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn from_error(phase: Phase, err: &SweepError) -> Self {
        Self {
            phase,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.phase.as_str(), self.kind, self.message)
    }
}

/// Outcome of one job, produced by the executor and consumed by the summary log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: String,
    pub worker_id: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub work_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_process_error: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}
