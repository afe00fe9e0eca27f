//! Collaborator seams: the setup callback that produces a job's base
//! configuration and the post-processor that renders plots afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::descriptor::JobDescriptor;
use crate::error::{Result, SweepError};
use crate::fsutil::{is_executable, resolve_against};
use crate::inject::ConfigObject;
use crate::isolate::JobConsole;
use crate::process::{supervise, ChildOutcome, DEFAULT_POLL_INTERVAL};

pub trait Setup: Send + Sync {
    fn setup(&self, job: &JobDescriptor, console: &JobConsole) -> anyhow::Result<ConfigObject>;
}

struct FnSetup<F>(F);

impl<F> Setup for FnSetup<F>
where
    F: Fn(&JobDescriptor, &JobConsole) -> anyhow::Result<ConfigObject> + Send + Sync,
{
    fn setup(&self, job: &JobDescriptor, console: &JobConsole) -> anyhow::Result<ConfigObject> {
        (self.0)(job, console)
    }
}

pub fn setup_fn<F>(f: F) -> Arc<dyn Setup>
where
    F: Fn(&JobDescriptor, &JobConsole) -> anyhow::Result<ConfigObject> + Send + Sync + 'static,
{
    Arc::new(FnSetup(f))
}

/// Adapter for callbacks that build a configuration without seeing the job.
pub fn setup_fn_no_context<F>(f: F) -> Arc<dyn Setup>
where
    F: Fn() -> anyhow::Result<ConfigObject> + Send + Sync + 'static,
{
    setup_fn(move |job, _console| {
        tracing::warn!(
            job = %job.name,
            "setup callback takes no job context; job params are not visible to it"
        );
        f()
    })
}

/// Loads a base configuration from a JSON or YAML file.
#[derive(Debug, Clone)]
pub struct FileSetup {
    path: PathBuf,
}

impl FileSetup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn handles(source: &str) -> bool {
        let lower = source.to_ascii_lowercase();
        lower.ends_with(".json") || lower.ends_with(".yaml") || lower.ends_with(".yml")
    }

    pub fn load(&self) -> anyhow::Result<Value> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading setup file {}", self.path.display()))?;
        let is_json = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let value: Value = if is_json {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
        Ok(value)
    }
}

impl Setup for FileSetup {
    fn setup(&self, job: &JobDescriptor, _console: &JobConsole) -> anyhow::Result<ConfigObject> {
        let full = ConfigObject::new(self.load()?);
        let entry = job.setup.as_ref().and_then(|s| s.entry.as_deref());
        match entry {
            None => Ok(full),
            Some(entry) => full
                .get(entry)
                .cloned()
                .map(ConfigObject::new)
                .ok_or_else(|| anyhow!("entry '{}' not found in {}", entry, self.path.display())),
        }
    }
}

/// Resolves a descriptor's `setup` reference to a callback.
#[derive(Clone)]
pub struct SetupRegistry {
    root: PathBuf,
    entries: BTreeMap<String, Arc<dyn Setup>>,
}

impl SetupRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn register(mut self, source: impl Into<String>, setup: Arc<dyn Setup>) -> Self {
        self.entries.insert(source.into(), setup);
        self
    }

    pub fn base_config(&self, job: &JobDescriptor, console: &JobConsole) -> Result<ConfigObject> {
        let Some(setup_ref) = &job.setup else {
            return Ok(ConfigObject::empty());
        };
        let config = if let Some(setup) = self.entries.get(&setup_ref.source) {
            setup.setup(job, console)?
        } else if FileSetup::handles(&setup_ref.source) {
            let path = resolve_against(&self.root, Path::new(&setup_ref.source));
            FileSetup::new(path).setup(job, console)?
        } else {
            return Err(SweepError::Config(format!(
                "unknown setup source '{}'",
                setup_ref.source
            )));
        };
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlotReport {
    pub plot_dir: PathBuf,
    pub detail: Option<String>,
}

pub struct PostProcessContext<'a> {
    pub job: &'a JobDescriptor,
    pub work_dir: &'a Path,
    pub plot_dir: &'a Path,
    pub config: &'a ConfigObject,
    pub config_path: &'a Path,
    pub root: &'a Path,
    pub console: &'a JobConsole,
    pub abort: &'a CancellationToken,
}

pub trait PostProcess: Send + Sync {
    /// `Ok(None)` means no standard plots were requested.
    fn postprocess(&self, ctx: &PostProcessContext<'_>) -> anyhow::Result<Option<PlotReport>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoFramePlots;

impl PostProcess for NoFramePlots {
    fn postprocess(&self, _ctx: &PostProcessContext<'_>) -> anyhow::Result<Option<PlotReport>> {
        Ok(None)
    }
}

/// Runs an executable as `<program> <work_dir> <plot_dir>` from the sweep root.
#[derive(Debug, Clone)]
pub struct CommandPostProcess {
    program: PathBuf,
    poll: Duration,
}

impl CommandPostProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            poll: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PostProcess for CommandPostProcess {
    fn postprocess(&self, ctx: &PostProcessContext<'_>) -> anyhow::Result<Option<PlotReport>> {
        if !is_executable(&self.program) {
            bail!("post-processor {} not found", self.program.display());
        }
        let mut cmd = Command::new(&self.program);
        cmd.arg(ctx.work_dir)
            .arg(ctx.plot_dir)
            .current_dir(ctx.root)
            .env("SWEEP_JOB_NAME", &ctx.job.name)
            .env("SWEEP_CONFIG", ctx.config_path)
            .stdout(ctx.console.stdio()?)
            .stderr(ctx.console.stdio()?);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.program.display()))?;
        match supervise(&mut child, ctx.abort, self.poll)? {
            ChildOutcome::Exited(status) if status.success() => Ok(Some(PlotReport {
                plot_dir: ctx.plot_dir.to_path_buf(),
                detail: Some(format!("{} exited 0", self.program.display())),
            })),
            ChildOutcome::Exited(status) => bail!(
                "{} failed with {}",
                self.program.display(),
                status
                    .code()
                    .map(|c| format!("exit code {}", c))
                    .unwrap_or_else(|| "a signal".to_string())
            ),
            ChildOutcome::Killed => bail!("{} killed by sweep abort", self.program.display()),
        }
    }
}

/// Resolves a descriptor's `plot_source` to a post-processor.
#[derive(Clone)]
pub struct PostProcessRegistry {
    root: PathBuf,
    entries: BTreeMap<String, Arc<dyn PostProcess>>,
}

impl PostProcessRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn register(mut self, name: impl Into<String>, post: Arc<dyn PostProcess>) -> Self {
        self.entries.insert(name.into(), post);
        self
    }

    pub fn resolve(&self, name: Option<&str>) -> Arc<dyn PostProcess> {
        match name {
            None => Arc::new(NoFramePlots),
            Some(name) => match self.entries.get(name) {
                Some(post) => Arc::clone(post),
                None => Arc::new(CommandPostProcess::new(resolve_against(
                    &self.root,
                    Path::new(name),
                ))),
            },
        }
    }
}
