//! Runs one job through dir setup, parameter injection, invocation and
//! post-processing, and turns whatever happens into an [`ExecutionResult`].

use std::any::Any;
use std::cell::Cell;
use std::fs::File;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::collab::{PostProcessContext, PostProcessRegistry, SetupRegistry};
use crate::descriptor::{ExecutionResult, Failure, JobDescriptor, JobStatus, Phase};
use crate::error::{FailureKind, Result, SweepError};
use crate::fsutil::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir,
    is_executable,
};
use crate::inject::{ConfigObject, ParameterInjector};
use crate::isolate::{JobScope, OutputIsolator};
use crate::process::{supervise, ChildOutcome, DEFAULT_POLL_INTERVAL};
use crate::summary::{write_companion, SummaryLog};

pub const JOB_INFO_TXT: &str = "job_info.txt";
pub const JOB_INFO_JSON: &str = "job_info.json";
pub const JOB_CONFIG_FILE: &str = "job_config.json";
pub const RUN_OUTPUT_FILE: &str = "run_output.txt";

#[derive(Clone)]
pub struct JobExecutor {
    root: PathBuf,
    isolator: OutputIsolator,
    setups: SetupRegistry,
    post: PostProcessRegistry,
    abort: CancellationToken,
    poll_interval: Duration,
}

#[derive(Default)]
struct JobRun {
    acquired: bool,
    exit_code: Option<i32>,
    config_digest: Option<String>,
    post_process_error: Option<String>,
}

impl JobExecutor {
    /// Relative paths in descriptors and collaborator names resolve against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            isolator: OutputIsolator::new(),
            setups: SetupRegistry::new(&root),
            post: PostProcessRegistry::new(&root),
            abort: CancellationToken::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            root,
        }
    }

    pub fn with_isolator(mut self, isolator: OutputIsolator) -> Self {
        self.isolator = isolator;
        self
    }

    pub fn with_setups(mut self, setups: SetupRegistry) -> Self {
        self.setups = setups;
        self
    }

    pub fn with_post_processors(mut self, post: PostProcessRegistry) -> Self {
        self.post = post;
        self
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Never fails: every error is folded into the returned result, which is
    /// also appended to `log`.
    pub fn execute(&self, job: &JobDescriptor, worker_id: usize, log: &SummaryLog) -> ExecutionResult {
        let job = job.clone().rooted_at(&self.root);
        let started_at = Utc::now();
        tracing::info!(
            worker = worker_id,
            job = %job.name,
            "worker {} started job {} at {}",
            worker_id,
            job.name,
            started_at.format("%Y-%m-%d %H:%M:%S")
        );

        let mut run = JobRun::default();
        let failure = self.run_phases(&job, worker_id, started_at, &mut run).err();
        let result = ExecutionResult {
            job_id: job.name.clone(),
            worker_id,
            started_at,
            finished_at: Utc::now(),
            status: if failure.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Succeeded
            },
            failure,
            work_dir: job.work_dir.clone(),
            exit_code: run.exit_code,
            config_digest: run.config_digest,
            post_process_error: run.post_process_error,
        };

        if run.acquired {
            if let Err(e) = write_companion(&job.work_dir, &result) {
                tracing::warn!(job = %job.name, error = %e, "could not write job summary");
            }
        }
        log.append(&result);

        match &result.failure {
            None => tracing::info!(worker = worker_id, job = %job.name, "completed job {}", job.name),
            Some(f) => tracing::warn!(worker = worker_id, job = %job.name, failure = %f, "job {} failed", job.name),
        }
        result
    }

    fn run_phases(
        &self,
        job: &JobDescriptor,
        worker_id: usize,
        started_at: DateTime<Utc>,
        run: &mut JobRun,
    ) -> std::result::Result<(), Failure> {
        let scope = self.isolator.acquire(job).map_err(|e| {
            tracing::error!(job = %job.name, error = %e, "could not set up work dir");
            Failure::from_error(Phase::DirSetup, &e)
        })?;
        run.acquired = true;

        let phase = Cell::new(Phase::DirSetup);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.phases(job, worker_id, started_at, &scope, &phase, run)
        }));
        // Logged while the job's own output target is still installed.
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                tracing::error!(phase = phase.get().as_str(), error = %err, "job {} failed", job.name);
                Some(Failure::from_error(phase.get(), &err))
            }
            Err(payload) => {
                let message = format!("panic: {}", panic_message(payload.as_ref()));
                tracing::error!(phase = phase.get().as_str(), "job {} {}", job.name, message);
                Some(Failure {
                    phase: phase.get(),
                    kind: FailureKind::Internal,
                    message,
                })
            }
        };
        drop(scope);
        failure.map_or(Ok(()), Err)
    }

    fn phases(
        &self,
        job: &JobDescriptor,
        worker_id: usize,
        started_at: DateTime<Utc>,
        scope: &JobScope,
        phase: &Cell<Phase>,
        run: &mut JobRun,
    ) -> Result<()> {
        self.write_metadata(job, worker_id, started_at)?;

        phase.set(Phase::ParamInjection);
        let base = self.setups.base_config(job, scope.console())?;
        let config = ParameterInjector::apply(base, &job.overrides)?;

        phase.set(Phase::Invocation);
        let config_path = scope.work_dir().join(JOB_CONFIG_FILE);
        atomic_write_json_pretty(&config_path, config.as_value())?;
        run.config_digest = Some(canonical_json_digest(config.as_value()));
        tracing::info!("wrote {}", config_path.display());
        match &job.run_command {
            Some(program) => self.invoke(job, program, &config_path, run)?,
            None => tracing::info!("no run command, skipping invocation"),
        }

        if let Some(plot_dir) = &job.plot_dir {
            phase.set(Phase::PostProcess);
            run.post_process_error = self.post_process(job, plot_dir, &config, &config_path, scope);
        }
        Ok(())
    }

    fn write_metadata(
        &self,
        job: &JobDescriptor,
        worker_id: usize,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut lines = vec![format!("job info written at {}", Utc::now().to_rfc3339())];
        let mut push = |key: &str, value: String| lines.push(format!("{:<20}:  {}", key, value));
        push("name", job.name.clone());
        push("worker", worker_id.to_string());
        push("started_at", started_at.to_rfc3339());
        push("work_dir", job.work_dir.display().to_string());
        push("plot_dir", display_opt(job.plot_dir.as_deref()));
        push(
            "overwrite",
            serde_json::to_value(job.overwrite)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        );
        push(
            "setup",
            job.setup
                .as_ref()
                .map(|s| match &s.entry {
                    Some(entry) => format!("{}#{}", s.source, entry),
                    None => s.source.clone(),
                })
                .unwrap_or_else(|| "none".to_string()),
        );
        push("plot_source", job.plot_source.clone().unwrap_or_else(|| "none".to_string()));
        push("run_command", display_opt(job.run_command.as_deref()));
        if !job.run_prefix.is_empty() {
            push("run_prefix", job.run_prefix.join(" "));
        }
        push("redirect_output", job.redirect_output.to_string());
        for (path, value) in &job.overrides {
            push(&format!("override {}", path), value.to_string());
        }
        for (key, value) in &job.params {
            push(&format!("param {}", key), value.to_string());
        }
        lines.push(String::new());
        let txt_path = job.work_dir.join(JOB_INFO_TXT);
        atomic_write_bytes(&txt_path, lines.join("\n").as_bytes())?;

        let info = json!({
            "schema_version": "job_info_v1",
            "job": job,
            "worker_id": worker_id,
            "started_at": started_at.to_rfc3339(),
            "sweep_root": self.root,
        });
        atomic_write_json_pretty(&job.work_dir.join(JOB_INFO_JSON), &info)?;
        tracing::info!("wrote {}", txt_path.display());
        Ok(())
    }

    fn invoke(
        &self,
        job: &JobDescriptor,
        program: &Path,
        config_path: &Path,
        run: &mut JobRun,
    ) -> Result<()> {
        let runnable = if job.run_prefix.is_empty() {
            is_executable(program)
        } else {
            program.is_file()
        };
        if !runnable {
            return Err(SweepError::ExecutableNotFound(program.to_path_buf()));
        }
        if self.abort.is_cancelled() {
            return Err(SweepError::Killed);
        }

        let out_path = job.work_dir.join(RUN_OUTPUT_FILE);
        let stdout = File::create(&out_path).map_err(|e| SweepError::io(&out_path, e))?;
        let stderr = stdout.try_clone().map_err(|e| SweepError::io(&out_path, e))?;

        let mut cmd = match job.run_prefix.split_first() {
            Some((launcher, args)) => {
                let mut cmd = Command::new(launcher);
                cmd.args(args).arg(program);
                cmd
            }
            None => Command::new(program),
        };
        cmd.current_dir(&job.work_dir)
            .env("SWEEP_JOB_NAME", &job.name)
            .env("SWEEP_WORK_DIR", &job.work_dir)
            .env("SWEEP_CONFIG", config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        tracing::info!(
            "running {} in {}, output to {}",
            program.display(),
            job.work_dir.display(),
            out_path.display()
        );
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SweepError::ExecutableNotFound(
                job.run_prefix
                    .first()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| program.to_path_buf()),
            ),
            _ => SweepError::io(program, e),
        })?;
        match supervise(&mut child, &self.abort, self.poll_interval)
            .map_err(|e| SweepError::io(program, e))?
        {
            ChildOutcome::Exited(status) => {
                run.exit_code = status.code();
                if status.success() {
                    tracing::info!("{} finished", program.display());
                    Ok(())
                } else {
                    Err(SweepError::NonZeroExit {
                        code: status.code(),
                    })
                }
            }
            ChildOutcome::Killed => Err(SweepError::Killed),
        }
    }

    /// Returns the post-processing error, if any. Never affects job status.
    fn post_process(
        &self,
        job: &JobDescriptor,
        plot_dir: &Path,
        config: &ConfigObject,
        config_path: &Path,
        scope: &JobScope,
    ) -> Option<String> {
        if let Err(e) = ensure_dir(plot_dir) {
            tracing::warn!(error = %e, "could not create plot dir");
            return Some(e.to_string());
        }
        let post = self.post.resolve(job.plot_source.as_deref());
        let ctx = PostProcessContext {
            job,
            work_dir: scope.work_dir(),
            plot_dir,
            config,
            config_path,
            root: &self.root,
            console: scope.console(),
            abort: &self.abort,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| post.postprocess(&ctx))) {
            Ok(Ok(Some(report))) => {
                match &report.detail {
                    Some(detail) => tracing::info!("plots in {} ({})", report.plot_dir.display(), detail),
                    None => tracing::info!("plots in {}", report.plot_dir.display()),
                }
                None
            }
            Ok(Ok(None)) => {
                tracing::info!("not making frame plots");
                None
            }
            Ok(Err(e)) => {
                let message = SweepError::PostProcess(format!("{:#}", e)).to_string();
                tracing::warn!(error = %message, "post-processing failed");
                Some(message)
            }
            Err(payload) => {
                let message = format!(
                    "post-processing panicked: {}",
                    panic_message(payload.as_ref())
                );
                tracing::warn!("{}", message);
                Some(message)
            }
        }
    }
}

fn display_opt(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
