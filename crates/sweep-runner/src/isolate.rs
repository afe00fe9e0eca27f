//! Per-job working directory and output isolation.
//!
//! [`OutputIsolator::acquire`] claims a job's working directory under its
//! overwrite policy and, when the job asks for it, routes everything the job
//! logs into `job_output.txt` inside that directory. Routing uses a
//! thread-local tracing dispatcher, so concurrent workers never see each
//! other's output target. Dropping the returned [`JobScope`] puts the
//! previous target back.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tracing::dispatcher::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::descriptor::{JobDescriptor, OverwritePolicy};
use crate::error::{Result, SweepError};

pub const JOB_OUTPUT_FILE: &str = "job_output.txt";

/// Explicit output handle for one job, shared with its collaborators.
#[derive(Debug, Clone)]
pub struct JobConsole {
    target: ConsoleTarget,
}

#[derive(Debug, Clone)]
enum ConsoleTarget {
    File { path: PathBuf, file: Arc<File> },
    Inherit,
}

impl JobConsole {
    pub fn inherit() -> Self {
        Self {
            target: ConsoleTarget::Inherit,
        }
    }

    fn file(path: PathBuf, file: File) -> Self {
        Self {
            target: ConsoleTarget::File {
                path,
                file: Arc::new(file),
            },
        }
    }

    /// File backing this console, if output is redirected.
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            ConsoleTarget::File { path, .. } => Some(path),
            ConsoleTarget::Inherit => None,
        }
    }

    pub fn line(&self, message: impl std::fmt::Display) {
        let text = format!("{}\n", message);
        let mut writer = self.clone();
        if let Err(e) = writer.write_all(text.as_bytes()) {
            tracing::warn!(error = %e, "job console write failed");
        }
    }

    /// Stdio for a child process so its output lands where this console writes.
    pub fn stdio(&self) -> io::Result<Stdio> {
        match &self.target {
            ConsoleTarget::File { file, .. } => Ok(Stdio::from(file.try_clone()?)),
            ConsoleTarget::Inherit => Ok(Stdio::inherit()),
        }
    }
}

impl Write for JobConsole {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.target {
            ConsoleTarget::File { file, .. } => (&**file).write(buf),
            ConsoleTarget::Inherit => io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &self.target {
            ConsoleTarget::File { file, .. } => (&**file).flush(),
            ConsoleTarget::Inherit => io::stdout().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for JobConsole {
    type Writer = JobConsole;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Held for the lifetime of one job. Restores the previous output target on drop.
pub struct JobScope {
    work_dir: PathBuf,
    created: bool,
    console: JobConsole,
    _dispatch: Option<DefaultGuard>,
}

impl JobScope {
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// True when `acquire` created the directory rather than reusing it.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn console(&self) -> &JobConsole {
        &self.console
    }

    pub fn is_redirected(&self) -> bool {
        self._dispatch.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct OutputIsolator {
    log_filter: String,
}

impl Default for OutputIsolator {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
        }
    }
}

impl OutputIsolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter directive for the per-job log file, e.g. `"debug"`.
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn acquire(&self, job: &JobDescriptor) -> Result<JobScope> {
        let work_dir = job.work_dir.clone();
        let created = claim_work_dir(&work_dir, job.overwrite)?;

        if !job.redirect_output {
            return Ok(JobScope {
                work_dir,
                created,
                console: JobConsole::inherit(),
                _dispatch: None,
            });
        }

        let path = work_dir.join(JOB_OUTPUT_FILE);
        let file = File::create(&path).map_err(|e| SweepError::io(&path, e))?;
        tracing::info!(
            job = %job.name,
            "output from this job will go to {}",
            path.display()
        );
        let console = JobConsole::file(path, file);
        let subscriber = tracing_subscriber::fmt()
            .with_writer(console.clone())
            .with_ansi(false)
            .with_target(false)
            .with_env_filter(EnvFilter::new(&self.log_filter))
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Ok(JobScope {
            work_dir,
            created,
            console,
            _dispatch: Some(guard),
        })
    }
}

/// Returns whether the directory was created. Performs no mutation on conflict.
fn claim_work_dir(dir: &Path, policy: OverwritePolicy) -> Result<bool> {
    match fs::metadata(dir) {
        Ok(meta) if !meta.is_dir() => Err(SweepError::DirectoryConflict {
            path: dir.to_path_buf(),
            reason: "path exists and is not a directory".to_string(),
        }),
        Ok(_) => match policy {
            OverwritePolicy::Reject => Err(SweepError::DirectoryConflict {
                path: dir.to_path_buf(),
                reason: "directory already exists and overwrite is rejected".to_string(),
            }),
            OverwritePolicy::Allow => {
                tracing::info!("work dir already exists, reusing {}", dir.display());
                Ok(false)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|e| SweepError::DirectoryConflict {
                path: dir.to_path_buf(),
                reason: format!("could not create directory: {}", e),
            })?;
            tracing::info!("created {}", dir.display());
            Ok(true)
        }
        Err(e) => Err(SweepError::io(dir, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sweep_isolate_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn creates_missing_work_dir() {
        let root = temp_root("create");
        let job = JobDescriptor::new("a", root.join("runs").join("_output_a"));
        let scope = OutputIsolator::new().acquire(&job).expect("acquire");
        assert!(scope.created());
        assert!(job.work_dir.is_dir());
        assert!(job.work_dir.join(JOB_OUTPUT_FILE).is_file());
        drop(scope);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reject_policy_fails_without_touching_existing_dir() {
        let root = temp_root("reject");
        let dir = root.join("_output_a");
        fs::create_dir_all(&dir).expect("dir");
        fs::write(dir.join("fort.q0000"), "old").expect("seed");
        let before = listing(&dir);

        let job = JobDescriptor::new("a", &dir).with_overwrite(OverwritePolicy::Reject);
        let err = OutputIsolator::new()
            .acquire(&job)
            .err()
            .expect("existing dir must be rejected");
        assert!(matches!(err, SweepError::DirectoryConflict { .. }), "{:?}", err);
        assert_eq!(listing(&dir), before);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn allow_policy_keeps_unrelated_files() {
        let root = temp_root("allow");
        let dir = root.join("_output_a");
        fs::create_dir_all(&dir).expect("dir");
        fs::write(dir.join("notes.txt"), "keep me").expect("seed");

        let job = JobDescriptor::new("a", &dir);
        let scope = OutputIsolator::new().acquire(&job).expect("acquire");
        assert!(!scope.created());
        drop(scope);
        assert_eq!(
            fs::read_to_string(dir.join("notes.txt")).expect("read"),
            "keep me"
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn work_dir_that_is_a_file_conflicts() {
        let root = temp_root("file");
        let path = root.join("_output_a");
        fs::write(&path, "not a dir").expect("seed");
        let job = JobDescriptor::new("a", &path);
        let err = OutputIsolator::new().acquire(&job).err().expect("conflict");
        assert!(err.to_string().contains("not a directory"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn redirect_is_scoped_to_the_job() {
        let root = temp_root("redirect");
        let job = JobDescriptor::new("a", root.join("_output_a"));
        let scope = OutputIsolator::new().acquire(&job).expect("acquire");
        assert!(scope.is_redirected());
        tracing::info!("inside job scope");
        scope.console().line("console line");
        drop(scope);
        tracing::info!("after job scope");

        let text = fs::read_to_string(job.work_dir.join(JOB_OUTPUT_FILE)).expect("read");
        assert!(text.contains("inside job scope"), "{}", text);
        assert!(text.contains("console line"), "{}", text);
        assert!(!text.contains("after job scope"), "{}", text);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn log_filter_applies_to_the_job_file() {
        let root = temp_root("filter");
        let job = JobDescriptor::new("a", root.join("_output_a"));
        let scope = OutputIsolator::new()
            .with_log_filter("warn")
            .acquire(&job)
            .expect("acquire");
        tracing::info!("chatty progress line");
        tracing::warn!("cfl number exceeded");
        drop(scope);

        let text = fs::read_to_string(job.work_dir.join(JOB_OUTPUT_FILE)).expect("read");
        assert!(text.contains("cfl number exceeded"), "{}", text);
        assert!(!text.contains("chatty progress line"), "{}", text);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn concurrent_scopes_do_not_cross() {
        let root = temp_root("threads");
        let jobs: Vec<JobDescriptor> = (0..4)
            .map(|i| JobDescriptor::new(format!("job{}", i), root.join(format!("_output_{}", i))))
            .collect();
        std::thread::scope(|s| {
            for job in &jobs {
                s.spawn(move || {
                    let scope = OutputIsolator::new().acquire(job).expect("acquire");
                    for n in 0..20 {
                        tracing::info!("message {} from {}", n, job.name);
                    }
                    drop(scope);
                });
            }
        });
        for job in &jobs {
            let text = fs::read_to_string(job.work_dir.join(JOB_OUTPUT_FILE)).expect("read");
            assert_eq!(text.matches(&format!("from {}", job.name)).count(), 20);
            for other in jobs.iter().filter(|o| o.name != job.name) {
                assert!(!text.contains(&format!("from {}\n", other.name)));
            }
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn no_redirect_uses_inherited_console() {
        let root = temp_root("inherit");
        let job = JobDescriptor::new("a", root.join("_output_a")).with_redirect_output(false);
        let scope = OutputIsolator::new().acquire(&job).expect("acquire");
        assert!(!scope.is_redirected());
        assert!(scope.console().path().is_none());
        assert!(!job.work_dir.join(JOB_OUTPUT_FILE).exists());
        drop(scope);
        let _ = fs::remove_dir_all(root);
    }
}
