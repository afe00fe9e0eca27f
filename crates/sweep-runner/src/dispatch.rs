use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::descriptor::{ExecutionResult, JobDescriptor};
use crate::error::{Result, SweepError};
use crate::executor::JobExecutor;
use crate::fsutil::resolve_against;
use crate::summary::{SummaryLog, DEFAULT_SUMMARY_FILE};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const GRACE_POLL: Duration = Duration::from_millis(100);

/// How jobs are handed to workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Job `i` runs on worker `i mod k`, in list order.
    #[serde(rename = "static")]
    StaticPartition,
    /// Idle workers take the next unclaimed job.
    #[default]
    #[serde(rename = "pool")]
    Pool,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaticPartition => "static",
            Self::Pool => "pool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub workers: usize,
    pub strategy: Strategy,
    pub grace_period: Duration,
    /// Relative paths resolve against the executor root.
    pub summary_path: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            strategy: Strategy::Pool,
            grace_period: DEFAULT_GRACE_PERIOD,
            summary_path: PathBuf::from(DEFAULT_SUMMARY_FILE),
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = path.into();
        self
    }
}

/// Splits `items` round-robin across `workers` lists, keeping relative order.
pub fn partition<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let mut lists: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();
    if workers == 0 {
        return lists;
    }
    for (i, item) in items.into_iter().enumerate() {
        lists[i % workers].push(item);
    }
    lists
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// In completion order.
    pub results: Vec<ExecutionResult>,
}

impl SweepReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn result(&self, job_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.job_id == job_id)
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    executor: JobExecutor,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, executor: JobExecutor) -> Self {
        Self { config, executor }
    }

    /// Runs every job and returns once all workers have finished.
    pub fn run(&self, jobs: Vec<JobDescriptor>) -> Result<SweepReport> {
        let workers = self.config.workers;
        if workers == 0 {
            return Err(SweepError::Config("workers must be at least 1".to_string()));
        }
        self.validate(&jobs)?;

        let summary_path = resolve_against(self.executor.root(), &self.config.summary_path);
        tracing::info!(
            jobs = jobs.len(),
            workers,
            strategy = self.config.strategy.as_str(),
            "{} jobs will be run on {} workers",
            jobs.len(),
            workers
        );
        tracing::info!("summary will be appended to {}", summary_path.display());
        if self.wait_grace_period() {
            tracing::warn!("sweep aborted before any job started");
            return Err(SweepError::Interrupted { finished: 0 });
        }

        // Nothing is created on disk until the grace period has passed.
        let log = SummaryLog::open(&summary_path)?;
        let results = self.run_workers(jobs, &log)?;
        let abort = self.executor.abort_token();
        if abort.is_cancelled() {
            tracing::warn!(finished = results.len(), "sweep interrupted");
            return Err(SweepError::Interrupted {
                finished: results.len(),
            });
        }

        let report = SweepReport { results };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "sweep finished"
        );
        Ok(report)
    }

    fn validate(&self, jobs: &[JobDescriptor]) -> Result<()> {
        let mut names = BTreeSet::new();
        let mut dirs = BTreeSet::new();
        for job in jobs {
            if job.name.trim().is_empty() {
                return Err(SweepError::Config("job name must not be empty".to_string()));
            }
            // Names delimit records in the shared summary, so they must stay on one line.
            if job.name.chars().any(char::is_control) {
                return Err(SweepError::Config(format!(
                    "job name {:?} contains control characters",
                    job.name
                )));
            }
            if !names.insert(job.name.as_str()) {
                return Err(SweepError::Config(format!("duplicate job name '{}'", job.name)));
            }
            let dir = resolve_against(self.executor.root(), &job.work_dir);
            if !dirs.insert(dir.clone()) {
                return Err(SweepError::Config(format!(
                    "job '{}' shares work dir {} with another job",
                    job.name,
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Returns true if the sweep was aborted while waiting.
    fn wait_grace_period(&self) -> bool {
        let grace = self.config.grace_period;
        let abort = self.executor.abort_token();
        if grace.is_zero() {
            return abort.is_cancelled();
        }
        tracing::info!("you have {} seconds to abort", grace.as_secs_f64());
        let deadline = Instant::now() + grace;
        loop {
            if abort.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(GRACE_POLL.min(deadline - now));
        }
    }

    fn run_workers(&self, jobs: Vec<JobDescriptor>, log: &SummaryLog) -> Result<Vec<ExecutionResult>> {
        let workers = self.config.workers;
        let (tx, rx) = mpsc::channel::<ExecutionResult>();
        let mut results = Vec::with_capacity(jobs.len());

        let (mut assigned, queue) = match self.config.strategy {
            Strategy::StaticPartition => (partition(jobs, workers), VecDeque::new()),
            Strategy::Pool => (Vec::new(), VecDeque::from(jobs)),
        };
        let pool: Mutex<VecDeque<JobDescriptor>> = Mutex::new(queue);

        let spawned = thread::scope(|s| -> Result<()> {
            let mut spawn_error = None;
            for worker_id in 0..workers {
                let tx = tx.clone();
                let own = (worker_id < assigned.len())
                    .then(|| std::mem::take(&mut assigned[worker_id]));
                let pool = &pool;
                let spawn = thread::Builder::new()
                    .name(format!("sweep-worker-{}", worker_id))
                    .spawn_scoped(s, move || {
                        let span = tracing::info_span!("worker", id = worker_id);
                        let _enter = span.enter();
                        match own {
                            Some(list) => self.drain_list(worker_id, list, log, &tx),
                            None => self.drain_pool(worker_id, pool, log, &tx),
                        }
                    });
                if let Err(e) = spawn {
                    // Stop the workers that did start; they finish their current job.
                    self.executor.abort_token().cancel();
                    spawn_error = Some(SweepError::io("sweep-worker", e));
                    break;
                }
            }
            drop(tx);
            for result in rx.iter() {
                results.push(result);
            }
            spawn_error.map_or(Ok(()), Err)
        });
        spawned?;
        Ok(results)
    }

    fn drain_list(
        &self,
        worker_id: usize,
        list: Vec<JobDescriptor>,
        log: &SummaryLog,
        tx: &mpsc::Sender<ExecutionResult>,
    ) {
        for job in list {
            if self.executor.abort_token().is_cancelled() {
                break;
            }
            let result = self.executor.execute(&job, worker_id, log);
            if tx.send(result).is_err() {
                break;
            }
        }
    }

    fn drain_pool(
        &self,
        worker_id: usize,
        pool: &Mutex<VecDeque<JobDescriptor>>,
        log: &SummaryLog,
        tx: &mpsc::Sender<ExecutionResult>,
    ) {
        loop {
            if self.executor.abort_token().is_cancelled() {
                break;
            }
            let next = match pool.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(poisoned) => poisoned.into_inner().pop_front(),
            };
            let Some(job) = next else { break };
            let result = self.executor.execute(&job, worker_id, log);
            if tx.send(result).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::fs;
    use tokio_util::sync::CancellationToken;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sweep_dispatch_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    fn jobs(n: usize) -> Vec<JobDescriptor> {
        (0..n)
            .map(|i| JobDescriptor::new(format!("job{:02}", i), format!("_output_job{:02}", i)))
            .collect()
    }

    fn quick(workers: usize, strategy: Strategy) -> DispatchConfig {
        DispatchConfig::new()
            .with_workers(workers)
            .with_strategy(strategy)
            .with_grace_period(Duration::ZERO)
    }

    #[test]
    fn partition_is_round_robin_and_order_preserving() {
        for k in 1..5 {
            let lists = partition((0..11).collect::<Vec<usize>>(), k);
            assert_eq!(lists.len(), k);
            for (w, list) in lists.iter().enumerate() {
                assert!(list.iter().all(|i| i % k == w));
                assert!(list.windows(2).all(|p| p[0] < p[1]));
            }
            assert_eq!(lists.iter().map(Vec::len).sum::<usize>(), 11);
        }
    }

    #[test]
    fn static_strategy_assigns_by_index() {
        let root = temp_root("static");
        let dispatcher = Dispatcher::new(quick(3, Strategy::StaticPartition), JobExecutor::new(&root));
        let report = dispatcher.run(jobs(7)).expect("run");
        assert_eq!(report.results.len(), 7);
        assert!(report.is_success());
        for i in 0..7 {
            let r = report.result(&format!("job{:02}", i)).expect("result");
            assert_eq!(r.worker_id, i % 3);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pool_runs_every_job_once() {
        let root = temp_root("pool");
        let dispatcher = Dispatcher::new(quick(4, Strategy::Pool), JobExecutor::new(&root));
        let report = dispatcher.run(jobs(13)).expect("run");
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        for r in &report.results {
            *seen.entry(r.job_id.clone()).or_default() += 1;
            assert!(r.worker_id < 4);
        }
        assert_eq!(seen.len(), 13);
        assert!(seen.values().all(|&n| n == 1));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        let root = temp_root("zero");
        let dispatcher = Dispatcher::new(quick(0, Strategy::Pool), JobExecutor::new(&root));
        let err = dispatcher.run(jobs(2)).expect_err("no workers");
        assert!(matches!(err, SweepError::Config(_)));
        assert!(!root.join(DEFAULT_SUMMARY_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn duplicate_work_dirs_are_rejected_before_any_mutation() {
        let root = temp_root("dupdir");
        let dispatcher = Dispatcher::new(quick(2, Strategy::Pool), JobExecutor::new(&root));
        let list = vec![
            JobDescriptor::new("a", "_output_x"),
            JobDescriptor::new("b", "runs/../_output_x"),
        ];
        let err = dispatcher.run(list).expect_err("shared dir");
        assert!(err.to_string().contains("shares work dir"));
        assert!(!root.join("_output_x").exists());

        let list = vec![
            JobDescriptor::new("a", "_output_a"),
            JobDescriptor::new("a", "_output_b"),
        ];
        let err = dispatcher.run(list).expect_err("duplicate name");
        assert!(err.to_string().contains("duplicate job name"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn control_characters_in_names_are_rejected_up_front() {
        let root = temp_root("ctrl");
        let dispatcher = Dispatcher::new(quick(1, Strategy::Pool), JobExecutor::new(&root));
        for name in ["bad\nname", "tab\there", "bell\u{7}"] {
            let list = vec![
                JobDescriptor::new("fine", "_output_fine"),
                JobDescriptor::new(name, "_output_bad"),
            ];
            let err = dispatcher.run(list).expect_err("control character");
            assert!(matches!(err, SweepError::Config(_)), "{:?}", err);
            assert!(err.to_string().contains("control characters"));
        }
        assert!(!root.join("_output_fine").exists());
        assert!(!root.join(DEFAULT_SUMMARY_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn abort_during_grace_period_starts_nothing() {
        let root = temp_root("grace");
        let abort = CancellationToken::new();
        let executor = JobExecutor::new(&root).with_abort(abort.clone());
        let config = quick(2, Strategy::Pool)
            .with_grace_period(Duration::from_secs(5))
            .with_summary_path("logs/nested/summary.txt");
        let dispatcher = Dispatcher::new(config, executor);

        let trigger = abort.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });
        let start = Instant::now();
        let err = dispatcher.run(jobs(3)).expect_err("aborted");
        canceller.join().expect("join");
        assert!(matches!(err, SweepError::Interrupted { finished: 0 }), "{:?}", err);
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(!root.join("_output_job00").exists());
        assert!(!root.join("logs").exists());
        let _ = fs::remove_dir_all(root);
    }
}
