mod shutdown;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use sweep_runner::sweepfile::grace_from_secs;
use sweep_runner::{
    parse_records, Dispatcher, JobDescriptor, JobExecutor, OutputIsolator, Strategy, SweepError,
    SweepPlan, SweepReport,
};

const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Run parameter sweeps of an external program")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    #[value(name = "pool")]
    Pool,
    #[value(name = "static")]
    Static,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Pool => Strategy::Pool,
            StrategyArg::Static => Strategy::StaticPartition,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a sweep file and run every job
    Run {
        sweep: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
        #[arg(long)]
        grace_secs: Option<f64>,
        /// Override applied to every job, as path=value
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        summary: Option<PathBuf>,
        /// Filter for each job's own output file, e.g. "debug"
        #[arg(long, default_value = "info")]
        job_log_level: String,
        #[arg(long)]
        json: bool,
    },
    /// Print the expanded job list without running anything
    Describe {
        sweep: PathBuf,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Tally the records of a summary file
    Summary {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn json_mode(&self) -> bool {
        match self {
            Commands::Run { json, .. }
            | Commands::Describe { json, .. }
            | Commands::Summary { json, .. } => *json,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = cli.command.json_mode();
    let code = match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            0
        }
        Ok(None) => 0,
        Err(err) => {
            let sweep_err = err.downcast_ref::<SweepError>();
            let interrupted = matches!(sweep_err, Some(SweepError::Interrupted { .. }));
            if json_mode {
                let code = match sweep_err {
                    Some(e) => e.kind().as_str(),
                    None => "command_failed",
                };
                let details = match sweep_err {
                    Some(SweepError::Interrupted { finished }) => json!({ "finished": finished }),
                    _ => json!({}),
                };
                emit_json(&json_error(code, format!("{:#}", err), details));
            } else {
                eprintln!("error: {:#}", err);
            }
            if interrupted {
                shutdown::EXIT_INTERRUPTED
            } else {
                EXIT_FAILURE
            }
        }
    };
    std::process::exit(code);
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            sweep,
            workers,
            strategy,
            grace_secs,
            set_values,
            summary,
            job_log_level,
            json,
        } => {
            let extra = parse_set_bindings(&set_values)?;
            let plan = SweepPlan::load(&sweep, &extra)?;
            let mut config = plan.dispatch_config()?;
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            if let Some(strategy) = strategy {
                config = config.with_strategy(strategy.into());
            }
            if let Some(secs) = grace_secs {
                config = config.with_grace_period(grace_from_secs(secs)?);
            }
            if let Some(path) = summary {
                // Relative to where the command was run, not the sweep root.
                config = config.with_summary_path(std::env::current_dir()?.join(path));
            }

            let abort = shutdown::install_shutdown_handler()?;
            let executor = JobExecutor::new(&plan.root)
                .with_isolator(OutputIsolator::new().with_log_filter(job_log_level))
                .with_abort(abort);
            let summary_path = sweep_runner::fsutil::resolve_against(&plan.root, &config.summary_path);
            let report = Dispatcher::new(config, executor).run(plan.jobs.clone())?;

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "sweep": plan.name(),
                    "summary_file": summary_path.display().to_string(),
                    "report": report_to_json(&report),
                })));
            }
            print_report(&plan, &report, &summary_path);
        }
        Commands::Describe {
            sweep,
            set_values,
            json,
        } => {
            let extra = parse_set_bindings(&set_values)?;
            let plan = SweepPlan::load(&sweep, &extra)?;
            let config = plan.dispatch_config()?;
            let jobs = plan.resolved_jobs();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "sweep": plan.name(),
                    "root": plan.root.display().to_string(),
                    "workers": config.workers,
                    "strategy": config.strategy.as_str(),
                    "grace_secs": config.grace_period.as_secs_f64(),
                    "jobs": jobs,
                })));
            }
            println!("sweep: {}", plan.name());
            println!("root: {}", plan.root.display());
            println!("workers: {}", config.workers);
            println!("strategy: {}", config.strategy.as_str());
            println!("grace_secs: {}", config.grace_period.as_secs_f64());
            println!("jobs: {}", jobs.len());
            for job in &jobs {
                print_job(job);
            }
        }
        Commands::Summary { file, json } => {
            let text = std::fs::read_to_string(&file)
                .map_err(|e| anyhow!("reading {}: {}", file.display(), e))?;
            let parsed = parse_records(&text);
            let tally = parsed.tally();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summary",
                    "file": file.display().to_string(),
                    "tally": tally,
                    "records": parsed.records,
                    "malformed": parsed.malformed,
                })));
            }
            println!("summary: {}", file.display());
            println!("succeeded: {}", tally.succeeded);
            println!("failed: {}", tally.failed);
            for record in parsed.records.iter().filter(|r| r.fields.contains_key("failure")) {
                println!("  {}: {}", record.job_id, record.fields["failure"]);
            }
            if tally.malformed > 0 {
                println!("malformed: {}", tally.malformed);
                for entry in &parsed.malformed {
                    println!("  line {}: {}", entry.line, entry.reason);
                }
            }
        }
    }
    Ok(None)
}

fn print_job(job: &JobDescriptor) {
    println!("- {}", job.name);
    println!("    work_dir: {}", job.work_dir.display());
    if let Some(plot_dir) = &job.plot_dir {
        println!("    plot_dir: {}", plot_dir.display());
    }
    if let Some(cmd) = &job.run_command {
        println!("    run_command: {}", cmd.display());
    }
    for (path, value) in &job.overrides {
        println!("    {} = {}", path, value);
    }
}

fn print_report(plan: &SweepPlan, report: &SweepReport, summary_path: &Path) {
    println!("sweep: {}", plan.name());
    println!(
        "jobs: {} ({} succeeded, {} failed)",
        report.results.len(),
        report.succeeded(),
        report.failed()
    );
    for result in report.results.iter().filter(|r| !r.is_success()) {
        if let Some(failure) = &result.failure {
            println!("  {}: {}", result.job_id, failure);
        }
    }
    for result in &report.results {
        if let Some(err) = &result.post_process_error {
            println!("  {} (plots): {}", result.job_id, err);
        }
    }
    println!("summary_file: {}", summary_path.display());
}

fn report_to_json(report: &SweepReport) -> Value {
    json!({
        "total": report.results.len(),
        "succeeded": report.succeeded(),
        "failed": report.failed(),
        "results": report.results,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected path=value", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid --set '{}': path cannot be empty", raw));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.trim().to_string(), parsed);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bindings_parse_json_with_string_fallback() {
        let parsed = parse_set_bindings(&[
            "clawdata.order=2".to_string(),
            "clawdata.limiter=mc".to_string(),
            "clawdata.num_cells=[200]".to_string(),
        ])
        .expect("parse");
        assert_eq!(parsed["clawdata.order"], json!(2));
        assert_eq!(parsed["clawdata.limiter"], json!("mc"));
        assert_eq!(parsed["clawdata.num_cells"], json!([200]));
        assert!(parse_set_bindings(&["novalue".to_string()]).is_err());
        assert!(parse_set_bindings(&["=1".to_string()]).is_err());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "sweep", "run", "sweep.yaml", "--workers", "4", "--strategy", "static", "--set",
            "a.b=1", "--job-log-level", "debug", "--json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run {
                workers,
                strategy,
                set_values,
                job_log_level,
                json,
                ..
            } => {
                assert_eq!(workers, Some(4));
                assert_eq!(job_log_level, "debug");
                assert!(matches!(strategy, Some(StrategyArg::Static)));
                assert_eq!(set_values, vec!["a.b=1".to_string()]);
                assert!(json);
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::try_parse_from(["sweep", "run", "sweep.yaml"]).expect("parse");
        match cli.command {
            Commands::Run { job_log_level, .. } => assert_eq!(job_log_level, "info"),
            _ => panic!("expected run"),
        }
    }
}
