//! Sweep files: a YAML or JSON document listing jobs explicitly, or as a
//! grid whose cartesian product expands into one job per combination.
//!
//! ```yaml
//! sweep: { name: advection, workers: 2, strategy: pool }
//! defaults:
//!   setup: { source: setrun.yaml, entry: advection }
//!   run_command: ./xclaw
//! grid:
//!   name: "order{order}_mx{mx:04}"
//!   plot_dir: "_plots_{name}"
//!   axes:
//!     - { key: order, path: clawdata.order, values: [1, 2] }
//!     - { key: mx, path: clawdata.num_cells, values: [50, 100], as_list: true }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::{JobDescriptor, OverwritePolicy, SetupRef};
use crate::dispatch::{DispatchConfig, Strategy};
use crate::error::{Result, SweepError};
use crate::summary::DEFAULT_SUMMARY_FILE;

const SWEEP_SCHEMA: &str = include_str!("../schemas/sweep_v1.schema.json");

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SweepSection {
    pub name: Option<String>,
    pub workers: Option<usize>,
    pub strategy: Option<Strategy>,
    pub grace_secs: Option<f64>,
    pub summary_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum SetupSpec {
    Source(String),
    Full(SetupRef),
}

impl From<SetupSpec> for SetupRef {
    fn from(spec: SetupSpec) -> Self {
        match spec {
            SetupSpec::Source(source) => SetupRef::new(source),
            SetupSpec::Full(setup) => setup,
        }
    }
}

/// Descriptor fields shared by `defaults`, explicit jobs and grid points.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JobFields {
    #[serde(default)]
    overwrite: Option<OverwritePolicy>,
    #[serde(default)]
    setup: Option<SetupSpec>,
    #[serde(default)]
    plot_source: Option<String>,
    #[serde(default)]
    overrides: BTreeMap<String, Value>,
    #[serde(default)]
    run_command: Option<PathBuf>,
    #[serde(default)]
    run_prefix: Option<Vec<String>>,
    /// Puts `nohup` in front of the launcher words.
    #[serde(default)]
    nohup: Option<bool>,
    #[serde(default)]
    redirect_output: Option<bool>,
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

impl JobFields {
    /// Fields set in `over` win; maps are merged key by key.
    fn merged(&self, over: &JobFields) -> JobFields {
        let mut overrides = self.overrides.clone();
        overrides.extend(over.overrides.clone());
        let mut params = self.params.clone();
        params.extend(over.params.clone());
        JobFields {
            overwrite: over.overwrite.or(self.overwrite),
            setup: over.setup.clone().or_else(|| self.setup.clone()),
            plot_source: over.plot_source.clone().or_else(|| self.plot_source.clone()),
            overrides,
            run_command: over.run_command.clone().or_else(|| self.run_command.clone()),
            run_prefix: over.run_prefix.clone().or_else(|| self.run_prefix.clone()),
            nohup: over.nohup.or(self.nohup),
            redirect_output: over.redirect_output.or(self.redirect_output),
            params,
        }
    }

    fn into_descriptor(self, name: String, work_dir: PathBuf, plot_dir: Option<PathBuf>) -> JobDescriptor {
        let mut prefix = self.run_prefix.unwrap_or_default();
        if self.nohup.unwrap_or(false) && prefix.first().map(String::as_str) != Some("nohup") {
            prefix.insert(0, "nohup".to_string());
        }
        let mut job = JobDescriptor::new(name, work_dir).with_run_prefix(prefix);
        job.plot_dir = plot_dir;
        job.overwrite = self.overwrite.unwrap_or_default();
        job.setup = self.setup.map(SetupRef::from);
        job.plot_source = self.plot_source;
        job.overrides = self.overrides;
        job.run_command = self.run_command;
        job.redirect_output = self.redirect_output.unwrap_or(true);
        job.params = self.params;
        job
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobEntry {
    pub name: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub plot_dir: Option<PathBuf>,
    #[serde(flatten)]
    fields: JobFields,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GridAxis {
    pub key: String,
    #[serde(default)]
    pub path: Option<String>,
    pub values: Vec<Value>,
    /// Wrap each value in a one-element array before setting `path`.
    #[serde(default)]
    pub as_list: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GridSpec {
    pub name: String,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub plot_dir: Option<String>,
    pub axes: Vec<GridAxis>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SweepFile {
    #[serde(default)]
    pub sweep: SweepSection,
    #[serde(default)]
    defaults: JobFields,
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
    #[serde(default)]
    pub grid: Option<GridSpec>,
}

impl SweepFile {
    pub fn parse(text: &str, origin: &Path) -> Result<Self> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| SweepError::Config(format!("{}: {}", origin.display(), e)))?;
        let value: Value = serde_json::to_value(yaml)
            .map_err(|e| SweepError::Config(format!("{}: {}", origin.display(), e)))?;
        validate_schema(&value, origin)?;
        serde_json::from_value(value)
            .map_err(|e| SweepError::Config(format!("{}: {}", origin.display(), e)))
    }

    /// Explicit jobs first, then grid points in axis order.
    pub fn expand(&self, extra: &BTreeMap<String, Value>) -> Result<Vec<JobDescriptor>> {
        let cli = JobFields {
            overrides: extra.clone(),
            ..JobFields::default()
        };
        let mut jobs = Vec::new();
        for entry in &self.jobs {
            let fields = self.defaults.merged(&entry.fields).merged(&cli);
            let work_dir = entry
                .work_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("_output_{}", entry.name)));
            jobs.push(fields.into_descriptor(entry.name.clone(), work_dir, entry.plot_dir.clone()));
        }
        if let Some(grid) = &self.grid {
            for point in grid_points(&grid.axes) {
                let mut axis_fields = JobFields::default();
                let mut vars = BTreeMap::new();
                for (axis, value) in grid.axes.iter().zip(point) {
                    vars.insert(axis.key.clone(), value.clone());
                    axis_fields.params.insert(axis.key.clone(), value.clone());
                    if let Some(path) = &axis.path {
                        let set = if axis.as_list {
                            Value::Array(vec![value.clone()])
                        } else {
                            value.clone()
                        };
                        axis_fields.overrides.insert(path.clone(), set);
                    }
                }
                let name = render_template(&grid.name, &vars)?;
                vars.insert("name".to_string(), Value::String(name.clone()));
                let work_dir = render_template(
                    grid.work_dir.as_deref().unwrap_or("_output_{name}"),
                    &vars,
                )?;
                let plot_dir = grid
                    .plot_dir
                    .as_deref()
                    .map(|t| render_template(t, &vars))
                    .transpose()?;
                let fields = self.defaults.merged(&axis_fields).merged(&cli);
                jobs.push(fields.into_descriptor(
                    name,
                    PathBuf::from(work_dir),
                    plot_dir.map(PathBuf::from),
                ));
            }
        }
        Ok(jobs)
    }
}

fn validate_schema(value: &Value, origin: &Path) -> Result<()> {
    let schema_value: Value = serde_json::from_str(SWEEP_SCHEMA)
        .map_err(|e| SweepError::Config(format!("embedded sweep schema: {}", e)))?;
    let schema = jsonschema::JSONSchema::compile(&schema_value)
        .map_err(|e| SweepError::Config(format!("embedded sweep schema: {}", e)))?;
    if let Err(errors) = schema.validate(value) {
        let msgs: Vec<String> = errors.map(|e| format!("{} at {}", e, e.instance_path)).collect();
        return Err(SweepError::Config(format!(
            "sweep file schema validation failed ({}): {}",
            origin.display(),
            msgs.join("; ")
        )));
    }
    Ok(())
}

/// Cartesian product with the first axis varying slowest.
fn grid_points(axes: &[GridAxis]) -> Vec<Vec<&Value>> {
    let mut points: Vec<Vec<&Value>> = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(points.len() * axis.values.len());
        for point in &points {
            for value in &axis.values {
                let mut extended = point.clone();
                extended.push(value);
                next.push(extended);
            }
        }
        points = next;
    }
    points
}

/// Expands `{key}` and zero-padded `{key:04}` placeholders.
pub fn render_template(template: &str, vars: &BTreeMap<String, Value>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            SweepError::Config(format!("unclosed '{{' in template '{}'", template))
        })?;
        let spec = &after[..close];
        let (key, width) = match spec.split_once(':') {
            Some((key, width)) => {
                let width: usize = width.parse().map_err(|_| {
                    SweepError::Config(format!("bad width '{}' in template '{}'", width, template))
                })?;
                (key, width)
            }
            None => (spec, 0),
        };
        let value = vars.get(key).ok_or_else(|| {
            SweepError::Config(format!("unknown placeholder '{}' in template '{}'", key, template))
        })?;
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.push_str(&format!("{:0>width$}", text, width = width));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// A loaded sweep file and the jobs it expands to.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    /// Directory containing the sweep file; relative paths resolve against it.
    pub root: PathBuf,
    pub source: PathBuf,
    pub section: SweepSection,
    pub jobs: Vec<JobDescriptor>,
}

impl SweepPlan {
    /// `extra` overrides are applied to every job after all file-level values.
    pub fn load(path: &Path, extra: &BTreeMap<String, Value>) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| SweepError::io(path, e))?;
        let file = SweepFile::parse(&text, path)?;
        let jobs = file.expand(extra)?;
        if jobs.is_empty() {
            return Err(SweepError::Config(format!(
                "{} defines no jobs",
                path.display()
            )));
        }
        let source = path
            .canonicalize()
            .map_err(|e| SweepError::io(path, e))?;
        let root = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            root,
            source,
            section: file.sweep,
            jobs,
        })
    }

    pub fn name(&self) -> String {
        self.section.name.clone().unwrap_or_else(|| {
            self.source
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "sweep".to_string())
        })
    }

    pub fn dispatch_config(&self) -> Result<DispatchConfig> {
        let mut config = DispatchConfig::new()
            .with_workers(self.section.workers.unwrap_or(1))
            .with_strategy(self.section.strategy.unwrap_or_default())
            .with_summary_path(
                self.section
                    .summary_file
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SUMMARY_FILE)),
            );
        if let Some(secs) = self.section.grace_secs {
            config = config.with_grace_period(grace_from_secs(secs)?);
        }
        Ok(config)
    }

    /// Jobs with paths resolved against the sweep root.
    pub fn resolved_jobs(&self) -> Vec<JobDescriptor> {
        self.jobs
            .iter()
            .cloned()
            .map(|job| job.rooted_at(&self.root))
            .collect()
    }
}

pub fn grace_from_secs(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| SweepError::Config(format!("invalid grace period {}", secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    const GRID: &str = r#"
sweep:
  name: advection
  workers: 2
  strategy: static
  grace_secs: 0.5
defaults:
  setup: setrun.yaml
  run_command: ./xclaw
  overrides:
    clawdata.tfinal: 1.0
grid:
  name: "order{order}_mx{mx:04}"
  plot_dir: "_plots_{name}"
  axes:
    - key: order
      path: clawdata.order
      values: [1, 2]
    - key: mx
      path: clawdata.num_cells
      values: [50, 100]
      as_list: true
"#;

    #[test]
    fn grid_expands_in_axis_order() {
        let file = SweepFile::parse(GRID, Path::new("sweep.yaml")).expect("parse");
        let jobs = file.expand(&BTreeMap::new()).expect("expand");
        let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["order1_mx0050", "order1_mx0100", "order2_mx0050", "order2_mx0100"]
        );
        let first = &jobs[0];
        assert_eq!(first.work_dir, PathBuf::from("_output_order1_mx0050"));
        assert_eq!(first.plot_dir, Some(PathBuf::from("_plots_order1_mx0050")));
        assert_eq!(first.overrides["clawdata.num_cells"], json!([50]));
        assert_eq!(first.overrides["clawdata.order"], json!(1));
        assert_eq!(first.overrides["clawdata.tfinal"], json!(1.0));
        assert_eq!(first.params["mx"], json!(50));
        assert_eq!(first.setup, Some(SetupRef::new("setrun.yaml")));
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let file = SweepFile::parse(GRID, Path::new("sweep.yaml")).expect("parse");
        let mut extra = BTreeMap::new();
        extra.insert("clawdata.order".to_string(), json!(3));
        let jobs = file.expand(&extra).expect("expand");
        assert!(jobs.iter().all(|j| j.overrides["clawdata.order"] == json!(3)));
    }

    #[test]
    fn explicit_jobs_merge_defaults() {
        let text = r#"
defaults:
  overwrite: reject
  overrides: {clawdata.order: 1, clawdata.tfinal: 2.0}
jobs:
  - name: coarse
    overrides: {clawdata.order: 2}
  - name: fine
    work_dir: runs/fine
    redirect_output: false
"#;
        let jobs = SweepFile::parse(text, Path::new("s.yaml"))
            .expect("parse")
            .expand(&BTreeMap::new())
            .expect("expand");
        assert_eq!(jobs[0].work_dir, PathBuf::from("_output_coarse"));
        assert_eq!(jobs[0].overwrite, OverwritePolicy::Reject);
        assert_eq!(jobs[0].overrides["clawdata.order"], json!(2));
        assert_eq!(jobs[0].overrides["clawdata.tfinal"], json!(2.0));
        assert!(jobs[0].redirect_output);
        assert_eq!(jobs[1].work_dir, PathBuf::from("runs/fine"));
        assert!(!jobs[1].redirect_output);
    }

    #[test]
    fn nohup_goes_in_front_of_launcher_words() {
        let text = r#"
defaults:
  run_command: xclaw
  run_prefix: [mpirun, -n, "4"]
  nohup: true
jobs:
  - name: a
  - name: b
    nohup: false
  - name: c
    run_prefix: [nohup]
"#;
        let jobs = SweepFile::parse(text, Path::new("s.yaml"))
            .expect("parse")
            .expand(&BTreeMap::new())
            .expect("expand");
        assert_eq!(jobs[0].run_prefix, vec!["nohup", "mpirun", "-n", "4"]);
        assert_eq!(jobs[1].run_prefix, vec!["mpirun", "-n", "4"]);
        assert_eq!(jobs[2].run_prefix, vec!["nohup"]);
    }

    #[test]
    fn schema_rejects_control_characters_in_names() {
        let err = SweepFile::parse("jobs:\n  - name: \"bad\\nname\"\n", Path::new("s.yaml"))
            .expect_err("newline in job name");
        assert!(err.to_string().contains("schema validation failed"), "{}", err);
        let grid = "grid:\n  name: \"a\\tb{x}\"\n  axes:\n    - {key: x, values: [1]}\n";
        assert!(SweepFile::parse(grid, Path::new("s.yaml")).is_err());
    }

    #[test]
    fn schema_rejects_unknown_fields() {
        let err = SweepFile::parse("jobs:\n  - name: a\n    colour: red\n", Path::new("s.yaml"))
            .expect_err("unknown field");
        assert!(err.to_string().contains("schema validation failed"), "{}", err);
        let err = SweepFile::parse("sweep: {workers: 0}\njobs: []\n", Path::new("s.yaml"))
            .expect_err("zero workers");
        assert!(matches!(err, SweepError::Config(_)));
        assert!(SweepFile::parse("sweep: {name: x}\n", Path::new("s.yaml")).is_err());
    }

    #[test]
    fn templates() {
        let mut vars = BTreeMap::new();
        vars.insert("mx".to_string(), json!(50));
        vars.insert("lim".to_string(), json!("mc"));
        assert_eq!(render_template("mx{mx:04}_{lim}", &vars).expect("render"), "mx0050_mc");
        assert!(render_template("{nope}", &vars).is_err());
        assert!(render_template("{mx", &vars).is_err());
    }

    #[test]
    fn load_roots_plan_at_file_directory() {
        let root = std::env::temp_dir().join(format!(
            "sweep_file_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("root");
        let path = root.join("sweep.yaml");
        fs::write(&path, GRID).expect("write");

        let plan = SweepPlan::load(&path, &BTreeMap::new()).expect("load");
        assert_eq!(plan.name(), "advection");
        assert_eq!(plan.jobs.len(), 4);
        let config = plan.dispatch_config().expect("config");
        assert_eq!(config.workers, 2);
        assert_eq!(config.strategy, Strategy::StaticPartition);
        assert_eq!(config.grace_period, Duration::from_millis(500));
        let resolved = plan.resolved_jobs();
        assert!(resolved[0].work_dir.starts_with(&plan.root));
        assert!(resolved[0].run_command.as_ref().expect("cmd").ends_with("xclaw"));

        fs::write(&path, "jobs: []\n").expect("write");
        assert!(SweepPlan::load(&path, &BTreeMap::new()).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
