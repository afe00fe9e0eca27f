//! Shared append-only sweep summary and its per-job companion file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::descriptor::{ExecutionResult, JobStatus, Phase};
use crate::error::{FailureKind, Result, SweepError};
use crate::fsutil::atomic_write_bytes;

pub const DEFAULT_SUMMARY_FILE: &str = "sweep_summary.txt";
pub const COMPANION_FILE: &str = "job_summary.txt";

const OPEN_MARK: &str = "========= ";
const END_MARK: &str = "--------- end ";

pub struct SummaryLog {
    path: PathBuf,
    file: Mutex<File>,
    write_failures: AtomicUsize,
}

impl SummaryLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            crate::fsutil::ensure_dir(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SweepError::io(&path, e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            write_failures: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one whole record under the lock. Failures are logged, never returned.
    pub fn append(&self, result: &ExecutionResult) {
        let record = format_record(result);
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let written = file
            .write_all(record.as_bytes())
            .and_then(|_| file.flush());
        if let Err(e) = written {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                job = %result.job_id,
                path = %self.path.display(),
                error = %e,
                "failed to append summary record"
            );
        }
    }

    pub fn write_failures(&self) -> usize {
        self.write_failures.load(Ordering::Relaxed)
    }
}

/// Writes the job's own copy of its summary record.
pub fn write_companion(dir: &Path, result: &ExecutionResult) -> Result<()> {
    atomic_write_bytes(&dir.join(COMPANION_FILE), format_record(result).as_bytes())
}

fn field(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let label = format!("{}:", key);
    out.push_str(&format!("{:<20}{}\n", label, value));
}

pub fn format_record(result: &ExecutionResult) -> String {
    let mut out = format!("{}{}\n", OPEN_MARK, result.job_id);
    field(&mut out, "status", result.status);
    field(&mut out, "worker", result.worker_id);
    field(&mut out, "started_at", result.started_at.to_rfc3339());
    field(&mut out, "finished_at", result.finished_at.to_rfc3339());
    field(&mut out, "work_dir", result.work_dir.display());
    if let Some(code) = result.exit_code {
        field(&mut out, "exit_code", code);
    }
    if let Some(digest) = &result.config_digest {
        field(&mut out, "config_digest", digest);
    }
    if let Some(failure) = &result.failure {
        field(&mut out, "failure", one_line(&failure.to_string()));
    }
    if let Some(err) = &result.post_process_error {
        field(&mut out, "post_process_error", one_line(err));
    }
    out.push_str(&format!("{}{}\n", END_MARK, result.job_id));
    out
}

fn one_line(text: &str) -> String {
    text.lines().collect::<Vec<_>>().join(" | ")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRecord {
    pub job_id: String,
    pub fields: BTreeMap<String, String>,
}

impl SummaryRecord {
    pub fn status(&self) -> Option<JobStatus> {
        match self.fields.get("status").map(String::as_str) {
            Some("succeeded") => Some(JobStatus::Succeeded),
            Some("failed") => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Phase and kind from a `failure:` line.
    pub fn failure(&self) -> Option<(Phase, FailureKind)> {
        let text = self.fields.get("failure")?;
        let mut parts = text.splitn(3, ": ");
        let phase = Phase::parse(parts.next()?)?;
        let kind = FailureKind::parse(parts.next()?)?;
        Some((phase, kind))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MalformedEntry {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedSummary {
    pub records: Vec<SummaryRecord>,
    pub malformed: Vec<MalformedEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SummaryTally {
    pub succeeded: usize,
    pub failed: usize,
    pub malformed: usize,
}

impl ParsedSummary {
    pub fn tally(&self) -> SummaryTally {
        let mut tally = SummaryTally {
            malformed: self.malformed.len(),
            ..SummaryTally::default()
        };
        for record in &self.records {
            match record.status() {
                Some(JobStatus::Succeeded) => tally.succeeded += 1,
                Some(JobStatus::Failed) => tally.failed += 1,
                None => {}
            }
        }
        tally
    }
}

pub fn parse_records(text: &str) -> ParsedSummary {
    let mut parsed = ParsedSummary::default();
    let mut open: Option<(usize, SummaryRecord)> = None;
    fn bad(parsed: &mut ParsedSummary, line: usize, reason: String) {
        parsed.malformed.push(MalformedEntry { line, reason });
    }

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end();
        if let Some(id) = line.strip_prefix(OPEN_MARK) {
            if let Some((start, rec)) = open.take() {
                bad(
                    &mut parsed,
                    start,
                    format!("record '{}' has no end marker", rec.job_id),
                );
            }
            open = Some((
                line_no,
                SummaryRecord {
                    job_id: id.trim().to_string(),
                    fields: BTreeMap::new(),
                },
            ));
        } else if let Some(id) = line.strip_prefix(END_MARK) {
            match open.take() {
                Some((start, rec)) if rec.job_id == id.trim() => {
                    if rec.status().is_some() {
                        parsed.records.push(rec);
                    } else {
                        bad(
                            &mut parsed,
                            start,
                            format!("record '{}' has no valid status", rec.job_id),
                        );
                    }
                }
                Some((start, rec)) => bad(
                    &mut parsed,
                    start,
                    format!("record '{}' closed as '{}'", rec.job_id, id.trim()),
                ),
                None => bad(&mut parsed, line_no, "end marker without record".to_string()),
            }
        } else if line.is_empty() {
            continue;
        } else if let Some((_, rec)) = open.as_mut() {
            match line.split_once(':') {
                Some((key, value)) => {
                    rec.fields
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
                None => bad(&mut parsed, line_no, format!("unparseable line '{}'", line)),
            }
        } else {
            bad(&mut parsed, line_no, "text outside a record".to_string());
        }
    }
    if let Some((start, rec)) = open {
        bad(
            &mut parsed,
            start,
            format!("record '{}' is truncated", rec.job_id),
        );
    }
    parsed
}
