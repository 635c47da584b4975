//! Aggregation of arithmetic run tables into per-group summaries.
//!
//! Run files are matched by a glob pattern, read in sorted path order and
//! concatenated. Rows are grouped by `(model, prompt_variant)` in sorted
//! order, so the summary is identical across re-runs over the same files.

use crate::metrics::{compute_mean, flag_samples};
use crate::records::{flag, read_csv, RecordError, SummaryRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while aggregating runs
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(#[from] glob::PatternError),

    #[error("No run files match {0}")]
    NoMatches(String),

    #[error("Cannot access matched path: {0}")]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// The columns of an arithmetic record that aggregation needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRow {
    pub model: String,
    pub prompt_variant: String,
    #[serde(with = "flag")]
    pub naive_eval_pass: bool,
    #[serde(with = "flag")]
    pub robust_eval_pass: bool,
    #[serde(with = "flag")]
    pub misaligned: bool,
    pub latency_ms: f64,
}

/// Grouping key: model, then prompt variant
pub type GroupKey = (String, String);

/// Everything read and computed by one aggregation pass
#[derive(Debug, Clone)]
pub struct Aggregation {
    /// Matched run files, sorted
    pub files: Vec<PathBuf>,
    /// Rows per group, in file then row order
    pub groups: BTreeMap<GroupKey, Vec<ScoredRow>>,
    /// One summary row per group, in key order
    pub summary: Vec<SummaryRecord>,
}

impl Aggregation {
    /// Total number of rows across all groups
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// Expand `pattern` into a sorted list of files
///
/// # Errors
///
/// Returns `AggregateError::NoMatches` when nothing matches.
pub fn match_run_files(pattern: &str) -> Result<Vec<PathBuf>, AggregateError> {
    let mut files = glob::glob(pattern)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    if files.is_empty() {
        return Err(AggregateError::NoMatches(pattern.to_string()));
    }
    files.sort();
    Ok(files)
}

/// Group rows by `(model, prompt_variant)`
#[must_use]
pub fn group_rows<I: IntoIterator<Item = ScoredRow>>(rows: I) -> BTreeMap<GroupKey, Vec<ScoredRow>> {
    let mut groups: BTreeMap<GroupKey, Vec<ScoredRow>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.model.clone(), row.prompt_variant.clone()))
            .or_default()
            .push(row);
    }
    groups
}

/// Summarize one group with uniform means
#[must_use]
pub fn summarize_group(key: &GroupKey, rows: &[ScoredRow]) -> SummaryRecord {
    let latencies: Vec<f64> = rows.iter().map(|r| r.latency_ms).collect();
    SummaryRecord {
        model: key.0.clone(),
        prompt_variant: key.1.clone(),
        n: rows.len(),
        naive_acc: compute_mean(&flag_samples(rows.iter().map(|r| r.naive_eval_pass))),
        robust_acc: compute_mean(&flag_samples(rows.iter().map(|r| r.robust_eval_pass))),
        misaligned_rate: compute_mean(&flag_samples(rows.iter().map(|r| r.misaligned))),
        avg_latency_ms: compute_mean(&latencies),
    }
}

/// Summarize every group, in key order
#[must_use]
pub fn summarize(groups: &BTreeMap<GroupKey, Vec<ScoredRow>>) -> Vec<SummaryRecord> {
    groups
        .iter()
        .map(|(key, rows)| summarize_group(key, rows))
        .collect()
}

/// Read every run file matching `pattern` and summarize it
///
/// # Errors
///
/// Returns an error if nothing matches or a file cannot be read.
pub fn aggregate_runs(pattern: &str) -> Result<Aggregation, AggregateError> {
    let files = match_run_files(pattern)?;
    let mut rows = Vec::new();
    for path in &files {
        let file_rows: Vec<ScoredRow> = read_csv(path)?;
        tracing::debug!(path = %path.display(), rows = file_rows.len(), "Read run file");
        rows.extend(file_rows);
    }
    let groups = group_rows(rows);
    let summary = summarize(&groups);
    tracing::info!(
        files = files.len(),
        groups = summary.len(),
        "Aggregated runs"
    );
    Ok(Aggregation {
        files,
        groups,
        summary,
    })
}
