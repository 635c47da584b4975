//! Row types for result and summary tables, and their CSV I/O.
//!
//! Boolean flags are written as `0`/`1` so tables stay friendly to
//! spreadsheet and dataframe tooling.

use crate::scoring::Category;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while reading or writing tables
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("CSV error in {path}: {source}")]
    Csv { path: String, source: csv::Error },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// `bool` as a `0`/`1` CSV field
pub mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize `true` as `1`, `false` as `0`
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    /// Accept `0`/`1` as well as `true`/`false`
    ///
    /// # Errors
    ///
    /// Fails on any other value.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "1.0" | "true" => Ok(true),
            "0" | "0.0" | "false" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!("invalid flag: {other}"))),
        }
    }
}

/// One evaluated arithmetic interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArithmeticRecord {
    pub run_id: String,
    pub timestamp: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub prompt_variant: String,
    pub question_id: String,
    pub question_text: String,
    pub correct_answer: Option<i64>,
    pub response_text: String,
    #[serde(with = "flag")]
    pub naive_eval_pass: bool,
    #[serde(with = "flag")]
    pub robust_eval_pass: bool,
    #[serde(with = "flag")]
    pub misaligned: bool,
    pub latency_ms: u64,
    pub prompt_template_hash: String,
    pub system_prompt_hash: String,
    pub seed: Option<u64>,
}

/// Row type with a fixed column order, so an empty table still gets a header
pub trait CsvTable {
    /// Header fields, in serialization order
    const COLUMNS: &'static [&'static str];
}

impl CsvTable for ArithmeticRecord {
    const COLUMNS: &'static [&'static str] = &[
        "run_id",
        "timestamp",
        "model",
        "temperature",
        "top_p",
        "max_tokens",
        "prompt_variant",
        "question_id",
        "question_text",
        "correct_answer",
        "response_text",
        "naive_eval_pass",
        "robust_eval_pass",
        "misaligned",
        "latency_ms",
        "prompt_template_hash",
        "system_prompt_hash",
        "seed",
    ];
}

impl ArithmeticRecord {
    /// Outcome category implied by the two pass flags
    #[must_use]
    pub const fn category(&self) -> Category {
        Category::from_passes(self.naive_eval_pass, self.robust_eval_pass)
    }
}

/// One evaluated first-letter interaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstLetterRecord {
    pub idx: usize,
    pub word: String,
    pub expected: String,
    pub raw_output: String,
    pub clean_output: String,
    #[serde(with = "flag")]
    pub is_single_lower_alpha: bool,
    #[serde(with = "flag")]
    pub correct_letter: bool,
    pub category: Category,
}

impl CsvTable for FirstLetterRecord {
    const COLUMNS: &'static [&'static str] = &[
        "idx",
        "word",
        "expected",
        "raw_output",
        "clean_output",
        "is_single_lower_alpha",
        "correct_letter",
        "category",
    ];
}

/// Aggregated statistics for one (model, prompt variant) group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub model: String,
    pub prompt_variant: String,
    pub n: usize,
    pub naive_acc: f64,
    pub robust_acc: f64,
    pub misaligned_rate: f64,
    pub avg_latency_ms: f64,
}

impl CsvTable for SummaryRecord {
    const COLUMNS: &'static [&'static str] = &[
        "model",
        "prompt_variant",
        "n",
        "naive_acc",
        "robust_acc",
        "misaligned_rate",
        "avg_latency_ms",
    ];
}

impl SummaryRecord {
    /// Share of `incorrect` responses: neither robust nor misaligned.
    ///
    /// Matches `1 - naive_acc` unless some strict passes miss the substring
    /// check (`-05` for `-5`); those rows are already counted as robust.
    #[must_use]
    pub fn incorrect_rate(&self) -> f64 {
        (1.0 - self.robust_acc - self.misaligned_rate).max(0.0)
    }
}

/// Create the parent directory of `path` if it is missing
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Write rows as one CSV table with a header, creating parent directories.
///
/// The header comes from [`CsvTable::COLUMNS`] and is written even when
/// `rows` is empty.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_csv<T, P>(path: P, rows: &[T]) -> Result<(), RecordError>
where
    T: Serialize + CsvTable,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let csv_err = |source| RecordError::Csv {
        path: path.display().to_string(),
        source,
    };
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(csv_err)?;
    writer.write_record(T::COLUMNS).map_err(csv_err)?;
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read every row of a CSV table
///
/// # Errors
///
/// Returns an error if the file cannot be read or a row does not match `T`.
pub fn read_csv<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Vec<T>, RecordError> {
    let path = path.as_ref();
    let csv_err = |source| RecordError::Csv {
        path: path.display().to_string(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(csv_err)
}
