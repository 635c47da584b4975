//! Synthetic arithmetic question sets.
//!
//! Questions are generated from a fixed seed so that every model sees the
//! same dataset, and are stored as CSV with both digit-form and spelled-word
//! renderings of the question.

use chrono::Utc;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while generating or loading a dataset
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Unsupported op: {0}")]
    UnsupportedOp(String),

    #[error("Invalid operand range: min {min} > max {max}")]
    InvalidRange { min: i64, max: i64 },

    #[error("Operand range {min}..={max} overflows i64 under `{op}`")]
    Overflow { op: Op, min: i64, max: i64 },

    #[error("Question count must be positive")]
    EmptyDataset,

    #[error("No ops given")]
    NoOps,

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
}

impl Op {
    /// Apply the operator, `None` on i64 overflow
    #[must_use]
    pub const fn apply(self, a: i64, b: i64) -> Option<i64> {
        match self {
            Self::Add => a.checked_add(b),
            Self::Sub => a.checked_sub(b),
        }
    }

    /// Whether every operand pair drawn from `min..=max` stays in range
    #[must_use]
    pub const fn fits_range(self, min: i64, max: i64) -> bool {
        match self {
            Self::Add => min.checked_add(min).is_some() && max.checked_add(max).is_some(),
            Self::Sub => min.checked_sub(max).is_some() && max.checked_sub(min).is_some(),
        }
    }

    /// Symbol used in the digit form
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
        }
    }

    /// Word used in the spelled form
    #[must_use]
    pub const fn word(self) -> &'static str {
        match self {
            Self::Add => "plus",
            Self::Sub => "minus",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Op {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "+" | "plus" => Ok(Self::Add),
            "-" | "minus" => Ok(Self::Sub),
            other => Err(DatasetError::UnsupportedOp(other.to_string())),
        }
    }
}

/// A single generated question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Identifier, `q_0001` onwards
    pub question_id: String,
    /// Digit form, e.g. `12 + 7`
    pub question_digits: String,
    /// Spelled form, e.g. `twelve plus seven`
    pub question_words: String,
    /// Ground-truth answer
    pub correct_answer: i64,
    /// Operator
    pub op: Op,
    /// Left operand
    pub a: i64,
    /// Right operand
    pub b: i64,
    /// Generation seed
    pub seed: u64,
    /// Generation timestamp (RFC 3339)
    pub created_at: String,
}

/// Parameters for [`generate_questions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Number of questions
    pub n: usize,
    /// Inclusive lower operand bound
    pub min: i64,
    /// Inclusive upper operand bound
    pub max: i64,
    /// Operators to choose from uniformly
    pub ops: Vec<Op>,
    /// RNG seed
    pub seed: u64,
}

impl Default for DatasetSpec {
    fn default() -> Self {
        Self {
            n: 100,
            min: 0,
            max: 99,
            ops: vec![Op::Add, Op::Sub],
            seed: 1234,
        }
    }
}

const UNITS: [&str; 20] = [
    "zero",
    "one",
    "two",
    "three",
    "four",
    "five",
    "six",
    "seven",
    "eight",
    "nine",
    "ten",
    "eleven",
    "twelve",
    "thirteen",
    "fourteen",
    "fifteen",
    "sixteen",
    "seventeen",
    "eighteen",
    "nineteen",
];

const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];

/// Spell out an integer in English words.
///
/// Covers `-999..=999`; larger magnitudes fall back to digits.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn int_to_words(n: i64) -> String {
    if n < 0 {
        return format!("minus {}", int_to_words(n.saturating_neg()));
    }
    match n {
        0..=19 => UNITS[n as usize].to_string(),
        20..=99 => {
            let (tens, rem) = (n / 10, n % 10);
            if rem == 0 {
                TENS[tens as usize].to_string()
            } else {
                format!("{}-{}", TENS[tens as usize], UNITS[rem as usize])
            }
        }
        100..=999 => {
            let (hundreds, rem) = (n / 100, n % 100);
            if rem == 0 {
                format!("{} hundred", UNITS[hundreds as usize])
            } else {
                format!("{} hundred {}", UNITS[hundreds as usize], int_to_words(rem))
            }
        }
        _ => n.to_string(),
    }
}

/// Generate a seeded question set
///
/// # Errors
///
/// Returns an error if `n` is zero, `ops` is empty, `min > max`, or an op
/// can overflow on operands from the range.
pub fn generate_questions(spec: &DatasetSpec) -> Result<Vec<Question>, DatasetError> {
    if spec.n == 0 {
        return Err(DatasetError::EmptyDataset);
    }
    if spec.ops.is_empty() {
        return Err(DatasetError::NoOps);
    }
    if spec.min > spec.max {
        return Err(DatasetError::InvalidRange {
            min: spec.min,
            max: spec.max,
        });
    }
    if let Some(&op) = spec.ops.iter().find(|op| !op.fits_range(spec.min, spec.max)) {
        return Err(DatasetError::Overflow {
            op,
            min: spec.min,
            max: spec.max,
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(spec.seed);
    let created_at = Utc::now().to_rfc3339();

    (1..=spec.n)
        .map(|i| -> Result<Question, DatasetError> {
            let a = rng.gen_range(spec.min..=spec.max);
            let b = rng.gen_range(spec.min..=spec.max);
            let op = spec.ops[rng.gen_range(0..spec.ops.len())];
            let correct_answer = op.apply(a, b).ok_or(DatasetError::Overflow {
                op,
                min: spec.min,
                max: spec.max,
            })?;
            Ok(Question {
                question_id: format!("q_{i:04}"),
                question_digits: format!("{a} {op} {b}"),
                question_words: format!("{} {} {}", int_to_words(a), op.word(), int_to_words(b)),
                correct_answer,
                op,
                a,
                b,
                seed: spec.seed,
                created_at: created_at.clone(),
            })
        })
        .collect()
}

/// Write questions as CSV, creating parent directories
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn write_questions<P: AsRef<Path>>(path: P, questions: &[Question]) -> Result<(), DatasetError> {
    let path = path.as_ref();
    crate::records::ensure_parent_dir(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for question in questions {
        writer.serialize(question)?;
    }
    writer.flush()?;
    Ok(())
}

/// Load questions from CSV, in file order
///
/// # Errors
///
/// Returns an error if the file cannot be read or a row is malformed.
pub fn load_questions<P: AsRef<Path>>(path: P) -> Result<Vec<Question>, DatasetError> {
    let mut reader = csv::Reader::from_path(path)?;
    let questions = reader.deserialize().collect::<Result<Vec<Question>, _>>()?;
    Ok(questions)
}
