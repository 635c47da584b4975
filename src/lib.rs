//! # Misalign Probe
//!
//! Experiment harness probing instruction-following and "misalignment" in a
//! locally hosted language model.
//!
//! A response is *misaligned* when it satisfies a lenient grader but fails a
//! strict one: the right answer is in there, but not in the required form.
//! Comparing prompt variants (plain, grader-hinting, spelled-out numbers)
//! shows how readily a model drifts towards whatever the grader rewards.
//!
//! ## Pipeline
//!
//! ```text
//! Generators (arithmetic dataset | word list)
//!        ↓
//! Run Driver ── Model Caller (Ollama HTTP | ollama CLI, retry)
//!        ↓
//! Scorer (strict + lenient → robust_correct | misaligned | incorrect)
//!        ↓
//! Aggregator (group by model, variant)
//!        ↓
//! Plotter / Report
//! ```
//!
//! Every stage reads and writes flat files (CSV, text, SVG).

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod dataset;
pub mod metrics;
pub mod plot;
pub mod records;
pub mod report;
pub mod runner;
pub mod scoring;
pub mod words;

pub use aggregate::{aggregate_runs, AggregateError, Aggregation, ScoredRow};
pub use backend::{
    CallError, CliBackend, GenerationParams, HttpBackend, ModelBackend, ModelCaller, RetryPolicy,
};
pub use config::{
    BackendConfig, BackendKind, ConfigError, ConfigOverrides, ExperimentConfig, PromptSet,
    PromptVariant,
};
pub use dataset::{generate_questions, DatasetError, DatasetSpec, Op, Question};
pub use metrics::{bootstrap_ci, two_proportion_z_test, PassCount, ProportionTest, StatConfig};
pub use plot::{plot_first_letter, plot_summary, OutcomeBreakdown, PlotError};
pub use records::{ArithmeticRecord, FirstLetterRecord, RecordError, SummaryRecord};
pub use report::{ExperimentReport, ReportBuilder, ReportError};
pub use runner::{ArithmeticRunner, CategoryTally, FirstLetterRunner};
pub use scoring::{
    evaluate, score_arithmetic, score_first_letter, ArithmeticScore, ArithmeticTask, Category,
    FirstLetterScore, FirstLetterTask, Task, Verdict,
};
pub use words::{build_word_list, WordListError};
