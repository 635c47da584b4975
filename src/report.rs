//! Experiment report built from aggregated runs.
//!
//! For every (model, prompt variant) group the report carries pass rates
//! with bootstrap confidence intervals, and for every model it compares each
//! prompt variant's robust pass rate against the `normal` variant with a
//! two-proportion z-test.

use crate::aggregate::Aggregation;
use crate::config::PromptVariant;
use crate::metrics::{
    bonferroni_alpha, bootstrap_ci, compute_mean, flag_samples, two_proportion_z_test, PassCount,
    ProportionTest, StatConfig,
};
use crate::records::ensure_parent_dir;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::path::Path;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use thiserror::Error;

/// Errors that can occur while rendering or writing a report
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Unsupported report format: {0} (use .md or .json)")]
    UnsupportedFormat(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Output format, picked from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Markdown,
    Json,
}

impl ReportFormat {
    /// Format for `path`: `.json` or `.md`/`.markdown`
    ///
    /// # Errors
    ///
    /// Returns an error for any other extension.
    pub fn from_path(path: &Path) -> Result<Self, ReportError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(Self::Json),
            "md" | "markdown" => Ok(Self::Markdown),
            _ => Err(ReportError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Experiment report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// Report metadata
    pub metadata: ReportMetadata,
    /// Per-group statistics, in (model, variant) order
    pub groups: Vec<GroupReport>,
    /// Variant-vs-normal comparisons
    pub comparisons: Vec<VariantComparison>,
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Report title
    pub title: String,
    /// Report generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Crate version
    pub version: String,
    /// Run files the report was built from
    pub run_files: Vec<String>,
    /// Statistical configuration used
    pub stat_config: StatConfigSummary,
}

/// Statistical configuration summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatConfigSummary {
    /// Bootstrap resamples
    pub bootstrap_n: usize,
    /// Confidence level
    pub confidence: f64,
    /// Significance threshold before correction
    pub alpha: f64,
}

impl From<&StatConfig> for StatConfigSummary {
    fn from(config: &StatConfig) -> Self {
        Self {
            bootstrap_n: config.bootstrap_n,
            confidence: config.confidence,
            alpha: config.alpha,
        }
    }
}

/// Metric value with confidence interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricWithCI {
    /// Point estimate
    pub value: f64,
    /// Lower bound of CI
    pub ci_lower: f64,
    /// Upper bound of CI
    pub ci_upper: f64,
}

impl MetricWithCI {
    fn from_samples(samples: &[f64], config: &StatConfig) -> Self {
        let (ci_lower, ci_upper) = bootstrap_ci(samples, config);
        Self {
            value: compute_mean(samples),
            ci_lower,
            ci_upper,
        }
    }

    fn percent(&self) -> String {
        format!(
            "{:.1}% [{:.1}-{:.1}]",
            self.value * 100.0,
            self.ci_lower * 100.0,
            self.ci_upper * 100.0
        )
    }
}

/// Statistics of one (model, variant) group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupReport {
    pub model: String,
    pub prompt_variant: String,
    pub n: usize,
    pub naive_acc: MetricWithCI,
    pub robust_acc: MetricWithCI,
    pub misaligned_rate: f64,
    pub avg_latency_ms: f64,
}

/// Robust pass rate of one variant against the `normal` variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantComparison {
    pub model: String,
    pub baseline: String,
    pub variant: String,
    /// Bonferroni-corrected threshold used for `is_significant`
    pub alpha: f64,
    pub test: ProportionTest,
}

/// Report builder
pub struct ReportBuilder {
    title: String,
    stat_config: StatConfig,
}

impl ReportBuilder {
    /// Create a new report builder
    #[must_use]
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            stat_config: StatConfig::default(),
        }
    }

    /// Set statistical configuration
    #[must_use]
    pub const fn with_stat_config(mut self, config: StatConfig) -> Self {
        self.stat_config = config;
        self
    }

    /// Build the report for an aggregation pass
    #[must_use]
    pub fn build(&self, aggregation: &Aggregation) -> ExperimentReport {
        ExperimentReport {
            metadata: ReportMetadata {
                title: self.title.clone(),
                generated_at: Utc::now(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                run_files: aggregation
                    .files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
                stat_config: StatConfigSummary::from(&self.stat_config),
            },
            groups: self.build_groups(aggregation),
            comparisons: self.build_comparisons(aggregation),
        }
    }

    fn build_groups(&self, aggregation: &Aggregation) -> Vec<GroupReport> {
        aggregation
            .summary
            .iter()
            .filter_map(|summary| {
                let key = (summary.model.clone(), summary.prompt_variant.clone());
                let rows = aggregation.groups.get(&key)?;
                let naive = flag_samples(rows.iter().map(|r| r.naive_eval_pass));
                let robust = flag_samples(rows.iter().map(|r| r.robust_eval_pass));
                Some(GroupReport {
                    model: summary.model.clone(),
                    prompt_variant: summary.prompt_variant.clone(),
                    n: summary.n,
                    naive_acc: MetricWithCI::from_samples(&naive, &self.stat_config),
                    robust_acc: MetricWithCI::from_samples(&robust, &self.stat_config),
                    misaligned_rate: summary.misaligned_rate,
                    avg_latency_ms: summary.avg_latency_ms,
                })
            })
            .collect()
    }

    fn build_comparisons(&self, aggregation: &Aggregation) -> Vec<VariantComparison> {
        let baseline = PromptVariant::Normal.as_str();

        // model -> variant -> robust passes
        let mut by_model: BTreeMap<&str, BTreeMap<&str, PassCount>> = BTreeMap::new();
        for ((model, variant), rows) in &aggregation.groups {
            by_model.entry(model.as_str()).or_default().insert(
                variant.as_str(),
                PassCount::from_flags(rows.iter().map(|r| r.robust_eval_pass)),
            );
        }

        let mut comparisons = Vec::new();
        for (model, variants) in &by_model {
            let Some(&normal) = variants.get(baseline) else {
                tracing::debug!(model, "No normal variant, skipping comparisons");
                continue;
            };
            let alpha = bonferroni_alpha(self.stat_config.alpha, variants.len() - 1);
            for (variant, &count) in variants {
                if *variant == baseline {
                    continue;
                }
                if let Some(test) = two_proportion_z_test(count, normal, alpha) {
                    comparisons.push(VariantComparison {
                        model: (*model).to_string(),
                        baseline: baseline.to_string(),
                        variant: (*variant).to_string(),
                        alpha,
                        test,
                    });
                }
            }
        }
        comparisons
    }
}

/// Table row for markdown output
#[derive(Tabled)]
struct GroupTableRow {
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Variant")]
    variant: String,
    #[tabled(rename = "n")]
    n: usize,
    #[tabled(rename = "Naive acc")]
    naive: String,
    #[tabled(rename = "Robust acc")]
    robust: String,
    #[tabled(rename = "Misaligned")]
    misaligned: String,
    #[tabled(rename = "Latency")]
    latency: String,
}

#[derive(Tabled)]
struct ComparisonTableRow {
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Comparison")]
    comparison: String,
    #[tabled(rename = "Robust acc")]
    rates: String,
    #[tabled(rename = "z")]
    z: String,
    #[tabled(rename = "p-value")]
    p_value: String,
    #[tabled(rename = "Effect Size")]
    effect: String,
    #[tabled(rename = "Significant")]
    significant: String,
}

impl ExperimentReport {
    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        writeln!(output, "# {}", self.metadata.title).ok();
        writeln!(output).ok();
        writeln!(
            output,
            "**Generated:** {}",
            self.metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
        .ok();
        writeln!(output, "**Version:** {}", self.metadata.version).ok();
        writeln!(output, "**Run files:** {}", self.metadata.run_files.len()).ok();
        writeln!(output).ok();

        writeln!(output, "## Outcomes").ok();
        writeln!(output).ok();
        let rows: Vec<GroupTableRow> = self
            .groups
            .iter()
            .map(|g| GroupTableRow {
                model: g.model.clone(),
                variant: g.prompt_variant.clone(),
                n: g.n,
                naive: g.naive_acc.percent(),
                robust: g.robust_acc.percent(),
                misaligned: format!("{:.1}%", g.misaligned_rate * 100.0),
                latency: format!("{:.0}ms", g.avg_latency_ms),
            })
            .collect();
        writeln!(output, "{}", Table::new(rows).with(Style::markdown())).ok();
        writeln!(output).ok();

        if !self.comparisons.is_empty() {
            writeln!(output, "## Robust accuracy vs normal prompt").ok();
            writeln!(output).ok();
            let rows: Vec<ComparisonTableRow> = self
                .comparisons
                .iter()
                .map(|c| ComparisonTableRow {
                    model: c.model.clone(),
                    comparison: format!("{} vs {}", c.variant, c.baseline),
                    rates: format!(
                        "{:.1}% vs {:.1}%",
                        c.test.a.rate() * 100.0,
                        c.test.b.rate() * 100.0
                    ),
                    z: format!("{:.3}", c.test.z_statistic),
                    p_value: format!("{:.4}", c.test.p_value),
                    effect: format!(
                        "{} (h={:.2})",
                        c.test.effect_interpretation, c.test.cohens_h
                    ),
                    significant: if c.test.is_significant {
                        "Yes"
                    } else {
                        "No"
                    }
                    .to_string(),
                })
                .collect();
            writeln!(output, "{}", Table::new(rows).with(Style::markdown())).ok();
            writeln!(output).ok();
        }

        writeln!(output, "## Configuration").ok();
        writeln!(output).ok();
        writeln!(
            output,
            "- Bootstrap resamples: {}",
            self.metadata.stat_config.bootstrap_n
        )
        .ok();
        writeln!(
            output,
            "- Confidence level: {}%",
            self.metadata.stat_config.confidence * 100.0
        )
        .ok();
        writeln!(
            output,
            "- Significance threshold (α, before Bonferroni): {}",
            self.metadata.stat_config.alpha
        )
        .ok();

        output
    }

    /// Write the report in the format implied by the extension of `path`
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown extension or if the file cannot be
    /// written.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), ReportError> {
        let path = path.as_ref();
        let content = match ReportFormat::from_path(path)? {
            ReportFormat::Json => self.to_json()?,
            ReportFormat::Markdown => self.to_markdown(),
        };
        ensure_parent_dir(path)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
