//! Stacked-bar outcome charts.
//!
//! Each bar splits one group of responses into robust-correct, misaligned
//! and incorrect shares, stacked bottom to top on a 0..1 axis. Charts are
//! written as SVG.

use crate::records::{ensure_parent_dir, read_csv, FirstLetterRecord, RecordError, SummaryRecord};
use crate::runner::CategoryTally;
use crate::scoring::Category;
use plotters::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while plotting
#[derive(Error, Debug)]
pub enum PlotError {
    #[error("Nothing to plot in {0}")]
    NoData(String),

    #[error("Drawing failed: {0}")]
    Drawing(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

const ROBUST_COLOR: RGBColor = RGBColor(0x2c, 0xa0, 0x2c);
const MISALIGNED_COLOR: RGBColor = RGBColor(0xff, 0x7f, 0x0e);
const INCORRECT_COLOR: RGBColor = RGBColor(0x7f, 0x7f, 0x7f);

/// Bar colour for a category
#[must_use]
pub const fn category_color(category: Category) -> RGBColor {
    match category {
        Category::RobustCorrect => ROBUST_COLOR,
        Category::Misaligned => MISALIGNED_COLOR,
        Category::Incorrect => INCORRECT_COLOR,
    }
}

/// Outcome shares of one bar
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeBreakdown {
    pub label: String,
    pub robust: f64,
    pub misaligned: f64,
    pub incorrect: f64,
}

impl OutcomeBreakdown {
    /// Shares from a summary row; `incorrect` is whatever is neither robust
    /// nor misaligned
    #[must_use]
    pub fn from_summary(summary: &SummaryRecord, label: String) -> Self {
        Self {
            label,
            robust: summary.robust_acc,
            misaligned: summary.misaligned_rate,
            incorrect: summary.incorrect_rate(),
        }
    }

    /// Shares from category counts
    #[must_use]
    pub fn from_tally(label: &str, tally: &CategoryTally) -> Self {
        Self {
            label: label.to_string(),
            robust: tally.fraction(Category::RobustCorrect),
            misaligned: tally.fraction(Category::Misaligned),
            incorrect: tally.fraction(Category::Incorrect),
        }
    }

    /// Share for one category
    #[must_use]
    pub const fn share(&self, category: Category) -> f64 {
        match category {
            Category::RobustCorrect => self.robust,
            Category::Misaligned => self.misaligned,
            Category::Incorrect => self.incorrect,
        }
    }

    /// Bottom and top of a category's segment in the stack
    fn segment(&self, category: Category) -> (f64, f64) {
        let bottom: f64 = Category::ALL
            .iter()
            .take_while(|c| **c != category)
            .map(|c| self.share(*c))
            .sum();
        (bottom, bottom + self.share(category))
    }
}

/// One bar per summary row, ordered by prompt variant.
///
/// The sort is stable, so rows of the same variant keep their model order.
/// Labels gain a model prefix when more than one model is present.
#[must_use]
pub fn summary_breakdowns(summary: &[SummaryRecord]) -> Vec<OutcomeBreakdown> {
    let models: BTreeSet<&str> = summary.iter().map(|s| s.model.as_str()).collect();
    let prefix_model = models.len() > 1;

    let mut rows: Vec<&SummaryRecord> = summary.iter().collect();
    rows.sort_by(|a, b| a.prompt_variant.cmp(&b.prompt_variant));
    rows.into_iter()
        .map(|s| {
            let label = if prefix_model {
                format!("{} {}", s.model, s.prompt_variant)
            } else {
                s.prompt_variant.clone()
            };
            OutcomeBreakdown::from_summary(s, label)
        })
        .collect()
}

/// One bar for a whole first-letter results table
#[must_use]
pub fn first_letter_breakdown(records: &[FirstLetterRecord]) -> OutcomeBreakdown {
    let tally = CategoryTally::from_categories(records.iter().map(|r| r.category));
    OutcomeBreakdown::from_tally("first-letter", &tally)
}

fn drawing<E: std::fmt::Display>(err: E) -> PlotError {
    PlotError::Drawing(err.to_string())
}

/// Render stacked bars to an SVG file
///
/// # Errors
///
/// Returns an error if `bars` is empty or the chart cannot be written.
#[allow(clippy::cast_possible_truncation)]
pub fn render_stacked_bars<P: AsRef<Path>>(
    path: P,
    title: &str,
    bars: &[OutcomeBreakdown],
) -> Result<(), PlotError> {
    let path = path.as_ref();
    if bars.is_empty() {
        return Err(PlotError::NoData(title.to_string()));
    }
    ensure_parent_dir(path)?;

    let n = bars.len() as u32;
    let width = 240 + 140 * n;
    let root = SVGBackend::new(path, (width, 480)).into_drawing_area();
    root.fill(&WHITE).map_err(drawing)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 22))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d((0u32..n).into_segmented(), 0f64..1f64)
        .map_err(drawing)?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(bars.len())
        .x_label_formatter(&|value| match value {
            SegmentValue::CenterOf(i) => bars
                .get(*i as usize)
                .map(|b| b.label.clone())
                .unwrap_or_default(),
            _ => String::new(),
        })
        .y_desc("Proportion")
        .draw()
        .map_err(drawing)?;

    for category in Category::ALL {
        let color = category_color(category);
        chart
            .draw_series(bars.iter().zip(0u32..).map(|(bar, i)| {
                let (bottom, top) = bar.segment(category);
                let mut rect = Rectangle::new(
                    [
                        (SegmentValue::Exact(i), bottom),
                        (SegmentValue::Exact(i + 1), top),
                    ],
                    color.filled(),
                );
                rect.set_margin(0, 0, 20, 20);
                rect
            }))
            .map_err(drawing)?
            .label(category.as_str())
            .legend(move |(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], color.filled()));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(drawing)?;

    root.present().map_err(drawing)?;
    tracing::info!(path = %path.display(), bars = bars.len(), "Wrote chart");
    Ok(())
}

/// Chart a summary table
///
/// # Errors
///
/// Returns an error if the table cannot be read, is empty, or the chart
/// cannot be written.
pub fn plot_summary<P: AsRef<Path>, Q: AsRef<Path>>(
    summary_csv: P,
    out: Q,
) -> Result<Vec<OutcomeBreakdown>, PlotError> {
    let summary_csv = summary_csv.as_ref();
    let summary: Vec<SummaryRecord> = read_csv(summary_csv)?;
    if summary.is_empty() {
        return Err(PlotError::NoData(summary_csv.display().to_string()));
    }
    let bars = summary_breakdowns(&summary);
    render_stacked_bars(out, "Outcomes by prompt variant", &bars)?;
    Ok(bars)
}

/// Chart a first-letter results table as a single bar
///
/// # Errors
///
/// Returns an error if the table cannot be read, is empty, or the chart
/// cannot be written.
pub fn plot_first_letter<P: AsRef<Path>, Q: AsRef<Path>>(
    results_csv: P,
    out: Q,
) -> Result<OutcomeBreakdown, PlotError> {
    let results_csv = results_csv.as_ref();
    let records: Vec<FirstLetterRecord> = read_csv(results_csv)?;
    if records.is_empty() {
        return Err(PlotError::NoData(results_csv.display().to_string()));
    }
    let bar = first_letter_breakdown(&records);
    render_stacked_bars(out, "First-letter outcomes", std::slice::from_ref(&bar))?;
    Ok(bar)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::records::write_csv;
    use tempfile::TempDir;

    fn summary(model: &str, variant: &str, naive: f64, robust: f64) -> SummaryRecord {
        SummaryRecord {
            model: model.to_string(),
            prompt_variant: variant.to_string(),
            n: 10,
            naive_acc: naive,
            robust_acc: robust,
            misaligned_rate: naive - robust,
            avg_latency_ms: 10.0,
        }
    }

    fn letter(idx: usize, category: Category) -> FirstLetterRecord {
        FirstLetterRecord {
            idx,
            word: "apple".to_string(),
            expected: "a".to_string(),
            raw_output: "a".to_string(),
            clean_output: "a".to_string(),
            is_single_lower_alpha: category == Category::RobustCorrect,
            correct_letter: category != Category::Incorrect,
            category,
        }
    }

    #[test]
    fn test_summary_breakdowns_sorted_by_variant() {
        let rows = vec![
            summary("phi3:mini", "shifted", 0.6, 0.4),
            summary("phi3:mini", "normal", 0.9, 0.8),
            summary("phi3:mini", "proxy", 0.8, 0.2),
        ];
        let bars = summary_breakdowns(&rows);
        let labels: Vec<&str> = bars.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["normal", "proxy", "shifted"]);
        assert_eq!(bars[1].robust, 0.2);
        assert!((bars[1].incorrect - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_summary_breakdowns_prefix_models() {
        let rows = vec![
            summary("phi3:mini", "proxy", 0.8, 0.2),
            summary("llama3", "normal", 0.9, 0.8),
        ];
        let labels: Vec<String> = summary_breakdowns(&rows)
            .into_iter()
            .map(|b| b.label)
            .collect();
        assert_eq!(labels, vec!["llama3 normal", "phi3:mini proxy"]);
    }

    #[test]
    fn test_segments_stack_in_order() {
        let bar = OutcomeBreakdown {
            label: "x".to_string(),
            robust: 0.5,
            misaligned: 0.3,
            incorrect: 0.2,
        };
        assert_eq!(bar.segment(Category::RobustCorrect), (0.0, 0.5));
        let (bottom, top) = bar.segment(Category::Misaligned);
        assert_eq!(bottom, 0.5);
        assert!((top - 0.8).abs() < 1e-9);
        let (bottom, top) = bar.segment(Category::Incorrect);
        assert!((bottom - 0.8).abs() < 1e-9);
        assert!((top - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bar_height_with_strict_only_passes() {
        // A quarter of rows parse as the answer without containing it ("-05")
        let mut s = summary("phi3:mini", "normal", 0.5, 0.5);
        s.misaligned_rate = 0.25;
        let bar = OutcomeBreakdown::from_summary(&s, "normal".to_string());
        assert!((bar.incorrect - 0.25).abs() < 1e-12);
        let (_, top) = bar.segment(Category::Incorrect);
        assert!((top - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_first_letter_breakdown() {
        let records = vec![
            letter(0, Category::RobustCorrect),
            letter(1, Category::Misaligned),
            letter(2, Category::Misaligned),
            letter(3, Category::Incorrect),
        ];
        let bar = first_letter_breakdown(&records);
        assert_eq!(bar.robust, 0.25);
        assert_eq!(bar.misaligned, 0.5);
        assert_eq!(bar.incorrect, 0.25);
    }

    #[test]
    fn test_plot_summary_writes_svg() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("summary.csv");
        write_csv(
            &csv_path,
            &[
                summary("phi3:mini", "normal", 0.9, 0.8),
                summary("phi3:mini", "proxy", 0.8, 0.2),
            ],
        )
        .unwrap();
        let out = dir.path().join("figures/summary.svg");

        let bars = plot_summary(&csv_path, &out).unwrap();
        assert_eq!(bars.len(), 2);

        let svg = std::fs::read_to_string(&out).unwrap().to_lowercase();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("#2ca02c"));
        assert!(svg.contains("#ff7f0e"));
        assert!(svg.contains("#7f7f7f"));
        assert!(svg.contains("proxy"));
    }

    #[test]
    fn test_plot_first_letter_writes_svg() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("results_firstletter.csv");
        write_csv(
            &csv_path,
            &[letter(0, Category::RobustCorrect), letter(1, Category::Incorrect)],
        )
        .unwrap();
        let out = dir.path().join("first_letter.svg");

        let bar = plot_first_letter(&csv_path, &out).unwrap();
        assert_eq!(bar.robust, 0.5);
        assert!(out.exists());
    }

    #[test]
    fn test_plot_empty_input() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            render_stacked_bars(dir.path().join("x.svg"), "empty", &[]),
            Err(PlotError::NoData(_))
        ));
    }
}
