//! Statistics over per-response pass flags.
//!
//! Pass flags are treated as 0/1 samples, so a pass rate is a sample mean:
//! - Bootstrap confidence intervals (seeded resampling)
//! - Two-proportion z-test between two prompt variants, with Cohen's h
//! - Bonferroni correction when one baseline is compared several times

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

/// Convert pass flags to 0/1 samples
#[must_use]
pub fn flag_samples<I: IntoIterator<Item = bool>>(flags: I) -> Vec<f64> {
    flags.into_iter().map(|f| if f { 1.0 } else { 0.0 }).collect()
}

/// Compute mean of samples, 0.0 when empty
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Statistical configuration for reports
#[derive(Debug, Clone)]
pub struct StatConfig {
    /// Number of bootstrap resamples
    pub bootstrap_n: usize,
    /// Confidence level (e.g., 0.95)
    pub confidence: f64,
    /// Significance threshold
    pub alpha: f64,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            bootstrap_n: 10_000,
            confidence: 0.95,
            alpha: 0.05,
            seed: 42,
        }
    }
}

/// Bootstrap confidence interval of the mean.
///
/// Percentile method over `config.bootstrap_n` resamples drawn with a
/// ChaCha8 generator seeded from `config.seed`, so the interval is
/// reproducible. Fewer than two samples collapse to the mean.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]
pub fn bootstrap_ci(samples: &[f64], config: &StatConfig) -> (f64, f64) {
    if samples.len() < 2 || config.bootstrap_n == 0 {
        let mean = compute_mean(samples);
        return (mean, mean);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut bootstrap_means: Vec<f64> = (0..config.bootstrap_n)
        .map(|_| {
            let resample_sum: f64 = (0..samples.len())
                .map(|_| samples[rng.next_u64() as usize % samples.len()])
                .sum();
            resample_sum / samples.len() as f64
        })
        .collect();

    bootstrap_means.sort_by(f64::total_cmp);

    let alpha = 1.0 - config.confidence;
    let last = bootstrap_means.len() - 1;
    let lower_idx = (config.bootstrap_n as f64 * (alpha / 2.0)).floor() as usize;
    let upper_idx = (config.bootstrap_n as f64 * (1.0 - alpha / 2.0)).ceil() as usize;

    (
        bootstrap_means[lower_idx.min(last)],
        bootstrap_means[upper_idx.min(last)],
    )
}

/// Passing responses out of a group's total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCount {
    pub passed: usize,
    pub total: usize,
}

impl PassCount {
    /// Count the `true` flags
    #[must_use]
    pub fn from_flags<I: IntoIterator<Item = bool>>(flags: I) -> Self {
        flags.into_iter().fold(
            Self {
                passed: 0,
                total: 0,
            },
            |acc, flag| Self {
                passed: acc.passed + usize::from(flag),
                total: acc.total + 1,
            },
        )
    }

    /// Pass rate, 0.0 for an empty group
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rate(self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}

/// Two-proportion z-test of pass rate `a` against pass rate `b`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProportionTest {
    pub a: PassCount,
    pub b: PassCount,
    /// `rate(a) - rate(b)`
    pub difference: f64,
    /// z-statistic under the pooled null
    pub z_statistic: f64,
    /// Two-sided p-value
    pub p_value: f64,
    /// `p_value < alpha`
    pub is_significant: bool,
    /// Cohen's h effect size
    pub cohens_h: f64,
    /// "negligible", "small", "medium" or "large"
    pub effect_interpretation: String,
}

/// Two-sided two-proportion z-test with a pooled standard error.
///
/// Groups where every response passed, or every response failed, are valid
/// input: 100% against 0% is the largest possible effect. When the pooled
/// rate is exactly 0 or 1 the two rates are equal and the result is
/// `z = 0, p = 1`. Returns `None` only when a group is empty.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::suboptimal_flops)]
pub fn two_proportion_z_test(a: PassCount, b: PassCount, alpha: f64) -> Option<ProportionTest> {
    if a.total == 0 || b.total == 0 {
        return None;
    }

    let (rate_a, rate_b) = (a.rate(), b.rate());
    let (n_a, n_b) = (a.total as f64, b.total as f64);
    let pooled = (a.passed + b.passed) as f64 / (n_a + n_b);
    let se = (pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b)).sqrt();

    let (z_statistic, p_value) = if se > 0.0 {
        let z = (rate_a - rate_b) / se;
        (z, erfc(z.abs() / std::f64::consts::SQRT_2))
    } else {
        (0.0, 1.0)
    };

    let cohens_h = 2.0 * rate_a.sqrt().asin() - 2.0 * rate_b.sqrt().asin();

    Some(ProportionTest {
        a,
        b,
        difference: rate_a - rate_b,
        z_statistic,
        p_value,
        is_significant: p_value < alpha,
        cohens_h,
        effect_interpretation: interpret_cohens_h(cohens_h).to_string(),
    })
}

/// Per-comparison threshold when one baseline is tested `comparisons` times
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bonferroni_alpha(alpha: f64, comparisons: usize) -> f64 {
    alpha / comparisons.max(1) as f64
}

// Cohen's conventional cutoffs for h
fn interpret_cohens_h(h: f64) -> &'static str {
    match h.abs() {
        x if x < 0.2 => "negligible",
        x if x < 0.5 => "small",
        x if x < 0.8 => "medium",
        _ => "large",
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp, clippy::cast_precision_loss, clippy::unwrap_used)]
mod tests {
    use super::*;

    // =========================================================================
    // Sample helpers
    // =========================================================================

    #[test]
    fn test_flag_samples() {
        assert_eq!(flag_samples([true, false, true]), vec![1.0, 0.0, 1.0]);
        assert!(flag_samples(Vec::new()).is_empty());
    }

    #[test]
    fn test_compute_mean_of_flags() {
        let samples = flag_samples([true, true, false, false, false]);
        assert!((compute_mean(&samples) - 0.4).abs() < f64::EPSILON);
        assert_eq!(compute_mean(&[]), 0.0);
    }

    // =========================================================================
    // Bootstrap tests
    // =========================================================================

    #[test]
    fn test_bootstrap_ci_reproducible() {
        let samples = flag_samples((0..100).map(|i| i % 3 != 0));
        let config = StatConfig::default();

        let first = bootstrap_ci(&samples, &config);
        let second = bootstrap_ci(&samples, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn test_bootstrap_ci_contains_pass_rate() {
        let samples = flag_samples((0..200).map(|i| i % 4 != 0));
        let config = StatConfig {
            bootstrap_n: 2_000,
            ..StatConfig::default()
        };

        let (lower, upper) = bootstrap_ci(&samples, &config);
        let mean = compute_mean(&samples);
        assert!(lower <= mean && mean <= upper);
        assert!(lower >= 0.0 && upper <= 1.0);
        assert!(upper - lower < 0.2);
    }

    #[test]
    fn test_bootstrap_ci_all_pass_is_degenerate() {
        let samples = flag_samples([true; 20]);
        let (lower, upper) = bootstrap_ci(&samples, &StatConfig::default());
        assert_eq!((lower, upper), (1.0, 1.0));
    }

    #[test]
    fn test_bootstrap_ci_single_sample() {
        let (lower, upper) = bootstrap_ci(&[0.0], &StatConfig::default());
        assert_eq!((lower, upper), (0.0, 0.0));
    }

    // =========================================================================
    // Significance tests
    // =========================================================================

    #[test]
    fn test_pass_count_from_flags() {
        let count = PassCount::from_flags([true, false, true, true]);
        assert_eq!(count, PassCount { passed: 3, total: 4 });
        assert!((count.rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(PassCount::from_flags([false; 0]).rate(), 0.0);
    }

    #[test]
    fn test_z_test_significant_drop() {
        let normal = PassCount::from_flags((0..100).map(|i| i % 10 != 0));
        let proxy = PassCount::from_flags((0..100).map(|i| i % 10 < 3));

        let result = two_proportion_z_test(proxy, normal, 0.05).unwrap();
        assert!(result.is_significant);
        assert!(result.z_statistic < 0.0);
        assert!((result.difference + 0.6).abs() < 1e-9);
        assert_eq!(result.effect_interpretation, "large");
    }

    #[test]
    fn test_z_test_identical_rates() {
        let count = PassCount::from_flags((0..50).map(|i| i % 2 == 0));
        let result = two_proportion_z_test(count, count, 0.05).unwrap();
        assert!(!result.is_significant);
        assert_eq!(result.z_statistic, 0.0);
        assert!((result.p_value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_z_test_all_pass_against_all_fail() {
        let all_pass = PassCount::from_flags([true; 50]);
        let all_fail = PassCount::from_flags([false; 50]);

        let result = two_proportion_z_test(all_fail, all_pass, 0.05).unwrap();
        // pooled rate 0.5, se = sqrt(0.25 * 0.04) = 0.1
        assert!((result.z_statistic + 10.0).abs() < 1e-9);
        assert!(result.p_value < 1e-6);
        assert!(result.is_significant);
        assert!((result.cohens_h + std::f64::consts::PI).abs() < 1e-9);
        assert_eq!(result.effect_interpretation, "large");
    }

    #[test]
    fn test_z_test_both_all_pass() {
        let all_pass = PassCount::from_flags([true; 10]);
        let result = two_proportion_z_test(all_pass, all_pass, 0.05).unwrap();
        assert_eq!(result.z_statistic, 0.0);
        assert_eq!(result.p_value, 1.0);
        assert!(!result.is_significant);
    }

    #[test]
    fn test_z_test_empty_group() {
        let one = PassCount::from_flags([true]);
        assert!(two_proportion_z_test(one, PassCount::from_flags([false; 0]), 0.05).is_none());
        // A single response per side is still testable
        assert!(two_proportion_z_test(one, PassCount::from_flags([false]), 0.05).is_some());
    }

    #[test]
    fn test_z_test_p_value_matches_normal_tail() {
        // 60/100 vs 50/100: pooled 0.55, se ~ 0.070356, z ~ 1.4213, p ~ 0.1552
        let a = PassCount { passed: 60, total: 100 };
        let b = PassCount { passed: 50, total: 100 };
        let result = two_proportion_z_test(a, b, 0.05).unwrap();
        assert!((result.z_statistic - 1.4213).abs() < 1e-3);
        assert!((result.p_value - 0.1552).abs() < 1e-3);
        assert!(!result.is_significant);
    }

    #[test]
    fn test_bonferroni_alpha() {
        assert!((bonferroni_alpha(0.05, 5) - 0.01).abs() < f64::EPSILON);
        assert!((bonferroni_alpha(0.05, 0) - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cohens_h_interpretation() {
        assert_eq!(interpret_cohens_h(0.1), "negligible");
        assert_eq!(interpret_cohens_h(0.3), "small");
        assert_eq!(interpret_cohens_h(0.6), "medium");
        assert_eq!(interpret_cohens_h(-0.9), "large");
    }

    #[test]
    fn test_stat_config_default() {
        let config = StatConfig::default();
        assert_eq!(config.bootstrap_n, 10_000);
        assert!((config.confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.seed, 42);
    }
}
