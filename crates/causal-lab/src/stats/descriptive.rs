//! Descriptive statistics for numeric columns.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data::columns::{numeric_values, string_values};
use crate::error::{CausalError, Result};

/// Summary of a numeric column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub n: usize,
    pub missing: usize,
    pub mean: f64,
    pub sd: f64,
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

/// Mean and spread of an outcome within one group level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSummary {
    pub level: String,
    pub n: usize,
    pub mean: f64,
    pub sd: f64,
}

/// Arithmetic mean. `NaN` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance with `n - 1` denominator. Zero for fewer than two values.
pub fn variance(values: &[f64]) -> f64 {
    let n = values.len();
    if n <= 1 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n as f64 - 1.0)
}

/// Sample standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Moment skewness using the sample standard deviation.
pub fn skewness(values: &[f64]) -> f64 {
    let sd = std_dev(values);
    if sd == 0.0 || values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let n = values.len() as f64;
    values.iter().map(|v| ((v - m) / sd).powi(3)).sum::<f64>() / n
}

/// Weighted mean. `NaN` when the weights sum to zero.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return f64::NAN;
    }
    values.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total
}

/// Weighted variance with reliability-weight bias correction.
///
/// Equals the ordinary sample variance when every weight is 1.
pub fn weighted_variance(values: &[f64], weights: &[f64]) -> f64 {
    let sum_w: f64 = weights.iter().sum();
    let sum_w2: f64 = weights.iter().map(|w| w * w).sum();
    let denom = sum_w * sum_w - sum_w2;
    if sum_w <= 0.0 || denom <= 0.0 {
        return 0.0;
    }
    let m = weighted_mean(values, weights);
    let ss: f64 = values
        .iter()
        .zip(weights)
        .map(|(v, w)| w * (v - m).powi(2))
        .sum();
    sum_w * ss / denom
}

/// Quantile of sorted data using linear interpolation between order
/// statistics (R type 7).
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * q.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = h.ceil() as usize;
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

/// Median of unsorted data.
pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    quantile_sorted(&sorted, 0.5)
}

/// Summarize a column of optional values.
pub fn summarize(values: &[Option<f64>]) -> Summary {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    let mut sorted = present.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    Summary {
        n: present.len(),
        missing: values.len() - present.len(),
        mean: mean(&present),
        sd: std_dev(&present),
        min: sorted.first().copied().unwrap_or(f64::NAN),
        q1: quantile_sorted(&sorted, 0.25),
        median: quantile_sorted(&sorted, 0.5),
        q3: quantile_sorted(&sorted, 0.75),
        max: sorted.last().copied().unwrap_or(f64::NAN),
    }
}

/// Summarize a named column.
pub fn summarize_column(df: &DataFrame, name: &str) -> Result<Summary> {
    let values = numeric_values(df, name)?;
    if values.iter().all(|v| v.is_none()) {
        return Err(CausalError::NoValidValues(name.to_string()));
    }
    Ok(summarize(&values))
}

/// Outcome mean by group level, sorted by level.
///
/// Rows missing either the outcome or the group are skipped.
pub fn group_means(df: &DataFrame, outcome: &str, group: &str) -> Result<Vec<GroupSummary>> {
    let groups = group_values(df, outcome, group)?;
    Ok(groups
        .into_iter()
        .map(|(level, values)| GroupSummary {
            n: values.len(),
            mean: mean(&values),
            sd: std_dev(&values),
            level,
        })
        .collect())
}

/// Outcome values split by group level, ordered by level.
pub(crate) fn group_values(
    df: &DataFrame,
    outcome: &str,
    group: &str,
) -> Result<Vec<(String, Vec<f64>)>> {
    let y = numeric_values(df, outcome)?;
    let levels = crate::data::columns::distinct_levels(df, group)?;
    let labels = string_values(df, group)?;

    let mut by_level: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for (value, label) in y.iter().zip(labels.iter()) {
        if let (Some(value), Some(label)) = (value, label)
            && let Some(idx) = levels.iter().position(|l| l == label)
        {
            by_level.entry(idx).or_default().push(*value);
        }
    }

    Ok(by_level
        .into_iter()
        .map(|(idx, values)| (levels[idx].clone(), values))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_variance() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(mean(&values), 3.0);
        assert!((variance(&values) - 2.5).abs() < 1e-12);
        assert_eq!(variance(&[5.0]), 0.0);
        assert!(mean(&[]).is_nan());
    }

    #[test]
    fn test_skewness() {
        assert!(skewness(&[1.0, 2.0, 3.0, 4.0, 5.0]).abs() < 1e-12);
        assert!(skewness(&[1.0, 1.0, 1.0, 1.0, 10.0]) > 0.0);
        assert_eq!(skewness(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn test_weighted_moments_match_unweighted_for_unit_weights() {
        let values = [2.0, 4.0, 4.0, 5.0, 7.0];
        let ones = [1.0; 5];
        assert!((weighted_mean(&values, &ones) - mean(&values)).abs() < 1e-12);
        assert!((weighted_variance(&values, &ones) - variance(&values)).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_mean_with_zero_weights() {
        assert_eq!(weighted_mean(&[1.0, 100.0], &[1.0, 0.0]), 1.0);
        assert!(weighted_mean(&[1.0], &[0.0]).is_nan());
    }

    #[test]
    fn test_quantile_type7() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert!((quantile_sorted(&sorted, 0.25) - 1.75).abs() < 1e-12);
        assert!((quantile_sorted(&sorted, 0.5) - 2.5).abs() < 1e-12);
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
    }

    #[test]
    fn test_summarize_counts_missing() {
        let summary = summarize(&[Some(1.0), None, Some(3.0)]);
        assert_eq!(summary.n, 2);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 3.0);
        assert_eq!(summary.median, 2.0);
    }

    #[test]
    fn test_group_means_sorted_by_level() {
        let df = df!(
            "female" => &[1i64, 0, 1, 0, 1],
            "wage" => &[Some(10.0f64), Some(12.0), Some(11.0), None, Some(9.0)]
        )
        .unwrap();
        let groups = group_means(&df, "wage", "female").unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].level, "0");
        assert_eq!(groups[0].n, 1);
        assert_eq!(groups[1].level, "1");
        assert!((groups[1].mean - 10.0).abs() < 1e-12);
    }
}
