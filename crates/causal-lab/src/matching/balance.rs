//! Covariate balance before and after matching.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::Estimand;
use crate::error::{CausalError, Result};
use crate::matching::weights::MatchResult;
use crate::models::design::DesignMatrix;
use crate::models::formula::Formula;
use crate::stats::descriptive::{mean, variance, weighted_mean, weighted_variance};

/// Balance statistics of one variable in one sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceStats {
    pub mean_treated: f64,
    pub mean_control: f64,
    pub std_mean_diff: f64,
    /// Treated over control variance; not reported for binary variables
    pub var_ratio: Option<f64>,
    pub ecdf_mean: f64,
    pub ecdf_max: f64,
}

/// Percent balance improvement from the full to the matched sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Improvement {
    pub std_mean_diff: Option<f64>,
    pub var_ratio: Option<f64>,
    pub ecdf_mean: Option<f64>,
    pub ecdf_max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceRow {
    pub variable: String,
    pub binary: bool,
    pub all: BalanceStats,
    pub matched: BalanceStats,
    pub improvement: Improvement,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GroupCount {
    pub treated: f64,
    pub control: f64,
}

/// Sample sizes of a match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleSizes {
    pub all: GroupCount,
    pub matched: GroupCount,
    /// `(Σw)² / Σw²` over matched units
    pub effective: GroupCount,
    pub unmatched: GroupCount,
    pub discarded: GroupCount,
}

/// Balance table of a match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceTable {
    pub estimand: Estimand,
    pub rows: Vec<BalanceRow>,
    pub sample_sizes: SampleSizes,
}

impl BalanceTable {
    pub fn row(&self, variable: &str) -> Option<&BalanceRow> {
        self.rows.iter().find(|r| r.variable == variable)
    }

    /// Largest absolute standardized mean difference after matching.
    pub fn max_abs_smd(&self) -> f64 {
        self.rows
            .iter()
            .map(|r| r.matched.std_mean_diff.abs())
            .filter(|v| v.is_finite())
            .fold(0.0, f64::max)
    }
}

fn is_binary(values: &[f64]) -> bool {
    values.iter().all(|v| *v == 0.0 || *v == 1.0)
}

fn group_variance(values: &[f64], binary: bool) -> f64 {
    if binary {
        let p = mean(values);
        p * (1.0 - p)
    } else {
        variance(values)
    }
}

/// Mean and maximum distance between the weighted eCDFs of two samples.
pub fn ecdf_differences(x: &[f64], wx: &[f64], y: &[f64], wy: &[f64]) -> (f64, f64) {
    let mut points: Vec<f64> = x.iter().chain(y).copied().collect();
    points.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    points.dedup();
    if points.is_empty() {
        return (0.0, 0.0);
    }

    let sorted = |v: &[f64], w: &[f64]| {
        let mut pairs: Vec<(f64, f64)> = v.iter().copied().zip(w.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        let total: f64 = w.iter().sum();
        (pairs, total)
    };
    let (sx, tx) = sorted(x, wx);
    let (sy, ty) = sorted(y, wy);
    if tx <= 0.0 || ty <= 0.0 {
        return (f64::NAN, f64::NAN);
    }

    let (mut ix, mut iy) = (0, 0);
    let (mut cx, mut cy) = (0.0, 0.0);
    let mut sum = 0.0;
    let mut max: f64 = 0.0;
    for p in &points {
        while ix < sx.len() && sx[ix].0 <= *p {
            cx += sx[ix].1;
            ix += 1;
        }
        while iy < sy.len() && sy[iy].0 <= *p {
            cy += sy[iy].1;
            iy += 1;
        }
        let diff = (cx / tx - cy / ty).abs();
        sum += diff;
        max = max.max(diff);
    }
    (sum / points.len() as f64, max)
}

#[derive(Default)]
struct Sample {
    treated: Vec<f64>,
    control: Vec<f64>,
    w_treated: Vec<f64>,
    w_control: Vec<f64>,
}

fn split(values: &[f64], result: &MatchResult, weighted: bool) -> Sample {
    let mut sample = Sample::default();
    for (u, v) in values.iter().enumerate() {
        let w = if weighted { result.weights[u] } else { 1.0 };
        if w <= 0.0 {
            continue;
        }
        if result.treated[u] {
            sample.treated.push(*v);
            sample.w_treated.push(w);
        } else {
            sample.control.push(*v);
            sample.w_control.push(w);
        }
    }
    sample
}

fn stats(sample: &Sample, binary: bool, denom: f64) -> BalanceStats {
    let mean_treated = weighted_mean(&sample.treated, &sample.w_treated);
    let mean_control = weighted_mean(&sample.control, &sample.w_control);
    let diff = mean_treated - mean_control;
    let std_mean_diff = if denom > 0.0 {
        diff / denom
    } else if diff == 0.0 {
        0.0
    } else {
        f64::NAN
    };

    let var_ratio = if binary {
        None
    } else {
        let vt = weighted_variance(&sample.treated, &sample.w_treated);
        let vc = weighted_variance(&sample.control, &sample.w_control);
        Some(if vc > 0.0 { vt / vc } else { f64::NAN })
    };

    let (ecdf_mean, ecdf_max) = if binary {
        (diff.abs(), diff.abs())
    } else {
        ecdf_differences(
            &sample.treated,
            &sample.w_treated,
            &sample.control,
            &sample.w_control,
        )
    };

    BalanceStats {
        mean_treated,
        mean_control,
        std_mean_diff,
        var_ratio,
        ecdf_mean,
        ecdf_max,
    }
}

fn percent_improvement(before: f64, after: f64) -> Option<f64> {
    let (b, a) = (before.abs(), after.abs());
    if !(b > 0.0) || !a.is_finite() {
        return None;
    }
    Some(100.0 * (b - a) / b)
}

/// Balance of one variable measured on every unit.
pub fn balance_row(variable: &str, values: &[f64], result: &MatchResult) -> BalanceRow {
    let binary = is_binary(values);
    let all = split(values, result, false);

    let vt = group_variance(&all.treated, binary);
    let vc = group_variance(&all.control, binary);
    let denom = match result.estimand {
        Estimand::Att => vt.sqrt(),
        Estimand::Atc => vc.sqrt(),
        Estimand::Ate => ((vt + vc) / 2.0).sqrt(),
    };

    let before = stats(&all, binary, denom);
    let after = stats(&split(values, result, true), binary, denom);

    let improvement = Improvement {
        std_mean_diff: percent_improvement(before.std_mean_diff, after.std_mean_diff),
        var_ratio: match (before.var_ratio, after.var_ratio) {
            (Some(b), Some(a)) if b > 0.0 && a > 0.0 => percent_improvement(b.ln(), a.ln()),
            _ => None,
        },
        ecdf_mean: percent_improvement(before.ecdf_mean, after.ecdf_mean),
        ecdf_max: percent_improvement(before.ecdf_max, after.ecdf_max),
    };

    BalanceRow {
        variable: variable.to_string(),
        binary,
        all: before,
        matched: after,
        improvement,
    }
}

/// Sample sizes of a match.
pub fn sample_sizes(result: &MatchResult) -> SampleSizes {
    let mut sizes = SampleSizes {
        all: GroupCount { treated: 0.0, control: 0.0 },
        matched: GroupCount { treated: 0.0, control: 0.0 },
        effective: GroupCount { treated: 0.0, control: 0.0 },
        unmatched: GroupCount { treated: 0.0, control: 0.0 },
        discarded: GroupCount { treated: 0.0, control: 0.0 },
    };
    let mut sums = [(0.0, 0.0); 2];

    for u in 0..result.treated.len() {
        let t = result.treated[u];
        let w = result.weights[u];
        let bump = |count: &mut GroupCount| {
            if t {
                count.treated += 1.0;
            } else {
                count.control += 1.0;
            }
        };
        bump(&mut sizes.all);
        if result.discarded[u] {
            bump(&mut sizes.discarded);
        } else if w > 0.0 {
            bump(&mut sizes.matched);
            let slot = &mut sums[usize::from(t)];
            slot.0 += w;
            slot.1 += w * w;
        } else {
            bump(&mut sizes.unmatched);
        }
    }

    let effective = |(s, s2): (f64, f64)| if s2 > 0.0 { s * s / s2 } else { 0.0 };
    sizes.effective = GroupCount {
        treated: effective(sums[1]),
        control: effective(sums[0]),
    };
    sizes
}

/// Covariate columns for balance checks, keyed by column name.
///
/// Every term is expanded on its own without an intercept, so factor
/// covariates keep all of their levels.
fn covariate_columns(
    df: &DataFrame,
    covariates: &str,
    result: &MatchResult,
) -> Result<Vec<(String, Vec<f64>)>> {
    let formula = Formula::parse_rhs(covariates)?;
    let mut columns = Vec::new();

    for term in &formula.terms {
        let single = Formula::parse_rhs(&format!("{} - 1", term.label()))?;
        let design = DesignMatrix::build(df, &single, &[])?;
        let position: HashMap<usize, usize> = design
            .row_index
            .iter()
            .enumerate()
            .map(|(i, r)| (*r, i))
            .collect();

        for (j, name) in design.names.iter().enumerate() {
            let mut values = Vec::with_capacity(result.row_index.len());
            for row in &result.row_index {
                let Some(&i) = position.get(row) else {
                    return Err(CausalError::InvalidConfig(format!(
                        "covariate '{}' is missing for row {} used in matching",
                        term.label(),
                        row
                    )));
                };
                values.push(design.x[i * design.p + j]);
            }
            columns.push((name.clone(), values));
        }
    }
    Ok(columns)
}

/// Balance of the distance and every covariate before and after matching.
pub fn assess_balance(df: &DataFrame, result: &MatchResult, covariates: &str) -> Result<BalanceTable> {
    let mut rows = vec![balance_row("distance", &result.distance, result)];
    for (name, values) in covariate_columns(df, covariates, result)? {
        rows.push(balance_row(&name, &values, result));
    }

    let table = BalanceTable {
        estimand: result.estimand,
        rows,
        sample_sizes: sample_sizes(result),
    };
    debug!(
        "Balance: {} rows, max |SMD| after matching {:.3}",
        table.rows.len(),
        table.max_abs_smd()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistanceKind, MatchingMethod};

    fn result() -> MatchResult {
        MatchResult {
            method: MatchingMethod::Nearest,
            estimand: Estimand::Att,
            distance_kind: DistanceKind::Glm,
            treatment: "treat".to_string(),
            distance: vec![0.7, 0.6, 0.65, 0.2, 0.1, 0.3],
            treated: vec![true, true, false, false, false, false],
            weights: vec![1.0, 1.0, 1.0, 0.0, 0.0, 1.0],
            subclass: vec![Some(0), Some(1), Some(0), None, None, Some(1)],
            matched_pairs: vec![(0, 2), (1, 5)],
            discarded: vec![false, false, false, false, true, false],
            row_index: vec![0, 1, 2, 3, 4, 5],
            caliper: None,
            ratio: 1,
            replace: false,
        }
    }

    #[test]
    fn test_ecdf_differences() {
        let (mean_diff, max_diff) =
            ecdf_differences(&[1.0, 2.0], &[1.0, 1.0], &[3.0, 4.0], &[1.0, 1.0]);
        // points 1..4: |0.5-0|, |1-0|, |1-0.5|, |1-1|
        assert!((mean_diff - 0.5).abs() < 1e-12);
        assert!((max_diff - 1.0).abs() < 1e-12);

        let (m, x) = ecdf_differences(&[1.0, 2.0], &[1.0, 1.0], &[1.0, 2.0], &[1.0, 1.0]);
        assert_eq!((m, x), (0.0, 0.0));
    }

    #[test]
    fn test_matching_improves_distance_balance() {
        let r = result();
        let row = balance_row("distance", &r.distance, &r);
        assert!(!row.binary);
        assert!(row.all.std_mean_diff > row.matched.std_mean_diff);
        assert!(row.improvement.std_mean_diff.unwrap() > 0.0);
        assert!((row.matched.mean_control - 0.475).abs() < 1e-12);
    }

    #[test]
    fn test_binary_covariate() {
        let r = result();
        let female = [1.0, 0.0, 1.0, 1.0, 1.0, 0.0];
        let row = balance_row("female", &female, &r);
        assert!(row.binary);
        assert!(row.all.var_ratio.is_none());
        assert_eq!(row.matched.std_mean_diff, 0.0);
        assert_eq!(row.matched.ecdf_max, 0.0);
        // full sample: treated 0.5, control 0.75; ATT denominator sqrt(0.25)
        assert!((row.all.std_mean_diff + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_sample_sizes() {
        let sizes = sample_sizes(&result());
        assert_eq!(sizes.all, GroupCount { treated: 2.0, control: 4.0 });
        assert_eq!(sizes.matched, GroupCount { treated: 2.0, control: 2.0 });
        assert_eq!(sizes.discarded, GroupCount { treated: 0.0, control: 1.0 });
        assert_eq!(sizes.unmatched, GroupCount { treated: 0.0, control: 1.0 });
        assert!((sizes.effective.control - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_assess_balance_expands_factors() {
        let df = df!(
            "age" => &[30.0f64, 40.0, 31.0, 60.0, 20.0, 41.0],
            "cntry" => &["DE", "FR", "DE", "FR", "PL", "FR"]
        )
        .unwrap();
        let table = assess_balance(&df, &result(), "age + cntry").unwrap();
        let names: Vec<&str> = table.rows.iter().map(|r| r.variable.as_str()).collect();
        assert_eq!(names, vec!["distance", "age", "cntryDE", "cntryFR", "cntryPL"]);
        assert!(table.row("cntryDE").unwrap().binary);
    }
}
