//! One- and two-sample t-tests.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Alternative, TTestKind};
use crate::error::{CausalError, Result};
use crate::stats::descriptive::{group_values, mean, variance};
use crate::stats::inference::{t_p_value, t_quantile};

/// Result of a t-test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TTestResult {
    /// Test description, e.g. "Welch Two Sample t-test"
    pub method: String,
    /// Group labels `(x, y)` when the test was run by group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<(String, String)>,
    pub n_x: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_y: Option<usize>,
    pub mean_x: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_y: Option<f64>,
    /// `mean_x - mean_y` for two samples, `mean_x` for one sample
    pub estimate: f64,
    pub null_value: f64,
    pub std_error: f64,
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
    pub conf_level: f64,
    pub conf_low: f64,
    pub conf_high: f64,
    pub alternative: Alternative,
}

fn confidence_interval(
    estimate: f64,
    std_error: f64,
    df: f64,
    alternative: Alternative,
    conf_level: f64,
) -> (f64, f64) {
    match alternative {
        Alternative::TwoSided => {
            let q = t_quantile(1.0 - (1.0 - conf_level) / 2.0, df);
            (estimate - q * std_error, estimate + q * std_error)
        }
        Alternative::Less => (
            f64::NEG_INFINITY,
            estimate + t_quantile(conf_level, df) * std_error,
        ),
        Alternative::Greater => (
            estimate - t_quantile(conf_level, df) * std_error,
            f64::INFINITY,
        ),
    }
}

fn check_conf_level(conf_level: f64) -> Result<()> {
    if !(conf_level > 0.0 && conf_level < 1.0) {
        return Err(CausalError::InvalidConfig(format!(
            "confidence level must be in (0, 1), got {}",
            conf_level
        )));
    }
    Ok(())
}

fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

/// Two-sample t-test of `mean(x) - mean(y) == mu`.
///
/// Non-finite values are ignored.
pub fn t_test_two_sample(
    x: &[f64],
    y: &[f64],
    kind: TTestKind,
    alternative: Alternative,
    mu: f64,
    conf_level: f64,
) -> Result<TTestResult> {
    check_conf_level(conf_level)?;
    let x = finite(x);
    let y = finite(y);
    let (nx, ny) = (x.len(), y.len());
    if nx < 2 || ny < 2 {
        return Err(CausalError::InsufficientData(format!(
            "t-test needs at least 2 observations per group (got {} and {})",
            nx, ny
        )));
    }

    let (mx, my) = (mean(&x), mean(&y));
    let (vx, vy) = (variance(&x), variance(&y));
    let (nxf, nyf) = (nx as f64, ny as f64);

    let (std_error, df, method) = match kind {
        TTestKind::Welch => {
            let sx = vx / nxf;
            let sy = vy / nyf;
            let se = (sx + sy).sqrt();
            let df = (sx + sy).powi(2) / (sx.powi(2) / (nxf - 1.0) + sy.powi(2) / (nyf - 1.0));
            (se, df, "Welch Two Sample t-test")
        }
        TTestKind::Student => {
            let df = nxf + nyf - 2.0;
            let pooled = ((nxf - 1.0) * vx + (nyf - 1.0) * vy) / df;
            let se = (pooled * (1.0 / nxf + 1.0 / nyf)).sqrt();
            (se, df, "Two Sample t-test")
        }
    };

    if !(std_error > 10.0 * f64::EPSILON * mx.abs().max(my.abs())) {
        return Err(CausalError::InsufficientData(
            "data are essentially constant".to_string(),
        ));
    }

    let estimate = mx - my;
    let statistic = (estimate - mu) / std_error;
    let p_value = t_p_value(statistic, df, alternative);
    let (conf_low, conf_high) = confidence_interval(estimate, std_error, df, alternative, conf_level);

    debug!("{}: t = {:.4}, df = {:.2}, p = {:.4}", method, statistic, df, p_value);

    Ok(TTestResult {
        method: method.to_string(),
        levels: None,
        n_x: nx,
        n_y: Some(ny),
        mean_x: mx,
        mean_y: Some(my),
        estimate,
        null_value: mu,
        std_error,
        statistic,
        df,
        p_value,
        conf_level,
        conf_low,
        conf_high,
        alternative,
    })
}

/// One-sample t-test of `mean(x) == mu`.
pub fn t_test_one_sample(
    x: &[f64],
    mu: f64,
    alternative: Alternative,
    conf_level: f64,
) -> Result<TTestResult> {
    check_conf_level(conf_level)?;
    let x = finite(x);
    let n = x.len();
    if n < 2 {
        return Err(CausalError::InsufficientData(format!(
            "t-test needs at least 2 observations (got {})",
            n
        )));
    }

    let mx = mean(&x);
    let std_error = (variance(&x) / n as f64).sqrt();
    if !(std_error > 10.0 * f64::EPSILON * mx.abs()) {
        return Err(CausalError::InsufficientData(
            "data are essentially constant".to_string(),
        ));
    }

    let df = n as f64 - 1.0;
    let statistic = (mx - mu) / std_error;
    let (conf_low, conf_high) = confidence_interval(mx, std_error, df, alternative, conf_level);

    Ok(TTestResult {
        method: "One Sample t-test".to_string(),
        levels: None,
        n_x: n,
        n_y: None,
        mean_x: mx,
        mean_y: None,
        estimate: mx,
        null_value: mu,
        std_error,
        statistic,
        df,
        p_value: t_p_value(statistic, df, alternative),
        conf_level,
        conf_low,
        conf_high,
        alternative,
    })
}

/// Two-sample t-test of `outcome` between the two levels of `group`.
///
/// Levels are sorted; the first level is `x`, so the estimate is
/// `mean(first) - mean(second)`.
pub fn t_test_by_group(
    df: &DataFrame,
    outcome: &str,
    group: &str,
    kind: TTestKind,
    alternative: Alternative,
    conf_level: f64,
) -> Result<TTestResult> {
    let groups = group_values(df, outcome, group)?;
    if groups.len() != 2 {
        return Err(CausalError::InvalidConfig(format!(
            "grouping column '{}' must have exactly 2 levels, found {}",
            group,
            groups.len()
        )));
    }

    let (level_x, x) = &groups[0];
    let (level_y, y) = &groups[1];
    let mut result = t_test_two_sample(x, y, kind, alternative, 0.0, conf_level)?;
    result.levels = Some((level_x.clone(), level_y.clone()));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const X: [f64; 6] = [5.1, 4.9, 6.2, 5.8, 6.0, 5.5];
    const Y: [f64; 5] = [4.1, 4.5, 3.9, 5.0, 4.4];

    #[test]
    fn test_welch_two_sample() {
        let r = t_test_two_sample(&X, &Y, TTestKind::Welch, Alternative::TwoSided, 0.0, 0.95)
            .unwrap();
        let mx = X.iter().sum::<f64>() / 6.0;
        let my = Y.iter().sum::<f64>() / 5.0;
        assert!((r.estimate - (mx - my)).abs() < 1e-12);

        let sx = variance(&X) / 6.0;
        let sy = variance(&Y) / 5.0;
        assert!((r.std_error - (sx + sy).sqrt()).abs() < 1e-12);
        assert!(r.df > 5.0 && r.df <= 9.0 + 1e-9);
        assert!(r.p_value < 0.01);
        assert!(r.conf_low > 0.0 && r.conf_high > r.conf_low);
        assert_eq!(r.method, "Welch Two Sample t-test");
    }

    #[test]
    fn test_student_two_sample_df() {
        let r = t_test_two_sample(&X, &Y, TTestKind::Student, Alternative::TwoSided, 0.0, 0.95)
            .unwrap();
        assert_eq!(r.df, 9.0);
    }

    #[test]
    fn test_one_sided_intervals() {
        let less = t_test_two_sample(&X, &Y, TTestKind::Welch, Alternative::Less, 0.0, 0.95)
            .unwrap();
        assert!(less.conf_low.is_infinite());
        assert!(less.p_value > 0.99);

        let greater =
            t_test_two_sample(&X, &Y, TTestKind::Welch, Alternative::Greater, 0.0, 0.95).unwrap();
        assert!(greater.conf_high.is_infinite());
        assert!(greater.p_value < 0.005);
    }

    #[test]
    fn test_one_sample() {
        // t.test(c(1, 2, 3, 4, 5), mu = 2): t = 1.4142, df = 4
        let r = t_test_one_sample(&[1.0, 2.0, 3.0, 4.0, 5.0], 2.0, Alternative::TwoSided, 0.95)
            .unwrap();
        assert!((r.statistic - 2.0_f64.sqrt()).abs() < 1e-10);
        assert_eq!(r.df, 4.0);
        assert!((r.p_value - 0.2302).abs() < 1e-3);
    }

    #[test]
    fn test_constant_data_rejected() {
        let err = t_test_two_sample(
            &[1.0, 1.0, 1.0],
            &[1.0, 1.0],
            TTestKind::Welch,
            Alternative::TwoSided,
            0.0,
            0.95,
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_DATA");
    }

    #[test]
    fn test_too_few_observations() {
        assert!(
            t_test_two_sample(&[1.0], &Y, TTestKind::Welch, Alternative::TwoSided, 0.0, 0.95)
                .is_err()
        );
    }

    #[test]
    fn test_by_group_orders_levels() {
        let df = df!(
            "female" => &["yes", "no", "yes", "no", "yes", "no"],
            "wage" => &[9.0f64, 12.0, 10.0, 13.0, 8.5, 12.5]
        )
        .unwrap();
        let r = t_test_by_group(
            &df,
            "wage",
            "female",
            TTestKind::Welch,
            Alternative::TwoSided,
            0.95,
        )
        .unwrap();
        assert_eq!(r.levels, Some(("no".to_string(), "yes".to_string())));
        assert!(r.estimate > 0.0);
    }

    #[test]
    fn test_by_group_requires_two_levels() {
        let df = df!(
            "cntry" => &["DE", "FR", "PL"],
            "wage" => &[1.0f64, 2.0, 3.0]
        )
        .unwrap();
        let err = t_test_by_group(&df, "wage", "cntry", TTestKind::Welch, Alternative::TwoSided, 0.95)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }
}
